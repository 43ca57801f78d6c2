//! Common types and helpers shared across config modules.

use serde::{Deserialize, Serialize};

/// A single value or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OneOrSome<T> {
    One(T),
    Some(Vec<T>),
}

impl<T> OneOrSome<T> {
    pub fn len(&self) -> usize {
        match self {
            OneOrSome::One(_) => 1,
            OneOrSome::Some(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrSome::One(item) => vec![item],
            OneOrSome::Some(v) => v,
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            OneOrSome::One(item) => std::slice::from_ref(item).iter(),
            OneOrSome::Some(v) => v.iter(),
        }
    }
}

/// An optional list that also accepts a single value.
#[derive(Default, Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NoneOrSome<T> {
    #[serde(skip_deserializing)]
    #[default]
    Unspecified,
    One(T),
    Some(Vec<T>),
}

impl<T> NoneOrSome<T> {
    pub fn is_unspecified(&self) -> bool {
        matches!(self, NoneOrSome::Unspecified)
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            NoneOrSome::Unspecified => vec![],
            NoneOrSome::One(item) => vec![item],
            NoneOrSome::Some(v) => v,
        }
    }
}

pub fn default_true() -> bool {
    true
}

pub fn is_false(b: &bool) -> bool {
    !*b
}

pub fn default_auth_timeout_secs() -> u64 {
    3
}

pub fn default_heartbeat_secs() -> u64 {
    10
}

pub fn default_udp_timeout_secs() -> u64 {
    300
}

pub fn default_masquerade_status() -> u16 {
    404
}
