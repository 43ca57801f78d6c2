//! UDP relay sessions multiplexed over one QUIC connection.
//!
//! Both protocols carry UDP as numbered sessions of numbered packets, each
//! packet optionally split into fragments. The pieces here are shared: the
//! per-session defragger, the session table that routes inbound packets, the
//! datagram sender that fragments when the path can't carry a packet whole,
//! and the `UdpSession` handed to handlers and client callers.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::address::NetLocation;
use crate::util::connection_error;

/// Inbound packets buffered per session before new ones are dropped.
pub const SESSION_CHANNEL_CAPACITY: usize = 64;

/// How long a datagram size learned from a too-large error is trusted.
pub const LEARNED_LIMIT_TTL: Duration = Duration::from_secs(5);

/// Unknown sessions with fragments waiting for the rest of their packet.
pub const MAX_PENDING_SESSIONS: usize = 256;

pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// One UDP packet or fragment of one, in protocol-neutral form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMessage {
    pub session_id: u32,
    pub packet_id: u16,
    pub fragment_id: u8,
    pub fragment_total: u8,
    pub destination: Option<NetLocation>,
    pub data: Bytes,
}

impl UdpMessage {
    pub fn new(session_id: u32, packet_id: u16, destination: NetLocation, data: Bytes) -> Self {
        Self {
            session_id,
            packet_id,
            fragment_id: 0,
            fragment_total: 1,
            destination: Some(destination),
            data,
        }
    }
}

/// Wire form of a `UdpMessage` carried in a single QUIC datagram.
pub trait PacketCodec: Send + Sync + 'static {
    fn encode(&self, message: &UdpMessage, buf: &mut BytesMut) -> std::io::Result<()>;

    /// Framing bytes added in front of the payload.
    fn header_len(&self, destination: Option<&NetLocation>) -> usize;

    /// Whether fragments after the first carry the destination again.
    fn repeats_destination(&self) -> bool;
}

/// Splits `message` into fragments whose encoded size fits `max_size`.
pub fn fragment_message<C: PacketCodec + ?Sized>(
    message: UdpMessage,
    max_size: usize,
    codec: &C,
) -> std::io::Result<Vec<UdpMessage>> {
    let first_header = codec.header_len(message.destination.as_ref());
    let rest_header = if codec.repeats_destination() {
        first_header
    } else {
        codec.header_len(None)
    };
    if max_size <= first_header || max_size <= rest_header {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("datagram limit {max_size} leaves no room for payload"),
        ));
    }

    let first_capacity = max_size - first_header;
    let rest_capacity = max_size - rest_header;
    let len = message.data.len();
    let count = if len <= first_capacity {
        1
    } else {
        1 + (len - first_capacity).div_ceil(rest_capacity)
    };
    if count > MAX_FRAGMENTS {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("packet of {len} bytes needs {count} fragments"),
        ));
    }
    if count == 1 {
        return Ok(vec![message]);
    }

    let mut data = message.data;
    let mut fragments = Vec::with_capacity(count);
    for fragment_id in 0..count {
        let capacity = if fragment_id == 0 {
            first_capacity
        } else {
            rest_capacity
        };
        let chunk = data.split_to(capacity.min(data.len()));
        let destination = if fragment_id == 0 || codec.repeats_destination() {
            message.destination.clone()
        } else {
            None
        };
        fragments.push(UdpMessage {
            session_id: message.session_id,
            packet_id: message.packet_id,
            fragment_id: fragment_id as u8,
            fragment_total: count as u8,
            destination,
            data: chunk,
        });
    }
    Ok(fragments)
}

/// Reassembles the fragments of one packet at a time. A fragment of a
/// different packet discards whatever was buffered.
#[derive(Debug, Default)]
pub struct Defragger {
    packet_id: u16,
    fragments: Vec<Option<UdpMessage>>,
    received: usize,
}

impl Defragger {
    pub fn feed(&mut self, message: UdpMessage) -> Option<UdpMessage> {
        if message.fragment_total <= 1 {
            return Some(message);
        }
        let total = message.fragment_total as usize;
        let index = message.fragment_id as usize;
        if index >= total {
            return None;
        }

        if message.packet_id != self.packet_id || self.fragments.len() != total {
            self.packet_id = message.packet_id;
            self.fragments.clear();
            self.fragments.resize(total, None);
            self.received = 0;
        }
        if self.fragments[index].is_some() {
            return None;
        }
        self.fragments[index] = Some(message);
        self.received += 1;
        if self.received < total {
            return None;
        }

        let fragments: Vec<UdpMessage> = self.fragments.drain(..).flatten().collect();
        self.received = 0;

        let size = fragments.iter().map(|f| f.data.len()).sum();
        let mut data = BytesMut::with_capacity(size);
        let mut destination = None;
        for fragment in fragments.iter() {
            data.extend_from_slice(&fragment.data);
            if destination.is_none() {
                destination = fragment.destination.clone();
            }
        }
        let first = &fragments[0];
        Some(UdpMessage {
            session_id: first.session_id,
            packet_id: first.packet_id,
            fragment_id: 0,
            fragment_total: 1,
            destination,
            data: data.freeze(),
        })
    }
}

/// Where a session's outbound packets go: datagrams, streams, and whatever
/// the protocol does when a session ends.
#[async_trait]
pub trait PacketOutbound: Send + Sync + Debug {
    async fn send_message(&self, message: UdpMessage) -> std::io::Result<()>;

    /// Tells the peer a locally closed session is gone.
    async fn dissociate(&self, _session_id: u32) -> std::io::Result<()> {
        Ok(())
    }
}

/// Sends `UdpMessage`s as QUIC datagrams, fragmenting once the path has
/// shown it can't carry a packet whole.
pub struct DatagramChannel<C> {
    connection: quinn::Connection,
    codec: C,
    max_packet_size: Option<usize>,
    learned_limit: Mutex<Option<(usize, Instant)>>,
}

impl<C: PacketCodec> DatagramChannel<C> {
    pub fn new(connection: quinn::Connection, codec: C, max_packet_size: Option<usize>) -> Self {
        Self {
            connection,
            codec,
            max_packet_size,
            learned_limit: Mutex::new(None),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    fn limit(&self) -> Option<usize> {
        let learned = {
            let mut learned_limit = self.learned_limit.lock();
            match *learned_limit {
                Some((size, learned_at)) if learned_at.elapsed() < LEARNED_LIMIT_TTL => Some(size),
                Some(_) => {
                    *learned_limit = None;
                    None
                }
                None => None,
            }
        };
        match (learned, self.max_packet_size) {
            (Some(learned), Some(configured)) => Some(learned.min(configured)),
            (learned, configured) => learned.or(configured),
        }
    }

    fn learn_limit(&self) -> std::io::Result<usize> {
        let size = self.connection.max_datagram_size().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "peer does not accept datagrams",
            )
        })?;
        debug!("learned datagram limit of {size} bytes");
        *self.learned_limit.lock() = Some((size, Instant::now()));
        Ok(size)
    }

    fn encode(&self, message: &UdpMessage) -> std::io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(
            self.codec.header_len(message.destination.as_ref()) + message.data.len(),
        );
        self.codec.encode(message, &mut buf)?;
        Ok(buf.freeze())
    }

    pub fn send(&self, message: UdpMessage) -> std::io::Result<()> {
        let encoded_len = self.codec.header_len(message.destination.as_ref()) + message.data.len();
        let limit = match self.limit() {
            Some(limit) if encoded_len > limit => limit,
            _ => match self.connection.send_datagram(self.encode(&message)?) {
                Ok(()) => return Ok(()),
                Err(quinn::SendDatagramError::TooLarge) => self.learn_limit()?,
                Err(e) => return Err(datagram_error(e)),
            },
        };

        for fragment in fragment_message(message, limit, &self.codec)? {
            self.connection
                .send_datagram(self.encode(&fragment)?)
                .map_err(datagram_error)?;
        }
        Ok(())
    }
}

impl<C> Debug for DatagramChannel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramChannel")
            .field("remote", &self.connection.remote_address())
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

fn datagram_error(error: quinn::SendDatagramError) -> std::io::Error {
    match error {
        quinn::SendDatagramError::ConnectionLost(e) => connection_error(e),
        quinn::SendDatagramError::TooLarge => {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "datagram too large")
        }
        e => std::io::Error::new(std::io::ErrorKind::Unsupported, e),
    }
}

#[derive(Debug)]
struct SessionEntry {
    sender: mpsc::Sender<(Bytes, NetLocation)>,
    defragger: Mutex<Defragger>,
    cancel: CancellationToken,
    // Milliseconds since the table was created.
    last_activity: AtomicU64,
}

/// What happened to an inbound message.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    Buffered,
    Dropped,
    Unknown(UdpMessage),
}

/// Live sessions of one connection keyed by session ID.
#[derive(Debug)]
pub struct SessionTable {
    sessions: DashMap<u32, Arc<SessionEntry>>,
    // Partial packets of sessions that don't exist yet.
    pending: DashMap<u32, Defragger>,
    // Serializes session creation so one ID never gets two sessions.
    create_lock: Mutex<()>,
    next_id: AtomicU32,
    max_id: u32,
    epoch: Instant,
}

impl SessionTable {
    pub fn new(max_id: u32) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            pending: DashMap::new(),
            create_lock: Mutex::new(()),
            next_id: AtomicU32::new(0),
            max_id,
            epoch: Instant::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, session_id: u32) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Next ID in increasing order, wrapping at the protocol maximum and
    /// skipping IDs still in use.
    pub fn allocate_id(&self) -> std::io::Result<u32> {
        for _ in 0..=self.max_id as u64 {
            let id = self
                .next_id
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
                    Some(if id >= self.max_id { 0 } else { id + 1 })
                })
                .unwrap_or_default();
            if !self.sessions.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "all session ids are in use",
        ))
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Creates a session with `session_id`, replacing any previous one.
    pub fn register(
        self: &Arc<Self>,
        session_id: u32,
        outbound: Arc<dyn PacketOutbound>,
    ) -> UdpSession {
        self.register_with(session_id, outbound, Defragger::default())
    }

    fn register_with(
        self: &Arc<Self>,
        session_id: u32,
        outbound: Arc<dyn PacketOutbound>,
        defragger: Defragger,
    ) -> UdpSession {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let entry = Arc::new(SessionEntry {
            sender,
            defragger: Mutex::new(defragger),
            cancel: CancellationToken::new(),
            last_activity: AtomicU64::new(self.now_millis()),
        });
        if let Some(previous) = self.sessions.insert(session_id, entry.clone()) {
            previous.cancel.cancel();
        }
        UdpSession {
            session_id,
            receiver: tokio::sync::Mutex::new(receiver),
            outbound,
            table: self.clone(),
            entry,
            next_packet_id: AtomicU16::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Routes an inbound message to its session.
    pub fn dispatch(&self, message: UdpMessage) -> Dispatch {
        let entry = match self.sessions.get(&message.session_id) {
            Some(entry) => entry.value().clone(),
            None => return Dispatch::Unknown(message),
        };
        entry.last_activity.store(self.now_millis(), Ordering::Relaxed);

        let Some(message) = entry.defragger.lock().feed(message) else {
            return Dispatch::Buffered;
        };
        let Some(destination) = message.destination else {
            debug!("dropping packet {} without an address", message.packet_id);
            return Dispatch::Dropped;
        };
        match entry.sender.try_send((message.data, destination)) {
            Ok(()) => Dispatch::Delivered,
            Err(_) => {
                debug!("session {} is full, dropping packet", message.session_id);
                Dispatch::Dropped
            }
        }
    }

    /// Routes a message from the peer. A session the table doesn't know is
    /// created once its first whole packet is reassembled, and is returned
    /// with that packet's destination.
    pub fn dispatch_or_register<F>(
        self: &Arc<Self>,
        message: UdpMessage,
        outbound: F,
    ) -> Option<(UdpSession, NetLocation)>
    where
        F: FnOnce() -> Arc<dyn PacketOutbound>,
    {
        let Dispatch::Unknown(message) = self.dispatch(message) else {
            return None;
        };
        let _guard = self.create_lock.lock();
        let Dispatch::Unknown(message) = self.dispatch(message) else {
            return None;
        };
        let session_id = message.session_id;

        let complete = if message.fragment_total <= 1 {
            message
        } else {
            if self.pending.len() >= MAX_PENDING_SESSIONS && !self.pending.contains_key(&session_id)
            {
                debug!("too many partial udp sessions, discarding them");
                self.pending.clear();
            }
            let fed = self.pending.entry(session_id).or_default().feed(message);
            fed?
        };
        let Some(destination) = complete.destination.clone() else {
            debug!("dropping packet {} without an address", complete.packet_id);
            return None;
        };

        // Fragments of a later packet may already be waiting.
        let defragger = self
            .pending
            .remove(&session_id)
            .map(|(_, defragger)| defragger)
            .unwrap_or_default();
        let session = self.register_with(session_id, outbound(), defragger);
        self.dispatch(complete);
        Some((session, destination))
    }

    /// Closes the session locally without telling the peer.
    pub fn remove(&self, session_id: u32) -> bool {
        match self.sessions.remove(&session_id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn remove_entry(&self, session_id: u32, entry: &Arc<SessionEntry>) {
        self.sessions
            .remove_if(&session_id, |_, current| Arc::ptr_eq(current, entry));
    }

    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.cancel.cancel();
        }
        self.sessions.clear();
        self.pending.clear();
    }

    /// Closes sessions with no traffic in either direction for `timeout`.
    pub fn expire_idle(&self, timeout: Duration) -> usize {
        let now = self.now_millis();
        let timeout = timeout.as_millis() as u64;
        let expired: Vec<u32> = self
            .sessions
            .iter()
            .filter(|entry| {
                now.saturating_sub(entry.last_activity.load(Ordering::Relaxed)) >= timeout
            })
            .map(|entry| *entry.key())
            .collect();
        for session_id in expired.iter() {
            debug!("session {session_id} idle, closing");
            self.remove(*session_id);
        }
        expired.len()
    }

    /// Runs `expire_idle` periodically until `cancel` fires.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, timeout: Duration, cancel: CancellationToken) {
        let table = Arc::downgrade(self);
        let period = (timeout / 4).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(table) = table.upgrade() else {
                    break;
                };
                table.expire_idle(timeout);
            }
        });
    }
}

/// A UDP association relayed through the tunnel.
///
/// Inbound packets arrive through the session table; outbound ones go
/// through the connection's `PacketOutbound`.
#[derive(Debug)]
pub struct UdpSession {
    session_id: u32,
    receiver: tokio::sync::Mutex<mpsc::Receiver<(Bytes, NetLocation)>>,
    outbound: Arc<dyn PacketOutbound>,
    table: Arc<SessionTable>,
    entry: Arc<SessionEntry>,
    next_packet_id: AtomicU16,
    closed: AtomicBool,
}

impl UdpSession {
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.entry.cancel.is_cancelled()
    }

    /// Waits for the next packet and the address it is for (server side) or
    /// came from (client side).
    pub async fn read_packet(&self) -> std::io::Result<(Bytes, NetLocation)> {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            biased;
            packet = receiver.recv() => packet.ok_or_else(session_closed),
            _ = self.entry.cancel.cancelled() => Err(session_closed()),
        }
    }

    pub async fn write_packet(&self, data: Bytes, destination: &NetLocation) -> std::io::Result<()> {
        if self.is_closed() {
            return Err(session_closed());
        }
        self.entry
            .last_activity
            .store(self.table.now_millis(), Ordering::Relaxed);
        let packet_id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        self.outbound
            .send_message(UdpMessage::new(
                self.session_id,
                packet_id,
                destination.clone(),
                data,
            ))
            .await
    }

    /// Closes the session and tells the peer. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.entry.cancel.cancel();
        self.table.remove_entry(self.session_id, &self.entry);
        if let Err(e) = self.outbound.dissociate(self.session_id).await {
            debug!("failed to dissociate session {}: {e}", self.session_id);
        }
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.entry.cancel.cancel();
        self.table.remove_entry(self.session_id, &self.entry);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("session {} dropped outside a runtime", self.session_id);
            return;
        };
        let outbound = self.outbound.clone();
        let session_id = self.session_id;
        handle.spawn(async move {
            if let Err(e) = outbound.dissociate(session_id).await {
                debug!("failed to dissociate session {session_id}: {e}");
            }
        });
    }
}

fn session_closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "udp session closed")
}
