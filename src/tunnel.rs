use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error};
use tokio_util::sync::CancellationToken;

use crate::address::NetLocation;
use crate::udp_session::{PacketOutbound, SessionTable, UdpMessage, UdpSession};
use crate::util::{connection_error, is_closed_error};

/// Error code sent when a connection is closed because of a local error.
pub const ERROR_CODE_PROTOCOL: u32 = 0x01;

/// State shared by every task working on one QUIC connection.
#[derive(Debug)]
pub struct Tunnel {
    protocol: &'static str,
    connection: quinn::Connection,
    sessions: Arc<SessionTable>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Tunnel {
    pub fn new(
        protocol: &'static str,
        connection: quinn::Connection,
        sessions: Arc<SessionTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            connection,
            sessions,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn connection(&self) -> &quinn::Connection {
        &self.connection
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.connection.close_reason().is_some()
    }

    /// Closes the connection and every session on it. Only the first call
    /// has any effect.
    pub fn close_with_error(&self, error: std::io::Error) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let remote = self.connection.remote_address();
        if is_closed_error(&error) {
            debug!("{} connection to {remote} closed: {error}", self.protocol);
        } else {
            error!("{} connection to {remote} failed: {error}", self.protocol);
        }
        self.cancel.cancel();
        self.sessions.close_all();
        let code = if is_closed_error(&error) {
            0u32
        } else {
            ERROR_CODE_PROTOCOL
        };
        self.connection.close(code.into(), error.to_string().as_bytes());
    }

    pub fn close(&self) {
        self.close_with_error(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "closed locally",
        ));
    }

    /// Runs `task` until the tunnel closes. A task error closes the tunnel.
    pub fn spawn<F>(self: &Arc<Self>, task: F)
    where
        F: Future<Output = std::io::Result<()>> + Send + 'static,
    {
        let tunnel = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tunnel.cancel.cancelled() => {}
                result = task => {
                    if let Err(e) = result {
                        tunnel.close_with_error(e);
                    }
                }
            }
        });
    }

    /// Routes a message from the peer, creating its session when the ID is
    /// new. Returns the new session and its first packet's destination.
    pub fn dispatch_or_create<F>(
        &self,
        message: UdpMessage,
        outbound: F,
    ) -> Option<(UdpSession, NetLocation)>
    where
        F: FnOnce() -> Arc<dyn PacketOutbound>,
    {
        if self.is_closed() {
            return None;
        }
        self.sessions.dispatch_or_register(message, outbound)
    }

    /// Closes the tunnel once the peer or the idle timer ends the connection.
    pub fn watch_connection(self: &Arc<Self>) {
        let tunnel = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tunnel.cancel.cancelled() => {}
                reason = tunnel.connection.closed() => {
                    tunnel.close_with_error(connection_error(reason));
                }
            }
        });
    }
}
