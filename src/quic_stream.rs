use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::future::BoxFuture;
use quinn::{RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Builds the frame a server sends when it can't reach the requested
/// destination.
pub type FailureFrame = fn(&str) -> std::io::Result<Bytes>;

enum RecvState {
    Ready(RecvStream),
    // The protocol response still has to be consumed before payload data.
    Handshake(BoxFuture<'static, std::io::Result<RecvStream>>),
    Failed,
}

/// A bidirectional QUIC stream carrying one proxied TCP connection.
///
/// Protocols that answer a connect request lazily hold the answer in the
/// write prefix; it goes out in front of the first payload write. Clients
/// that must read such an answer before payload data do it in a read
/// handshake that completes on the first read.
pub struct QuicStream {
    send_stream: SendStream,
    recv: RecvState,
    write_prefix: Option<Bytes>,
    failure_frame: Option<FailureFrame>,
}

impl QuicStream {
    pub fn from(send_stream: SendStream, recv_stream: RecvStream) -> Self {
        Self {
            send_stream,
            recv: RecvState::Ready(recv_stream),
            write_prefix: None,
            failure_frame: None,
        }
    }

    /// `prefix` is written before the first payload byte. If the stream is
    /// rejected first, `failure_frame` is written instead.
    pub fn with_response(
        send_stream: SendStream,
        recv_stream: RecvStream,
        prefix: Bytes,
        failure_frame: FailureFrame,
    ) -> Self {
        Self {
            send_stream,
            recv: RecvState::Ready(recv_stream),
            write_prefix: Some(prefix),
            failure_frame: Some(failure_frame),
        }
    }

    pub fn with_read_handshake(
        send_stream: SendStream,
        handshake: BoxFuture<'static, std::io::Result<RecvStream>>,
    ) -> Self {
        Self {
            send_stream,
            recv: RecvState::Handshake(handshake),
            write_prefix: None,
            failure_frame: None,
        }
    }

    /// Tells the peer the destination could not be reached and finishes the
    /// stream. Only protocols with a lazy response have a way to say so.
    pub async fn reject(mut self, message: &str) -> std::io::Result<()> {
        if self.write_prefix.take().is_some()
            && let Some(failure_frame) = self.failure_frame
        {
            self.send_stream
                .write_all(&failure_frame(message)?)
                .await
                .map_err(std::io::Error::from)?;
        }
        self.send_stream.shutdown().await
    }

    fn poll_write_prefix(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while let Some(prefix) = self.write_prefix.as_mut() {
            if prefix.is_empty() {
                self.write_prefix = None;
                break;
            }
            let written = ready!(Pin::new(&mut self.send_stream).poll_write(cx, prefix))?;
            let _ = prefix.split_to(written);
        }
        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for QuicStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicStream")
            .field("stream_id", &self.send_stream.id())
            .finish()
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.recv {
                RecvState::Ready(ref mut recv_stream) => {
                    return Pin::new(recv_stream).poll_read(cx, buf);
                }
                RecvState::Handshake(ref mut handshake) => {
                    match ready!(handshake.as_mut().poll(cx)) {
                        Ok(recv_stream) => this.recv = RecvState::Ready(recv_stream),
                        Err(e) => {
                            this.recv = RecvState::Failed;
                            return Poll::Ready(Err(e));
                        }
                    }
                }
                RecvState::Failed => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "stream handshake failed",
                    )));
                }
            }
        }
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_write_prefix(cx))?;
        Pin::new(&mut this.send_stream)
            .poll_write(cx, buf)
            .map_err(|err| err.into())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // quinn sends as soon as data is written, only a pending prefix needs pushing
        self.get_mut().poll_write_prefix(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_prefix(cx))?;
        Pin::new(&mut this.send_stream).poll_shutdown(cx)
    }
}
