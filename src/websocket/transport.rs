//! Transport Abstraction
//!
//! A transport is the duplex message channel a connection runs over.
//! The hub never sees sockets directly: it needs a way to read one message
//! and a way to write one message, each of which may fail.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use super::packet::{CloseCode, Packet};

/// Upper bound on closing handshakes when no write deadline is configured.
/// A peer that stopped reading must not pin a connection forever.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors raised by a transport. Each one ends exactly one connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Reading from the peer failed
    #[error("Transport read error: {0}")]
    Read(String),

    /// Writing to the peer failed
    #[error("Transport write error: {0}")]
    Write(String),

    /// The transport has already been closed
    #[error("Transport closed")]
    Closed,

    /// A configured read or write deadline elapsed
    #[error("Transport deadline exceeded")]
    Timeout,

    /// Inbound message exceeded the configured maximum size
    #[error("Message too large ({size} bytes, limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },
}

impl TransportError {
    /// Close code to report to the peer when this error ends the connection
    pub fn close_code(&self) -> CloseCode {
        match self {
            TransportError::MessageTooLarge { .. } => CloseCode::MESSAGE_TOO_BIG,
            _ => CloseCode::INTERNAL_ERROR,
        }
    }
}

/// A duplex message channel that can be split into independent halves
///
/// The read half is driven by the connection's read loop and the write half
/// by its write loop, so the two never contend for the same half.
pub trait Transport: Send + 'static {
    type Reader: MessageReader;
    type Writer: MessageWriter;

    /// Split into read and write halves
    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Read half of a [`Transport`]
#[async_trait]
pub trait MessageReader: Send + 'static {
    /// Wait for the next message from the peer
    async fn read_message(&mut self) -> Result<Packet, TransportError>;
}

/// Write half of a [`Transport`]
#[async_trait]
pub trait MessageWriter: Send + 'static {
    /// Write one message to the peer
    async fn write_message(&mut self, packet: Packet) -> Result<(), TransportError>;

    /// Shut the transport down
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Write half shared by both connection loops
///
/// Owns the writer behind an `Option` so that closing takes it out: the
/// transport is closed at most once no matter which loop gets there first.
/// Closing also flips a watch flag that wakes any loop waiting in
/// [`SharedWriter::closed`].
pub(crate) struct SharedWriter<W> {
    inner: Mutex<Option<W>>,
    closed: watch::Sender<bool>,
}

impl<W: MessageWriter> SharedWriter<W> {
    pub(crate) fn new(writer: W) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Some(writer)),
            closed,
        }
    }

    /// Write a packet, honouring an optional per-write deadline
    pub(crate) async fn write(
        &self,
        packet: Packet,
        deadline: Option<Duration>,
    ) -> Result<(), TransportError> {
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        let packet = packet.into_wire();

        match deadline {
            Some(limit) => tokio::time::timeout(limit, writer.write_message(packet))
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => writer.write_message(packet).await,
        }
    }

    /// Best-effort close-control frame
    ///
    /// Skipped when the other loop is mid-write; errors are ignored. Without
    /// a write deadline the frame gets [`CLOSE_TIMEOUT`].
    pub(crate) async fn send_close(&self, code: CloseCode, reason: &str, deadline: Option<Duration>) {
        let Ok(mut guard) = self.inner.try_lock() else {
            return;
        };
        let Some(writer) = guard.as_mut() else {
            return;
        };

        let limit = deadline.unwrap_or(CLOSE_TIMEOUT);
        let write = writer.write_message(Packet::close(code, reason));
        if tokio::time::timeout(limit, write).await.is_err() {
            tracing::trace!("Close frame not written before deadline");
        }
    }

    /// Close the transport. Returns `false` if it was already closed.
    ///
    /// A close that does not finish within [`CLOSE_TIMEOUT`] is abandoned
    /// and the writer dropped.
    pub(crate) async fn close(&self) -> bool {
        let taken = self.inner.lock().await.take();
        let Some(mut writer) = taken else {
            return false;
        };

        match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::trace!(error = %e, "Transport close reported an error"),
            Err(_) => tracing::trace!("Transport close timed out"),
        }
        drop(writer);
        self.closed.send_replace(true);
        true
    }

    /// Resolves once the transport has been closed
    pub(crate) async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                return;
            }
        }
    }
}
