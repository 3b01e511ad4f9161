//! In-Memory Transport
//!
//! A [`Transport`] backed by tokio channels. The hub side gets a
//! [`MemoryTransport`]; the test (or embedding application) drives the
//! other end through a [`MemoryPeer`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::packet::Packet;
use super::transport::{MessageReader, MessageWriter, Transport, TransportError};

/// Create a connected transport/peer pair.
///
/// `buffer` bounds each direction; a peer that stops calling
/// [`MemoryPeer::recv`] eventually blocks the writer, just like a stalled
/// network socket.
pub fn pair(buffer: usize) -> (MemoryTransport, MemoryPeer) {
    let buffer = buffer.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
    let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
    let closes = Arc::new(AtomicUsize::new(0));

    let transport = MemoryTransport {
        inbound: inbound_rx,
        outbound: outbound_tx,
        closes: Arc::clone(&closes),
    };
    let peer = MemoryPeer {
        inbound: inbound_tx,
        outbound: outbound_rx,
        closes,
    };

    (transport, peer)
}

/// Hub-side end of an in-memory connection
pub struct MemoryTransport {
    inbound: mpsc::Receiver<Result<Packet, TransportError>>,
    outbound: mpsc::Sender<Packet>,
    closes: Arc<AtomicUsize>,
}

impl Transport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn split(self) -> (MemoryReader, MemoryWriter) {
        (
            MemoryReader {
                inbound: self.inbound,
            },
            MemoryWriter {
                outbound: Some(self.outbound),
                closes: self.closes,
            },
        )
    }
}

pub struct MemoryReader {
    inbound: mpsc::Receiver<Result<Packet, TransportError>>,
}

#[async_trait]
impl MessageReader for MemoryReader {
    async fn read_message(&mut self) -> Result<Packet, TransportError> {
        match self.inbound.recv().await {
            Some(result) => result,
            None => Err(TransportError::Read("peer disconnected".to_string())),
        }
    }
}

pub struct MemoryWriter {
    outbound: Option<mpsc::Sender<Packet>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageWriter for MemoryWriter {
    async fn write_message(&mut self, packet: Packet) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::Closed)?;
        outbound
            .send(packet)
            .await
            .map_err(|_| TransportError::Write("peer disconnected".to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.outbound.take();
        Ok(())
    }
}

/// Remote end of an in-memory connection
pub struct MemoryPeer {
    inbound: mpsc::Sender<Result<Packet, TransportError>>,
    outbound: mpsc::Receiver<Packet>,
    closes: Arc<AtomicUsize>,
}

impl MemoryPeer {
    /// Deliver a message to the hub side
    pub async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        self.inbound
            .send(Ok(packet))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Make the hub side's next read fail with `error`
    pub async fn fail_read(&self, error: TransportError) -> Result<(), TransportError> {
        self.inbound
            .send(Err(error))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next message written by the hub side, `None` once the transport is
    /// closed and drained
    pub async fn recv(&mut self) -> Option<Packet> {
        self.outbound.recv().await
    }

    /// Stop accepting writes; later writes on the hub side fail
    pub fn stop_reading(&mut self) {
        self.outbound.close();
    }

    /// How many times the hub side closed the transport
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}
