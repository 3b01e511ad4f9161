//! Connection Loops
//!
//! Each served connection runs two tasks:
//!
//! - the **read loop** pulls messages off the transport and submits them to
//!   the hub for broadcast;
//! - the **write loop** drains the connection's outbound queue onto the
//!   transport.
//!
//! The loops share the outbound queue and the transport's write half and
//! nothing else. Whichever loop finishes first closes the transport, which
//! wakes the other one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::hub::{ConnectionId, Hub};
use super::packet::{CloseCode, Packet};
use super::transport::{MessageReader, MessageWriter, SharedWriter, TransportError};

/// The hub's handle on a registered connection: its identity plus the
/// producer side of its outbound queue.
///
/// Not `Clone`: registering consumes the handle, and dropping it closes the
/// queue, so a connection removed from the hub can never be re-added.
/// Dropping it also releases the connection, which aborts a write stuck on
/// a peer that stopped reading.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Packet>,
    // Never sent on; only its drop is observed
    _release: watch::Sender<()>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh identity and an outbound queue of
    /// `buffer` packets, together with the consumer side of that queue.
    pub fn new(buffer: usize) -> (Self, OutboundQueue) {
        let (outbound, packets) = mpsc::channel(buffer.max(1));
        let (release, released) = watch::channel(());
        let handle = Self {
            id: Uuid::new_v4(),
            outbound,
            _release: release,
        };
        (handle, OutboundQueue { packets, released })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Non-blocking enqueue onto the outbound queue
    pub(crate) fn try_deliver(&self, packet: Packet) -> Result<(), TrySendError<Packet>> {
        self.outbound.try_send(packet)
    }
}

/// Consumer side of a connection's outbound queue
#[derive(Debug)]
pub struct OutboundQueue {
    packets: mpsc::Receiver<Packet>,
    released: watch::Receiver<()>,
}

impl OutboundQueue {
    /// Next queued packet, `None` once the handle is dropped and the queue
    /// is drained
    pub async fn recv(&mut self) -> Option<Packet> {
        self.packets.recv().await
    }

    /// Non-blocking variant of [`OutboundQueue::recv`]
    pub fn try_recv(&mut self) -> Result<Packet, TryRecvError> {
        self.packets.try_recv()
    }
}

/// How long a write may keep going once the hub has let go of its
/// connection
const RELEASE_GRACE: Duration = Duration::from_millis(250);

/// Resolves once the owning [`ConnectionHandle`] has been dropped
async fn released(signal: &mut watch::Receiver<()>) {
    while signal.changed().await.is_ok() {}
}

/// Resolves [`RELEASE_GRACE`] after the handle has been dropped
async fn release_deadline(signal: &mut watch::Receiver<()>) {
    released(signal).await;
    tokio::time::sleep(RELEASE_GRACE).await;
}

/// Per-connection limits, fixed when the connection starts
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ConnectionLimits {
    pub max_message_size: Option<usize>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// A running connection: its identity and its two loop tasks
#[derive(Debug)]
pub struct ServedConnection {
    id: ConnectionId,
    read: JoinHandle<()>,
    write: JoinHandle<()>,
}

impl ServedConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Wait for both loops to terminate
    pub async fn join(self) {
        if let Err(e) = self.read.await {
            tracing::warn!(connection_id = %self.id, error = %e, "Read loop panicked");
        }
        if let Err(e) = self.write.await {
            tracing::warn!(connection_id = %self.id, error = %e, "Write loop panicked");
        }
    }
}

/// Start both loops for a registered connection
pub(crate) fn spawn<R, W>(
    id: ConnectionId,
    hub: Hub,
    reader: R,
    writer: Arc<SharedWriter<W>>,
    outbound: OutboundQueue,
    limits: ConnectionLimits,
) -> ServedConnection
where
    R: MessageReader,
    W: MessageWriter,
{
    let read = tokio::spawn(read_loop(id, hub, reader, Arc::clone(&writer), limits));
    let write = tokio::spawn(write_loop(id, outbound, writer, limits));
    ServedConnection { id, read, write }
}

/// Why a read loop stopped
#[derive(Debug)]
enum ReadExit {
    /// Transport read failed, oversized message, or read deadline elapsed
    Failed(TransportError),
    /// Peer sent a close frame
    PeerClosed,
    /// Hub no longer accepts broadcasts
    HubClosed,
    /// Write side already closed the transport
    TransportClosed,
}

impl fmt::Display for ReadExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadExit::Failed(e) => write!(f, "{}", e),
            ReadExit::PeerClosed => f.write_str("peer closed"),
            ReadExit::HubClosed => f.write_str("hub closed"),
            ReadExit::TransportClosed => f.write_str("transport closed"),
        }
    }
}

async fn read_loop<R, W>(
    id: ConnectionId,
    hub: Hub,
    mut reader: R,
    writer: Arc<SharedWriter<W>>,
    limits: ConnectionLimits,
) where
    R: MessageReader,
    W: MessageWriter,
{
    // The read deadline is set once, not renewed per message
    let deadline = limits.read_timeout.map(|timeout| Instant::now() + timeout);

    let exit = read_messages(id, &hub, &mut reader, &writer, limits, deadline).await;

    match &exit {
        ReadExit::Failed(e) => {
            tracing::debug!(connection_id = %id, error = %e, "WebSocket read failed");
            writer.send_close(e.close_code(), "", limits.write_timeout).await;
        }
        ReadExit::PeerClosed => {
            writer.send_close(CloseCode::NORMAL, "", limits.write_timeout).await;
        }
        ReadExit::HubClosed => {
            writer
                .send_close(CloseCode::GOING_AWAY, "hub closed", limits.write_timeout)
                .await;
        }
        ReadExit::TransportClosed => {}
    }

    if hub.deregister(id).await.is_err() {
        tracing::trace!(connection_id = %id, "Hub already closed, skipping deregister");
    }
    writer.close().await;

    tracing::info!(connection_id = %id, reason = %exit, "WebSocket disconnected");
}

async fn read_messages<R, W>(
    id: ConnectionId,
    hub: &Hub,
    reader: &mut R,
    writer: &SharedWriter<W>,
    limits: ConnectionLimits,
    deadline: Option<Instant>,
) -> ReadExit
where
    R: MessageReader,
    W: MessageWriter,
{
    loop {
        let next = tokio::select! {
            result = read_before(reader, deadline) => result,
            _ = writer.closed() => return ReadExit::TransportClosed,
        };

        let packet = match next {
            Ok(packet) => packet,
            Err(e) => return ReadExit::Failed(e),
        };

        if let Some(limit) = limits.max_message_size {
            if packet.len() > limit {
                return ReadExit::Failed(TransportError::MessageTooLarge {
                    size: packet.len(),
                    limit,
                });
            }
        }

        let frame = packet.frame_type();
        if frame.is_data() {
            if hub.broadcast(packet).await.is_err() {
                return ReadExit::HubClosed;
            }
        } else if frame.is_terminal() {
            return ReadExit::PeerClosed;
        } else {
            tracing::trace!(connection_id = %id, frame = %frame, "Keepalive frame received");
        }
    }
}

async fn read_before<R: MessageReader>(
    reader: &mut R,
    deadline: Option<Instant>,
) -> Result<Packet, TransportError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, reader.read_message())
            .await
            .map_err(|_| TransportError::Timeout)?,
        None => reader.read_message().await,
    }
}

/// Why a write loop stopped
#[derive(Debug)]
enum WriteExit {
    /// Hub closed the outbound queue (eviction, deregistration, shutdown)
    QueueClosed,
    /// A close packet was written
    Finished,
    /// Transport write failed
    Failed(TransportError),
    /// Hub let go of the connection while a write was stuck
    Released,
    /// Read side already closed the transport
    TransportClosed,
}

async fn write_loop<W: MessageWriter>(
    id: ConnectionId,
    outbound: OutboundQueue,
    writer: Arc<SharedWriter<W>>,
    limits: ConnectionLimits,
) {
    let OutboundQueue {
        mut packets,
        released: mut release,
    } = outbound;

    let exit = loop {
        let next = tokio::select! {
            packet = packets.recv() => packet,
            _ = writer.closed() => break WriteExit::TransportClosed,
        };

        let Some(packet) = next else {
            writer
                .send_close(CloseCode::INTERNAL_ERROR, "", limits.write_timeout)
                .await;
            break WriteExit::QueueClosed;
        };

        let terminal = packet.frame_type().is_terminal();

        // Queued packets still go out after a release, unless the peer
        // has stopped reading
        let result = tokio::select! {
            result = writer.write(packet, limits.write_timeout) => result,
            _ = release_deadline(&mut release) => break WriteExit::Released,
        };

        if let Err(e) = result {
            writer
                .send_close(CloseCode::INTERNAL_ERROR, "", limits.write_timeout)
                .await;
            break WriteExit::Failed(e);
        }
        if terminal {
            break WriteExit::Finished;
        }
    };

    writer.close().await;

    match exit {
        WriteExit::Failed(e) => {
            tracing::debug!(connection_id = %id, error = %e, "WebSocket write failed");
        }
        WriteExit::Released => {
            tracing::debug!(connection_id = %id, "Write to stalled peer abandoned");
        }
        other => {
            tracing::trace!(connection_id = %id, exit = ?other, "Write loop finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::hub::HubConfig;
    use crate::websocket::memory::{self, MemoryPeer};
    use crate::websocket::packet::FrameType;
    use crate::websocket::transport::Transport;

    async fn start(
        hub: &Hub,
        limits: ConnectionLimits,
    ) -> (ConnectionId, MemoryPeer, ServedConnection) {
        start_with(hub, limits, 8, 8).await
    }

    /// `peer_buffer` packets fit in the transport before writes block,
    /// `queue` packets fit in the outbound queue before eviction
    async fn start_with(
        hub: &Hub,
        limits: ConnectionLimits,
        peer_buffer: usize,
        queue: usize,
    ) -> (ConnectionId, MemoryPeer, ServedConnection) {
        let (transport, peer) = memory::pair(peer_buffer);
        let (reader, writer) = transport.split();
        let writer = Arc::new(SharedWriter::new(writer));
        let (handle, outbound) = ConnectionHandle::new(queue);
        let id = handle.id();
        hub.register(handle).await.unwrap();
        let served = spawn(id, hub.clone(), reader, writer, outbound, limits);
        (id, peer, served)
    }

    async fn finish(served: ServedConnection) {
        tokio::time::timeout(Duration::from_secs(2), served.join())
            .await
            .expect("connection loops should terminate");
    }

    #[test]
    fn test_handles_have_distinct_ids() {
        let (a, _rx_a) = ConnectionHandle::new(1);
        let (b, _rx_b) = ConnectionHandle::new(1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_try_deliver_full_queue() {
        let (handle, _rx) = ConnectionHandle::new(1);
        assert!(handle.try_deliver(Packet::text("one")).is_ok());
        assert!(matches!(
            handle.try_deliver(Packet::text("two")),
            Err(TrySendError::Full(_))
        ));
    }

    #[tokio::test]
    async fn test_read_error_sends_internal_error_and_deregisters() {
        let hub = Hub::new(HubConfig::default());
        let (_id, mut peer, tasks) = start(&hub, ConnectionLimits::default()).await;

        peer.fail_read(TransportError::Read("connection reset".into()))
            .await
            .unwrap();

        let close = peer.recv().await.unwrap();
        assert_eq!(
            close.close_frame().map(|(code, _)| code),
            Some(CloseCode::INTERNAL_ERROR)
        );

        finish(tasks).await;
        assert_eq!(peer.close_count(), 1);
        assert_eq!(hub.stats().await.unwrap().connections, 0);
    }

    #[tokio::test]
    async fn test_oversized_message_closes_with_1009() {
        let hub = Hub::new(HubConfig::default());
        let limits = ConnectionLimits {
            max_message_size: Some(4),
            ..Default::default()
        };
        let (_id, mut peer, tasks) = start(&hub, limits).await;

        peer.send(Packet::text("too long")).await.unwrap();

        let close = peer.recv().await.unwrap();
        assert_eq!(
            close.close_frame().map(|(code, _)| code),
            Some(CloseCode::MESSAGE_TOO_BIG)
        );
        finish(tasks).await;
        assert_eq!(hub.stats().await.unwrap().broadcasts, 0);
    }

    #[tokio::test]
    async fn test_read_deadline_is_not_renewed() {
        let hub = Hub::new(HubConfig::default());
        let limits = ConnectionLimits {
            read_timeout: Some(Duration::from_millis(150)),
            ..Default::default()
        };
        let (_id, peer, tasks) = start(&hub, limits).await;

        // Keep the connection busy; activity does not push the deadline back
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            peer.send(Packet::text("tick")).await.unwrap();
        }

        finish(tasks).await;
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_peer_close_frame_ends_connection() {
        let hub = Hub::new(HubConfig::default());
        let (_id, mut peer, tasks) = start(&hub, ConnectionLimits::default()).await;

        peer.send(Packet::close(CloseCode::NORMAL, "bye")).await.unwrap();

        let reply = peer.recv().await.unwrap();
        assert_eq!(
            reply.close_frame().map(|(code, _)| code),
            Some(CloseCode::NORMAL)
        );
        finish(tasks).await;
        assert_eq!(hub.stats().await.unwrap().connections, 0);
    }

    #[tokio::test]
    async fn test_write_error_closes_transport_once() {
        let hub = Hub::new(HubConfig::default());
        let (_id, mut peer, tasks) = start(&hub, ConnectionLimits::default()).await;

        peer.stop_reading();
        hub.broadcast(Packet::text("undeliverable")).await.unwrap();

        finish(tasks).await;
        assert_eq!(peer.close_count(), 1);
        assert_eq!(hub.stats().await.unwrap().connections, 0);
    }

    #[tokio::test]
    async fn test_ping_is_not_broadcast() {
        let hub = Hub::new(HubConfig::default());
        let (_id, mut peer, _tasks) = start(&hub, ConnectionLimits::default()).await;

        peer.send(Packet::ping(b"are you there".to_vec())).await.unwrap();
        peer.send(Packet::text("data")).await.unwrap();

        let received = peer.recv().await.unwrap();
        assert_eq!(received.frame_type(), FrameType::Text);
        assert_eq!(received.payload(), b"data");
        assert_eq!(hub.stats().await.unwrap().broadcasts, 1);
    }

    #[tokio::test]
    async fn test_hub_close_aborts_write_to_stalled_peer() {
        let hub = Hub::new(HubConfig::default());
        // Peer never reads: the second write blocks with no deadline
        let (_id, peer, tasks) = start_with(&hub, ConnectionLimits::default(), 1, 8).await;

        for i in 0..3 {
            hub.broadcast(Packet::text(format!("message {}", i))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        hub.close().await;

        finish(tasks).await;
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_eviction_aborts_write_to_stalled_peer() {
        let hub = Hub::new(HubConfig::default());
        let (_id, peer, tasks) = start_with(&hub, ConnectionLimits::default(), 1, 1).await;

        // Transport, in-flight write and queue absorb at most three
        for i in 0..6 {
            hub.broadcast(Packet::text(format!("message {}", i))).await.unwrap();
        }

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.connections, 0);

        finish(tasks).await;
        assert_eq!(peer.close_count(), 1);
        assert!(!hub.is_closed());
    }

    #[tokio::test]
    async fn test_write_deadline_ends_stalled_connection() {
        let hub = Hub::new(HubConfig::default());
        let limits = ConnectionLimits {
            write_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let (_id, peer, tasks) = start_with(&hub, limits, 1, 8).await;

        for i in 0..3 {
            hub.broadcast(Packet::text(format!("message {}", i))).await.unwrap();
        }

        finish(tasks).await;
        assert_eq!(peer.close_count(), 1);
        assert_eq!(hub.stats().await.unwrap().connections, 0);
        assert_eq!(hub.stats().await.unwrap().evictions, 0);
    }

    #[tokio::test]
    async fn test_queue_released_when_handle_dropped() {
        let (handle, mut queue) = ConnectionHandle::new(2);
        handle.try_deliver(Packet::text("queued")).unwrap();
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), released(&mut queue.released))
            .await
            .expect("dropping the handle should release the queue");
        // Packets queued before the drop are still delivered
        assert_eq!(queue.recv().await.unwrap().as_text(), Some("queued"));
        assert!(queue.recv().await.is_none());
    }
}
