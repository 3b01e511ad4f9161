//! WebSocket Connection Hub
//!
//! Tracks every live connection and fans broadcasts out to them.
//!
//! The registered set is owned by a single control-loop task. Every
//! mutation (register, deregister, eviction) and every broadcast goes
//! through that loop as a message, one at a time, so there are no locks
//! around the set and a broadcast always sees a consistent membership.
//!
//! The loop drains its queues in a fixed priority order: shutdown, register,
//! deregister, delivery, stats. A broadcast therefore sees every
//! (de)registration already waiting when it is picked, but a registration
//! queued after a broadcast can still overtake it. A sustained stream of
//! (de)registrations delays broadcasts and stats until it lets up.
//!
//! Slow consumers are not buffered for: when a connection's outbound queue
//! is full at broadcast time, the connection is evicted in the same step.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::connection::{self, ConnectionHandle, ConnectionLimits, ServedConnection};
use super::packet::{CloseCode, Packet};
use super::transport::{SharedWriter, Transport};

/// Unique identifier for a WebSocket connection
pub type ConnectionId = Uuid;

/// Configuration for the connection hub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Maximum number of registered connections, 0 for unbounded.
    /// Advisory: checked by the upgrade layer through [`Hub::is_full`].
    #[serde(default)]
    pub capacity: usize,

    /// Per-connection outbound queue length
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Length of each control-loop request queue
    #[serde(default = "default_request_buffer")]
    pub request_buffer: usize,

    /// Largest accepted inbound message in bytes, 0 to disable
    #[serde(default)]
    pub max_message_size: usize,

    /// Read deadline applied once when a connection starts, 0 to disable
    #[serde(default)]
    pub read_timeout_ms: u64,

    /// Deadline for each outbound write, 0 to disable
    #[serde(default)]
    pub write_timeout_ms: u64,
}

fn default_outbound_buffer() -> usize {
    16
}

fn default_request_buffer() -> usize {
    64
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            outbound_buffer: default_outbound_buffer(),
            request_buffer: default_request_buffer(),
            max_message_size: 0,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
        }
    }
}

impl HubConfig {
    /// Default configuration with a connection cap
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }

    pub(crate) fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_message_size: (self.max_message_size > 0).then_some(self.max_message_size),
            read_timeout: self.read_timeout(),
            write_timeout: self.write_timeout(),
        }
    }
}

/// Snapshot of hub activity, produced by the control loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Currently registered connections
    pub connections: usize,
    /// Configured capacity (0 = unbounded)
    pub capacity: usize,
    /// Broadcasts processed since the hub started
    pub broadcasts: u64,
    /// Connections evicted as slow consumers
    pub evictions: u64,
}

/// Errors returned by hub operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("Hub is closed")]
    Closed,

    #[error("Connection not found")]
    ConnectionNotFound,

    #[error("Connection evicted: outbound queue full")]
    Evicted,
}

/// Outbound work for the control loop. Broadcasts and point deliveries
/// share one queue so their relative order is preserved.
enum Delivery {
    All(Packet),
    One {
        id: ConnectionId,
        packet: Packet,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
}

/// Cloneable handle on a running hub
///
/// All clones talk to the same control loop. The hub must be created from
/// within a Tokio runtime.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: HubConfig,
    register_tx: mpsc::Sender<(ConnectionHandle, oneshot::Sender<()>)>,
    deregister_tx: mpsc::Sender<ConnectionId>,
    deliver_tx: mpsc::Sender<Delivery>,
    stats_tx: mpsc::Sender<oneshot::Sender<HubStats>>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    live: Arc<AtomicUsize>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Receiving ends of the request queues, owned by the control loop
struct Requests {
    register: mpsc::Receiver<(ConnectionHandle, oneshot::Sender<()>)>,
    deregister: mpsc::Receiver<ConnectionId>,
    deliver: mpsc::Receiver<Delivery>,
    stats: mpsc::Receiver<oneshot::Sender<HubStats>>,
    shutdown: watch::Receiver<bool>,
}

impl Hub {
    /// Create a hub and start its control loop
    pub fn new(config: HubConfig) -> Self {
        let buffer = config.request_buffer.max(1);
        let (register_tx, register) = mpsc::channel(buffer);
        let (deregister_tx, deregister) = mpsc::channel(buffer);
        let (deliver_tx, deliver) = mpsc::channel(buffer);
        let (stats_tx, stats) = mpsc::channel(buffer);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let live = Arc::new(AtomicUsize::new(0));

        let control = ControlLoop {
            registered: HashMap::new(),
            live: Arc::clone(&live),
            capacity: config.capacity,
            broadcasts: 0,
            evictions: 0,
        };
        let task = tokio::spawn(control.run(Requests {
            register,
            deregister,
            deliver,
            stats,
            shutdown,
        }));

        tracing::debug!(capacity = config.capacity, "Connection hub started");

        Self {
            inner: Arc::new(HubInner {
                config,
                register_tx,
                deregister_tx,
                deliver_tx,
                stats_tx,
                shutdown_tx,
                closed: AtomicBool::new(false),
                live,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    /// Registered connection count as last published by the control loop
    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Whether the capacity has been reached. Always `false` when unbounded.
    ///
    /// Advisory only: the control loop never rejects a registration, so
    /// concurrent upgrades can briefly overshoot the capacity.
    pub fn is_full(&self) -> bool {
        let capacity = self.capacity();
        capacity != 0 && self.live_count() >= capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), HubError> {
        if self.is_closed() {
            Err(HubError::Closed)
        } else {
            Ok(())
        }
    }

    /// Register a connection. Resolves once the control loop has added it.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), HubError> {
        self.ensure_open()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .register_tx
            .send((handle, ack_tx))
            .await
            .map_err(|_| HubError::Closed)?;
        ack_rx.await.map_err(|_| HubError::Closed)
    }

    /// Remove a connection and close its outbound queue.
    /// Unknown or already removed identities are ignored.
    pub async fn deregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.ensure_open()?;
        self.inner
            .deregister_tx
            .send(id)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Queue a packet for every registered connection
    ///
    /// Waits only for room in the control loop's queue, never for
    /// individual connections.
    pub async fn broadcast(&self, packet: Packet) -> Result<(), HubError> {
        self.ensure_open()?;
        self.inner
            .deliver_tx
            .send(Delivery::All(packet))
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Queue a packet for a single connection, with the same eviction
    /// policy as [`Hub::broadcast`]
    pub async fn send_to(&self, id: ConnectionId, packet: Packet) -> Result<(), HubError> {
        self.ensure_open()?;
        let (reply, rx) = oneshot::channel();
        self.inner
            .deliver_tx
            .send(Delivery::One { id, packet, reply })
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Stats as seen by the control loop after all earlier requests
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.ensure_open()?;
        let (reply, rx) = oneshot::channel();
        self.inner
            .stats_tx
            .send(reply)
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Number of registered connections
    pub async fn connection_count(&self) -> Result<usize, HubError> {
        Ok(self.stats().await?.connections)
    }

    /// Register a transport with the hub and start its read and write loops
    ///
    /// If the hub is closed the transport is sent a going-away close frame,
    /// closed, and [`HubError::Closed`] is returned.
    pub async fn serve<T: Transport>(&self, transport: T) -> Result<ServedConnection, HubError> {
        let limits = self.inner.config.limits();
        let (reader, writer) = transport.split();
        let writer = Arc::new(SharedWriter::new(writer));
        let (handle, outbound) = ConnectionHandle::new(self.inner.config.outbound_buffer);
        let id = handle.id();

        if let Err(e) = self.register(handle).await {
            writer
                .send_close(CloseCode::GOING_AWAY, "hub closed", limits.write_timeout)
                .await;
            writer.close().await;
            return Err(e);
        }

        Ok(connection::spawn(id, self.clone(), reader, writer, outbound, limits))
    }

    /// Stop the control loop
    ///
    /// Every registered connection is offered a going-away close frame and
    /// has its handle dropped. That ends its write loop, aborting a write
    /// stuck on a peer that stopped reading, and closes its transport,
    /// which wakes a read loop blocked on the network. All later
    /// operations fail with [`HubError::Closed`]. Calling `close` again is a
    /// no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown_tx.send_replace(true);

        let task = self.inner.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Hub control loop panicked");
            }
        }
    }
}

/// State owned by the control-loop task
struct ControlLoop {
    registered: HashMap<ConnectionId, ConnectionHandle>,
    live: Arc<AtomicUsize>,
    capacity: usize,
    broadcasts: u64,
    evictions: u64,
}

impl ControlLoop {
    async fn run(mut self, mut requests: Requests) {
        loop {
            // Biased: a broadcast never overtakes a pending (de)registration
            tokio::select! {
                biased;
                _ = requests.shutdown.changed() => break,
                Some((handle, ack)) = requests.register.recv() => {
                    self.register(handle);
                    let _ = ack.send(());
                }
                Some(id) = requests.deregister.recv() => self.deregister(id),
                Some(delivery) = requests.deliver.recv() => match delivery {
                    Delivery::All(packet) => self.broadcast(packet),
                    Delivery::One { id, packet, reply } => {
                        let _ = reply.send(self.send_to(id, packet));
                    }
                },
                Some(reply) = requests.stats.recv() => {
                    let _ = reply.send(self.stats());
                }
                else => break,
            }
        }

        self.shutdown();
    }

    fn publish_count(&self) {
        self.live.store(self.registered.len(), Ordering::Release);
    }

    fn register(&mut self, handle: ConnectionHandle) {
        let id = handle.id();
        self.registered.insert(id, handle);
        self.publish_count();

        tracing::info!(
            connection_id = %id,
            connections = self.registered.len(),
            "WebSocket connected"
        );
    }

    fn deregister(&mut self, id: ConnectionId) {
        // Dropping the handle closes the outbound queue and releases the writer
        if self.registered.remove(&id).is_some() {
            self.publish_count();
            tracing::debug!(
                connection_id = %id,
                connections = self.registered.len(),
                "Connection deregistered"
            );
        }
    }

    fn broadcast(&mut self, packet: Packet) {
        self.broadcasts += 1;

        let mut dropped = Vec::new();
        for (id, handle) in &self.registered {
            match handle.try_deliver(packet.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(connection_id = %id, "Slow consumer evicted");
                    dropped.push(*id);
                    self.evictions += 1;
                }
                Err(TrySendError::Closed(_)) => dropped.push(*id),
            }
        }

        let delivered = self.registered.len() - dropped.len();
        for id in &dropped {
            self.registered.remove(id);
        }
        if !dropped.is_empty() {
            self.publish_count();
        }

        tracing::trace!(
            frame = %packet.frame_type(),
            bytes = packet.len(),
            delivered,
            dropped = dropped.len(),
            "Broadcast"
        );
    }

    fn send_to(&mut self, id: ConnectionId, packet: Packet) -> Result<(), HubError> {
        let handle = self
            .registered
            .get(&id)
            .ok_or(HubError::ConnectionNotFound)?;

        match handle.try_deliver(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::debug!(connection_id = %id, "Slow consumer evicted");
                self.registered.remove(&id);
                self.evictions += 1;
                self.publish_count();
                Err(HubError::Evicted)
            }
            Err(TrySendError::Closed(_)) => {
                self.registered.remove(&id);
                self.publish_count();
                Err(HubError::ConnectionNotFound)
            }
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registered.len(),
            capacity: self.capacity,
            broadcasts: self.broadcasts,
            evictions: self.evictions,
        }
    }

    fn shutdown(&mut self) {
        let count = self.registered.len();
        for (_, handle) in self.registered.drain() {
            let _ = handle.try_deliver(Packet::close(CloseCode::GOING_AWAY, "hub closed"));
        }
        self.publish_count();

        tracing::info!(connections = count, "Connection hub closed");
    }
}
