//! WebSocket Connection Hub
//!
//! Accepts many concurrent WebSocket connections, keeps track of which are
//! live, and broadcasts every inbound message to all of them.
//!
//! ## Architecture
//!
//! - **Hub**: owns the registered-connection set inside a single control
//!   loop that serializes register / deregister / broadcast requests
//! - **Connection**: a read loop and a write loop per client, joined by a
//!   bounded outbound queue
//! - **Packet**: immutable `{frame type, payload}` envelope
//! - **Transport**: the duplex channel a connection runs over (axum's
//!   `WebSocket`, or the in-memory transport in [`memory`])
//!
//! ## Backpressure
//!
//! Broadcasting never waits on a slow client. If a connection's outbound
//! queue is full when a broadcast arrives, that connection is evicted: its
//! queue is closed, its write loop sends a close frame and shuts the
//! transport, and the rest of the hub carries on.
//!
//! ## Example
//!
//! ```rust,no_run
//! use switchboard::websocket::{memory, Hub, HubConfig, Packet};
//!
//! # async fn run() -> Result<(), switchboard::websocket::HubError> {
//! let hub = Hub::new(HubConfig::with_capacity(100));
//!
//! let (transport, _peer) = memory::pair(8);
//! hub.serve(transport).await?;
//!
//! hub.broadcast(Packet::text("hello, world")).await?;
//! hub.close().await;
//! # Ok(())
//! # }
//! ```

mod connection;
mod handler;
mod hub;
pub mod memory;
mod packet;
mod transport;

pub use connection::{ConnectionHandle, OutboundQueue, ServedConnection};
pub use handler::{websocket_handler, WsReader, WsWriter};
pub use hub::{ConnectionId, Hub, HubConfig, HubError, HubStats};
pub use packet::{format_close_payload, parse_close_payload, CloseCode, FrameType, Packet};
pub use transport::{MessageReader, MessageWriter, Transport, TransportError};
