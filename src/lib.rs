//! # Switchboard
//!
//! A WebSocket connection hub: every message one client sends is
//! broadcast to every connected client.
//!
//! ## Features
//!
//! - **Single-owner registry**: one control task owns the connection set,
//!   so registration, removal and broadcast never race
//! - **Backpressure**: a client whose outbound queue is full is evicted
//!   instead of stalling the broadcast
//! - **Failure isolation**: a broken connection only tears down itself
//! - **Transport-agnostic**: connections run over any [`websocket::Transport`]
//!
//! ## Modules
//!
//! - [`websocket`]: Hub, connection tasks and the transport seam
//! - [`api`]: HTTP server with Axum (upgrade endpoint, broadcast, health)
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use switchboard::websocket::{memory, Hub, HubConfig, Packet};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = Hub::new(HubConfig::with_capacity(2));
//!
//!     let (transport, mut client) = memory::pair(16);
//!     let connection = hub.serve(transport).await?;
//!
//!     hub.broadcast(Packet::text("hello")).await?;
//!     let received = client.recv().await;
//!     println!("{:?}", received);
//!
//!     // Closes every connection with 1001 Going Away
//!     hub.close().await;
//!     connection.join().await;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod websocket;

// Re-export top-level types for convenience
pub use api::{build_router, serve, serve_with_shutdown, ApiConfig, ApiError, AppState};

pub use config::{Config, ConfigError, LoggingConfig};

pub use websocket::{
    websocket_handler, CloseCode, ConnectionHandle, ConnectionId, FrameType, Hub, HubConfig,
    HubError, HubStats, Packet, ServedConnection, Transport, TransportError,
};
