//! Data Transfer Objects
//!
//! Response types for the API endpoints, serialized to JSON.

use serde::Serialize;

use crate::websocket::{FrameType, HubStats};

// ============================================
// BROADCAST DTOs
// ============================================

/// Broadcast response
#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    /// Status: "queued"
    pub status: String,
    /// Frame type the payload was sent as
    pub frame: FrameType,
    /// Payload size in bytes
    pub bytes: usize,
    /// Connections registered when the broadcast was queued
    pub connections: usize,
}

// ============================================
// STATS DTOs
// ============================================

/// Hub statistics response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub hub: HubStats,
    /// Whether the hub reports itself full
    pub full: bool,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status: healthy, full, closed
    pub status: String,
    /// Registered WebSocket connections
    pub connections: usize,
    /// Configured capacity (0 = unbounded)
    pub capacity: usize,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Application version
    pub version: String,
}
