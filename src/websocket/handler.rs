//! WebSocket Handler
//!
//! Handles WebSocket upgrade requests and adapts axum's `WebSocket` to the
//! hub's [`Transport`] interface.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

use super::packet::{CloseCode, FrameType, Packet};
use super::transport::{MessageReader, MessageWriter, Transport, TransportError};
use crate::api::{ApiError, AppState};

/// WebSocket upgrade handler
///
/// The capacity check happens before the upgrade: a full hub answers
/// `403 Forbidden` and no transport is ever produced. A request that is not
/// a valid upgrade gets `426 Upgrade Required`.
pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let hub = state.hub.clone();

    if hub.is_closed() {
        return Err(ApiError::ServiceUnavailable("hub is closed".to_string()));
    }
    if hub.is_full() {
        tracing::debug!(capacity = hub.capacity(), "Rejecting WebSocket upgrade, hub full");
        return Err(ApiError::CapacityExceeded(hub.capacity()));
    }

    let mut ws = ws.map_err(|e| ApiError::UpgradeRequired(e.to_string()))?;

    // Enforced by the protocol layer before a message is buffered
    let limit = hub.config().max_message_size;
    if limit > 0 {
        ws = ws.max_message_size(limit).max_frame_size(limit);
    }

    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = hub.serve(socket).await {
            tracing::warn!(error = %e, "Failed to serve WebSocket connection");
        }
    }))
}

impl Transport for WebSocket {
    type Reader = WsReader;
    type Writer = WsWriter;

    fn split(self) -> (WsReader, WsWriter) {
        let (sink, stream) = StreamExt::split(self);
        (WsReader(stream), WsWriter(sink))
    }
}

/// Read half of an axum `WebSocket`
pub struct WsReader(SplitStream<WebSocket>);

/// Write half of an axum `WebSocket`
pub struct WsWriter(SplitSink<WebSocket, Message>);

#[async_trait]
impl MessageReader for WsReader {
    async fn read_message(&mut self) -> Result<Packet, TransportError> {
        match self.0.next().await {
            Some(Ok(message)) => Ok(packet_from_message(message)),
            Some(Err(e)) => Err(read_error(&e.to_string())),
            None => Err(TransportError::Read("stream ended".to_string())),
        }
    }
}

#[async_trait]
impl MessageWriter for WsWriter {
    async fn write_message(&mut self, packet: Packet) -> Result<(), TransportError> {
        let message = message_from_packet(packet)?;
        self.0
            .send(message)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0
            .close()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}

/// Map a protocol read error, picking out size-limit violations.
///
/// tungstenite reports them as `Space limit exceeded: Message too long:
/// {size} > {limit}` for both whole messages and single frames.
fn read_error(message: &str) -> TransportError {
    let sizes = message
        .split_once("Message too long: ")
        .and_then(|(_, sizes)| sizes.split_once(" > "));

    if let Some((size, limit)) = sizes {
        if let (Ok(size), Ok(limit)) = (size.trim().parse(), limit.trim().parse()) {
            return TransportError::MessageTooLarge { size, limit };
        }
    }
    TransportError::Read(message.to_string())
}

fn packet_from_message(message: Message) -> Packet {
    match message {
        Message::Text(text) => Packet::text(text),
        Message::Binary(data) => Packet::binary(data),
        Message::Ping(data) => Packet::ping(data),
        Message::Pong(data) => Packet::pong(data),
        Message::Close(Some(frame)) => Packet::close(CloseCode(frame.code), &frame.reason),
        Message::Close(None) => Packet::close(CloseCode::NO_STATUS, ""),
    }
}

fn message_from_packet(packet: Packet) -> Result<Message, TransportError> {
    let packet = packet.into_wire();
    let message = match packet.frame_type() {
        FrameType::Text => {
            let text = packet
                .as_text()
                .ok_or_else(|| TransportError::Write("text frame is not valid UTF-8".to_string()))?;
            Message::Text(text.to_string())
        }
        FrameType::Binary => Message::Binary(packet.payload().to_vec()),
        FrameType::Ping => Message::Ping(packet.payload().to_vec()),
        FrameType::Pong => Message::Pong(packet.payload().to_vec()),
        FrameType::Close | FrameType::ControlError => match packet.close_frame() {
            Some((code, _)) if code == CloseCode::NO_STATUS => Message::Close(None),
            Some((code, reason)) => Message::Close(Some(CloseFrame {
                code: code.0,
                reason: reason.into(),
            })),
            None => Message::Close(None),
        },
    };
    Ok(message)
}
