//! End-to-end tests: real TCP server, real WebSocket clients.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use switchboard::api::{serve_with_shutdown, ApiConfig, AppState};
use switchboard::websocket::{ConnectionHandle, Hub, HubConfig, HubError, Packet};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    hub: Hub,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(hub_config: HubConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let hub = Hub::new(hub_config);
        let state = AppState::new(hub.clone(), ApiConfig::new("127.0.0.1", addr.port()));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            serve_with_shutdown(listener, state, async {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
        });

        Self {
            addr,
            hub,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn connect(&self) -> Client {
        let (client, _response) = connect_async(self.url()).await.unwrap();
        client
    }

    async fn wait_for_connections(&self, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if self.hub.stats().await.unwrap().connections == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("hub never reached {} connections", expected));
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not shut down")
            .unwrap();
    }
}

/// Next data message, skipping pings and pongs
async fn next_data(client: &mut Client) -> Message {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(message)) => return message,
                other => panic!("connection ended unexpectedly: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for a message")
}

/// Read until a close frame arrives and return its code
async fn next_close_code(client: &mut Client) -> Option<u16> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await
    .expect("timed out waiting for close")
}

#[tokio::test]
async fn test_broadcast_between_clients_and_capacity() {
    let server = TestServer::start(HubConfig::with_capacity(2)).await;

    let mut a = server.connect().await;
    let mut b = server.connect().await;
    server.wait_for_connections(2).await;

    a.send(Message::Text("hello, world".to_string())).await.unwrap();

    assert_eq!(next_data(&mut b).await, Message::Text("hello, world".to_string()));
    // The sender is a member of the broadcast set too
    assert_eq!(next_data(&mut a).await, Message::Text("hello, world".to_string()));

    // Third client is refused before the upgrade
    match connect_async(server.url()).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 403),
        other => panic!("expected 403 rejection, got {:?}", other.map(|_| ())),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_binary_broadcast() {
    let server = TestServer::start(HubConfig::default()).await;

    let mut a = server.connect().await;
    let mut b = server.connect().await;
    server.wait_for_connections(2).await;

    b.send(Message::Binary(vec![0, 159, 146, 150])).await.unwrap();
    assert_eq!(next_data(&mut a).await, Message::Binary(vec![0, 159, 146, 150]));

    server.stop().await;
}

#[tokio::test]
async fn test_client_close_deregisters() {
    let server = TestServer::start(HubConfig::with_capacity(1)).await;

    let mut a = server.connect().await;
    server.wait_for_connections(1).await;

    a.close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "bye".into(),
    }))
    .await
    .unwrap();
    assert_eq!(next_close_code(&mut a).await, Some(1000));
    server.wait_for_connections(0).await;

    // The freed slot can be reused
    let _b = server.connect().await;
    server.wait_for_connections(1).await;

    server.stop().await;
}

#[tokio::test]
async fn test_hub_close_sends_going_away() {
    let server = TestServer::start(HubConfig::default()).await;

    let mut a = server.connect().await;
    let mut b = server.connect().await;
    server.wait_for_connections(2).await;

    server.hub.close().await;

    assert_eq!(next_close_code(&mut a).await, Some(1001));
    assert_eq!(next_close_code(&mut b).await, Some(1001));

    let (handle, _rx) = ConnectionHandle::new(1);
    assert_eq!(server.hub.register(handle).await, Err(HubError::Closed));
    assert_eq!(server.hub.broadcast(Packet::text("late")).await, Err(HubError::Closed));

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_message_closes_with_1009() {
    let server = TestServer::start(HubConfig {
        max_message_size: 8,
        ..Default::default()
    })
    .await;

    let mut a = server.connect().await;
    server.wait_for_connections(1).await;

    a.send(Message::Text("far too long for the limit".to_string()))
        .await
        .unwrap();

    assert_eq!(next_close_code(&mut a).await, Some(1009));
    server.wait_for_connections(0).await;

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_hub() {
    let server = TestServer::start(HubConfig::default()).await;
    let hub = server.hub.clone();

    let mut a = server.connect().await;
    server.wait_for_connections(1).await;

    server.stop().await;

    assert!(hub.is_closed());
    assert_eq!(next_close_code(&mut a).await, Some(1001));
}
