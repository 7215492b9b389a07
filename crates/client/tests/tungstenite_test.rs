//! The real connector against a local tokio-tungstenite server.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cms_admin_client::ws::RoomMembership;
use cms_admin_client::{ConnectionState, NotificationChannel, ReconnectConfig, TungsteniteConnector};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::cookie::Jar;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use common::wait_for_state;

/// Accept one socket, push a presence list, echo the first client text back
/// through `received`, then close normally.
async fn start_ws_server() -> (SocketAddr, Arc<Mutex<Option<String>>>, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().unwrap();
    let cookie = Arc::new(Mutex::new(None));
    let (tx, rx) = mpsc::unbounded_channel();

    let seen_cookie = cookie.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *seen_cookie.lock() = req
                .headers()
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, capture)
            .await
            .expect("handshake");
        let (mut write, mut read) = ws.split();

        let list = r#"{"type":"online_list","payload":{"user_ids":["u1","u2"]}}"#;
        write.send(Message::Text(list.into())).await.expect("send list");

        while let Some(Ok(msg)) = read.next().await {
            if let Message::Text(text) = msg {
                let _ = tx.send(text.to_string());
                break;
            }
        }

        let _ = write
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            })))
            .await;
    });

    (addr, cookie, rx)
}

#[tokio::test]
async fn real_socket_round_trip() {
    let (addr, cookie, mut received) = start_ws_server().await;

    let jar = Arc::new(Jar::default());
    let origin = Url::parse(&format!("http://{addr}/api/v1/auth/login")).unwrap();
    jar.add_cookie_str("access_token=abc123; Path=/; HttpOnly", &origin);

    let url = Url::parse(&format!("ws://{addr}/api/v1/ws")).unwrap();
    let channel = NotificationChannel::new(
        url,
        TungsteniteConnector::new().with_cookies(jar),
        ReconnectConfig::default(),
    );
    let (tx, mut lists) = mpsc::unbounded_channel();
    let _sub = channel.subscribe_event(move |list: cms_admin_shared::OnlineList| {
        let _ = tx.send(list.user_ids);
    });

    channel.connect();
    let ids = tokio::time::timeout(Duration::from_secs(5), lists.recv())
        .await
        .expect("online_list delivered")
        .unwrap();
    assert_eq!(ids, vec!["u1", "u2"]);
    assert_eq!(cookie.lock().as_deref(), Some("access_token=abc123"));

    let rooms = RoomMembership::new(channel.clone());
    rooms.join("article:42");
    let text = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("join delivered")
        .unwrap();
    let action: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(action, serde_json::json!({ "action": "join_room", "payload": "article:42" }));

    // The server's normal close ends the channel for good.
    wait_for_state(&channel, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn unreachable_server_schedules_a_reconnect() {
    // Bind then drop to get a port nobody listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let url = Url::parse(&format!("ws://{addr}/api/v1/ws")).unwrap();
    let channel = NotificationChannel::new(url, TungsteniteConnector::new(), ReconnectConfig::default());

    channel.connect();
    wait_for_state(&channel, ConnectionState::Disconnected).await;
    let mut states = channel.state_changes();
    common::wait_until(&mut states, |_| channel.reconnect_attempts() >= 1).await;
    assert!(!channel.is_connected());
    channel.disconnect();
}
