//! Web gateway integration tests.
//!
//! Each test runs the real axum server on a loopback port and talks to it
//! with WebSocket clients. The room topic is an in-memory stand-in.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use meshchat::{
    config::GatewayConfig,
    gateway::{run_inbound, ClientRegistry, FanoutGateway},
    network::{ChatTopic, HostError},
    types::ChatMessage,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const NICK: &str = "testnode";
const PAGE: &str = "<html><body>meshchat test page</body></html>";

// ──────── Harness ────────

#[derive(Default)]
struct FakeTopic {
    published: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl ChatTopic for FakeTopic {
    async fn publish(&self, data: Vec<u8>) -> Result<(), HostError> {
        self.published.lock().push(data);
        Ok(())
    }
}

impl FakeTopic {
    fn messages(&self) -> Vec<ChatMessage> {
        self.published
            .lock()
            .iter()
            .map(|data| ChatMessage::from_slice(data).unwrap())
            .collect()
    }
}

struct Harness {
    addr: SocketAddr,
    topic: Arc<FakeTopic>,
    registry: Arc<ClientRegistry>,
    shutdown: broadcast::Sender<()>,
    server: JoinHandle<anyhow::Result<()>>,
    _dir: TempDir,
}

async fn start_gateway(local_echo: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let page = dir.path().join("index.html");
    std::fs::write(&page, PAGE).unwrap();

    let config = GatewayConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        static_page: page,
        local_echo,
        ..Default::default()
    };

    let topic = Arc::new(FakeTopic::default());
    let registry = Arc::new(ClientRegistry::new());
    let (shutdown, _) = broadcast::channel(4);
    let gateway = FanoutGateway::new(
        topic.clone(),
        registry.clone(),
        &config,
        NICK.to_string(),
        shutdown.clone(),
    );

    let listener = TcpListener::bind(&config.listen_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(gateway.serve(listener));

    Harness {
        addr,
        topic,
        registry,
        shutdown,
        server,
        _dir: dir,
    }
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    ws
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next chat message pushed to `client`
async fn next_message(client: &mut Client) -> ChatMessage {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return ChatMessage::from_slice(text.as_bytes()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    })
    .await
    .expect("no message received")
}

// ──────── Reader path ────────

#[tokio::test]
async fn test_client_frames_are_published_under_node_nick() {
    let h = start_gateway(false).await;
    let mut client = connect(h.addr).await;

    client.send(Message::Text("hello room".into())).await.unwrap();
    client.send(Message::Text("  spaced  ".into())).await.unwrap();

    let topic = h.topic.clone();
    wait_until(|| topic.published.lock().len() == 2).await;

    let messages = h.topic.messages();
    assert_eq!(messages[0].sender, NICK);
    assert_eq!(messages[0].text, "hello room");
    // Frames are published verbatim
    assert_eq!(messages[1].text, "  spaced  ");
}

#[tokio::test]
async fn test_binary_frames_are_decoded_lossily() {
    let h = start_gateway(false).await;
    let mut client = connect(h.addr).await;

    client
        .send(Message::Binary(vec![b'h', b'i', 0xff].into()))
        .await
        .unwrap();

    let topic = h.topic.clone();
    wait_until(|| topic.published.lock().len() == 1).await;
    assert_eq!(h.topic.messages()[0].text, "hi\u{fffd}");
}

#[tokio::test]
async fn test_local_echo_delivers_own_lines() {
    let h = start_gateway(true).await;
    let mut sender = connect(h.addr).await;
    let mut other = connect(h.addr).await;
    let registry = h.registry.clone();
    wait_until(|| registry.len() == 2).await;

    sender.send(Message::Text("echo me".into())).await.unwrap();

    for client in [&mut sender, &mut other] {
        let msg = next_message(client).await;
        assert_eq!(msg.sender, NICK);
        assert_eq!(msg.text, "echo me");
    }
}

// ──────── Broadcast path ────────

#[tokio::test]
async fn test_topic_messages_reach_every_client() {
    let h = start_gateway(false).await;
    let mut a = connect(h.addr).await;
    let mut b = connect(h.addr).await;
    let registry = h.registry.clone();
    wait_until(|| registry.len() == 2).await;

    let (tx, rx) = mpsc::channel(8);
    let inbound = tokio::spawn(run_inbound(rx, h.registry.clone(), h.shutdown.subscribe()));

    let msg = ChatMessage::with_timestamp("remote", "hi", 1_700_000_000);
    tx.send(b"{not json".to_vec()).await.unwrap();
    tx.send(msg.to_json().unwrap().into_bytes()).await.unwrap();

    assert_eq!(next_message(&mut a).await, msg);
    assert_eq!(next_message(&mut b).await, msg);

    h.shutdown.send(()).unwrap();
    inbound.await.unwrap();
}

#[tokio::test]
async fn test_messages_arrive_in_broadcast_order() {
    let h = start_gateway(false).await;
    let mut client = connect(h.addr).await;
    let registry = h.registry.clone();
    wait_until(|| registry.len() == 1).await;

    // Within one queue's capacity nothing is dropped
    for i in 0..20 {
        let report = h
            .registry
            .broadcast(&ChatMessage::with_timestamp("remote", i.to_string(), i));
        assert_eq!(report.delivered, 1);
    }
    for i in 0..20 {
        assert_eq!(next_message(&mut client).await.text, i.to_string());
    }
}

#[tokio::test]
async fn test_stalled_client_does_not_hold_up_others() {
    let h = start_gateway(false).await;
    let _stalled = connect(h.addr).await;
    let mut healthy = connect(h.addr).await;
    let registry = h.registry.clone();
    wait_until(|| registry.len() == 2).await;

    let collector = tokio::spawn(async move {
        loop {
            let msg = next_message(&mut healthy).await;
            if msg.text == "marker" {
                return msg;
            }
        }
    });

    // The stalled client never reads; its socket and queue fill up
    let started = Instant::now();
    let filler = "x".repeat(1024);
    for i in 0..5_000 {
        h.registry
            .broadcast(&ChatMessage::with_timestamp("remote", filler.clone(), i));
    }
    assert!(started.elapsed() < Duration::from_secs(2));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let report = h
        .registry
        .broadcast(&ChatMessage::with_timestamp("remote", "marker", 0));
    assert!(report.delivered >= 1);

    let marker = tokio::time::timeout(Duration::from_secs(5), collector)
        .await
        .expect("healthy client starved")
        .unwrap();
    assert_eq!(marker.text, "marker");
}

// ──────── Session lifecycle ────────

#[tokio::test]
async fn test_closed_client_is_removed() {
    let h = start_gateway(false).await;
    let mut client = connect(h.addr).await;
    let registry = h.registry.clone();
    wait_until(|| registry.len() == 1).await;

    client.close(None).await.unwrap();
    wait_until(|| registry.len() == 0).await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions_and_server() {
    let h = start_gateway(false).await;
    let mut client = connect(h.addr).await;
    let registry = h.registry.clone();
    wait_until(|| registry.len() == 1).await;

    h.shutdown.send(()).unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "client was not disconnected");

    wait_until(|| registry.len() == 0).await;
    tokio::time::timeout(Duration::from_secs(5), h.server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}

// ──────── Static page ────────

#[tokio::test]
async fn test_index_page_is_served() {
    let h = start_gateway(false).await;

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(PAGE));
}
