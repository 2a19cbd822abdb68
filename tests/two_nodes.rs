//! Two real nodes on loopback: bootstrap, topic join and end-to-end delivery
//! from one node's web client to the other's.
//!
//! Binds fixed TCP ports, so it is ignored by default:
//!   cargo test --test two_nodes -- --ignored --nocapture

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use meshchat::{config::Config, daemon::ChatDaemon, types::ChatMessage};
use tempfile::TempDir;
use tokio_tungstenite::{connect_async, tungstenite::Message};

fn node_config(dir: &TempDir, port: u16, bootstrap: Vec<String>) -> Config {
    let mut config = Config::default();
    config.node.room = "two-nodes".to_string();
    config.node.listen_tcp = format!("/ip4/127.0.0.1/tcp/{}", port);
    config.node.listen_quic = None;
    config.node.enable_mdns = false;
    config.node.enable_upnp = false;
    config.node.bootstrap_peers = bootstrap;
    config.node.data_dir = dir.path().to_path_buf();
    config.gateway.listen_addr = "127.0.0.1:0".to_string();
    config.validate().unwrap();
    config
}

#[tokio::test]
#[ignore]
async fn test_message_crosses_from_one_node_to_the_other() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let node_a = ChatDaemon::start(node_config(&dir_a, 47101, Vec::new()))
        .await
        .unwrap();
    let bootstrap = format!("/ip4/127.0.0.1/tcp/47101/p2p/{}", node_a.local_peer_id());
    let node_b = ChatDaemon::start(node_config(&dir_b, 47102, vec![bootstrap]))
        .await
        .unwrap();

    let (mut client_a, _) = connect_async(format!("ws://{}/ws", node_a.web_addr()))
        .await
        .unwrap();
    let (mut client_b, _) = connect_async(format!("ws://{}/ws", node_b.web_addr()))
        .await
        .unwrap();

    // Publishing fails until the gossip mesh forms, so keep sending
    let deadline = Instant::now() + Duration::from_secs(30);
    let received = loop {
        assert!(Instant::now() < deadline, "message never arrived");
        client_a.send(Message::Text("hello from a".into())).await.unwrap();

        match tokio::time::timeout(Duration::from_secs(1), client_b.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                break ChatMessage::from_slice(text.as_bytes()).unwrap();
            }
            Ok(Some(Ok(_))) | Err(_) => continue,
            Ok(other) => panic!("client b disconnected: {:?}", other),
        }
    };

    assert_eq!(received.text, "hello from a");
    assert_eq!(received.sender, node_a.nick());

    // B dialled A, so B's peers file now holds A
    let peers = std::fs::read_to_string(dir_b.path().join("peers.txt")).unwrap();
    assert!(peers.contains(&node_a.local_peer_id().to_string()));

    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
}
