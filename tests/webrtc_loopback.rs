//! Loopback test with the real webrtc transport
//!
//! Two peers negotiate through a local relay and connect over host
//! candidates. Ignored by default: it needs working UDP sockets between the
//! two local peer connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sidelink::peer::{PeerNotice, RtcFactory, SessionManager, SessionState};
use sidelink::{start_relay, PeerConfig};

async fn start_peer(
    local_id: &str,
    relay_addr: SocketAddr,
) -> (
    sidelink::ManagerHandle,
    Arc<sidelink::peer::ManagerState>,
    tokio::sync::mpsc::Receiver<PeerNotice>,
) {
    let config = PeerConfig {
        relay_url: format!("ws://{}", relay_addr),
        // Host candidates are enough on loopback.
        stun_servers: vec![],
        ..Default::default()
    };
    let factory = Arc::new(RtcFactory::new(config.stun_servers.clone()));
    let mut manager = SessionManager::new(local_id, config, factory).unwrap();
    let handle = manager.handle();
    let state = manager.state();
    let notices = manager.take_notices().unwrap();
    tokio::spawn(async move { manager.run().await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    (handle, state, notices)
}

#[tokio::test]
#[ignore = "requires UDP sockets between local peer connections"]
async fn test_webrtc_loopback_connection() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let relay = start_relay(addr).await.unwrap();

    let (handle1, state1, _notices1) = start_peer("abcd", relay.addr).await;
    let (_handle2, state2, mut notices2) = start_peer("efgh", relay.addr).await;

    handle1.connect_to("efgh").await.unwrap();

    println!("Waiting for WebRTC connection...");
    let mut connected = false;
    for i in 0..30 {
        tokio::time::sleep(Duration::from_secs(2)).await;

        let state_a = {
            let sessions = state1.sessions.read().await;
            sessions.get("efgh").map(|s| s.state)
        };
        let state_b = {
            let sessions = state2.sessions.read().await;
            sessions.get("abcd").map(|s| s.state)
        };
        println!("Check {}: abcd={:?} efgh={:?}", i + 1, state_a, state_b);

        if state_a == Some(SessionState::Connected) && state_b == Some(SessionState::Connected) {
            connected = true;
            break;
        }
    }
    assert!(connected, "peers should connect within 60 seconds");

    // A real frame crosses the data channel.
    let delivered = handle1.broadcast("ping over webrtc").await.unwrap();
    assert_eq!(delivered, 1);

    let received = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match notices2.recv().await {
                Some(PeerNotice::Message { peer, text }) => break (peer, text),
                Some(_) => continue,
                None => panic!("notice stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for message");

    assert_eq!(received, ("abcd".to_string(), "ping over webrtc".to_string()));

    relay.shutdown();
}
