//! End-to-end test for peer negotiation over a local signaling relay
//!
//! Two session managers talk through a real relay; the transport capability
//! is mocked with an in-process wire so negotiation completes without UDP.
//! The mock completes connectivity the way a trickling transport would: the
//! answerer opens its channel after answering, the offerer after applying
//! the answer, and both trickle a candidate through the relay.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sidelink::peer::{
    query_peers, DataChannel, PeerNotice, SessionManager, SessionState, Transport,
    TransportEvent, TransportFactory, TransportUpdate,
};
use sidelink::{start_relay, PeerConfig, RelayHandle, SignalError};
use tokio::sync::{mpsc, Mutex};

/// (owner id, remote id) -> the owner's transport event queue for that peer.
type Wire = Arc<Mutex<HashMap<(String, String), Endpoint>>>;

#[derive(Clone)]
struct Endpoint {
    generation: u64,
    events: mpsc::Sender<TransportUpdate>,
}

struct WireTransport {
    local_id: String,
    remote_id: String,
    endpoint: Endpoint,
    wire: Wire,
}

impl WireTransport {
    async fn emit(&self, event: TransportEvent) {
        let _ = self
            .endpoint
            .events
            .send(TransportUpdate {
                remote_id: self.remote_id.clone(),
                generation: self.endpoint.generation,
                event,
            })
            .await;
    }

    fn channel(&self) -> Arc<dyn DataChannel> {
        Arc::new(WireChannel {
            local_id: self.local_id.clone(),
            remote_id: self.remote_id.clone(),
            wire: self.wire.clone(),
        })
    }

    async fn open_channel(&self) {
        self.emit(TransportEvent::LocalCandidate {
            candidate: format!("candidate-{}", self.local_id),
            mid: Some("0".to_string()),
        })
        .await;
        self.emit(TransportEvent::ChannelOpen(self.channel())).await;
    }
}

#[async_trait]
impl Transport for WireTransport {
    async fn create_local_offer(&self) -> Result<String, SignalError> {
        Ok(format!("offer-from-{}", self.local_id))
    }

    async fn create_local_answer(&self, _remote_description: &str) -> Result<String, SignalError> {
        // Answering side completes as soon as it has answered.
        self.open_channel().await;
        Ok(format!("answer-from-{}", self.local_id))
    }

    async fn set_remote_description(&self, _description: &str) -> Result<(), SignalError> {
        // Offering side completes once the answer is applied.
        self.open_channel().await;
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        _candidate: &str,
        _mid: Option<&str>,
    ) -> Result<(), SignalError> {
        Ok(())
    }

    async fn close(&self) {
        self.wire
            .lock()
            .await
            .remove(&(self.local_id.clone(), self.remote_id.clone()));
    }
}

struct WireChannel {
    local_id: String,
    remote_id: String,
    wire: Wire,
}

#[async_trait]
impl DataChannel for WireChannel {
    fn label(&self) -> String {
        "sidelink".to_string()
    }

    async fn send_text(&self, text: &str) -> Result<(), SignalError> {
        let remote = self
            .wire
            .lock()
            .await
            .get(&(self.remote_id.clone(), self.local_id.clone()))
            .cloned()
            .ok_or_else(|| SignalError::PeerNotConnected(self.remote_id.clone()))?;
        remote
            .events
            .send(TransportUpdate {
                remote_id: self.local_id.clone(),
                generation: remote.generation,
                event: TransportEvent::Message(text.to_string()),
            })
            .await
            .map_err(|_| SignalError::TransportFailure("wire closed".to_string()))
    }

    async fn close(&self) -> Result<(), SignalError> {
        Ok(())
    }
}

struct WireFactory {
    local_id: String,
    wire: Wire,
}

#[async_trait]
impl TransportFactory for WireFactory {
    async fn create(
        &self,
        remote_id: &str,
        generation: u64,
        events: mpsc::Sender<TransportUpdate>,
    ) -> Result<Arc<dyn Transport>, SignalError> {
        let endpoint = Endpoint { generation, events };
        self.wire.lock().await.insert(
            (self.local_id.to_string(), remote_id.to_string()),
            endpoint.clone(),
        );
        Ok(Arc::new(WireTransport {
            local_id: self.local_id.clone(),
            remote_id: remote_id.to_string(),
            endpoint,
            wire: self.wire.clone(),
        }))
    }
}

struct TestPeer {
    handle: sidelink::ManagerHandle,
    state: Arc<sidelink::peer::ManagerState>,
    notices: mpsc::Receiver<PeerNotice>,
}

async fn start_peer(local_id: &str, relay_addr: SocketAddr, wire: Wire) -> TestPeer {
    let config = PeerConfig {
        relay_url: format!("ws://{}", relay_addr),
        ..Default::default()
    };
    let factory = Arc::new(WireFactory {
        local_id: local_id.to_string(),
        wire,
    });
    let mut manager = SessionManager::new(local_id, config, factory).unwrap();
    let handle = manager.handle();
    let state = manager.state();
    let notices = manager.take_notices().unwrap();
    tokio::spawn(async move { manager.run().await });
    // Give the rendezvous channel a moment to bind.
    tokio::time::sleep(Duration::from_millis(100)).await;
    TestPeer {
        handle,
        state,
        notices,
    }
}

async fn start() -> RelayHandle {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    start_relay(addr).await.unwrap()
}

async fn wait_connected(peer: &TestPeer, remote_id: &str) -> bool {
    for _ in 0..100 {
        let connected = {
            let sessions = peer.state.sessions.read().await;
            sessions
                .get(remote_id)
                .map(|s| s.state == SessionState::Connected)
                .unwrap_or(false)
        };
        if connected && peer.state.registry.get(remote_id).await.is_some() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn expect_notice(
    peer: &mut TestPeer,
    mut matches: impl FnMut(&PeerNotice) -> bool,
) -> PeerNotice {
    loop {
        let notice = tokio::time::timeout(Duration::from_secs(5), peer.notices.recv())
            .await
            .expect("timed out waiting for notice")
            .expect("notice stream closed");
        if matches(&notice) {
            return notice;
        }
    }
}

#[tokio::test]
async fn test_offer_answer_establishes_one_session_each_side() {
    let relay = start().await;
    let wire: Wire = Arc::default();

    let mut abcd = start_peer("abcd", relay.addr, wire.clone()).await;
    let mut efgh = start_peer("efgh", relay.addr, wire.clone()).await;

    abcd.handle.connect_to("efgh").await.unwrap();

    assert!(wait_connected(&abcd, "efgh").await, "abcd never connected");
    assert!(wait_connected(&efgh, "abcd").await, "efgh never connected");

    expect_notice(&mut abcd, |n| {
        matches!(n, PeerNotice::Connected { peer } if peer == "efgh")
    })
    .await;
    expect_notice(&mut efgh, |n| {
        matches!(n, PeerNotice::Connected { peer } if peer == "abcd")
    })
    .await;

    // Exactly one session on each side, keyed by the other's identifier.
    assert_eq!(abcd.state.sessions.read().await.len(), 1);
    assert_eq!(efgh.state.sessions.read().await.len(), 1);

    // Application messages now flow directly, bypassing the relay.
    let delivered = abcd.handle.broadcast("ping").await.unwrap();
    assert_eq!(delivered, 1);
    let notice = expect_notice(&mut efgh, |n| matches!(n, PeerNotice::Message { .. })).await;
    assert_eq!(
        notice,
        PeerNotice::Message {
            peer: "abcd".to_string(),
            text: "ping".to_string()
        }
    );

    efgh.handle.send_to("abcd", "pong").await.unwrap();
    let notice = expect_notice(&mut abcd, |n| matches!(n, PeerNotice::Message { .. })).await;
    assert_eq!(
        notice,
        PeerNotice::Message {
            peer: "efgh".to_string(),
            text: "pong".to_string()
        }
    );

    relay.shutdown();
}

#[tokio::test]
async fn test_simultaneous_offers_resolve_to_one_session() {
    let relay = start().await;
    let wire: Wire = Arc::default();

    let abcd = start_peer("abcd", relay.addr, wire.clone()).await;
    let efgh = start_peer("efgh", relay.addr, wire.clone()).await;

    // Glare: both sides offer at once. A connect may be refused when the
    // counterpart's offer arrives first and a session already exists; the
    // pair must still converge on exactly one session.
    let (a, b) = tokio::join!(
        abcd.handle.connect_to("efgh"),
        efgh.handle.connect_to("abcd")
    );
    assert!(a.is_ok() || b.is_ok());

    assert!(wait_connected(&abcd, "efgh").await, "abcd never connected");
    assert!(wait_connected(&efgh, "abcd").await, "efgh never connected");

    // One established session per side -- never two, never zero.
    assert_eq!(abcd.state.sessions.read().await.len(), 1);
    assert_eq!(efgh.state.sessions.read().await.len(), 1);
    assert_eq!(abcd.state.registry.len().await, 1);
    assert_eq!(efgh.state.registry.len().await, 1);

    relay.shutdown();
}

#[tokio::test]
async fn test_offer_to_unbound_peer_surfaces_unreachable() {
    let relay = start().await;
    let wire: Wire = Arc::default();

    let mut abcd = start_peer("abcd", relay.addr, wire.clone()).await;

    abcd.handle.connect_to("zzzz").await.unwrap();

    expect_notice(&mut abcd, |n| {
        matches!(n, PeerNotice::Unreachable { peer } if peer == "zzzz")
    })
    .await;

    // The pending session is discarded rather than left to time out.
    for _ in 0..100 {
        if abcd.state.sessions.read().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(abcd.state.sessions.read().await.is_empty());

    relay.shutdown();
}

#[tokio::test]
async fn test_discovery_lists_bound_peers() {
    let relay = start().await;
    let wire: Wire = Arc::default();

    let _abcd = start_peer("abcd", relay.addr, wire.clone()).await;
    let _efgh = start_peer("efgh", relay.addr, wire.clone()).await;

    let relay_url = format!("ws://{}", relay.addr);
    let mut peers = Vec::new();
    for _ in 0..100 {
        peers = query_peers(&relay_url).await.unwrap();
        if peers.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    peers.sort();
    assert_eq!(peers, vec!["abcd".to_string(), "efgh".to_string()]);

    relay.shutdown();
}
