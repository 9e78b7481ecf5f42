//! WebRTC transport implementation
//!
//! Adapts `webrtc::RTCPeerConnection` to the [`Transport`] interface. The
//! offering side creates the data channel before producing its offer so the
//! channel rides the negotiated session; the answering side receives it
//! through `on_data_channel`. Local candidates trickle out as transport
//! events while gathering runs.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::transport::{
    DataChannel, Transport, TransportEvent, TransportFactory, TransportState, TransportUpdate,
};
use crate::error::SignalError;

/// Label for the single data channel each session carries.
pub const CHANNEL_LABEL: &str = "sidelink";

fn transport_err(e: webrtc::Error) -> SignalError {
    SignalError::TransportFailure(e.to_string())
}

/// Creates webrtc-backed transports, one peer connection per session.
pub struct RtcFactory {
    stun_servers: Vec<String>,
}

impl RtcFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl TransportFactory for RtcFactory {
    async fn create(
        &self,
        remote_id: &str,
        generation: u64,
        events: mpsc::Sender<TransportUpdate>,
    ) -> Result<Arc<dyn Transport>, SignalError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(transport_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media).map_err(transport_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(transport_err)?,
        );

        let transport = RtcTransport {
            emitter: Emitter {
                remote_id: remote_id.to_string(),
                generation,
                events,
            },
            pc,
            data_channel: Mutex::new(None),
        };
        transport.setup_handlers();

        Ok(Arc::new(transport))
    }
}

/// Tags every event with the owning session before queueing it.
#[derive(Clone)]
struct Emitter {
    remote_id: String,
    generation: u64,
    events: mpsc::Sender<TransportUpdate>,
}

impl Emitter {
    async fn emit(&self, event: TransportEvent) {
        let update = TransportUpdate {
            remote_id: self.remote_id.clone(),
            generation: self.generation,
            event,
        };
        if self.events.send(update).await.is_err() {
            debug!("Transport event queue closed for {}", self.remote_id);
        }
    }
}

pub struct RtcTransport {
    emitter: Emitter,
    pc: Arc<RTCPeerConnection>,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
}

impl RtcTransport {
    fn setup_handlers(&self) {
        let emitter = self.emitter.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let emitter = emitter.clone();
                Box::pin(async move {
                    let Some(c) = candidate else { return };
                    match c.to_json() {
                        Ok(init) => {
                            emitter
                                .emit(TransportEvent::LocalCandidate {
                                    candidate: init.candidate,
                                    mid: init.sdp_mid,
                                })
                                .await;
                        }
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let emitter = self.emitter.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let emitter = emitter.clone();
                Box::pin(async move {
                    debug!("Peer connection to {}: {:?}", emitter.remote_id, state);
                    let mapped = match state {
                        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                        _ => None,
                    };
                    if let Some(mapped) = mapped {
                        emitter.emit(TransportEvent::StateChanged(mapped)).await;
                    }
                })
            }));

        // Inbound channel, answering side only.
        let emitter = self.emitter.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let emitter = emitter.clone();
                Box::pin(async move {
                    debug!(
                        "Data channel '{}' from {} received",
                        dc.label(),
                        emitter.remote_id
                    );
                    wire_channel(dc, emitter);
                })
            }));
    }
}

/// Hook up open/message/close handlers for one data channel, whichever side
/// created it.
fn wire_channel(dc: Arc<RTCDataChannel>, emitter: Emitter) {
    let open_emitter = emitter.clone();
    let open_dc = dc.clone();
    dc.on_open(Box::new(move || {
        let emitter = open_emitter.clone();
        let handle: Arc<dyn DataChannel> = Arc::new(RtcChannel {
            dc: open_dc.clone(),
        });
        Box::pin(async move {
            emitter.emit(TransportEvent::ChannelOpen(handle)).await;
        })
    }));

    let msg_emitter = emitter.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let emitter = msg_emitter.clone();
        Box::pin(async move {
            if !msg.is_string {
                debug!(
                    "Ignoring {} byte binary frame from {}",
                    msg.data.len(),
                    emitter.remote_id
                );
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => emitter.emit(TransportEvent::Message(text)).await,
                Err(e) => debug!("Non-UTF-8 text frame from {}: {}", emitter.remote_id, e),
            }
        })
    }));

    dc.on_close(Box::new(move || {
        let emitter = emitter.clone();
        Box::pin(async move {
            emitter.emit(TransportEvent::ChannelClosed).await;
        })
    }));
}

#[async_trait]
impl Transport for RtcTransport {
    async fn create_local_offer(&self) -> Result<String, SignalError> {
        let dc = self
            .pc
            .create_data_channel(CHANNEL_LABEL, None)
            .await
            .map_err(transport_err)?;
        wire_channel(dc.clone(), self.emitter.clone());
        *self.data_channel.lock().await = Some(dc);

        let offer = self.pc.create_offer(None).await.map_err(transport_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(transport_err)?;
        Ok(offer.sdp)
    }

    async fn create_local_answer(&self, remote_description: &str) -> Result<String, SignalError> {
        let offer =
            RTCSessionDescription::offer(remote_description.to_string()).map_err(transport_err)?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(transport_err)?;

        let answer = self.pc.create_answer(None).await.map_err(transport_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(transport_err)?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, description: &str) -> Result<(), SignalError> {
        let answer =
            RTCSessionDescription::answer(description.to_string()).map_err(transport_err)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(transport_err)
    }

    async fn add_remote_candidate(
        &self,
        candidate: &str,
        mid: Option<&str>,
    ) -> Result<(), SignalError> {
        if candidate.is_empty() {
            return Ok(());
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: mid.map(|m| m.to_string()),
            sdp_mline_index: None,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(transport_err)
    }

    async fn close(&self) {
        if let Some(dc) = self.data_channel.lock().await.take() {
            if let Err(e) = dc.close().await {
                debug!("Data channel close: {}", e);
            }
        }
        if let Err(e) = self.pc.close().await {
            debug!("Peer connection close: {}", e);
        }
    }
}

/// Registry handle over an open webrtc data channel.
pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    async fn send_text(&self, text: &str) -> Result<(), SignalError> {
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(transport_err)
    }

    async fn close(&self) -> Result<(), SignalError> {
        self.dc.close().await.map_err(transport_err)
    }
}
