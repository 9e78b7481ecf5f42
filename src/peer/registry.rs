//! Data-channel registry
//!
//! Maps remote peer identifiers to open data channels for unicast and
//! broadcast messaging. Entries live independently of the session lifecycle:
//! a session may linger briefly after its channel closed, and the channel
//! entry is removed the moment the transport reports the close.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::transport::DataChannel;
use crate::error::SignalError;

#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<dyn DataChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, peer_id: &str, channel: Arc<dyn DataChannel>) {
        let mut channels = self.channels.write().await;
        if channels.insert(peer_id.to_string(), channel).is_some() {
            debug!("Replaced data channel for {}", peer_id);
        }
    }

    pub async fn unregister(&self, peer_id: &str) -> bool {
        self.channels.write().await.remove(peer_id).is_some()
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<dyn DataChannel>> {
        self.channels.read().await.get(peer_id).cloned()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }

    /// Send to one peer, or report that no channel is open.
    pub async fn send_to(&self, peer_id: &str, text: &str) -> Result<(), SignalError> {
        let channel = self
            .get(peer_id)
            .await
            .ok_or_else(|| SignalError::PeerNotConnected(peer_id.to_string()))?;
        channel.send_text(text).await
    }

    /// Best-effort send to every registered channel. Continues past
    /// individual failures and returns the number of successful deliveries.
    pub async fn broadcast(&self, text: &str) -> usize {
        let channels: Vec<(String, Arc<dyn DataChannel>)> = {
            let guard = self.channels.read().await;
            guard
                .iter()
                .map(|(id, dc)| (id.clone(), dc.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (peer_id, channel) in channels {
            match channel.send_text(text).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Broadcast to {} failed: {}", peer_id, e),
            }
        }
        delivered
    }
}
