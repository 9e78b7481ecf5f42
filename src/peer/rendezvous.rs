//! Rendezvous channel to the signaling relay
//!
//! A single WebSocket connection per peer process, addressed by embedding the
//! local identifier in the URL path. Outbound envelopes are fire-and-forget
//! from the manager's viewpoint; inbound envelopes are queued to the manager
//! loop. Also hosts the one discovery query the relay exposes.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::envelope::Envelope;

/// Connect to the relay and pump envelopes both ways until the socket or the
/// process shuts down. Returns when the channel is no longer usable; the
/// manager treats that as loss of signaling, not of established sessions.
pub async fn run_channel(
    relay_url: String,
    local_id: String,
    incoming: mpsc::Sender<Envelope>,
    mut outgoing: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let url = channel_url(&relay_url, &local_id);
    info!("Connecting to relay: {}", url);

    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("relay connect failed: {url}"))?;
    let (mut write, mut read) = ws_stream.split();

    info!("Rendezvous channel open as {}", local_id);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
            Some(envelope) = outgoing.recv() => {
                let text = serde_json::to_string(&envelope)?;
                if write.send(Message::Text(text)).await.is_err() {
                    warn!("Rendezvous channel write failed");
                    break;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) => {
                                if incoming.send(envelope).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!("Dropping unparseable envelope: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("Rendezvous channel closed by relay");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Rendezvous channel error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Query the relay for the currently bound peer identifiers.
pub async fn query_peers(relay_url: &str) -> Result<Vec<String>> {
    let url = peers_url(relay_url)?;
    let peers = reqwest::get(url)
        .await
        .context("discovery query failed")?
        .json::<Vec<String>>()
        .await
        .context("discovery response was not a peer list")?;
    Ok(peers)
}

fn channel_url(relay_url: &str, local_id: &str) -> String {
    format!("{}/{}", relay_url.trim_end_matches('/'), local_id)
}

fn peers_url(relay_url: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(relay_url).context("invalid relay url")?;
    let scheme = match url.scheme() {
        "wss" => "https",
        _ => "http",
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("relay url scheme not rewritable: {relay_url}"))?;
    url.set_path("/peers");
    Ok(url)
}
