use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sidelink::peer::{identity, query_peers, PeerNotice, RtcFactory, SessionManager};
use sidelink::{start_relay, Config};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "sidelink")]
#[command(about = "Peer-to-peer data channels over a rendezvous relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Bind address, e.g. 127.0.0.1:8081
        #[arg(long)]
        addr: Option<String>,
    },
    /// Run a peer with an interactive prompt
    Peer {
        /// Relay URL, e.g. ws://127.0.0.1:8081
        #[arg(long)]
        relay_url: Option<String>,
        /// Use a fixed identifier instead of generating one
        #[arg(long)]
        id: Option<String>,
        /// Peers to offer connections to at startup
        #[arg(long)]
        connect: Vec<String>,
    },
    /// List peers currently bound to the relay
    Peers {
        #[arg(long)]
        relay_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sidelink=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Relay { addr } => {
            let addr = addr.unwrap_or(config.relay.bind_address);
            let addr = addr.parse().context("Invalid relay bind address")?;
            let relay = start_relay(addr).await?;
            println!("Signaling relay: ws://{}/<id>", relay.addr);
            println!("Discovery query: http://{}/peers", relay.addr);
            tokio::signal::ctrl_c().await?;
            relay.shutdown();
        }
        Commands::Peer {
            relay_url,
            id,
            connect,
        } => {
            let mut peer_config = config.peer;
            if let Some(url) = relay_url {
                peer_config.relay_url = url;
            }

            let local_id = id.unwrap_or_else(|| identity::generate(peer_config.id_length));
            let relay_url = peer_config.relay_url.clone();
            let factory = Arc::new(RtcFactory::new(peer_config.stun_servers.clone()));
            let mut manager = SessionManager::new(&local_id, peer_config, factory)
                .context("Invalid peer identifier")?;
            let handle = manager.handle();
            let mut notices = manager.take_notices().expect("notices already taken");

            println!("The local ID is: {}", local_id);
            println!("Relay: {}", relay_url);

            let manager_task = tokio::spawn(async move { manager.run().await });

            // Surface notices; greet a peer once its channel opens.
            let notice_handle = handle.clone();
            let greeting = format!("hello from {}", local_id);
            tokio::spawn(async move {
                while let Some(notice) = notices.recv().await {
                    match notice {
                        PeerNotice::Connected { peer } => {
                            println!("Connected to {}", peer);
                            let _ = notice_handle.send_to(&peer, &greeting).await;
                        }
                        PeerNotice::Message { peer, text } => {
                            println!("Message from {}: {}", peer, text);
                        }
                        PeerNotice::Disconnected { peer } => {
                            println!("Peer {} disconnected", peer);
                        }
                        PeerNotice::Unreachable { peer } => {
                            println!("Peer {} unreachable", peer);
                        }
                        PeerNotice::NegotiationTimedOut { peer } => {
                            println!("Negotiation with {} timed out", peer);
                        }
                    }
                }
            });

            for peer in connect {
                match handle.connect_to(&peer).await {
                    Ok(()) => println!("Offering connection to: {}", peer),
                    Err(e) => eprintln!("Connect to {} failed: {}", peer, e),
                }
            }

            println!("Commands: /connect <id>, /peers, anything else broadcasts");

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    line = lines.next_line() => {
                        let Some(line) = line? else { break };
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if let Some(peer) = line.strip_prefix("/connect ") {
                            let peer = peer.trim();
                            match handle.connect_to(peer).await {
                                Ok(()) => println!("Offering connection to: {}", peer),
                                Err(e) => eprintln!("{}", e),
                            }
                        } else if line == "/peers" {
                            match query_peers(&relay_url).await {
                                Ok(peers) => println!("Known peers: {}", peers.join(", ")),
                                Err(e) => eprintln!("Discovery query failed: {}", e),
                            }
                        } else {
                            match handle.broadcast(line).await {
                                Ok(count) => println!("Sent to {} peers", count),
                                Err(e) => eprintln!("{}", e),
                            }
                        }
                    }
                }
            }

            manager_task.abort();
        }
        Commands::Peers { relay_url } => {
            let url = relay_url.unwrap_or(config.peer.relay_url);
            let peers = query_peers(&url).await?;
            if peers.is_empty() {
                println!("No peers connected");
            } else {
                for peer in peers {
                    println!("{}", peer);
                }
            }
        }
    }

    Ok(())
}
