//! Swarm event loop: owns the libp2p swarm for one host and serves commands from the host façade.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{DialError, SwarmEvent};
use libp2p::{identity::Keypair, noise, tcp, yamux, Multiaddr, PeerId, Swarm};
use tokio::sync::{mpsc, oneshot};

use crate::host::HostError;

pub(crate) type HostSwarm = Swarm<libp2p_stream::Behaviour>;

/// Requests from the host façade to its event loop.
pub(crate) enum Command {
    /// Ensure a connection to `peer` exists, dialing `addrs` if needed.
    Connect {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), HostError>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Shutdown,
}

pub(crate) fn build(keypair: Keypair, idle_timeout: Duration) -> Result<HostSwarm, HostError> {
    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| HostError::Transport(e.to_string()))?
        .with_behaviour(|_| libp2p_stream::Behaviour::new())
        .map_err(|e| HostError::Transport(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
        .build();
    Ok(swarm)
}

/// Start listening on `addrs` and drive the swarm until each listener has reported at least one
/// bound address.
pub(crate) async fn listen(swarm: &mut HostSwarm, addrs: &[Multiaddr]) -> Result<(), HostError> {
    let mut waiting: HashSet<ListenerId> = HashSet::new();
    for addr in addrs {
        let id = swarm
            .listen_on(addr.clone())
            .map_err(|e| HostError::Listen(format!("{}: {}", addr, e)))?;
        waiting.insert(id);
    }
    while !waiting.is_empty() {
        match swarm.select_next_some().await {
            SwarmEvent::NewListenAddr {
                listener_id,
                address,
            } => {
                tracing::debug!(%address, "listening");
                waiting.remove(&listener_id);
            }
            SwarmEvent::ListenerError { error, .. } => {
                return Err(HostError::Listen(error.to_string()));
            }
            SwarmEvent::ListenerClosed { reason, .. } => {
                let why = match reason {
                    Ok(()) => "listener closed".to_string(),
                    Err(e) => e.to_string(),
                };
                return Err(HostError::Listen(why));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Run until `Shutdown` arrives or every command sender is gone. Dropping the swarm closes all
/// listeners and connections.
pub(crate) async fn run(mut swarm: HostSwarm, mut commands: mpsc::UnboundedReceiver<Command>) {
    let local = *swarm.local_peer_id();
    let mut pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), HostError>>>> =
        HashMap::new();
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Connect { peer, addrs, reply }) => {
                    connect(&mut swarm, &mut pending_dials, peer, addrs, reply);
                }
                Some(Command::ListenAddrs { reply }) => {
                    let _ = reply.send(swarm.listeners().cloned().collect());
                }
                Some(Command::Shutdown) | None => break,
            },
            event = swarm.select_next_some() => match event {
                SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                    tracing::debug!(%peer_id, "connection established");
                    for reply in pending_dials.remove(&peer_id).unwrap_or_default() {
                        let _ = reply.send(Ok(()));
                    }
                }
                SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
                    tracing::debug!(%peer_id, %error, "dial failed");
                    // Another address may already have connected us.
                    if !swarm.is_connected(&peer_id) {
                        for reply in pending_dials.remove(&peer_id).unwrap_or_default() {
                            let _ = reply.send(Err(HostError::Dial(error.to_string())));
                        }
                    }
                }
                SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                    tracing::debug!(%peer_id, ?cause, "connection closed");
                }
                SwarmEvent::ListenerError { error, .. } => {
                    tracing::warn!(%error, "listener error");
                }
                _ => {}
            },
        }
    }
    for (_, replies) in pending_dials.drain() {
        for reply in replies {
            let _ = reply.send(Err(HostError::Closed));
        }
    }
    tracing::debug!(peer_id = %local, "host event loop stopped");
}

fn connect(
    swarm: &mut HostSwarm,
    pending_dials: &mut HashMap<PeerId, Vec<oneshot::Sender<Result<(), HostError>>>>,
    peer: PeerId,
    addrs: Vec<Multiaddr>,
    reply: oneshot::Sender<Result<(), HostError>>,
) {
    if swarm.is_connected(&peer) {
        let _ = reply.send(Ok(()));
        return;
    }
    if pending_dials.contains_key(&peer) {
        pending_dials.entry(peer).or_default().push(reply);
        return;
    }
    if addrs.is_empty() {
        let _ = reply.send(Err(HostError::NoAddresses(peer)));
        return;
    }
    match swarm.dial(DialOpts::peer_id(peer).addresses(addrs).build()) {
        Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
            pending_dials.entry(peer).or_default().push(reply);
        }
        Err(e) => {
            let _ = reply.send(Err(HostError::Dial(e.to_string())));
        }
    }
}
