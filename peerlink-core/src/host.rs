//! Host: one libp2p node (identity, listeners, peerstore, protocol handlers) behind a host handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use tokio::runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::option::HostOptions;
use crate::peerstore::Peerstore;
use crate::stream::StreamObject;
use crate::swarm::{self, Command};

/// Called on a runtime worker for every inbound stream under the protocol it was registered for.
/// Must return promptly.
pub type InboundHandler = Arc<dyn Fn(StreamObject) + Send + Sync>;

/// Timeouts applied by a host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub listen_timeout: Duration,
    pub dial_timeout: Duration,
    pub idle_connection_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(30),
            idle_connection_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("transport setup failed: {0}")]
    Transport(String),
    #[error("listen failed: {0}")]
    Listen(String),
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("no known addresses for peer {0}")]
    NoAddresses(PeerId),
    #[error("stream negotiation failed: {0}")]
    OpenStream(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol {0} is already registered")]
    AlreadyRegistered(StreamProtocol),
    #[error("host is closed")]
    Closed,
}

pub struct Host {
    peer_id: PeerId,
    peerstore: Peerstore,
    control: libp2p_stream::Control,
    commands: mpsc::UnboundedSender<Command>,
    handlers: Arc<Mutex<HashMap<StreamProtocol, InboundHandler>>>,
    accept_tasks: Mutex<HashMap<StreamProtocol, JoinHandle<()>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    runtime: runtime::Handle,
    dial_timeout: Duration,
}

impl Host {
    /// Build the swarm, bind every requested listener and start the event loop. With no listen
    /// addresses the host is dial-only. Must run inside a tokio runtime; the host spawns its
    /// tasks on that runtime.
    pub async fn start(options: HostOptions, config: &HostConfig) -> Result<Self, HostError> {
        let keypair = options.identity.unwrap_or_else(Keypair::generate_ed25519);
        let peer_id = keypair.public().to_peer_id();
        let mut swarm = swarm::build(keypair, config.idle_connection_timeout)?;
        let control = swarm.behaviour().new_control();

        tokio::time::timeout(
            config.listen_timeout,
            swarm::listen(&mut swarm, &options.listen_addrs),
        )
        .await
        .map_err(|_| HostError::Timeout(config.listen_timeout))??;

        let (commands, rx) = mpsc::unbounded_channel();
        let runtime = runtime::Handle::current();
        let event_loop = runtime.spawn(swarm::run(swarm, rx));
        tracing::info!(%peer_id, "host started");

        Ok(Self {
            peer_id,
            peerstore: Peerstore::new(),
            control,
            commands,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            accept_tasks: Mutex::new(HashMap::new()),
            event_loop: Mutex::new(Some(event_loop)),
            runtime,
            dial_timeout: config.dial_timeout,
        })
    }

    pub fn id(&self) -> PeerId {
        self.peer_id
    }

    /// Another view of this host's peerstore.
    pub fn peerstore(&self) -> Peerstore {
        self.peerstore.clone()
    }

    /// Addresses the host is listening on, with concrete ports.
    pub async fn addrs(&self) -> Result<Vec<Multiaddr>, HostError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ListenAddrs { reply })
            .map_err(|_| HostError::Closed)?;
        rx.await.map_err(|_| HostError::Closed)
    }

    /// Route inbound streams for `protocol` to `handler`, replacing any previous handler.
    pub fn set_stream_handler(
        &self,
        protocol: StreamProtocol,
        handler: InboundHandler,
    ) -> Result<(), HostError> {
        if self.is_closed() {
            return Err(HostError::Closed);
        }
        lock(&self.handlers).insert(protocol.clone(), handler);

        let mut tasks = lock(&self.accept_tasks);
        if tasks.contains_key(&protocol) {
            return Ok(());
        }
        let incoming = self
            .control
            .clone()
            .accept(protocol.clone())
            .map_err(|_| HostError::AlreadyRegistered(protocol.clone()))?;
        let handlers = self.handlers.clone();
        let task = self
            .runtime
            .spawn(accept_loop(protocol.clone(), incoming, handlers));
        tasks.insert(protocol, task);
        Ok(())
    }

    /// Stop routing `protocol`. Streams that arrive afterwards are reset. Returns whether a
    /// handler was registered.
    pub fn remove_stream_handler(&self, protocol: &StreamProtocol) -> bool {
        lock(&self.handlers).remove(protocol).is_some()
    }

    /// Connect to `peer` (dialing its peerstore addresses if needed) and negotiate `protocol`.
    pub async fn new_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<StreamObject, HostError> {
        let addrs = self.peerstore.addrs(&peer);
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { peer, addrs, reply })
            .map_err(|_| HostError::Closed)?;

        let mut control = self.control.clone();
        let negotiate = async {
            rx.await.map_err(|_| HostError::Closed)??;
            let stream = control
                .open_stream(peer, protocol.clone())
                .await
                .map_err(|e| HostError::OpenStream(e.to_string()))?;
            Ok(StreamObject::new(peer, protocol, stream))
        };
        tokio::time::timeout(self.dial_timeout, negotiate)
            .await
            .map_err(|_| HostError::Timeout(self.dial_timeout))?
    }

    /// Stop the event loop and accept tasks. Listeners and connections close with the swarm.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Shutdown);
        for (_, task) in lock(&self.accept_tasks).drain() {
            task.abort();
        }
        let event_loop = lock(&self.event_loop).take();
        if let Some(task) = event_loop {
            let _ = task.await;
        }
        tracing::info!(peer_id = %self.peer_id, "host closed");
    }

    fn is_closed(&self) -> bool {
        lock(&self.event_loop).is_none() || self.commands.is_closed()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        for (_, task) in lock(&self.accept_tasks).drain() {
            task.abort();
        }
    }
}

async fn accept_loop(
    protocol: StreamProtocol,
    mut incoming: libp2p_stream::IncomingStreams,
    handlers: Arc<Mutex<HashMap<StreamProtocol, InboundHandler>>>,
) {
    while let Some((peer, stream)) = incoming.next().await {
        let handler = lock(&handlers).get(&protocol).cloned();
        match handler {
            Some(handler) => handler(StreamObject::new(peer, protocol.clone(), stream)),
            None => tracing::debug!(%peer, %protocol, "no handler registered, resetting stream"),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::HostOption;
    use crate::peerstore::Ttl;
    use libp2p::multiaddr::Protocol;

    fn loopback() -> HostOptions {
        HostOptions::collect(&[HostOption::listen_addr_strings(&["/ip4/127.0.0.1/tcp/0"]).unwrap()])
    }

    fn tcp_port(addr: &Multiaddr) -> Option<u16> {
        addr.iter().find_map(|p| match p {
            Protocol::Tcp(port) => Some(port),
            _ => None,
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listener_reports_bound_port() {
        let host = Host::start(loopback(), &HostConfig::default()).await.unwrap();
        let addrs = host.addrs().await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(tcp_port(&addrs[0]).unwrap() > 0);
        host.close().await;
        assert!(matches!(host.addrs().await, Err(HostError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inbound_stream_reaches_handler() {
        let a = Host::start(loopback(), &HostConfig::default()).await.unwrap();
        let b = Host::start(loopback(), &HostConfig::default()).await.unwrap();
        let proto = StreamProtocol::new("/test/1.0.0");

        let (tx, mut rx) = mpsc::unbounded_channel();
        a.set_stream_handler(
            proto.clone(),
            Arc::new(move |s: StreamObject| {
                let _ = tx.send(s);
            }),
        )
        .unwrap();

        b.peerstore()
            .add_addrs(a.id(), &a.addrs().await.unwrap(), Ttl::Permanent);
        let out = b.new_stream(a.id(), proto.clone()).await.unwrap();
        assert_eq!(out.peer(), a.id());
        assert_eq!(out.write(b"ping", None).await.unwrap(), 4);

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.peer(), b.id());
        assert_eq!(inbound.protocol(), &proto);
        let mut buf = [0u8; 16];
        let n = inbound.read(&mut buf, None).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        a.close().await;
        b.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_wakes_pending_read() {
        let a = Host::start(loopback(), &HostConfig::default()).await.unwrap();
        let b = Host::start(loopback(), &HostConfig::default()).await.unwrap();
        let proto = StreamProtocol::new("/test/1.0.0");
        let (tx, mut rx) = mpsc::unbounded_channel();
        a.set_stream_handler(
            proto.clone(),
            Arc::new(move |s: StreamObject| {
                let _ = tx.send(s);
            }),
        )
        .unwrap();
        b.peerstore()
            .add_addrs(a.id(), &a.addrs().await.unwrap(), Ttl::Permanent);
        let out = b.new_stream(a.id(), proto).await.unwrap();
        out.write(b"hi", None).await.unwrap();

        let inbound = Arc::new(rx.recv().await.unwrap());
        let mut buf = [0u8; 8];
        let n = inbound.read(&mut buf, None).await.unwrap();
        assert_eq!(&buf[..n], b"hi");

        let pending = {
            let s = inbound.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                s.read(&mut buf, None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        inbound.close().await.unwrap();
        let res = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("read still pending after close")
            .unwrap();
        assert_eq!(res.unwrap_err().kind(), std::io::ErrorKind::NotConnected);
        assert!(inbound.is_closed());
        assert!(format!("{:?}", inbound).contains("closed: true"));
        assert_eq!(
            inbound.write(b"x", None).await.unwrap_err().kind(),
            std::io::ErrorKind::NotConnected
        );
        inbound.close().await.unwrap();

        a.close().await;
        b.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn new_stream_without_addresses_fails() {
        let host = Host::start(loopback(), &HostConfig::default()).await.unwrap();
        let err = host
            .new_stream(PeerId::random(), StreamProtocol::new("/test/1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::NoAddresses(_)));
        host.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_can_be_replaced() {
        let host = Host::start(loopback(), &HostConfig::default()).await.unwrap();
        let proto = StreamProtocol::new("/test/1.0.0");
        host.set_stream_handler(proto.clone(), Arc::new(|_| {})).unwrap();
        host.set_stream_handler(proto.clone(), Arc::new(|_| {})).unwrap();
        assert!(host.remove_stream_handler(&proto));
        assert!(!host.remove_stream_handler(&proto));
        host.close().await;
        assert!(matches!(
            host.set_stream_handler(proto, Arc::new(|_| {})),
            Err(HostError::Closed)
        ));
    }
}
