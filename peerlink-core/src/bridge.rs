//! Capability façade: every operation takes and returns only handles and primitives.
//!
//! Operations block the calling thread until the native side finishes. They are meant to be
//! called from foreign-runtime threads, never from inside the bridge's own runtime.

use std::io;
use std::str::FromStr;
use std::sync::Arc;

use libp2p::{Multiaddr, PeerId, StreamProtocol};

use crate::config::Config;
use crate::dispatch::{Dispatcher, MessageSink, ProcessEndpoint};
use crate::handle::{Handle, HandleError, Registry};
use crate::host::{Host, HostError};
use crate::option::{parse_addrs, HostOption, HostOptions, OptionError};
use crate::peerstore::{Peerstore, Ttl};
use crate::stream::StreamObject;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error(transparent)]
    Option(#[from] OptionError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("invalid protocol id {0:?}")]
    InvalidProtocol(String),
    #[error("invalid peer id {0:?}")]
    InvalidPeerId(String),
    #[error("null handle")]
    NullHandle,
    #[error("handle {handle} holds a {kind}; release it with its close operation")]
    RequiresClose { handle: Handle, kind: &'static str },
    #[error("stream i/o: {0}")]
    Io(#[from] io::Error),
    #[error("cannot start runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// Owns the handle registry, the runtime that drives every host, and the inbound dispatcher.
pub struct Bridge {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    runtime: tokio::runtime::Runtime,
    config: Config,
}

impl Bridge {
    pub fn new(config: Config, sink: Arc<dyn MessageSink>) -> Result<Self, BridgeError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("peerlink-worker")
            .enable_all()
            .build()
            .map_err(BridgeError::Runtime)?;
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(&registry, sink);
        tracing::debug!(?config, "bridge started");
        Ok(Self {
            registry,
            dispatcher,
            runtime,
            config,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // Options

    /// Option handle: listen on every address in `addrs`.
    pub fn listen_addr_strings<S: AsRef<str>>(&self, addrs: &[S]) -> Result<Handle, BridgeError> {
        let opt = HostOption::listen_addr_strings(addrs)?;
        Ok(self.registry.insert(opt)?)
    }

    /// Option handle: fixed ed25519 identity.
    pub fn identity_option(&self, secret: [u8; 32]) -> Result<Handle, BridgeError> {
        let opt = HostOption::ed25519_identity(secret)?;
        Ok(self.registry.insert(opt)?)
    }

    // Host

    /// Build a host from option handles. The option handles stay registered.
    ///
    /// Without a listen option the host binds nothing and is dial-only: it can open streams but
    /// never accepts them. Pass `/ip4/0.0.0.0/tcp/0` explicitly to listen on all interfaces.
    pub fn host_new(&self, options: &[Handle]) -> Result<Handle, BridgeError> {
        let resolved = options
            .iter()
            .map(|h| self.registry.get::<HostOption>(*h))
            .collect::<Result<Vec<_>, _>>()?;
        let opts = HostOptions::collect(resolved.iter().map(|o| &**o));
        let host = self
            .runtime
            .block_on(Host::start(opts, &self.config.host_config()))?;
        Ok(self.registry.insert(host)?)
    }

    /// Shut the host down and delete its handle. Stream handles opened through it stay registered.
    pub fn host_close(&self, host: Handle) -> Result<(), BridgeError> {
        let host = self.registry.take::<Host>(host)?;
        self.runtime.block_on(host.close());
        Ok(())
    }

    /// Fresh peer-id handle for the host's identity.
    pub fn host_id(&self, host: Handle) -> Result<Handle, BridgeError> {
        let id = self.registry.get::<Host>(host)?.id();
        Ok(self.registry.insert(id)?)
    }

    /// Fresh address-list handle with the host's bound listen addresses.
    pub fn host_addrs(&self, host: Handle) -> Result<Handle, BridgeError> {
        let host = self.registry.get::<Host>(host)?;
        let addrs = self.runtime.block_on(host.addrs())?;
        Ok(self.registry.insert(addrs)?)
    }

    /// Fresh peerstore handle viewing the host's peerstore.
    pub fn host_peerstore(&self, host: Handle) -> Result<Handle, BridgeError> {
        let ps = self.registry.get::<Host>(host)?.peerstore();
        Ok(self.registry.insert(ps)?)
    }

    /// Deliver every inbound stream under `protocol` to `endpoint` as a new stream handle.
    /// Replaces the previous endpoint for that protocol.
    pub fn set_stream_handler(
        &self,
        host: Handle,
        protocol: &str,
        endpoint: ProcessEndpoint,
    ) -> Result<(), BridgeError> {
        let host = self.registry.get::<Host>(host)?;
        let protocol = parse_protocol(protocol)?;
        let dispatcher = self.dispatcher.clone();
        host.set_stream_handler(
            protocol,
            Arc::new(move |stream: StreamObject| {
                dispatcher.dispatch(endpoint, stream);
            }),
        )?;
        Ok(())
    }

    /// Returns whether a handler was registered for `protocol`.
    pub fn remove_stream_handler(&self, host: Handle, protocol: &str) -> Result<bool, BridgeError> {
        let host = self.registry.get::<Host>(host)?;
        let protocol = parse_protocol(protocol)?;
        Ok(host.remove_stream_handler(&protocol))
    }

    /// Open a stream to `peer` under `protocol`, dialing addresses from the host's peerstore.
    pub fn new_stream(
        &self,
        host: Handle,
        peer: Handle,
        protocol: &str,
    ) -> Result<Handle, BridgeError> {
        let host = self.registry.get::<Host>(host)?;
        let peer = *self.registry.get::<PeerId>(peer)?;
        let protocol = parse_protocol(protocol)?;
        let stream = self.runtime.block_on(host.new_stream(peer, protocol))?;
        Ok(self.registry.insert(stream)?)
    }

    // Peerstore

    /// Merge the listed addresses into the peer's entry. `ttl_nanos` may be
    /// [`crate::PERMANENT_ADDR_TTL`].
    pub fn peerstore_add_addrs(
        &self,
        peerstore: Handle,
        peer: Handle,
        addrs: Handle,
        ttl_nanos: u64,
    ) -> Result<(), BridgeError> {
        let ps = self.registry.get::<Peerstore>(peerstore)?;
        let peer = *self.registry.get::<PeerId>(peer)?;
        let addrs = self.registry.get::<Vec<Multiaddr>>(addrs)?;
        ps.add_addrs(peer, &addrs, Ttl::from_nanos(ttl_nanos));
        Ok(())
    }

    /// Fresh address-list handle with the peer's unexpired addresses.
    pub fn peerstore_addrs(&self, peerstore: Handle, peer: Handle) -> Result<Handle, BridgeError> {
        let ps = self.registry.get::<Peerstore>(peerstore)?;
        let peer = self.registry.get::<PeerId>(peer)?;
        Ok(self.registry.insert(ps.addrs(&peer))?)
    }

    // Values

    pub fn peer_id_from_string(&self, s: &str) -> Result<Handle, BridgeError> {
        let id = PeerId::from_str(s).map_err(|_| BridgeError::InvalidPeerId(s.to_string()))?;
        Ok(self.registry.insert(id)?)
    }

    pub fn peer_id_to_string(&self, peer: Handle) -> Result<String, BridgeError> {
        Ok(self.registry.get::<PeerId>(peer)?.to_base58())
    }

    pub fn addrs_from_strings<S: AsRef<str>>(&self, addrs: &[S]) -> Result<Handle, BridgeError> {
        let addrs = parse_addrs(addrs)?;
        Ok(self.registry.insert(addrs)?)
    }

    pub fn addrs_to_strings(&self, addrs: Handle) -> Result<Vec<String>, BridgeError> {
        let addrs = self.registry.get::<Vec<Multiaddr>>(addrs)?;
        Ok(addrs.iter().map(|a| a.to_string()).collect())
    }

    /// Delete a value handle (peer id, address list, peerstore, option). Hosts and streams must
    /// go through their close operation.
    pub fn release(&self, handle: Handle) -> Result<(), BridgeError> {
        if self.registry.holds::<Host>(handle) || self.registry.holds::<StreamObject>(handle) {
            let kind = self.registry.type_name(handle)?;
            return Err(BridgeError::RequiresClose { handle, kind });
        }
        Ok(self.registry.remove(handle)?)
    }

    // Streams

    /// One native read into `buf`. `Ok(0)` is end of stream.
    pub fn stream_read(&self, stream: Handle, buf: &mut [u8]) -> Result<usize, BridgeError> {
        let stream = self.registry.get::<StreamObject>(stream)?;
        let deadline = self.config.io_timeout();
        Ok(self.runtime.block_on(stream.read(buf, deadline))?)
    }

    /// One native write of `data`.
    pub fn stream_write(&self, stream: Handle, data: &[u8]) -> Result<usize, BridgeError> {
        let stream = self.registry.get::<StreamObject>(stream)?;
        let deadline = self.config.io_timeout();
        Ok(self.runtime.block_on(stream.write(data, deadline))?)
    }

    /// Delete the handle and close the stream. The handle is gone even if the close itself fails.
    pub fn stream_close(&self, stream: Handle) -> Result<(), BridgeError> {
        let stream = self.registry.take::<StreamObject>(stream)?;
        self.runtime.block_on(stream.close())?;
        Ok(())
    }
}

fn parse_protocol(s: &str) -> Result<StreamProtocol, BridgeError> {
    StreamProtocol::try_from_owned(s.to_string())
        .map_err(|_| BridgeError::InvalidProtocol(s.to_string()))
}
