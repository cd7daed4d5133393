//! Handle-based bridge between a foreign managed runtime and libp2p.
//! Native objects (hosts, peer ids, address lists, peerstores, streams) stay on this side;
//! the foreign side only ever holds integer handles.

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod ffi;
pub mod handle;
pub mod host;
pub mod logging;
pub mod option;
pub mod peerstore;
pub mod stream;

mod swarm;

pub use bridge::{Bridge, BridgeError};
pub use config::Config;
pub use dispatch::{
    CallbackSink, DeliveryError, Dispatcher, Mailboxes, MessageSink, Notification, ProcessEndpoint,
};
pub use handle::{Handle, HandleError, Registry};
pub use host::{Host, HostConfig, HostError};
pub use option::{HostOption, HostOptions, OptionError};
pub use peerstore::{Peerstore, Ttl, PERMANENT_ADDR_TTL};
pub use stream::StreamObject;
