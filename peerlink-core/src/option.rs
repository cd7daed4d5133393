//! Host construction options. Each option is registered as its own handle and folded together by
//! [`HostOptions::collect`] when a host is built.

use libp2p::identity::{self, Keypair};
use libp2p::Multiaddr;

/// One construction option for a [`crate::Host`].
#[derive(Debug, Clone)]
pub enum HostOption {
    /// Listen on every listed address.
    ListenAddrs(Vec<Multiaddr>),
    /// Use this identity instead of a freshly generated one.
    Identity(Keypair),
}

/// Error building an option from boundary input.
#[derive(Debug, thiserror::Error)]
pub enum OptionError {
    #[error("invalid multiaddr {addr:?}: {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: libp2p::multiaddr::Error,
    },
    #[error("invalid ed25519 secret: {0}")]
    InvalidIdentity(#[from] identity::DecodingError),
}

impl HostOption {
    /// Listen on the given multiaddr strings.
    pub fn listen_addr_strings<S: AsRef<str>>(addrs: &[S]) -> Result<Self, OptionError> {
        parse_addrs(addrs).map(HostOption::ListenAddrs)
    }

    /// Host identity from a 32-byte ed25519 secret.
    pub fn ed25519_identity(mut secret: [u8; 32]) -> Result<Self, OptionError> {
        let keypair = Keypair::ed25519_from_bytes(&mut secret)?;
        Ok(HostOption::Identity(keypair))
    }
}

/// Parse a list of multiaddr strings, failing on the first bad one.
pub fn parse_addrs<S: AsRef<str>>(addrs: &[S]) -> Result<Vec<Multiaddr>, OptionError> {
    addrs
        .iter()
        .map(|s| {
            let s = s.as_ref();
            s.parse::<Multiaddr>()
                .map_err(|source| OptionError::InvalidAddress {
                    addr: s.to_string(),
                    source,
                })
        })
        .collect()
}

/// All options for one host, merged. Later identities win; listen addresses accumulate.
#[derive(Debug, Default)]
pub struct HostOptions {
    pub listen_addrs: Vec<Multiaddr>,
    pub identity: Option<Keypair>,
}

impl HostOptions {
    pub fn collect<'a, I>(options: I) -> Self
    where
        I: IntoIterator<Item = &'a HostOption>,
    {
        let mut out = HostOptions::default();
        for opt in options {
            match opt {
                HostOption::ListenAddrs(addrs) => out.listen_addrs.extend(addrs.iter().cloned()),
                HostOption::Identity(kp) => out.identity = Some(kp.clone()),
            }
        }
        out
    }
}
