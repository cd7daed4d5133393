//! Load bridge config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::host::HostConfig;

/// Bridge configuration. File: `$PEERLINK_CONFIG`, ~/.config/peerlink/config.toml or
/// /etc/peerlink/config.toml. Env overrides: PEERLINK_WORKER_THREADS, PEERLINK_DIAL_TIMEOUT_MS,
/// PEERLINK_IO_TIMEOUT_MS, PEERLINK_LISTEN_TIMEOUT_MS, PEERLINK_IDLE_TIMEOUT_SECS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Runtime worker threads driving swarms and inbound dispatch (default 2).
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Outbound stream establishment deadline, dial plus negotiation (default 30 s).
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Per-call read/write deadline; 0 blocks until the peer or transport acts (default 0).
    #[serde(default)]
    pub io_timeout_ms: u64,
    /// How long host construction waits for listeners to bind (default 5 s).
    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u64,
    /// Idle connections are closed after this long (default 60 s).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_worker_threads() -> usize {
    2
}
fn default_dial_timeout_ms() -> u64 {
    30_000
}
fn default_listen_timeout_ms() -> u64 {
    5_000
}
fn default_idle_timeout_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            dial_timeout_ms: default_dial_timeout_ms(),
            io_timeout_ms: 0,
            listen_timeout_ms: default_listen_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Config {
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            listen_timeout: Duration::from_millis(self.listen_timeout_ms),
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            idle_connection_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout_ms > 0).then(|| Duration::from_millis(self.io_timeout_ms))
    }

    /// Apply `PEERLINK_*` overrides from `var`. Unparseable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(n) = var("PEERLINK_WORKER_THREADS").and_then(|s| s.parse::<usize>().ok()) {
            if n > 0 {
                self.worker_threads = n;
            }
        }
        if let Some(ms) = var("PEERLINK_DIAL_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.dial_timeout_ms = ms;
        }
        if let Some(ms) = var("PEERLINK_IO_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.io_timeout_ms = ms;
        }
        if let Some(ms) = var("PEERLINK_LISTEN_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.listen_timeout_ms = ms;
        }
        if let Some(secs) = var("PEERLINK_IDLE_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            self.idle_timeout_secs = secs;
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("PEERLINK_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring bad config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("dial_timeout_ms = 500\nio_timeout_ms = 250\n").unwrap();
        assert_eq!(c.dial_timeout_ms, 500);
        assert_eq!(c.io_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(c.worker_threads, 2);
        assert_eq!(c.host_config().listen_timeout, Duration::from_secs(5));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_and_ignores_garbage() {
        let env: HashMap<&str, &str> = [
            ("PEERLINK_WORKER_THREADS", "0"),
            ("PEERLINK_DIAL_TIMEOUT_MS", "1200"),
            ("PEERLINK_IO_TIMEOUT_MS", "soon"),
            ("PEERLINK_IDLE_TIMEOUT_SECS", "5"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.worker_threads, 2);
        assert_eq!(c.dial_timeout_ms, 1200);
        assert_eq!(c.io_timeout(), None);
        assert_eq!(c.host_config().idle_connection_timeout, Duration::from_secs(5));
    }
}
