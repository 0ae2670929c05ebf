//! Configuration for one shared filesystem instance.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sharefs_transport::{SendRetryConfig, TcpTransportConfig};

use crate::types::{LeaseKind, MetaError, PeerOrdinal};

/// A peer listed in the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer ordinal.
    pub ordinal: u32,
    /// Host name.
    pub name: String,
    /// Address the peer listens on.
    pub addr: String,
}

/// Lease durations and sharing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Read lease interval in seconds.
    pub read_secs: u32,
    /// Write lease interval in seconds.
    pub write_secs: u32,
    /// Append lease interval in seconds.
    pub append_secs: u32,
    /// Stage lease interval in seconds.
    pub stage_secs: u32,
    /// Let readers and writers share a resource through direct I/O instead of
    /// revoking each other.
    pub multi_host_write: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            read_secs: 30,
            write_secs: 30,
            append_secs: 30,
            stage_secs: 30,
            multi_host_write: false,
        }
    }
}

impl LeaseConfig {
    /// Interval for an expiring kind, `None` for kinds that never expire.
    pub fn interval(&self, kind: LeaseKind) -> Option<Duration> {
        let secs = match kind {
            LeaseKind::Read => self.read_secs,
            LeaseKind::Write => self.write_secs,
            LeaseKind::Append => self.append_secs,
            LeaseKind::Stage => self.stage_secs,
            LeaseKind::Truncate | LeaseKind::RecordLock | LeaseKind::Open | LeaseKind::Mmap => {
                return None
            }
        };
        Some(Duration::from_secs(u64::from(secs)))
    }

    /// Longest configured interval, at least one second.
    pub fn longest(&self) -> Duration {
        let secs = self
            .read_secs
            .max(self.write_secs)
            .max(self.append_secs)
            .max(self.stage_secs)
            .max(1);
        Duration::from_secs(u64::from(secs))
    }
}

/// Send retry tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    /// Attempts for a healthy peer.
    pub max_send_tries: u32,
    /// Attempts for a peer flagged as blocked.
    pub min_send_tries: u32,
    /// First backoff delay in milliseconds.
    pub backoff_tick_ms: u64,
    /// How long a TCP send waits for buffer space before reporting congestion.
    pub congestion_wait_ms: u64,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            max_send_tries: sharefs_transport::MAX_SEND_TRIES,
            min_send_tries: sharefs_transport::MIN_SEND_TRIES,
            backoff_tick_ms: 10,
            congestion_wait_ms: 10,
            connect_timeout_ms: 5000,
        }
    }
}

impl SendConfig {
    /// Retry settings for the messenger.
    pub fn retry(&self) -> SendRetryConfig {
        SendRetryConfig {
            max_send_tries: self.max_send_tries,
            min_send_tries: self.min_send_tries,
            tick: Duration::from_millis(self.backoff_tick_ms),
        }
    }

    /// TCP link settings.
    pub fn tcp(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            congestion_wait_ms: self.congestion_wait_ms,
            nodelay: true,
        }
    }
}

/// Configuration of one mounted filesystem instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Filesystem name.
    pub fs_name: String,
    /// Filesystem identity stamped on every message.
    pub fs_id: u32,
    /// Filesystem generation stamped on every message.
    pub fs_generation: u32,
    /// Local ordinal.
    pub ordinal: u32,
    /// Local host name.
    pub host_name: String,
    /// Address to accept peer connections on.
    pub listen_addr: String,
    /// Ordinal of the coordinator at startup.
    pub coordinator: u32,
    /// Known peers.
    pub peers: Vec<PeerConfig>,
    /// Directory holding the persisted control blocks.
    pub state_dir: PathBuf,
    /// Lease policy.
    pub lease: LeaseConfig,
    /// Send retry policy.
    pub send: SendConfig,
    /// Seconds an `OFF_PENDING` peer gets to unmount before being forced off.
    pub off_pending_timeout_secs: u64,
    /// Sweep task period in milliseconds.
    pub sweep_interval_ms: u64,
    /// Poll period of freeze and resync waits in milliseconds.
    pub freeze_poll_ms: u64,
    /// Message handler tasks.
    pub worker_threads: usize,
    /// Messages queued ahead of the handlers before readers stall.
    pub worker_queue_depth: usize,
    /// Consecutive malformed messages tolerated before a connection is dropped.
    pub max_protocol_errors: u32,
    /// Seconds a client waits for a reply before reporting `WouldBlock`.
    pub request_timeout_secs: u64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            fs_name: "sharefs".to_string(),
            fs_id: 1,
            fs_generation: 1,
            ordinal: 1,
            host_name: "localhost".to_string(),
            listen_addr: "0.0.0.0:7105".to_string(),
            coordinator: 1,
            peers: Vec::new(),
            state_dir: PathBuf::from("/var/lib/sharefs"),
            lease: LeaseConfig::default(),
            send: SendConfig::default(),
            off_pending_timeout_secs: 20,
            sweep_interval_ms: 500,
            freeze_poll_ms: 1000,
            worker_threads: 4,
            worker_queue_depth: 256,
            max_protocol_errors: 8,
            request_timeout_secs: 45,
        }
    }
}

impl MetaConfig {
    /// Loads a `.toml` or `.json` configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: MetaConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks values the rest of the crate relies on.
    pub fn validate(&self) -> Result<(), MetaError> {
        if self.ordinal == 0 {
            return Err(MetaError::Config("ordinal 0 is reserved".to_string()));
        }
        if self.coordinator == 0 {
            return Err(MetaError::Config(
                "coordinator ordinal 0 is reserved".to_string(),
            ));
        }
        if self.host_name.is_empty() || self.fs_name.is_empty() {
            return Err(MetaError::Config(
                "host_name and fs_name must be set".to_string(),
            ));
        }
        if self.send.min_send_tries == 0 || self.send.min_send_tries > self.send.max_send_tries {
            return Err(MetaError::Config(
                "min_send_tries must be between 1 and max_send_tries".to_string(),
            ));
        }
        if let Some(peer) = self.peers.iter().find(|p| p.ordinal == 0) {
            return Err(MetaError::Config(format!(
                "peer '{}' uses reserved ordinal 0",
                peer.name
            )));
        }
        if self.worker_threads == 0 {
            return Err(MetaError::Config("worker_threads must be positive".to_string()));
        }
        Ok(())
    }

    /// Local ordinal.
    pub fn local_ordinal(&self) -> PeerOrdinal {
        PeerOrdinal::new(self.ordinal)
    }

    /// Configured peer with the given ordinal.
    pub fn peer(&self, ordinal: PeerOrdinal) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.ordinal == ordinal.as_u32())
    }

    /// Highest ordinal in the cluster.
    pub fn max_ordinal(&self) -> u32 {
        self.peers
            .iter()
            .map(|p| p.ordinal)
            .chain(std::iter::once(self.ordinal))
            .max()
            .unwrap_or(self.ordinal)
    }

    /// Sweep ticks an `OFF_PENDING` peer is allowed before it is forced off.
    pub fn off_pending_ticks(&self) -> u32 {
        let interval = self.sweep_interval_ms.max(1);
        ((self.off_pending_timeout_secs * 1000) / interval).max(1) as u32
    }

    /// Sweep task period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Freeze and resync poll period.
    pub fn freeze_poll(&self) -> Duration {
        Duration::from_millis(self.freeze_poll_ms.max(1))
    }

    /// Client reply timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
