//! Configuration surface consumed by the dispatch core.
//!
//! Binaries assemble a [`DispatchConfig`] from CLI flags, optionally
//! overlaid on a JSON file with the same shape. Validation happens once,
//! up front; a bad configuration is fatal to the process.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::WireFormat;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which wait policy an executor runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicyKind {
    /// Wait for every expected item.
    Complete,
    /// Deadline derived from the time to the first k returns.
    Factor,
    /// Fixed deadline per submission.
    Fixed,
    /// Factor-style deadline, then re-push clones of stragglers.
    ResubmitIncomplete,
}

impl std::str::FromStr for WaitPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "complete" => Ok(WaitPolicyKind::Complete),
            "factor" => Ok(WaitPolicyKind::Factor),
            "fixed" => Ok(WaitPolicyKind::Fixed),
            "resubmit_incomplete" | "resubmit" => Ok(WaitPolicyKind::ResubmitIncomplete),
            other => Err(format!("unknown wait policy: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Capacity of each side of every buffer port.
    pub port_capacity: usize,
    /// How long a consumer's pull blocks when every port is empty.
    pub dispatch_timeout_ms: u64,
    /// How long the broker blocks on a full processed queue before dropping
    /// the item.
    pub processed_push_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port_capacity: 128,
            dispatch_timeout_ms: 200,
            processed_push_timeout_ms: 1_000,
        }
    }
}

impl BrokerConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn processed_push_timeout(&self) -> Duration {
        Duration::from_millis(self.processed_push_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    pub wait_policy: WaitPolicyKind,
    /// Deadline multiplier for the factor policies.
    pub wait_factor: f64,
    /// Deadline for the fixed policy. Also the base deadline of the factor
    /// policies while no returns have been sampled yet.
    pub wait_fixed_ms: u64,
    /// Returns to sample before deriving a factor deadline.
    /// 0 means `max(1, submission_size / 10)`.
    pub first_k: usize,
    /// Lower bound on any factor-derived deadline.
    pub wait_min_ms: u64,
    /// Optional ceiling on any factor-derived deadline.
    pub wait_max_ms: Option<u64>,
    /// Maximum re-push rounds under `resubmit_incomplete`.
    pub resubmit_cap: u32,
    /// Deadline extension granted per re-push round.
    pub resubmit_extend_ms: u64,
    /// How long a raw-queue push may block before the item is flagged with
    /// backpressure.
    pub push_timeout_ms: u64,
    /// Pool size for the threaded executor. 0 means the number of CPUs.
    pub threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            wait_policy: WaitPolicyKind::Complete,
            wait_factor: 2.0,
            wait_fixed_ms: 5_000,
            first_k: 0,
            wait_min_ms: 10,
            wait_max_ms: None,
            resubmit_cap: 3,
            resubmit_extend_ms: 1_000,
            push_timeout_ms: 5_000,
            threads: 0,
        }
    }
}

impl ExecutorConfig {
    pub fn wait_fixed(&self) -> Duration {
        Duration::from_millis(self.wait_fixed_ms)
    }

    pub fn wait_min(&self) -> Duration {
        Duration::from_millis(self.wait_min_ms)
    }

    pub fn wait_max(&self) -> Option<Duration> {
        self.wait_max_ms.map(Duration::from_millis)
    }

    pub fn resubmit_extend(&self) -> Duration {
        Duration::from_millis(self.resubmit_extend_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Worker threads of the server's I/O runtime.
    pub threads: usize,
    /// Serialization format this server speaks.
    pub format: WireFormat,
    /// Broker wait budget for each work request.
    pub request_wait_ms: u64,
    /// Idle sessions are closed after this long without a frame.
    pub session_timeout_ms: u64,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 10_000,
            threads: 4,
            format: WireFormat::Binary,
            request_wait_ms: 500,
            session_timeout_ms: 60_000,
        }
    }
}

impl TcpServerConfig {
    pub fn request_wait(&self) -> Duration {
        Duration::from_millis(self.request_wait_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpClientConfig {
    /// `host:port` of the server to work for.
    pub server_addr: String,
    /// Format preference sent at handshake; the server's answer wins.
    pub format: WireFormat,
    /// Reconnect attempts before giving up. 0 means unlimited.
    pub reconnect_max: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Consecutive NODATA replies before a clean exit. 0 means unlimited.
    pub stall_cap: u32,
    /// Items to process before a clean exit. 0 means unlimited.
    pub max_items: u64,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:10000".to_string(),
            format: WireFormat::Binary,
            reconnect_max: 10,
            backoff_base_ms: 50,
            backoff_cap_ms: 5_000,
            stall_cap: 0,
            max_items: 0,
        }
    }
}

impl TcpClientConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

/// Everything the dispatch core reads, in one place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub broker: BrokerConfig,
    pub executor: ExecutorConfig,
    pub tcp: TcpServerConfig,
    pub client: TcpClientConfig,
}

impl DispatchConfig {
    /// Load from a JSON file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.port_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broker.port_capacity must be >= 1".to_string(),
            ));
        }
        if self.executor.wait_factor < 1.0 || !self.executor.wait_factor.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "executor.wait_factor must be a finite value >= 1.0 (got {})",
                self.executor.wait_factor
            )));
        }
        if self.executor.wait_fixed_ms == 0 {
            return Err(ConfigError::Invalid(
                "executor.wait_fixed_ms must be >= 1".to_string(),
            ));
        }
        if let Some(max) = self.executor.wait_max_ms {
            if max < self.executor.wait_min_ms {
                return Err(ConfigError::Invalid(
                    "executor.wait_max_ms must be >= executor.wait_min_ms".to_string(),
                ));
            }
        }
        if self.tcp.threads == 0 {
            return Err(ConfigError::Invalid(
                "consumer.tcp.threads must be >= 1".to_string(),
            ));
        }
        if self.client.backoff_base_ms == 0 {
            return Err(ConfigError::Invalid(
                "client.backoff_base_ms must be >= 1".to_string(),
            ));
        }
        if self.client.backoff_cap_ms < self.client.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "client.backoff_cap_ms must be >= client.backoff_base_ms".to_string(),
            ));
        }
        Ok(())
    }
}
