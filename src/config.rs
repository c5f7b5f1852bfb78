use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{RelayError, Result};

/// Configuration for Docker-based job execution.
///
/// Every job image is run in a sandboxed container.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Disable network access in the running container
    pub network_disabled: bool,
    /// Memory limit (e.g., "512m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "1.0")
    pub cpu_limit: Option<String>,
    /// Remove the job image after the run finishes
    pub remove_image: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            network_disabled: true,
            memory_limit: Some("512m".to_string()),
            cpu_limit: Some("1.0".to_string()),
            remove_image: true,
        }
    }
}

/// A statically configured worker, registered once at coordinator startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerEntry {
    pub id: String,
    pub address: String, // host:port
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    pub dashboard_addr: Option<SocketAddr>,
    /// Maximum number of jobs waiting for assignment
    pub queue_capacity: usize,
    /// A worker whose last heartbeat is older than this is declared unhealthy
    pub worker_timeout_ms: u64,
    /// Cadence of the control loop
    pub health_check_interval_ms: u64,
    /// Upper bound for a single AssignJob/HealthProbe/QueryJob call
    pub dispatch_timeout_ms: u64,
    /// How long a worker may stay unhealthy before it is removed
    pub removal_grace_ms: u64,
    /// Where the coordinator records terminal statuses
    pub status_dir: PathBuf,
    pub workers: Vec<WorkerEntry>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7000)),
            dashboard_addr: None,
            queue_capacity: 1024,
            worker_timeout_ms: 5000,
            health_check_interval_ms: 1000,
            dispatch_timeout_ms: 2000,
            removal_grace_ms: 60_000,
            status_dir: PathBuf::from("jobrelay-status"),
            workers: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Load settings from a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_worker(mut self, id: impl Into<String>, address: impl Into<String>) -> Self {
        self.workers.push(WorkerEntry {
            id: id.into(),
            address: address.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(RelayError::Config("queue_capacity must be positive".into()));
        }
        for (name, value) in [
            ("worker_timeout_ms", self.worker_timeout_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("dispatch_timeout_ms", self.dispatch_timeout_ms),
        ] {
            if value == 0 {
                return Err(RelayError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn removal_grace(&self) -> Duration {
        Duration::from_millis(self.removal_grace_ms)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub listen_addr: SocketAddr,
    /// Address the coordinator dials; defaults to `listen_addr`
    pub advertise_addr: Option<String>,
    /// Coordinator gRPC URL (e.g. "http://127.0.0.1:7000")
    pub coordinator_url: String,
    pub heartbeat_interval_ms: u64,
    pub fetch_timeout_ms: u64,
    pub sandbox: SandboxConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7100)),
            advertise_addr: None,
            coordinator_url: "http://127.0.0.1:7000".to_string(),
            heartbeat_interval_ms: 1000,
            fetch_timeout_ms: 30_000,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            worker_id: worker_id.into(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn advertised_address(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.listen_addr.to_string())
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(RelayError::Config("worker_id must not be empty".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(RelayError::Config("heartbeat_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Parse a worker list of the form "id=host:port,id=host:port".
pub fn parse_worker_list(raw: &str) -> Result<Vec<WorkerEntry>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| match item.split_once('=') {
            Some((id, address)) if !id.is_empty() && !address.is_empty() => Ok(WorkerEntry {
                id: id.trim().to_string(),
                address: address.trim().to_string(),
            }),
            _ => Err(RelayError::Config(format!(
                "invalid worker entry '{}', expected id=host:port",
                item
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert!(cfg.network_disabled);
        assert_eq!(cfg.memory_limit.as_deref(), Some("512m"));
        assert_eq!(cfg.cpu_limit.as_deref(), Some("1.0"));
        assert!(cfg.remove_image);
    }

    #[test]
    fn coordinator_config_default() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:7000");
        assert_eq!(cfg.queue_capacity, 1024);
        assert_eq!(cfg.worker_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.health_check_interval(), Duration::from_secs(1));
        assert_eq!(cfg.dispatch_timeout(), Duration::from_secs(2));
        assert!(cfg.workers.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn coordinator_config_from_toml() {
        let cfg = CoordinatorConfig::from_toml(
            r#"
            listen_addr = "0.0.0.0:9000"
            queue_capacity = 8
            worker_timeout_ms = 750

            [[workers]]
            id = "w1"
            address = "10.0.0.1:7100"

            [[workers]]
            id = "w2"
            address = "10.0.0.2:7100"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(cfg.queue_capacity, 8);
        assert_eq!(cfg.worker_timeout_ms, 750);
        // untouched keys keep defaults
        assert_eq!(cfg.dispatch_timeout_ms, 2000);
        assert_eq!(cfg.workers.len(), 2);
        assert_eq!(cfg.workers[1].id, "w2");
    }

    #[test]
    fn coordinator_config_rejects_zero_capacity() {
        let err = CoordinatorConfig::from_toml("queue_capacity = 0").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn coordinator_config_rejects_zero_interval() {
        let cfg = CoordinatorConfig {
            health_check_interval_ms: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn coordinator_config_with_worker() {
        let cfg = CoordinatorConfig::default()
            .with_worker("a", "127.0.0.1:1")
            .with_worker("b", "127.0.0.1:2");
        assert_eq!(cfg.workers.len(), 2);
        assert_eq!(cfg.workers[0].address, "127.0.0.1:1");
    }

    #[test]
    fn worker_config_advertised_address_defaults_to_listen() {
        let addr: SocketAddr = "10.0.0.5:7100".parse().unwrap();
        let mut cfg = WorkerConfig::new("w5", addr);
        assert_eq!(cfg.advertised_address(), "10.0.0.5:7100");

        cfg.advertise_addr = Some("worker-5.internal:7100".to_string());
        assert_eq!(cfg.advertised_address(), "worker-5.internal:7100");
    }

    #[test]
    fn worker_config_rejects_empty_id() {
        let cfg = WorkerConfig {
            worker_id: " ".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_worker_list_accepts_entries() {
        let workers = parse_worker_list("w1=127.0.0.1:7101, w2=host.example.com:7102").unwrap();
        assert_eq!(
            workers,
            vec![
                WorkerEntry {
                    id: "w1".to_string(),
                    address: "127.0.0.1:7101".to_string()
                },
                WorkerEntry {
                    id: "w2".to_string(),
                    address: "host.example.com:7102".to_string()
                },
            ]
        );
    }

    #[test]
    fn parse_worker_list_empty_is_empty() {
        assert!(parse_worker_list("").unwrap().is_empty());
    }

    #[test]
    fn parse_worker_list_rejects_malformed() {
        assert!(parse_worker_list("w1").is_err());
        assert!(parse_worker_list("=127.0.0.1:1").is_err());
    }
}
