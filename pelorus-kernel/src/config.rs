use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    /// Port for the REST control surface.
    pub http_port: u16,
    /// Bind address for the cached data server.
    pub cache_bind: String,
    /// Host identity this kernel claims; configs tagged with another host_id
    /// are dispatched elsewhere instead of started locally.
    pub host_id: Option<String>,
    /// Host identities claimed by other kernels on the network. A config whose
    /// host_id is in neither set raises a dispatch warning.
    pub peer_hosts: Vec<String>,
    /// Cruise definition loaded at startup (YAML or JSON).
    pub definition_path: String,
    /// Pipeline runner binary spawned once per active logger.
    pub runner_binary: String,
    /// Log level handed down to runner processes.
    pub runner_log_level: String,
    /// Seconds between monitor ticks.
    pub monitor_interval_secs: u64,
    /// Grace period before a stopping pipeline is force-killed.
    pub stop_grace_secs: u64,
    pub retry: RetryConf,
    pub cache_retention: CacheRetentionConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConf {
    /// Failures retried immediately before backoff kicks in.
    pub immediate_retries: u32,
    pub backoff_first_secs: u64,
    pub backoff_factor: f64,
    pub backoff_max_secs: u64,
    /// Total attempts before the logger is left failed.
    pub max_attempts: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheRetentionConf {
    /// Baseline history age kept when no subscriber asks for more.
    pub baseline_age_secs: u64,
    /// Hard cap on points kept per field.
    pub max_records: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            cache_bind: "0.0.0.0:8766".into(),
            host_id: None,
            peer_hosts: Vec::new(),
            definition_path: "cruise.yaml".into(),
            runner_binary: "pelorus-runner".into(),
            runner_log_level: "info".into(),
            monitor_interval_secs: 5,
            stop_grace_secs: 10,
            retry: RetryConf::default(),
            cache_retention: CacheRetentionConf::default(),
        }
    }
}

impl Default for RetryConf {
    fn default() -> Self {
        Self {
            immediate_retries: 3,
            backoff_first_secs: 2,
            backoff_factor: 2.0,
            backoff_max_secs: 300,
            max_attempts: 10,
        }
    }
}

impl Default for CacheRetentionConf {
    fn default() -> Self {
        Self {
            baseline_age_secs: 86_400,
            max_records: 86_400,
        }
    }
}

fn parse_config(text: &str) -> Result<KernelConfig, serde_yaml::Error> {
    serde_yaml::from_str(text)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("PELORUS_KERNEL_CONFIG").unwrap_or_else(|_| "pelorus.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }
        match parse_config(&txt) {
            Ok(cfg) => cfg,
            Err(e) => {
                // A config file the operator wrote must not be silently
                // swapped for defaults.
                eprintln!("[kernel] invalid config {path}: {e}");
                std::process::exit(1);
            }
        }
    } else {
        eprintln!("[kernel] no pelorus.yaml, using default config");
        KernelConfig::default()
    }
}
