use hickory_proto::rr::{Name, RecordType};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::DEFAULT_WINDOW_CAPACITY;
use crate::models::Target;
use crate::probe::source_for;
use crate::writer::{LogOutput, DEFAULT_DEGRADED_AFTER};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no targets configured")]
    EmptyTargets,
    #[error("probe interval must be at least one second")]
    InvalidInterval,
    #[error("probe timeout must be greater than zero")]
    InvalidTimeout,
    #[error("max_concurrency must be greater than zero")]
    InvalidConcurrency,
    #[error("window_capacity must be greater than zero")]
    InvalidWindow,
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("invalid resolver '{0}': expected an IP address or \"system\"")]
    InvalidResolver(String),
    #[error("system resolver configuration has no nameservers: {0}")]
    SystemResolver(String),
    #[error("invalid dashboard rule '{pattern}': {source}")]
    InvalidRule {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
    /// JSON list of target entries, re-read between ticks when it changes.
    #[serde(default)]
    pub targets_file: Option<PathBuf>,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    /// Port applied to bare host names in a targets file.
    #[serde(default = "default_port")]
    pub default_port: u16,
    /// Resolvers applied to legacy `{"name", "type"}` entries in a targets file.
    #[serde(default = "default_resolvers")]
    pub default_resolvers: Vec<String>,
    /// Adds a PTR query for this host's own IPv4 address against each default resolver.
    #[serde(default)]
    pub probe_local_ptr: bool,
    #[serde(default)]
    pub output: LogOutput,
    #[serde(default)]
    pub fsync: bool,
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    pub webhook_url: Option<String>,
    pub api_port: Option<u16>,
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetSpec {
    Tcp {
        host: String,
        port: u16,
    },
    Dns {
        name: String,
        #[serde(default = "default_record_type")]
        record_type: String,
        #[serde(default = "default_resolver")]
        resolver: String,
    },
}

/// Accepted shapes inside a targets file.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TargetEntry {
    Spec(TargetSpec),
    Host(String),
    Endpoint {
        endpoint: String,
    },
    Query {
        name: String,
        #[serde(rename = "type", default)]
        record_type: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DashboardConfig {
    #[serde(default = "default_refresh")]
    pub refresh_secs: f64,
    #[serde(default = "default_ok_threshold")]
    pub ok_threshold: f64,
    #[serde(default = "default_p95_threshold")]
    pub p95_threshold_ms: f64,
    #[serde(default)]
    pub show_mean: bool,
    #[serde(default)]
    pub group_by: GroupBy,
    /// First matching rule overrides the global thresholds for a series.
    #[serde(default)]
    pub rules: Vec<ThresholdRule>,
}

/// Dashboard row granularity.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    /// One row per endpoint and check, all routes merged.
    #[default]
    Endpoint,
    /// One row per source/destination route.
    Route,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ThresholdRule {
    pub pattern: String,
    pub ok_pct: Option<f64>,
    pub p95_ms: Option<f64>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_refresh(),
            ok_threshold: default_ok_threshold(),
            p95_threshold_ms: default_p95_threshold(),
            show_mean: false,
            group_by: GroupBy::default(),
            rules: Vec::new(),
        }
    }
}

fn default_interval() -> u64 { 30 }
fn default_timeout() -> u64 { 2000 }
fn default_max_concurrency() -> usize { 64 }
fn default_window_capacity() -> usize { DEFAULT_WINDOW_CAPACITY }
fn default_port() -> u16 { 2598 }
fn default_resolvers() -> Vec<String> { vec![default_resolver()] }
fn default_resolver() -> String { "system".into() }
fn default_record_type() -> String { "A".into() }
fn default_degraded_after() -> u32 { DEFAULT_DEGRADED_AFTER }
fn default_refresh() -> f64 { 2.0 }
fn default_ok_threshold() -> f64 { 99.0 }
fn default_p95_threshold() -> f64 { 50.0 }

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            targets_file: None,
            interval_secs: default_interval(),
            timeout_ms: default_timeout(),
            max_concurrency: default_max_concurrency(),
            retries: 0,
            window_capacity: default_window_capacity(),
            default_port: default_port(),
            default_resolvers: default_resolvers(),
            probe_local_ptr: false,
            output: LogOutput::default(),
            fsync: false,
            degraded_after: default_degraded_after(),
            webhook_url: None,
            api_port: None,
            dashboard: DashboardConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Checks every scalar setting. Target problems surface from [`Self::build_targets`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::InvalidInterval);
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if self.window_capacity == 0 {
            return Err(ConfigError::InvalidWindow);
        }
        for rule in &self.dashboard.rules {
            regex::Regex::new(&rule.pattern)
                .map_err(|source| ConfigError::InvalidRule { pattern: rule.pattern.clone(), source })?;
        }
        Ok(())
    }

    /// Expands inline targets plus the targets file into a deduplicated list.
    pub fn build_targets(&self) -> Result<Vec<Target>, ConfigError> {
        let mut specs = self.targets.clone();
        if let Some(path) = &self.targets_file {
            specs.extend(self.read_targets_file(path)?);
        }

        let mut candidates = Vec::new();
        for spec in &specs {
            candidates.extend(expand(spec)?);
        }
        if self.probe_local_ptr {
            candidates.extend(self.local_ptr_targets()?);
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for target in candidates {
            if seen.insert(target.clone()) {
                targets.push(target);
            }
        }

        if targets.is_empty() {
            return Err(ConfigError::EmptyTargets);
        }
        Ok(targets)
    }

    fn read_targets_file(&self, path: &Path) -> Result<Vec<TargetSpec>, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let entries: Vec<TargetEntry> = serde_json::from_str(&content)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;

        let mut specs = Vec::new();
        for entry in entries {
            match entry {
                TargetEntry::Spec(spec) => specs.push(spec),
                TargetEntry::Host(host) | TargetEntry::Endpoint { endpoint: host } => {
                    let host = host.trim();
                    if !host.is_empty() {
                        specs.push(TargetSpec::Tcp { host: host.to_string(), port: self.default_port });
                    }
                }
                TargetEntry::Query { name, record_type } => {
                    for resolver in &self.default_resolvers {
                        specs.push(TargetSpec::Dns {
                            name: name.clone(),
                            record_type: record_type.clone().unwrap_or_else(default_record_type),
                            resolver: resolver.clone(),
                        });
                    }
                }
            }
        }
        Ok(specs)
    }

    /// PTR lookups of the IPv4 address this host uses to reach each default resolver.
    fn local_ptr_targets(&self) -> Result<Vec<Target>, ConfigError> {
        let mut targets = Vec::new();
        for entry in &self.default_resolvers {
            let resolver = resolve_resolver(entry)?;
            match source_for(resolver) {
                Some(IpAddr::V4(local)) => {
                    let name = Name::from(IpAddr::V4(local)).to_utf8();
                    targets.push(Target::Dns {
                        name: name.trim_end_matches('.').to_string(),
                        record_type: RecordType::PTR,
                        resolver,
                    });
                }
                _ => warn!(resolver = %resolver, "No local IPv4 address towards resolver, skipping local PTR"),
            }
        }
        Ok(targets)
    }

    /// The single TCP port shared by every TCP target, used as the log file suffix.
    pub fn shared_tcp_port(targets: &[Target]) -> Option<u16> {
        let mut ports = targets.iter().filter_map(|t| match t {
            Target::Tcp { port, .. } => Some(*port),
            Target::Dns { .. } => None,
        });
        let first = ports.next()?;
        ports.all(|p| p == first).then_some(first)
    }
}

fn expand(spec: &TargetSpec) -> Result<Vec<Target>, ConfigError> {
    match spec {
        TargetSpec::Tcp { host, port } => {
            let host = host.trim();
            if host.is_empty() {
                return Err(ConfigError::InvalidTarget("empty TCP host".into()));
            }
            if *port == 0 {
                return Err(ConfigError::InvalidTarget(format!("{}: port 0", host)));
            }
            let hosts = match host.parse::<IpNet>() {
                Ok(net) => net.hosts().map(|ip| ip.to_string()).collect::<Vec<_>>(),
                Err(_) => vec![host.to_string()],
            };
            Ok(hosts.into_iter().map(|host| Target::Tcp { host, port: *port }).collect())
        }
        TargetSpec::Dns { name, record_type, resolver } => {
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::InvalidTarget("empty DNS query name".into()));
            }
            let record_type = RecordType::from_str(&record_type.to_ascii_uppercase())
                .map_err(|_| ConfigError::InvalidTarget(format!("{}: unknown record type {}", name, record_type)))?;
            let resolver = resolve_resolver(resolver)?;
            Ok(vec![Target::Dns { name: name.to_string(), record_type, resolver }])
        }
    }
}

/// Maps a resolver entry to an address; `system` is the first OS nameserver.
pub fn resolve_resolver(entry: &str) -> Result<IpAddr, ConfigError> {
    let entry = entry.trim();
    if entry.eq_ignore_ascii_case("system") {
        let (config, _) = hickory_resolver::system_conf::read_system_conf()
            .map_err(|e| ConfigError::SystemResolver(e.to_string()))?;
        return config
            .name_servers()
            .first()
            .map(|ns| ns.socket_addr.ip())
            .ok_or_else(|| ConfigError::SystemResolver("empty nameserver list".into()));
    }
    entry.parse().map_err(|_| ConfigError::InvalidResolver(entry.to_string()))
}

/// Re-reads the target list when the targets file changes.
pub struct TargetReloader {
    config: MonitorConfig,
    modified: Option<SystemTime>,
}

impl TargetReloader {
    pub fn new(config: MonitorConfig) -> Self {
        let modified = config.targets_file.as_deref().and_then(modified_at);
        Self { config, modified }
    }

    /// `None` when nothing changed since the last call.
    pub fn poll(&mut self) -> Option<Result<Vec<Target>, ConfigError>> {
        let path = self.config.targets_file.as_deref()?;
        let modified = modified_at(path);
        if modified == self.modified {
            return None;
        }
        self.modified = modified;
        Some(self.config.build_targets())
    }

    /// Publishes reloaded targets into `tx` every `every` until cancelled.
    /// A reload that fails or comes back empty keeps the current set.
    pub async fn watch(
        mut self,
        tx: watch::Sender<Arc<[Target]>>,
        every: Duration,
        cancel: CancellationToken,
    ) {
        if self.config.targets_file.is_none() {
            return;
        }
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.poll() {
                None => continue,
                Some(Ok(targets)) => {
                    info!(count = targets.len(), "Targets file changed, new target set takes effect next tick");
                    let _ = tx.send(targets.into());
                }
                Some(Err(e)) => warn!(error = %e, "Targets file reload rejected, keeping current set"),
            }
        }
        debug!("Target reloader stopped");
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
