// src/config.rs

//! Manages server configuration: loading, validation, and defaults.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Configuration for the cluster coordination layer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterTuning {
    /// Interval between push rounds of the state sync managers.
    #[serde(with = "humantime_serde", default = "default_sync_interval")]
    pub sync_interval: Duration,
    /// Interval between peer health probes.
    #[serde(with = "humantime_serde", default = "default_health_check_interval")]
    pub health_check_interval: Duration,
    /// Consecutive probe failures before a healthy node is marked degraded,
    /// and again before a degraded node is marked unreachable.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// A node whose last heartbeat is older than `health_check_interval`
    /// times this factor is considered stale and reconciled via snapshot.
    #[serde(default = "default_stale_threshold_factor")]
    pub stale_threshold_factor: u32,
    /// Tolerated clock skew for signed inter-node requests.
    #[serde(with = "humantime_serde", default = "default_clock_skew")]
    pub clock_skew: Duration,
    /// How long tombstones are retained before the sweeper may collect them.
    /// Never collected below 10x the sync interval regardless of this value.
    #[serde(with = "humantime_serde", default = "default_tombstone_retention")]
    pub tombstone_retention: Duration,
    /// Interval for refreshing the local node's bucket count.
    #[serde(with = "humantime_serde", default = "default_bucket_count_interval")]
    pub bucket_count_interval: Duration,
    /// TTL for bucket location cache entries.
    #[serde(with = "humantime_serde", default = "default_location_cache_ttl")]
    pub location_cache_ttl: Duration,
    /// Per-source-IP sustained request rate for the internal API.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,
    /// Per-source-IP burst allowance for the internal API.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    /// Number of object replication workers.
    #[serde(default = "default_replication_workers")]
    pub replication_workers: usize,
    /// Capacity of the in-memory object replication queue.
    #[serde(default = "default_replication_queue_size")]
    pub replication_queue_size: usize,
    /// Floor for per-rule replication sync intervals, in seconds.
    #[serde(default = "default_min_replication_interval_secs")]
    pub min_replication_interval_secs: u64,
    /// Deadline for ordinary peer requests (sync pushes, probes).
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Deadline for full state snapshot transfers.
    #[serde(with = "humantime_serde", default = "default_snapshot_timeout")]
    pub snapshot_timeout: Duration,
}

impl Default for ClusterTuning {
    fn default() -> Self {
        Self {
            sync_interval: default_sync_interval(),
            health_check_interval: default_health_check_interval(),
            failure_threshold: default_failure_threshold(),
            stale_threshold_factor: default_stale_threshold_factor(),
            clock_skew: default_clock_skew(),
            tombstone_retention: default_tombstone_retention(),
            bucket_count_interval: default_bucket_count_interval(),
            location_cache_ttl: default_location_cache_ttl(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            replication_workers: default_replication_workers(),
            replication_queue_size: default_replication_queue_size(),
            min_replication_interval_secs: default_min_replication_interval_secs(),
            request_timeout: default_request_timeout(),
            snapshot_timeout: default_snapshot_timeout(),
        }
    }
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_health_check_interval() -> Duration {
    Duration::from_secs(15)
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_stale_threshold_factor() -> u32 {
    10
}
fn default_clock_skew() -> Duration {
    Duration::from_secs(300)
}
fn default_tombstone_retention() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}
fn default_bucket_count_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_location_cache_ttl() -> Duration {
    Duration::from_secs(300)
}
fn default_rate_limit_per_sec() -> u32 {
    100
}
fn default_rate_limit_burst() -> u32 {
    200
}
fn default_replication_workers() -> usize {
    5
}
fn default_replication_queue_size() -> usize {
    1024
}
fn default_min_replication_interval_secs() -> u64 {
    60
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_snapshot_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Configuration for the background integrity scrubber.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScrubberConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between full scrub cycles. The first cycle runs one full
    /// interval after startup, not immediately.
    #[serde(with = "humantime_serde", default = "default_scrub_interval")]
    pub interval: Duration,
    /// Number of objects verified per page.
    #[serde(default = "default_scrub_page_size")]
    pub page_size: usize,
    /// Minimum time between the start of two manual scans of one bucket.
    #[serde(with = "humantime_serde", default = "default_manual_scan_cooldown")]
    pub manual_scan_cooldown: Duration,
    /// Sleep between pages so the scrubber does not saturate disk I/O.
    #[serde(with = "humantime_serde", default = "default_scrub_throttle")]
    pub page_throttle: Duration,
}

impl Default for ScrubberConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_scrub_interval(),
            page_size: default_scrub_page_size(),
            manual_scan_cooldown: default_manual_scan_cooldown(),
            page_throttle: default_scrub_throttle(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_scrub_interval() -> Duration {
    Duration::from_secs(24 * 3600)
}
fn default_scrub_page_size() -> usize {
    500
}
fn default_manual_scan_cooldown() -> Duration {
    Duration::from_secs(3600)
}
fn default_scrub_throttle() -> Duration {
    Duration::from_millis(10)
}

/// Configuration for the disk and quota alert escalators.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AlertConfig {
    #[serde(with = "humantime_serde", default = "default_disk_poll_interval")]
    pub disk_poll_interval: Duration,
    /// Disk or quota usage percentage that raises a warning alert.
    #[serde(default = "default_warning_percent")]
    pub warning_percent: u8,
    /// Disk or quota usage percentage that raises a critical alert.
    #[serde(default = "default_critical_percent")]
    pub critical_percent: u8,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            disk_poll_interval: default_disk_poll_interval(),
            warning_percent: default_warning_percent(),
            critical_percent: default_critical_percent(),
        }
    }
}

fn default_disk_poll_interval() -> Duration {
    Duration::from_secs(300)
}
fn default_warning_percent() -> u8 {
    80
}
fn default_critical_percent() -> u8 {
    90
}

/// Configuration for outbound e-mail through an HTTP mail gateway.
/// When `gateway_url` is unset, e-mail escalation is a logged no-op.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MailerConfig {
    #[serde(default)]
    pub gateway_url: Option<String>,
    #[serde(default = "default_mail_from")]
    pub from_address: String,
}

fn default_mail_from() -> String {
    "noreply@opalstore.local".to_string()
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9878
}

/// The fully validated runtime configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Bind host for the S3/API listener, which also carries the internal
    /// cluster endpoints under `/cluster/internal`.
    #[serde(default = "default_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Bind host/port for the console listener carrying the cluster control API.
    #[serde(default = "default_host")]
    pub console_host: String,
    #[serde(default = "default_console_port")]
    pub console_port: u16,
    /// Directory for the metastore image and other node-local state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Root directory of the filesystem object storage backend.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// The URL under which peers and clients reach this node's API listener.
    #[serde(default)]
    pub public_api_url: Option<String>,
    /// The URL under which clients reach this node's console listener.
    #[serde(default)]
    pub public_console_url: Option<String>,
    /// JWT signing secret for client sessions. Overwritten with the cluster's
    /// shared secret when this node joins an existing cluster.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    /// Bearer token accepted by the bundled static admin gate.
    #[serde(default)]
    pub admin_api_token: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub cluster: ClusterTuning,
    #[serde(default)]
    pub scrubber: ScrubberConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub mailer: MailerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    9000
}
fn default_console_port() -> u16 {
    9001
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("opalstore_data")
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("opalstore_data/objects")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        // An empty TOML document resolves every field through its serde default.
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Config {
    /// Loads and validates the configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.api_port == self.console_port {
            return Err(anyhow!(
                "api_port and console_port must differ (both are {})",
                self.api_port
            ));
        }
        if self.alerts.warning_percent >= self.alerts.critical_percent {
            return Err(anyhow!(
                "alerts.warning_percent ({}) must be below alerts.critical_percent ({})",
                self.alerts.warning_percent,
                self.alerts.critical_percent
            ));
        }
        if self.alerts.critical_percent > 100 {
            return Err(anyhow!("alerts.critical_percent must not exceed 100"));
        }
        if self.cluster.replication_workers == 0 {
            return Err(anyhow!("cluster.replication_workers must be at least 1"));
        }
        if self.cluster.failure_threshold == 0 {
            return Err(anyhow!("cluster.failure_threshold must be at least 1"));
        }
        for (name, url) in [
            ("public_api_url", &self.public_api_url),
            ("public_console_url", &self.public_console_url),
            ("mailer.gateway_url", &self.mailer.gateway_url),
        ] {
            if let Some(raw) = url {
                Url::parse(raw).with_context(|| format!("{name} is not a valid URL: '{raw}'"))?;
            }
        }
        // Tombstones must outlive the window in which a skipped push round
        // can still be healed by a snapshot.
        if self.cluster.tombstone_retention < self.cluster.sync_interval * 10 {
            return Err(anyhow!(
                "cluster.tombstone_retention must be at least 10x cluster.sync_interval"
            ));
        }
        Ok(())
    }

    /// The endpoint peers use to reach this node. Falls back to the bind
    /// address when no public URL is configured.
    pub fn advertised_endpoint(&self) -> String {
        self.public_api_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.api_host, self.api_port))
    }

    /// The staleness cutoff derived from the health check interval.
    pub fn stale_after(&self) -> Duration {
        self.cluster.health_check_interval * self.cluster.stale_threshold_factor
    }
}
