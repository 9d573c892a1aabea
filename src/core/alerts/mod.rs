// src/core/alerts/mod.rs

//! Disk and per-tenant quota alert escalation. Both escalators share the
//! tri-state alert level and fire only on upward transitions, so a level
//! that is reached twice in a row produces exactly one notification.

use crate::config::AlertConfig;
use crate::core::mailer::Mailer;
use crate::core::metastore::MetaStore;
use crate::core::notify::{Notification, NotificationHub};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::Disks;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// The escalation level of a monitored resource.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    None,
    Warning,
    Critical,
}

impl AlertLevel {
    fn for_percent(percent: u8, config: &AlertConfig) -> Self {
        if percent >= config.critical_percent {
            AlertLevel::Critical
        } else if percent >= config.warning_percent {
            AlertLevel::Warning
        } else {
            AlertLevel::None
        }
    }

    fn severity(&self) -> &'static str {
        match self {
            AlertLevel::None => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

/// Tracks alert levels and performs the notification + e-mail fan-out.
#[derive(Debug)]
pub struct AlertManager {
    config: AlertConfig,
    store: Arc<MetaStore>,
    hub: Arc<NotificationHub>,
    mailer: Arc<Mailer>,
    disk_level: Mutex<AlertLevel>,
    tenant_levels: DashMap<String, AlertLevel>,
}

impl AlertManager {
    pub fn new(
        config: AlertConfig,
        store: Arc<MetaStore>,
        hub: Arc<NotificationHub>,
        mailer: Arc<Mailer>,
    ) -> Self {
        Self {
            config,
            store,
            hub,
            mailer,
            disk_level: Mutex::new(AlertLevel::None),
            tenant_levels: DashMap::new(),
        }
    }

    /// E-mail addresses of all active global administrators.
    pub fn global_admin_emails(&self) -> Vec<String> {
        self.store
            .users
            .iter()
            .filter(|e| e.value().enabled && e.value().is_global_admin())
            .map(|e| e.value().email.clone())
            .collect()
    }

    fn tenant_admin_emails(&self, tenant_id: &str) -> Vec<String> {
        self.store
            .users
            .iter()
            .filter(|e| {
                let u = e.value();
                u.enabled
                    && u.tenant_id.as_deref() == Some(tenant_id)
                    && u.role == crate::core::entities::UserRole::TenantAdmin
            })
            .map(|e| e.value().email.clone())
            .collect()
    }

    /// Evaluates a disk usage reading. Returns the level that fired, if any.
    pub async fn evaluate_disk(&self, used_percent: u8) -> Option<AlertLevel> {
        let level = AlertLevel::for_percent(used_percent, &self.config);
        // The recorded level never moves down, so a dip and re-cross of a
        // threshold that already fired stays silent.
        let fired = {
            let mut current = self.disk_level.lock();
            let fired = level > *current;
            if fired {
                *current = level;
            }
            fired
        };
        if !fired {
            return None;
        }

        warn!(
            "Disk usage alert: {}% used, level {:?}.",
            used_percent, level
        );
        self.hub.publish(Notification::new(
            "disk_alert",
            None,
            level.severity(),
            format!("Disk usage {level:?}"),
            format!("Local disk usage has reached {used_percent}%."),
        ));
        let recipients = self.global_admin_emails();
        if let Err(e) = self
            .mailer
            .send(
                &recipients,
                &format!("[opalstore] disk usage {used_percent}%"),
                &format!(
                    "Disk usage on this storage node reached {used_percent}% at {}, \
                     crossing the {:?} threshold.",
                    chrono::Utc::now().to_rfc3339(),
                    level
                ),
            )
            .await
        {
            warn!("Failed to e-mail disk alert: {}", e);
        }
        Some(level)
    }

    /// Evaluates a tenant's quota usage after a successful storage increment.
    /// Deduplicated per tenant with the same upward-transition rule as disk.
    pub async fn evaluate_tenant_quota(
        &self,
        tenant_id: &str,
        used_bytes: u64,
        max_bytes: u64,
    ) -> Option<AlertLevel> {
        if max_bytes == 0 {
            return None;
        }
        let percent = ((used_bytes as f64 / max_bytes as f64) * 100.0).min(100.0) as u8;
        let level = AlertLevel::for_percent(percent, &self.config);
        let fired = {
            let mut entry = self
                .tenant_levels
                .entry(tenant_id.to_string())
                .or_default();
            let fired = level > *entry;
            if fired {
                *entry = level;
            }
            fired
        };
        if !fired {
            return None;
        }

        warn!(
            "Quota alert for tenant '{}': {}% of quota used, level {:?}.",
            tenant_id, percent, level
        );
        self.hub.publish(Notification::new(
            "quota_alert",
            Some(tenant_id.to_string()),
            level.severity(),
            format!("Tenant quota {level:?}"),
            format!("Tenant '{tenant_id}' has used {percent}% of its storage quota."),
        ));
        let mut recipients = self.global_admin_emails();
        recipients.extend(self.tenant_admin_emails(tenant_id));
        recipients.sort();
        recipients.dedup();
        if let Err(e) = self
            .mailer
            .send(
                &recipients,
                &format!("[opalstore] tenant '{tenant_id}' quota at {percent}%"),
                &format!(
                    "Tenant '{tenant_id}' has used {used_bytes} of {max_bytes} quota bytes \
                     ({percent}%) as of {}, crossing the {level:?} threshold.",
                    chrono::Utc::now().to_rfc3339()
                ),
            )
            .await
        {
            warn!("Failed to e-mail quota alert: {}", e);
        }
        Some(level)
    }

    /// Forgets a tenant's recorded level. Used when the tenant is deleted.
    pub fn clear_tenant(&self, tenant_id: &str) {
        self.tenant_levels.remove(tenant_id);
    }
}

/// Polls local disk usage for the storage root and feeds the escalator.
pub struct DiskMonitorTask {
    alerts: Arc<AlertManager>,
    storage_root: PathBuf,
    poll_interval: Duration,
}

impl DiskMonitorTask {
    pub fn new(alerts: Arc<AlertManager>, storage_root: PathBuf, poll_interval: Duration) -> Self {
        Self {
            alerts,
            storage_root,
            poll_interval,
        }
    }

    /// Reads the usage percentage of the disk holding the storage root.
    /// Picks the mount point with the longest matching prefix.
    fn sample_disk_usage(&self) -> Option<u8> {
        let disks = Disks::new_with_refreshed_list();
        let root = self.storage_root.as_path();
        let best = disks
            .iter()
            .filter(|d| root.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;
        let total = best.total_space();
        if total == 0 {
            return None;
        }
        let used = total.saturating_sub(best.available_space());
        Some(((used as f64 / total as f64) * 100.0) as u8)
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Disk monitor started (interval {:?}, storage root {:?}).",
            self.poll_interval, self.storage_root
        );
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sample_disk_usage() {
                        Some(percent) => {
                            self.alerts.evaluate_disk(percent).await;
                        }
                        None => warn!(
                            "Could not determine disk usage for {:?}.",
                            self.storage_root
                        ),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Disk monitor shutting down.");
                    return;
                }
            }
        }
    }
}
