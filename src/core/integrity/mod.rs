// src/core/integrity/mod.rs

//! Object integrity machinery: scan result types, the persisted per-bucket
//! scan history, the manual-scan cooldown gate, and corruption escalation.

pub mod scrubber;

use crate::core::alerts::AlertManager;
use crate::core::mailer::Mailer;
use crate::core::metastore::MetaStore;
use crate::core::notify::{Notification, NotificationHub};
use crate::core::objects::ObjectManager;
use crate::core::{OpalError, now_ms};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// A bucket keeps at most this many history entries, newest first.
const HISTORY_LIMIT: usize = 10;
/// A history entry records at most this many individual issues.
const ISSUE_LIMIT: usize = 500;

/// What a single object check concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Ok,
    Corrupted,
    Missing,
    Skipped,
    Error,
}

/// One corrupted, missing, or unreadable object found by a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub key: String,
    pub outcome: CheckOutcome,
    pub expected_etag: String,
    #[serde(default)]
    pub actual_etag: Option<String>,
    pub detail: String,
}

/// The result of verifying one page of a bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanPage {
    pub checked: u64,
    pub ok: u64,
    pub corrupted: u64,
    pub missing: u64,
    pub skipped: u64,
    pub errors: u64,
    pub issues: Vec<IntegrityIssue>,
    #[serde(default)]
    pub next_marker: Option<String>,
}

/// Who initiated a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanSource {
    Manual,
    Scrubber,
}

/// One completed scan as persisted in the bucket's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityHistoryEntry {
    pub scanned_at: i64,
    pub duration_ms: u64,
    pub checked: u64,
    pub ok: u64,
    pub corrupted: u64,
    pub missing: u64,
    pub skipped: u64,
    pub errors: u64,
    pub issues: Vec<IntegrityIssue>,
    pub source: ScanSource,
}

/// Accumulates pages of an in-flight scan until the final page lands.
#[derive(Debug, Default)]
struct ScanAccumulator {
    started_at: i64,
    totals: ScanPage,
}

impl ScanAccumulator {
    fn absorb(&mut self, page: &ScanPage) {
        self.totals.checked += page.checked;
        self.totals.ok += page.ok;
        self.totals.corrupted += page.corrupted;
        self.totals.missing += page.missing;
        self.totals.skipped += page.skipped;
        self.totals.errors += page.errors;
        let room = ISSUE_LIMIT.saturating_sub(self.totals.issues.len());
        self.totals
            .issues
            .extend(page.issues.iter().take(room).cloned());
    }
}

/// Coordinates integrity scans: rate limits manual scans, persists history,
/// and escalates corruption findings.
#[derive(Debug)]
pub struct IntegrityManager {
    store: Arc<MetaStore>,
    objects: Arc<ObjectManager>,
    hub: Arc<NotificationHub>,
    mailer: Arc<Mailer>,
    alerts: Arc<AlertManager>,
    manual_cooldown: Duration,
    /// In-flight scans keyed by bucket path, so marker continuations merge
    /// into one history entry.
    in_flight: DashMap<String, ScanAccumulator>,
}

impl IntegrityManager {
    pub fn new(
        store: Arc<MetaStore>,
        objects: Arc<ObjectManager>,
        hub: Arc<NotificationHub>,
        mailer: Arc<Mailer>,
        alerts: Arc<AlertManager>,
        manual_cooldown: Duration,
    ) -> Self {
        Self {
            store,
            objects,
            hub,
            mailer,
            alerts,
            manual_cooldown,
            in_flight: DashMap::new(),
        }
    }

    fn history_kv_key(bucket_path: &str) -> String {
        format!("integrity_scans:{bucket_path}")
    }

    /// The persisted scan history of a bucket, newest first.
    pub fn history(&self, bucket_path: &str) -> Vec<IntegrityHistoryEntry> {
        self.store
            .kv
            .get(&Self::history_kv_key(bucket_path))
            .and_then(|e| serde_json::from_value(e.value().clone()).ok())
            .unwrap_or_default()
    }

    fn append_history(&self, bucket_path: &str, entry: IntegrityHistoryEntry) {
        let mut history = self.history(bucket_path);
        history.insert(0, entry);
        history.truncate(HISTORY_LIMIT);
        match serde_json::to_value(&history) {
            Ok(value) => {
                self.store.kv.insert(Self::history_kv_key(bucket_path), value);
                self.store.mark_dirty();
            }
            Err(e) => error!(
                "Failed to serialize integrity history for '{}': {}",
                bucket_path, e
            ),
        }
    }

    /// Enforces the cooldown between manual scans of one bucket. Only the
    /// first page of a scan (empty marker) is gated; continuations run free.
    fn check_manual_cooldown(&self, bucket_path: &str) -> Result<(), OpalError> {
        let Some(last) = self
            .history(bucket_path)
            .into_iter()
            .find(|e| e.source == ScanSource::Manual)
        else {
            return Ok(());
        };
        let elapsed_ms = now_ms() - last.scanned_at;
        let cooldown_ms = self.manual_cooldown.as_millis() as i64;
        if elapsed_ms < cooldown_ms {
            let remaining_secs = (cooldown_ms - elapsed_ms) / 1000;
            return Err(OpalError::RateLimited(format!(
                "bucket '{bucket_path}' was scanned recently; retry in {remaining_secs}s"
            )));
        }
        Ok(())
    }

    /// Runs one page of a manual scan. Marker-based, so interrupted scans are
    /// resumable and idempotent.
    pub async fn manual_scan_page(
        &self,
        bucket_path: &str,
        prefix: &str,
        marker: &str,
        max_keys: usize,
    ) -> Result<ScanPage, OpalError> {
        if marker.is_empty() {
            self.check_manual_cooldown(bucket_path)?;
            self.in_flight.insert(
                bucket_path.to_string(),
                ScanAccumulator {
                    started_at: now_ms(),
                    totals: ScanPage::default(),
                },
            );
        }

        let page = self
            .objects
            .verify_bucket_integrity(bucket_path, prefix, marker, max_keys)
            .await?;
        self.escalate_issues(bucket_path, &page.issues).await;

        let mut finished = None;
        if let Some(mut acc) = self.in_flight.get_mut(bucket_path) {
            acc.absorb(&page);
            if page.next_marker.is_none() {
                finished = Some(acc.started_at);
            }
        }
        if let Some(started_at) = finished {
            if let Some((_, acc)) = self.in_flight.remove(bucket_path) {
                self.append_history(
                    bucket_path,
                    Self::entry_from(acc, started_at, ScanSource::Manual),
                );
            }
        }
        Ok(page)
    }

    fn entry_from(
        acc: ScanAccumulator,
        started_at: i64,
        source: ScanSource,
    ) -> IntegrityHistoryEntry {
        IntegrityHistoryEntry {
            scanned_at: started_at,
            duration_ms: (now_ms() - started_at).max(0) as u64,
            checked: acc.totals.checked,
            ok: acc.totals.ok,
            corrupted: acc.totals.corrupted,
            missing: acc.totals.missing,
            skipped: acc.totals.skipped,
            errors: acc.totals.errors,
            issues: acc.totals.issues,
            source,
        }
    }

    /// Records a completed scrubber pass over one bucket.
    pub fn record_scrub(&self, bucket_path: &str, started_at: i64, totals: ScanPage) {
        let acc = ScanAccumulator {
            started_at,
            totals,
        };
        self.append_history(
            bucket_path,
            Self::entry_from(acc, started_at, ScanSource::Scrubber),
        );
    }

    /// Fans corruption findings out: one notification per damaged object and
    /// one e-mail batch per page to the active global admins.
    pub async fn escalate_issues(&self, bucket_path: &str, issues: &[IntegrityIssue]) {
        let damaged: Vec<_> = issues
            .iter()
            .filter(|i| matches!(i.outcome, CheckOutcome::Corrupted | CheckOutcome::Missing))
            .collect();
        if damaged.is_empty() {
            return;
        }
        crate::core::metrics::INTEGRITY_ISSUES_TOTAL.inc_by(damaged.len() as f64);

        let tenant_id = bucket_path.split('/').next().map(|t| t.to_string());
        for issue in &damaged {
            error!(
                "Data corruption in '{}': object '{}' is {:?} ({}).",
                bucket_path, issue.key, issue.outcome, issue.detail
            );
            self.hub.publish(Notification::new(
                "data_corruption",
                tenant_id.clone(),
                "critical",
                format!("Data corruption in {bucket_path}"),
                format!(
                    "Object '{}' is {:?}: {}",
                    issue.key, issue.outcome, issue.detail
                ),
            ));
        }

        let recipients = self.alerts.global_admin_emails();
        let body = damaged
            .iter()
            .map(|i| format!("- {} ({:?}): {}", i.key, i.outcome, i.detail))
            .collect::<Vec<_>>()
            .join("\n");
        if let Err(e) = self
            .mailer
            .send(
                &recipients,
                &format!("[opalstore] data corruption detected in {bucket_path}"),
                &format!(
                    "An integrity scan found {} damaged object(s) in '{}':\n{}\n\n\
                     Damaged objects are never repaired automatically; restore them \
                     from a replica or backup.",
                    damaged.len(),
                    bucket_path,
                    body
                ),
            )
            .await
        {
            warn!("Failed to e-mail corruption report: {}", e);
        }
    }
}
