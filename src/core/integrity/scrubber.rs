// src/core/integrity/scrubber.rs

//! The background integrity scrubber. Once per interval it walks every local
//! bucket page by page, recomputing content hashes and escalating anything
//! that no longer matches its stored ETag.

use super::{IntegrityManager, ScanPage};
use crate::config::ScrubberConfig;
use crate::core::now_ms;
use crate::core::objects::ObjectManager;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct ScrubberTask {
    objects: Arc<ObjectManager>,
    integrity: Arc<IntegrityManager>,
    config: ScrubberConfig,
}

impl ScrubberTask {
    pub fn new(
        objects: Arc<ObjectManager>,
        integrity: Arc<IntegrityManager>,
        config: ScrubberConfig,
    ) -> Self {
        Self {
            objects,
            integrity,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Integrity scrubber started (interval {:?}, page size {}).",
            self.config.interval, self.config.page_size
        );
        let mut interval = tokio::time::interval(self.config.interval);
        // The immediate first tick is swallowed so the first full scan runs
        // one interval after startup rather than during it.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scrub_all_buckets(&mut shutdown_rx).await {
                        warn!("Integrity scrub cycle failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Integrity scrubber shutting down.");
                    return;
                }
            }
        }
    }

    async fn scrub_all_buckets(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), crate::core::OpalError> {
        let buckets = self.objects.list_local_buckets(None).await?;
        info!(
            "Starting integrity scrub cycle over {} bucket(s).",
            buckets.len()
        );

        for bucket in buckets {
            let bucket_path = format!("{}/{}", bucket.tenant_id, bucket.name);
            let started_at = now_ms();
            let mut totals = ScanPage::default();
            let mut marker = String::new();

            loop {
                // Shutdown can land mid-bucket; bail without recording a
                // partial history entry.
                if shutdown_rx.try_recv().is_ok() {
                    info!("Scrub cycle interrupted by shutdown.");
                    return Ok(());
                }

                let page = match self
                    .objects
                    .verify_bucket_integrity(&bucket_path, "", &marker, self.config.page_size)
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        warn!("Scrub of '{}' aborted: {}", bucket_path, e);
                        break;
                    }
                };
                self.integrity.escalate_issues(&bucket_path, &page.issues).await;

                totals.checked += page.checked;
                totals.ok += page.ok;
                totals.corrupted += page.corrupted;
                totals.missing += page.missing;
                totals.skipped += page.skipped;
                totals.errors += page.errors;
                let room = 500usize.saturating_sub(totals.issues.len());
                totals.issues.extend(page.issues.into_iter().take(room));

                match page.next_marker {
                    Some(next) => marker = next,
                    None => break,
                }
                // Breathe between pages so the scrub never saturates disk I/O.
                tokio::time::sleep(self.config.page_throttle).await;
            }

            if totals.corrupted > 0 || totals.missing > 0 {
                warn!(
                    "Scrub of '{}' finished: {} checked, {} corrupted, {} missing.",
                    bucket_path, totals.checked, totals.corrupted, totals.missing
                );
            }
            self.integrity.record_scrub(&bucket_path, started_at, totals);
        }
        info!("Integrity scrub cycle complete.");
        Ok(())
    }
}
