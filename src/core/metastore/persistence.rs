// src/core/metastore/persistence.rs

//! Periodic flushing of the metastore image with temp-file + rename atomicity.

use super::MetaStore;
use crate::core::OpalError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// How often the flusher checks the dirty flag.
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Serializes the full store and writes it atomically next to the image path.
pub async fn flush(store: &MetaStore) -> Result<(), OpalError> {
    let image = store.to_image();
    let bytes = serde_json::to_vec_pretty(&image)?;
    let path = store.image_path().to_path_buf();
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &bytes).await?;
    tokio::fs::rename(&tmp_path, &path).await?;
    debug!("Flushed metastore image ({} bytes) to {:?}.", bytes.len(), path);
    Ok(())
}

/// A task that periodically persists the metastore when it has changed,
/// and once more on shutdown.
pub struct MetastoreFlusherTask {
    store: Arc<MetaStore>,
}

impl MetastoreFlusherTask {
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Metastore flusher task started.");
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.store.take_dirty() {
                        if let Err(e) = flush(&self.store).await {
                            // Re-arm so the next tick retries the write.
                            self.store.mark_dirty();
                            error!("Failed to flush metastore image: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    if self.store.take_dirty() {
                        if let Err(e) = flush(&self.store).await {
                            error!("Failed to flush metastore image on shutdown: {}", e);
                        }
                    }
                    info!("Metastore flusher task shutting down.");
                    return;
                }
            }
        }
    }
}
