// src/core/notify/mod.rs

//! The in-process notification hub. Console clients subscribe (optionally
//! scoped to a tenant) and receive server events over SSE; the hub fans each
//! notification to every matching subscriber through a bounded per-subscriber
//! channel that drops the oldest entries under back-pressure.

use crate::core::{metrics, now_ms};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::debug;

/// The capacity of each subscriber's buffer. Older entries are dropped when
/// a slow subscriber falls this far behind.
const SUBSCRIBER_BUFFER: usize = 64;

/// A server event fanned out to console subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    /// Machine-readable kind, e.g. `data_corruption`, `disk_alert`, `quota_alert`.
    pub kind: String,
    /// Scopes the notification to one tenant's subscribers. `None` restricts
    /// delivery to global-admin subscribers.
    pub tenant_id: Option<String>,
    pub severity: String,
    pub title: String,
    pub message: String,
    pub created_at: i64,
}

impl Notification {
    pub fn new(
        kind: &str,
        tenant_id: Option<String>,
        severity: &str,
        title: String,
        message: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            tenant_id,
            severity: severity.to_string(),
            title,
            message,
            created_at: now_ms(),
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    tenant_id: Option<String>,
    is_global_admin: bool,
    tx: Arc<Sender<Notification>>,
}

/// Central fan-out hub for console notifications.
#[derive(Debug, Default)]
pub struct NotificationHub {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a subscriber. Global admins see everything; tenant-scoped
    /// subscribers only see notifications for their tenant.
    pub fn subscribe(
        &self,
        tenant_id: Option<String>,
        is_global_admin: bool,
    ) -> (u64, Receiver<Notification>) {
        let (tx, rx) = broadcast::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(
            id,
            Subscriber {
                tenant_id,
                is_global_admin,
                tx: Arc::new(tx),
            },
        );
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// Fans a notification to all matching subscribers. Returns the number
    /// of subscribers it was delivered to.
    pub fn publish(&self, notification: Notification) -> usize {
        let mut delivered = 0;
        for entry in self.subscribers.iter() {
            let sub = entry.value();
            let matches = match &notification.tenant_id {
                // Tenant-scoped events go to that tenant's subscribers and to
                // global admins.
                Some(tenant) => {
                    sub.is_global_admin || sub.tenant_id.as_deref() == Some(tenant.as_str())
                }
                // Unscoped events are broadcast only to global admins.
                None => sub.is_global_admin,
            };
            if matches {
                delivered += sub.tx.send(notification.clone()).unwrap_or(0);
            }
        }
        debug!(
            "Published '{}' notification to {} subscriber(s).",
            notification.kind, delivered
        );
        delivered
    }

    /// Drops subscribers whose receiving side has gone away.
    pub fn purge_closed(&self) -> usize {
        let before = self.subscribers.len();
        self.subscribers
            .retain(|_, sub| sub.tx.receiver_count() > 0);
        before - self.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Bumps the dropped-notification counter when a subscriber's receiver
/// reports that it lagged behind and lost entries.
pub fn record_dropped(count: u64) {
    metrics::DROPPED_NOTIFICATIONS_TOTAL.inc_by(count as f64);
}
