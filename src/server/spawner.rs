// src/server/spawner.rs

//! Spawns all of the server's long-running background tasks and both HTTP
//! listeners.

use super::context::ServerContext;
use super::{control_api, internal_api, metrics_server};
use crate::core::alerts::DiskMonitorTask;
use crate::core::cluster::health::{BucketCountUpdaterTask, HealthCheckerTask};
use crate::core::cluster::replication::{ReplicationDispatcherTask, ReplicationWorker};
use crate::core::cluster::migration::MigrationRunnerTask;
use crate::core::cluster::snapshot::{StaleReconcilerTask, TombstoneSweeperTask};
use crate::core::cluster::sync::SyncManager;
use crate::core::entities::{
    AccessKey, BucketAcl, BucketConfig, BucketPermission, IdpGroupMapping, IdpProvider, Tenant,
    User,
};
use crate::core::integrity::scrubber::ScrubberTask;
use crate::core::metastore::persistence::MetastoreFlusherTask;
use anyhow::{Result, anyhow};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How often idle rate-limiter buckets, closed notification subscribers,
/// and expired cache entries are swept.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
/// How often the tombstone sweeper looks for expired tombstones.
const TOMBSTONE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

macro_rules! spawn_task {
    ($ctx:expr, $task:expr) => {{
        let task = $task;
        let shutdown_rx = $ctx.shutdown_tx.subscribe();
        $ctx.background_tasks.spawn(async move {
            task.run(shutdown_rx).await;
            Ok(())
        });
    }};
}

/// Spawns all critical background tasks into the context's JoinSet.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = ctx.state.clone();
    let config = state.config.lock().await.clone();
    let server_init = ctx
        .init_channels
        .take()
        .ok_or_else(|| anyhow!("server init channels already consumed"))?;

    // --- Metastore persistence ---
    spawn_task!(ctx, MetastoreFlusherTask::new(state.store.clone()));

    // --- Cluster membership upkeep ---
    spawn_task!(
        ctx,
        HealthCheckerTask::new(
            state.store.clone(),
            state.peers.clone(),
            state.cluster.clone(),
            config.cluster.health_check_interval,
        )
    );
    spawn_task!(
        ctx,
        BucketCountUpdaterTask::new(
            state.store.clone(),
            state.objects.clone(),
            state.cluster.clone(),
            config.cluster.bucket_count_interval,
        )
    );

    // --- State sync: one push loop per replicated entity kind ---
    macro_rules! spawn_sync {
        ($ty:ty) => {
            spawn_task!(
                ctx,
                SyncManager::<$ty>::new(
                    state.store.clone(),
                    state.peers.clone(),
                    config.cluster.sync_interval,
                )
            );
        };
    }
    spawn_sync!(Tenant);
    spawn_sync!(User);
    spawn_sync!(AccessKey);
    spawn_sync!(BucketPermission);
    spawn_sync!(BucketAcl);
    spawn_sync!(BucketConfig);
    spawn_sync!(IdpProvider);
    spawn_sync!(IdpGroupMapping);

    // --- Snapshot reconciliation & tombstone GC ---
    spawn_task!(
        ctx,
        StaleReconcilerTask::new(
            state.store.clone(),
            state.peers.clone(),
            config.cluster.health_check_interval,
            config.stale_after(),
        )
    );
    let retention = config
        .cluster
        .tombstone_retention
        .max(config.cluster.sync_interval * 10);
    spawn_task!(
        ctx,
        TombstoneSweeperTask::new(state.store.clone(), retention, TOMBSTONE_SWEEP_INTERVAL)
    );

    // --- Object replication ---
    spawn_task!(
        ctx,
        ReplicationDispatcherTask::new(
            state.replication.clone(),
            server_init.replication_task_rx,
        )
    );
    for worker_id in 0..config.cluster.replication_workers {
        spawn_task!(
            ctx,
            ReplicationWorker {
                worker_id,
                manager: state.replication.clone(),
                objects: state.objects.clone(),
            }
        );
    }

    // --- Bucket migration ---
    spawn_task!(ctx, MigrationRunnerTask::new(state.migrations.clone()));

    // --- Integrity scrubber ---
    if config.scrubber.enabled {
        spawn_task!(
            ctx,
            ScrubberTask::new(
                state.objects.clone(),
                state.integrity.clone(),
                config.scrubber.clone(),
            )
        );
    } else {
        info!("Integrity scrubber is disabled in the configuration.");
    }

    // --- Disk alerts ---
    spawn_task!(
        ctx,
        DiskMonitorTask::new(
            state.alerts.clone(),
            config.storage_root.clone(),
            config.alerts.disk_poll_interval,
        )
    );

    // --- Periodic in-memory housekeeping ---
    {
        let maintenance_state = state.clone();
        let mut shutdown_rx = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        maintenance_state.hub.purge_closed();
                        maintenance_state.rate_limiter.evict_idle();
                        maintenance_state.router.evict_expired();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            Ok(())
        });
    }

    // --- Metrics exporter ---
    if config.metrics.enabled {
        let metrics_state = state.clone();
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, shutdown_rx).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    // --- HTTP listeners ---
    let internal = axum::Router::new()
        .nest("/cluster/internal", internal_api::router(state.clone()));
    let api_listener = ctx
        .api_listener
        .take()
        .ok_or_else(|| anyhow!("API listener already consumed"))?;
    let mut api_shutdown = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        axum::serve(
            api_listener,
            internal.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            api_shutdown.recv().await.ok();
        })
        .await
        .map_err(|e| anyhow!("API listener failed: {e}"))
    });

    let gate: Arc<dyn control_api::AdminGate> = Arc::new(control_api::StaticTokenGate::new(
        config.admin_api_token.clone(),
    ));
    let console = control_api::router(state.clone(), gate);
    let console_listener = ctx
        .console_listener
        .take()
        .ok_or_else(|| anyhow!("console listener already consumed"))?;
    let mut console_shutdown = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        axum::serve(
            console_listener,
            console.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            console_shutdown.recv().await.ok();
        })
        .await
        .map_err(|e| anyhow!("console listener failed: {e}"))
    });

    info!("All background tasks have been spawned.");
    Ok(())
}
