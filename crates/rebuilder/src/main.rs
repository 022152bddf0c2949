use anyhow::Context;

use sheetcache_infra::db;
use sheetcache_infra::{
    PostgresLinkSource, PostgresRebuildQueue, PostgresSnapshotStore, RebuildConfig,
    RebuildScheduler, RebuildWorker, SnapshotBuilder,
};
use sheetcache_observability::Diagnostics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sheetcache_observability::init();

    let config = RebuildConfig::from_env().context("invalid rebuild configuration")?;
    let database_url = config.require_database_url()?;

    let pool = db::connect(database_url, config.max_connections)
        .await
        .context("failed to connect to postgres")?;
    db::ensure_schema(&pool)
        .await
        .context("failed to apply snapshot schema")?;

    let worker = RebuildWorker::new(
        PostgresRebuildQueue::new(pool.clone()),
        PostgresSnapshotStore::new(pool.clone()),
        SnapshotBuilder::new(PostgresLinkSource::new(pool.clone())),
        config.worker_id.clone(),
    )
    .with_diagnostics(Diagnostics::from_env());
    let scheduler = RebuildScheduler::new(worker).with_batch_size(config.batch_size);

    tracing::info!(
        worker_id = %config.worker_id,
        batch_size = config.batch_size,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "snapshot rebuilder starting"
    );

    let poller = scheduler.spawn_poller(config.poll_interval);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    poller.shutdown().await;
    scheduler.wait_idle().await;
    pool.close().await;

    tracing::info!("snapshot rebuilder stopped");
    Ok(())
}
