use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use revcache_core::codec::{IdentityContainerCodec, JsonIndexCodec};
use revcache_core::config::RevcacheConfig;
use revcache_store::db::Db;
use revcache_store::storage_adapter::StorageAdapter;
use revcache_sync::{Client, Driver, HandshakeOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RevcacheConfig::load().context("loading configuration")?;
    tracing::info!(
        host = %config.upstream.host,
        port = config.upstream.port,
        rs_version = config.client.rs_version,
        "starting reconciliation run"
    );

    let db_path = config.resolved_db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("creating cache directory")?;
    }
    let db = Db::open(&db_path).with_context(|| format!("opening cache database at {}", db_path.display()))?;
    let mut storage = StorageAdapter::new(db);

    let addr = format!("{}:{}", config.upstream.host, config.upstream.port);
    let mut client = match Client::handshake(&addr, config.client.rs_version, [0; 4])
        .await
        .with_context(|| format!("handshaking with {addr}"))?
    {
        HandshakeOutcome::Rejected(code) => {
            tracing::warn!(code, "handshake rejected, cache is current or client is out of date; nothing to do");
            return Ok(());
        }
        HandshakeOutcome::Connected(client) => client,
    };

    let container_codec = IdentityContainerCodec;
    let index_codec = JsonIndexCodec;
    let mut driver = Driver::new(&client, &mut storage, &container_codec, &index_codec, config.client.rs_version);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before unix epoch")?
        .as_secs() as i64;

    let report = driver.run(now).await.context("running reconciliation pass")?;
    tracing::info!(
        updated = ?report.indexes_updated,
        unchanged = report.indexes_unchanged.len(),
        skipped = ?report.indexes_skipped_crc_mismatch,
        archives_downloaded = report.archives_downloaded,
        archives_removed = report.archives_removed,
        "reconciliation run finished"
    );

    client.close().await.context("closing connection")?;
    Ok(())
}
