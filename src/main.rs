mod bencode;
mod config;
mod indexer;
mod krpc;
mod leech;
mod manager;
mod metadata;
mod routing;
mod seen;
mod sink;
mod storage;
mod token;

use anyhow::Context;
use storage::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter().into()),
        )
        .init();

    if config.leech_max_n > config::LEECH_FD_WARN {
        tracing::warn!(
            leech_max_n = config.leech_max_n,
            "trawler: high leech concurrency may exhaust file descriptors; check `ulimit -n`"
        );
    }

    std::fs::create_dir_all(&config.data_dir).context("create data dir")?;
    let db = storage::SledDatabase::open(config.data_dir.join("sled")).context("open sled db")?;

    let (mut manager, mut candidates) = manager::Manager::start(
        &config.indexer_addrs,
        config.indexer(),
        config.indexer_output_capacity,
        config.shutdown_grace(),
    )
    .await?;
    let (sink, mut drain) = sink::MetadataSink::new(config.sink());

    tracing::info!(
        addrs = ?manager.local_addrs(),
        max_leeches = config.leech_max_n,
        torrents = db.torrent_count(),
        "trawler: started"
    );

    let result = run(&db, &sink, &mut candidates, &mut drain).await;

    manager.terminate().await;
    tracing::debug!(in_flight = sink.in_flight(), "trawler: abandoning unfinished fetches");
    db.close().context("close database")?;
    tracing::info!("trawler: stopped");
    result
}

/// Event loop: candidates into the sink, fetched metadata into storage, until
/// Ctrl-C or the indexers go away.
async fn run(
    db: &impl Database,
    sink: &sink::MetadataSink,
    candidates: &mut manager::CandidateStream,
    drain: &mut tokio::sync::mpsc::Receiver<metadata::TorrentMetadata>,
) -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("listen for ctrl-c")?;
                tracing::info!("trawler: interrupted; shutting down");
                return Ok(());
            }
            candidate = candidates.recv() => {
                let Some(candidate) = candidate else {
                    tracing::warn!("trawler: all indexer nodes stopped");
                    return Ok(());
                };
                if db.does_torrent_exist(&candidate.info_hash).context("existence check")? {
                    continue;
                }
                sink.submit(candidate);
            }
            Some(metadata) = drain.recv() => {
                let inserted = db.add_new_torrent(&metadata).context("store torrent")?;
                if inserted {
                    tracing::info!(
                        hash = %metadata.hex(),
                        name = %metadata.name,
                        files = metadata.files.len(),
                        size = metadata.total_size,
                        "trawler: fetched"
                    );
                }
            }
        }
    }
}
