/// Entry point: wires configuration, storage, the single-writer indexer
/// loop, the prefetcher, reorg detection, and the read-only HTTP surface
/// together, mirroring the teacher's `main.rs` wiring (axum server plus a
/// background monitoring task) but built around the op-stack/undo indexer
/// instead of the teacher's direct-write CF model.
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use claimhub::api::{self, ApiState};
use claimhub::config::{Cli, Config};
use claimhub::error::IndexerError;
use claimhub::indexer::Indexer;
use claimhub::metrics;
use claimhub::prefetcher;
use claimhub::reorg;
use claimhub::resolver::Resolver;
use claimhub::rpc::{JsonRpcClient, NodeRpc};
use claimhub::store::PrefixStore;
use claimhub::telemetry::{self, TelemetryConfig};

/// Exit codes per the chain-level error taxonomy: 0 clean, 1 fatal chain
/// error, 2 store corruption, 64 config error (matching sysexits' EX_CONFIG).
const EXIT_OK: u8 = 0;
const EXIT_CHAIN_ERROR: u8 = 1;
const EXIT_STORE_CORRUPT: u8 = 2;
const EXIT_CONFIG_ERROR: u8 = 64;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init_tracing(TelemetryConfig::default()) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    std::fs::create_dir_all(&config.db_dir).ok();

    let store = match PrefixStore::open(&config.db_dir, config.cache_mib, config.max_open_files, config.max_undo_depth) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open store");
            return ExitCode::from(EXIT_STORE_CORRUPT);
        }
    };

    let mut indexer = match Indexer::open(store, config.unsafe_prefixes.clone()) {
        Ok(i) => i,
        Err(e) => {
            error!(error = %e, "failed to open indexer");
            return ExitCode::from(EXIT_STORE_CORRUPT);
        }
    };

    let rpc: Arc<dyn NodeRpc> = Arc::new(JsonRpcClient::new(config.node_rpc_url.clone(), config.node_rpc_user.clone(), config.node_rpc_password.clone()));

    let secondary_dir = config.db_dir.join("secondary");
    std::fs::create_dir_all(&secondary_dir).ok();
    let resolver = match Resolver::open_secondary(&config.db_dir, &secondary_dir, &config.block_filter_channels, &config.resolve_filter_channels) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "failed to open resolver");
            return ExitCode::from(EXIT_STORE_CORRUPT);
        }
    };

    let http_state = ApiState { resolver: Arc::clone(&resolver), query_timeout: Duration::from_secs(10) };
    let http_addr = config.http_addr.clone();
    tokio::spawn(async move {
        let app = api::router(http_state);
        match tokio::net::TcpListener::bind(&http_addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "http server exited");
                }
            }
            Err(e) => error!(error = %e, addr = %http_addr, "failed to bind http listener"),
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            if let Err(e) = resolver.catch_up() {
                warn!(error = %e, "resolver failed to catch up with primary");
            }
        }
    });

    let mut rx = prefetcher::spawn(Arc::clone(&rpc), indexer.height() + 1, Duration::from_secs(2), 32);

    loop {
        let Some(fetched) = rx.recv().await else {
            info!("prefetcher channel closed, shutting down");
            return ExitCode::from(EXIT_OK);
        };

        if fetched.height != indexer.height() + 1 {
            // Prefetcher is ahead of a reorg we haven't processed yet; drop and refetch.
            continue;
        }

        match indexer.advance_block(&fetched.block) {
            Ok(event) => {
                metrics::BLOCKS_PROCESSED.inc();
                metrics::CURRENT_HEIGHT.set(event.height as i64);
                info!(height = event.height, touched = event.touched.len(), deleted = event.deleted.len(), "advanced block");

                if config.first_sync_shutdown {
                    match rpc.get_best_height() {
                        Ok(best) if best <= event.height => {
                            info!("caught up with upstream tip, shutting down (shutdown-on-sync)");
                            return ExitCode::from(EXIT_OK);
                        }
                        _ => {}
                    }
                }
            }
            Err(IndexerError::Chain(chain_err)) => {
                warn!(error = %chain_err, "chain error applying block, attempting reorg recovery");
                match reorg::roll_back_to_fork_point(&mut indexer, rpc.as_ref(), config.reorg_limit) {
                    Ok(info) => {
                        metrics::BLOCKS_ROLLED_BACK.inc_by(info.orphaned_blocks as u64);
                        rx = prefetcher::spawn(Arc::clone(&rpc), indexer.height() + 1, Duration::from_secs(2), 32);
                    }
                    Err(e) => {
                        error!(error = %e, "reorg recovery failed");
                        return ExitCode::from(EXIT_CHAIN_ERROR);
                    }
                }
            }
            Err(IndexerError::Store(e)) => {
                error!(error = %e, "store error applying block");
                return ExitCode::from(EXIT_STORE_CORRUPT);
            }
            Err(e) => {
                error!(error = %e, "fatal error applying block");
                return ExitCode::from(EXIT_CHAIN_ERROR);
            }
        }
    }
}
