/// Block prefetcher.
///
/// Polls the upstream node ahead of the single-writer indexer thread and
/// feeds it fetched blocks over a bounded channel, so RPC round-trips never
/// stall block application. Generalizes the teacher's `monitor.rs` polling
/// loop (`run_block_monitor`, `get_rpc_chain_tip`/`index_block_from_rpc`)
/// into a channel producer instead of one function that both fetches and
/// writes to the database directly.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::rpc::NodeRpc;
use crate::tx::RawBlock;

/// A block fetched from the upstream node, paired with the height it was
/// fetched at (the indexer re-validates this against its own tip before
/// applying it).
pub struct PrefetchedBlock {
    pub height: u32,
    pub block: RawBlock,
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Spawns the prefetcher task and returns the receiving end of its channel.
/// `next_height` is the height of the first block the caller still needs;
/// the prefetcher fetches monotonically from there and blocks (via the
/// bounded channel) once it is `channel_capacity` blocks ahead of the
/// consumer.
pub fn spawn(rpc: Arc<dyn NodeRpc>, mut next_height: u32, poll_interval: Duration, channel_capacity: usize) -> mpsc::Receiver<PrefetchedBlock> {
    let (tx, rx) = mpsc::channel(channel_capacity);

    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let best_height = match fetch_best_height(&rpc).await {
                Ok(h) => h,
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "prefetcher: failed to query best height");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            if next_height > best_height {
                tokio::time::sleep(poll_interval).await;
                continue;
            }

            match fetch_block(&rpc, next_height).await {
                Ok(block) => {
                    backoff = INITIAL_BACKOFF;
                    debug!(height = next_height, "prefetcher: fetched block");
                    if tx.send(PrefetchedBlock { height: next_height, block }).await.is_err() {
                        // Receiver dropped: indexer shut down.
                        return;
                    }
                    next_height += 1;
                }
                Err(e) => {
                    warn!(height = next_height, error = %e, backoff_ms = backoff.as_millis() as u64, "prefetcher: failed to fetch block");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    });

    rx
}

async fn fetch_best_height(rpc: &Arc<dyn NodeRpc>) -> Result<u32, crate::error::TransientUpstream> {
    let rpc = Arc::clone(rpc);
    tokio::task::spawn_blocking(move || rpc.get_best_height())
        .await
        .unwrap_or_else(|e| Err(crate::error::TransientUpstream::new(format!("join error: {e}"))))
}

async fn fetch_block(rpc: &Arc<dyn NodeRpc>, height: u32) -> Result<RawBlock, crate::error::TransientUpstream> {
    let rpc = Arc::clone(rpc);
    tokio::task::spawn_blocking(move || {
        let hashes = rpc.get_block_hex_hashes(height, 1)?;
        let mut blocks = rpc.get_raw_blocks(&hashes)?;
        blocks.pop().ok_or_else(|| crate::error::TransientUpstream::new("node returned no block for requested hash"))
    })
    .await
    .unwrap_or_else(|e| Err(crate::error::TransientUpstream::new(format!("join error: {e}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::fake::FakeNodeRpc;
    use crate::tx::{build_header, Transaction, TxIn, TxOut};

    fn coinbase_block(prev: [u8; 32], nonce: u32) -> RawBlock {
        let tx = Transaction {
            version: 1,
            inputs: vec![TxIn { prev_tx_hash: [0u8; 32], prev_index: 0xffff_ffff, script_sig: vec![], sequence: 0xffffffff }],
            outputs: vec![TxOut { amount: 5_000_000_000, script_pubkey: vec![] }],
            locktime: 0,
        };
        let header = build_header(1, &prev, &[0u8; 32], &[0u8; 32], 1_600_000_000 + nonce, 0x1d00ffff, nonce);
        RawBlock { header, transactions: vec![tx] }
    }

    #[tokio::test]
    async fn prefetcher_streams_blocks_in_order() {
        let fake = FakeNodeRpc::default();
        let genesis = coinbase_block([0u8; 32], 0);
        let genesis_hash = genesis.block_hash();
        let second = coinbase_block(genesis_hash, 1);
        fake.blocks.lock().unwrap().push(genesis.clone());
        fake.blocks.lock().unwrap().push(second.clone());
        let rpc: Arc<dyn NodeRpc> = Arc::new(fake);

        let mut rx = spawn(rpc, 1, Duration::from_millis(10), 8);

        let first = rx.recv().await.expect("first block");
        assert_eq!(first.height, 1);
        assert_eq!(first.block.block_hash(), genesis_hash);

        let second_received = rx.recv().await.expect("second block");
        assert_eq!(second_received.height, 2);
        assert_eq!(second_received.block.block_hash(), second.block_hash());
    }
}
