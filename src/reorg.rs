/// Chain reorganization handling.
///
/// Detects when the upstream node's chain has diverged from ours and drives
/// the indexer's undo mechanism to walk back to the fork point, generalizing
/// the teacher's `reorg.rs` (`ReorgInfo`, `find_fork_point`, `handle_reorg`)
/// onto the already-implemented `Indexer::rollback_block` / op-stack replay
/// instead of per-column-family disconnect logic — the teacher rolls back
/// each CF by hand because it has no undo log; we have one, so a reorg is
/// just "roll back one block at a time until hashes agree."
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::ChainError;
use crate::indexer::Indexer;
use crate::rpc::NodeRpc;

/// Details about a completed reorg, surfaced for logging/metrics.
#[derive(Debug, Clone)]
pub struct ReorgInfo {
    pub fork_height: u32,
    pub orphaned_blocks: u32,
    pub old_tip_hash: [u8; 32],
}

/// Walks the indexer back one block at a time, asking the node for its hash
/// at each height, until the two chains agree — mirroring `find_fork_point`'s
/// backward walk but driven by `rollback_block` instead of manual CF deletes.
/// Returns an error if no common ancestor is found within `reorg_limit`
/// blocks, matching spec.md's fork-too-deep behavior.
pub fn roll_back_to_fork_point(indexer: &mut Indexer, rpc: &dyn NodeRpc, reorg_limit: u32) -> Result<ReorgInfo, ChainError> {
    let start_height = indexer.height();
    let old_tip_hash = indexer.tip_hash();
    let mut searched = 0;

    loop {
        if searched >= reorg_limit {
            return Err(ChainError::ForkTooDeep { searched, limit: reorg_limit });
        }

        let height = indexer.height();
        if height == 0 {
            // Rolled all the way back to genesis without agreement.
            return Err(ChainError::ForkTooDeep { searched, limit: reorg_limit });
        }

        let node_hash_at_height = rpc
            .get_block_hex_hashes(height, 1)
            .map_err(|_| ChainError::ForkTooDeep { searched, limit: reorg_limit })?
            .pop()
            .ok_or(ChainError::ForkTooDeep { searched, limit: reorg_limit })?;

        if node_hash_at_height == indexer.tip_hash() {
            info!(fork_height = height, orphaned = start_height - height, "reorg: found fork point");
            return Ok(ReorgInfo { fork_height: height, orphaned_blocks: start_height - height, old_tip_hash });
        }

        warn!(height, "reorg: hash mismatch, rolling back one block");
        indexer.rollback_block()?;
        searched += 1;
    }
}

/// Returns `true` if the node's hash at `indexer`'s current height disagrees
/// with our own tip — the same test the teacher's `detect_reorg` runs before
/// committing to the (expensive) fork-point search.
pub fn tip_diverged(indexer: &Indexer, rpc: &dyn NodeRpc) -> bool {
    let height = indexer.height();
    if height == 0 {
        return false;
    }
    match rpc.get_block_hex_hashes(height, 1) {
        Ok(hashes) => hashes.first().map(|h| *h != indexer.tip_hash()).unwrap_or(true),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::fake::FakeNodeRpc;
    use crate::store::PrefixStore;
    use crate::tx::{build_header, RawBlock, Transaction, TxIn, TxOut};
    use std::collections::HashSet;

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

    #[test]
    fn detects_no_divergence_on_matching_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store = PrefixStore::open(dir.path(), 1024, 512, 200).unwrap();
        let mut indexer = Indexer::open(store, HashSet::new()).unwrap();

        let genesis = coinbase_block([0u8; 32], 0);
        let genesis_hash = genesis.block_hash();
        indexer.advance_block(&genesis).unwrap();

        let fake = FakeNodeRpc::default();
        fake.blocks.lock().unwrap().push(genesis);
        assert!(!tip_diverged(&indexer, &fake));

        let wrong_block = coinbase_block([9u8; 32], 99);
        let fake2 = FakeNodeRpc::default();
        fake2.blocks.lock().unwrap().push(wrong_block);
        assert!(tip_diverged(&indexer, &fake2));
        assert_ne!(genesis_hash, fake2.blocks.lock().unwrap()[0].block_hash());
    }

    #[test]
    fn rolls_back_to_shared_fork_point() {
        let dir = tempfile::tempdir().unwrap();
        let store = PrefixStore::open(dir.path(), 1024, 512, 200).unwrap();
        let mut indexer = Indexer::open(store, HashSet::new()).unwrap();

        let genesis = coinbase_block([0u8; 32], 0);
        let genesis_hash = genesis.block_hash();
        indexer.advance_block(&genesis).unwrap();

        let ours_second = coinbase_block(genesis_hash, 1);
        indexer.advance_block(&ours_second).unwrap();

        // Node agrees on genesis but has a different second block.
        let theirs_second = coinbase_block(genesis_hash, 2);
        assert_ne!(ours_second.block_hash(), theirs_second.block_hash());

        let fake = FakeNodeRpc::default();
        fake.blocks.lock().unwrap().push(genesis);
        fake.blocks.lock().unwrap().push(theirs_second);

        let info = roll_back_to_fork_point(&mut indexer, &fake, 200).unwrap();
        assert_eq!(info.fork_height, 1);
        assert_eq!(info.orphaned_blocks, 1);
        assert_eq!(indexer.height(), 1);
        assert_eq!(indexer.tip_hash(), genesis_hash);
    }

    #[test]
    fn fork_deeper_than_limit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = PrefixStore::open(dir.path(), 1024, 512, 200).unwrap();
        let mut indexer = Indexer::open(store, HashSet::new()).unwrap();

        let genesis = coinbase_block([0u8; 32], 0);
        indexer.advance_block(&genesis).unwrap();

        let fake = FakeNodeRpc::default();
        fake.blocks.lock().unwrap().push(coinbase_block([7u8; 32], 123));

        let err = roll_back_to_fork_point(&mut indexer, &fake, 0).unwrap_err();
        assert!(matches!(err, ChainError::ForkTooDeep { .. }));
    }
}
