/// Block Indexer
///
/// The single-writer state machine: advances one block at a time, applying
/// every row mutation through a `RevertableOpStack` and committing the
/// result with an undo record (spec.md §4.4). Also runs the takeover /
/// activation pass and rolls a block back on reorg.
///
/// Every helper here that needs to see "state as modified earlier in this
/// same block but not yet committed" goes through `BlockView`, a thin
/// merge of the committed store and the in-flight op-stack. Integrity
/// checks (the `oracle` argument to `stack.put`/`stack.delete`) always use
/// `&self.store` directly — `RevertableOpStack::append` already reconciles
/// same-block Put/Delete sequences on its own via `last_op_index`, so the
/// oracle only ever needs to know about *committed* state.
use std::collections::{BTreeMap, HashMap, HashSet};

use tokio::sync::broadcast;

use crate::claim_meta::ClaimMeta;
use crate::codec::*;
use crate::error::{ChainError, IndexerError};
use crate::hashes::claim_hash_from_outpoint;
use crate::revertable::{OpKind, RevertableOpStack};
use crate::script::{decode_output_script, ClaimOp};
use crate::signing::verify_channel_signature;
use crate::store::PrefixStore;
use crate::tx::{RawBlock, Transaction, TxIn, TxOut};

/// Maximum takeover delay, in blocks, per spec.md §4.4.2.
const MAX_TAKEOVER_DELAY: u32 = 4032;
const TAKEOVER_DELAY_DIVISOR: u32 = 32;
/// Blocks after which an unspent claim/support expires and is auto-abandoned.
const EXPIRATION_BLOCKS: u32 = 262_974;

fn full_key(prefix: Prefix, suffix: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + suffix.len());
    out.push(prefix as u8);
    out.extend_from_slice(suffix);
    out
}

/// Emitted on every successfully committed (or rolled back) block, fed into
/// the broadcast channel downstream consumers subscribe to.
#[derive(Debug, Clone)]
pub struct BlockEvent {
    pub height: u32,
    pub block_hash: [u8; 32],
    pub touched: Vec<[u8; 20]>,
    pub deleted: Vec<[u8; 20]>,
}

/// Merges committed store state with the ops staged so far this block, so
/// business logic can read its own in-flight writes.
struct BlockView<'a> {
    store: &'a PrefixStore,
    stack: &'a RevertableOpStack,
}

impl<'a> BlockView<'a> {
    fn new(store: &'a PrefixStore, stack: &'a RevertableOpStack) -> Self {
        Self { store, stack }
    }

    /// `suffix` is the codec-level key, without the leading prefix byte.
    fn get(&self, prefix: Prefix, suffix: &[u8]) -> Option<Vec<u8>> {
        let full = full_key(prefix, suffix);
        match self.stack.get_last_op_for_key(&full) {
            Some(op) => {
                if op.kind == OpKind::Put {
                    Some(op.value.clone())
                } else {
                    None
                }
            }
            None => self.store.get(prefix, &full).ok().flatten(),
        }
    }

    /// Returns `(suffix_key, value)` pairs — the leading prefix byte is
    /// already stripped for the caller's convenience.
    fn iter_prefix(&self, prefix: Prefix, suffix_prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let full_prefix = full_key(prefix, suffix_prefix);
        let mut map: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        if let Ok(iter) = self.store.iter_prefix(prefix, &full_prefix, false) {
            for (k, v) in iter {
                map.insert(k.to_vec(), v.to_vec());
            }
        }
        for op in self.stack.ops() {
            if op.key.starts_with(&full_prefix) {
                match op.kind {
                    OpKind::Put => {
                        map.insert(op.key.clone(), op.value.clone());
                    }
                    OpKind::Delete => {
                        map.remove(&op.key);
                    }
                }
            }
        }
        map.into_iter().map(|(k, v)| (k[1..].to_vec(), v)).collect()
    }
}

/// Per-block scratch state, discarded after the block commits.
#[derive(Default)]
struct BlockContext {
    touched_claims: HashSet<[u8; 20]>,
    removed_claims: HashSet<[u8; 20]>,
    /// Claims being abandoned this block — lets `compute_delay` treat a
    /// controlling claim abandoned earlier in the block as already gone.
    abandoning_this_block: HashSet<[u8; 20]>,
    /// Outpoints already run through `abandon_claim` this block (the
    /// double-abandon idempotency guard, SPEC_FULL.md §9).
    abandoned_outpoints: HashSet<(u32, u16)>,
    /// Channels created earlier this block: claim_hash -> public key.
    channels_created_this_block: HashMap<[u8; 20], Vec<u8>>,
    /// Names whose controlling claim was abandoned this block.
    controller_abandoned_names: HashSet<Vec<u8>>,
    /// First-touch snapshot of a claim's (name, effective_amount, tx_num,
    /// nout) *before* this block changed anything, so the effective-amount
    /// index can delete the exact old row once, later. `None` inside the
    /// `Option` means the claim had no effective-amount row before this
    /// block (brand new); the outer `Option`-less absence from the map
    /// means "not yet touched".
    old_effective_snapshot: HashMap<[u8; 20], Option<(Vec<u8>, u64, u32, u16)>>,
    /// (hashX, tx_nums touched) this block, folded into one AddressHistory row.
    address_touched: HashMap<[u8; 11], Vec<u32>>,
    /// Names with a claim/support that activated immediately (zero delay)
    /// this block, fed into the takeover pass alongside scheduled activations.
    activations_this_block: Vec<(Vec<u8>, [u8; 20])>,
}

pub struct Indexer {
    store: PrefixStore,
    unsafe_prefixes: HashSet<u8>,
    height: u32,
    tip_hash: [u8; 32],
    genesis_hash: [u8; 32],
    next_tx_num: u32,
    events: broadcast::Sender<BlockEvent>,
}

impl Indexer {
    pub fn open(store: PrefixStore, unsafe_prefixes: HashSet<u8>) -> Result<Self, IndexerError> {
        let (events, _) = broadcast::channel(1024);
        let mut indexer = Self { store, unsafe_prefixes, height: 0, tip_hash: [0u8; 32], genesis_hash: [0u8; 32], next_tx_num: 0, events };
        if let Some(buf) = indexer.store.get(Prefix::DbState, &full_key(Prefix::DbState, DB_STATE_KEY))? {
            let st = unpack_db_state(&buf)?;
            indexer.height = st.height;
            indexer.tip_hash = st.tip_hash;
            indexer.genesis_hash = st.genesis_hash;
            indexer.next_tx_num = st.tx_count;
        }
        Ok(indexer)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BlockEvent> {
        self.events.subscribe()
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tip_hash(&self) -> [u8; 32] {
        self.tip_hash
    }

    pub fn store(&self) -> &PrefixStore {
        &self.store
    }

    // -----------------------------------------------------------------
    // Advance
    // -----------------------------------------------------------------

    pub fn advance_block(&mut self, block: &RawBlock) -> Result<BlockEvent, IndexerError> {
        let height = self.height + 1;
        let block_hash = block.block_hash();
        if block.prev_hash() != self.tip_hash {
            return Err(ChainError::Discontinuous { height, expected_prev: hex::encode(self.tip_hash), got_prev: hex::encode(block.prev_hash()) }.into());
        }

        let mut stack = RevertableOpStack::new(self.unsafe_prefixes.clone());
        let mut ctx = BlockContext::default();

        stack.put(full_key(Prefix::BlockHeader, &pack_height(height)), pack_block_header(&block.header), &self.store)?;
        stack.put(full_key(Prefix::BlockHash, &pack_height(height)), pack_block_hash(&block_hash), &self.store)?;

        let mut tx_num = self.next_tx_num;
        for tx in &block.transactions {
            let tx_hash = tx.txid();
            stack.put(full_key(Prefix::Tx, &tx_hash), tx.serialize(), &self.store)?;
            stack.put(full_key(Prefix::TxNum, &tx_hash), pack_tx_num_value(tx_num), &self.store)?;
            stack.put(full_key(Prefix::TxHash, &pack_tx_hash_key(tx_num)), pack_tx_hash_value(&tx_hash), &self.store)?;

            let mut spent_claims_in_tx: HashMap<[u8; 20], (u32, u16)> = HashMap::new();
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    self.spend_input(&mut stack, &mut ctx, input, tx_num, &mut spent_claims_in_tx)?;
                }
            }
            for (nout, output) in tx.outputs.iter().enumerate() {
                self.process_output(&mut stack, &mut ctx, height, tx_num, nout as u16, output, tx_hash, &mut spent_claims_in_tx)?;
            }
            for (claim_hash, (old_tx_num, old_nout)) in spent_claims_in_tx {
                self.abandon_claim(&mut stack, &mut ctx, claim_hash, old_tx_num, old_nout)?;
            }
            tx_num += 1;
        }
        stack.put(full_key(Prefix::TxCount, &pack_height(height)), pack_tx_count_value(tx_num), &self.store)?;

        self.expire_claims(&mut stack, &mut ctx, height)?;
        self.run_takeover_pass(&mut stack, &mut ctx, height)?;
        self.maintain_effective_amount_index(&mut stack, &mut ctx, height)?;

        for (hash_x, nums) in &ctx.address_touched {
            let key = full_key(Prefix::AddressHistory, &pack_address_history_key(hash_x, height));
            stack.put(key, pack_address_history_value(nums), &self.store)?;
        }

        let touched_vec: Vec<[u8; 20]> = ctx.touched_claims.difference(&ctx.removed_claims).cloned().collect();
        let deleted_vec: Vec<[u8; 20]> = ctx.removed_claims.iter().cloned().collect();
        stack.put(
            full_key(Prefix::TouchedOrDeleted, &pack_height(height)),
            pack_touched_or_deleted_value(&TouchedOrDeletedValue { touched: touched_vec.clone(), deleted: deleted_vec.clone() }),
            &self.store,
        )?;

        let genesis_hash = if height == 1 { block_hash } else { self.genesis_hash };
        let old_db_state = self.store.get(Prefix::DbState, &full_key(Prefix::DbState, DB_STATE_KEY))?;
        if let Some(old) = old_db_state {
            stack.delete(full_key(Prefix::DbState, DB_STATE_KEY), old, &self.store)?;
        }
        let db_state = DbState { genesis_hash, height, tx_count: tx_num, tip_hash: block_hash, utxo_flush_count: 0, wall_time: block.timestamp(), first_sync: false, db_version: 1 };
        stack.put(full_key(Prefix::DbState, DB_STATE_KEY), pack_db_state(&db_state), &self.store)?;

        crate::metrics::OP_STACK_SIZE.observe(stack.ops().count() as f64);
        self.store.commit(&mut stack, height, &block_hash)?;

        self.height = height;
        self.tip_hash = block_hash;
        self.genesis_hash = genesis_hash;
        self.next_tx_num = tx_num;

        crate::metrics::BLOCKS_PROCESSED.inc();
        crate::metrics::CURRENT_HEIGHT.set(height as i64);

        let event = BlockEvent { height, block_hash, touched: touched_vec, deleted: deleted_vec };
        let _ = self.events.send(event.clone());
        Ok(event)
    }

    /// Rolls the current tip back by one block, via its stored undo record.
    pub fn rollback_block(&mut self) -> Result<(), IndexerError> {
        if self.height == 0 {
            return Ok(());
        }
        let height = self.height;
        let block_hash = self.tip_hash;
        self.store.rollback(height, &block_hash, &self.unsafe_prefixes)?;

        self.height = height - 1;
        self.tip_hash = if self.height == 0 {
            [0u8; 32]
        } else {
            self.store
                .get(Prefix::BlockHash, &full_key(Prefix::BlockHash, &pack_height(self.height)))?
                .map(|b| unpack_block_hash(&b))
                .transpose()?
                .unwrap_or([0u8; 32])
        };
        if let Some(buf) = self.store.get(Prefix::DbState, &full_key(Prefix::DbState, DB_STATE_KEY))? {
            let st = unpack_db_state(&buf)?;
            self.next_tx_num = st.tx_count;
            self.genesis_hash = st.genesis_hash;
        } else {
            self.next_tx_num = 0;
            self.genesis_hash = [0u8; 32];
        }

        crate::metrics::BLOCKS_ROLLED_BACK.inc();
        crate::metrics::CURRENT_HEIGHT.set(self.height as i64);
        let _ = self.events.send(BlockEvent { height: self.height, block_hash: self.tip_hash, touched: Vec::new(), deleted: Vec::new() });
        Ok(())
    }

    // -----------------------------------------------------------------
    // Per-transaction processing
    // -----------------------------------------------------------------

    fn spend_input(
        &self,
        stack: &mut RevertableOpStack,
        ctx: &mut BlockContext,
        input: &TxIn,
        spending_tx_num: u32,
        spent_claims_in_tx: &mut HashMap<[u8; 20], (u32, u16)>,
    ) -> Result<(), IndexerError> {
        let prev_tx_num = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::TxNum, &input.prev_tx_hash).and_then(|b| unpack_tx_num_value(&b).ok())
        };
        let Some(prev_tx_num) = prev_tx_num else { return Ok(()) };
        let nout = input.prev_index as u16;

        let short_txid: [u8; 4] = input.prev_tx_hash[0..4].try_into().unwrap();
        let hashx_suffix = pack_hashx_utxo_key(&short_txid, prev_tx_num, nout);
        let hashx_val = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::HashXUtxo, &hashx_suffix)
        };
        if let Some(hx_buf) = hashx_val {
            let hash_x = unpack_hashx_utxo_value(&hx_buf)?;
            let utxo_suffix = pack_utxo_key(&hash_x, prev_tx_num, nout);
            let utxo_val = {
                let view = BlockView::new(&self.store, stack);
                view.get(Prefix::Utxo, &utxo_suffix)
            };
            if let Some(amount_buf) = utxo_val {
                stack.delete(full_key(Prefix::Utxo, &utxo_suffix), amount_buf, &self.store)?;
            }
            stack.delete(full_key(Prefix::HashXUtxo, &hashx_suffix), hx_buf, &self.store)?;
            ctx.address_touched.entry(hash_x).or_default().push(spending_tx_num);
        }

        let txo_suffix = pack_txo_key(prev_tx_num, nout);
        let claim_val = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::TxoToClaim, &txo_suffix)
        };
        if let Some(buf) = claim_val {
            let v = unpack_txo_to_claim_value(&buf)?;
            spent_claims_in_tx.insert(v.claim_hash, (prev_tx_num, nout));
            return Ok(());
        }
        let support_val = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::SupportToClaim, &txo_suffix)
        };
        if let Some(buf) = support_val {
            let claim_hash = unpack_support_to_claim_value(&buf)?;
            self.spend_support(stack, ctx, claim_hash, prev_tx_num, nout)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_output(
        &self,
        stack: &mut RevertableOpStack,
        ctx: &mut BlockContext,
        height: u32,
        tx_num: u32,
        nout: u16,
        output: &TxOut,
        tx_hash: [u8; 32],
        spent_claims_in_tx: &mut HashMap<[u8; 20], (u32, u16)>,
    ) -> Result<(), IndexerError> {
        let decoded = decode_output_script(&output.script_pubkey);
        if let Some(hash_x) = decoded.hash_x {
            stack.put(full_key(Prefix::Utxo, &pack_utxo_key(&hash_x, tx_num, nout)), pack_utxo_value(output.amount), &self.store)?;
            let short_txid: [u8; 4] = tx_hash[0..4].try_into().unwrap();
            stack.put(full_key(Prefix::HashXUtxo, &pack_hashx_utxo_key(&short_txid, tx_num, nout)), pack_hashx_utxo_value(&hash_x), &self.store)?;
            ctx.address_touched.entry(hash_x).or_default().push(tx_num);
        }

        match decoded.claim_op {
            Some(ClaimOp::Claim { name, meta_bytes }) => {
                let claim_hash = claim_hash_from_outpoint(&tx_hash, nout as u32);
                let meta = ClaimMeta::decode(&meta_bytes);
                self.add_new_claim(stack, ctx, height, &name, &meta, claim_hash, tx_num, nout, output.amount)?;
                crate::metrics::CLAIMS_ADDED.inc();
            }
            Some(ClaimOp::Update { claim_hash, name, meta_bytes }) => {
                spent_claims_in_tx.remove(&claim_hash);
                let meta = ClaimMeta::decode(&meta_bytes);
                self.update_claim(stack, ctx, height, claim_hash, &name, &meta, tx_num, nout, output.amount)?;
                crate::metrics::CLAIMS_ADDED.inc();
            }
            Some(ClaimOp::Support { claim_hash, .. }) => {
                self.add_support(stack, ctx, height, claim_hash, tx_num, nout, output.amount)?;
            }
            None => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Claim lifecycle
    // -----------------------------------------------------------------

    fn note_touched(&self, ctx: &mut BlockContext, claim_hash: [u8; 20]) {
        ctx.touched_claims.insert(claim_hash);
        if ctx.old_effective_snapshot.contains_key(&claim_hash) {
            return;
        }
        let snap = self
            .store
            .get(Prefix::ClaimToTxo, &full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash)))
            .ok()
            .flatten()
            .and_then(|buf| unpack_claim_to_txo_value(&buf).ok())
            .map(|v| {
                let amount = self.effective_amount_committed(&claim_hash, self.height);
                (v.name, amount, v.tx_num, v.nout)
            });
        ctx.old_effective_snapshot.insert(claim_hash, snap);
    }

    fn lookup_channel_pubkey(&self, stack: &RevertableOpStack, ctx: &BlockContext, channel_hash: &[u8; 20]) -> Option<Vec<u8>> {
        if let Some(pk) = ctx.channels_created_this_block.get(channel_hash) {
            return Some(pk.clone());
        }
        let view = BlockView::new(&self.store, stack);
        view.get(Prefix::ClaimInfo, &pack_claim_info_key(channel_hash))
            .and_then(|b| unpack_claim_info_value(&b).ok())
            .filter(|v| v.is_channel)
            .and_then(|v| v.channel_public_key)
    }

    /// Verifies a claim/update's channel signature (if any) against the
    /// signing channel's stored public key. Returns `(sig_valid,
    /// signing_channel_hash)`.
    fn resolve_signature(&self, stack: &RevertableOpStack, ctx: &BlockContext, meta: &ClaimMeta) -> (bool, Option<[u8; 20]>) {
        let Some(ch_hash) = meta.signing_channel_hash else { return (false, None) };
        let (Some(sig), Some(digest)) = (&meta.signature, &meta.signature_digest) else { return (false, None) };
        let Some(pubkey) = self.lookup_channel_pubkey(stack, ctx, &ch_hash) else { return (false, None) };
        let Ok(d) = <[u8; 32]>::try_from(digest.as_slice()) else { return (false, None) };
        if verify_channel_signature(&pubkey, &d, sig) {
            (true, Some(ch_hash))
        } else {
            (false, None)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_new_claim(
        &self,
        stack: &mut RevertableOpStack,
        ctx: &mut BlockContext,
        height: u32,
        name: &[u8],
        meta: &ClaimMeta,
        claim_hash: [u8; 20],
        tx_num: u32,
        nout: u16,
        amount: u64,
    ) -> Result<(), IndexerError> {
        self.note_touched(ctx, claim_hash);
        let (sig_valid, signing_channel_hash) = self.resolve_signature(stack, ctx, meta);

        let value = ClaimToTxoValue { tx_num, nout, root_tx_num: tx_num, root_pos: nout, amount, sig_valid, name: name.to_vec() };
        stack.put(full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash)), pack_claim_to_txo_value(&value), &self.store)?;
        stack.put(
            full_key(Prefix::TxoToClaim, &pack_txo_key(tx_num, nout)),
            pack_txo_to_claim_value(&TxoToClaimValue { claim_hash, name: name.to_vec() }),
            &self.store,
        )?;
        stack.put(
            full_key(Prefix::ClaimShortId, &pack_claim_short_id_key(name, hex::encode(claim_hash).as_bytes(), tx_num, nout)),
            pack_claim_short_id_value(tx_num, nout),
            &self.store,
        )?;

        if sig_valid {
            if let Some(ch) = signing_channel_hash {
                stack.put(
                    full_key(Prefix::ChannelToClaim, &pack_channel_to_claim_key(&ch, name, tx_num, nout)),
                    pack_channel_to_claim_value(&claim_hash),
                    &self.store,
                )?;
                stack.put(
                    full_key(Prefix::ClaimToChannel, &pack_claim_to_channel_key(&claim_hash, tx_num, nout)),
                    pack_claim_to_channel_value(&ch),
                    &self.store,
                )?;
            }
        }

        if meta.is_channel {
            if let Some(pk) = &meta.channel_public_key {
                ctx.channels_created_this_block.insert(claim_hash, pk.clone());
            }
            let info = ClaimInfoValue { is_channel: true, channel_public_key: meta.channel_public_key.clone() };
            stack.put(full_key(Prefix::ClaimInfo, &pack_claim_info_key(&claim_hash)), pack_claim_info_value(&info), &self.store)?;
        }

        if meta.is_repost {
            if let Some(reposted) = meta.reposted_claim_hash {
                stack.put(full_key(Prefix::Repost, &pack_repost_key(&claim_hash)), pack_repost_value(&reposted), &self.store)?;
                stack.put(full_key(Prefix::Reposted, &pack_reposted_key(&reposted, tx_num, nout)), pack_reposted_value(&claim_hash), &self.store)?;
            }
        }

        let expiration_height = height + EXPIRATION_BLOCKS;
        stack.put(
            full_key(Prefix::ClaimExpiration, &pack_claim_expiration_key(expiration_height, tx_num, nout)),
            pack_claim_expiration_value(&ExpirationValue { claim_hash, name: name.to_vec() }),
            &self.store,
        )?;

        let delay = {
            let view = BlockView::new(&self.store, stack);
            self.compute_delay(&view, name, height, &claim_hash, ctx, amount)
        };
        self.stage_activation(stack, ctx, height, claim_hash, name.to_vec(), TxoType::Claim, tx_num, nout, amount, delay)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn update_claim(
        &self,
        stack: &mut RevertableOpStack,
        ctx: &mut BlockContext,
        height: u32,
        claim_hash: [u8; 20],
        name: &[u8],
        meta: &ClaimMeta,
        new_tx_num: u32,
        new_nout: u16,
        amount: u64,
    ) -> Result<(), IndexerError> {
        self.note_touched(ctx, claim_hash);
        let old = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash)).and_then(|b| unpack_claim_to_txo_value(&b).ok())
        };
        let Some(old) = old else {
            // Update references a claim_hash that doesn't currently exist
            // (adversarial or stale reference); treat the output as a new claim.
            return self.add_new_claim(stack, ctx, height, name, meta, claim_hash, new_tx_num, new_nout, amount);
        };

        stack.delete(full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash)), pack_claim_to_txo_value(&old), &self.store)?;
        stack.delete(
            full_key(Prefix::TxoToClaim, &pack_txo_key(old.tx_num, old.nout)),
            pack_txo_to_claim_value(&TxoToClaimValue { claim_hash, name: old.name.clone() }),
            &self.store,
        )?;

        let old_short_key_suffix = pack_claim_short_id_key(&old.name, hex::encode(claim_hash).as_bytes(), old.root_tx_num, old.root_pos);
        let old_short_val = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::ClaimShortId, &old_short_key_suffix)
        };
        if let Some(v) = old_short_val {
            stack.delete(full_key(Prefix::ClaimShortId, &old_short_key_suffix), v, &self.store)?;
        }

        if old.sig_valid {
            let channel_hash = {
                let view = BlockView::new(&self.store, stack);
                view.get(Prefix::ClaimToChannel, &pack_claim_to_channel_key(&claim_hash, old.tx_num, old.nout)).and_then(|b| unpack_claim_to_channel_value(&b).ok())
            };
            if let Some(ch) = channel_hash {
                let ctc_suffix = pack_channel_to_claim_key(&ch, &old.name, old.tx_num, old.nout);
                let ctc_val = {
                    let view = BlockView::new(&self.store, stack);
                    view.get(Prefix::ChannelToClaim, &ctc_suffix)
                };
                if let Some(v) = ctc_val {
                    stack.delete(full_key(Prefix::ChannelToClaim, &ctc_suffix), v, &self.store)?;
                }
                let cc_suffix = pack_claim_to_channel_key(&claim_hash, old.tx_num, old.nout);
                let cc_val = {
                    let view = BlockView::new(&self.store, stack);
                    view.get(Prefix::ClaimToChannel, &cc_suffix)
                };
                if let Some(v) = cc_val {
                    stack.delete(full_key(Prefix::ClaimToChannel, &cc_suffix), v, &self.store)?;
                }
            }
        }

        self.withdraw_activation(stack, claim_hash, TxoType::Claim, old.tx_num, old.nout)?;

        let (sig_valid, signing_channel_hash) = self.resolve_signature(stack, ctx, meta);
        let new_value = ClaimToTxoValue { tx_num: new_tx_num, nout: new_nout, root_tx_num: old.root_tx_num, root_pos: old.root_pos, amount, sig_valid, name: name.to_vec() };
        stack.put(full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash)), pack_claim_to_txo_value(&new_value), &self.store)?;
        stack.put(
            full_key(Prefix::TxoToClaim, &pack_txo_key(new_tx_num, new_nout)),
            pack_txo_to_claim_value(&TxoToClaimValue { claim_hash, name: name.to_vec() }),
            &self.store,
        )?;
        stack.put(
            full_key(Prefix::ClaimShortId, &pack_claim_short_id_key(name, hex::encode(claim_hash).as_bytes(), old.root_tx_num, old.root_pos)),
            pack_claim_short_id_value(new_tx_num, new_nout),
            &self.store,
        )?;

        if sig_valid {
            if let Some(ch) = signing_channel_hash {
                stack.put(
                    full_key(Prefix::ChannelToClaim, &pack_channel_to_claim_key(&ch, name, new_tx_num, new_nout)),
                    pack_channel_to_claim_value(&claim_hash),
                    &self.store,
                )?;
                stack.put(
                    full_key(Prefix::ClaimToChannel, &pack_claim_to_channel_key(&claim_hash, new_tx_num, new_nout)),
                    pack_claim_to_channel_value(&ch),
                    &self.store,
                )?;
            }
        }

        if meta.is_channel {
            let info = ClaimInfoValue { is_channel: true, channel_public_key: meta.channel_public_key.clone() };
            let key = full_key(Prefix::ClaimInfo, &pack_claim_info_key(&claim_hash));
            let old_info = {
                let view = BlockView::new(&self.store, stack);
                view.get(Prefix::ClaimInfo, &pack_claim_info_key(&claim_hash))
            };
            if let Some(v) = old_info {
                stack.delete(key.clone(), v, &self.store)?;
            }
            stack.put(key, pack_claim_info_value(&info), &self.store)?;
            if let Some(pk) = &meta.channel_public_key {
                ctx.channels_created_this_block.insert(claim_hash, pk.clone());
            }
        }

        let delay = {
            let view = BlockView::new(&self.store, stack);
            self.compute_delay(&view, name, height, &claim_hash, ctx, amount)
        };
        self.stage_activation(stack, ctx, height, claim_hash, name.to_vec(), TxoType::Claim, new_tx_num, new_nout, amount, delay)?;
        Ok(())
    }

    fn add_support(&self, stack: &mut RevertableOpStack, ctx: &mut BlockContext, height: u32, claim_hash: [u8; 20], tx_num: u32, nout: u16, amount: u64) -> Result<(), IndexerError> {
        let claim_name = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash)).and_then(|b| unpack_claim_to_txo_value(&b).ok()).map(|v| v.name)
        };
        let Some(name) = claim_name else {
            // Support references a claim that doesn't exist (never existed,
            // or was already abandoned earlier this block); drop it.
            return Ok(());
        };
        self.note_touched(ctx, claim_hash);
        stack.put(full_key(Prefix::ClaimToSupport, &pack_claim_to_support_key(&claim_hash, tx_num, nout)), pack_claim_to_support_value(amount), &self.store)?;
        stack.put(full_key(Prefix::SupportToClaim, &pack_support_to_claim_key(tx_num, nout)), pack_support_to_claim_value(&claim_hash), &self.store)?;

        let delay = {
            let view = BlockView::new(&self.store, stack);
            self.compute_delay(&view, &name, height, &claim_hash, ctx, amount)
        };
        self.stage_activation(stack, ctx, height, claim_hash, name, TxoType::Support, tx_num, nout, amount, delay)?;
        Ok(())
    }

    fn spend_support(&self, stack: &mut RevertableOpStack, ctx: &mut BlockContext, claim_hash: [u8; 20], tx_num: u32, nout: u16) -> Result<(), IndexerError> {
        self.note_touched(ctx, claim_hash);
        let key_suffix = pack_claim_to_support_key(&claim_hash, tx_num, nout);
        let val = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::ClaimToSupport, &key_suffix)
        };
        if let Some(v) = val {
            stack.delete(full_key(Prefix::ClaimToSupport, &key_suffix), v, &self.store)?;
        }
        let sk_suffix = pack_support_to_claim_key(tx_num, nout);
        let sv = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::SupportToClaim, &sk_suffix)
        };
        if let Some(v) = sv {
            stack.delete(full_key(Prefix::SupportToClaim, &sk_suffix), v, &self.store)?;
        }
        self.withdraw_activation(stack, claim_hash, TxoType::Support, tx_num, nout)?;
        Ok(())
    }

    fn abandon_claim(&self, stack: &mut RevertableOpStack, ctx: &mut BlockContext, claim_hash: [u8; 20], tx_num: u32, nout: u16) -> Result<(), IndexerError> {
        if !ctx.abandoned_outpoints.insert((tx_num, nout)) {
            tracing::warn!(tx_num, nout, "duplicate abandon for the same outpoint within one block, ignoring");
            return Ok(());
        }
        self.note_touched(ctx, claim_hash);
        ctx.abandoning_this_block.insert(claim_hash);

        let (value, is_channel, was_controller) = {
            let view = BlockView::new(&self.store, stack);
            let Some(buf) = view.get(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash)) else {
                return Ok(());
            };
            let v = unpack_claim_to_txo_value(&buf)?;
            let is_channel = view.get(Prefix::ClaimInfo, &pack_claim_info_key(&claim_hash)).and_then(|b| unpack_claim_info_value(&b).ok()).map(|ci| ci.is_channel).unwrap_or(false);
            let controller = view.get(Prefix::ClaimTakeover, &pack_claim_takeover_key(&v.name)).and_then(|b| unpack_claim_takeover_value(&b).ok());
            let was_controller = controller.map(|c| c.claim_hash) == Some(claim_hash);
            (v, is_channel, was_controller)
        };
        ctx.removed_claims.insert(claim_hash);

        stack.delete(full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash)), pack_claim_to_txo_value(&value), &self.store)?;
        stack.delete(
            full_key(Prefix::TxoToClaim, &pack_txo_key(tx_num, nout)),
            pack_txo_to_claim_value(&TxoToClaimValue { claim_hash, name: value.name.clone() }),
            &self.store,
        )?;

        let short_suffix = pack_claim_short_id_key(&value.name, hex::encode(claim_hash).as_bytes(), value.root_tx_num, value.root_pos);
        let short_val = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::ClaimShortId, &short_suffix)
        };
        if let Some(v) = short_val {
            stack.delete(full_key(Prefix::ClaimShortId, &short_suffix), v, &self.store)?;
        }

        if value.sig_valid {
            let channel_hash = {
                let view = BlockView::new(&self.store, stack);
                view.get(Prefix::ClaimToChannel, &pack_claim_to_channel_key(&claim_hash, tx_num, nout)).and_then(|b| unpack_claim_to_channel_value(&b).ok())
            };
            if let Some(ch) = channel_hash {
                let ctc_suffix = pack_channel_to_claim_key(&ch, &value.name, tx_num, nout);
                let ctc_val = {
                    let view = BlockView::new(&self.store, stack);
                    view.get(Prefix::ChannelToClaim, &ctc_suffix)
                };
                if let Some(v) = ctc_val {
                    stack.delete(full_key(Prefix::ChannelToClaim, &ctc_suffix), v, &self.store)?;
                }
                let cc_suffix = pack_claim_to_channel_key(&claim_hash, tx_num, nout);
                let cc_val = {
                    let view = BlockView::new(&self.store, stack);
                    view.get(Prefix::ClaimToChannel, &cc_suffix)
                };
                if let Some(v) = cc_val {
                    stack.delete(full_key(Prefix::ClaimToChannel, &cc_suffix), v, &self.store)?;
                }
            }
        }

        let repost_val = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::Repost, &pack_repost_key(&claim_hash))
        };
        if let Some(rv) = repost_val {
            let reposted = unpack_repost_value(&rv)?;
            stack.delete(full_key(Prefix::Repost, &pack_repost_key(&claim_hash)), rv, &self.store)?;
            let reposted_suffix = pack_reposted_key(&reposted, tx_num, nout);
            let reposted_val = {
                let view = BlockView::new(&self.store, stack);
                view.get(Prefix::Reposted, &reposted_suffix)
            };
            if let Some(v) = reposted_val {
                stack.delete(full_key(Prefix::Reposted, &reposted_suffix), v, &self.store)?;
            }
        }

        if is_channel {
            let key = full_key(Prefix::ClaimInfo, &pack_claim_info_key(&claim_hash));
            let info_val = {
                let view = BlockView::new(&self.store, stack);
                view.get(Prefix::ClaimInfo, &pack_claim_info_key(&claim_hash))
            };
            if let Some(v) = info_val {
                stack.delete(key, v, &self.store)?;
            }
        }

        self.withdraw_activation(stack, claim_hash, TxoType::Claim, tx_num, nout)?;

        if is_channel {
            self.invalidate_channel_signatures(stack, ctx, claim_hash)?;
        }

        if was_controller {
            ctx.controller_abandoned_names.insert(value.name);
        }
        crate::metrics::CLAIMS_ABANDONED.inc();
        Ok(())
    }

    /// Cascading invalidation: every claim signed by an abandoned channel has
    /// its `sig_valid` flag cleared and its Channel<->Claim links removed,
    /// except claims being abandoned in this same block (spec.md §4.4.1).
    fn invalidate_channel_signatures(&self, stack: &mut RevertableOpStack, ctx: &mut BlockContext, channel_hash: [u8; 20]) -> Result<(), IndexerError> {
        let rows = {
            let view = BlockView::new(&self.store, stack);
            view.iter_prefix(Prefix::ChannelToClaim, &pack_channel_to_claim_partial_key_channel(&channel_hash))
        };
        for (k, v) in rows {
            let (_, name, tx_num, nout) = unpack_channel_to_claim_key(&k)?;
            let claim_hash = unpack_channel_to_claim_value(&v)?;
            if ctx.abandoning_this_block.contains(&claim_hash) {
                continue;
            }
            self.note_touched(ctx, claim_hash);
            let claim_buf = {
                let view = BlockView::new(&self.store, stack);
                view.get(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash))
            };
            let Some(claim_buf) = claim_buf else { continue };
            let claim_value = unpack_claim_to_txo_value(&claim_buf)?;
            if !claim_value.sig_valid {
                continue;
            }
            let new_value = ClaimToTxoValue { sig_valid: false, ..claim_value };
            stack.delete(full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash)), claim_buf, &self.store)?;
            stack.put(full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash)), pack_claim_to_txo_value(&new_value), &self.store)?;

            stack.delete(full_key(Prefix::ChannelToClaim, &pack_channel_to_claim_key(&channel_hash, &name, tx_num, nout)), v, &self.store)?;
            let cc_suffix = pack_claim_to_channel_key(&claim_hash, tx_num, nout);
            let cc_val = {
                let view = BlockView::new(&self.store, stack);
                view.get(Prefix::ClaimToChannel, &cc_suffix)
            };
            if let Some(cv) = cc_val {
                stack.delete(full_key(Prefix::ClaimToChannel, &cc_suffix), cv, &self.store)?;
            }
            crate::metrics::SIGNATURES_INVALIDATED.inc();
        }
        Ok(())
    }

    fn expire_claims(&self, stack: &mut RevertableOpStack, ctx: &mut BlockContext, height: u32) -> Result<(), IndexerError> {
        let prefix_key = full_key(Prefix::ClaimExpiration, &pack_claim_expiration_partial_key(height));
        let rows: Vec<(Vec<u8>, Vec<u8>)> = self.store.iter_prefix(Prefix::ClaimExpiration, &prefix_key, false)?.map(|(k, v)| (k.to_vec(), v.to_vec())).collect();
        for (k, v) in rows {
            let (_, tx_num, nout) = unpack_claim_expiration_key(&k[1..])?;
            let ev = unpack_claim_expiration_value(&v)?;
            self.abandon_claim(stack, ctx, ev.claim_hash, tx_num, nout)?;
            stack.delete(k, v, &self.store)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Activation bookkeeping
    // -----------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn stage_activation(
        &self,
        stack: &mut RevertableOpStack,
        ctx: &mut BlockContext,
        height: u32,
        claim_hash: [u8; 20],
        name: Vec<u8>,
        txo_type: TxoType,
        tx_num: u32,
        nout: u16,
        amount: u64,
        delay: u32,
    ) -> Result<(), IndexerError> {
        let activation_height = height + delay;
        stack.put(
            full_key(Prefix::PendingActivation, &pack_pending_activation_key(activation_height, txo_type, tx_num, nout)),
            pack_pending_activation_value(&ActivationValue { claim_hash, name: name.clone() }),
            &self.store,
        )?;
        stack.put(
            full_key(Prefix::Activated, &pack_activated_key(txo_type, tx_num, nout)),
            pack_activated_value(&ActivatedValue { activation_height, claim_hash, name: name.clone() }),
            &self.store,
        )?;
        stack.put(full_key(Prefix::ActiveAmount, &pack_active_amount_key(&claim_hash, txo_type, activation_height, tx_num, nout)), pack_active_amount_value(amount), &self.store)?;
        if delay == 0 {
            ctx.activations_this_block.push((name, claim_hash));
        }
        Ok(())
    }

    /// Removes the pending-activation / activated / active-amount rows for
    /// an outpoint that's being withdrawn (update or abandon).
    fn withdraw_activation(&self, stack: &mut RevertableOpStack, claim_hash: [u8; 20], txo_type: TxoType, tx_num: u32, nout: u16) -> Result<(), IndexerError> {
        let activated_suffix = pack_activated_key(txo_type, tx_num, nout);
        let activated_val = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::Activated, &activated_suffix)
        };
        let Some(buf) = activated_val else { return Ok(()) };
        let av = unpack_activated_value(&buf)?;
        stack.delete(full_key(Prefix::Activated, &activated_suffix), buf, &self.store)?;

        let pending_suffix = pack_pending_activation_key(av.activation_height, txo_type, tx_num, nout);
        let pending_val = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::PendingActivation, &pending_suffix)
        };
        if let Some(v) = pending_val {
            stack.delete(full_key(Prefix::PendingActivation, &pending_suffix), v, &self.store)?;
        }

        let amount_suffix = pack_active_amount_key(&claim_hash, txo_type, av.activation_height, tx_num, nout);
        let amount_val = {
            let view = BlockView::new(&self.store, stack);
            view.get(Prefix::ActiveAmount, &amount_suffix)
        };
        if let Some(v) = amount_val {
            stack.delete(full_key(Prefix::ActiveAmount, &amount_suffix), v, &self.store)?;
        }
        Ok(())
    }

    /// Rewrites a not-yet-matured claim's activation rows to fire at
    /// `new_height` instead, for the takeover evaluator's early-activation
    /// rule (spec.md §4.4.2).
    fn promote_claim_to_height(&self, stack: &mut RevertableOpStack, claim_hash: &[u8; 20], new_height: u32) -> Result<(), IndexerError> {
        let rows = {
            let view = BlockView::new(&self.store, stack);
            view.iter_prefix(Prefix::ActiveAmount, &pack_active_amount_partial_key_claim(claim_hash))
        };
        for (k, v) in rows {
            let (ch, txo_type, activation_height, tx_num, nout) = unpack_active_amount_key(&k)?;
            if activation_height <= new_height {
                continue;
            }
            let amount = unpack_active_amount_value(&v)?;
            let name = {
                let view = BlockView::new(&self.store, stack);
                view.get(Prefix::Activated, &pack_activated_key(txo_type, tx_num, nout)).and_then(|b| unpack_activated_value(&b).ok()).map(|av| av.name)
            };
            let Some(name) = name else { continue };
            self.withdraw_activation(stack, ch, txo_type, tx_num, nout)?;
            stack.put(
                full_key(Prefix::PendingActivation, &pack_pending_activation_key(new_height, txo_type, tx_num, nout)),
                pack_pending_activation_value(&ActivationValue { claim_hash: ch, name: name.clone() }),
                &self.store,
            )?;
            stack.put(
                full_key(Prefix::Activated, &pack_activated_key(txo_type, tx_num, nout)),
                pack_activated_value(&ActivatedValue { activation_height: new_height, claim_hash: ch, name: name.clone() }),
                &self.store,
            )?;
            stack.put(full_key(Prefix::ActiveAmount, &pack_active_amount_key(&ch, txo_type, new_height, tx_num, nout)), pack_active_amount_value(amount), &self.store)?;
        }
        Ok(())
    }

    /// Activation delay formula, spec.md §4.4.2: 0 if there's no controlling
    /// claim for this name, this claim already controls it, the controller
    /// is being abandoned this block, or the pending bid doesn't exceed the
    /// controller's effective amount; otherwise `min(4032, age / 32)`.
    fn compute_delay(&self, view: &BlockView, name: &[u8], height: u32, claimant: &[u8; 20], ctx: &BlockContext, added_amount: u64) -> u32 {
        let Some(controller) = view.get(Prefix::ClaimTakeover, &pack_claim_takeover_key(name)).and_then(|b| unpack_claim_takeover_value(&b).ok()) else {
            return 0;
        };
        if &controller.claim_hash == claimant {
            return 0;
        }
        if ctx.abandoning_this_block.contains(&controller.claim_hash) {
            return 0;
        }
        let controller_eff = self.effective_amount_view(view, &controller.claim_hash, height);
        let existing_eff = self.effective_amount_view(view, claimant, height);
        let pending_eff = existing_eff.saturating_add(added_amount);
        if pending_eff <= controller_eff {
            return 0;
        }
        let age = height.saturating_sub(controller.takeover_height);
        (age / TAKEOVER_DELAY_DIVISOR).min(MAX_TAKEOVER_DELAY)
    }

    fn sum_active_amount(rows: impl Iterator<Item = (Vec<u8>, Vec<u8>)>, at_height: u32) -> u64 {
        let mut total = 0u64;
        for (k, v) in rows {
            if let Ok((_, _, activation_height, _, _)) = unpack_active_amount_key(&k) {
                if activation_height <= at_height {
                    if let Ok(amount) = unpack_active_amount_value(&v) {
                        total = total.saturating_add(amount);
                    }
                }
            }
        }
        total
    }

    fn effective_amount_committed(&self, claim_hash: &[u8; 20], at_height: u32) -> u64 {
        let prefix_key = full_key(Prefix::ActiveAmount, &pack_active_amount_partial_key_claim(claim_hash));
        // iter_prefix returns full keys (prefix byte included); strip it so
        // unpack_active_amount_key sees the same suffix effective_amount_view does.
        let rows = self.store.iter_prefix(Prefix::ActiveAmount, &prefix_key, false).map(|it| it.map(|(k, v)| (k[1..].to_vec(), v.to_vec())).collect::<Vec<_>>()).unwrap_or_default();
        Self::sum_active_amount(rows.into_iter(), at_height)
    }

    fn effective_amount_view(&self, view: &BlockView, claim_hash: &[u8; 20], at_height: u32) -> u64 {
        let rows = view.iter_prefix(Prefix::ActiveAmount, &pack_active_amount_partial_key_claim(claim_hash));
        Self::sum_active_amount(rows.into_iter(), at_height)
    }

    fn effective_amount_view_unbounded(&self, view: &BlockView, claim_hash: &[u8; 20]) -> u64 {
        self.effective_amount_view(view, claim_hash, u32::MAX)
    }

    fn claim_txo(&self, stack: &RevertableOpStack, claim_hash: &[u8; 20]) -> Option<(u32, u16)> {
        let view = BlockView::new(&self.store, stack);
        view.get(Prefix::ClaimToTxo, &pack_claim_to_txo_key(claim_hash)).and_then(|b| unpack_claim_to_txo_value(&b).ok()).map(|v| (v.tx_num, v.nout))
    }

    fn candidates_for_name(&self, stack: &RevertableOpStack, name: &[u8]) -> Vec<[u8; 20]> {
        let view = BlockView::new(&self.store, stack);
        let rows = view.iter_prefix(Prefix::ClaimShortId, &pack_claim_short_id_partial_key_name(name));
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for (_, v) in rows {
            let Ok((tx_num, nout)) = unpack_claim_short_id_value(&v) else { continue };
            let Some(buf) = view.get(Prefix::TxoToClaim, &pack_txo_key(tx_num, nout)) else { continue };
            let Ok(tv) = unpack_txo_to_claim_value(&buf) else { continue };
            if seen.insert(tv.claim_hash) {
                out.push(tv.claim_hash);
            }
        }
        out
    }

    /// Evaluates takeovers for every name with a fresh activation this block
    /// or whose controller was abandoned this block, including the
    /// early-activation-on-overtake rule (spec.md §4.4.2).
    fn run_takeover_pass(&self, stack: &mut RevertableOpStack, ctx: &mut BlockContext, height: u32) -> Result<(), IndexerError> {
        let mut names: HashSet<Vec<u8>> = HashSet::new();
        {
            let prefix_key = full_key(Prefix::PendingActivation, &pack_pending_activation_partial_key_height(height));
            if let Ok(iter) = self.store.iter_prefix(Prefix::PendingActivation, &prefix_key, false) {
                for (_, v) in iter {
                    if let Ok(av) = unpack_pending_activation_value(&v) {
                        names.insert(av.name);
                    }
                }
            }
        }
        for (name, _) in ctx.activations_this_block.drain(..) {
            names.insert(name);
        }
        for name in &ctx.controller_abandoned_names {
            names.insert(name.clone());
        }

        for name in names {
            let candidates = self.candidates_for_name(stack, &name);
            // Every candidate pulled into this name's takeover pass may have
            // its active-amount set change this block (maturing delays,
            // early activation on overtake), not just the eventual winner —
            // snapshot all of them so maintain_effective_amount_index
            // re-indexes each one instead of leaving stale rows behind.
            for c in &candidates {
                self.note_touched(ctx, *c);
            }
            let current = {
                let view = BlockView::new(&self.store, stack);
                view.get(Prefix::ClaimTakeover, &pack_claim_takeover_key(&name)).and_then(|b| unpack_claim_takeover_value(&b).ok())
            };

            if candidates.is_empty() {
                if let Some(cur) = current {
                    let key = full_key(Prefix::ClaimTakeover, &pack_claim_takeover_key(&name));
                    stack.delete(key, pack_claim_takeover_value(&cur), &self.store)?;
                }
                continue;
            }

            let mut best: Option<([u8; 20], u64, u32, u16)> = None;
            for c in &candidates {
                let eff = {
                    let view = BlockView::new(&self.store, stack);
                    self.effective_amount_view(&view, c, height)
                };
                let (tx_num, nout) = self.claim_txo(stack, c).unwrap_or((u32::MAX, u16::MAX));
                let better = match &best {
                    None => true,
                    Some((_, best_eff, best_tn, best_no)) => eff > *best_eff || (eff == *best_eff && (tx_num, nout) < (*best_tn, *best_no)),
                };
                if better {
                    best = Some((*c, eff, tx_num, nout));
                }
            }
            let Some((mut winner, mut winner_eff, _, _)) = best else { continue };

            for c in &candidates {
                if *c == winner {
                    continue;
                }
                let prospective = {
                    let view = BlockView::new(&self.store, stack);
                    let own_row = view.get(Prefix::ClaimToTxo, &pack_claim_to_txo_key(c)).and_then(|b| unpack_claim_to_txo_value(&b).ok());
                    let Some(row) = own_row else { continue };
                    let act = view.get(Prefix::Activated, &pack_activated_key(TxoType::Claim, row.tx_num, row.nout)).and_then(|b| unpack_activated_value(&b).ok());
                    let Some(act) = act else { continue };
                    if act.activation_height <= height {
                        continue; // already active, already considered above
                    }
                    self.effective_amount_view_unbounded(&view, c)
                };
                if prospective > winner_eff {
                    self.promote_claim_to_height(stack, c, height)?;
                    winner = *c;
                    winner_eff = prospective;
                }
            }

            if current.as_ref().map(|c| c.claim_hash) != Some(winner) {
                let key = full_key(Prefix::ClaimTakeover, &pack_claim_takeover_key(&name));
                if let Some(cur) = &current {
                    stack.delete(key.clone(), pack_claim_takeover_value(cur), &self.store)?;
                    ctx.touched_claims.insert(cur.claim_hash);
                }
                stack.put(key, pack_claim_takeover_value(&TakeoverValue { claim_hash: winner, takeover_height: height }), &self.store)?;
                ctx.touched_claims.insert(winner);
                crate::metrics::TAKEOVERS.inc();
            }
        }
        Ok(())
    }

    fn maintain_effective_amount_index(&self, stack: &mut RevertableOpStack, ctx: &mut BlockContext, height: u32) -> Result<(), IndexerError> {
        let claims: Vec<[u8; 20]> = ctx.touched_claims.union(&ctx.removed_claims).cloned().collect();
        for claim_hash in claims {
            if let Some(Some((old_name, old_amount, old_tx_num, old_nout))) = ctx.old_effective_snapshot.get(&claim_hash) {
                let key = full_key(Prefix::EffectiveAmount, &pack_effective_amount_key(old_name, *old_amount, *old_tx_num, *old_nout));
                if let Some(val) = self.store.get(Prefix::EffectiveAmount, &key)? {
                    stack.delete(key, val, &self.store)?;
                }
            }
            if ctx.removed_claims.contains(&claim_hash) {
                continue;
            }
            let current_row = {
                let view = BlockView::new(&self.store, stack);
                view.get(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash)).and_then(|b| unpack_claim_to_txo_value(&b).ok())
            };
            if let Some(v) = current_row {
                let new_amount = {
                    let view = BlockView::new(&self.store, stack);
                    self.effective_amount_view(&view, &claim_hash, height)
                };
                let new_key = full_key(Prefix::EffectiveAmount, &pack_effective_amount_key(&v.name, new_amount, v.tx_num, v.nout));
                stack.put(new_key, pack_effective_amount_value(&claim_hash), &self.store)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim_meta::ClaimMeta;
    use crate::hashes::claim_hash_from_outpoint;
    use crate::script::{encode_claim_script, encode_p2pkh, encode_support_script, encode_update_script};
    use crate::tx::{build_header, Transaction, TxIn, TxOut};

    fn temp_indexer() -> (tempfile::TempDir, Indexer) {
        let dir = tempfile::tempdir().unwrap();
        let store = PrefixStore::open(dir.path(), 16, 64, 200).unwrap();
        let indexer = Indexer::open(store, Default::default()).unwrap();
        (dir, indexer)
    }

    fn coinbase(height: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn { prev_tx_hash: [0u8; 32], prev_index: 0xffff_ffff, script_sig: height.to_le_bytes().to_vec(), sequence: 0xffffffff }],
            outputs: vec![TxOut { amount: 0, script_pubkey: vec![] }],
            locktime: 0,
        }
    }

    fn block_with(prev: [u8; 32], txs: Vec<Transaction>) -> RawBlock {
        let header = build_header(1, &prev, &[0u8; 32], &[0u8; 32], 1_700_000_000, 0x1d00ffff, 0);
        RawBlock { header, transactions: txs }
    }

    #[test]
    fn first_claim_on_a_name_takes_over_immediately() {
        let (_dir, mut indexer) = temp_indexer();
        let addr = [9u8; 20];
        let meta = ClaimMeta { title: Some(b"A Cat Video".to_vec()), ..Default::default() };
        let claim_tx = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOut { amount: 100, script_pubkey: encode_claim_script(b"cat", &meta, &addr) }],
            locktime: 0,
        };
        let block = block_with([0u8; 32], vec![coinbase(1), claim_tx]);
        let event = indexer.advance_block(&block).unwrap();
        assert_eq!(event.height, 1);
        assert_eq!(event.touched.len(), 1);

        let claim_hash = claim_hash_from_outpoint(&block.transactions[1].txid(), 0);
        assert_eq!(event.touched[0], claim_hash);

        let takeover_buf = indexer
            .store()
            .get(Prefix::ClaimTakeover, &full_key(Prefix::ClaimTakeover, &pack_claim_takeover_key(b"cat")))
            .unwrap()
            .expect("takeover row must exist");
        let takeover = unpack_claim_takeover_value(&takeover_buf).unwrap();
        assert_eq!(takeover.claim_hash, claim_hash);
        assert_eq!(takeover.takeover_height, 1);
    }

    #[test]
    fn update_preserves_root_outpoint_and_keeps_control() {
        let (_dir, mut indexer) = temp_indexer();
        let addr = [9u8; 20];
        let meta = ClaimMeta::default();
        let claim_tx = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 100, script_pubkey: encode_claim_script(b"cat", &meta, &addr) }], locktime: 0 };
        let claim_txid = claim_tx.txid();
        let claim_hash = claim_hash_from_outpoint(&claim_txid, 0);
        let block1 = block_with([0u8; 32], vec![coinbase(1), claim_tx]);
        indexer.advance_block(&block1).unwrap();

        let update_tx = Transaction {
            version: 1,
            inputs: vec![TxIn { prev_tx_hash: claim_txid, prev_index: 0, script_sig: vec![], sequence: 0xffffffff }],
            outputs: vec![TxOut { amount: 150, script_pubkey: encode_update_script(&claim_hash, b"cat", &meta, &addr) }],
            locktime: 0,
        };
        let block2 = block_with(block1.block_hash(), vec![coinbase(2), update_tx]);
        let event = indexer.advance_block(&block2).unwrap();
        assert_eq!(event.touched, vec![claim_hash]);
        assert!(event.deleted.is_empty());

        let row = indexer.store().get(Prefix::ClaimToTxo, &full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash))).unwrap().unwrap();
        let v = unpack_claim_to_txo_value(&row).unwrap();
        assert_eq!(v.amount, 150);
        assert_eq!(v.root_tx_num, 1); // tx_num 0 is the coinbase, 1 is the claim tx
        assert_eq!(v.root_pos, 0);

        let takeover_buf = indexer.store().get(Prefix::ClaimTakeover, &full_key(Prefix::ClaimTakeover, &pack_claim_takeover_key(b"cat"))).unwrap().unwrap();
        let takeover = unpack_claim_takeover_value(&takeover_buf).unwrap();
        assert_eq!(takeover.claim_hash, claim_hash);
        assert_eq!(takeover.takeover_height, 1, "update by the controlling claim must not reset takeover height");
    }

    #[test]
    fn abandoning_a_claim_marks_it_deleted_and_not_touched() {
        let (_dir, mut indexer) = temp_indexer();
        let addr = [9u8; 20];
        let meta = ClaimMeta::default();
        let claim_tx = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 100, script_pubkey: encode_claim_script(b"cat", &meta, &addr) }], locktime: 0 };
        let claim_txid = claim_tx.txid();
        let claim_hash = claim_hash_from_outpoint(&claim_txid, 0);
        let block1 = block_with([0u8; 32], vec![coinbase(1), claim_tx]);
        indexer.advance_block(&block1).unwrap();

        let spend_tx = Transaction {
            version: 1,
            inputs: vec![TxIn { prev_tx_hash: claim_txid, prev_index: 0, script_sig: vec![], sequence: 0xffffffff }],
            outputs: vec![TxOut { amount: 100, script_pubkey: encode_p2pkh(&addr) }],
            locktime: 0,
        };
        let block2 = block_with(block1.block_hash(), vec![coinbase(2), spend_tx]);
        let event = indexer.advance_block(&block2).unwrap();
        assert_eq!(event.deleted, vec![claim_hash]);
        assert!(!event.touched.contains(&claim_hash));

        assert!(indexer.store().get(Prefix::ClaimToTxo, &full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash))).unwrap().is_none());
        assert!(indexer.store().get(Prefix::ClaimTakeover, &full_key(Prefix::ClaimTakeover, &pack_claim_takeover_key(b"cat"))).unwrap().is_none());
    }

    #[test]
    fn support_raises_effective_amount_without_touching_claim_amount() {
        let (_dir, mut indexer) = temp_indexer();
        let addr = [9u8; 20];
        let meta = ClaimMeta::default();
        let claim_tx = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 100, script_pubkey: encode_claim_script(b"cat", &meta, &addr) }], locktime: 0 };
        let claim_hash = claim_hash_from_outpoint(&claim_tx.txid(), 0);
        let block1 = block_with([0u8; 32], vec![coinbase(1), claim_tx]);
        indexer.advance_block(&block1).unwrap();

        let support_tx = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 50, script_pubkey: encode_support_script(&claim_hash, None, &addr) }], locktime: 0 };
        let block2 = block_with(block1.block_hash(), vec![coinbase(2), support_tx]);
        indexer.advance_block(&block2).unwrap();

        let eff = indexer.effective_amount_committed(&claim_hash, 2);
        assert_eq!(eff, 150);
        let row = indexer.store().get(Prefix::ClaimToTxo, &full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash))).unwrap().unwrap();
        assert_eq!(unpack_claim_to_txo_value(&row).unwrap().amount, 100);
    }

    #[test]
    fn support_does_not_leave_a_stale_effective_amount_row() {
        let (_dir, mut indexer) = temp_indexer();
        let addr = [9u8; 20];
        let meta = ClaimMeta::default();
        let claim_tx = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 100, script_pubkey: encode_claim_script(b"cat", &meta, &addr) }], locktime: 0 };
        let claim_hash = claim_hash_from_outpoint(&claim_tx.txid(), 0);
        let block1 = block_with([0u8; 32], vec![coinbase(1), claim_tx]);
        indexer.advance_block(&block1).unwrap();

        let support_tx = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 50, script_pubkey: encode_support_script(&claim_hash, None, &addr) }], locktime: 0 };
        let block2 = block_with(block1.block_hash(), vec![coinbase(2), support_tx]);
        indexer.advance_block(&block2).unwrap();

        let effective_amount_prefix = full_key(Prefix::EffectiveAmount, &[]);
        let rows: Vec<_> = indexer.store().iter_prefix(Prefix::EffectiveAmount, &effective_amount_prefix, false).unwrap().collect();
        assert_eq!(rows.len(), 1, "exactly one claim should have exactly one effective-amount row, not a stale one left behind by the support");
        let (_, v) = &rows[0];
        assert_eq!(unpack_effective_amount_value(v).unwrap(), claim_hash);
    }

    #[test]
    fn rollback_restores_pre_block_state() {
        let (_dir, mut indexer) = temp_indexer();
        let addr = [9u8; 20];
        let meta = ClaimMeta::default();
        let claim_tx = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 100, script_pubkey: encode_claim_script(b"cat", &meta, &addr) }], locktime: 0 };
        let claim_hash = claim_hash_from_outpoint(&claim_tx.txid(), 0);
        let block1 = block_with([0u8; 32], vec![coinbase(1), claim_tx]);
        indexer.advance_block(&block1).unwrap();
        assert_eq!(indexer.height(), 1);

        indexer.rollback_block().unwrap();
        assert_eq!(indexer.height(), 0);
        assert_eq!(indexer.tip_hash(), [0u8; 32]);
        assert!(indexer.store().get(Prefix::ClaimToTxo, &full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_hash))).unwrap().is_none());
        assert!(indexer.store().get(Prefix::ClaimTakeover, &full_key(Prefix::ClaimTakeover, &pack_claim_takeover_key(b"cat"))).unwrap().is_none());
    }

    #[test]
    fn discontinuous_block_is_rejected() {
        let (_dir, mut indexer) = temp_indexer();
        let bad_block = block_with([0xffu8; 32], vec![coinbase(1)]);
        let err = indexer.advance_block(&bad_block).unwrap_err();
        assert!(matches!(err, IndexerError::Chain(ChainError::Discontinuous { .. })));
    }

    fn advance_empty(indexer: &mut Indexer, height: u32) {
        let tip = indexer.tip_hash();
        let block = block_with(tip, vec![coinbase(height)]);
        indexer.advance_block(&block).unwrap();
    }

    fn controller_of(indexer: &Indexer, name: &[u8]) -> Option<TakeoverValue> {
        indexer.store().get(Prefix::ClaimTakeover, &full_key(Prefix::ClaimTakeover, &pack_claim_takeover_key(name))).unwrap().map(|buf| unpack_claim_takeover_value(&buf).unwrap())
    }

    #[test]
    fn overtake_is_delayed_then_matures() {
        let (_dir, mut indexer) = temp_indexer();
        let addr = [9u8; 20];
        let meta = ClaimMeta::default();

        let claim_a = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 100, script_pubkey: encode_claim_script(b"cat", &meta, &addr) }], locktime: 0 };
        let claim_a_hash = claim_hash_from_outpoint(&claim_a.txid(), 0);
        let block1 = block_with([0u8; 32], vec![coinbase(1), claim_a]);
        indexer.advance_block(&block1).unwrap();
        assert_eq!(controller_of(&indexer, b"cat").unwrap().claim_hash, claim_a_hash);

        // 31 empty blocks bring height to 32; one more (with B's bid) lands at 33,
        // giving age = 33 - 1 = 32 and delay = (32 / 32).min(4032) = 1.
        for h in 2..33 {
            advance_empty(&mut indexer, h);
        }
        assert_eq!(indexer.height(), 32);

        let claim_b = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 150, script_pubkey: encode_claim_script(b"cat", &meta, &addr) }], locktime: 0 };
        let claim_b_hash = claim_hash_from_outpoint(&claim_b.txid(), 0);
        let tip = indexer.tip_hash();
        let block33 = block_with(tip, vec![coinbase(33), claim_b]);
        indexer.advance_block(&block33).unwrap();
        assert_eq!(indexer.height(), 33);

        // The bid is pending; A must still control the name this block.
        assert_eq!(controller_of(&indexer, b"cat").unwrap().claim_hash, claim_a_hash, "delay must be enforced, no same-block overtake");

        advance_empty(&mut indexer, 34);
        let takeover = controller_of(&indexer, b"cat").unwrap();
        assert_eq!(takeover.claim_hash, claim_b_hash, "B's activation matures at height 34");
        assert_eq!(takeover.takeover_height, 34);
    }

    #[test]
    fn larger_pending_bid_activates_early_on_overtake() {
        let (_dir, mut indexer) = temp_indexer();
        let addr = [9u8; 20];
        let meta = ClaimMeta::default();

        let claim_a = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 100, script_pubkey: encode_claim_script(b"cat", &meta, &addr) }], locktime: 0 };
        let block1 = block_with([0u8; 32], vec![coinbase(1), claim_a]);
        indexer.advance_block(&block1).unwrap();

        for h in 2..33 {
            advance_empty(&mut indexer, h);
        }
        let claim_b = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 150, script_pubkey: encode_claim_script(b"cat", &meta, &addr) }], locktime: 0 };
        let claim_b_hash = claim_hash_from_outpoint(&claim_b.txid(), 0);
        let tip = indexer.tip_hash();
        let block33 = block_with(tip, vec![coinbase(33), claim_b]);
        indexer.advance_block(&block33).unwrap();
        advance_empty(&mut indexer, 34);
        assert_eq!(controller_of(&indexer, b"cat").unwrap().claim_hash, claim_b_hash);

        // Walk forward so B's age under the takeover is 32 again (66 - 34 = 32),
        // matching the divisor exactly: any overtaking bid gets delay = 1.
        for h in 35..66 {
            advance_empty(&mut indexer, h);
        }
        assert_eq!(indexer.height(), 65);

        let claim_c = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 500, script_pubkey: encode_claim_script(b"cat", &meta, &addr) }], locktime: 0 };
        let claim_c_hash = claim_hash_from_outpoint(&claim_c.txid(), 0);
        let claim_d = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 1, script_pubkey: encode_claim_script(b"cat", &meta, &addr) }], locktime: 0 };
        let tip = indexer.tip_hash();
        let block66 = block_with(tip, vec![coinbase(66), claim_c, claim_d]);
        indexer.advance_block(&block66).unwrap();
        assert_eq!(indexer.height(), 66);

        // D's tiny bid doesn't exceed B's 150, so it activates immediately and
        // pulls "cat" into this block's takeover pass; that pass then finds C's
        // *pending* 500 exceeds the bounded winner (B's 150) and promotes C to
        // activate this block instead of waiting for its natural height (67).
        let takeover = controller_of(&indexer, b"cat").unwrap();
        assert_eq!(takeover.claim_hash, claim_c_hash, "C's larger pending bid must be activated early");
        assert_eq!(takeover.takeover_height, 66);

        let row = indexer.store().get(Prefix::ClaimToTxo, &full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&claim_c_hash))).unwrap().unwrap();
        let v = unpack_claim_to_txo_value(&row).unwrap();
        let act_buf = indexer.store().get(Prefix::Activated, &full_key(Prefix::Activated, &pack_activated_key(TxoType::Claim, v.tx_num, v.nout))).unwrap().expect("activated row must exist");
        let act = unpack_activated_value(&act_buf).unwrap();
        assert_eq!(act.activation_height, 66, "C's activation must be rewritten to fire this block");
    }

    #[test]
    fn abandoning_a_channel_invalidates_its_signed_claims() {
        use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

        let (_dir, mut indexer) = temp_indexer();
        let addr = [9u8; 20];

        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[11u8; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);

        let channel_meta = ClaimMeta { is_channel: true, channel_public_key: Some(pk.serialize().to_vec()), ..Default::default() };
        let channel_tx = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 100, script_pubkey: encode_claim_script(b"@bob", &channel_meta, &addr) }], locktime: 0 };
        let channel_hash = claim_hash_from_outpoint(&channel_tx.txid(), 0);
        let channel_txid = channel_tx.txid();
        let block1 = block_with([0u8; 32], vec![coinbase(1), channel_tx]);
        indexer.advance_block(&block1).unwrap();

        let digest = [5u8; 32];
        let msg = Message::from_slice(&digest).unwrap();
        let sig = secp.sign_ecdsa(&msg, &sk);
        let signed_meta = ClaimMeta { signature: Some(sig.serialize_der().to_vec()), signature_digest: Some(digest.to_vec()), signing_channel_hash: Some(channel_hash), ..Default::default() };
        let signed_tx = Transaction { version: 1, inputs: vec![], outputs: vec![TxOut { amount: 50, script_pubkey: encode_claim_script(b"video", &signed_meta, &addr) }], locktime: 0 };
        let signed_hash = claim_hash_from_outpoint(&signed_tx.txid(), 0);
        let block2 = block_with(block1.block_hash(), vec![coinbase(2), signed_tx]);
        indexer.advance_block(&block2).unwrap();

        let row = indexer.store().get(Prefix::ClaimToTxo, &full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&signed_hash))).unwrap().unwrap();
        let signed_txo = unpack_claim_to_txo_value(&row).unwrap();
        assert!(signed_txo.sig_valid, "signature must verify against the channel's stored public key");
        let (signed_tx_num, signed_nout) = (signed_txo.tx_num, signed_txo.nout);

        let abandon_tx = Transaction {
            version: 1,
            inputs: vec![TxIn { prev_tx_hash: channel_txid, prev_index: 0, script_sig: vec![], sequence: 0xffffffff }],
            outputs: vec![TxOut { amount: 100, script_pubkey: encode_p2pkh(&addr) }],
            locktime: 0,
        };
        let block3 = block_with(block2.block_hash(), vec![coinbase(3), abandon_tx]);
        let event = indexer.advance_block(&block3).unwrap();
        assert!(event.deleted.contains(&channel_hash));
        assert!(!event.deleted.contains(&signed_hash), "the signed claim itself must survive the channel's abandonment");

        let row = indexer.store().get(Prefix::ClaimToTxo, &full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(&signed_hash))).unwrap().unwrap();
        assert!(!unpack_claim_to_txo_value(&row).unwrap().sig_valid, "abandoning the channel must invalidate the signature");

        assert!(indexer
            .store()
            .get(Prefix::ChannelToClaim, &full_key(Prefix::ChannelToClaim, &pack_channel_to_claim_key(&channel_hash, b"video", signed_tx_num, signed_nout)))
            .unwrap()
            .is_none());
        assert!(indexer
            .store()
            .get(Prefix::ClaimToChannel, &full_key(Prefix::ClaimToChannel, &pack_claim_to_channel_key(&signed_hash, signed_tx_num, signed_nout)))
            .unwrap()
            .is_none());
    }
}
