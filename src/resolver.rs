/// Resolver / Reader
///
/// Pure read path over the committed store — never stages an op. Opens the
/// store in RocksDB secondary mode and periodically calls
/// `catch_up_with_primary` so it sees new commits without fighting the
/// single writer for a lock.
use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::codec::*;
use crate::error::{IndexerError, ReadError};
use crate::hashes::sha256;
use crate::store::PrefixStore;

fn full_key(prefix: Prefix, suffix: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + suffix.len());
    out.push(prefix as u8);
    out.extend_from_slice(suffix);
    out
}

/// A single resolved claim, with its effective amount folded in so callers
/// don't need a second round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClaim {
    pub claim_hash: [u8; 20],
    pub name: Vec<u8>,
    pub tx_num: u32,
    pub nout: u16,
    pub amount: u64,
    pub effective_amount: u64,
    pub sig_valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    EffectiveAmount,
    Height,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub claim_name: Option<Vec<u8>>,
    pub channel_hash: Option<[u8; 20]>,
    pub reposted_claim_hash: Option<[u8; 20]>,
    pub order_by: Option<OrderBy>,
    pub limit: usize,
    pub include_total: bool,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub rows: Vec<ResolvedClaim>,
    pub total: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct TxWithMerkle {
    pub raw_tx: Vec<u8>,
    pub height: i64,
    pub merkle_path: Vec<[u8; 32]>,
    pub position: usize,
}

enum Modifier {
    ClaimId(String),
    Amount(usize),
}

struct Segment {
    name: Vec<u8>,
    modifier: Option<Modifier>,
}

fn parse_segment(s: &str) -> Segment {
    if let Some(idx) = s.find(['#', ':']) {
        Segment { name: s[..idx].as_bytes().to_vec(), modifier: Some(Modifier::ClaimId(s[idx + 1..].to_string())) }
    } else if let Some(idx) = s.find('$') {
        let k = s[idx + 1..].parse::<usize>().unwrap_or(1).max(1);
        Segment { name: s[..idx].as_bytes().to_vec(), modifier: Some(Modifier::Amount(k)) }
    } else {
        Segment { name: s.as_bytes().to_vec(), modifier: None }
    }
}

pub struct Resolver {
    store: PrefixStore,
    block_filter_channels: HashSet<[u8; 20]>,
    resolve_filter_channels: HashSet<[u8; 20]>,
}

impl Resolver {
    pub fn open_secondary(
        primary_path: impl AsRef<Path>,
        secondary_path: impl AsRef<Path>,
        block_filter_channels: &[[u8; 20]],
        resolve_filter_channels: &[[u8; 20]],
    ) -> Result<Self, IndexerError> {
        let store = PrefixStore::open_secondary(primary_path, secondary_path)?;
        Ok(Self { store, block_filter_channels: block_filter_channels.iter().copied().collect(), resolve_filter_channels: resolve_filter_channels.iter().copied().collect() })
    }

    pub fn catch_up(&self) -> Result<(), IndexerError> {
        self.store.catch_up_with_primary()?;
        Ok(())
    }

    /// Current indexed height and tip block hash, for the status endpoint.
    /// `None` before the first block has ever been committed.
    pub fn status(&self) -> Option<(u32, [u8; 32])> {
        self.store
            .get(Prefix::DbState, &full_key(Prefix::DbState, DB_STATE_KEY))
            .ok()
            .flatten()
            .and_then(|b| unpack_db_state(&b).ok())
            .map(|s| (s.height, s.tip_hash))
    }

    fn censored_by(&self, claim_hash: &[u8; 20], signing_channel_hash: Option<&[u8; 20]>) -> Option<[u8; 20]> {
        if self.block_filter_channels.contains(claim_hash) || self.resolve_filter_channels.contains(claim_hash) {
            return Some(*claim_hash);
        }
        if let Some(ch) = signing_channel_hash {
            if self.block_filter_channels.contains(ch) || self.resolve_filter_channels.contains(ch) {
                return Some(*ch);
            }
        }
        None
    }

    fn claim_row(&self, claim_hash: &[u8; 20]) -> Result<Option<ClaimToTxoValue>, ReadError> {
        let buf = self.store.get(Prefix::ClaimToTxo, &full_key(Prefix::ClaimToTxo, &pack_claim_to_txo_key(claim_hash))).map_err(|_| ReadError::QueryTimeout)?;
        match buf {
            Some(b) => unpack_claim_to_txo_value(&b).map(Some).map_err(|e| ReadError::NotFound(e.context)),
            None => Ok(None),
        }
    }

    fn signing_channel_of(&self, claim_hash: &[u8; 20], tx_num: u32, nout: u16) -> Option<[u8; 20]> {
        self.store
            .get(Prefix::ClaimToChannel, &full_key(Prefix::ClaimToChannel, &pack_claim_to_channel_key(claim_hash, tx_num, nout)))
            .ok()
            .flatten()
            .and_then(|b| unpack_claim_to_channel_value(&b).ok())
    }

    fn effective_amount(&self, claim_hash: &[u8; 20], at_height: u32) -> u64 {
        let prefix_key = full_key(Prefix::ActiveAmount, &pack_active_amount_partial_key_claim(claim_hash));
        let Ok(iter) = self.store.iter_prefix(Prefix::ActiveAmount, &prefix_key, false) else { return 0 };
        let mut total = 0u64;
        for (k, v) in iter {
            if let Ok((_, _, activation_height, _, _)) = unpack_active_amount_key(&k[1..]) {
                if activation_height <= at_height {
                    if let Ok(amount) = unpack_active_amount_value(&v) {
                        total = total.saturating_add(amount);
                    }
                }
            }
        }
        total
    }

    fn current_height(&self) -> u32 {
        self.store
            .get(Prefix::DbState, &full_key(Prefix::DbState, DB_STATE_KEY))
            .ok()
            .flatten()
            .and_then(|b| unpack_db_state(&b).ok())
            .map(|s| s.height)
            .unwrap_or(0)
    }

    fn resolved_claim(&self, claim_hash: [u8; 20]) -> Result<ResolvedClaim, ReadError> {
        let row = self.claim_row(&claim_hash)?.ok_or_else(|| ReadError::NotFound(hex::encode(claim_hash)))?;
        let signing = self.signing_channel_of(&claim_hash, row.tx_num, row.nout);
        if let Some(blocker) = self.censored_by(&claim_hash, signing.as_ref()) {
            return Err(ReadError::Censored { blocking_channel_hash: blocker });
        }
        let effective_amount = self.effective_amount(&claim_hash, self.current_height());
        Ok(ResolvedClaim { claim_hash, name: row.name, tx_num: row.tx_num, nout: row.nout, amount: row.amount, effective_amount, sig_valid: row.sig_valid })
    }

    fn claim_for_name(&self, name: &[u8], deadline: Instant) -> Result<[u8; 20], ReadError> {
        if Instant::now() > deadline {
            return Err(ReadError::QueryTimeout);
        }
        let buf = self
            .store
            .get(Prefix::ClaimTakeover, &full_key(Prefix::ClaimTakeover, &pack_claim_takeover_key(name)))
            .map_err(|_| ReadError::QueryTimeout)?
            .ok_or_else(|| ReadError::NotFound(format!("channel:{}", String::from_utf8_lossy(name))))?;
        let takeover = unpack_claim_takeover_value(&buf).map_err(|e| ReadError::NotFound(e.context))?;
        Ok(takeover.claim_hash)
    }

    fn claim_by_short_id(&self, name: &[u8], claim_id_prefix: &str, deadline: Instant) -> Result<[u8; 20], ReadError> {
        let partial = pack_claim_short_id_partial_key_name(name);
        let full_prefix = full_key(Prefix::ClaimShortId, &partial);
        let iter = self.store.iter_prefix(Prefix::ClaimShortId, &full_prefix, false).map_err(|_| ReadError::QueryTimeout)?;
        for (k, v) in iter {
            if Instant::now() > deadline {
                return Err(ReadError::QueryTimeout);
            }
            if let Ok((_, partial_id_hex, _, _)) = unpack_claim_short_id_key(&k[1..]) {
                if partial_id_hex.starts_with(claim_id_prefix.as_bytes()) {
                    let (tx_num, nout) = unpack_claim_short_id_value(&v).map_err(|e| ReadError::NotFound(e.context))?;
                    let buf = self
                        .store
                        .get(Prefix::TxoToClaim, &full_key(Prefix::TxoToClaim, &pack_txo_key(tx_num, nout)))
                        .map_err(|_| ReadError::QueryTimeout)?
                        .ok_or_else(|| ReadError::NotFound("txo_to_claim".to_string()))?;
                    let v = unpack_txo_to_claim_value(&buf).map_err(|e| ReadError::NotFound(e.context))?;
                    return Ok(v.claim_hash);
                }
            }
        }
        Err(ReadError::NotFound(format!("{}#{}", String::from_utf8_lossy(name), claim_id_prefix)))
    }

    fn claim_by_amount_rank(&self, name: &[u8], k: usize, deadline: Instant) -> Result<[u8; 20], ReadError> {
        let partial = pack_effective_amount_partial_key_name(name);
        let full_prefix = full_key(Prefix::EffectiveAmount, &partial);
        let iter = self.store.iter_prefix(Prefix::EffectiveAmount, &full_prefix, false).map_err(|_| ReadError::QueryTimeout)?;
        for (idx, (k_buf, v)) in iter.enumerate() {
            if Instant::now() > deadline {
                return Err(ReadError::QueryTimeout);
            }
            let _ = &k_buf;
            if idx + 1 == k {
                return unpack_effective_amount_value(&v).map_err(|e| ReadError::NotFound(e.context));
            }
        }
        Err(ReadError::NotFound(format!("{}${}", String::from_utf8_lossy(name), k)))
    }

    fn candidates_under_channel(&self, channel_hash: &[u8; 20], name: &[u8]) -> Vec<[u8; 20]> {
        let partial = pack_channel_to_claim_partial_key_channel_name(channel_hash, name);
        let full_prefix = full_key(Prefix::ChannelToClaim, &partial);
        let Ok(iter) = self.store.iter_prefix(Prefix::ChannelToClaim, &full_prefix, false) else { return Vec::new() };
        iter.filter_map(|(_, v)| unpack_channel_to_claim_value(&v).ok()).collect()
    }

    fn pick_candidate(&self, candidates: &[[u8; 20]], modifier: &Option<Modifier>, deadline: Instant) -> Result<[u8; 20], ReadError> {
        let height = self.current_height();
        let mut scored: Vec<([u8; 20], u64, u32, u16)> = Vec::new();
        for c in candidates {
            if Instant::now() > deadline {
                return Err(ReadError::QueryTimeout);
            }
            if let Some(row) = self.claim_row(c)? {
                scored.push((*c, self.effective_amount(c, height), row.tx_num, row.nout));
            }
        }
        match modifier {
            None => scored
                .into_iter()
                .max_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)).then(b.3.cmp(&a.3)))
                .map(|(hash, ..)| hash)
                .ok_or_else(|| ReadError::NotFound("no candidates".to_string())),
            Some(Modifier::ClaimId(prefix)) => scored
                .into_iter()
                .filter(|(hash, ..)| hex::encode(hash).starts_with(prefix.as_str()))
                .min_by(|a, b| a.2.cmp(&b.2).then(a.3.cmp(&b.3)))
                .map(|(hash, ..)| hash)
                .ok_or_else(|| ReadError::NotFound(format!("#{prefix}"))),
            Some(Modifier::Amount(k)) => {
                scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)).then(a.3.cmp(&b.3)));
                scored.get(k.saturating_sub(1)).map(|(hash, ..)| *hash).ok_or_else(|| ReadError::NotFound(format!("${k}")))
            }
        }
    }

    /// Resolves `[lbry://]<channel>[/<stream>]` per spec.md §4.5, plus a
    /// bare 40-hex-char claim_id fast path.
    pub fn resolve_url(&self, url: &str, timeout: Duration) -> Result<ResolvedClaim, ReadError> {
        let deadline = Instant::now() + timeout;
        let stripped = url.trim_start_matches("lbry://");
        let segments: Vec<&str> = stripped.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() || segments.len() > 2 {
            return Err(ReadError::NotFound(url.to_string()));
        }

        if segments.len() == 1 && segments[0].len() == 40 && segments[0].chars().all(|c| c.is_ascii_hexdigit()) {
            if let Ok(bytes) = hex::decode(segments[0]) {
                if let Ok(claim_hash) = <[u8; 20]>::try_from(bytes.as_slice()) {
                    if self.claim_row(&claim_hash)?.is_some() {
                        return self.resolved_claim(claim_hash);
                    }
                }
            }
        }

        let first = parse_segment(segments[0]);
        let channel_hash = match &first.modifier {
            None => self.claim_for_name(&first.name, deadline)?,
            Some(Modifier::ClaimId(prefix)) => self.claim_by_short_id(&first.name, prefix, deadline)?,
            Some(Modifier::Amount(k)) => self.claim_by_amount_rank(&first.name, *k, deadline)?,
        };

        if segments.len() == 1 {
            return self.resolved_claim(channel_hash);
        }

        let second = parse_segment(segments[1]);
        let candidates = self.candidates_under_channel(&channel_hash, &second.name);
        if candidates.is_empty() {
            return Err(ReadError::NotFound(format!("{}/{}", segments[0], segments[1])));
        }
        let stream_hash = self.pick_candidate(&candidates, &second.modifier, deadline)?;
        self.resolved_claim(stream_hash)
    }

    /// Scans Claim→TXO with in-memory filtering, or the Effective-amount
    /// leaderboard when `claim_name` is the only filter (spec.md §4.5).
    pub fn search(&self, filters: &SearchFilters, timeout: Duration) -> Result<SearchResult, ReadError> {
        let deadline = Instant::now() + timeout;
        let limit = if filters.limit == 0 { 20 } else { filters.limit };
        let height = self.current_height();

        let candidate_hashes: Vec<[u8; 20]> = if let Some(channel_hash) = &filters.channel_hash {
            let partial = match &filters.claim_name {
                Some(n) => pack_channel_to_claim_partial_key_channel_name(channel_hash, n),
                None => pack_channel_to_claim_partial_key_channel(channel_hash),
            };
            let full_prefix = full_key(Prefix::ChannelToClaim, &partial);
            let iter = self.store.iter_prefix(Prefix::ChannelToClaim, &full_prefix, false).map_err(|_| ReadError::QueryTimeout)?;
            iter.filter_map(|(_, v)| unpack_channel_to_claim_value(&v).ok()).collect()
        } else if let Some(reposted) = &filters.reposted_claim_hash {
            let partial = pack_reposted_partial_key(reposted);
            let full_prefix = full_key(Prefix::Reposted, &partial);
            let iter = self.store.iter_prefix(Prefix::Reposted, &full_prefix, false).map_err(|_| ReadError::QueryTimeout)?;
            iter.filter_map(|(_, v)| unpack_reposted_value(&v).ok()).collect()
        } else if let Some(name) = &filters.claim_name {
            let partial = pack_effective_amount_partial_key_name(name);
            let full_prefix = full_key(Prefix::EffectiveAmount, &partial);
            let iter = self.store.iter_prefix(Prefix::EffectiveAmount, &full_prefix, false).map_err(|_| ReadError::QueryTimeout)?;
            iter.filter_map(|(_, v)| unpack_effective_amount_value(&v).ok()).collect()
        } else {
            let full_prefix = full_key(Prefix::ClaimToTxo, &[]);
            let iter = self.store.iter_prefix(Prefix::ClaimToTxo, &full_prefix, false).map_err(|_| ReadError::QueryTimeout)?;
            iter.filter_map(|(k, _)| unpack_claim_to_txo_key(&k[1..]).ok()).collect()
        };

        let mut rows: Vec<ResolvedClaim> = Vec::new();
        for hash in &candidate_hashes {
            if Instant::now() > deadline {
                return Err(ReadError::QueryTimeout);
            }
            let Some(row) = self.claim_row(hash)? else { continue };
            if let Some(n) = &filters.claim_name {
                if &row.name != n {
                    continue;
                }
            }
            let signing = self.signing_channel_of(hash, row.tx_num, row.nout);
            if self.censored_by(hash, signing.as_ref()).is_some() {
                continue;
            }
            let effective_amount = self.effective_amount(hash, height);
            rows.push(ResolvedClaim { claim_hash: *hash, name: row.name, tx_num: row.tx_num, nout: row.nout, amount: row.amount, effective_amount, sig_valid: row.sig_valid });
        }

        match filters.order_by.unwrap_or(OrderBy::EffectiveAmount) {
            OrderBy::EffectiveAmount => rows.sort_by(|a, b| b.effective_amount.cmp(&a.effective_amount).then(a.tx_num.cmp(&b.tx_num)).then(a.nout.cmp(&b.nout))),
            OrderBy::Height => rows.sort_by(|a, b| a.tx_num.cmp(&b.tx_num).then(a.nout.cmp(&b.nout))),
        }

        let total = if filters.include_total { Some(rows.len()) } else { None };
        rows.truncate(limit);
        Ok(SearchResult { rows, total })
    }

    /// Iterates Address-history rows for `hash_x`, yielding `(tx_hash,
    /// height)` pairs in ascending height, up to `limit`.
    pub fn address_history(&self, hash_x: &[u8; 11], limit: usize) -> Result<Vec<([u8; 32], u32)>, ReadError> {
        let partial = pack_address_history_partial_key(hash_x);
        let full_prefix = full_key(Prefix::AddressHistory, &partial);
        let iter = self.store.iter_prefix(Prefix::AddressHistory, &full_prefix, false).map_err(|_| ReadError::QueryTimeout)?;
        let mut out = Vec::new();
        'outer: for (k, v) in iter {
            let suffix = &k[1..];
            if suffix.len() != 15 {
                continue;
            }
            let height = u32::from_be_bytes(suffix[11..15].try_into().unwrap());
            let tx_nums = unpack_address_history_value(&v).map_err(|e| ReadError::NotFound(e.context))?;
            for tx_num in tx_nums {
                let tx_hash = self
                    .store
                    .get(Prefix::TxHash, &full_key(Prefix::TxHash, &pack_tx_hash_key(tx_num)))
                    .ok()
                    .flatten()
                    .and_then(|b| unpack_tx_hash_value(&b).ok());
                if let Some(h) = tx_hash {
                    out.push((h, height));
                    if out.len() >= limit {
                        break 'outer;
                    }
                }
            }
        }
        Ok(out)
    }

    /// First height whose cumulative tx count exceeds `tx_num`, plus the
    /// cumulative count at the end of the prior height (this tx's
    /// within-block offset is `tx_num - prior_cumulative`).
    fn height_and_offset_for_tx_num(&self, tx_num: u32) -> Option<(u32, u32)> {
        let full_prefix = full_key(Prefix::TxCount, &[]);
        let iter = self.store.iter_prefix(Prefix::TxCount, &full_prefix, false).ok()?;
        let mut prior_cumulative = 0u32;
        for (k, v) in iter {
            let height = unpack_height(&k[1..]).ok()?;
            let cumulative = unpack_tx_count_value(&v).ok()?;
            if tx_num < cumulative {
                return Some((height, prior_cumulative));
            }
            prior_cumulative = cumulative;
        }
        None
    }

    fn merkle_branch(leaves: &[[u8; 32]], mut index: usize) -> (Vec<[u8; 32]>, [u8; 32]) {
        let mut level = leaves.to_vec();
        let mut branch = Vec::new();
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(*level.last().unwrap());
            }
            let sibling = if index % 2 == 0 { level[index + 1] } else { level[index - 1] };
            branch.push(sibling);
            let mut next = Vec::with_capacity(level.len() / 2);
            for pair in level.chunks(2) {
                let mut buf = Vec::with_capacity(64);
                buf.extend_from_slice(&pair[0]);
                buf.extend_from_slice(&pair[1]);
                next.push(sha256(&sha256(&buf)));
            }
            level = next;
            index /= 2;
        }
        (branch, level.first().copied().unwrap_or([0u8; 32]))
    }

    /// Looks up each transaction and, for ones seen in a block, computes its
    /// Merkle branch on demand by reading that block's tx-hash range.
    pub fn transactions_with_merkle(&self, tx_ids: &[[u8; 32]]) -> Result<Vec<TxWithMerkle>, ReadError> {
        let mut out = Vec::with_capacity(tx_ids.len());
        for tx_id in tx_ids {
            let raw_tx = self.store.get(Prefix::Tx, &full_key(Prefix::Tx, tx_id)).ok().flatten();
            let Some(raw_tx) = raw_tx else {
                out.push(TxWithMerkle { raw_tx: Vec::new(), height: -1, merkle_path: Vec::new(), position: 0 });
                continue;
            };
            let tx_num = self
                .store
                .get(Prefix::TxNum, &full_key(Prefix::TxNum, tx_id))
                .ok()
                .flatten()
                .and_then(|b| unpack_tx_num_value(&b).ok());
            let Some(tx_num) = tx_num else {
                out.push(TxWithMerkle { raw_tx, height: -1, merkle_path: Vec::new(), position: 0 });
                continue;
            };
            let Some((height, start_tx_num)) = self.height_and_offset_for_tx_num(tx_num) else {
                out.push(TxWithMerkle { raw_tx, height: -1, merkle_path: Vec::new(), position: 0 });
                continue;
            };
            let next_cumulative = self
                .store
                .get(Prefix::TxCount, &full_key(Prefix::TxCount, &pack_height(height)))
                .ok()
                .flatten()
                .and_then(|b| unpack_tx_count_value(&b).ok())
                .unwrap_or(start_tx_num);

            let mut leaves = Vec::new();
            for n in start_tx_num..next_cumulative {
                let hash = self
                    .store
                    .get(Prefix::TxHash, &full_key(Prefix::TxHash, &pack_tx_hash_key(n)))
                    .ok()
                    .flatten()
                    .and_then(|b| unpack_tx_hash_value(&b).ok());
                let Some(hash) = hash else { continue };
                leaves.push(hash);
            }
            let position = (tx_num - start_tx_num) as usize;
            let (branch, _root) = Self::merkle_branch(&leaves, position.min(leaves.len().saturating_sub(1)));
            out.push(TxWithMerkle { raw_tx, height: height as i64, merkle_path: branch, position });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_only_segment() {
        let seg = parse_segment("mychannel");
        assert_eq!(seg.name, b"mychannel");
        assert!(seg.modifier.is_none());
    }

    #[test]
    fn parses_claim_id_segment() {
        let seg = parse_segment("mychannel#abc123");
        assert_eq!(seg.name, b"mychannel");
        assert!(matches!(seg.modifier, Some(Modifier::ClaimId(ref s)) if s == "abc123"));
    }

    #[test]
    fn parses_amount_rank_segment() {
        let seg = parse_segment("mychannel$2");
        assert_eq!(seg.name, b"mychannel");
        assert!(matches!(seg.modifier, Some(Modifier::Amount(2))));
    }

    #[test]
    fn merkle_branch_of_single_leaf_is_empty() {
        let leaves = vec![[7u8; 32]];
        let (branch, root) = Resolver::merkle_branch(&leaves, 0);
        assert!(branch.is_empty());
        assert_eq!(root, leaves[0]);
    }

    #[test]
    fn merkle_branch_of_two_leaves_has_one_step() {
        let leaves = vec![[1u8; 32], [2u8; 32]];
        let (branch, _root) = Resolver::merkle_branch(&leaves, 0);
        assert_eq!(branch, vec![leaves[1]]);
    }
}
