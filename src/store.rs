/// Prefix Store
///
/// Thin wrapper over `rocksdb` exposing per-prefix typed rows backed by one
/// column family per prefix tag (spec.md §4.3). Mediates every write through
/// a `RevertableOpStack`, writes the undo blob alongside the data it undoes,
/// and prunes undo history past `max_undo_depth`.
use crate::codec::Prefix;
use crate::error::{CorruptRow, IndexerError};
use crate::revertable::{CurrentValueOracle, RevertableOp, RevertableOpStack};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, ReadOptions, DB};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

pub struct PrefixStore {
    db: Arc<DB>,
    max_undo_depth: u32,
}

impl PrefixStore {
    /// Opens (creating if missing) the store at `path`. Column families are
    /// initialized by enumerating `Prefix::ALL`; a store on disk with a CF
    /// not in that table fails to open (schema mismatch), per spec.md §4.3.
    pub fn open(path: impl AsRef<Path>, cache_mib: u32, max_open_files: i32, max_undo_depth: u32) -> Result<Self, rocksdb::Error> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(max_open_files);
        db_opts.increase_parallelism(num_cpus_hint());

        let mut cf_opts = Options::default();
        if cache_mib > 0 {
            let cache = rocksdb::Cache::new_lru_cache(cache_mib as usize * 1024 * 1024);
            let mut block_opts = rocksdb::BlockBasedOptions::default();
            block_opts.set_block_cache(&cache);
            cf_opts.set_block_based_table_factory(&block_opts);
        }

        let descriptors: Vec<ColumnFamilyDescriptor> = Prefix::ALL
            .iter()
            .map(|p| ColumnFamilyDescriptor::new(p.cf_name(), cf_opts.clone()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, descriptors)?;
        Ok(Self { db: Arc::new(db), max_undo_depth })
    }

    /// Opens the store as a secondary (read-only) instance, as the Resolver
    /// does so it can run in a separate thread/process from the writer.
    pub fn open_secondary(primary_path: impl AsRef<Path>, secondary_path: impl AsRef<Path>) -> Result<Self, rocksdb::Error> {
        let mut opts = Options::default();
        opts.create_if_missing(false);
        let cf_names: Vec<&str> = Prefix::ALL.iter().map(|p| p.cf_name()).collect();
        let db = DB::open_cf_as_secondary(&opts, primary_path, secondary_path, cf_names)?;
        Ok(Self { db: Arc::new(db), max_undo_depth: 0 })
    }

    pub fn catch_up_with_primary(&self) -> Result<(), rocksdb::Error> {
        self.db.try_catch_up_with_primary()
    }

    fn cf(&self, prefix: Prefix) -> Result<&rocksdb::ColumnFamily, CorruptRow> {
        self.db
            .cf_handle(prefix.cf_name())
            .ok_or_else(|| CorruptRow::new(format!("missing column family {}", prefix.cf_name())))
    }

    pub fn get(&self, prefix: Prefix, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError> {
        let cf = self.cf(prefix)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    /// Forward or reverse iteration over all keys sharing `key_prefix`
    /// within `prefix`'s column family.
    pub fn iter_prefix<'a>(
        &'a self,
        prefix: Prefix,
        key_prefix: &'a [u8],
        reverse: bool,
    ) -> Result<Box<dyn Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'a>, IndexerError> {
        let cf = self.cf(prefix)?;
        let mut ro = ReadOptions::default();
        ro.set_prefix_same_as_start(false);
        let mode = if reverse {
            // Seek to the upper bound of this prefix, then iterate backward.
            let mut upper = key_prefix.to_vec();
            upper.push(0xff);
            IteratorMode::From(&upper, Direction::Reverse)
        } else {
            IteratorMode::From(key_prefix, Direction::Forward)
        };
        let raw = self.db.iterator_cf_opt(cf, ro, mode);
        let key_prefix_owned = key_prefix.to_vec();
        let iter = raw
            .filter_map(|r| r.ok())
            .take_while(move |(k, _)| k.starts_with(&key_prefix_owned));
        Ok(Box::new(iter))
    }

    /// Bounded range iteration from `start` (inclusive) to `end` (exclusive).
    pub fn iter_range<'a>(
        &'a self,
        prefix: Prefix,
        start: &'a [u8],
        end: &'a [u8],
    ) -> Result<Box<dyn Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'a>, IndexerError> {
        let cf = self.cf(prefix)?;
        let raw = self.db.iterator_cf(cf, IteratorMode::From(start, Direction::Forward));
        let end_owned = end.to_vec();
        let iter = raw.filter_map(|r| r.ok()).take_while(move |(k, _)| &k[..] < &end_owned[..]);
        Ok(Box::new(iter))
    }

    /// Applies `stack`'s staged ops atomically together with the block's
    /// undo record, then prunes undo entries older than `height -
    /// max_undo_depth`. Clears `stack` on success.
    pub fn commit(&self, stack: &mut RevertableOpStack, height: u32, block_hash: &[u8; 32]) -> Result<(), IndexerError> {
        let undo_blob = stack.pack_undo();
        let mut batch = rocksdb::WriteBatch::default();
        for op in stack.ops() {
            self.stage_op(&mut batch, op)?;
        }
        let undo_key = crate::codec::pack_undo_key(height, block_hash);
        batch.put_cf(self.cf(Prefix::Undo)?, &undo_key, &undo_blob);

        if height > self.max_undo_depth {
            self.prune_undo_before(&mut batch, height - self.max_undo_depth)?;
        }

        self.db.write(batch)?;
        stack.clear();
        Ok(())
    }

    /// Same as `commit` but writes no undo record; used only for bulk
    /// initial load where rollback is not required.
    pub fn unsafe_commit(&self, stack: &mut RevertableOpStack) -> Result<(), IndexerError> {
        let mut batch = rocksdb::WriteBatch::default();
        for op in stack.ops() {
            self.stage_op(&mut batch, op)?;
        }
        self.db.write(batch)?;
        stack.clear();
        Ok(())
    }

    fn stage_op(&self, batch: &mut rocksdb::WriteBatch, op: &RevertableOp) -> Result<(), IndexerError> {
        let prefix = op.key.first().copied().and_then(Prefix::from_byte);
        let cf = match prefix {
            Some(p) => self.cf(p)?,
            None => return Err(CorruptRow::new("op key has unknown prefix byte").into()),
        };
        match op.kind {
            crate::revertable::OpKind::Put => batch.put_cf(cf, &op.key, &op.value),
            crate::revertable::OpKind::Delete => batch.delete_cf(cf, &op.key),
        }
        Ok(())
    }

    fn prune_undo_before(&self, batch: &mut rocksdb::WriteBatch, before_height: u32) -> Result<(), IndexerError> {
        let cf = self.cf(Prefix::Undo)?;
        let raw = self.db.iterator_cf(cf, IteratorMode::Start);
        for item in raw {
            let (k, _) = item?;
            if let Ok((h, _)) = crate::codec::unpack_undo_key(&k) {
                if h < before_height {
                    batch.delete_cf(cf, &k);
                } else {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Reads `Undo[(height, block_hash)]`, replays its ops through a fresh
    /// op-stack (re-validating integrity), and commits the result, removing
    /// the undo entry. `unsafe_prefixes` is passed through so rollback
    /// tolerates the same known-legacy inconsistencies as forward advance.
    pub fn rollback(
        &self,
        height: u32,
        block_hash: &[u8; 32],
        unsafe_prefixes: &HashSet<u8>,
    ) -> Result<(), IndexerError> {
        let undo_key = crate::codec::pack_undo_key(height, block_hash);
        let undo_blob = self
            .get(Prefix::Undo, &undo_key)?
            .ok_or(crate::error::ChainError::MissingUndo { height })?;

        let ops = RevertableOpStack::unpack_undo(&undo_blob);
        let mut stack = RevertableOpStack::new(unsafe_prefixes.clone());
        for op in ops {
            match op.kind {
                crate::revertable::OpKind::Put => stack.put(op.key, op.value, self)?,
                crate::revertable::OpKind::Delete => stack.delete(op.key, op.value, self)?,
            }
        }

        let mut batch = rocksdb::WriteBatch::default();
        for op in stack.ops() {
            self.stage_op(&mut batch, op)?;
        }
        batch.delete_cf(self.cf(Prefix::Undo)?, &undo_key);
        self.db.write(batch)?;
        stack.clear();
        Ok(())
    }

    pub fn raw(&self) -> &Arc<DB> {
        &self.db
    }
}

impl CurrentValueOracle for PrefixStore {
    fn current_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        let prefix = key.first().copied().and_then(Prefix::from_byte)?;
        self.get(prefix, key).ok().flatten()
    }
}

fn num_cpus_hint() -> i32 {
    std::thread::available_parallelism().map(|n| n.get() as i32).unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revertable::RevertableOpStack;

    fn temp_store() -> (tempfile::TempDir, PrefixStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PrefixStore::open(dir.path(), 16, 64, 200).unwrap();
        (dir, store)
    }

    #[test]
    fn commit_then_rollback_restores_state() {
        let (_dir, store) = temp_store();
        let key = crate::codec::pack_claim_to_txo_key(&[1u8; 20]);
        let mut full_key = vec![Prefix::ClaimToTxo as u8];
        full_key.extend_from_slice(&key);

        let mut stack = RevertableOpStack::new(Default::default());
        stack.put(full_key.clone(), b"v1".to_vec(), &store).unwrap();
        let block_hash = [9u8; 32];
        store.commit(&mut stack, 1, &block_hash).unwrap();
        assert_eq!(store.get(Prefix::ClaimToTxo, &full_key).unwrap(), Some(b"v1".to_vec()));

        store.rollback(1, &block_hash, &Default::default()).unwrap();
        assert_eq!(store.get(Prefix::ClaimToTxo, &full_key).unwrap(), None);
    }

    #[test]
    fn prefix_iteration_respects_bounds() {
        let (_dir, store) = temp_store();
        let mut stack = RevertableOpStack::new(Default::default());
        for i in 0u8..3 {
            let mut k = vec![Prefix::ClaimToTxo as u8];
            k.push(i);
            stack.put(k, vec![i], &store).unwrap();
        }
        store.commit(&mut stack, 1, &[0u8; 32]).unwrap();
        let prefix_key = vec![Prefix::ClaimToTxo as u8];
        let items: Vec<_> = store.iter_prefix(Prefix::ClaimToTxo, &prefix_key, false).unwrap().collect();
        assert_eq!(items.len(), 3);
    }
}
