/// Revertable Op-Stack
///
/// Buffers all mutations for the block currently being processed, enforces
/// the integrity rules in spec.md §4.2 against the previously staged op on
/// the same key, and produces an undo blob on commit. The op-stack itself
/// never looks at the store directly — `RevertableOpStack::append` needs a
/// "does this key currently hold a value, and if so what" oracle, which the
/// `PrefixStore` supplies via `current_value`.
use crate::error::IntegrityError;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Put = 0,
    Delete = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertableOp {
    pub kind: OpKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl RevertableOp {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { kind: OpKind::Put, key, value }
    }

    pub fn delete(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { kind: OpKind::Delete, key, value }
    }

    /// The inverse op: a Put's inverse is a Delete of the same pair and
    /// vice versa. Applying `inverse()` through the op-stack and committing
    /// is how undo works.
    pub fn inverse(&self) -> RevertableOp {
        match self.kind {
            OpKind::Put => RevertableOp::delete(self.key.clone(), self.value.clone()),
            OpKind::Delete => RevertableOp::put(self.key.clone(), self.value.clone()),
        }
    }

    /// `u8 kind || u32 key_len || u32 val_len || key || val`
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 + 4 + self.key.len() + self.value.len());
        out.push(self.kind as u8);
        out.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        out.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
        out
    }

    pub fn unpack(buf: &[u8], pos: &mut usize) -> Option<RevertableOp> {
        if buf.len() < *pos + 9 {
            return None;
        }
        let kind = match buf[*pos] {
            0 => OpKind::Put,
            1 => OpKind::Delete,
            _ => return None,
        };
        let key_len = u32::from_be_bytes(buf[*pos + 1..*pos + 5].try_into().unwrap()) as usize;
        let val_len = u32::from_be_bytes(buf[*pos + 5..*pos + 9].try_into().unwrap()) as usize;
        let mut p = *pos + 9;
        if buf.len() < p + key_len + val_len {
            return None;
        }
        let key = buf[p..p + key_len].to_vec();
        p += key_len;
        let value = buf[p..p + val_len].to_vec();
        p += val_len;
        *pos = p;
        Some(RevertableOp { kind, key, value })
    }
}

/// Something that can answer "what value, if any, is currently committed
/// under this key" — implemented by `PrefixStore`, faked in unit tests.
pub trait CurrentValueOracle {
    fn current_value(&self, key: &[u8]) -> Option<Vec<u8>>;
}

/// Staged mutation buffer for one block (or one undo replay).
///
/// Slots are tombstoned (`None`) rather than removed when a cancel-on-exact-
/// inverse rule fires, so that cancellation works no matter where in the
/// sequence the key's last op sits — a later key's op may already have been
/// pushed after it. `ops()`/`pack_undo()` skip tombstones; global ordering of
/// the remaining live ops is otherwise unchanged.
pub struct RevertableOpStack {
    ops: Vec<Option<RevertableOp>>,
    /// Index of the last staged (live) op for a key, so integrity checks and
    /// `get_last_op_for_key` don't rescan the whole vector.
    last_op_index: HashMap<Vec<u8>, usize>,
    unsafe_prefixes: std::collections::HashSet<u8>,
}

impl RevertableOpStack {
    pub fn new(unsafe_prefixes: std::collections::HashSet<u8>) -> Self {
        Self { ops: Vec::new(), last_op_index: HashMap::new(), unsafe_prefixes }
    }

    pub fn is_empty(&self) -> bool {
        self.last_op_index.is_empty()
    }

    pub fn ops(&self) -> impl Iterator<Item = &RevertableOp> {
        self.ops.iter().filter_map(|o| o.as_ref())
    }

    pub fn get_last_op_for_key(&self, key: &[u8]) -> Option<&RevertableOp> {
        self.last_op_index.get(key).and_then(|&i| self.ops[i].as_ref())
    }

    fn prefix_of(key: &[u8]) -> u8 {
        key.first().copied().unwrap_or(0)
    }

    /// Appends `op`, applying the integrity rules of spec.md §4.2 in order:
    /// cancel-on-exact-inverse, drop-on-duplicate, then the three integrity
    /// checks against `oracle`'s current committed value.
    pub fn append(
        &mut self,
        op: RevertableOp,
        oracle: &dyn CurrentValueOracle,
    ) -> Result<(), IntegrityError> {
        if let Some(&idx) = self.last_op_index.get(&op.key) {
            let prev = self.ops[idx].as_ref().expect("last_op_index only points at live slots");
            if prev.kind != op.kind && prev.value == op.value {
                // Rule 1: exact inverse of the previous op on this key — cancel.
                // Tombstone the slot in place rather than popping the tail, so
                // this works regardless of how many other keys' ops were
                // staged in between.
                self.ops[idx] = None;
                self.last_op_index.remove(&op.key);
                return Ok(());
            }
            if prev.kind == op.kind && prev.value == op.value {
                // Rule 2: duplicate of the previous op — idempotent, drop.
                return Ok(());
            }
        }

        let prefix = Self::prefix_of(&op.key);
        let staged = self.last_op_index.get(&op.key).and_then(|&i| self.ops[i].as_ref());
        let current = oracle.current_value(&op.key);

        let violation = match op.kind {
            OpKind::Put => {
                // Rule 3: overwrite without delete.
                if current.is_some() && !matches!(staged, Some(o) if o.kind == OpKind::Delete) {
                    Some(IntegrityError::OverwriteWithoutDelete { prefix })
                } else {
                    None
                }
            }
            OpKind::Delete => {
                if current.is_none() && !matches!(staged, Some(o) if o.kind == OpKind::Put) {
                    // Rule 4: delete nonexistent.
                    Some(IntegrityError::DeleteNonexistent { prefix })
                } else if let Some(cur) = &current {
                    // Rule 5: delete with wrong value, unless a Delete(old_value)
                    // already precedes it in the stage (replace-then-replace pattern).
                    if cur != &op.value && !matches!(staged, Some(o) if o.kind == OpKind::Delete) {
                        Some(IntegrityError::DeleteWrongValue { prefix })
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
        };

        if let Some(err) = violation {
            if self.unsafe_prefixes.contains(&prefix) {
                tracing::warn!(%err, prefix = format!("0x{prefix:02x}"), "integrity violation downgraded for unsafe prefix");
            } else {
                return Err(err);
            }
        }

        let idx = self.ops.len();
        self.last_op_index.insert(op.key.clone(), idx);
        self.ops.push(Some(op));
        Ok(())
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>, oracle: &dyn CurrentValueOracle) -> Result<(), IntegrityError> {
        self.append(RevertableOp::put(key, value), oracle)
    }

    pub fn delete(&mut self, key: Vec<u8>, value: Vec<u8>, oracle: &dyn CurrentValueOracle) -> Result<(), IntegrityError> {
        self.append(RevertableOp::delete(key, value), oracle)
    }

    /// Clears the stage (called after a successful commit or a dropped block).
    pub fn clear(&mut self) {
        self.ops.clear();
        self.last_op_index.clear();
    }

    /// The undo blob: reverse-order concatenation of the inverse of every
    /// staged op, so replaying it restores pre-commit state when fed back
    /// through a fresh op-stack.
    pub fn pack_undo(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for op in self.ops.iter().rev().filter_map(|o| o.as_ref()) {
            out.extend_from_slice(&op.inverse().pack());
        }
        out
    }

    pub fn unpack_undo(buf: &[u8]) -> Vec<RevertableOp> {
        let mut ops = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            match RevertableOp::unpack(buf, &mut pos) {
                Some(op) => ops.push(op),
                None => break,
            }
        }
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    struct FakeStore(StdHashMap<Vec<u8>, Vec<u8>>);
    impl CurrentValueOracle for FakeStore {
        fn current_value(&self, key: &[u8]) -> Option<Vec<u8>> {
            self.0.get(key).cloned()
        }
    }

    #[test]
    fn put_then_exact_inverse_delete_cancels() {
        let store = FakeStore(StdHashMap::new());
        let mut stack = RevertableOpStack::new(Default::default());
        stack.put(b"k".to_vec(), b"v".to_vec(), &store).unwrap();
        stack.delete(b"k".to_vec(), b"v".to_vec(), &store).unwrap();
        assert!(stack.is_empty());
    }

    #[test]
    fn cancel_works_with_other_keys_staged_in_between() {
        let store = FakeStore(StdHashMap::new());
        let mut stack = RevertableOpStack::new(Default::default());
        stack.put(b"k".to_vec(), b"v".to_vec(), &store).unwrap();
        stack.put(b"other".to_vec(), b"x".to_vec(), &store).unwrap();
        stack.delete(b"k".to_vec(), b"v".to_vec(), &store).unwrap();

        assert!(stack.get_last_op_for_key(b"k").is_none());
        let remaining: Vec<_> = stack.ops().cloned().collect();
        assert_eq!(remaining, vec![RevertableOp::put(b"other".to_vec(), b"x".to_vec())]);

        let undo = stack.pack_undo();
        let ops = RevertableOpStack::unpack_undo(&undo);
        assert_eq!(ops, vec![RevertableOp::delete(b"other".to_vec(), b"x".to_vec())]);
    }

    #[test]
    fn overwrite_without_delete_is_integrity_error() {
        let mut m = StdHashMap::new();
        m.insert(b"k".to_vec(), b"old".to_vec());
        let store = FakeStore(m);
        let mut stack = RevertableOpStack::new(Default::default());
        let err = stack.put(b"k".to_vec(), b"new".to_vec(), &store).unwrap_err();
        assert_eq!(err, IntegrityError::OverwriteWithoutDelete { prefix: b'k' });
    }

    #[test]
    fn delete_nonexistent_is_integrity_error() {
        let store = FakeStore(StdHashMap::new());
        let mut stack = RevertableOpStack::new(Default::default());
        let err = stack.delete(b"k".to_vec(), b"v".to_vec(), &store).unwrap_err();
        assert_eq!(err, IntegrityError::DeleteNonexistent { prefix: b'k' });
    }

    #[test]
    fn delete_wrong_value_is_integrity_error() {
        let mut m = StdHashMap::new();
        m.insert(b"k".to_vec(), b"actual".to_vec());
        let store = FakeStore(m);
        let mut stack = RevertableOpStack::new(Default::default());
        let err = stack.delete(b"k".to_vec(), b"wrong".to_vec(), &store).unwrap_err();
        assert_eq!(err, IntegrityError::DeleteWrongValue { prefix: b'k' });
    }

    #[test]
    fn unsafe_prefix_downgrades_to_warning() {
        let mut m = StdHashMap::new();
        m.insert(b"k".to_vec(), b"old".to_vec());
        let store = FakeStore(m);
        let mut unsafe_prefixes = std::collections::HashSet::new();
        unsafe_prefixes.insert(b'k');
        let mut stack = RevertableOpStack::new(unsafe_prefixes);
        assert!(stack.put(b"k".to_vec(), b"new".to_vec(), &store).is_ok());
    }

    #[test]
    fn delete_then_replace_put_allowed_and_undo_restores_old_value() {
        let mut m = StdHashMap::new();
        m.insert(b"k".to_vec(), b"old".to_vec());
        let store = FakeStore(m);
        let mut stack = RevertableOpStack::new(Default::default());
        stack.delete(b"k".to_vec(), b"old".to_vec(), &store).unwrap();
        stack.put(b"k".to_vec(), b"new".to_vec(), &store).unwrap();
        let undo = stack.pack_undo();
        let ops = RevertableOpStack::unpack_undo(&undo);
        // Undo replays in reverse: first inverse of put (delete new), then
        // inverse of delete (put old).
        assert_eq!(ops[0], RevertableOp::delete(b"k".to_vec(), b"new".to_vec()));
        assert_eq!(ops[1], RevertableOp::put(b"k".to_vec(), b"old".to_vec()));
    }

    #[test]
    fn undo_pack_roundtrip() {
        let store = FakeStore(StdHashMap::new());
        let mut stack = RevertableOpStack::new(Default::default());
        stack.put(b"a".to_vec(), b"1".to_vec(), &store).unwrap();
        let undo = stack.pack_undo();
        let ops = RevertableOpStack::unpack_undo(&undo);
        assert_eq!(ops, vec![RevertableOp::delete(b"a".to_vec(), b"1".to_vec())]);
    }
}
