/// Error Taxonomy
///
/// Concrete error enums for each concern named in the error-handling design:
/// chain-level failures, op-stack integrity violations, codec corruption,
/// and read-path errors that are never fatal to the writer.
use std::fmt;

/// Upstream node returned a block inconsistent with prior state, or a reorg
/// could not be resolved. Fatal; the single-writer loop shuts down on this.
#[derive(Debug, Clone)]
pub enum ChainError {
    /// No undo record exists for a height the reorg detector needs to roll back.
    MissingUndo { height: u32 },
    /// The node's block at `height` doesn't chain from our stored tip.
    Discontinuous { height: u32, expected_prev: String, got_prev: String },
    /// Fork point could not be found within the configured reorg limit.
    ForkTooDeep { searched: u32, limit: u32 },
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::MissingUndo { height } => {
                write!(f, "no undo record for height {height}, cannot roll back")
            }
            ChainError::Discontinuous { height, expected_prev, got_prev } => write!(
                f,
                "block at height {height} does not chain: expected prev {expected_prev}, got {got_prev}"
            ),
            ChainError::ForkTooDeep { searched, limit } => {
                write!(f, "fork point not found after searching {searched} blocks (limit {limit})")
            }
        }
    }
}

impl std::error::Error for ChainError {}

/// The op-stack rejected an operation against currently committed state.
/// Fatal unless the key's prefix is in the configured unsafe-prefix set, in
/// which case the caller logs a warning and continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    OverwriteWithoutDelete { prefix: u8 },
    DeleteNonexistent { prefix: u8 },
    DeleteWrongValue { prefix: u8 },
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityError::OverwriteWithoutDelete { prefix } => {
                write!(f, "overwrite without delete (prefix 0x{prefix:02x})")
            }
            IntegrityError::DeleteNonexistent { prefix } => {
                write!(f, "delete nonexistent (prefix 0x{prefix:02x})")
            }
            IntegrityError::DeleteWrongValue { prefix } => {
                write!(f, "delete with wrong value (prefix 0x{prefix:02x})")
            }
        }
    }
}

impl std::error::Error for IntegrityError {}

/// The codec rejected a persisted row: wrong length, or unknown prefix at
/// store-open time. Fatal; signals schema mismatch or disk corruption.
#[derive(Debug, Clone)]
pub struct CorruptRow {
    pub context: String,
}

impl CorruptRow {
    pub fn new(context: impl Into<String>) -> Self {
        Self { context: context.into() }
    }
}

impl fmt::Display for CorruptRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corrupt row: {}", self.context)
    }
}

impl std::error::Error for CorruptRow {}

/// Read-path errors. Never fatal to the writer; the resolver converts these
/// into typed responses.
#[derive(Debug, Clone)]
pub enum ReadError {
    NotFound(String),
    Censored { blocking_channel_hash: [u8; 20] },
    QueryTimeout,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::NotFound(what) => write!(f, "not found: {what}"),
            ReadError::Censored { blocking_channel_hash } => {
                write!(f, "censored by channel {}", hex::encode(blocking_channel_hash))
            }
            ReadError::QueryTimeout => write!(f, "query timed out"),
        }
    }
}

impl std::error::Error for ReadError {}

/// RPC connection / timeout errors talking to the upstream node. The
/// prefetcher retries these with exponential backoff; never fatal by itself.
#[derive(Debug, Clone)]
pub struct TransientUpstream {
    pub context: String,
}

impl TransientUpstream {
    pub fn new(context: impl Into<String>) -> Self {
        Self { context: context.into() }
    }
}

impl fmt::Display for TransientUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transient upstream error: {}", self.context)
    }
}

impl std::error::Error for TransientUpstream {}

/// Top-level error returned by `advance_block` / `rollback_block`. Any
/// variant here causes the caller to drop staged ops without committing.
#[derive(Debug)]
pub enum IndexerError {
    Chain(ChainError),
    Integrity(IntegrityError),
    Corrupt(CorruptRow),
    Store(rocksdb::Error),
}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexerError::Chain(e) => write!(f, "{e}"),
            IndexerError::Integrity(e) => write!(f, "{e}"),
            IndexerError::Corrupt(e) => write!(f, "{e}"),
            IndexerError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for IndexerError {}

impl From<ChainError> for IndexerError {
    fn from(e: ChainError) -> Self {
        IndexerError::Chain(e)
    }
}

impl From<IntegrityError> for IndexerError {
    fn from(e: IntegrityError) -> Self {
        IndexerError::Integrity(e)
    }
}

impl From<CorruptRow> for IndexerError {
    fn from(e: CorruptRow) -> Self {
        IndexerError::Corrupt(e)
    }
}

impl From<rocksdb::Error> for IndexerError {
    fn from(e: rocksdb::Error) -> Self {
        IndexerError::Store(e)
    }
}
