//! Persistent store capability consumed by the ledger.
//!
//! The ledger depends on [`LedgerBackend`] rather than a concrete engine so
//! that the in-memory and SQLite backends are interchangeable. Compound
//! sequences (insert-then-count, read-head-then-append) are single backend
//! calls, so implementations run them inside one critical section.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use crate::block::{Block, BlockError};
use crate::formula::{Formula, FormulaUpdate};
use crate::metrics::{MetricName, MetricsRecord};

/// Errors surfaced by the ledger and its backends.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("import parse error: {0}")]
    ImportParse(String),

    #[error("chain verification failed at block {block_number}: {source}")]
    ChainVerification {
        block_number: u64,
        #[source]
        source: BlockError,
    },
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {e}"))
    }
}

/// Builds the next block given the current head. Called by the backend while
/// it holds its write lock.
pub type BlockSealer<'a> = &'a mut dyn FnMut(Option<&Block>) -> Block;

pub trait LedgerBackend: Send + Sync {
    /// Insert a formula under a fresh id and apply `+1` to each of `bumps`
    /// on the global metrics record, atomically.
    fn insert_formula(&self, formula: &Formula, bumps: &[MetricName]) -> Result<u64>;

    /// Insert many formulas under fresh ids, leaving metrics untouched.
    fn bulk_insert_formulas(&self, formulas: &[Formula]) -> Result<Vec<u64>>;

    fn get_formula(&self, id: u64) -> Result<Option<Formula>>;

    /// Apply a partial update; `None` if the formula does not exist.
    fn update_formula(&self, id: u64, update: &FormulaUpdate) -> Result<Option<Formula>>;

    /// Remove a formula and apply `-1` (floored) to `decrement`. Returns
    /// whether a formula was removed; counters are untouched when it was not.
    fn delete_formula(&self, id: u64, decrement: Option<MetricName>) -> Result<bool>;

    /// Every formula, ordered by id.
    fn scan_formulas(&self) -> Result<Vec<Formula>>;

    /// Formulas carrying at least one of `tags`, each once, ordered by id.
    fn formulas_with_any_tag(&self, tags: &[String]) -> Result<Vec<Formula>>;

    /// Read the head, seal the next block with it and append, atomically.
    fn append_block(&self, seal: BlockSealer<'_>) -> Result<Block>;

    fn get_block(&self, block_number: u64) -> Result<Option<Block>>;

    fn latest_block(&self) -> Result<Option<Block>>;

    /// Most recent first.
    fn recent_blocks(&self, limit: usize) -> Result<Vec<Block>>;

    /// Ascending by block number.
    fn scan_blocks(&self) -> Result<Vec<Block>>;

    fn get_metrics_record(&self, key: &str) -> Result<Option<MetricsRecord>>;

    /// Upsert by key.
    fn put_metrics_record(&self, record: &MetricsRecord) -> Result<()>;

    /// Read-modify-write of one field. No-op if the record does not exist.
    fn adjust_metric(&self, key: &str, name: MetricName, delta: i64) -> Result<()>;

    /// Overwrite one field. No-op if the record does not exist.
    fn set_metric(&self, key: &str, name: MetricName, value: f64) -> Result<()>;

    fn scan_metrics(&self) -> Result<Vec<MetricsRecord>>;

    fn get_setting(&self, key: &str) -> Result<Option<String>>;

    fn put_setting(&self, key: &str, value: &str) -> Result<()>;

    /// Insert only when the key is absent. Returns whether it was inserted.
    fn insert_setting_if_absent(&self, key: &str, value: &str) -> Result<bool>;

    /// Insert the metrics record only when its key is absent.
    fn insert_metrics_if_absent(&self, record: &MetricsRecord) -> Result<bool>;

    /// Remove all formulas, blocks and metrics records. Settings survive.
    fn clear_ledger(&self) -> Result<()>;
}
