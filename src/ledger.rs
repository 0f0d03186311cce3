use std::path::Path;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use tracing::{debug, info, warn};

use crate::block::{Block, BlockDraft};
use crate::config::StorageConfig;
use crate::formula::{Formula, FormulaDraft, FormulaFilter, FormulaUpdate};
use crate::metrics::{MetricName, MetricsAggregator, MetricsRecord};
use crate::store::{LedgerBackend, LedgerError, MemoryBackend, Result, SqliteBackend};

/// Settings inserted by `init` when absent.
pub const DEFAULT_SETTINGS: &[(&str, &str)] = &[("theme", "light")];

/// Default page size of [`LedgerStore::list_blocks`].
pub const DEFAULT_BLOCK_LIMIT: usize = 100;

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Formulas, blocks, metrics and settings over a [`LedgerBackend`].
#[derive(Clone)]
pub struct LedgerStore {
    backend: Arc<dyn LedgerBackend>,
    metrics: MetricsAggregator,
}

impl LedgerStore {
    /// Wrap a backend and run [`LedgerStore::init`].
    pub fn open(backend: Arc<dyn LedgerBackend>) -> Result<Self> {
        let store = Self {
            metrics: MetricsAggregator::new(backend.clone()),
            backend,
        };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(Arc::new(MemoryBackend::new()))
    }

    pub fn sqlite(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(Arc::new(SqliteBackend::open(path)?))
    }

    /// SQLite when a path is configured, memory otherwise.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match &config.path {
            Some(path) => Self::sqlite(path),
            None => Self::in_memory(),
        }
    }

    /// Insert default settings and the zeroed global metrics record when absent.
    pub fn init(&self) -> Result<()> {
        for (key, value) in DEFAULT_SETTINGS {
            if self.backend.insert_setting_if_absent(key, value)? {
                debug!(key, value, "default setting created");
            }
        }
        if self
            .backend
            .insert_metrics_if_absent(&MetricsRecord::default())?
        {
            info!("global metrics record created");
        }
        Ok(())
    }

    pub(crate) fn backend(&self) -> &Arc<dyn LedgerBackend> {
        &self.backend
    }

    pub fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    // ── Formulas ─────────────────────────────────────────────────────

    /// Store a new formula and count it. Returns the assigned id.
    pub fn create_formula(&self, draft: FormulaDraft) -> Result<u64> {
        let formula = draft.into_formula(now_millis());
        let id = self
            .backend
            .insert_formula(&formula, &[MetricName::FormulaCount])?;
        debug!(formula_id = id, version = formula.version, "formula created");
        Ok(id)
    }

    pub fn get_formula(&self, id: u64) -> Result<Formula> {
        self.backend
            .get_formula(id)?
            .ok_or_else(|| LedgerError::not_found("formula", id))
    }

    /// Apply a partial update. An empty update writes nothing.
    pub fn update_formula(&self, id: u64, update: &FormulaUpdate) -> Result<Formula> {
        if update.is_empty() {
            return self.get_formula(id);
        }
        let formula = self
            .backend
            .update_formula(id, update)?
            .ok_or_else(|| LedgerError::not_found("formula", id))?;
        debug!(formula_id = id, "formula updated");
        Ok(formula)
    }

    /// Remove a formula; `formulaCount` drops by one but never below zero.
    pub fn delete_formula(&self, id: u64) -> Result<()> {
        if !self
            .backend
            .delete_formula(id, Some(MetricName::FormulaCount))?
        {
            return Err(LedgerError::not_found("formula", id));
        }
        debug!(formula_id = id, "formula deleted");
        Ok(())
    }

    /// All formulas in id order, or those carrying any of the filter's tags.
    pub fn list_formulas(&self, filter: &FormulaFilter) -> Result<Vec<Formula>> {
        if filter.tags.is_empty() {
            self.backend.scan_formulas()
        } else {
            self.backend.formulas_with_any_tag(&filter.tags)
        }
    }

    pub fn search_formulas(&self, term: &str) -> Result<Vec<Formula>> {
        Ok(self
            .backend
            .scan_formulas()?
            .into_iter()
            .filter(|f| f.matches_term(term))
            .collect())
    }

    /// Store a mutated child of `parent_id`. Counts both a new formula and a mutation.
    pub fn mutate_formula(&self, parent_id: u64) -> Result<u64> {
        let parent = self.get_formula(parent_id)?;
        let child = parent.mutate(&mut rand::thread_rng());
        self.insert_offspring(child)
    }

    pub fn crossover_formulas(&self, first: u64, second: u64) -> Result<u64> {
        let a = self.get_formula(first)?;
        let b = self.get_formula(second)?;
        self.insert_offspring(a.crossover(&b))
    }

    fn insert_offspring(&self, child: FormulaDraft) -> Result<u64> {
        let formula = child.into_formula(now_millis());
        let id = self.backend.insert_formula(
            &formula,
            &[MetricName::FormulaCount, MetricName::MutationCount],
        )?;
        debug!(formula_id = id, parents = ?formula.provenance, "offspring formula created");
        Ok(id)
    }

    // ── Blocks ───────────────────────────────────────────────────────

    /// Append a block. Numbering and chaining happen under the backend's
    /// write lock, so concurrent callers always get distinct numbers.
    pub fn create_block(&self, draft: BlockDraft) -> Result<Block> {
        let timestamp = now_millis();
        let block = self
            .backend
            .append_block(&mut |head| Block::seal(draft.clone(), timestamp, head))?;
        debug!(block_number = block.block_number, hash = %block.hash, "block created");
        Ok(block)
    }

    pub fn create_signed_block(&self, draft: BlockDraft, key: &SigningKey) -> Result<Block> {
        let timestamp = now_millis();
        let block = self.backend.append_block(&mut |head| {
            let mut block = Block::seal(draft.clone(), timestamp, head);
            block.sign(key);
            block
        })?;
        debug!(block_number = block.block_number, author = ?block.author, "signed block created");
        Ok(block)
    }

    pub fn get_block(&self, block_number: u64) -> Result<Block> {
        self.backend
            .get_block(block_number)?
            .ok_or_else(|| LedgerError::not_found("block", block_number))
    }

    pub fn get_latest_block(&self) -> Result<Option<Block>> {
        self.backend.latest_block()
    }

    /// Most recent first, at most `limit` blocks.
    pub fn list_blocks(&self, limit: usize) -> Result<Vec<Block>> {
        self.backend.recent_blocks(limit)
    }

    /// Walk the whole chain from block 0 and report the first broken block.
    pub fn verify_chain(&self) -> Result<()> {
        let blocks = self.backend.scan_blocks()?;
        let mut prev: Option<&Block> = None;
        for block in &blocks {
            block
                .verify(prev)
                .map_err(|source| LedgerError::ChainVerification {
                    block_number: block.block_number,
                    source,
                })?;
            prev = Some(block);
        }
        debug!(blocks = blocks.len(), "chain verified");
        Ok(())
    }

    // ── Metrics ──────────────────────────────────────────────────────

    pub fn get_metrics(&self) -> Result<MetricsRecord> {
        self.metrics.get_metrics()
    }

    pub fn increment_metric(&self, name: MetricName) -> Result<()> {
        self.metrics.increment_metric(name)
    }

    pub fn decrement_metric(&self, name: MetricName) -> Result<()> {
        self.metrics.decrement_metric(name)
    }

    pub fn update_metric(&self, name: MetricName, value: f64) -> Result<()> {
        self.metrics.update_metric(name, value)
    }

    // ── Settings ─────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.backend.get_setting(key)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.backend.put_setting(key, value)
    }

    /// Drop formulas, blocks and metrics, then recreate the defaults.
    pub fn clear_all(&self) -> Result<()> {
        warn!("clearing ledger");
        self.backend.clear_ledger()?;
        self.init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockError;
    use std::collections::BTreeSet;

    fn store() -> LedgerStore {
        LedgerStore::in_memory().unwrap()
    }

    fn tagged(tags: &[&str]) -> FormulaDraft {
        FormulaDraft::default().with_tags(tags.iter().copied())
    }

    #[test]
    fn test_init_defaults() {
        let store = store();
        assert_eq!(store.get_setting("theme").unwrap().as_deref(), Some("light"));
        assert_eq!(store.get_metrics().unwrap(), MetricsRecord::default());

        store.set_setting("theme", "dark").unwrap();
        store.init().unwrap();
        assert_eq!(store.get_setting("theme").unwrap().as_deref(), Some("dark"));
    }

    #[test]
    fn test_create_formula_counts() {
        let store = store();
        for k in 1..=5u64 {
            let id = store.create_formula(FormulaDraft::default()).unwrap();
            let f = store.get_formula(id).unwrap();
            assert_eq!(f.version, 1);
            assert!(f.timestamp > 0);
            assert_eq!(store.get_metrics().unwrap().formula_count, k);
        }
    }

    #[test]
    fn test_delete_restores_count_and_floors() {
        let store = store();
        let before = store.get_metrics().unwrap().formula_count;
        let a = store.create_formula(FormulaDraft::default()).unwrap();
        let b = store.create_formula(FormulaDraft::default()).unwrap();
        store.delete_formula(b).unwrap();
        store.delete_formula(a).unwrap();
        assert_eq!(store.get_metrics().unwrap().formula_count, before);

        // counter already at zero: further decrements are silent
        store.decrement_metric(MetricName::FormulaCount).unwrap();
        assert_eq!(store.get_metrics().unwrap().formula_count, 0);

        // a counter that under-counts stays at zero on delete
        let c = store.create_formula(FormulaDraft::default()).unwrap();
        store.update_metric(MetricName::FormulaCount, 0.0).unwrap();
        store.delete_formula(c).unwrap();
        assert_eq!(store.get_metrics().unwrap().formula_count, 0);
    }

    #[test]
    fn test_missing_formula_is_not_found() {
        let store = store();
        assert!(store.get_formula(42).unwrap_err().is_not_found());
        assert!(store.delete_formula(42).unwrap_err().is_not_found());
        assert!(store
            .update_formula(42, &FormulaUpdate::default())
            .unwrap_err()
            .is_not_found());
        assert_eq!(store.get_metrics().unwrap().formula_count, 0);
    }

    #[test]
    fn test_update_formula() {
        let store = store();
        let id = store.create_formula(tagged(&["a"])).unwrap();
        let created = store.get_formula(id).unwrap();
        let updated = store
            .update_formula(
                id,
                &FormulaUpdate {
                    version: Some(4),
                    fitness: Some(Some(0.9)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.version, 4);
        assert_eq!(updated.fitness, Some(0.9));
        assert_eq!(updated.timestamp, created.timestamp);
        assert_eq!(updated.tags, vec!["a"]);

        assert_eq!(
            store.update_formula(id, &FormulaUpdate::default()).unwrap(),
            updated
        );
        assert!(store
            .update_formula(999, &FormulaUpdate::default())
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_list_by_tags_is_union() {
        let store = store();
        let a = store.create_formula(tagged(&["a"])).unwrap();
        let b = store.create_formula(tagged(&["b", "c"])).unwrap();
        let ab = store.create_formula(tagged(&["a", "b"])).unwrap();
        let _c = store.create_formula(tagged(&["c"])).unwrap();
        let _none = store.create_formula(tagged(&[])).unwrap();

        let ids: BTreeSet<u64> = store
            .list_formulas(&FormulaFilter::any_tag(["a", "b"]))
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, BTreeSet::from([a, b, ab]));

        assert_eq!(store.list_formulas(&FormulaFilter::default()).unwrap().len(), 5);
    }

    #[test]
    fn test_search() {
        let store = store();
        let hit = store
            .create_formula(FormulaDraft::default().with_io(["Temperature"], ["alarm"]))
            .unwrap();
        store
            .create_formula(FormulaDraft::default().with_io(["pressure"], ["valve"]))
            .unwrap();
        let tag_hit = store.create_formula(tagged(&["TEMPO"])).unwrap();

        let ids: Vec<u64> = store
            .search_formulas("tEmP")
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec![hit, tag_hit]);
        assert!(store.search_formulas("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_mutation_and_crossover() {
        let store = store();
        let a = store
            .create_formula(tagged(&["x"]).with_fitness(1.0))
            .unwrap();
        let b = store
            .create_formula(tagged(&["y"]).with_fitness(0.5))
            .unwrap();

        let m = store.mutate_formula(a).unwrap();
        let child = store.get_formula(m).unwrap();
        assert_eq!(child.version, 2);
        assert_eq!(child.provenance, vec![a]);

        let c = store.crossover_formulas(a, b).unwrap();
        let child = store.get_formula(c).unwrap();
        assert_eq!(child.provenance, vec![a, b]);
        assert_eq!(child.fitness, Some(0.75));
        assert_eq!(child.tags, vec!["x", "y"]);

        let metrics = store.get_metrics().unwrap();
        assert_eq!(metrics.formula_count, 4);
        assert_eq!(metrics.mutation_count, 2);

        assert!(store.mutate_formula(999).unwrap_err().is_not_found());
        assert_eq!(store.get_metrics().unwrap().mutation_count, 2);
    }

    #[test]
    fn test_blocks_sequential() {
        let store = store();
        assert!(store.get_latest_block().unwrap().is_none());
        for n in 0..4u64 {
            let block = store
                .create_block(BlockDraft::with_formulas(vec![n]))
                .unwrap();
            assert_eq!(block.block_number, n);
        }
        assert_eq!(store.get_latest_block().unwrap().unwrap().block_number, 3);
        assert_eq!(store.get_block(1).unwrap().formula_ids, vec![1]);
        assert!(store.get_block(10).unwrap_err().is_not_found());

        let listed: Vec<u64> = store
            .list_blocks(2)
            .unwrap()
            .iter()
            .map(|b| b.block_number)
            .collect();
        assert_eq!(listed, vec![3, 2]);
        assert_eq!(store.list_blocks(DEFAULT_BLOCK_LIMIT).unwrap().len(), 4);
        store.verify_chain().unwrap();
    }

    #[test]
    fn test_concurrent_block_numbers_are_unique() {
        let store = store();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .map(|_| store.create_block(BlockDraft::default()).unwrap().block_number)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut numbers: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (0..80).collect::<Vec<u64>>());
        store.verify_chain().unwrap();
    }

    #[test]
    fn test_signed_blocks_verify() {
        let store = store();
        let key = SigningKey::generate(&mut rand::thread_rng());
        store.create_block(BlockDraft::default()).unwrap();
        let signed = store
            .create_signed_block(BlockDraft::with_formulas(vec![1]), &key)
            .unwrap();
        assert_eq!(signed.block_number, 1);
        assert!(signed.signature.is_some());
        store.verify_chain().unwrap();
    }

    #[test]
    fn test_verify_chain_reports_tampering() {
        let backend = Arc::new(MemoryBackend::new());
        let store = LedgerStore::open(backend.clone()).unwrap();
        store.create_block(BlockDraft::default()).unwrap();
        let genuine = store.create_block(BlockDraft::default()).unwrap();

        // append a block whose prev_hash does not link to block 1
        backend
            .append_block(&mut |_| {
                let mut forged = Block::seal(BlockDraft::default(), 5, Some(&genuine));
                forged.prev_hash = genuine.prev_hash.clone();
                forged.hash = forged.compute_hash();
                forged
            })
            .unwrap();

        match store.verify_chain() {
            Err(LedgerError::ChainVerification {
                block_number,
                source,
            }) => {
                assert_eq!(block_number, 2);
                assert_eq!(source, BlockError::BrokenLink);
            }
            other => panic!("expected ChainVerification, got {:?}", other),
        }
    }

    #[test]
    fn test_recompute_avg_fitness() {
        let store = store();
        assert_eq!(store.metrics().recompute_avg_fitness().unwrap(), 0.0);
        store
            .create_formula(FormulaDraft::default().with_fitness(0.2))
            .unwrap();
        store
            .create_formula(FormulaDraft::default().with_fitness(0.6))
            .unwrap();
        store.create_formula(FormulaDraft::default()).unwrap();

        // never recomputed implicitly
        assert_eq!(store.get_metrics().unwrap().avg_fitness, 0.0);
        let avg = store.metrics().recompute_avg_fitness().unwrap();
        assert!((avg - 0.4).abs() < 1e-9);
        assert!((store.get_metrics().unwrap().avg_fitness - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_clear_all() {
        let store = store();
        store.create_formula(FormulaDraft::default()).unwrap();
        store.create_block(BlockDraft::default()).unwrap();
        store.increment_metric(MetricName::ExecutionCount).unwrap();
        store.set_setting("theme", "dark").unwrap();

        store.clear_all().unwrap();
        assert!(store.list_formulas(&FormulaFilter::default()).unwrap().is_empty());
        assert!(store.get_latest_block().unwrap().is_none());
        assert_eq!(store.get_metrics().unwrap(), MetricsRecord::default());
        assert_eq!(store.get_setting("theme").unwrap().as_deref(), Some("dark"));

        let block = store.create_block(BlockDraft::default()).unwrap();
        assert_eq!(block.block_number, 0);
    }
}
