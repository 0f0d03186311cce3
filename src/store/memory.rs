//! [`MemoryBackend`] -- ordered maps behind a single mutex.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use super::{BlockSealer, LedgerBackend, LedgerError, Result};
use crate::block::Block;
use crate::formula::{Formula, FormulaFilter, FormulaUpdate};
use crate::metrics::{MetricName, MetricsRecord, GLOBAL_METRICS_KEY};

#[derive(Default)]
struct Tables {
    next_formula_id: u64,
    formulas: BTreeMap<u64, Formula>,
    blocks: BTreeMap<u64, Block>,
    metrics: BTreeMap<String, MetricsRecord>,
    settings: HashMap<String, String>,
}

impl Tables {
    fn insert_formula(&mut self, formula: &Formula) -> u64 {
        self.next_formula_id += 1;
        let id = self.next_formula_id;
        let mut stored = formula.clone();
        stored.id = id;
        self.formulas.insert(id, stored);
        id
    }
}

/// Volatile backend; contents vanish with the process.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        debug!("opening in-memory ledger backend");
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| LedgerError::Storage(format!("mutex poisoned: {e}")))
    }
}

impl LedgerBackend for MemoryBackend {
    fn insert_formula(&self, formula: &Formula, bumps: &[MetricName]) -> Result<u64> {
        let mut t = self.lock()?;
        let id = t.insert_formula(formula);
        if let Some(m) = t.metrics.get_mut(GLOBAL_METRICS_KEY) {
            for name in bumps {
                m.adjust(*name, 1);
            }
        }
        Ok(id)
    }

    fn bulk_insert_formulas(&self, formulas: &[Formula]) -> Result<Vec<u64>> {
        let mut t = self.lock()?;
        Ok(formulas.iter().map(|f| t.insert_formula(f)).collect())
    }

    fn get_formula(&self, id: u64) -> Result<Option<Formula>> {
        Ok(self.lock()?.formulas.get(&id).cloned())
    }

    fn update_formula(&self, id: u64, update: &FormulaUpdate) -> Result<Option<Formula>> {
        let mut t = self.lock()?;
        Ok(t.formulas.get_mut(&id).map(|f| {
            update.apply(f);
            f.clone()
        }))
    }

    fn delete_formula(&self, id: u64, decrement: Option<MetricName>) -> Result<bool> {
        let mut t = self.lock()?;
        if t.formulas.remove(&id).is_none() {
            return Ok(false);
        }
        if let (Some(name), Some(m)) = (decrement, t.metrics.get_mut(GLOBAL_METRICS_KEY)) {
            m.adjust(name, -1);
        }
        Ok(true)
    }

    fn scan_formulas(&self) -> Result<Vec<Formula>> {
        Ok(self.lock()?.formulas.values().cloned().collect())
    }

    fn formulas_with_any_tag(&self, tags: &[String]) -> Result<Vec<Formula>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let filter = FormulaFilter::any_tag(tags.iter().cloned());
        Ok(self
            .lock()?
            .formulas
            .values()
            .filter(|f| filter.matches(f))
            .cloned()
            .collect())
    }

    fn append_block(&self, seal: BlockSealer<'_>) -> Result<Block> {
        let mut t = self.lock()?;
        let block = seal(t.blocks.values().next_back());
        if t.blocks.contains_key(&block.block_number) {
            return Err(LedgerError::Storage(format!(
                "block {} already exists",
                block.block_number
            )));
        }
        t.blocks.insert(block.block_number, block.clone());
        Ok(block)
    }

    fn get_block(&self, block_number: u64) -> Result<Option<Block>> {
        Ok(self.lock()?.blocks.get(&block_number).cloned())
    }

    fn latest_block(&self) -> Result<Option<Block>> {
        Ok(self.lock()?.blocks.values().next_back().cloned())
    }

    fn recent_blocks(&self, limit: usize) -> Result<Vec<Block>> {
        Ok(self
            .lock()?
            .blocks
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    fn scan_blocks(&self) -> Result<Vec<Block>> {
        Ok(self.lock()?.blocks.values().cloned().collect())
    }

    fn get_metrics_record(&self, key: &str) -> Result<Option<MetricsRecord>> {
        Ok(self.lock()?.metrics.get(key).cloned())
    }

    fn put_metrics_record(&self, record: &MetricsRecord) -> Result<()> {
        self.lock()?
            .metrics
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn adjust_metric(&self, key: &str, name: MetricName, delta: i64) -> Result<()> {
        if let Some(m) = self.lock()?.metrics.get_mut(key) {
            m.adjust(name, delta);
        }
        Ok(())
    }

    fn set_metric(&self, key: &str, name: MetricName, value: f64) -> Result<()> {
        if let Some(m) = self.lock()?.metrics.get_mut(key) {
            m.set(name, value);
        }
        Ok(())
    }

    fn scan_metrics(&self) -> Result<Vec<MetricsRecord>> {
        Ok(self.lock()?.metrics.values().cloned().collect())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.settings.get(key).cloned())
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn insert_setting_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut t = self.lock()?;
        if t.settings.contains_key(key) {
            return Ok(false);
        }
        t.settings.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    fn insert_metrics_if_absent(&self, record: &MetricsRecord) -> Result<bool> {
        let mut t = self.lock()?;
        if t.metrics.contains_key(&record.key) {
            return Ok(false);
        }
        t.metrics.insert(record.key.clone(), record.clone());
        Ok(true)
    }

    fn clear_ledger(&self) -> Result<()> {
        let mut t = self.lock()?;
        t.formulas.clear();
        t.blocks.clear();
        t.metrics.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[test]
    fn test_memory_backend_conformance() {
        conformance::run_all(|| Box::new(MemoryBackend::new()));
    }
}
