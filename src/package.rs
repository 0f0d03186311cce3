//! `.kpack` packages: a self-describing JSON snapshot of the whole ledger.
//!
//! ```json
//! {"version":1,"timestamp":1700000000000,"formulas":[...],"blocks":[...],"metrics":[...]}
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::block::Block;
use crate::formula::Formula;
use crate::ledger::{now_millis, LedgerStore};
use crate::metrics::MetricsRecord;
use crate::store::{LedgerError, Result};

/// Schema version written by this crate; the only one accepted on import.
pub const PACKAGE_VERSION: u32 = 1;

pub const PACKAGE_EXTENSION: &str = "kpack";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub version: u32,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub formulas: Vec<Formula>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub metrics: Vec<MetricsRecord>,
}

/// Rows written by one import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub formulas: usize,
    pub blocks: usize,
    pub metrics: usize,
}

impl Package {
    pub fn from_json(raw: &str) -> Result<Self> {
        let package: Package =
            serde_json::from_str(raw).map_err(|e| LedgerError::ImportParse(e.to_string()))?;
        package.check_version()?;
        Ok(package)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| LedgerError::Storage(e.to_string()))
    }

    fn check_version(&self) -> Result<()> {
        if self.version != PACKAGE_VERSION {
            return Err(LedgerError::ImportParse(format!(
                "unsupported package version {} (expected {})",
                self.version, PACKAGE_VERSION
            )));
        }
        Ok(())
    }
}

pub fn read_package(path: impl AsRef<Path>) -> Result<Package> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .map_err(|e| LedgerError::Storage(format!("failed to read {}: {e}", path.display())))?;
    Package::from_json(&raw)
}

pub fn write_package(path: impl AsRef<Path>, package: &Package) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, package.to_json_pretty()?)
        .map_err(|e| LedgerError::Storage(format!("failed to write {}: {e}", path.display())))
}

impl LedgerStore {
    /// Snapshot formulas, blocks and metrics. The three tables are read one
    /// after another, not as a single consistent view.
    pub fn export_data(&self) -> Result<Package> {
        let backend = self.backend();
        let package = Package {
            version: PACKAGE_VERSION,
            timestamp: now_millis(),
            formulas: backend.scan_formulas()?,
            blocks: backend.scan_blocks()?,
            metrics: backend.scan_metrics()?,
        };
        info!(
            formulas = package.formulas.len(),
            blocks = package.blocks.len(),
            metrics = package.metrics.len(),
            "ledger exported"
        );
        Ok(package)
    }

    /// Merge a package into the ledger.
    ///
    /// Formulas get fresh ids (version 0 is stored as 1) and blocks are re-chained after the current head;
    /// repeated imports duplicate them. Metrics records are upserted by key.
    /// The first failure stops the import without undoing earlier writes.
    pub fn import_data(&self, package: &Package) -> Result<ImportSummary> {
        package.check_version()?;
        let backend = self.backend();
        let mut summary = ImportSummary::default();

        let formulas: Vec<Formula> = package
            .formulas
            .iter()
            .cloned()
            .map(|mut formula| {
                if formula.version == 0 {
                    formula.version = 1;
                }
                formula
            })
            .collect();
        summary.formulas = backend.bulk_insert_formulas(&formulas)?.len();

        for original in &package.blocks {
            let block = backend.append_block(&mut |head| {
                let mut block = Block::seal(original.draft(), original.timestamp, head);
                // signatures only survive when re-chaining reproduced the same hash
                if block.hash == original.hash {
                    block.author = original.author.clone();
                    block.signature = original.signature.clone();
                }
                block
            })?;
            if original.signature.is_some() && block.signature.is_none() {
                warn!(
                    original_number = original.block_number,
                    block_number = block.block_number,
                    "block re-chained on import, signature dropped"
                );
            }
            summary.blocks += 1;
        }

        for record in &package.metrics {
            backend.put_metrics_record(record)?;
            summary.metrics += 1;
        }

        info!(
            formulas = summary.formulas,
            blocks = summary.blocks,
            metrics = summary.metrics,
            "package imported"
        );
        Ok(summary)
    }

    pub fn import_json(&self, raw: &str) -> Result<ImportSummary> {
        self.import_data(&Package::from_json(raw)?)
    }
}
