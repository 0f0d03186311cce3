use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::ledger::LedgerStore;
use crate::metrics::{MetricName, MetricsRecord};
use crate::scheduler::{ExecutionScheduler, PoolMetrics, SchedulerError};
use crate::store::LedgerError;
use crate::worker::Evaluator;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Ledger counters and pool occupancy at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub ledger: MetricsRecord,
    pub pool: PoolMetrics,
}

/// A ledger plus the worker pool that evaluates its formulas.
pub struct KolibriNode {
    ledger: LedgerStore,
    scheduler: ExecutionScheduler,
}

impl KolibriNode {
    pub fn new(ledger: LedgerStore, scheduler: ExecutionScheduler) -> Self {
        Self { ledger, scheduler }
    }

    /// Open the configured ledger and build an (uninitialized) scheduler.
    pub fn from_config(config: &Config, evaluator: Arc<dyn Evaluator>) -> Result<Self, NodeError> {
        config.validate()?;
        let ledger = LedgerStore::from_config(&config.storage)?;
        let scheduler = ExecutionScheduler::new(config.scheduler.clone(), evaluator);
        Ok(Self::new(ledger, scheduler))
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn scheduler(&self) -> &ExecutionScheduler {
        &self.scheduler
    }

    pub async fn start(&self) -> Result<(), NodeError> {
        self.scheduler.init().await?;
        info!(workers = self.scheduler.size(), "kolibri node started");
        Ok(())
    }

    /// Evaluate a stored formula on the pool.
    ///
    /// Unknown ids fail before a worker is claimed. Only completed runs are
    /// counted in `executionCount`; a failure to bump the counter is logged
    /// and the result is still returned.
    pub async fn execute_formula(
        &self,
        formula_id: u64,
        inputs: Vec<Value>,
    ) -> Result<Value, NodeError> {
        self.ledger.get_formula(formula_id)?;
        let result = self.scheduler.execute_formula(formula_id, inputs).await?;
        match self.ledger.increment_metric(MetricName::ExecutionCount) {
            Ok(()) => debug!(formula_id, "execution recorded"),
            Err(e) => warn!(formula_id, error = %e, "failed to record execution"),
        }
        Ok(result)
    }

    pub fn status(&self) -> Result<NodeStatus, NodeError> {
        Ok(NodeStatus {
            ledger: self.ledger.get_metrics()?,
            pool: self.scheduler.get_metrics(),
        })
    }

    pub fn shutdown(&self) {
        self.scheduler.destroy();
        info!("kolibri node stopped");
    }
}
