use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::store::{LedgerBackend, Result};

/// Key of the single process-wide metrics record.
pub const GLOBAL_METRICS_KEY: &str = "global";

/// Aggregate ledger counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsRecord {
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default)]
    pub formula_count: u64,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub mutation_count: u64,
    #[serde(default)]
    pub avg_fitness: f64,
}

fn default_key() -> String {
    GLOBAL_METRICS_KEY.to_string()
}

impl Default for MetricsRecord {
    fn default() -> Self {
        Self::zeroed(GLOBAL_METRICS_KEY)
    }
}

/// Field of a [`MetricsRecord`] addressable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    FormulaCount,
    ExecutionCount,
    MutationCount,
    AvgFitness,
}

impl MetricName {
    pub const ALL: [MetricName; 4] = [
        MetricName::FormulaCount,
        MetricName::ExecutionCount,
        MetricName::MutationCount,
        MetricName::AvgFitness,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::FormulaCount => "formulaCount",
            MetricName::ExecutionCount => "executionCount",
            MetricName::MutationCount => "mutationCount",
            MetricName::AvgFitness => "avgFitness",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        MetricName::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown metric: {}", s))
    }
}

impl MetricsRecord {
    pub fn zeroed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            formula_count: 0,
            execution_count: 0,
            mutation_count: 0,
            avg_fitness: 0.0,
        }
    }

    pub fn get(&self, name: MetricName) -> f64 {
        match name {
            MetricName::FormulaCount => self.formula_count as f64,
            MetricName::ExecutionCount => self.execution_count as f64,
            MetricName::MutationCount => self.mutation_count as f64,
            MetricName::AvgFitness => self.avg_fitness,
        }
    }

    /// Add `delta` to a field. A negative step on a field already at or below
    /// zero is a no-op; counters never go below zero.
    pub fn adjust(&mut self, name: MetricName, delta: i64) {
        if delta < 0 && self.get(name) <= 0.0 {
            return;
        }
        match name {
            MetricName::FormulaCount => step(&mut self.formula_count, delta),
            MetricName::ExecutionCount => step(&mut self.execution_count, delta),
            MetricName::MutationCount => step(&mut self.mutation_count, delta),
            MetricName::AvgFitness => self.avg_fitness += delta as f64,
        }
    }

    /// Overwrite a field. Counters take the value truncated toward zero,
    /// clamped at 0.
    pub fn set(&mut self, name: MetricName, value: f64) {
        let as_count = if value.is_finite() && value > 0.0 {
            value as u64
        } else {
            0
        };
        match name {
            MetricName::FormulaCount => self.formula_count = as_count,
            MetricName::ExecutionCount => self.execution_count = as_count,
            MetricName::MutationCount => self.mutation_count = as_count,
            MetricName::AvgFitness => self.avg_fitness = value,
        }
    }
}

fn step(counter: &mut u64, delta: i64) {
    *counter = if delta >= 0 {
        counter.saturating_add(delta as u64)
    } else {
        counter.saturating_sub(delta.unsigned_abs())
    };
}

/// Accessor layer over the global metrics record held by a backend.
#[derive(Clone)]
pub struct MetricsAggregator {
    backend: Arc<dyn LedgerBackend>,
}

impl MetricsAggregator {
    pub fn new(backend: Arc<dyn LedgerBackend>) -> Self {
        Self { backend }
    }

    /// Current record, or a zeroed one if it was never created.
    pub fn get_metrics(&self) -> Result<MetricsRecord> {
        Ok(self
            .backend
            .get_metrics_record(GLOBAL_METRICS_KEY)?
            .unwrap_or_default())
    }

    pub fn increment_metric(&self, name: MetricName) -> Result<()> {
        debug!(metric = %name, "incrementing metric");
        self.backend.adjust_metric(GLOBAL_METRICS_KEY, name, 1)
    }

    pub fn decrement_metric(&self, name: MetricName) -> Result<()> {
        debug!(metric = %name, "decrementing metric");
        self.backend.adjust_metric(GLOBAL_METRICS_KEY, name, -1)
    }

    pub fn update_metric(&self, name: MetricName, value: f64) -> Result<()> {
        debug!(metric = %name, value, "overwriting metric");
        self.backend.set_metric(GLOBAL_METRICS_KEY, name, value)
    }

    /// Set `avgFitness` to the mean of every scored formula (0 when none are
    /// scored) and return it. Never called implicitly.
    pub fn recompute_avg_fitness(&self) -> Result<f64> {
        let scores: Vec<f64> = self
            .backend
            .scan_formulas()?
            .into_iter()
            .filter_map(|f| f.fitness)
            .collect();
        let avg = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        self.update_metric(MetricName::AvgFitness, avg)?;
        Ok(avg)
    }
}
