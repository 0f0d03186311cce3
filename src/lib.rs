pub mod block;
pub mod config;
pub mod formula;
/// Formula/block ledger over a pluggable backend.
pub mod ledger;
pub mod metrics;
pub mod node;
/// `.kpack` export and import.
pub mod package;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use ledger::LedgerStore;
pub use node::{KolibriNode, NodeError};
pub use scheduler::{ExecutionScheduler, PoolMetrics, SchedulerError};
pub use store::LedgerError;
pub use worker::Evaluator;
