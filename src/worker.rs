//! Execution workers: isolated tokio tasks that speak a four-message protocol
//! with the scheduler and delegate the actual evaluation to an [`Evaluator`].
//!
//! A worker owns nothing but its channel ends and an `Arc` of the evaluator.
//! It handles one command at a time, in arrival order.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};
use uuid::Uuid;

/// Scheduler → worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Request readiness
    Init,
    Execute {
        request_id: Uuid,
        /// Slot generation the request was dispatched under
        epoch: u64,
        formula_id: u64,
        inputs: Vec<Value>,
    },
}

/// Worker → scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    Ready {
        worker_id: usize,
    },
    Result {
        request_id: Uuid,
        epoch: u64,
        result: Value,
    },
    Error {
        request_id: Uuid,
        epoch: u64,
        error: String,
    },
}

impl WorkerReply {
    /// Epoch of the request this reply answers; `None` for `Ready`.
    pub fn epoch(&self) -> Option<u64> {
        match self {
            WorkerReply::Ready { .. } => None,
            WorkerReply::Result { epoch, .. } | WorkerReply::Error { epoch, .. } => Some(*epoch),
        }
    }
}

/// The opaque evaluation routine run inside every worker.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Runs once per worker during the init handshake; an error fails `init`.
    async fn warm_up(&self, _worker_id: usize) -> Result<(), String> {
        Ok(())
    }

    /// Evaluate a formula. The error string is handed to the caller verbatim.
    async fn evaluate(&self, formula_id: u64, inputs: &[Value]) -> Result<Value, String>;
}

/// Channel ends and task of one spawned worker.
pub struct WorkerHandle {
    pub id: usize,
    pub commands: mpsc::UnboundedSender<WorkerCommand>,
    pub replies: mpsc::UnboundedReceiver<WorkerReply>,
    pub task: JoinHandle<()>,
}

/// Spawn a worker task on the current tokio runtime.
pub fn spawn_worker(id: usize, evaluator: Arc<dyn Evaluator>) -> WorkerHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_worker(id, evaluator, cmd_rx, reply_tx));
    WorkerHandle {
        id,
        commands: cmd_tx,
        replies: reply_rx,
        task,
    }
}

async fn run_worker(
    id: usize,
    evaluator: Arc<dyn Evaluator>,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    replies: mpsc::UnboundedSender<WorkerReply>,
) {
    // Evaluations run in a child set so a panicking evaluator is reported as
    // an error, and aborting this task aborts the evaluation with it.
    let mut running: JoinSet<Result<Value, String>> = JoinSet::new();

    while let Some(command) = commands.recv().await {
        let reply = match command {
            WorkerCommand::Init => match evaluator.warm_up(id).await {
                Ok(()) => WorkerReply::Ready { worker_id: id },
                Err(error) => {
                    warn!(worker = id, error = %error, "worker warm-up failed");
                    WorkerReply::Error {
                        request_id: Uuid::nil(),
                        epoch: 0,
                        error,
                    }
                }
            },
            WorkerCommand::Execute {
                request_id,
                epoch,
                formula_id,
                inputs,
            } => {
                debug!(worker = id, formula_id, epoch, "evaluating");
                let evaluator = evaluator.clone();
                running.spawn(async move { evaluator.evaluate(formula_id, &inputs).await });
                let outcome = match running.join_next().await {
                    Some(Ok(outcome)) => outcome,
                    Some(Err(e)) => Err(format!("evaluation aborted: {e}")),
                    None => Err("evaluation vanished".to_string()),
                };
                match outcome {
                    Ok(result) => WorkerReply::Result {
                        request_id,
                        epoch,
                        result,
                    },
                    Err(error) => WorkerReply::Error {
                        request_id,
                        epoch,
                        error,
                    },
                }
            }
        };
        if replies.send(reply).is_err() {
            // scheduler side is gone
            break;
        }
    }
    debug!(worker = id, "worker stopped");
}
