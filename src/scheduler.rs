//! Fixed-size worker pool that runs formula evaluations off the caller's task.
//!
//! Selection never queues: a request claims the first idle slot in id order
//! or fails with [`SchedulerError::NoWorkerAvailable`]. Every dispatched
//! request carries the slot's current epoch, and replies whose epoch does not
//! match the waiting request are dropped, so a late answer to a timed-out
//! request can never resolve a newer one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::worker::{spawn_worker, Evaluator, WorkerCommand, WorkerReply};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is not initialized")]
    NotInitialized,
    #[error("no worker available")]
    NoWorkerAvailable,
    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(Duration),
    #[error("worker reported error: {0}")]
    WorkerReportedError(String),
    #[error("worker terminated before replying")]
    WorkerTerminated,
    #[error("worker pool failed to start: {0}")]
    InitFailed(String),
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub available_workers: usize,
}

struct Slot {
    id: usize,
    busy: AtomicBool,
    epoch: AtomicU64,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    replies: tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkerReply>>,
    task: JoinHandle<()>,
}

impl Slot {
    fn spawn(id: usize, evaluator: Arc<dyn Evaluator>) -> Self {
        let handle = spawn_worker(id, evaluator);
        Self {
            id,
            busy: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            commands: handle.commands,
            replies: tokio::sync::Mutex::new(handle.replies),
            task: handle.task,
        }
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn await_ready(&self) -> Result<(), SchedulerError> {
        let mut replies = self.replies.lock().await;
        loop {
            match replies.recv().await {
                Some(WorkerReply::Ready { .. }) => return Ok(()),
                Some(WorkerReply::Error { error, .. }) => {
                    return Err(SchedulerError::InitFailed(format!(
                        "worker {}: {error}",
                        self.id
                    )))
                }
                Some(other) => debug!(worker = self.id, ?other, "ignoring reply during handshake"),
                None => {
                    return Err(SchedulerError::InitFailed(format!(
                        "worker {} exited during handshake",
                        self.id
                    )))
                }
            }
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Exclusive hold on one slot; releases it when dropped, whatever the outcome.
struct SlotClaim {
    slot: Arc<Slot>,
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

impl SlotClaim {
    async fn dispatch(
        self,
        formula_id: u64,
        inputs: Vec<Value>,
        deadline: Duration,
    ) -> Result<Value, SchedulerError> {
        let slot = &self.slot;
        let epoch = slot.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let request_id = Uuid::new_v4();
        let mut replies = slot.replies.lock().await;

        slot.commands
            .send(WorkerCommand::Execute {
                request_id,
                epoch,
                formula_id,
                inputs,
            })
            .map_err(|_| SchedulerError::WorkerTerminated)?;
        debug!(worker = slot.id, formula_id, epoch, %request_id, "request dispatched");

        let wait = async {
            loop {
                match replies.recv().await {
                    None => return Err(SchedulerError::WorkerTerminated),
                    Some(reply) if reply.epoch() == Some(epoch) => return Ok(reply),
                    Some(stale) => {
                        debug!(
                            worker = slot.id,
                            expected = epoch,
                            got = ?stale.epoch(),
                            "discarding stale reply"
                        );
                    }
                }
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(Ok(WorkerReply::Result { result, .. })) => Ok(result),
            Ok(Ok(WorkerReply::Error { error, .. })) => {
                Err(SchedulerError::WorkerReportedError(error))
            }
            Ok(Ok(WorkerReply::Ready { .. })) => Err(SchedulerError::WorkerTerminated),
            Ok(Err(e)) => {
                warn!(worker = slot.id, formula_id, "worker terminated mid-request");
                Err(e)
            }
            Err(_) => {
                warn!(worker = slot.id, formula_id, ?deadline, "execution timed out");
                Err(SchedulerError::ExecutionTimeout(deadline))
            }
        }
    }
}

struct Pool {
    slots: Vec<Arc<Slot>>,
}

impl Pool {
    /// First idle slot in id order. Linear in the pool size.
    fn claim(&self) -> Option<SlotClaim> {
        self.slots
            .iter()
            .find(|slot| slot.try_claim())
            .map(|slot| SlotClaim { slot: slot.clone() })
    }

    fn busy_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_busy()).count()
    }

    fn terminate(&self) {
        for slot in &self.slots {
            slot.task.abort();
        }
    }
}

pub struct ExecutionScheduler {
    config: SchedulerConfig,
    evaluator: Arc<dyn Evaluator>,
    pool: Mutex<Option<Arc<Pool>>>,
    init_lock: tokio::sync::Mutex<()>,
}

impl ExecutionScheduler {
    pub fn new(config: SchedulerConfig, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            config,
            evaluator,
            pool: Mutex::new(None),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Configured number of workers.
    pub fn size(&self) -> usize {
        self.config.workers
    }

    fn current_pool(&self) -> Option<Arc<Pool>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.current_pool().is_some()
    }

    /// Start every worker and wait until all of them report ready.
    ///
    /// Idempotent while initialized. On failure every started worker is torn
    /// down and the scheduler stays uninitialized.
    pub async fn init(&self) -> Result<(), SchedulerError> {
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }
        self.config
            .validate()
            .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;

        let size = self.config.workers;
        let pool = Pool {
            slots: (0..size)
                .map(|id| Arc::new(Slot::spawn(id, self.evaluator.clone())))
                .collect(),
        };

        for slot in &pool.slots {
            slot.commands
                .send(WorkerCommand::Init)
                .map_err(|_| SchedulerError::InitFailed(format!("worker {} exited", slot.id)))?;
        }

        let handshake = async {
            for slot in &pool.slots {
                slot.await_ready().await?;
            }
            Ok::<(), SchedulerError>(())
        };

        let outcome = match tokio::time::timeout(self.config.init_timeout(), handshake).await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::InitFailed(format!(
                "workers not ready within {:?}",
                self.config.init_timeout()
            ))),
        };
        if let Err(e) = outcome {
            warn!(error = %e, "worker pool init failed");
            pool.terminate();
            return Err(e);
        }

        *self.pool.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(pool));
        info!(workers = size, timeout_ms = self.config.timeout_ms, "worker pool ready");
        Ok(())
    }

    /// Run one evaluation on the first idle worker.
    pub async fn execute_formula(
        &self,
        formula_id: u64,
        inputs: Vec<Value>,
    ) -> Result<Value, SchedulerError> {
        let pool = self.current_pool().ok_or(SchedulerError::NotInitialized)?;
        let claim = pool.claim().ok_or_else(|| {
            warn!(formula_id, "all workers busy");
            SchedulerError::NoWorkerAvailable
        })?;
        claim.dispatch(formula_id, inputs, self.config.timeout()).await
    }

    pub fn get_metrics(&self) -> PoolMetrics {
        let (live, busy) = self
            .current_pool()
            .map_or((0, 0), |pool| (pool.slots.len(), pool.busy_count()));
        PoolMetrics {
            total_workers: self.size(),
            busy_workers: busy,
            available_workers: live.saturating_sub(busy),
        }
    }

    /// Terminate every worker. Outstanding requests fail with
    /// `WorkerTerminated`; later calls fail with `NotInitialized` until the
    /// next `init`.
    pub fn destroy(&self) {
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pool) = pool {
            pool.terminate();
            info!(workers = pool.slots.len(), "worker pool destroyed");
        }
    }
}

impl Drop for ExecutionScheduler {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;
    use tokio::time::Instant;

    /// Sleeps for `inputs[0]` milliseconds, then echoes the formula id.
    struct Sleeper;

    #[async_trait]
    impl Evaluator for Sleeper {
        async fn evaluate(&self, formula_id: u64, inputs: &[Value]) -> Result<Value, String> {
            let ms = inputs.first().and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(formula_id))
        }
    }

    /// Blocks every evaluation until the test hands out permits.
    struct Gated(Arc<Semaphore>);

    #[async_trait]
    impl Evaluator for Gated {
        async fn evaluate(&self, formula_id: u64, _inputs: &[Value]) -> Result<Value, String> {
            let permit = self.0.acquire().await.map_err(|e| e.to_string())?;
            permit.forget();
            Ok(json!(formula_id))
        }
    }

    #[derive(Default)]
    struct Concurrency {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    /// Records how many evaluations run at once.
    struct Tracked(Arc<Concurrency>);

    #[async_trait]
    impl Evaluator for Tracked {
        async fn evaluate(&self, formula_id: u64, _inputs: &[Value]) -> Result<Value, String> {
            let now = self.0.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.running.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(formula_id))
        }
    }

    struct Failing;

    #[async_trait]
    impl Evaluator for Failing {
        async fn evaluate(&self, formula_id: u64, _inputs: &[Value]) -> Result<Value, String> {
            Err(format!("formula {formula_id} diverged"))
        }
    }

    /// Worker 2 never finishes warming up.
    struct StuckWarmUp;

    #[async_trait]
    impl Evaluator for StuckWarmUp {
        async fn warm_up(&self, worker_id: usize) -> Result<(), String> {
            if worker_id == 2 {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn evaluate(&self, _formula_id: u64, _inputs: &[Value]) -> Result<Value, String> {
            Ok(Value::Null)
        }
    }

    struct RefusingWarmUp;

    #[async_trait]
    impl Evaluator for RefusingWarmUp {
        async fn warm_up(&self, worker_id: usize) -> Result<(), String> {
            if worker_id == 1 {
                return Err("no accelerator".to_string());
            }
            Ok(())
        }

        async fn evaluate(&self, _formula_id: u64, _inputs: &[Value]) -> Result<Value, String> {
            Ok(Value::Null)
        }
    }

    fn config(workers: usize, timeout_ms: u64) -> SchedulerConfig {
        SchedulerConfig {
            workers,
            timeout_ms,
            init_timeout_ms: 1000,
        }
    }

    async fn started(
        workers: usize,
        timeout_ms: u64,
        evaluator: impl Evaluator + 'static,
    ) -> Arc<ExecutionScheduler> {
        let scheduler = Arc::new(ExecutionScheduler::new(
            config(workers, timeout_ms),
            Arc::new(evaluator),
        ));
        scheduler.init().await.unwrap();
        scheduler
    }

    async fn wait_until_busy(scheduler: &ExecutionScheduler, busy: usize) {
        while scheduler.get_metrics().busy_workers < busy {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_execute_before_init() {
        let scheduler = ExecutionScheduler::new(config(2, 100), Arc::new(Sleeper));
        assert_eq!(
            scheduler.execute_formula(1, vec![]).await,
            Err(SchedulerError::NotInitialized)
        );
        assert_eq!(
            scheduler.get_metrics(),
            PoolMetrics {
                total_workers: 2,
                busy_workers: 0,
                available_workers: 0
            }
        );
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let scheduler = started(3, 100, Sleeper).await;
        scheduler.init().await.unwrap();
        assert_eq!(scheduler.get_metrics().available_workers, 3);
        assert_eq!(scheduler.execute_formula(5, vec![]).await, Ok(json!(5)));
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let scheduler = ExecutionScheduler::new(config(0, 100), Arc::new(Sleeper));
        assert!(matches!(
            scheduler.init().await,
            Err(SchedulerError::InvalidConfig(_))
        ));
        assert!(!scheduler.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_timeout_tears_down() {
        let scheduler = ExecutionScheduler::new(config(4, 100), Arc::new(StuckWarmUp));
        assert!(matches!(
            scheduler.init().await,
            Err(SchedulerError::InitFailed(_))
        ));
        assert!(!scheduler.is_initialized());
        assert_eq!(
            scheduler.execute_formula(1, vec![]).await,
            Err(SchedulerError::NotInitialized)
        );
    }

    #[tokio::test]
    async fn test_init_fails_when_a_worker_refuses() {
        let scheduler = ExecutionScheduler::new(config(3, 100), Arc::new(RefusingWarmUp));
        match scheduler.init().await {
            Err(SchedulerError::InitFailed(msg)) => assert!(msg.contains("no accelerator")),
            other => panic!("expected InitFailed, got {:?}", other),
        }
        assert!(!scheduler.is_initialized());
    }

    #[tokio::test]
    async fn test_busy_pool_rejects_without_waiting() {
        let gate = Arc::new(Semaphore::new(0));
        let scheduler = started(2, 5000, Gated(gate.clone())).await;

        let first = tokio::spawn({
            let s = scheduler.clone();
            async move { s.execute_formula(1, vec![]).await }
        });
        let second = tokio::spawn({
            let s = scheduler.clone();
            async move { s.execute_formula(2, vec![]).await }
        });
        wait_until_busy(&scheduler, 2).await;

        assert_eq!(
            scheduler.get_metrics(),
            PoolMetrics {
                total_workers: 2,
                busy_workers: 2,
                available_workers: 0
            }
        );
        assert_eq!(
            scheduler.execute_formula(3, vec![]).await,
            Err(SchedulerError::NoWorkerAvailable)
        );

        gate.add_permits(2);
        assert_eq!(first.await.unwrap(), Ok(json!(1)));
        assert_eq!(second.await.unwrap(), Ok(json!(2)));
        assert_eq!(scheduler.get_metrics().available_workers, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_slot() {
        let scheduler = started(1, 100, Sleeper).await;

        let started_at = Instant::now();
        let outcome = scheduler.execute_formula(1, vec![json!(60_000)]).await;
        assert_eq!(
            outcome,
            Err(SchedulerError::ExecutionTimeout(Duration::from_millis(100)))
        );
        let elapsed = started_at.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(150));
        assert_eq!(scheduler.get_metrics().busy_workers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_never_resolves_newer_request() {
        let scheduler = started(1, 100, Sleeper).await;

        // finishes at t=150, after its own deadline
        assert_eq!(
            scheduler.execute_formula(1, vec![json!(150)]).await,
            Err(SchedulerError::ExecutionTimeout(Duration::from_millis(100)))
        );
        // queued behind the first evaluation, done at t=160
        assert_eq!(
            scheduler.execute_formula(2, vec![json!(10)]).await,
            Ok(json!(2))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_claims_never_share_a_slot() {
        let tracker = Arc::new(Concurrency::default());
        let scheduler = started(4, 5000, Tracked(tracker.clone())).await;

        let handles: Vec<_> = (0..2000u64)
            .map(|id| {
                let s = scheduler.clone();
                tokio::spawn(async move { (id, s.execute_formula(id, vec![]).await) })
            })
            .collect();

        let mut completed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                (id, Ok(result)) => {
                    assert_eq!(result, json!(id));
                    completed += 1;
                }
                (_, Err(e)) => assert_eq!(e, SchedulerError::NoWorkerAvailable),
            }
        }

        assert!(completed >= 1);
        assert!(tracker.peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(tracker.running.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.get_metrics().available_workers, 4);
    }

    #[tokio::test]
    async fn test_worker_error_is_passed_through() {
        let scheduler = started(2, 100, Failing).await;
        assert_eq!(
            scheduler.execute_formula(9, vec![]).await,
            Err(SchedulerError::WorkerReportedError(
                "formula 9 diverged".to_string()
            ))
        );
        assert_eq!(scheduler.get_metrics().available_workers, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_pool_all_complete() {
        let scheduler = started(10, 5000, Sleeper).await;
        let handles: Vec<_> = (0..10u64)
            .map(|id| {
                let s = scheduler.clone();
                tokio::spawn(async move { s.execute_formula(id, vec![json!(100)]).await })
            })
            .collect();

        for (id, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), Ok(json!(id)));
        }
        assert_eq!(scheduler.get_metrics().available_workers, 10);
    }

    #[tokio::test]
    async fn test_destroy_fails_outstanding_and_later_requests() {
        let gate = Arc::new(Semaphore::new(0));
        let scheduler = started(1, 5000, Gated(gate)).await;

        let pending = tokio::spawn({
            let s = scheduler.clone();
            async move { s.execute_formula(1, vec![]).await }
        });
        wait_until_busy(&scheduler, 1).await;

        scheduler.destroy();
        assert_eq!(pending.await.unwrap(), Err(SchedulerError::WorkerTerminated));
        assert!(!scheduler.is_initialized());
        assert_eq!(
            scheduler.execute_formula(2, vec![]).await,
            Err(SchedulerError::NotInitialized)
        );
        assert_eq!(scheduler.get_metrics().busy_workers, 0);

        // a destroyed scheduler can be started again
        scheduler.init().await.unwrap();
        assert_eq!(scheduler.get_metrics().available_workers, 1);
    }
}
