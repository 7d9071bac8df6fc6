//! Local worker pool
//!
//! Runs workers as OS threads on the local machine, fed from a shared
//! crossbeam channel. The pool grows toward `maximum_workers` while a
//! backlog exists and decays back toward `minimum_workers` once workers
//! sit idle past the configured timeout. A panicking executor surfaces as
//! a `WorkerFailure` on the unit's future; the worker thread survives.

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::backend::{execute_unit, PoolStats, UnitFuture, UnitOutcome, WorkUnit, WorkerPoolBackend};
use crate::config::{ComputeResourceSpec, WorkerPoolConfig};
use crate::error::{EstimatorError, Result};
use crate::executor::CalculationExecutor;

type Task = (WorkUnit, Sender<UnitOutcome>);

/// Poll interval for idle workers; bounds how quickly scale-down and
/// shutdown are observed
const WORKER_TICK: Duration = Duration::from_millis(100);

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

struct Shared {
    task_rx: Receiver<Task>,
    executor: Arc<dyn CalculationExecutor>,
    current: AtomicUsize,
    busy: AtomicUsize,
    drain: AtomicUsize,
    minimum: usize,
    idle_timeout: Duration,
    shutdown: AtomicBool,
    stats: PoolStats,
}

/// Worker pool backed by local threads
pub struct LocalWorkerPool {
    config: WorkerPoolConfig,
    resources: ComputeResourceSpec,
    task_tx: Mutex<Option<Sender<Task>>>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    state: AtomicU8,
}

impl LocalWorkerPool {
    /// Create a pool; no workers are provisioned until `start`
    pub fn new(
        config: WorkerPoolConfig,
        resources: ComputeResourceSpec,
        executor: Arc<dyn CalculationExecutor>,
    ) -> Self {
        let (task_tx, task_rx) = unbounded();

        let shared = Arc::new(Shared {
            task_rx,
            executor,
            current: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            drain: AtomicUsize::new(0),
            minimum: config.minimum_workers,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            shutdown: AtomicBool::new(false),
            stats: PoolStats::default(),
        });

        Self {
            config,
            resources,
            task_tx: Mutex::new(Some(task_tx)),
            shared,
            workers: Mutex::new(Vec::new()),
            state: AtomicU8::new(STATE_IDLE),
        }
    }

    /// Pool statistics
    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    /// Reserve a worker slot below the maximum and spawn a thread into it
    fn try_spawn_worker(&self) -> bool {
        loop {
            let current = self.shared.current.load(Ordering::SeqCst);
            if current >= self.config.maximum_workers {
                return false;
            }
            if self
                .shared
                .current
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        let index = self
            .shared
            .stats
            .workers_spawned
            .fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);

        match thread::Builder::new()
            .name(format!("propserve-worker-{}", index))
            .spawn(move || worker_loop(shared))
        {
            Ok(handle) => {
                self.workers.lock().unwrap().push(handle);
                true
            }
            Err(e) => {
                self.shared.current.fetch_sub(1, Ordering::SeqCst);
                tracing::error!("failed to spawn worker thread: {}", e);
                false
            }
        }
    }

    /// Grow toward the maximum while queued units outnumber idle workers
    fn maybe_grow(&self, sender: &Sender<Task>) {
        let backlog = sender.len();
        if backlog == 0 {
            return;
        }

        let current = self.shared.current.load(Ordering::SeqCst);
        let busy = self.shared.busy.load(Ordering::SeqCst);
        let idle = current.saturating_sub(busy);

        if backlog > idle {
            self.try_spawn_worker();
        }
    }
}

impl WorkerPoolBackend for LocalWorkerPool {
    fn start(&self) -> Result<()> {
        self.config
            .validate()
            .map_err(|e| EstimatorError::provisioning("local", e.to_string()))?;
        self.resources
            .validate()
            .map_err(|e| EstimatorError::provisioning("local", e.to_string()))?;

        match self.state.compare_exchange(
            STATE_IDLE,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_RUNNING) => return Ok(()),
            Err(_) => {
                return Err(EstimatorError::provisioning(
                    "local",
                    "pool has already been stopped",
                ))
            }
        }

        tracing::info!(
            minimum = self.config.minimum_workers,
            maximum = self.config.maximum_workers,
            threads_per_worker = self.resources.threads,
            memory_per_worker = %humansize::format_size(self.resources.memory_limit, humansize::BINARY),
            "starting local worker pool"
        );

        for _ in 0..self.config.minimum_workers {
            if !self.try_spawn_worker() {
                break;
            }
        }

        Ok(())
    }

    fn scale(&self, target: usize) -> Result<usize> {
        if !self.is_running() {
            return Err(EstimatorError::worker("worker pool is not running"));
        }

        let clamped = self.config.clamp(target);
        let current = self.shared.current.load(Ordering::SeqCst);

        if clamped > current {
            for _ in 0..(clamped - current) {
                if !self.try_spawn_worker() {
                    break;
                }
            }
        } else if clamped < current {
            self.shared
                .drain
                .fetch_add(current - clamped, Ordering::SeqCst);
        }

        Ok(clamped)
    }

    fn submit(&self, unit: WorkUnit) -> Result<UnitFuture> {
        if !self.is_running() {
            return Err(EstimatorError::worker("worker pool is not running"));
        }

        let sender = self
            .task_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EstimatorError::worker("worker pool is shutting down"))?;

        let (reply, future) = UnitFuture::channel(unit.id);
        self.shared
            .stats
            .units_submitted
            .fetch_add(1, Ordering::Relaxed);

        tracing::debug!(unit = unit.id, layer = %unit.layer, "queueing unit");
        sender
            .send((unit, reply))
            .map_err(|_| EstimatorError::worker("worker pool stopped"))?;

        self.maybe_grow(&sender);

        Ok(future)
    }

    fn stop(&self) -> Result<()> {
        let previous = self.state.swap(STATE_STOPPED, Ordering::SeqCst);
        if previous != STATE_RUNNING {
            return Ok(());
        }

        tracing::info!("stopping local worker pool");
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.task_tx.lock().unwrap().take();

        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked during teardown");
            }
        }

        // fail whatever never reached a worker so no future hangs
        while let Ok((unit, reply)) = self.shared.task_rx.try_recv() {
            tracing::debug!(unit = unit.id, "failing undispatched unit");
            let _ = reply.send(UnitOutcome::WorkerFailure {
                reason: "worker pool stopped before the unit was assigned".to_string(),
            });
        }

        Ok(())
    }

    fn worker_count(&self) -> usize {
        self.shared.current.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }
}

impl Drop for LocalWorkerPool {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("error while stopping local worker pool: {}", e);
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut idle_since = Instant::now();

    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        // honor a pending scale-down before taking new work
        if take_drain_token(&shared) {
            shared.current.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        match shared.task_rx.recv_timeout(WORKER_TICK) {
            Ok((unit, reply)) => {
                shared.busy.fetch_add(1, Ordering::SeqCst);
                let outcome = execute_unit(&shared.executor, &unit);
                shared.busy.fetch_sub(1, Ordering::SeqCst);

                match &outcome {
                    UnitOutcome::Value(_) => {
                        shared.stats.units_completed.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        shared.stats.units_failed.fetch_add(1, Ordering::Relaxed);
                    }
                }

                if reply.send(outcome).is_err() {
                    tracing::debug!(unit = unit.id, "outcome receiver dropped");
                }
                idle_since = Instant::now();
            }
            Err(RecvTimeoutError::Timeout) => {
                if idle_since.elapsed() >= shared.idle_timeout && release_above_minimum(&shared) {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    shared.current.fetch_sub(1, Ordering::SeqCst);
}

fn take_drain_token(shared: &Shared) -> bool {
    loop {
        let drain = shared.drain.load(Ordering::SeqCst);
        if drain == 0 {
            return false;
        }
        if shared
            .drain
            .compare_exchange(drain, drain - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
}

fn release_above_minimum(shared: &Shared) -> bool {
    loop {
        let current = shared.current.load(Ordering::SeqCst);
        if current <= shared.minimum {
            return false;
        }
        if shared
            .current
            .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
}
