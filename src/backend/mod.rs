//! Worker pool backends
//!
//! A `WorkerPoolBackend` provisions and scales a set of workers honoring a
//! `ComputeResourceSpec`, either on local hardware (`LocalWorkerPool`) or
//! by submitting jobs to an HPC queue (`QueueWorkerPool`). The server only
//! sees the `start/scale/submit/stop` contract and never branches on which
//! substrate is behind it.

mod local;
mod queue;

pub use local::LocalWorkerPool;
pub use queue::{run_worker, QueueWorkerPool, SchedulerKind};

use crossbeam::channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::error::{EstimatorError, Result};
use crate::executor::CalculationExecutor;
use crate::model::{EstimatedValue, ForceFieldSource, PropertyItem};
use crate::schema::CalculationSchema;

/// One calculation unit: an item attempted under one layer's schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Unique unit id
    pub id: u64,
    /// Owning request
    pub request_id: String,
    /// Index of the item within the request
    pub item_index: usize,
    /// Layer being attempted
    pub layer: String,
    /// 1-based attempt counter, retries included
    pub attempt: u32,
    /// Schema resolved for this (layer, property type)
    pub schema: CalculationSchema,
    /// The item under estimation
    pub item: PropertyItem,
    /// Force-field reference, passed through unexamined
    pub force_field: ForceFieldSource,
}

/// Outcome of one calculation unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitOutcome {
    /// The executor produced a value
    Value(EstimatedValue),
    /// The executor could not produce a value; terminal for this attempt
    CalculationFailed {
        /// Human-readable reason
        reason: String,
    },
    /// The worker died, panicked or disconnected; transient, retried by
    /// the server up to its retry bound
    WorkerFailure {
        /// Human-readable reason
        reason: String,
    },
}

/// Outcome report a remote worker frames back to the distributor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitReport {
    /// Unit the outcome belongs to
    pub unit_id: u64,
    /// Outcome of the unit
    pub outcome: UnitOutcome,
}

/// Handle resolving asynchronously to a unit's outcome
pub struct UnitFuture {
    unit_id: u64,
    receiver: Receiver<UnitOutcome>,
}

impl UnitFuture {
    /// Create a one-shot channel for a unit's outcome
    pub(crate) fn channel(unit_id: u64) -> (Sender<UnitOutcome>, UnitFuture) {
        let (sender, receiver) = bounded(1);
        (sender, UnitFuture { unit_id, receiver })
    }

    /// The unit this future belongs to
    pub fn unit_id(&self) -> u64 {
        self.unit_id
    }

    /// Block until the outcome arrives
    ///
    /// A pool that stops before resolving the unit surfaces as a worker
    /// failure, never a hang.
    pub fn wait(self) -> UnitOutcome {
        self.receiver.recv().unwrap_or(UnitOutcome::WorkerFailure {
            reason: "worker pool stopped before the unit completed".to_string(),
        })
    }

    /// Check for the outcome without blocking
    pub fn try_wait(&self) -> Option<UnitOutcome> {
        self.receiver.try_recv().ok()
    }
}

/// Worker pool statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Units accepted by `submit`
    pub units_submitted: AtomicU64,
    /// Units that resolved with a value
    pub units_completed: AtomicU64,
    /// Units that resolved with a calculation or worker failure
    pub units_failed: AtomicU64,
    /// Workers provisioned over the pool's lifetime
    pub workers_spawned: AtomicU64,
}

/// Uniform provisioning contract over local and queue substrates
pub trait WorkerPoolBackend: Send + Sync {
    /// Provision at least the configured minimum of workers
    ///
    /// Fails with a provisioning error if the substrate rejects the
    /// resource request; provisioning failures are not retried.
    fn start(&self) -> Result<()>;

    /// Request a worker count, clamped to the configured bounds
    ///
    /// Scaling down never interrupts an executing worker; it only prevents
    /// new assignment and tears down idle workers. Returns the clamped
    /// target.
    fn scale(&self, target: usize) -> Result<usize>;

    /// Queue one unit for execution; blocks only up to queueing
    fn submit(&self, unit: WorkUnit) -> Result<UnitFuture>;

    /// Release every provisioned resource; idempotent
    fn stop(&self) -> Result<()>;

    /// Workers currently provisioned
    fn worker_count(&self) -> usize;

    /// Whether the pool has started and not yet stopped
    fn is_running(&self) -> bool;
}

/// Run one unit through an executor, containing panics
///
/// Shared by the local pool's worker threads and the remote worker loop:
/// a calculation error becomes the attempt's terminal record, anything
/// else (including a panic) is a worker failure.
pub(crate) fn execute_unit(executor: &Arc<dyn CalculationExecutor>, unit: &WorkUnit) -> UnitOutcome {
    let result = catch_unwind(AssertUnwindSafe(|| {
        executor.execute(&unit.schema, &unit.item, &unit.force_field)
    }));

    match result {
        Ok(Ok(value)) => UnitOutcome::Value(value),
        Ok(Err(err @ EstimatorError::Calculation { .. })) => UnitOutcome::CalculationFailed {
            reason: err.to_string(),
        },
        Ok(Err(other)) => UnitOutcome::WorkerFailure {
            reason: other.to_string(),
        },
        Err(panic) => UnitOutcome::WorkerFailure {
            reason: panic_message(panic),
        },
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {}", message)
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
pub(crate) fn test_unit(id: u64) -> WorkUnit {
    WorkUnit {
        id,
        request_id: "req-test".to_string(),
        item_index: 0,
        layer: "simulation".to_string(),
        attempt: 1,
        schema: CalculationSchema::named("npt-production"),
        item: PropertyItem::new("mol-001", "Density"),
        force_field: ForceFieldSource::named("openff-2.0.0"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FnExecutor;

    #[test]
    fn test_execute_unit_maps_outcomes() {
        let ok: Arc<dyn CalculationExecutor> = Arc::new(FnExecutor::new(|_, _, _| {
            Ok(EstimatedValue {
                value: 1.0,
                uncertainty: 0.1,
                unit: "kg/m^3".to_string(),
            })
        }));
        assert!(matches!(
            execute_unit(&ok, &test_unit(1)),
            UnitOutcome::Value(_)
        ));

        let calc_fail: Arc<dyn CalculationExecutor> = Arc::new(FnExecutor::new(|_, item, _| {
            Err(EstimatorError::calculation(
                &item.property_type,
                "did not converge",
            ))
        }));
        assert!(matches!(
            execute_unit(&calc_fail, &test_unit(2)),
            UnitOutcome::CalculationFailed { .. }
        ));

        let panicking: Arc<dyn CalculationExecutor> =
            Arc::new(FnExecutor::new(|_, _, _| panic!("boom")));
        match execute_unit(&panicking, &test_unit(3)) {
            UnitOutcome::WorkerFailure { reason } => assert!(reason.contains("boom")),
            other => panic!("expected worker failure, got {:?}", other),
        }
    }

    #[test]
    fn test_future_resolves_to_failure_when_dropped() {
        let (sender, future) = UnitFuture::channel(7);
        drop(sender);

        assert_eq!(future.unit_id(), 7);
        assert!(matches!(future.wait(), UnitOutcome::WorkerFailure { .. }));
    }

    #[test]
    fn test_unit_round_trip() {
        let unit = test_unit(9);
        let encoded = serde_json::to_string(&unit).unwrap();
        let decoded: WorkUnit = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, 9);
        assert_eq!(decoded.item.id, unit.item.id);
        assert_eq!(decoded.schema.name, unit.schema.name);
    }
}
