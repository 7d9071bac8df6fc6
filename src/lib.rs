//! # propserve - Distributed Property Estimation for HPC
//!
//! propserve is the orchestration layer of a distributed physical-property
//! estimation workflow: a client submits a batch of property-calculation
//! requests over TCP, the server routes each request through a schema
//! registry and fans calculation units out to an elastic worker pool
//! (local threads or HPC-queue jobs), and aggregated results come back
//! keyed by request id. The scientific content of a calculation lives
//! behind the [`executor::CalculationExecutor`] trait and stays out of
//! this crate.
//!
//! ## Quick Start
//!
//! ```no_run
//! use propserve::backend::{LocalWorkerPool, WorkerPoolBackend};
//! use propserve::client::EstimationClient;
//! use propserve::config::{ComputeResourceSpec, ConnectionOptions, WorkerPoolConfig};
//! use propserve::executor::CommandExecutor;
//! use propserve::model::{ForceFieldSource, PropertyItem};
//! use propserve::schema::{CalculationSchema, OptionsRegistry, RequestOptions};
//! use propserve::server::{EstimationServer, ServerConfig};
//! use std::sync::Arc;
//!
//! // Provision a pool of local workers
//! let executor = Arc::new(CommandExecutor::new("estimate-unit").unwrap());
//! let pool = Arc::new(LocalWorkerPool::new(
//!     WorkerPoolConfig { minimum_workers: 1, maximum_workers: 4, ..Default::default() },
//!     ComputeResourceSpec::default(),
//!     executor,
//! ));
//! pool.start().unwrap();
//!
//! // Route density estimates to an NPT production schema
//! let mut registry = OptionsRegistry::new();
//! registry.add_schema("simulation", "Density", CalculationSchema::named("npt-production"));
//!
//! // Start the server and submit a request
//! let server = EstimationServer::new(ServerConfig::default(), registry, pool.clone());
//! server.start().unwrap();
//!
//! let client = EstimationClient::new(ConnectionOptions::default());
//! let mut options = RequestOptions::new();
//! options.calculation_layers = vec!["simulation".to_string()];
//!
//! let handle = client.request_estimate(
//!     vec![PropertyItem::new("mol-001", "Density")],
//!     ForceFieldSource::named("openff-2.0.0"),
//!     options,
//! ).unwrap();
//!
//! // Block until every item has a value or a terminal error
//! let results = handle.results(true).unwrap();
//! assert_eq!(results.results.len(), 1);
//! ```
//!
//! ## Queue-Provisioned Workers
//!
//! ```no_run
//! use propserve::backend::{QueueWorkerPool, SchedulerKind, WorkerPoolBackend};
//! use propserve::config::{ComputeResourceSpec, WorkerPoolConfig};
//!
//! let pool = QueueWorkerPool::new(
//!     SchedulerKind::Slurm,
//!     WorkerPoolConfig {
//!         minimum_workers: 1,
//!         maximum_workers: 28,
//!         queue_name: Some("gpu-long".to_string()),
//!         setup_commands: vec!["conda activate estimation".to_string()],
//!         ..Default::default()
//!     },
//!     ComputeResourceSpec { gpus: 1, ..Default::default() },
//! );
//! pool.start().unwrap();
//! // generated job scripts dial back into the pool's distributor socket
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod protocol;
pub mod schema;
pub mod server;

// Re-export commonly used types
pub use client::{EstimationClient, RequestHandle};
pub use config::{ComputeResourceSpec, ConnectionOptions, WorkerPoolConfig};
pub use error::{EstimatorError, Result};
pub use server::{EstimationServer, ServerConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use propserve::prelude::*;
    //! ```

    pub use crate::backend::{
        LocalWorkerPool, QueueWorkerPool, SchedulerKind, WorkerPoolBackend,
    };
    pub use crate::client::{EstimationClient, RequestHandle};
    pub use crate::config::{
        ComputeResourceSpec, ConnectionOptions, GpuToolkit, WorkerPoolConfig,
    };
    pub use crate::error::{EstimatorError, Result};
    pub use crate::executor::{CalculationExecutor, CommandExecutor, FnExecutor};
    pub use crate::model::{
        EstimatedValue, EstimationResult, ForceFieldSource, ItemOutcome, PropertyDataSet,
        PropertyItem, Request, RequestState, ResultSet,
    };
    pub use crate::schema::{CalculationSchema, OptionsRegistry, RequestOptions};
    pub use crate::server::{EstimationServer, ServerConfig};
}
