//! Estimation server
//!
//! Accepts requests over TCP, validates them against the options registry,
//! fans calculation units out to the worker pool backend, aggregates
//! per-item results and publishes them keyed by request id. Each request
//! moves through `Received -> Validating -> Dispatching -> Executing ->
//! Aggregating -> Completed | Failed`; per-item failures are isolated and
//! never abort sibling items.

use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::backend::{UnitOutcome, WorkUnit, WorkerPoolBackend};
use crate::config::ConnectionOptions;
use crate::error::{EstimatorError, IoResultExt, Result};
use crate::model::{
    EstimationResult, ItemOutcome, Request, RequestState, ResultSet,
};
use crate::protocol::{
    self, ErrorReply, MessageType, RequestQuery, RetrieveQuery, StatusReply, SubmitAck,
    SubmitPayload,
};
use crate::schema::OptionsRegistry;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the server listens on
    pub connection: ConnectionOptions,
    /// Directory request and result archives are written to
    pub working_directory: PathBuf,
    /// Extra attempts granted to a unit after a worker failure
    pub retry_limit: u32,
    /// Remove per-request archives once results are written
    pub delete_working_files: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            working_directory: PathBuf::from("working-data"),
            retry_limit: 1,
            delete_working_files: true,
        }
    }
}

struct RecordInner {
    state: RequestState,
    results: Vec<Option<EstimationResult>>,
    cancelled: bool,
    completed_at: Option<chrono::DateTime<Utc>>,
}

/// Server-side state of one in-flight request
struct RequestRecord {
    request: Request,
    inner: Mutex<RecordInner>,
    done: Condvar,
}

impl RequestRecord {
    fn new(request: Request) -> Self {
        let slots = request.items.len();
        Self {
            request,
            inner: Mutex::new(RecordInner {
                state: RequestState::Dispatching,
                results: vec![None; slots],
                cancelled: false,
                completed_at: None,
            }),
            done: Condvar::new(),
        }
    }

    fn set_state(&self, state: RequestState) {
        self.inner.lock().unwrap().state = state;
    }

    fn is_cancelled(&self) -> bool {
        self.inner.lock().unwrap().cancelled
    }

    fn record_result(&self, result: EstimationResult) {
        let mut inner = self.inner.lock().unwrap();
        let index = result.item_index;
        inner.results[index] = Some(result);
    }

    fn snapshot_locked(request: &Request, inner: &RecordInner) -> ResultSet {
        ResultSet {
            request_id: request.id.clone(),
            state: inner.state,
            results: inner.results.iter().flatten().cloned().collect(),
            completed_at: inner.completed_at,
        }
    }

    fn snapshot(&self) -> ResultSet {
        let inner = self.inner.lock().unwrap();
        Self::snapshot_locked(&self.request, &inner)
    }

    /// Block without polling until the request reaches a terminal state
    fn wait_terminal(&self, shutdown: &AtomicBool) -> ResultSet {
        let mut inner: MutexGuard<'_, RecordInner> = self.inner.lock().unwrap();
        while !inner.state.is_terminal() && !shutdown.load(Ordering::SeqCst) {
            let (guard, _) = self
                .done
                .wait_timeout(inner, Duration::from_millis(500))
                .unwrap();
            inner = guard;
        }
        Self::snapshot_locked(&self.request, &inner)
    }

    /// Fill unfinished items, mark the terminal state and wake waiters
    ///
    /// Guarantees the final result set covers every submitted item.
    fn finalize(&self) -> ResultSet {
        let mut inner = self.inner.lock().unwrap();
        let cancelled = inner.cancelled;

        for (index, slot) in inner.results.iter_mut().enumerate() {
            if slot.is_none() {
                let item = &self.request.items[index];
                let reason = if cancelled {
                    "request cancelled before the item completed"
                } else {
                    "no result was recorded for the item"
                };
                *slot = Some(EstimationResult {
                    item_index: index,
                    item_id: item.id.clone(),
                    property_type: item.property_type.clone(),
                    layer: None,
                    attempts: 0,
                    outcome: ItemOutcome::Error {
                        reason: reason.to_string(),
                    },
                });
            }
        }

        inner.state = if cancelled {
            RequestState::Failed
        } else {
            RequestState::Completed
        };
        inner.completed_at = Some(Utc::now());

        let snapshot = Self::snapshot_locked(&self.request, &inner);
        drop(inner);
        self.done.notify_all();
        snapshot
    }
}

struct ServerShared {
    config: ServerConfig,
    registry: OptionsRegistry,
    backend: Arc<dyn WorkerPoolBackend>,
    requests: RwLock<HashMap<String, Arc<RequestRecord>>>,
    next_unit_id: AtomicU64,
    shutdown: AtomicBool,
}

impl ServerShared {
    fn record(&self, request_id: &str) -> Result<Arc<RequestRecord>> {
        self.requests
            .read()
            .unwrap()
            .get(request_id)
            .cloned()
            .ok_or_else(|| {
                EstimatorError::validation(format!("unknown request id '{}'", request_id))
            })
    }

    fn retrieve(&self, request_id: &str, synchronous: bool) -> Result<ResultSet> {
        let record = self.record(request_id)?;
        if synchronous {
            Ok(record.wait_terminal(&self.shutdown))
        } else {
            Ok(record.snapshot())
        }
    }

    fn status(&self, request_id: &str) -> Result<StatusReply> {
        let record = self.record(request_id)?;
        let inner = record.inner.lock().unwrap();
        Ok(StatusReply {
            request_id: request_id.to_string(),
            state: inner.state,
            completed_items: inner.results.iter().flatten().count(),
            total_items: record.request.items.len(),
        })
    }

    fn cancel(&self, request_id: &str) -> Result<()> {
        let record = self.record(request_id)?;
        let mut inner = record.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return Err(EstimatorError::validation(format!(
                "request '{}' already reached a terminal state",
                request_id
            )));
        }
        inner.cancelled = true;
        tracing::info!(request = %request_id, "cancellation requested");
        Ok(())
    }
}

/// Validate a request and hand it to a coordinator thread
fn submit_request(shared: &Arc<ServerShared>, request: Request) -> Result<String> {
    tracing::info!(
        request = %request.id,
        items = request.items.len(),
        force_field = %request.force_field.name,
        "received estimation request"
    );

    // all-or-nothing: nothing is dispatched unless every item routes
    shared.registry.validate_request(&request)?;

    let id = request.id.clone();
    let record = Arc::new(RequestRecord::new(request));

    let archive = shared
        .config
        .working_directory
        .join(format!("request-{}.json", id));
    if let Err(e) = record.request.save(&archive, true) {
        tracing::warn!(request = %id, "could not archive request: {}", e);
    }

    shared
        .requests
        .write()
        .unwrap()
        .insert(id.clone(), Arc::clone(&record));

    let coordinator_shared = Arc::clone(shared);
    let coordinator_record = Arc::clone(&record);
    thread::Builder::new()
        .name(format!("propserve-req-{:.8}", id))
        .spawn(move || coordinate(coordinator_shared, coordinator_record))
        .map_err(|e| {
            EstimatorError::worker(format!("could not spawn request coordinator: {}", e))
        })?;

    Ok(id)
}

/// Drive a request from dispatch to its terminal state
fn coordinate(shared: Arc<ServerShared>, record: Arc<RequestRecord>) {
    record.set_state(RequestState::Executing);

    let mut runners = Vec::new();
    for index in 0..record.request.items.len() {
        let shared = Arc::clone(&shared);
        let record = Arc::clone(&record);
        match thread::Builder::new()
            .name(format!("propserve-item-{}", index))
            .spawn(move || run_item(shared, record, index))
        {
            Ok(handle) => runners.push(handle),
            Err(e) => tracing::error!(item = index, "could not spawn item runner: {}", e),
        }
    }

    for runner in runners {
        if runner.join().is_err() {
            tracing::error!(request = %record.request.id, "item runner panicked");
        }
    }

    record.set_state(RequestState::Aggregating);
    let results = record.finalize();

    let path = shared
        .config
        .working_directory
        .join(format!("results-{}.json", record.request.id));
    if let Err(e) = results.save(&path, true) {
        tracing::warn!(request = %record.request.id, "could not archive results: {}", e);
    }
    if shared.config.delete_working_files {
        let request_archive = shared
            .config
            .working_directory
            .join(format!("request-{}.json", record.request.id));
        let _ = fs::remove_file(request_archive);
    }

    tracing::info!(
        request = %record.request.id,
        state = ?results.state,
        failed = results.failures().count(),
        "request finished"
    );
}

/// Run one item through the layer fallback and retry policy
fn run_item(shared: Arc<ServerShared>, record: Arc<RequestRecord>, index: usize) {
    let request = &record.request;
    let item = &request.items[index];
    let mut attempts = 0u32;
    let mut failures: Vec<String> = Vec::new();

    for layer in &request.options.calculation_layers {
        // cancellation drops undispatched units; finalize marks the item
        if record.is_cancelled() {
            return;
        }

        let mut schema = match shared
            .registry
            .resolve(&request.options, layer, &item.property_type)
        {
            Some(schema) => schema.clone(),
            None => {
                failures.push(format!("{}: no schema resolved", layer));
                continue;
            }
        };

        // the configured convergence tolerance rides along in the schema
        // settings; the executor is free to ignore it
        if let Some(tolerance) = shared.registry.tolerance_for(&item.property_type) {
            match &mut schema.settings {
                serde_json::Value::Object(settings) => {
                    settings
                        .entry("convergence_tolerance".to_string())
                        .or_insert_with(|| tolerance.into());
                }
                settings @ serde_json::Value::Null => {
                    *settings = serde_json::json!({ "convergence_tolerance": tolerance });
                }
                _ => {}
            }
        }

        let mut layer_attempt = 0u32;
        let outcome = loop {
            layer_attempt += 1;
            attempts += 1;

            let unit = WorkUnit {
                id: shared.next_unit_id.fetch_add(1, Ordering::Relaxed),
                request_id: request.id.clone(),
                item_index: index,
                layer: layer.clone(),
                attempt: layer_attempt,
                schema: schema.clone(),
                item: item.clone(),
                force_field: request.force_field.clone(),
            };

            let future = match shared.backend.submit(unit) {
                Ok(future) => future,
                Err(e) => break Err(format!("{}: {}", layer, e)),
            };

            match future.wait() {
                UnitOutcome::Value(value) => break Ok(value),
                UnitOutcome::CalculationFailed { reason } => {
                    tracing::debug!(
                        request = %request.id,
                        item = %item.id,
                        layer = %layer,
                        "layer attempt failed: {}",
                        reason
                    );
                    break Err(format!("{}: {}", layer, reason));
                }
                UnitOutcome::WorkerFailure { reason } => {
                    if layer_attempt <= shared.config.retry_limit {
                        tracing::warn!(
                            request = %request.id,
                            item = %item.id,
                            layer = %layer,
                            "worker failed, retrying: {}",
                            reason
                        );
                        continue;
                    }
                    break Err(format!(
                        "{}: worker failure after {} attempts: {}",
                        layer, layer_attempt, reason
                    ));
                }
            }
        };

        match outcome {
            Ok(value) => {
                record.record_result(EstimationResult {
                    item_index: index,
                    item_id: item.id.clone(),
                    property_type: item.property_type.clone(),
                    layer: Some(layer.clone()),
                    attempts,
                    outcome: ItemOutcome::Value(value),
                });
                return;
            }
            Err(reason) => failures.push(reason),
        }
    }

    if record.is_cancelled() {
        return;
    }

    // every layer failed; sibling items continue independently
    record.record_result(EstimationResult {
        item_index: index,
        item_id: item.id.clone(),
        property_type: item.property_type.clone(),
        layer: None,
        attempts,
        outcome: ItemOutcome::Error {
            reason: failures.join("; "),
        },
    });
}

/// The estimation server
///
/// `start` binds the listener and returns immediately (the accept loop
/// runs on its own thread); `run` additionally blocks until `stop`.
/// Dropping the server stops it, so every exit path releases the socket.
pub struct EstimationServer {
    shared: Arc<ServerShared>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    started: AtomicBool,
}

impl EstimationServer {
    /// Create a server over a registry and a started worker pool backend
    pub fn new(
        config: ServerConfig,
        registry: OptionsRegistry,
        backend: Arc<dyn WorkerPoolBackend>,
    ) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                registry,
                backend,
                requests: RwLock::new(HashMap::new()),
                next_unit_id: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
            accept_thread: Mutex::new(None),
            local_addr: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Bind the listener and start accepting connections asynchronously
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        fs::create_dir_all(&self.shared.config.working_directory)
            .with_path(&self.shared.config.working_directory)?;

        let address = self.shared.config.connection.address();
        let listener = TcpListener::bind(&address)
            .map_err(|e| EstimatorError::connection(&address, e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| EstimatorError::connection(&address, e.to_string()))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| EstimatorError::connection(&address, e.to_string()))?;
        *self.local_addr.lock().unwrap() = Some(local_addr);

        tracing::info!(address = %local_addr, "estimation server listening");

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("propserve-accept".to_string())
            .spawn(move || accept_loop(listener, shared))
            .map_err(|e| EstimatorError::connection(&address, e.to_string()))?;
        *self.accept_thread.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Start and block until `stop` is called from another thread
    pub fn run(&self) -> Result<()> {
        self.start()?;
        while !self.shared.shutdown.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(200));
        }
        Ok(())
    }

    /// The bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Submit a request in-process, bypassing the wire
    pub fn submit(&self, request: Request) -> Result<String> {
        submit_request(&self.shared, request)
    }

    /// Retrieve results in-process; `synchronous` blocks until terminal
    pub fn retrieve(&self, request_id: &str, synchronous: bool) -> Result<ResultSet> {
        self.shared.retrieve(request_id, synchronous)
    }

    /// Query a request's state in-process
    pub fn status(&self, request_id: &str) -> Result<StatusReply> {
        self.shared.status(request_id)
    }

    /// Request cancellation of an in-flight request
    pub fn cancel(&self, request_id: &str) -> Result<()> {
        self.shared.cancel(request_id)
    }

    /// Stop accepting connections and wake blocked waiters; idempotent
    pub fn stop(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping estimation server");
        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            if handle.join().is_err() {
                tracing::warn!("accept thread panicked during teardown");
            }
        }
    }
}

impl Drop for EstimationServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    // connection threads are detached; blocked synchronous retrieves wake
    // on the shutdown flag and the threads end when their client hangs up
    while !shared.shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                tracing::debug!(peer = %addr, "accepted connection");
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &shared) {
                        tracing::warn!(peer = %addr, "connection error: {}", e);
                    }
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                tracing::error!("accept error: {}", e);
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, shared: &Arc<ServerShared>) -> Result<()> {
    protocol::read_magic(&mut stream)?;

    loop {
        // clients close the connection between calls; that ends the loop
        let (message_type, body) = match protocol::read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(_) => break,
        };

        match message_type {
            MessageType::Ping => {
                protocol::write_frame(&mut stream, MessageType::Pong, &())?;
            }
            MessageType::Submit => {
                let payload: SubmitPayload = protocol::decode(&body)?;
                let request = Request::new(payload.items, payload.force_field, payload.options);
                match submit_request(shared, request) {
                    Ok(request_id) => protocol::write_frame(
                        &mut stream,
                        MessageType::SubmitAck,
                        &SubmitAck { request_id },
                    )?,
                    Err(e) => write_error(&mut stream, &e)?,
                }
            }
            MessageType::Status => {
                let query: RequestQuery = protocol::decode(&body)?;
                match shared.status(&query.request_id) {
                    Ok(reply) => {
                        protocol::write_frame(&mut stream, MessageType::StatusReply, &reply)?
                    }
                    Err(e) => write_error(&mut stream, &e)?,
                }
            }
            MessageType::Retrieve => {
                let query: RetrieveQuery = protocol::decode(&body)?;
                match shared.retrieve(&query.request_id, query.synchronous) {
                    Ok(results) => {
                        protocol::write_frame(&mut stream, MessageType::Results, &results)?
                    }
                    Err(e) => write_error(&mut stream, &e)?,
                }
            }
            MessageType::Cancel => {
                let query: RequestQuery = protocol::decode(&body)?;
                match shared.cancel(&query.request_id) {
                    Ok(()) => protocol::write_frame(&mut stream, MessageType::CancelAck, &())?,
                    Err(e) => write_error(&mut stream, &e)?,
                }
            }
            other => {
                let err = EstimatorError::protocol(format!("unexpected message {:?}", other));
                write_error(&mut stream, &err)?;
            }
        }
    }

    Ok(())
}

fn write_error(stream: &mut TcpStream, error: &EstimatorError) -> Result<()> {
    protocol::write_frame(stream, MessageType::Error, &ErrorReply::from_error(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalWorkerPool;
    use crate::config::{ComputeResourceSpec, WorkerPoolConfig};
    use crate::executor::{CalculationExecutor, FnExecutor};
    use crate::model::{EstimatedValue, ForceFieldSource, PropertyItem};
    use crate::schema::{CalculationSchema, RequestOptions};
    use std::sync::atomic::AtomicU32;

    fn pool_with(
        maximum: usize,
        executor: Arc<dyn CalculationExecutor>,
    ) -> Arc<LocalWorkerPool> {
        let pool = Arc::new(LocalWorkerPool::new(
            WorkerPoolConfig {
                minimum_workers: 1,
                maximum_workers: maximum,
                idle_timeout_secs: 60,
                ..Default::default()
            },
            ComputeResourceSpec::default(),
            executor,
        ));
        pool.start().unwrap();
        pool
    }

    fn server_with(
        pool: Arc<LocalWorkerPool>,
        registry: OptionsRegistry,
        retry_limit: u32,
    ) -> EstimationServer {
        let dir = tempfile::tempdir().unwrap();
        EstimationServer::new(
            ServerConfig {
                working_directory: dir.into_path(),
                retry_limit,
                ..Default::default()
            },
            registry,
            pool,
        )
    }

    fn density_registry() -> OptionsRegistry {
        let mut registry = OptionsRegistry::new();
        registry.add_schema("simulation", "Density", CalculationSchema::named("npt"));
        registry
    }

    fn density_request(count: usize) -> Request {
        let mut options = RequestOptions::new();
        options.calculation_layers = vec!["simulation".to_string()];
        let items = (0..count)
            .map(|i| PropertyItem::new(format!("mol-{:03}", i), "Density"))
            .collect();
        Request::new(items, ForceFieldSource::named("openff-2.0.0"), options)
    }

    fn constant_executor(value: f64) -> Arc<dyn CalculationExecutor> {
        Arc::new(FnExecutor::new(move |_, _, _| {
            Ok(EstimatedValue {
                value,
                uncertainty: 0.1,
                unit: "kg/m^3".to_string(),
            })
        }))
    }

    #[test]
    fn test_every_item_gets_a_result() {
        let pool = pool_with(2, constant_executor(997.0));
        let server = server_with(Arc::clone(&pool), density_registry(), 1);

        let id = server.submit(density_request(3)).unwrap();
        let results = server.retrieve(&id, true).unwrap();

        assert_eq!(results.state, RequestState::Completed);
        assert_eq!(results.results.len(), 3);
        assert_eq!(results.successes().count(), 3);
        assert!(results.completed_at.is_some());

        pool.stop().unwrap();
    }

    #[test]
    fn test_validation_is_all_or_nothing() {
        let pool = pool_with(2, constant_executor(1.0));
        let server = server_with(Arc::clone(&pool), density_registry(), 1);

        let mut options = RequestOptions::new();
        options.calculation_layers = vec!["simulation".to_string()];
        let request = Request::new(
            vec![
                PropertyItem::new("mol-000", "Density"),
                PropertyItem::new("mol-001", "DielectricConstant"),
                PropertyItem::new("mol-002", "Density"),
            ],
            ForceFieldSource::named("ff"),
            options,
        );
        let id = request.id.clone();

        let err = server.submit(request).unwrap_err();
        assert!(matches!(err, EstimatorError::Validation(_)));
        // nothing was dispatched and the request was never registered
        assert_eq!(pool.stats().units_submitted.load(Ordering::Relaxed), 0);
        assert!(server.status(&id).is_err());

        pool.stop().unwrap();
    }

    #[test]
    fn test_layer_fallback_records_second_layer_value() {
        let executor: Arc<dyn CalculationExecutor> =
            Arc::new(FnExecutor::new(|schema, item, _| match schema.name.as_str() {
                "mbar" => Err(EstimatorError::calculation(
                    &item.property_type,
                    "insufficient overlap",
                )),
                _ => Ok(EstimatedValue {
                    value: 55.1,
                    uncertainty: 0.9,
                    unit: "kJ/mol".to_string(),
                }),
            }));
        let pool = pool_with(2, executor);

        let mut registry = OptionsRegistry::new();
        registry.add_schema("reweighting", "Density", CalculationSchema::named("mbar"));
        registry.add_schema("simulation", "Density", CalculationSchema::named("npt"));
        let server = server_with(Arc::clone(&pool), registry, 1);

        let mut options = RequestOptions::new();
        options.calculation_layers = vec!["reweighting".to_string(), "simulation".to_string()];
        let request = Request::new(
            vec![PropertyItem::new("mol-000", "Density")],
            ForceFieldSource::named("ff"),
            options,
        );

        let id = server.submit(request).unwrap();
        let results = server.retrieve(&id, true).unwrap();

        assert_eq!(results.state, RequestState::Completed);
        let result = &results.results[0];
        assert!(result.outcome.is_success());
        assert_eq!(result.layer.as_deref(), Some("simulation"));
        // the failed first-layer attempt is recorded internally, not as
        // the item's terminal error
        assert_eq!(result.attempts, 2);

        pool.stop().unwrap();
    }

    #[test]
    fn test_worker_failure_retried_within_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_seen = Arc::clone(&calls);
        let executor: Arc<dyn CalculationExecutor> = Arc::new(FnExecutor::new(move |_, _, _| {
            if calls_seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("simulated worker crash");
            }
            Ok(EstimatedValue {
                value: 12.0,
                uncertainty: 0.3,
                unit: "kcal/mol".to_string(),
            })
        }));
        let pool = pool_with(2, executor);
        let server = server_with(Arc::clone(&pool), density_registry(), 1);

        let id = server.submit(density_request(1)).unwrap();
        let results = server.retrieve(&id, true).unwrap();

        assert_eq!(results.state, RequestState::Completed);
        let result = &results.results[0];
        assert!(result.outcome.is_success(), "retried unit should succeed");
        assert_eq!(result.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        pool.stop().unwrap();
    }

    #[test]
    fn test_item_failures_are_isolated() {
        let executor: Arc<dyn CalculationExecutor> =
            Arc::new(FnExecutor::new(|_, item, _| {
                if item.property_type == "DielectricConstant" {
                    Err(EstimatorError::calculation(
                        &item.property_type,
                        "polarization did not converge",
                    ))
                } else {
                    Ok(EstimatedValue {
                        value: 997.0,
                        uncertainty: 0.5,
                        unit: "kg/m^3".to_string(),
                    })
                }
            }));
        let pool = pool_with(2, executor);

        let mut registry = density_registry();
        registry.add_schema(
            "simulation",
            "DielectricConstant",
            CalculationSchema::named("npt-dielectric"),
        );
        let server = server_with(Arc::clone(&pool), registry, 1);

        let mut options = RequestOptions::new();
        options.calculation_layers = vec!["simulation".to_string()];
        let request = Request::new(
            vec![
                PropertyItem::new("mol-000", "Density"),
                PropertyItem::new("mol-001", "DielectricConstant"),
            ],
            ForceFieldSource::named("ff"),
            options,
        );

        let id = server.submit(request).unwrap();
        let results = server.retrieve(&id, true).unwrap();

        // a failed sibling never aborts the request
        assert_eq!(results.state, RequestState::Completed);
        assert_eq!(results.results.len(), 2);
        assert_eq!(results.successes().count(), 1);
        let failure = results.failures().next().unwrap();
        assert_eq!(failure.item_id, "mol-001");
        match &failure.outcome {
            ItemOutcome::Error { reason } => assert!(reason.contains("polarization")),
            other => panic!("expected error outcome, got {:?}", other),
        }

        pool.stop().unwrap();
    }

    #[test]
    fn test_cancellation_marks_unfinished_items() {
        let executor: Arc<dyn CalculationExecutor> = Arc::new(FnExecutor::new(|_, item, _| {
            thread::sleep(Duration::from_millis(150));
            Err(EstimatorError::calculation(&item.property_type, "slow failure"))
        }));
        let pool = pool_with(1, executor);

        let mut registry = OptionsRegistry::new();
        registry.add_schema("gas", "Density", CalculationSchema::named("gas-phase"));
        registry.add_schema("liquid", "Density", CalculationSchema::named("liquid-phase"));
        let server = server_with(Arc::clone(&pool), registry, 0);

        let mut options = RequestOptions::new();
        options.calculation_layers = vec!["gas".to_string(), "liquid".to_string()];
        let request = Request::new(
            vec![PropertyItem::new("mol-000", "Density")],
            ForceFieldSource::named("ff"),
            options,
        );

        let id = server.submit(request).unwrap();
        thread::sleep(Duration::from_millis(40));
        server.cancel(&id).unwrap();

        let results = server.retrieve(&id, true).unwrap();
        assert_eq!(results.state, RequestState::Failed);
        assert_eq!(results.results.len(), 1);
        match &results.results[0].outcome {
            ItemOutcome::Error { reason } => assert!(reason.contains("cancelled")),
            other => panic!("expected cancellation marker, got {:?}", other),
        }

        pool.stop().unwrap();
    }

    #[test]
    fn test_snapshot_reports_still_running() {
        let (gate_tx, gate_rx) = crossbeam::channel::bounded::<()>(4);
        let executor: Arc<dyn CalculationExecutor> = Arc::new(FnExecutor::new(move |_, _, _| {
            gate_rx
                .recv()
                .map_err(|_| EstimatorError::calculation("Density", "gate closed"))?;
            Ok(EstimatedValue {
                value: 1.0,
                uncertainty: 0.1,
                unit: "kg/m^3".to_string(),
            })
        }));
        let pool = pool_with(2, executor);
        let server = server_with(Arc::clone(&pool), density_registry(), 1);

        let id = server.submit(density_request(2)).unwrap();

        let snapshot = server.retrieve(&id, false).unwrap();
        assert!(snapshot.is_running());
        assert!(snapshot.results.len() < 2);

        let status = server.status(&id).unwrap();
        assert_eq!(status.total_items, 2);

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();

        let results = server.retrieve(&id, true).unwrap();
        assert_eq!(results.state, RequestState::Completed);
        assert_eq!(results.results.len(), 2);

        pool.stop().unwrap();
    }

    #[test]
    fn test_tolerance_rides_into_dispatched_units() {
        let executor: Arc<dyn CalculationExecutor> = Arc::new(FnExecutor::new(|schema, _, _| {
            let tolerance = schema
                .settings
                .get("convergence_tolerance")
                .and_then(|v| v.as_f64())
                .unwrap_or(-1.0);
            Ok(EstimatedValue {
                value: tolerance,
                uncertainty: 0.0,
                unit: "dimensionless".to_string(),
            })
        }));
        let pool = pool_with(1, executor);

        let mut registry = density_registry();
        registry.set_tolerance("Density", 0.5);
        let server = server_with(Arc::clone(&pool), registry, 1);

        let id = server.submit(density_request(1)).unwrap();
        let results = server.retrieve(&id, true).unwrap();

        match &results.results[0].outcome {
            ItemOutcome::Value(value) => assert_eq!(value.value, 0.5),
            other => panic!("expected value, got {:?}", other),
        }

        pool.stop().unwrap();
    }

    #[test]
    fn test_unknown_request_id() {
        let pool = pool_with(1, constant_executor(1.0));
        let server = server_with(Arc::clone(&pool), density_registry(), 1);

        assert!(server.retrieve("no-such-id", false).is_err());
        assert!(server.status("no-such-id").is_err());
        assert!(server.cancel("no-such-id").is_err());

        pool.stop().unwrap();
    }
}
