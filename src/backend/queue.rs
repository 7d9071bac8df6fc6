//! Queue-provisioned worker pools
//!
//! Provisions workers by submitting generated job scripts to an HPC
//! scheduler (Slurm, PBS/Torque, LSF or SGE). Each job runs the configured
//! worker launch command; the worker process dials back into the pool's
//! distributor socket and serves framed calculation units until told to
//! shut down. Scaling up submits more jobs; scaling down and `stop` tell
//! idle workers to exit and cancel outstanding jobs.

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{
    execute_unit, PoolStats, UnitFuture, UnitOutcome, UnitReport, WorkUnit, WorkerPoolBackend,
};
use crate::config::{format_wallclock, ComputeResourceSpec, GpuToolkit, WorkerPoolConfig};
use crate::error::{EstimatorError, Result};
use crate::executor::CalculationExecutor;
use crate::protocol::{self, MessageType, WorkerHello};

type Task = (WorkUnit, Sender<UnitOutcome>);

/// How often distributor threads re-check shutdown and drain requests
const DISTRIBUTOR_TICK: Duration = Duration::from_millis(250);

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Supported HPC scheduler dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Slurm Workload Manager
    Slurm,
    /// PBS/Torque
    Pbs,
    /// IBM Spectrum LSF
    Lsf,
    /// SGE/UGE
    Sge,
}

impl SchedulerKind {
    /// Scheduler name for logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerKind::Slurm => "slurm",
            SchedulerKind::Pbs => "pbs",
            SchedulerKind::Lsf => "lsf",
            SchedulerKind::Sge => "sge",
        }
    }

    /// Command used to submit a job script on stdin
    pub fn submit_command(&self) -> &'static str {
        match self {
            SchedulerKind::Slurm => "sbatch",
            SchedulerKind::Pbs | SchedulerKind::Sge => "qsub",
            SchedulerKind::Lsf => "bsub",
        }
    }

    /// Command used to cancel a job by id
    pub fn cancel_command(&self) -> &'static str {
        match self {
            SchedulerKind::Slurm => "scancel",
            SchedulerKind::Pbs | SchedulerKind::Sge => "qdel",
            SchedulerKind::Lsf => "bkill",
        }
    }

    /// Directive prefix used for extra scheduler flags
    pub fn directive_prefix(&self) -> &'static str {
        match self {
            SchedulerKind::Slurm => "#SBATCH",
            SchedulerKind::Pbs => "#PBS",
            SchedulerKind::Lsf => "#BSUB",
            SchedulerKind::Sge => "#$",
        }
    }
}

/// Extract the job id from a scheduler's submission output
fn parse_submit_output(kind: SchedulerKind, stdout: &str) -> Option<String> {
    match kind {
        // "Submitted batch job 12345"
        SchedulerKind::Slurm => stdout.split_whitespace().last().map(str::to_string),
        // "12345.head-node"
        SchedulerKind::Pbs => {
            let id = stdout.trim();
            (!id.is_empty()).then(|| id.to_string())
        }
        // "Job <12345> is submitted to queue <normal>."
        SchedulerKind::Lsf => stdout
            .split('<')
            .nth(1)
            .and_then(|s| s.split('>').next())
            .map(str::to_string),
        // "Your job 12345 (\"propserve-worker\") has been submitted"
        SchedulerKind::Sge => stdout.split_whitespace().nth(2).map(str::to_string),
    }
}

struct DistributorShared {
    task_rx: Receiver<Task>,
    shutdown: AtomicBool,
    connected: AtomicUsize,
    busy: AtomicUsize,
    drain: AtomicUsize,
    stats: PoolStats,
}

/// Worker pool provisioned through an HPC queue
pub struct QueueWorkerPool {
    kind: SchedulerKind,
    config: WorkerPoolConfig,
    resources: ComputeResourceSpec,
    worker_command: String,
    bind_address: String,
    advertise_host: Option<String>,
    task_tx: Mutex<Option<Sender<Task>>>,
    shared: Arc<DistributorShared>,
    jobs: Mutex<Vec<String>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    state: AtomicU8,
}

impl QueueWorkerPool {
    /// Create a pool; nothing is submitted until `start`
    pub fn new(
        kind: SchedulerKind,
        config: WorkerPoolConfig,
        resources: ComputeResourceSpec,
    ) -> Self {
        let (task_tx, task_rx) = unbounded();

        Self {
            kind,
            config,
            resources,
            worker_command: "propserve worker --connect {address}".to_string(),
            bind_address: "0.0.0.0:0".to_string(),
            advertise_host: None,
            task_tx: Mutex::new(Some(task_tx)),
            shared: Arc::new(DistributorShared {
                task_rx,
                shutdown: AtomicBool::new(false),
                connected: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                drain: AtomicUsize::new(0),
                stats: PoolStats::default(),
            }),
            jobs: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
            state: AtomicU8::new(STATE_IDLE),
        }
    }

    /// Override the worker launch command written into job scripts;
    /// `{address}` is replaced with the distributor's `host:port`
    pub fn with_worker_command(mut self, command: impl Into<String>) -> Self {
        self.worker_command = command.into();
        self
    }

    /// Override the distributor bind address (default `0.0.0.0:0`)
    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Override the host workers dial back to (default: this machine's
    /// hostname)
    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    /// Pool statistics
    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    /// The distributor address workers connect to, once started
    pub fn distributor_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    fn advertise_address(&self, addr: SocketAddr) -> String {
        let host = self.advertise_host.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string())
        });
        format!("{}:{}", host, addr.port())
    }

    /// Generate the job script submitted for one worker
    ///
    /// Layout: scheduler directives derived from the resource spec and
    /// pool config, the extra flags verbatim, the explicit environment,
    /// the setup commands verbatim, then the worker launch command.
    pub fn generate_job_script(&self, address: &str) -> String {
        let mut script = String::from("#!/bin/bash\n");
        let memory_mb = self.resources.memory_limit / (1024 * 1024);
        let prefix = self.kind.directive_prefix();

        match self.kind {
            SchedulerKind::Slurm => {
                script.push_str("#SBATCH --job-name=propserve-worker\n");
                script.push_str("#SBATCH --ntasks=1\n");
                script.push_str(&format!(
                    "#SBATCH --cpus-per-task={}\n",
                    self.resources.threads
                ));
                script.push_str(&format!("#SBATCH --mem={}M\n", memory_mb));
                script.push_str(&format!(
                    "#SBATCH --time={}\n",
                    format_wallclock(self.resources.wallclock_limit)
                ));
                if let Some(ref queue) = self.config.queue_name {
                    script.push_str(&format!("#SBATCH --partition={}\n", queue));
                }
                if self.resources.gpus > 0 {
                    script.push_str(&format!("#SBATCH --gres=gpu:{}\n", self.resources.gpus));
                }
            }
            SchedulerKind::Pbs => {
                script.push_str("#PBS -N propserve-worker\n");
                script.push_str(&format!("#PBS -l nodes=1:ppn={}\n", self.resources.threads));
                script.push_str(&format!("#PBS -l mem={}mb\n", memory_mb));
                script.push_str(&format!(
                    "#PBS -l walltime={}\n",
                    format_wallclock(self.resources.wallclock_limit)
                ));
                if let Some(ref queue) = self.config.queue_name {
                    script.push_str(&format!("#PBS -q {}\n", queue));
                }
            }
            SchedulerKind::Lsf => {
                script.push_str("#BSUB -J propserve-worker\n");
                script.push_str(&format!("#BSUB -n {}\n", self.resources.threads));
                script.push_str(&format!("#BSUB -M {}M\n", memory_mb));
                script.push_str(&format!(
                    "#BSUB -W {}\n",
                    self.resources.wallclock_limit / 60
                ));
                if let Some(ref queue) = self.config.queue_name {
                    script.push_str(&format!("#BSUB -q {}\n", queue));
                }
            }
            SchedulerKind::Sge => {
                script.push_str("#$ -N propserve-worker\n");
                script.push_str(&format!("#$ -pe smp {}\n", self.resources.threads));
                script.push_str(&format!("#$ -l h_vmem={}M\n", memory_mb));
                script.push_str(&format!(
                    "#$ -l h_rt={}\n",
                    format_wallclock(self.resources.wallclock_limit)
                ));
                script.push_str("#$ -cwd\n");
                if let Some(ref queue) = self.config.queue_name {
                    script.push_str(&format!("#$ -q {}\n", queue));
                }
            }
        }

        for flag in &self.config.extra_scheduler_flags {
            script.push_str(&format!("{} {}\n", prefix, flag));
        }

        script.push_str("\n# Environment\n");
        for (key, value) in &self.resources.environment {
            script.push_str(&format!("export {}=\"{}\"\n", key, value));
        }
        if !self.resources.visible_devices.is_empty()
            && self.resources.gpu_toolkit == GpuToolkit::Cuda
        {
            let devices: Vec<String> = self
                .resources
                .visible_devices
                .iter()
                .map(u32::to_string)
                .collect();
            script.push_str(&format!(
                "export CUDA_VISIBLE_DEVICES={}\n",
                devices.join(",")
            ));
        }

        if !self.config.setup_commands.is_empty() {
            script.push('\n');
            for command in &self.config.setup_commands {
                script.push_str(command);
                script.push('\n');
            }
        }

        if self.kind == SchedulerKind::Pbs {
            script.push_str("\ncd $PBS_O_WORKDIR\n");
        }

        script.push('\n');
        script.push_str(&self.worker_command.replace("{address}", address));
        script.push('\n');

        script
    }

    /// Submit one worker job, returning its scheduler id
    fn submit_worker_job(&self, address: &str) -> Result<String> {
        let script = self.generate_job_script(address);
        let command = self.kind.submit_command();

        let mut child = Command::new(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EstimatorError::provisioning(
                    self.kind.name(),
                    format!("failed to run '{}': {}", command, e),
                )
            })?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(script.as_bytes()).map_err(|e| {
                EstimatorError::provisioning(
                    self.kind.name(),
                    format!("failed to hand script to '{}': {}", command, e),
                )
            })?;
        }

        let output = child.wait_with_output().map_err(|e| {
            EstimatorError::provisioning(
                self.kind.name(),
                format!("'{}' did not exit: {}", command, e),
            )
        })?;

        if !output.status.success() {
            return Err(EstimatorError::provisioning(
                self.kind.name(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = parse_submit_output(self.kind, &stdout).ok_or_else(|| {
            EstimatorError::provisioning(
                self.kind.name(),
                format!("could not parse job id from '{}'", stdout.trim()),
            )
        })?;

        tracing::info!(job = %job_id, scheduler = self.kind.name(), "submitted worker job");
        self.jobs.lock().unwrap().push(job_id.clone());
        Ok(job_id)
    }

    /// Submit another worker job while a backlog exists
    fn maybe_grow(&self, sender: &Sender<Task>, address: &str) {
        let backlog = sender.len();
        if backlog == 0 {
            return;
        }

        let connected = self.shared.connected.load(Ordering::SeqCst);
        let busy = self.shared.busy.load(Ordering::SeqCst);
        let idle = connected.saturating_sub(busy);
        let provisioned = self.jobs.lock().unwrap().len().max(connected);

        if backlog > idle && provisioned < self.config.maximum_workers {
            if let Err(e) = self.submit_worker_job(address) {
                tracing::warn!("could not grow worker pool: {}", e);
            }
        }
    }
}

impl WorkerPoolBackend for QueueWorkerPool {
    fn start(&self) -> Result<()> {
        self.config
            .validate()
            .map_err(|e| EstimatorError::provisioning(self.kind.name(), e.to_string()))?;
        self.resources
            .validate()
            .map_err(|e| EstimatorError::provisioning(self.kind.name(), e.to_string()))?;

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
                    self.kind.name(),
                    "pool has already been stopped",
                ))
            }
        }

        let listener = TcpListener::bind(&self.bind_address).map_err(|e| {
            EstimatorError::provisioning(
                self.kind.name(),
                format!("could not bind distributor on {}: {}", self.bind_address, e),
            )
        })?;
        listener.set_nonblocking(true).map_err(|e| {
            EstimatorError::provisioning(self.kind.name(), format!("listener setup failed: {}", e))
        })?;

        let addr = listener.local_addr().map_err(|e| {
            EstimatorError::provisioning(self.kind.name(), format!("listener has no address: {}", e))
        })?;
        *self.local_addr.lock().unwrap() = Some(addr);

        tracing::info!(
            scheduler = self.kind.name(),
            distributor = %addr,
            minimum = self.config.minimum_workers,
            maximum = self.config.maximum_workers,
            gpu_toolkit = self.resources.gpu_toolkit.name(),
            memory_per_worker = %humansize::format_size(self.resources.memory_limit, humansize::BINARY),
            "starting queue worker pool"
        );

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("propserve-distributor".to_string())
            .spawn(move || accept_loop(listener, shared))
            .map_err(|e| {
                EstimatorError::provisioning(
                    self.kind.name(),
                    format!("could not spawn distributor: {}", e),
                )
            })?;
        self.threads.lock().unwrap().push(handle);

        let address = self.advertise_address(addr);
        for _ in 0..self.config.minimum_workers {
            if let Err(e) = self.submit_worker_job(&address) {
                // roll back whatever was provisioned before failing start
                let _ = self.stop();
                return Err(e);
            }
        }

        Ok(())
    }

    fn scale(&self, target: usize) -> Result<usize> {
        if !self.is_running() {
            return Err(EstimatorError::worker("worker pool is not running"));
        }

        let clamped = self.config.clamp(target);
        let addr = self
            .distributor_addr()
            .ok_or_else(|| EstimatorError::worker("distributor is not listening"))?;
        let address = self.advertise_address(addr);

        let provisioned = self.jobs.lock().unwrap().len();
        if clamped > provisioned {
            for _ in 0..(clamped - provisioned) {
                self.submit_worker_job(&address)?;
            }
        } else {
            let connected = self.shared.connected.load(Ordering::SeqCst);
            if clamped < connected {
                self.shared
                    .drain
                    .fetch_add(connected - clamped, Ordering::SeqCst);
            }
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

        tracing::debug!(unit = unit.id, layer = %unit.layer, "queueing unit for remote workers");
        sender
            .send((unit, reply))
            .map_err(|_| EstimatorError::worker("worker pool stopped"))?;

        if let Some(addr) = self.distributor_addr() {
            let address = self.advertise_address(addr);
            self.maybe_grow(&sender, &address);
        }

        Ok(future)
    }

    fn stop(&self) -> Result<()> {
        let previous = self.state.swap(STATE_STOPPED, Ordering::SeqCst);
        if previous != STATE_RUNNING {
            return Ok(());
        }

        tracing::info!(scheduler = self.kind.name(), "stopping queue worker pool");
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.task_tx.lock().unwrap().take();

        // teardown runs to completion; a failed cancellation is logged,
        // never propagated
        let jobs: Vec<String> = self.jobs.lock().unwrap().drain(..).collect();
        for job in jobs {
            match Command::new(self.kind.cancel_command()).arg(&job).output() {
                Ok(output) if output.status.success() => {
                    tracing::info!(job = %job, "cancelled worker job");
                }
                Ok(output) => {
                    tracing::warn!(
                        job = %job,
                        "could not cancel worker job: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                Err(e) => {
                    tracing::warn!(job = %job, "could not run {}: {}", self.kind.cancel_command(), e);
                }
            }
        }

        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("distributor thread panicked during teardown");
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
        self.jobs
            .lock()
            .unwrap()
            .len()
            .max(self.shared.connected.load(Ordering::SeqCst))
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }
}

impl Drop for QueueWorkerPool {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("error while stopping queue worker pool: {}", e);
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<DistributorShared>) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();

    while !shared.shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                tracing::info!(peer = %addr, "worker dialed in");
                let shared = Arc::clone(&shared);
                match thread::Builder::new()
                    .name(format!("propserve-dist-{}", addr))
                    .spawn(move || {
                        if let Err(e) = serve_worker(stream, &shared) {
                            tracing::warn!(peer = %addr, "worker connection ended: {}", e);
                        }
                    }) {
                    Ok(handle) => connections.push(handle),
                    Err(e) => tracing::error!("could not spawn connection thread: {}", e),
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                tracing::error!("accept error: {}", e);
            }
        }
    }

    for handle in connections {
        if handle.join().is_err() {
            tracing::warn!("connection thread panicked during teardown");
        }
    }
}

fn serve_worker(mut stream: TcpStream, shared: &DistributorShared) -> Result<()> {
    protocol::read_magic(&mut stream)?;

    let (message_type, body) = protocol::read_frame(&mut stream)?;
    if message_type != MessageType::WorkerHello {
        return Err(EstimatorError::protocol(format!(
            "expected WorkerHello, got {:?}",
            message_type
        )));
    }
    let hello: WorkerHello = protocol::decode(&body)?;
    tracing::info!(hostname = %hello.hostname, pid = hello.pid, "worker registered");

    shared.connected.fetch_add(1, Ordering::SeqCst);
    shared.stats.workers_spawned.fetch_add(1, Ordering::Relaxed);

    let result = worker_assignment_loop(&mut stream, shared);

    shared.connected.fetch_sub(1, Ordering::SeqCst);
    tracing::info!(hostname = %hello.hostname, "worker released");
    result
}

fn worker_assignment_loop(stream: &mut TcpStream, shared: &DistributorShared) -> Result<()> {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) || take_drain_token(shared) {
            let _ = protocol::write_frame(stream, MessageType::WorkerShutdown, &());
            return Ok(());
        }

        match shared.task_rx.recv_timeout(DISTRIBUTOR_TICK) {
            Ok((unit, reply)) => {
                shared.busy.fetch_add(1, Ordering::SeqCst);
                let dispatched = dispatch_remote(stream, &unit);
                shared.busy.fetch_sub(1, Ordering::SeqCst);

                match dispatched {
                    Ok(outcome) => {
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
                    }
                    Err(e) => {
                        shared.stats.units_failed.fetch_add(1, Ordering::Relaxed);
                        let _ = reply.send(UnitOutcome::WorkerFailure {
                            reason: format!("worker connection lost: {}", e),
                        });
                        return Err(e);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                let _ = protocol::write_frame(stream, MessageType::WorkerShutdown, &());
                return Ok(());
            }
        }
    }
}

fn take_drain_token(shared: &DistributorShared) -> bool {
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

fn dispatch_remote(stream: &mut TcpStream, unit: &WorkUnit) -> Result<UnitOutcome> {
    protocol::write_frame(stream, MessageType::UnitAssign, unit)?;

    let (message_type, body) = protocol::read_frame(stream)?;
    if message_type != MessageType::UnitResult {
        return Err(EstimatorError::protocol(format!(
            "expected UnitResult, got {:?}",
            message_type
        )));
    }

    let report: UnitReport = protocol::decode(&body)?;
    if report.unit_id != unit.id {
        return Err(EstimatorError::protocol(format!(
            "unit id mismatch: assigned {}, reported {}",
            unit.id, report.unit_id
        )));
    }

    Ok(report.outcome)
}

/// Remote worker entry point: dial the distributor and serve units
///
/// This is what the generated job script's launch command runs. Returns
/// once the distributor requests shutdown or the connection closes.
pub fn run_worker(address: &str, executor: Arc<dyn CalculationExecutor>) -> Result<()> {
    let mut stream = TcpStream::connect(address)
        .map_err(|e| EstimatorError::connection(address, e.to_string()))?;

    protocol::write_magic(&mut stream)?;
    let hello = WorkerHello {
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string()),
        pid: std::process::id(),
    };
    protocol::write_frame(&mut stream, MessageType::WorkerHello, &hello)?;
    tracing::info!(address, "worker connected to distributor");

    loop {
        let (message_type, body) = match protocol::read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::info!("distributor connection closed: {}", e);
                return Ok(());
            }
        };

        match message_type {
            MessageType::UnitAssign => {
                let unit: WorkUnit = protocol::decode(&body)?;
                tracing::debug!(unit = unit.id, layer = %unit.layer, "executing unit");
                let outcome = execute_unit(&executor, &unit);
                protocol::write_frame(
                    &mut stream,
                    MessageType::UnitResult,
                    &UnitReport {
                        unit_id: unit.id,
                        outcome,
                    },
                )?;
            }
            MessageType::WorkerShutdown => {
                tracing::info!("distributor requested shutdown");
                return Ok(());
            }
            MessageType::Ping => {
                protocol::write_frame(&mut stream, MessageType::Pong, &())?;
            }
            other => {
                return Err(EstimatorError::protocol(format!(
                    "unexpected frame {:?} from distributor",
                    other
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_unit;
    use crate::executor::FnExecutor;
    use crate::model::EstimatedValue;
    use std::time::Instant;

    fn sample_pool(kind: SchedulerKind) -> QueueWorkerPool {
        let config = WorkerPoolConfig {
            minimum_workers: 1,
            maximum_workers: 28,
            queue_name: Some("gpu-long".to_string()),
            setup_commands: vec![
                "conda activate forcebalance".to_string(),
                "module load mpi/openmpi-x86_64".to_string(),
            ],
            extra_scheduler_flags: vec!["--gres=gpu:1080ti:1".to_string()],
            idle_timeout_secs: 60,
        };
        let resources = ComputeResourceSpec {
            threads: 1,
            gpus: 1,
            memory_limit: 6 * 1024 * 1024 * 1024,
            wallclock_limit: 48 * 3600,
            visible_devices: vec![0],
            environment: [(
                "OE_LICENSE".to_string(),
                "/gpfs/licenses/oe_license.txt".to_string(),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        QueueWorkerPool::new(kind, config, resources)
    }

    #[test]
    fn test_slurm_script_content() {
        let pool = sample_pool(SchedulerKind::Slurm);
        let script = pool.generate_job_script("head01:9410");

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --cpus-per-task=1"));
        assert!(script.contains("#SBATCH --mem=6144M"));
        assert!(script.contains("#SBATCH --time=2-00:00:00"));
        assert!(script.contains("#SBATCH --partition=gpu-long"));
        assert!(script.contains("#SBATCH --gres=gpu:1"));
        assert!(script.contains("#SBATCH --gres=gpu:1080ti:1"));
        assert!(script.contains("export OE_LICENSE=\"/gpfs/licenses/oe_license.txt\""));
        assert!(script.contains("export CUDA_VISIBLE_DEVICES=0"));
        assert!(script.contains("propserve worker --connect head01:9410"));

        // setup commands appear verbatim and in order
        let conda = script.find("conda activate forcebalance").unwrap();
        let module = script.find("module load mpi/openmpi-x86_64").unwrap();
        assert!(conda < module);
        // launch command comes after setup
        assert!(module < script.find("propserve worker").unwrap());
    }

    #[test]
    fn test_pbs_and_sge_dialects() {
        let pbs = sample_pool(SchedulerKind::Pbs);
        let script = pbs.generate_job_script("head01:9410");
        assert!(script.contains("#PBS -l nodes=1:ppn=1"));
        assert!(script.contains("#PBS -l walltime=2-00:00:00"));
        assert!(script.contains("#PBS -q gpu-long"));
        assert!(script.contains("#PBS --gres=gpu:1080ti:1"));
        assert!(script.contains("cd $PBS_O_WORKDIR"));

        let sge = sample_pool(SchedulerKind::Sge);
        let script = sge.generate_job_script("head01:9410");
        assert!(script.contains("#$ -pe smp 1"));
        assert!(script.contains("#$ -q gpu-long"));
        assert!(script.contains("#$ -cwd"));
    }

    #[test]
    fn test_parse_submit_output() {
        assert_eq!(
            parse_submit_output(SchedulerKind::Slurm, "Submitted batch job 12345\n"),
            Some("12345".to_string())
        );
        assert_eq!(
            parse_submit_output(SchedulerKind::Pbs, "98765.head-node\n"),
            Some("98765.head-node".to_string())
        );
        assert_eq!(
            parse_submit_output(SchedulerKind::Lsf, "Job <555> is submitted to queue <gpu>.\n"),
            Some("555".to_string())
        );
        assert_eq!(
            parse_submit_output(
                SchedulerKind::Sge,
                "Your job 777 (\"propserve-worker\") has been submitted\n"
            ),
            Some("777".to_string())
        );
    }

    #[test]
    fn test_invalid_bounds_fail_provisioning() {
        let config = WorkerPoolConfig {
            minimum_workers: 4,
            maximum_workers: 2,
            ..Default::default()
        };
        let pool = QueueWorkerPool::new(
            SchedulerKind::Slurm,
            config,
            ComputeResourceSpec::default(),
        );

        let err = pool.start().unwrap_err();
        assert!(matches!(err, EstimatorError::Provisioning { .. }));
    }

    #[test]
    fn test_stop_is_idempotent_without_jobs() {
        let config = WorkerPoolConfig {
            minimum_workers: 0,
            maximum_workers: 2,
            ..Default::default()
        };
        let pool = QueueWorkerPool::new(
            SchedulerKind::Slurm,
            config,
            ComputeResourceSpec::default(),
        );

        pool.start().unwrap();
        pool.stop().unwrap();
        assert_eq!(pool.worker_count(), 0);
        pool.stop().unwrap();
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn test_distributor_round_trip_with_in_process_worker() {
        let config = WorkerPoolConfig {
            minimum_workers: 0,
            maximum_workers: 2,
            ..Default::default()
        };
        let pool = QueueWorkerPool::new(
            SchedulerKind::Slurm,
            config,
            ComputeResourceSpec::default(),
        )
        .with_bind_address("127.0.0.1:0");
        pool.start().unwrap();

        let addr = pool.distributor_addr().unwrap();
        let executor: Arc<dyn CalculationExecutor> = Arc::new(FnExecutor::new(|_, _, _| {
            Ok(EstimatedValue {
                value: 42.0,
                uncertainty: 0.5,
                unit: "kJ/mol".to_string(),
            })
        }));
        let worker = thread::spawn(move || run_worker(&addr.to_string(), executor));

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.shared.connected.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(pool.worker_count(), 1);

        let outcome = pool.submit(test_unit(1)).unwrap().wait();
        match outcome {
            UnitOutcome::Value(value) => assert_eq!(value.value, 42.0),
            other => panic!("expected value, got {:?}", other),
        }

        pool.stop().unwrap();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_dropped_connection_fails_in_flight_unit() {
        let config = WorkerPoolConfig {
            minimum_workers: 0,
            maximum_workers: 2,
            ..Default::default()
        };
        let pool = QueueWorkerPool::new(
            SchedulerKind::Slurm,
            config,
            ComputeResourceSpec::default(),
        )
        .with_bind_address("127.0.0.1:0");
        pool.start().unwrap();

        let addr = pool.distributor_addr().unwrap();
        // a worker that registers, takes one assignment and vanishes
        let rogue = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            protocol::write_magic(&mut stream).unwrap();
            protocol::write_frame(
                &mut stream,
                MessageType::WorkerHello,
                &WorkerHello {
                    hostname: "rogue".to_string(),
                    pid: 1,
                },
            )
            .unwrap();
            let _ = protocol::read_frame(&mut stream);
            // drop the stream without reporting an outcome
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.shared.connected.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }

        let outcome = pool.submit(test_unit(7)).unwrap().wait();
        assert!(matches!(outcome, UnitOutcome::WorkerFailure { .. }));

        rogue.join().unwrap();
        pool.stop().unwrap();
    }
}
