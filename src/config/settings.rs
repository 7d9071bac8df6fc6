//! CLI configuration
//!
//! Defines the command-line surface: running the server with a local or
//! queue-provisioned worker pool, submitting data sets, polling and
//! retrieving requests, and the queue-job worker entry point.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;

use crate::backend::SchedulerKind;
use crate::config::resources::{
    parse_memory, parse_wallclock, ComputeResourceSpec, ConnectionOptions, GpuToolkit,
    WorkerPoolConfig,
};
use crate::error::{EstimatorError, IoResultExt, Result};
use crate::schema::{CalculationSchema, OptionsRegistry};

/// propserve - distributed property estimation for HPC environments
#[derive(Parser, Debug, Clone)]
#[command(name = "propserve")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Distributed property-estimation orchestration for HPC")]
pub struct CliArgs {
    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the estimation server with a worker pool
    Serve(ServeArgs),

    /// Submit a data set for estimation
    Submit(SubmitArgs),

    /// Poll the state of a request
    Status {
        /// Request id returned at submission
        request_id: String,
        /// Server address (host:port)
        #[arg(long, default_value = "127.0.0.1:8000")]
        server: String,
    },

    /// Retrieve results for a request
    Retrieve {
        /// Request id returned at submission
        request_id: String,
        /// Server address (host:port)
        #[arg(long, default_value = "127.0.0.1:8000")]
        server: String,
        /// Block until the request completes
        #[arg(long)]
        wait: bool,
        /// Write the result set to a JSON file instead of stdout
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Cancel an in-flight request
    Cancel {
        /// Request id returned at submission
        request_id: String,
        /// Server address (host:port)
        #[arg(long, default_value = "127.0.0.1:8000")]
        server: String,
    },

    /// Queue-job entry point: dial a pool distributor and serve units
    Worker(WorkerArgs),
}

/// Worker pool provisioning substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Threads on the local machine
    Local,
    /// Slurm queue submission
    Slurm,
    /// PBS/Torque queue submission
    Pbs,
    /// LSF queue submission
    Lsf,
    /// SGE/UGE queue submission
    Sge,
}

impl BackendKind {
    /// The scheduler dialect, if queue-based
    pub fn scheduler(&self) -> Option<SchedulerKind> {
        match self {
            BackendKind::Local => None,
            BackendKind::Slurm => Some(SchedulerKind::Slurm),
            BackendKind::Pbs => Some(SchedulerKind::Pbs),
            BackendKind::Lsf => Some(SchedulerKind::Lsf),
            BackendKind::Sge => Some(SchedulerKind::Sge),
        }
    }
}

/// GPU toolkit choice on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GpuToolkitArg {
    /// NVIDIA CUDA
    Cuda,
    /// OpenCL
    Opencl,
}

impl From<GpuToolkitArg> for GpuToolkit {
    fn from(value: GpuToolkitArg) -> Self {
        match value {
            GpuToolkitArg::Cuda => GpuToolkit::Cuda,
            GpuToolkitArg::Opencl => GpuToolkit::OpenCl,
        }
    }
}

/// Arguments for `propserve serve`
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Host address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(long, default_value = "8000")]
    pub port: u16,

    /// Worker pool substrate
    #[arg(long, value_enum, default_value = "local")]
    pub backend: BackendKind,

    /// Minimum number of workers
    #[arg(long, default_value = "1", value_name = "NUM")]
    pub min_workers: usize,

    /// Maximum number of workers (0 = one per CPU)
    #[arg(long, default_value = "0", value_name = "NUM")]
    pub max_workers: usize,

    /// Threads per worker
    #[arg(long, default_value = "1", value_name = "NUM")]
    pub threads: usize,

    /// GPUs per worker
    #[arg(long, default_value = "0", value_name = "NUM")]
    pub gpus: u32,

    /// Preferred GPU toolkit
    #[arg(long, value_enum, default_value = "cuda")]
    pub gpu_toolkit: GpuToolkitArg,

    /// Devices exposed to each worker (repeatable)
    #[arg(long = "visible-device", value_name = "INDEX")]
    pub visible_devices: Vec<u32>,

    /// Memory ceiling per worker (e.g. 6G, 512M)
    #[arg(long, default_value = "4G", value_name = "SIZE")]
    pub memory_limit: String,

    /// Wall-clock limit per worker (HH:MM:SS or D-HH:MM:SS)
    #[arg(long, default_value = "01:00:00", value_name = "TIME")]
    pub wallclock: String,

    /// Queue/partition name for queue-based backends
    #[arg(long, value_name = "NAME")]
    pub queue: Option<String>,

    /// File whose lines become environment-setup commands in job scripts
    #[arg(long, value_name = "PATH")]
    pub setup_script: Option<PathBuf>,

    /// Extra scheduler flag emitted verbatim as a directive (repeatable)
    #[arg(long = "extra-flag", value_name = "FLAG", allow_hyphen_values = true)]
    pub extra_flags: Vec<String>,

    /// Seconds an idle worker above the minimum lingers before teardown
    #[arg(long, default_value = "60", value_name = "SECS")]
    pub idle_timeout: u64,

    /// Directory request and result archives are written to
    #[arg(long, default_value = "working-data", value_name = "PATH")]
    pub working_dir: PathBuf,

    /// Extra attempts granted to a unit after a worker failure
    #[arg(long, default_value = "1", value_name = "NUM")]
    pub retry_limit: u32,

    /// Keep per-request archives after results are written
    #[arg(long)]
    pub keep_working_files: bool,

    /// Command run per calculation unit (JSON on stdin, value on stdout)
    #[arg(long, value_name = "CMD")]
    pub executor_cmd: String,

    /// Registry file mapping layer -> property type -> schema
    #[arg(long, value_name = "PATH")]
    pub schemas: Option<PathBuf>,
}

impl ServeArgs {
    /// The listening address
    pub fn connection(&self) -> ConnectionOptions {
        ConnectionOptions::new(self.host.clone(), self.port)
    }

    /// Build the per-worker resource spec
    pub fn resources(&self) -> Result<ComputeResourceSpec> {
        let memory_limit = parse_memory(&self.memory_limit).ok_or_else(|| {
            EstimatorError::config(format!("invalid memory size '{}'", self.memory_limit))
        })?;
        let wallclock_limit = parse_wallclock(&self.wallclock).ok_or_else(|| {
            EstimatorError::config(format!("invalid wall-clock limit '{}'", self.wallclock))
        })?;

        let spec = ComputeResourceSpec {
            threads: self.threads,
            gpus: self.gpus,
            gpu_toolkit: self.gpu_toolkit.into(),
            memory_limit,
            wallclock_limit,
            visible_devices: self.visible_devices.clone(),
            environment: Default::default(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Build the pool configuration
    pub fn pool_config(&self) -> Result<WorkerPoolConfig> {
        let maximum_workers = if self.max_workers == 0 {
            num_cpus::get()
        } else {
            self.max_workers
        };

        let setup_commands = match &self.setup_script {
            Some(path) => fs::read_to_string(path)
                .with_path(path)?
                .lines()
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };

        let config = WorkerPoolConfig {
            minimum_workers: self.min_workers,
            maximum_workers,
            queue_name: self.queue.clone(),
            setup_commands,
            extra_scheduler_flags: self.extra_flags.clone(),
            idle_timeout_secs: self.idle_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load the schema registry, empty when no file is given
    pub fn registry(&self) -> Result<OptionsRegistry> {
        let mut registry = OptionsRegistry::new();

        if let Some(path) = &self.schemas {
            let content = fs::read_to_string(path).with_path(path)?;
            let layers: std::collections::HashMap<
                String,
                std::collections::HashMap<String, CalculationSchema>,
            > = serde_json::from_str(&content)?;

            for (layer, properties) in layers {
                for (property_type, schema) in properties {
                    registry.add_schema(&layer, property_type, schema);
                }
            }
        }

        Ok(registry)
    }
}

/// Arguments for `propserve submit`
#[derive(Args, Debug, Clone)]
pub struct SubmitArgs {
    /// Data set JSON file (ordered property items)
    #[arg(value_name = "DATASET")]
    pub dataset: PathBuf,

    /// Force-field source JSON file
    #[arg(long, value_name = "PATH")]
    pub force_field: PathBuf,

    /// Request options JSON file (layers and schema overrides)
    #[arg(long, value_name = "PATH")]
    pub options: PathBuf,

    /// Server address (host:port)
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub server: String,

    /// Block until results are available
    #[arg(long)]
    pub wait: bool,

    /// Write the result set to a JSON file (requires --wait)
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

/// Arguments for `propserve worker`
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Distributor address to dial (host:port)
    #[arg(long, value_name = "ADDR")]
    pub connect: String,

    /// Command run per calculation unit (JSON on stdin, value on stdout)
    #[arg(long, value_name = "CMD")]
    pub executor_cmd: String,
}

/// Parse a `host:port` server address
pub fn parse_server_address(address: &str) -> Result<ConnectionOptions> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| EstimatorError::config(format!("invalid server address '{}'", address)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| EstimatorError::config(format!("invalid port in '{}'", address)))?;
    Ok(ConnectionOptions::new(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_address() {
        let options = parse_server_address("calc01:3241").unwrap();
        assert_eq!(options.host, "calc01");
        assert_eq!(options.port, 3241);

        assert!(parse_server_address("calc01").is_err());
        assert!(parse_server_address("calc01:notaport").is_err());
    }

    #[test]
    fn test_serve_args_build_configs() {
        let args = CliArgs::parse_from([
            "propserve",
            "serve",
            "--backend",
            "slurm",
            "--min-workers",
            "1",
            "--max-workers",
            "28",
            "--gpus",
            "1",
            "--memory-limit",
            "6G",
            "--wallclock",
            "48:00:00",
            "--queue",
            "gpu-long",
            "--extra-flag",
            "--gres=gpu:1080ti:1",
            "--executor-cmd",
            "estimate-unit",
        ]);

        let Commands::Serve(serve) = args.command else {
            panic!("expected serve subcommand");
        };

        assert_eq!(serve.backend.scheduler(), Some(SchedulerKind::Slurm));

        let resources = serve.resources().unwrap();
        assert_eq!(resources.gpus, 1);
        assert_eq!(resources.memory_limit, 6 * 1024 * 1024 * 1024);
        assert_eq!(resources.wallclock_limit, 48 * 3600);

        let pool = serve.pool_config().unwrap();
        assert_eq!(pool.minimum_workers, 1);
        assert_eq!(pool.maximum_workers, 28);
        assert_eq!(pool.queue_name.as_deref(), Some("gpu-long"));
        assert_eq!(pool.extra_scheduler_flags, vec!["--gres=gpu:1080ti:1"]);
    }

    #[test]
    fn test_invalid_memory_rejected() {
        let args = CliArgs::parse_from([
            "propserve",
            "serve",
            "--memory-limit",
            "lots",
            "--executor-cmd",
            "estimate-unit",
        ]);

        let Commands::Serve(serve) = args.command else {
            panic!("expected serve subcommand");
        };
        assert!(serve.resources().is_err());
    }

    #[test]
    fn test_registry_defaults_to_empty() {
        let args = CliArgs::parse_from([
            "propserve",
            "serve",
            "--executor-cmd",
            "estimate-unit",
        ]);

        let Commands::Serve(serve) = args.command else {
            panic!("expected serve subcommand");
        };
        let registry = serve.registry().unwrap();
        assert!(registry.schema_for("simulation", "Density").is_none());
    }
}
