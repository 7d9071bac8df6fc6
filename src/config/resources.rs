//! Worker resource and pool configuration
//!
//! `ComputeResourceSpec` describes what one worker may consume;
//! `WorkerPoolConfig` bounds how many workers a pool may run and how
//! queue-based pools provision them. Device visibility and license paths
//! are explicit fields here rather than ambient process environment, so
//! pool instances are independently testable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EstimatorError, Result};

/// GPU toolkit a worker should prefer when GPUs are requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuToolkit {
    /// NVIDIA CUDA
    #[default]
    Cuda,
    /// OpenCL
    OpenCl,
}

impl GpuToolkit {
    /// Toolkit name as used in logs and job scripts
    pub fn name(&self) -> &'static str {
        match self {
            GpuToolkit::Cuda => "CUDA",
            GpuToolkit::OpenCl => "OpenCL",
        }
    }
}

/// Resources one worker may consume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeResourceSpec {
    /// Threads per worker
    pub threads: usize,
    /// GPUs per worker
    pub gpus: u32,
    /// Preferred GPU toolkit
    pub gpu_toolkit: GpuToolkit,
    /// Memory ceiling per worker (bytes)
    pub memory_limit: u64,
    /// Wall-clock limit per worker (seconds)
    pub wallclock_limit: u64,
    /// Explicit device visibility (empty = substrate decides)
    #[serde(default)]
    pub visible_devices: Vec<u32>,
    /// Environment variables exported before the worker starts
    /// (license paths, toolkit configuration)
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl Default for ComputeResourceSpec {
    fn default() -> Self {
        Self {
            threads: 1,
            gpus: 0,
            gpu_toolkit: GpuToolkit::default(),
            memory_limit: 4 * 1024 * 1024 * 1024, // 4 GB
            wallclock_limit: 3600,                // 1 hour
            visible_devices: Vec::new(),
            environment: HashMap::new(),
        }
    }
}

impl ComputeResourceSpec {
    /// Check the resource invariants
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(EstimatorError::config(
                "worker thread count must be at least 1",
            ));
        }
        if self.memory_limit == 0 {
            return Err(EstimatorError::config("memory ceiling must be positive"));
        }
        if self.wallclock_limit == 0 {
            return Err(EstimatorError::config("wall-clock limit must be positive"));
        }
        Ok(())
    }
}

/// Worker pool bounds and queue provisioning options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Minimum number of workers kept alive
    pub minimum_workers: usize,
    /// Maximum number of workers the pool may reach
    pub maximum_workers: usize,
    /// Queue/partition name for queue-based provisioning
    pub queue_name: Option<String>,
    /// Environment-setup commands emitted verbatim into job scripts,
    /// executed before each worker starts
    #[serde(default)]
    pub setup_commands: Vec<String>,
    /// Extra scheduler flags emitted verbatim as directives
    #[serde(default)]
    pub extra_scheduler_flags: Vec<String>,
    /// How long an idle worker above the minimum lingers before teardown
    /// (seconds)
    pub idle_timeout_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            minimum_workers: 1,
            maximum_workers: 1,
            queue_name: None,
            setup_commands: Vec::new(),
            extra_scheduler_flags: Vec::new(),
            idle_timeout_secs: 60,
        }
    }
}

impl WorkerPoolConfig {
    /// Check the pool invariants
    pub fn validate(&self) -> Result<()> {
        if self.maximum_workers == 0 {
            return Err(EstimatorError::config("maximum worker count must be at least 1"));
        }
        if self.minimum_workers > self.maximum_workers {
            return Err(EstimatorError::config(format!(
                "minimum worker count {} exceeds maximum {}",
                self.minimum_workers, self.maximum_workers
            )));
        }
        Ok(())
    }

    /// Clamp a requested worker count to the configured bounds
    pub fn clamp(&self, target: usize) -> usize {
        target.clamp(self.minimum_workers, self.maximum_workers)
    }
}

/// Host and port the server listens on and clients connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Host address
    pub host: String,
    /// Port
    pub port: u16,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl ConnectionOptions {
    /// Create connection options for a host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The `host:port` address string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse a memory size with an optional G/M/K suffix (e.g. "6G", "512M")
pub fn parse_memory(s: &str) -> Option<u64> {
    let s = s.trim().to_uppercase();
    let (num_str, mult) = if let Some(stripped) = s.strip_suffix('G') {
        (stripped, 1024 * 1024 * 1024u64)
    } else if let Some(stripped) = s.strip_suffix('M') {
        (stripped, 1024 * 1024u64)
    } else if let Some(stripped) = s.strip_suffix('K') {
        (stripped, 1024u64)
    } else {
        (s.as_str(), 1u64)
    };

    num_str.parse::<u64>().ok().map(|n| n * mult)
}

/// Parse a wall-clock limit in `D-HH:MM:SS` or `HH:MM:SS` (or `HH:MM`)
/// form into seconds
pub fn parse_wallclock(s: &str) -> Option<u64> {
    let parts: Vec<&str> = s.trim().split('-').collect();
    let (days, time_str) = if parts.len() == 2 {
        (parts[0].parse::<u64>().ok()?, parts[1])
    } else {
        (0, parts[0])
    };

    let time_parts: Vec<&str> = time_str.split(':').collect();
    let (hours, minutes, seconds) = match time_parts.len() {
        3 => (
            time_parts[0].parse::<u64>().ok()?,
            time_parts[1].parse::<u64>().ok()?,
            time_parts[2].parse::<u64>().ok()?,
        ),
        2 => (
            time_parts[0].parse::<u64>().ok()?,
            time_parts[1].parse::<u64>().ok()?,
            0,
        ),
        _ => return None,
    };

    Some(days * 86400 + hours * 3600 + minutes * 60 + seconds)
}

/// Format seconds as `D-HH:MM:SS` (or `HH:MM:SS` under a day)
pub fn format_wallclock(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}-{:02}:{:02}:{:02}", days, hours, minutes, secs)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_invariants() {
        let spec = ComputeResourceSpec::default();
        assert!(spec.validate().is_ok());

        let mut bad = spec.clone();
        bad.memory_limit = 0;
        assert!(bad.validate().is_err());

        let mut bad = spec.clone();
        bad.wallclock_limit = 0;
        assert!(bad.validate().is_err());

        let mut bad = spec;
        bad.threads = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_pool_invariants() {
        let mut config = WorkerPoolConfig {
            minimum_workers: 1,
            maximum_workers: 4,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.minimum_workers = 8;
        assert!(config.validate().is_err());

        config.minimum_workers = 0;
        config.maximum_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clamp() {
        let config = WorkerPoolConfig {
            minimum_workers: 1,
            maximum_workers: 4,
            ..Default::default()
        };

        assert_eq!(config.clamp(0), 1);
        assert_eq!(config.clamp(3), 3);
        assert_eq!(config.clamp(10), 4);
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("6G"), Some(6 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("512M"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory("1024K"), Some(1024 * 1024));
        assert_eq!(parse_memory("4096"), Some(4096));
        assert_eq!(parse_memory("lots"), None);
    }

    #[test]
    fn test_wallclock_round_trip() {
        assert_eq!(parse_wallclock("48:00:00"), Some(48 * 3600));
        assert_eq!(parse_wallclock("2-01:30:15"), Some(2 * 86400 + 3600 + 30 * 60 + 15));
        assert_eq!(parse_wallclock("01:30"), Some(5400));
        assert_eq!(parse_wallclock("nope"), None);

        assert_eq!(format_wallclock(3600), "01:00:00");
        assert_eq!(format_wallclock(90061), "1-01:01:01");
        assert_eq!(parse_wallclock(&format_wallclock(48 * 3600)), Some(48 * 3600));
    }

    #[test]
    fn test_connection_address() {
        let options = ConnectionOptions::new("calc01", 3241);
        assert_eq!(options.address(), "calc01:3241");
        assert_eq!(ConnectionOptions::default().address(), "127.0.0.1:8000");
    }
}
