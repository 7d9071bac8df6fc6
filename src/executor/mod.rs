//! Black-box calculation execution
//!
//! The orchestration core never interprets a schema; it hands the schema,
//! the item and the force field to a `CalculationExecutor` and records
//! whatever comes back. Deployments embed their own engine behind this
//! trait; the bundled `CommandExecutor` shells out to an external program.

use serde::Serialize;
use std::process::{Command, Stdio};

use crate::error::{EstimatorError, Result};
use crate::model::{EstimatedValue, ForceFieldSource, PropertyItem};
use crate::schema::CalculationSchema;

/// Executes one calculation unit
///
/// An `Err(Calculation { .. })` means the executor could not produce a
/// value for the item and becomes the attempt's recorded failure; any
/// other error is treated as a worker-level fault.
pub trait CalculationExecutor: Send + Sync {
    /// Produce a value with uncertainty for one item under one schema
    fn execute(
        &self,
        schema: &CalculationSchema,
        item: &PropertyItem,
        force_field: &ForceFieldSource,
    ) -> Result<EstimatedValue>;
}

/// Closure-backed executor, mainly for tests and embedding
pub struct FnExecutor<F>(F);

impl<F> FnExecutor<F>
where
    F: Fn(&CalculationSchema, &PropertyItem, &ForceFieldSource) -> Result<EstimatedValue>
        + Send
        + Sync,
{
    /// Wrap a closure as an executor
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> CalculationExecutor for FnExecutor<F>
where
    F: Fn(&CalculationSchema, &PropertyItem, &ForceFieldSource) -> Result<EstimatedValue>
        + Send
        + Sync,
{
    fn execute(
        &self,
        schema: &CalculationSchema,
        item: &PropertyItem,
        force_field: &ForceFieldSource,
    ) -> Result<EstimatedValue> {
        (self.0)(schema, item, force_field)
    }
}

/// Payload written to an external executor's stdin
#[derive(Serialize)]
struct UnitPayload<'a> {
    schema: &'a CalculationSchema,
    item: &'a PropertyItem,
    force_field: &'a ForceFieldSource,
}

/// Runs an external command per unit
///
/// The unit payload is written to the command's stdin as JSON and an
/// `EstimatedValue` is read back from its stdout. A non-zero exit status
/// or unparsable output is recorded as a calculation failure for the item.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    /// Build from a whitespace-separated command line
    pub fn new(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| EstimatorError::config("executor command is empty"))?;

        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl CalculationExecutor for CommandExecutor {
    fn execute(
        &self,
        schema: &CalculationSchema,
        item: &PropertyItem,
        force_field: &ForceFieldSource,
    ) -> Result<EstimatedValue> {
        let payload = serde_json::to_vec(&UnitPayload {
            schema,
            item,
            force_field,
        })?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EstimatorError::worker(format!("failed to spawn '{}': {}", self.program, e))
            })?;

        if let Some(stdin) = child.stdin.as_mut() {
            use std::io::Write;
            stdin
                .write_all(&payload)
                .map_err(|e| EstimatorError::worker(format!("executor stdin closed: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| EstimatorError::worker(format!("executor did not exit: {}", e)))?;

        if !output.status.success() {
            return Err(EstimatorError::calculation(
                &item.property_type,
                format!(
                    "'{}' exited with {}: {}",
                    self.program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            EstimatorError::calculation(
                &item.property_type,
                format!("'{}' produced unparsable output: {}", self.program, e),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inputs() -> (CalculationSchema, PropertyItem, ForceFieldSource) {
        (
            CalculationSchema::named("npt-production"),
            PropertyItem::new("mol-001", "Density"),
            ForceFieldSource::named("openff-2.0.0"),
        )
    }

    #[test]
    fn test_fn_executor() {
        let executor = FnExecutor::new(|schema, _, _| {
            Ok(EstimatedValue {
                value: schema.name.len() as f64,
                uncertainty: 0.0,
                unit: "dimensionless".to_string(),
            })
        });

        let (schema, item, ff) = sample_inputs();
        let value = executor.execute(&schema, &item, &ff).unwrap();
        assert_eq!(value.value, "npt-production".len() as f64);
    }

    #[test]
    #[cfg(unix)]
    fn test_command_executor_parses_stdout() {
        let executor = CommandExecutor {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"cat > /dev/null; echo '{"value":1.5,"uncertainty":0.1,"unit":"kJ/mol"}'"#
                    .to_string(),
            ],
        };

        let (schema, item, ff) = sample_inputs();
        let value = executor.execute(&schema, &item, &ff).unwrap();
        assert_eq!(value.value, 1.5);
        assert_eq!(value.unit, "kJ/mol");
    }

    #[test]
    #[cfg(unix)]
    fn test_command_executor_failure_is_calculation_error() {
        let executor = CommandExecutor {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "cat > /dev/null; echo 'no license' >&2; exit 3".to_string(),
            ],
        };

        let (schema, item, ff) = sample_inputs();
        let err = executor.execute(&schema, &item, &ff).unwrap_err();
        assert!(matches!(err, EstimatorError::Calculation { .. }));
        assert!(err.to_string().contains("no license"));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandExecutor::new("   ").is_err());
    }
}
