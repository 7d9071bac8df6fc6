//! Calculation schema routing
//!
//! A `CalculationSchema` is an opaque, named strategy blob; the core only
//! routes by `(layer, property type)` and carries the settings along to
//! whatever executes them. The `OptionsRegistry` holds the server-side
//! defaults; a request's `RequestOptions` can shadow them with overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EstimatorError, Result};
use crate::model::Request;

/// Named calculation strategy with nested stage settings
///
/// The settings blob typically carries thermalization/equilibration/
/// production step counts, time steps and output cadence; none of that is
/// interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationSchema {
    /// Strategy name
    pub name: String,
    /// Nested stage settings, opaque to the core
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl CalculationSchema {
    /// Create a schema with empty settings
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: serde_json::Value::Null,
        }
    }

    /// Create a schema with a settings blob
    pub fn with_settings(name: impl Into<String>, settings: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            settings,
        }
    }
}

/// Per-request calculation options
///
/// Layers are attempted in order, first success wins per item. Immutable
/// once the request is submitted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Calculation layers to attempt, in order
    pub calculation_layers: Vec<String>,
    /// Schema overrides keyed by layer, then property type
    #[serde(default)]
    schemas: HashMap<String, HashMap<String, CalculationSchema>>,
}

impl RequestOptions {
    /// Create empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or overwrite the schema used when `property_type` is
    /// attempted under `layer`
    pub fn add_schema(
        &mut self,
        layer: impl Into<String>,
        property_type: impl Into<String>,
        schema: CalculationSchema,
    ) {
        self.schemas
            .entry(layer.into())
            .or_default()
            .insert(property_type.into(), schema);
    }

    /// Look up an override for a `(layer, property type)` pair
    pub fn schema_for(&self, layer: &str, property_type: &str) -> Option<&CalculationSchema> {
        self.schemas.get(layer).and_then(|m| m.get(property_type))
    }
}

/// Server-side schema registry with per-property convergence tolerances
#[derive(Debug, Clone, Default)]
pub struct OptionsRegistry {
    schemas: HashMap<String, HashMap<String, CalculationSchema>>,
    tolerances: HashMap<String, f64>,
}

impl OptionsRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or overwrite a schema; last write wins, no versioning
    pub fn add_schema(
        &mut self,
        layer: impl Into<String>,
        property_type: impl Into<String>,
        schema: CalculationSchema,
    ) {
        self.schemas
            .entry(layer.into())
            .or_default()
            .insert(property_type.into(), schema);
    }

    /// Dispatch lookup; a miss is a validation error, never a default
    pub fn schema_for(&self, layer: &str, property_type: &str) -> Option<&CalculationSchema> {
        self.schemas.get(layer).and_then(|m| m.get(property_type))
    }

    /// Set the convergence tolerance for a property type
    pub fn set_tolerance(&mut self, property_type: impl Into<String>, tolerance: f64) {
        self.tolerances.insert(property_type.into(), tolerance);
    }

    /// Convergence tolerance for a property type, if configured
    pub fn tolerance_for(&self, property_type: &str) -> Option<f64> {
        self.tolerances.get(property_type).copied()
    }

    /// Resolve a schema for dispatch: request overrides shadow the registry
    pub fn resolve<'a>(
        &'a self,
        options: &'a RequestOptions,
        layer: &str,
        property_type: &str,
    ) -> Option<&'a CalculationSchema> {
        options
            .schema_for(layer, property_type)
            .or_else(|| self.schema_for(layer, property_type))
    }

    /// All-or-nothing validation at submission time
    ///
    /// Every listed layer must resolve a schema for every item's property
    /// type, otherwise nothing is dispatched.
    pub fn validate_request(&self, request: &Request) -> Result<()> {
        if request.options.calculation_layers.is_empty() {
            return Err(EstimatorError::validation(
                "request lists no calculation layers",
            ));
        }

        for item in &request.items {
            for layer in &request.options.calculation_layers {
                if self
                    .resolve(&request.options, layer, &item.property_type)
                    .is_none()
                {
                    return Err(EstimatorError::validation(format!(
                        "no schema registered for ('{}', '{}') required by item '{}'",
                        layer, item.property_type, item.id
                    )));
                }
            }
        }

        Ok(())
    }
}
