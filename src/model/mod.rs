//! Request and result data model
//!
//! These are the types exchanged between client, server and workers.
//! Everything here serializes to JSON for the wire and for archival;
//! a serialize/deserialize round trip reproduces an equivalent object.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{IoResultExt, Result};
use crate::schema::RequestOptions;

/// One property-estimation item within a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyItem {
    /// Stable identifier within the data set
    pub id: String,
    /// Property type used for schema routing (e.g. "HostGuestBindingAffinity")
    pub property_type: String,
    /// Opaque description of the physical system; passed through unexamined
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl PropertyItem {
    /// Create an item with empty metadata
    pub fn new(id: impl Into<String>, property_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            property_type: property_type.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Supplies the ordered sequence of items for a request
pub trait DatasetProvider {
    /// Enumerate the items to estimate, in submission order
    fn enumerate_items(&self) -> Vec<PropertyItem>;
}

/// Vec-backed data set with JSON persistence
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertyDataSet {
    /// Items in submission order
    pub items: Vec<PropertyItem>,
}

impl PropertyDataSet {
    /// Create an empty data set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item
    pub fn add(&mut self, item: PropertyItem) {
        self.items.push(item);
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the data set is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Write the data set to a JSON file
    pub fn save(&self, path: &Path, pretty: bool) -> Result<()> {
        save_json(self, path, pretty)
    }

    /// Load a data set from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

impl DatasetProvider for PropertyDataSet {
    fn enumerate_items(&self) -> Vec<PropertyItem> {
        self.items.clone()
    }
}

/// Opaque force-field reference, identified by name and passed through
/// unexamined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceFieldSource {
    /// Source name (e.g. file stem or registry key)
    pub name: String,
    /// Serialized force-field content
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ForceFieldSource {
    /// Create a named source with empty payload
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// Load a force-field source from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

/// A submitted estimation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Unique request id
    pub id: String,
    /// Ordered property-estimation items
    pub items: Vec<PropertyItem>,
    /// Force-field reference applied to every item
    pub force_field: ForceFieldSource,
    /// Calculation layers and schema overrides; immutable once attached
    pub options: RequestOptions,
    /// Submission time
    pub created_at: DateTime<Utc>,
}

impl Request {
    /// Create a request with a fresh id
    pub fn new(
        items: Vec<PropertyItem>,
        force_field: ForceFieldSource,
        options: RequestOptions,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            items,
            force_field,
            options,
            created_at: Utc::now(),
        }
    }

    /// Write the request to a JSON file
    pub fn save(&self, path: &Path, pretty: bool) -> Result<()> {
        save_json(self, path, pretty)
    }

    /// Load a request from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

/// Request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    /// Accepted by the server, not yet validated
    Received,
    /// Being validated against the options registry
    Validating,
    /// Decomposed into calculation units, not yet executing
    Dispatching,
    /// Units in flight on the worker pool
    Executing,
    /// All units finished, results being assembled
    Aggregating,
    /// Every item has a terminal result
    Completed,
    /// Cancelled or aborted before completion
    Failed,
}

impl RequestState {
    /// Whether the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

/// A computed value with its uncertainty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatedValue {
    /// Central value
    pub value: f64,
    /// One-sigma uncertainty
    pub uncertainty: f64,
    /// Unit string, opaque to the core
    pub unit: String,
}

/// Terminal outcome for one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ItemOutcome {
    /// The item was estimated successfully
    Value(EstimatedValue),
    /// No layer could produce a value
    Error {
        /// Human-readable reason
        reason: String,
    },
}

impl ItemOutcome {
    /// Whether the outcome carries a value
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Value(_))
    }
}

/// Terminal result for one item of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationResult {
    /// Index of the item within the request
    pub item_index: usize,
    /// Item id copied from the request
    pub item_id: String,
    /// Property type copied from the request
    pub property_type: String,
    /// Layer that produced the value, if any succeeded
    pub layer: Option<String>,
    /// Calculation units dispatched for this item, retries included
    pub attempts: u32,
    /// Value or error record
    pub outcome: ItemOutcome,
}

/// Aggregated results for a request, or a partial snapshot of them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    /// Request id the results belong to
    pub request_id: String,
    /// Lifecycle state at snapshot time; non-terminal means still running
    pub state: RequestState,
    /// Per-item results; covers every item once the request is terminal
    pub results: Vec<EstimationResult>,
    /// Completion time, set once terminal
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResultSet {
    /// Whether the request was still running at snapshot time
    pub fn is_running(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Results that carry a value
    pub fn successes(&self) -> impl Iterator<Item = &EstimationResult> {
        self.results.iter().filter(|r| r.outcome.is_success())
    }

    /// Results that ended in an error record
    pub fn failures(&self) -> impl Iterator<Item = &EstimationResult> {
        self.results.iter().filter(|r| !r.outcome.is_success())
    }

    /// Write the result set to a JSON file
    pub fn save(&self, path: &Path, pretty: bool) -> Result<()> {
        save_json(self, path, pretty)
    }

    /// Load a result set from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

/// Serialize a value to a JSON file, optionally pretty-printed
pub fn save_json<T: Serialize>(value: &T, path: &Path, pretty: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
    }

    let content = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };

    fs::write(path, content).with_path(path)
}

/// Deserialize a value from a JSON file
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).with_path(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CalculationSchema, RequestOptions};

    fn sample_request() -> Request {
        let mut options = RequestOptions::new();
        options.calculation_layers = vec!["reweighting".to_string(), "simulation".to_string()];
        options.add_schema(
            "simulation",
            "Density",
            CalculationSchema::named("npt-production"),
        );

        Request::new(
            vec![
                PropertyItem::new("mol-001", "Density"),
                PropertyItem::new("mol-002", "EnthalpyOfVaporization"),
            ],
            ForceFieldSource::named("openff-2.0.0"),
            options,
        )
    }

    #[test]
    fn test_request_round_trip() {
        let request = sample_request();
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn test_result_set_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");

        let results = ResultSet {
            request_id: "req-1".to_string(),
            state: RequestState::Completed,
            results: vec![EstimationResult {
                item_index: 0,
                item_id: "mol-001".to_string(),
                property_type: "Density".to_string(),
                layer: Some("simulation".to_string()),
                attempts: 1,
                outcome: ItemOutcome::Value(EstimatedValue {
                    value: 997.2,
                    uncertainty: 1.4,
                    unit: "kg/m^3".to_string(),
                }),
            }],
            completed_at: Some(Utc::now()),
        };

        results.save(&path, true).unwrap();
        let loaded = ResultSet::load(&path).unwrap();
        assert_eq!(results, loaded);
        assert!(!loaded.is_running());
        assert_eq!(loaded.successes().count(), 1);
        assert_eq!(loaded.failures().count(), 0);
    }

    #[test]
    fn test_data_set_enumeration_preserves_order() {
        let mut set = PropertyDataSet::new();
        set.add(PropertyItem::new("a", "Density"));
        set.add(PropertyItem::new("b", "Density"));
        set.add(PropertyItem::new("c", "DielectricConstant"));

        let ids: Vec<String> = set.enumerate_items().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_terminal_states() {
        assert!(RequestState::Completed.is_terminal());
        assert!(RequestState::Failed.is_terminal());
        assert!(!RequestState::Executing.is_terminal());
        assert!(!RequestState::Dispatching.is_terminal());
    }
}
