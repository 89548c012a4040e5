//! Records, tasks, services, compute history, managers, internal jobs -
//! the durable value types moved between the storage layer and the HTTP
//! surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::hashing;
use crate::molecule::MoleculeRef;
use crate::specification::Specification;
use crate::types::{
    InternalJobStatus, ManagerStatus, OutputType, PriorityEnum, RecordStatus, RecordType,
};

// ── Records ───────────────────────────────────────────────────

/// A stored record: common header plus the type-specific parts the core
/// tracks (specification id, ordered input molecules, opaque input data).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub record_type: RecordType,
    pub status: RecordStatus,
    pub owner_user: Option<String>,
    pub owner_group: Option<String>,
    /// Current assignee while running; last assignee afterwards.
    pub manager_name: Option<String>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub specification_id: i64,
    pub molecule_ids: Vec<i64>,
    /// Type-specific input payload (stoichiometry coefficients, chain
    /// metadata, dedup salt). Opaque to the core.
    pub input_data: Value,
    pub extras: Option<Value>,
    /// Final results. Written on completion; service types aggregate here.
    pub properties: Option<Value>,

    // projections, populated on request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_history: Option<Vec<ComputeHistoryEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceInfo>,
}

/// Input for one record in a bulk add. The specification carries the record
/// type; service types get a service row instead of a task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordAddInput {
    pub specification: Specification,
    /// Ordered input molecules (single for singlepoint/optimization, the
    /// image chain for neb, components for reaction/manybody).
    pub molecules: Vec<MoleculeRef>,
    /// Type-specific input payload; part of the dedup identity.
    #[serde(default)]
    pub input_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub priority: PriorityEnum,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_group: Option<String>,
}

fn default_tag() -> String {
    "*".to_string()
}

impl RecordAddInput {
    /// Dedup identity over the resolved input molecule ids plus the
    /// type-specific input payload. Combined with `(record_type,
    /// specification_id)` this keys the find-existing lookup.
    pub fn input_hash(molecule_ids: &[i64], input_data: &Value) -> String {
        let canonical = serde_json::json!({
            "molecule_ids": molecule_ids,
            "input_data": input_data,
        });
        hashing::hash_value(&canonical)
    }
}

/// Which related collections a record fetch should populate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordIncludes {
    pub compute_history: bool,
    pub task: bool,
    pub service: bool,
    /// Implies `compute_history`.
    pub outputs: bool,
}

impl RecordIncludes {
    /// Resolve `include`/`exclude` name lists the way the REST layer
    /// presents them. Unknown names are ignored.
    pub fn from_lists(include: &[String], exclude: &[String]) -> Self {
        let mut inc = if include.is_empty() {
            // default projection: everything except output blobs
            RecordIncludes {
                compute_history: true,
                task: true,
                service: true,
                outputs: false,
            }
        } else {
            let mut inc = RecordIncludes::default();
            for name in include {
                match name.as_str() {
                    "compute_history" => inc.compute_history = true,
                    "task" => inc.task = true,
                    "service" => inc.service = true,
                    "outputs" => {
                        inc.outputs = true;
                        inc.compute_history = true;
                    }
                    _ => {}
                }
            }
            inc
        };
        for name in exclude {
            match name.as_str() {
                "compute_history" => {
                    inc.compute_history = false;
                    inc.outputs = false;
                }
                "task" => inc.task = false,
                "service" => inc.service = false,
                "outputs" => inc.outputs = false,
                _ => {}
            }
        }
        inc
    }
}

/// Filters for the record query endpoint. All criteria are ANDed; cursor
/// pagination is by descending id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordQuery {
    #[serde(default)]
    pub record_id: Option<Vec<i64>>,
    #[serde(default)]
    pub record_type: Option<Vec<RecordType>>,
    #[serde(default)]
    pub status: Option<Vec<RecordStatus>>,
    #[serde(default)]
    pub manager_name: Option<Vec<String>>,
    #[serde(default)]
    pub owner_user: Option<Vec<String>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cursor: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Mutable knobs of a record. Status changes go through the dedicated
/// operations; tag/priority changes are only legal while waiting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordModification {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub delete_tag: bool,
    #[serde(default)]
    pub priority: Option<PriorityEnum>,
}

// ── Tasks ─────────────────────────────────────────────────────

/// Leaf queue row, 1:1 with a waiting/running record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub record_id: i64,
    pub required_programs: Vec<String>,
    pub tag: String,
    pub priority: PriorityEnum,
    pub created_on: DateTime<Utc>,
    /// Queue position within a priority class. Advances when the task is
    /// demoted so retries do not leapfrog fresh work.
    pub sort_date: DateTime<Utc>,
    pub function: String,
    pub function_kwargs: Value,
}

/// Claim projection handed to a manager: what to run, nothing more.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordTask {
    pub id: i64,
    pub record_id: i64,
    pub function: String,
    pub function_kwargs: Value,
    pub required_programs: Vec<String>,
}

// ── Services ──────────────────────────────────────────────────

/// Service scaffolding row for a composite record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: i64,
    pub record_id: i64,
    pub tag: String,
    pub priority: PriorityEnum,
    /// Whether child insertion shares existing records.
    pub find_existing: bool,
    pub iteration: i32,
    /// Opaque engine state; the iteration driver owns the envelope.
    pub service_state: Value,
    pub created_on: DateTime<Utc>,
}

/// One outstanding child of a service. Deleted when the child completes,
/// which is what makes the parent eligible for its next iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDependency {
    pub id: i64,
    pub service_id: i64,
    pub record_id: i64,
    pub extras: Value,
}

// ── Compute history ───────────────────────────────────────────

/// Append-only attempt log entry for a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeHistoryEntry {
    pub id: i64,
    pub record_id: i64,
    pub status: RecordStatus,
    pub manager_name: Option<String>,
    pub modified_on: DateTime<Utc>,
    pub provenance: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<OutputBlob>>,
}

/// Compressed output attached to one history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputBlob {
    pub id: i64,
    pub history_id: i64,
    pub output_type: OutputType,
    pub compression_type: crate::types::CompressionType,
    pub compression_level: i32,
    #[serde(with = "serde_bytes_base64")]
    pub data: Vec<u8>,
}

/// Output bytes travel base64 in JSON bodies.
mod serde_bytes_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

// ── Managers ──────────────────────────────────────────────────

/// A compute manager row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeManager {
    pub id: i64,
    pub name: String,
    pub cluster: String,
    pub hostname: String,
    pub username: Option<String>,
    pub manager_version: String,
    pub tags: Vec<String>,
    /// program name → version
    pub programs: BTreeMap<String, String>,
    pub status: ManagerStatus,

    pub claimed: i64,
    pub successes: i64,
    pub failures: i64,
    pub rejected: i64,

    pub active_tasks: i32,
    pub active_cores: i32,
    pub active_memory: f64,
    pub total_worker_walltime: f64,
    pub total_task_walltime: f64,

    pub created_on: DateTime<Utc>,
    /// Last heartbeat.
    pub modified_on: DateTime<Utc>,
}

/// Periodic snapshot of a manager's counters and gauges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerLogEntry {
    pub id: i64,
    pub manager_id: i64,
    pub timestamp: DateTime<Utc>,
    pub claimed: i64,
    pub successes: i64,
    pub failures: i64,
    pub rejected: i64,
    pub active_tasks: i32,
    pub active_cores: i32,
    pub active_memory: f64,
    pub total_worker_walltime: f64,
    pub total_task_walltime: f64,
}

/// Manager query filters; cursor pagination by descending id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerQuery {
    #[serde(default)]
    pub manager_id: Option<Vec<i64>>,
    #[serde(default)]
    pub name: Option<Vec<String>>,
    #[serde(default)]
    pub cluster: Option<Vec<String>>,
    #[serde(default)]
    pub hostname: Option<Vec<String>>,
    #[serde(default)]
    pub status: Option<Vec<ManagerStatus>>,
    #[serde(default)]
    pub modified_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cursor: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

// ── Internal jobs ─────────────────────────────────────────────

/// A durable background job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalJob {
    pub id: i64,
    pub name: String,
    pub status: InternalJobStatus,
    pub added_date: DateTime<Utc>,
    pub scheduled_date: DateTime<Utc>,
    pub started_date: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub ended_date: Option<DateTime<Utc>>,
    pub runner_hostname: Option<String>,
    pub runner_uuid: Option<String>,
    pub progress: i32,
    pub function: String,
    pub kwargs: Value,
    pub after_function: Option<String>,
    pub after_function_kwargs: Option<Value>,
    pub result: Option<Value>,
    pub user_name: Option<String>,
    pub unique_name: Option<String>,
    pub serial_group: Option<String>,
}

/// Everything needed to enqueue an internal job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalJobSpec {
    pub name: String,
    pub scheduled_date: DateTime<Utc>,
    pub function: String,
    pub kwargs: Value,
    #[serde(default)]
    pub user_name: Option<String>,
    /// If set and a non-terminal row with this name exists, the add is a
    /// no-op.
    #[serde(default)]
    pub unique_name: Option<String>,
    #[serde(default)]
    pub after_function: Option<String>,
    #[serde(default)]
    pub after_function_kwargs: Option<Value>,
    /// At most one running job per serial group.
    #[serde(default)]
    pub serial_group: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_hash_order_sensitive() {
        let a = RecordAddInput::input_hash(&[1, 2], &json!({}));
        let b = RecordAddInput::input_hash(&[2, 1], &json!({}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_input_hash_includes_input_data() {
        let a = RecordAddInput::input_hash(&[1], &json!({"coefficient": 1.0}));
        let b = RecordAddInput::input_hash(&[1], &json!({"coefficient": -1.0}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_includes_default_projection() {
        let inc = RecordIncludes::from_lists(&[], &[]);
        assert!(inc.compute_history && inc.task && inc.service);
        assert!(!inc.outputs);
    }

    #[test]
    fn test_includes_outputs_pull_history() {
        let inc = RecordIncludes::from_lists(&["outputs".into()], &[]);
        assert!(inc.outputs && inc.compute_history);
        assert!(!inc.task);
    }

    #[test]
    fn test_excludes_override() {
        let inc = RecordIncludes::from_lists(&[], &["compute_history".into()]);
        assert!(!inc.compute_history && !inc.outputs);
        assert!(inc.task);
    }

    #[test]
    fn test_output_blob_bytes_round_trip() {
        let blob = OutputBlob {
            id: 1,
            history_id: 2,
            output_type: OutputType::Stdout,
            compression_type: crate::types::CompressionType::None,
            compression_level: 0,
            data: (0u8..=255).collect(),
        };
        let text = serde_json::to_string(&blob).unwrap();
        let back: OutputBlob = serde_json::from_str(&text).unwrap();
        assert_eq!(back.data, blob.data);
    }
}
