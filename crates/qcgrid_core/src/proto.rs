//! Request/response bodies for the REST surface.
//!
//! Bodies travel as JSON or MsgPack; the polymorphic discriminators are
//! `record_type` (specifications) and `schema_name` (result payloads).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::QcGridError;
use crate::record::RecordAddInput;
use crate::results::ResultPayload;
use crate::types::{
    InsertMetadata, ManagerName, ManagerStatus, PriorityEnum, RecordStatus,
};

// ── Manager bodies ────────────────────────────────────────────

/// POST /compute/v1/managers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerActivationBody {
    pub name_data: ManagerName,
    pub manager_version: String,
    #[serde(default)]
    pub username: Option<String>,
    /// program name → version
    pub programs: BTreeMap<String, String>,
    /// Ordered tag preference; `*` matches everything.
    pub tags: Vec<String>,
}

impl ManagerActivationBody {
    /// Lowercase, strip empties, dedup preserving order. Fails when either
    /// set comes out empty.
    pub fn normalized(mut self) -> Result<Self, QcGridError> {
        let mut seen = std::collections::HashSet::new();
        self.tags = self
            .tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .filter(|t| seen.insert(t.clone()))
            .collect();
        self.programs = self
            .programs
            .into_iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v))
            .filter(|(k, _)| !k.is_empty())
            .collect();

        if self.tags.is_empty() {
            return Err(QcGridError::InvalidInput(
                "manager has no tags; use '*' to match all tags".into(),
            ));
        }
        if self.programs.is_empty() {
            return Err(QcGridError::InvalidInput(
                "manager has no programs available".into(),
            ));
        }
        Ok(self)
    }
}

/// PATCH /compute/v1/managers/{fullname}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerUpdateBody {
    pub status: ManagerStatus,
    #[serde(default)]
    pub active_tasks: i32,
    #[serde(default)]
    pub active_cores: i32,
    #[serde(default)]
    pub active_memory: f64,
    #[serde(default)]
    pub total_worker_walltime: f64,
    #[serde(default)]
    pub total_task_walltime: f64,
}

// ── Task bodies ───────────────────────────────────────────────

/// POST /compute/v1/tasks/claim
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClaimBody {
    pub name_data: ManagerName,
    pub programs: BTreeMap<String, String>,
    pub tags: Vec<String>,
    #[serde(default = "default_claim_limit")]
    pub limit: usize,
}

fn default_claim_limit() -> usize {
    10
}

/// POST /compute/v1/tasks/return
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReturnBody {
    pub name_data: ManagerName,
    /// task id → result payload
    pub results: BTreeMap<i64, ResultPayload>,
}

// ── Record bodies ─────────────────────────────────────────────

/// POST /api/v1/records/{record_type}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordAddBody {
    pub records: Vec<RecordAddInput>,
    #[serde(default = "default_true")]
    pub find_existing: bool,
}

fn default_true() -> bool {
    true
}

/// Response of a bulk record insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordAddResponse {
    pub meta: InsertMetadata,
    /// Ordered like the request; None where an item failed validation.
    pub ids: Vec<Option<i64>>,
}

/// PATCH /api/v1/records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordModifyBody {
    pub record_ids: Vec<i64>,
    /// Only a subset of transitions is reachable here; the rest go through
    /// the dedicated endpoints.
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub delete_tag: bool,
    #[serde(default)]
    pub priority: Option<PriorityEnum>,
}

/// POST /api/v1/records/{reset,cancel,invalidate,undelete}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordIdsBody {
    pub record_ids: Vec<i64>,
}

/// DELETE /api/v1/records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordDeleteBody {
    pub record_ids: Vec<i64>,
    #[serde(default = "default_true")]
    pub soft_delete: bool,
    #[serde(default)]
    pub delete_children: bool,
}

// ── Information ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiLimits {
    pub get_records: i64,
    pub add_records: i64,
    pub get_managers: i64,
    pub manager_tasks_claim: i64,
    pub manager_tasks_return: i64,
}

/// GET /api/v1/information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InformationResponse {
    pub name: String,
    pub version: String,
    pub api_limits: ApiLimits,
    pub client_version_lower_limit: String,
    pub client_version_upper_limit: String,
    #[serde(default)]
    pub motd: String,
}

/// Uniform error envelope for every HTTP error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub msg: String,
}
