//! Shared enums and bulk-operation metadata.
//!
//! These are pure value types. Postgres stores the enums as TEXT; the
//! adapter crate converts through `as_str`/`from_str`.

// Several enums use `from_str() -> Option<Self>` instead of `FromStr`
// because callers want None for unknown wire values, not an error type.
#![allow(clippy::should_implement_trait)]

use serde::{Deserialize, Serialize};

// ── Record status ─────────────────────────────────────────────

/// Lifecycle status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Waiting,
    Running,
    Complete,
    Error,
    Cancelled,
    Invalid,
    Deleted,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Invalid => "invalid",
            Self::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            "invalid" => Some(Self::Invalid),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Whether a record in this status may carry a task row.
    pub fn has_task(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running)
    }

    /// Legal direct transitions. `undelete` is handled separately since the
    /// destination depends on the record's history.
    pub fn can_transition(from: RecordStatus, to: RecordStatus) -> bool {
        use RecordStatus::*;
        match (from, to) {
            (Waiting, Running) => true,
            (Running, Complete) | (Running, Error) => true,
            // reset
            (Error, Waiting) => true,
            (Waiting, Cancelled) | (Running, Cancelled) | (Error, Cancelled) => true,
            // invalid marks an irrecoverable record; complete records are exempt
            (Waiting, Invalid) | (Running, Invalid) | (Error, Invalid) | (Cancelled, Invalid) => {
                true
            }
            // soft delete is reachable from everywhere except deleted itself
            (Deleted, Deleted) => false,
            (_, Deleted) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Priority ──────────────────────────────────────────────────

/// Task/service priority. Stored as an integer so that the queue index can
/// sort on it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityEnum {
    Low,
    Normal,
    High,
}

impl PriorityEnum {
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            _ => None,
        }
    }
}

impl Default for PriorityEnum {
    fn default() -> Self {
        Self::Normal
    }
}

// ── Manager status ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerStatus {
    Active,
    Inactive,
}

impl ManagerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

impl std::fmt::Display for ManagerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Internal job status ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalJobStatus {
    Waiting,
    Running,
    Complete,
    Error,
    Cancelled,
}

impl InternalJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for InternalJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Output type / compression ─────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Stdout,
    Stderr,
    Error,
}

impl OutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compression method for stored output blobs (method only - the level is
/// kept alongside as data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Lzma,
    Zstd,
}

impl CompressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lzma => "lzma",
            Self::Zstd => "zstd",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "lzma" => Some(Self::Lzma),
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Record type ───────────────────────────────────────────────

/// Discriminator for the polymorphic record table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Singlepoint,
    Optimization,
    Torsiondrive,
    Gridoptimization,
    Neb,
    Reaction,
    Manybody,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Singlepoint => "singlepoint",
            Self::Optimization => "optimization",
            Self::Torsiondrive => "torsiondrive",
            Self::Gridoptimization => "gridoptimization",
            Self::Neb => "neb",
            Self::Reaction => "reaction",
            Self::Manybody => "manybody",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "singlepoint" => Some(Self::Singlepoint),
            "optimization" => Some(Self::Optimization),
            "torsiondrive" => Some(Self::Torsiondrive),
            "gridoptimization" => Some(Self::Gridoptimization),
            "neb" => Some(Self::Neb),
            "reaction" => Some(Self::Reaction),
            "manybody" => Some(Self::Manybody),
            _ => None,
        }
    }

    /// Service types are driven by the iteration engine; atomic types get a
    /// task row directly.
    pub fn is_service(&self) -> bool {
        matches!(
            self,
            Self::Torsiondrive | Self::Gridoptimization | Self::Neb | Self::Reaction | Self::Manybody
        )
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Manager name ──────────────────────────────────────────────

/// Structured manager name. The full name `{cluster}-{hostname}-{uuid}`
/// is what the database keys on; the UUID component makes restarts of the
/// same cluster/host pair distinct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerName {
    pub cluster: String,
    pub hostname: String,
    pub uuid: String,
}

impl ManagerName {
    pub fn fullname(&self) -> String {
        format!("{}-{}-{}", self.cluster, self.hostname, self.uuid)
    }
}

impl std::fmt::Display for ManagerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fullname())
    }
}

// ── Bulk-operation metadata ───────────────────────────────────

/// Per-item disposition of a bulk insert. Indices refer to positions in the
/// input batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertMetadata {
    pub error_description: Option<String>,
    pub errors: Vec<(usize, String)>,
    pub inserted_idx: Vec<usize>,
    pub existing_idx: Vec<usize>,
}

impl InsertMetadata {
    pub fn n_inserted(&self) -> usize {
        self.inserted_idx.len()
    }

    pub fn n_existing(&self) -> usize {
        self.existing_idx.len()
    }

    pub fn success(&self) -> bool {
        self.error_description.is_none() && self.errors.is_empty()
    }
}

/// Per-item disposition of a bulk update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateMetadata {
    pub error_description: Option<String>,
    pub errors: Vec<(usize, String)>,
    pub updated_idx: Vec<usize>,
}

impl UpdateMetadata {
    pub fn n_updated(&self) -> usize {
        self.updated_idx.len()
    }

    pub fn success(&self) -> bool {
        self.error_description.is_none() && self.errors.is_empty()
    }
}

/// Per-item disposition of a bulk delete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteMetadata {
    pub error_description: Option<String>,
    pub errors: Vec<(usize, String)>,
    pub deleted_idx: Vec<usize>,
    pub missing_idx: Vec<usize>,
}

impl DeleteMetadata {
    pub fn n_deleted(&self) -> usize {
        self.deleted_idx.len()
    }

    pub fn success(&self) -> bool {
        self.error_description.is_none() && self.errors.is_empty()
    }
}

// ── Task return metadata ──────────────────────────────────────

/// Why a returned task was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRejectReason {
    TaskNotFound,
    WrongManager,
    NotRunning,
    InvalidPayload,
}

impl TaskRejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskNotFound => "task_not_found",
            Self::WrongManager => "wrong_manager",
            Self::NotRunning => "not_running",
            Self::InvalidPayload => "invalid_payload",
        }
    }
}

impl std::fmt::Display for TaskRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a bulk task return. One bad task never poisons the batch;
/// `rejected_info` preserves input indices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskReturnMetadata {
    pub accepted_ids: Vec<i64>,
    pub rejected_info: Vec<(usize, TaskRejectReason)>,
}

impl TaskReturnMetadata {
    pub fn n_accepted(&self) -> usize {
        self.accepted_ids.len()
    }

    pub fn n_rejected(&self) -> usize {
        self.rejected_info.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            RecordStatus::Waiting,
            RecordStatus::Running,
            RecordStatus::Complete,
            RecordStatus::Error,
            RecordStatus::Cancelled,
            RecordStatus::Invalid,
            RecordStatus::Deleted,
        ] {
            assert_eq!(RecordStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(RecordStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_transition_dag() {
        use RecordStatus::*;
        assert!(RecordStatus::can_transition(Waiting, Running));
        assert!(RecordStatus::can_transition(Running, Complete));
        assert!(RecordStatus::can_transition(Running, Error));
        assert!(RecordStatus::can_transition(Error, Waiting));
        assert!(RecordStatus::can_transition(Running, Cancelled));
        assert!(RecordStatus::can_transition(Complete, Deleted));

        // complete is terminal except for deletion
        assert!(!RecordStatus::can_transition(Complete, Waiting));
        assert!(!RecordStatus::can_transition(Complete, Invalid));
        assert!(!RecordStatus::can_transition(Complete, Cancelled));

        // cancelled records cannot sneak back into the queue
        assert!(!RecordStatus::can_transition(Cancelled, Waiting));
        assert!(!RecordStatus::can_transition(Invalid, Waiting));
        assert!(!RecordStatus::can_transition(Deleted, Waiting));
        assert!(!RecordStatus::can_transition(Deleted, Deleted));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(PriorityEnum::High > PriorityEnum::Normal);
        assert!(PriorityEnum::Normal > PriorityEnum::Low);
        assert_eq!(PriorityEnum::from_i32(2), Some(PriorityEnum::High));
        assert_eq!(PriorityEnum::from_i32(7), None);
    }

    #[test]
    fn test_manager_fullname() {
        let name = ManagerName {
            cluster: "c".into(),
            hostname: "h".into(),
            uuid: "u1".into(),
        };
        assert_eq!(name.fullname(), "c-h-u1");
    }

    #[test]
    fn test_record_type_service_split() {
        assert!(!RecordType::Singlepoint.is_service());
        assert!(!RecordType::Optimization.is_service());
        assert!(RecordType::Torsiondrive.is_service());
        assert!(RecordType::Reaction.is_service());
    }
}
