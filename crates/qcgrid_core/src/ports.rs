//! Storage port traits - implemented by qcgrid_postgres.
//! The HTTP layer and the internal-job runner depend only on these traits,
//! never on sqlx directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::QcGridError;
use crate::proto::{ManagerActivationBody, ManagerUpdateBody};
use crate::record::{
    ComputeManager, InternalJob, InternalJobSpec, ManagerLogEntry, ManagerQuery, Record,
    RecordAddInput, RecordIncludes, RecordModification, RecordQuery, RecordTask,
};
use crate::results::ResultPayload;
use crate::types::{
    CompressionType, DeleteMetadata, InsertMetadata, InternalJobStatus, OutputType,
    TaskReturnMetadata, UpdateMetadata,
};

pub type Result<T> = std::result::Result<T, QcGridError>;

/// CRUD and lifecycle transitions for records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Bulk insert with deduplication. Atomic per batch; per-item
    /// disposition in the metadata, ids ordered like the input (None for
    /// items that failed validation).
    async fn add(
        &self,
        inputs: Vec<RecordAddInput>,
        find_existing: bool,
    ) -> Result<(InsertMetadata, Vec<Option<i64>>)>;

    /// Projection-aware fetch, ordered like `ids`. With `missing_ok`,
    /// unknown ids yield None instead of an error.
    async fn get(
        &self,
        ids: &[i64],
        includes: RecordIncludes,
        missing_ok: bool,
    ) -> Result<Vec<Option<Record>>>;

    async fn query(&self, query: RecordQuery) -> Result<Vec<Record>>;

    /// Tag/priority changes; only legal while the record is waiting.
    async fn modify(&self, ids: &[i64], modification: RecordModification)
        -> Result<UpdateMetadata>;

    /// error → waiting, with a fresh task at a demoted queue position.
    async fn reset(&self, ids: &[i64]) -> Result<UpdateMetadata>;

    async fn cancel(&self, ids: &[i64]) -> Result<UpdateMetadata>;

    async fn invalidate(&self, ids: &[i64]) -> Result<UpdateMetadata>;

    async fn undelete(&self, ids: &[i64]) -> Result<UpdateMetadata>;

    async fn delete(
        &self,
        ids: &[i64],
        soft_delete: bool,
        delete_children: bool,
    ) -> Result<DeleteMetadata>;

    /// Recycle every running record owned by the given managers back to
    /// waiting. Returns the affected record ids. Used by manager
    /// deactivation.
    async fn reset_assigned(&self, manager_names: &[String]) -> Result<Vec<i64>>;

    /// Store one compressed output blob for a history entry.
    async fn append_output(
        &self,
        history_id: i64,
        output_type: OutputType,
        data: &[u8],
        compression: CompressionType,
    ) -> Result<()>;

    async fn get_short_description(&self, id: i64) -> Result<String>;
}

/// The claim/return surface managers talk to.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Claim up to `limit` eligible tasks for an active manager, honoring
    /// the manager's tag order and program set.
    async fn claim(
        &self,
        manager_name: &str,
        programs: &BTreeMap<String, String>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<RecordTask>>;

    /// Return results for claimed tasks. Each task finishes in its own
    /// transaction; rejections never poison the batch.
    async fn return_results(
        &self,
        manager_name: &str,
        results: Vec<(i64, ResultPayload)>,
    ) -> Result<TaskReturnMetadata>;
}

/// Manager lifecycle and queries.
#[async_trait]
pub trait ManagerRegistry: Send + Sync {
    async fn activate(&self, activation: ManagerActivationBody) -> Result<i64>;

    /// Heartbeat: refresh `modified_on`, update gauges, append a log
    /// snapshot. Refuses inactive managers.
    async fn heartbeat(&self, name: &str, update: ManagerUpdateBody) -> Result<()>;

    /// Mark matching active managers inactive and recycle their tasks.
    /// Returns the names actually deactivated.
    async fn deactivate(
        &self,
        names: &[String],
        modified_before: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<Vec<String>>;

    async fn get(&self, names: &[String], missing_ok: bool) -> Result<Vec<Option<ComputeManager>>>;

    async fn query(&self, query: ManagerQuery) -> Result<Vec<ComputeManager>>;

    async fn get_log(&self, name: &str) -> Result<Vec<ManagerLogEntry>>;
}

/// The service iteration driver.
#[async_trait]
pub trait ServiceEngine: Send + Sync {
    /// One pass: propagate child errors, then iterate every service whose
    /// dependency set is empty. Returns how many services iterated.
    async fn iterate_services(&self) -> Result<usize>;
}

/// Durable background jobs.
#[async_trait]
pub trait InternalJobQueue: Send + Sync {
    /// Enqueue a job. A no-op returning the existing id when `unique_name`
    /// matches a non-terminal row.
    async fn add(&self, spec: InternalJobSpec) -> Result<i64>;

    /// Claim the earliest eligible waiting job for this runner.
    async fn claim_next(
        &self,
        runner_hostname: &str,
        runner_uuid: &str,
    ) -> Result<Option<InternalJob>>;

    async fn update_progress(&self, job_id: i64, progress: i32) -> Result<()>;

    /// Write a terminal status and result.
    async fn finish(
        &self,
        job_id: i64,
        status: InternalJobStatus,
        result: Option<Value>,
    ) -> Result<()>;

    /// Recycle running jobs whose `last_updated` is older than the
    /// threshold back to waiting. Returns recycled job ids.
    async fn reap_stale(&self, stale_after: chrono::Duration) -> Result<Vec<i64>>;
}
