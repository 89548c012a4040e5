//! SQLx row types for the qcgrid Postgres adapter.
//!
//! Each row struct derives `sqlx::FromRow` and converts into its core type.
//! Status enums are stored as TEXT; decoding goes through the core
//! `from_str` helpers so that a corrupted row surfaces as an error instead
//! of a silent default.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use qcgrid_core::error::QcGridError;
use qcgrid_core::record::{
    ComputeHistoryEntry, ComputeManager, InternalJob, ManagerLogEntry, OutputBlob, Record,
    ServiceInfo, Task,
};
use qcgrid_core::types::{
    CompressionType, InternalJobStatus, ManagerStatus, OutputType, PriorityEnum, RecordStatus,
    RecordType,
};

pub(crate) fn parse_record_status(s: &str) -> Result<RecordStatus, QcGridError> {
    RecordStatus::from_str(s)
        .ok_or_else(|| QcGridError::Internal(anyhow::anyhow!("unknown record status '{s}'")))
}

pub(crate) fn parse_record_type(s: &str) -> Result<RecordType, QcGridError> {
    RecordType::from_str(s)
        .ok_or_else(|| QcGridError::Internal(anyhow::anyhow!("unknown record type '{s}'")))
}

pub(crate) fn parse_manager_status(s: &str) -> Result<ManagerStatus, QcGridError> {
    ManagerStatus::from_str(s)
        .ok_or_else(|| QcGridError::Internal(anyhow::anyhow!("unknown manager status '{s}'")))
}

pub(crate) fn parse_job_status(s: &str) -> Result<InternalJobStatus, QcGridError> {
    InternalJobStatus::from_str(s)
        .ok_or_else(|| QcGridError::Internal(anyhow::anyhow!("unknown internal job status '{s}'")))
}

pub(crate) fn parse_priority(v: i32) -> Result<PriorityEnum, QcGridError> {
    PriorityEnum::from_i32(v)
        .ok_or_else(|| QcGridError::Internal(anyhow::anyhow!("unknown priority value {v}")))
}

pub(crate) fn parse_output_type(s: &str) -> Result<OutputType, QcGridError> {
    OutputType::from_str(s)
        .ok_or_else(|| QcGridError::Internal(anyhow::anyhow!("unknown output type '{s}'")))
}

pub(crate) fn parse_compression_type(s: &str) -> Result<CompressionType, QcGridError> {
    CompressionType::from_str(s)
        .ok_or_else(|| QcGridError::Internal(anyhow::anyhow!("unknown compression type '{s}'")))
}

// ── base_record ───────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RecordRow {
    pub id: i64,
    pub record_type: String,
    pub status: String,
    pub owner_user: Option<String>,
    pub owner_group: Option<String>,
    pub manager_name: Option<String>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub specification_id: i64,
    pub molecule_ids: Vec<i64>,
    pub input_data: Value,
    pub extras: Option<Value>,
    pub properties: Option<Value>,
}

impl RecordRow {
    pub fn into_record(self) -> Result<Record, QcGridError> {
        Ok(Record {
            id: self.id,
            record_type: parse_record_type(&self.record_type)?,
            status: parse_record_status(&self.status)?,
            owner_user: self.owner_user,
            owner_group: self.owner_group,
            manager_name: self.manager_name,
            created_on: self.created_on,
            modified_on: self.modified_on,
            specification_id: self.specification_id,
            molecule_ids: self.molecule_ids,
            input_data: self.input_data,
            extras: self.extras,
            properties: self.properties,
            compute_history: None,
            task: None,
            service: None,
        })
    }
}

// ── task_queue ────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskRow {
    pub id: i64,
    pub record_id: i64,
    pub required_programs: Vec<String>,
    pub tag: String,
    pub priority: i32,
    pub created_on: DateTime<Utc>,
    pub sort_date: DateTime<Utc>,
    pub function: String,
    pub function_kwargs: Value,
}

impl TaskRow {
    pub fn into_task(self) -> Result<Task, QcGridError> {
        Ok(Task {
            id: self.id,
            record_id: self.record_id,
            required_programs: self.required_programs,
            tag: self.tag,
            priority: parse_priority(self.priority)?,
            created_on: self.created_on,
            sort_date: self.sort_date,
            function: self.function,
            function_kwargs: self.function_kwargs,
        })
    }
}

// ── service_queue ─────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ServiceRow {
    pub id: i64,
    pub record_id: i64,
    pub tag: String,
    pub priority: i32,
    pub find_existing: bool,
    pub iteration: i32,
    pub service_state: Value,
    pub created_on: DateTime<Utc>,
}

impl ServiceRow {
    pub fn into_service(self) -> Result<ServiceInfo, QcGridError> {
        Ok(ServiceInfo {
            id: self.id,
            record_id: self.record_id,
            tag: self.tag,
            priority: parse_priority(self.priority)?,
            find_existing: self.find_existing,
            iteration: self.iteration,
            service_state: self.service_state,
            created_on: self.created_on,
        })
    }
}

// ── record_compute_history / output_store ─────────────────────

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct HistoryRow {
    pub id: i64,
    pub record_id: i64,
    pub status: String,
    pub manager_name: Option<String>,
    pub modified_on: DateTime<Utc>,
    pub provenance: Option<Value>,
}

impl HistoryRow {
    pub fn into_entry(self) -> Result<ComputeHistoryEntry, QcGridError> {
        Ok(ComputeHistoryEntry {
            id: self.id,
            record_id: self.record_id,
            status: parse_record_status(&self.status)?,
            manager_name: self.manager_name,
            modified_on: self.modified_on,
            provenance: self.provenance,
            outputs: None,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OutputRow {
    pub id: i64,
    pub history_id: i64,
    pub output_type: String,
    pub compression_type: String,
    pub compression_level: i32,
    pub data: Vec<u8>,
}

impl OutputRow {
    pub fn into_blob(self) -> Result<OutputBlob, QcGridError> {
        Ok(OutputBlob {
            id: self.id,
            history_id: self.history_id,
            output_type: parse_output_type(&self.output_type)?,
            compression_type: parse_compression_type(&self.compression_type)?,
            compression_level: self.compression_level,
            data: self.data,
        })
    }
}

// ── compute_manager ───────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ManagerRow {
    pub id: i64,
    pub name: String,
    pub cluster: String,
    pub hostname: String,
    pub username: Option<String>,
    pub manager_version: String,
    pub tags: Vec<String>,
    pub programs: Value,
    pub status: String,
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
    pub modified_on: DateTime<Utc>,
}

impl ManagerRow {
    pub fn into_manager(self) -> Result<ComputeManager, QcGridError> {
        let programs: BTreeMap<String, String> = serde_json::from_value(self.programs)
            .map_err(|e| QcGridError::Internal(anyhow::anyhow!("manager programs column: {e}")))?;
        Ok(ComputeManager {
            id: self.id,
            name: self.name,
            cluster: self.cluster,
            hostname: self.hostname,
            username: self.username,
            manager_version: self.manager_version,
            tags: self.tags,
            programs,
            status: parse_manager_status(&self.status)?,
            claimed: self.claimed,
            successes: self.successes,
            failures: self.failures,
            rejected: self.rejected,
            active_tasks: self.active_tasks,
            active_cores: self.active_cores,
            active_memory: self.active_memory,
            total_worker_walltime: self.total_worker_walltime,
            total_task_walltime: self.total_task_walltime,
            created_on: self.created_on,
            modified_on: self.modified_on,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ManagerLogRow {
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

impl ManagerLogRow {
    pub fn into_entry(self) -> ManagerLogEntry {
        ManagerLogEntry {
            id: self.id,
            manager_id: self.manager_id,
            timestamp: self.timestamp,
            claimed: self.claimed,
            successes: self.successes,
            failures: self.failures,
            rejected: self.rejected,
            active_tasks: self.active_tasks,
            active_cores: self.active_cores,
            active_memory: self.active_memory,
            total_worker_walltime: self.total_worker_walltime,
            total_task_walltime: self.total_task_walltime,
        }
    }
}

// ── internal_jobs ─────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct InternalJobRow {
    pub id: i64,
    pub name: String,
    pub status: String,
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

impl InternalJobRow {
    pub fn into_job(self) -> Result<InternalJob, QcGridError> {
        Ok(InternalJob {
            id: self.id,
            name: self.name,
            status: parse_job_status(&self.status)?,
            added_date: self.added_date,
            scheduled_date: self.scheduled_date,
            started_date: self.started_date,
            last_updated: self.last_updated,
            ended_date: self.ended_date,
            runner_hostname: self.runner_hostname,
            runner_uuid: self.runner_uuid,
            progress: self.progress,
            function: self.function,
            kwargs: self.kwargs,
            after_function: self.after_function,
            after_function_kwargs: self.after_function_kwargs,
            result: self.result,
            user_name: self.user_name,
            unique_name: self.unique_name,
            serial_group: self.serial_group,
        })
    }
}
