//! Postgres implementations of the qcgrid_core port traits.
//!
//! All SQL is runtime-checked (`sqlx::query`, not the compile-time macros)
//! so builds never need a live database. The schema ships as an idempotent
//! `schema.sql` applied at boot.

mod helpers;
mod internal_jobs;
mod manager_store;
mod record_store;
mod service_store;
pub mod serverinfo;
mod sqlx_types;
mod task_queue;

pub use internal_jobs::PgInternalJobQueue;
pub use manager_store::PgManagerRegistry;
pub use record_store::PgRecordStore;
pub use service_store::PgServiceEngine;
pub use task_queue::PgTaskQueue;

use anyhow::anyhow;
use sqlx::PgPool;

use qcgrid_core::ports::Result;

/// The embedded schema, applied idempotently.
pub const SCHEMA_SQL: &str = include_str!("../schema.sql");

/// Create all tables and indexes if they do not exist yet.
pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .map_err(|e| anyhow!(e))?;
    Ok(())
}

/// All port implementations over one pool.
pub struct PgStores {
    pub records: PgRecordStore,
    pub tasks: PgTaskQueue,
    pub managers: PgManagerRegistry,
    pub services: PgServiceEngine,
    pub internal_jobs: PgInternalJobQueue,
}

impl PgStores {
    pub fn new(pool: PgPool) -> Self {
        Self {
            records: PgRecordStore::new(pool.clone()),
            tasks: PgTaskQueue::new(pool.clone()),
            managers: PgManagerRegistry::new(pool.clone()),
            services: PgServiceEngine::new(pool.clone()),
            internal_jobs: PgInternalJobQueue::new(pool),
        }
    }
}
