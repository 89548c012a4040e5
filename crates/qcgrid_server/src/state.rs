//! Shared application state handed to every handler via `Extension`.

use std::sync::Arc;

use sqlx::PgPool;

use qcgrid_core::ports::{
    InternalJobQueue, ManagerRegistry, RecordStore, ServiceEngine, TaskQueue,
};
use qcgrid_postgres::PgStores;

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub tasks: Arc<dyn TaskQueue>,
    pub managers: Arc<dyn ManagerRegistry>,
    pub services: Arc<dyn ServiceEngine>,
    pub internal_jobs: Arc<dyn InternalJobQueue>,
    pub pool: PgPool,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(pool: PgPool, config: ServerConfig) -> Self {
        let stores = PgStores::new(pool.clone());
        Self {
            records: Arc::new(stores.records),
            tasks: Arc::new(stores.tasks),
            managers: Arc::new(stores.managers),
            services: Arc::new(stores.services),
            internal_jobs: Arc::new(stores.internal_jobs),
            pool,
            config: Arc::new(config),
        }
    }
}
