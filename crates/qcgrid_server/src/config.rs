//! Server configuration.
//!
//! Read once at boot from env vars (a `.env` file is honored via dotenvy in
//! main). Nothing here is hot-reloaded.

use anyhow::Context;

use qcgrid_core::proto::ApiLimits;

/// Versions of the portal client this server will talk to.
pub const CLIENT_VERSION_LOWER_LIMIT: &str = "0.50";
pub const CLIENT_VERSION_UPPER_LIMIT: &str = "0.70";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind_addr: String,
    /// Seconds between manager heartbeat checks.
    pub heartbeat_frequency: f64,
    /// Heartbeats a manager may miss before eviction.
    pub heartbeat_max_missed: u32,
    /// Seconds between service iteration passes.
    pub service_frequency: f64,
    /// Seconds between server statistics snapshots.
    pub statistics_frequency: f64,
    /// Seconds between internal-job claim polls.
    pub internal_job_poll_frequency: f64,
    /// Seconds of runner silence after which a running job is reaped.
    pub internal_job_stale_after: f64,
    pub api_limits: ApiLimits,
    pub motd: String,
    /// Accepted for compatibility with deployments that do geo lookups on
    /// access logs; the core never reads the file.
    pub geolocation_file_path: Option<String>,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("cannot parse {name}={raw}")),
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("QCGRID_DATABASE_URL").context("QCGRID_DATABASE_URL must be set")?;
        let bind_addr =
            std::env::var("QCGRID_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:7777".into());

        Ok(Self {
            database_url,
            bind_addr,
            heartbeat_frequency: env_parse("QCGRID_HEARTBEAT_FREQUENCY", 1800.0)?,
            heartbeat_max_missed: env_parse("QCGRID_HEARTBEAT_MAX_MISSED", 5)?,
            service_frequency: env_parse("QCGRID_SERVICE_FREQUENCY", 60.0)?,
            statistics_frequency: env_parse("QCGRID_STATISTICS_FREQUENCY", 3600.0)?,
            internal_job_poll_frequency: env_parse("QCGRID_INTERNAL_JOB_POLL_FREQUENCY", 2.0)?,
            internal_job_stale_after: env_parse("QCGRID_INTERNAL_JOB_STALE_AFTER", 600.0)?,
            api_limits: ApiLimits {
                get_records: env_parse("QCGRID_API_LIMIT_GET_RECORDS", 1000)?,
                add_records: env_parse("QCGRID_API_LIMIT_ADD_RECORDS", 500)?,
                get_managers: env_parse("QCGRID_API_LIMIT_GET_MANAGERS", 1000)?,
                manager_tasks_claim: env_parse("QCGRID_API_LIMIT_TASKS_CLAIM", 200)?,
                manager_tasks_return: env_parse("QCGRID_API_LIMIT_TASKS_RETURN", 200)?,
            },
            motd: std::env::var("QCGRID_MOTD").unwrap_or_default(),
            geolocation_file_path: std::env::var("QCGRID_GEOLOCATION_FILE_PATH").ok(),
        })
    }
}
