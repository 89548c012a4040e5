//! Internal job runner.
//!
//! Polls the durable `internal_jobs` table and executes the registered
//! functions: heartbeat checks, service iteration, statistics snapshots.
//! Periodic jobs self-perpetuate through `after_function`, so they survive
//! restarts and multiple server processes cooperate without an external
//! scheduler. Stale running jobs are reaped back to waiting; every job must
//! therefore be idempotent.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use qcgrid_core::ports::Result;
use qcgrid_core::record::InternalJobSpec;
use qcgrid_core::types::InternalJobStatus;
use qcgrid_postgres::serverinfo;

use crate::state::AppState;

/// How many poll loops between reaper sweeps.
const REAP_EVERY_LOOPS: u64 = 30;

pub struct InternalJobRunner {
    state: AppState,
    runner_hostname: String,
    runner_uuid: String,
}

impl InternalJobRunner {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            runner_hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".into()),
            runner_uuid: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Enqueue the self-perpetuating periodic jobs. `unique_name` makes
    /// this a no-op when another process already holds them.
    pub async fn seed_periodic_jobs(&self) -> Result<()> {
        self.schedule_heartbeat_check(0.0).await?;
        self.schedule_service_iteration(0.0).await?;
        self.schedule_stats_snapshot(0.0).await?;
        Ok(())
    }

    /// Run the claim/execute loop. Never returns under normal operation;
    /// spawn it as a background task via `tokio::spawn`.
    pub async fn run(self) {
        let poll = Duration::from_secs_f64(self.state.config.internal_job_poll_frequency.max(0.1));
        tracing::info!(
            runner_uuid = %self.runner_uuid,
            poll_s = poll.as_secs_f64(),
            "internal job runner started"
        );

        let mut loops: u64 = 0;
        loop {
            loops += 1;
            if loops % REAP_EVERY_LOOPS == 0 {
                let stale = chrono::Duration::milliseconds(
                    (self.state.config.internal_job_stale_after * 1000.0) as i64,
                );
                if let Err(e) = self.state.internal_jobs.reap_stale(stale).await {
                    tracing::error!(error = %e, "internal job reaper failed");
                }
            }

            match self
                .state
                .internal_jobs
                .claim_next(&self.runner_hostname, &self.runner_uuid)
                .await
            {
                Ok(Some(job)) => {
                    tracing::debug!(job_id = job.id, function = %job.function, "running internal job");
                    let outcome = self.execute_function(&job.function, &job.kwargs).await;

                    let finish = match outcome {
                        Ok(result) => {
                            self.state
                                .internal_jobs
                                .finish(job.id, InternalJobStatus::Complete, result)
                                .await
                        }
                        Err(e) => {
                            tracing::error!(job_id = job.id, function = %job.function, error = %e, "internal job failed");
                            self.state
                                .internal_jobs
                                .finish(
                                    job.id,
                                    InternalJobStatus::Error,
                                    Some(json!({"error": e.to_string()})),
                                )
                                .await
                        }
                    };
                    if let Err(e) = finish {
                        tracing::error!(job_id = job.id, error = %e, "could not finish internal job");
                    }

                    // periodic jobs chain even after a failed run, or the
                    // schedule would die with one bad pass
                    if let Some(after_function) = &job.after_function {
                        let kwargs = job.after_function_kwargs.clone().unwrap_or(json!({}));
                        if let Err(e) = self.run_after_function(after_function, &kwargs).await {
                            tracing::error!(job_id = job.id, after_function = %after_function, error = %e, "after_function failed");
                        }
                    }
                }
                Ok(None) => tokio::time::sleep(poll).await,
                Err(e) => {
                    tracing::error!(error = %e, "internal job claim failed");
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }

    /// Dispatch one registered function.
    async fn execute_function(&self, function: &str, _kwargs: &Value) -> Result<Option<Value>> {
        match function {
            "managers.check_manager_heartbeats" => {
                let config = &self.state.config;
                let window = config.heartbeat_max_missed as f64 * config.heartbeat_frequency;
                let cutoff = Utc::now() - chrono::Duration::milliseconds((window * 1000.0) as i64);
                let deactivated = self
                    .state
                    .managers
                    .deactivate(&[], Some(cutoff), "missing heartbeat")
                    .await?;
                if !deactivated.is_empty() {
                    tracing::info!(
                        n = deactivated.len(),
                        "deactivated managers due to missing heartbeats"
                    );
                }
                Ok(Some(json!({ "deactivated": deactivated })))
            }
            "services.iterate_services" => {
                let iterated = self.state.services.iterate_services().await?;
                Ok(Some(json!({ "iterated": iterated })))
            }
            "serverinfo.update_server_stats" => {
                let payload = serverinfo::update_server_stats(&self.state.pool).await?;
                Ok(Some(payload))
            }
            other => Err(qcgrid_core::QcGridError::InvalidInput(format!(
                "unknown internal job function {other}"
            ))),
        }
    }

    /// Dispatch a reschedule hook. Each one re-enqueues its periodic job
    /// with the configured delay.
    async fn run_after_function(&self, function: &str, kwargs: &Value) -> Result<()> {
        let delay = kwargs.get("delay").and_then(Value::as_f64);
        match function {
            "managers.add_internal_job_check_heartbeats" => {
                self.schedule_heartbeat_check(
                    delay.unwrap_or(self.state.config.heartbeat_frequency),
                )
                .await
            }
            "services.add_internal_job_iterate_services" => {
                self.schedule_service_iteration(
                    delay.unwrap_or(self.state.config.service_frequency),
                )
                .await
            }
            "serverinfo.add_internal_job_update_stats" => {
                self.schedule_stats_snapshot(
                    delay.unwrap_or(self.state.config.statistics_frequency),
                )
                .await
            }
            other => Err(qcgrid_core::QcGridError::InvalidInput(format!(
                "unknown after_function {other}"
            ))),
        }
    }

    async fn schedule_heartbeat_check(&self, delay: f64) -> Result<()> {
        self.add_periodic(
            "check_manager_heartbeats",
            "managers.check_manager_heartbeats",
            "managers.add_internal_job_check_heartbeats",
            delay,
            self.state.config.heartbeat_frequency,
        )
        .await
    }

    async fn schedule_service_iteration(&self, delay: f64) -> Result<()> {
        self.add_periodic(
            "iterate_services",
            "services.iterate_services",
            "services.add_internal_job_iterate_services",
            delay,
            self.state.config.service_frequency,
        )
        .await
    }

    async fn schedule_stats_snapshot(&self, delay: f64) -> Result<()> {
        self.add_periodic(
            "update_server_stats",
            "serverinfo.update_server_stats",
            "serverinfo.add_internal_job_update_stats",
            delay,
            self.state.config.statistics_frequency,
        )
        .await
    }

    async fn add_periodic(
        &self,
        name: &str,
        function: &str,
        after_function: &str,
        delay: f64,
        period: f64,
    ) -> Result<()> {
        let scheduled =
            Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64);
        self.state
            .internal_jobs
            .add(InternalJobSpec {
                name: name.into(),
                scheduled_date: scheduled,
                function: function.into(),
                kwargs: json!({}),
                user_name: None,
                unique_name: Some(name.into()),
                after_function: Some(after_function.into()),
                after_function_kwargs: Some(json!({ "delay": period })),
                serial_group: Some(name.into()),
            })
            .await?;
        Ok(())
    }
}
