//! qcgrid server binary.
//!
//! Reads config from env vars (see config.rs):
//!   QCGRID_DATABASE_URL - Postgres connection string (required)
//!   QCGRID_BIND_ADDR    - listen address (default: 0.0.0.0:7777)
//! plus heartbeat/service/statistics frequencies and API limits.

use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;

use qcgrid_server::config::ServerConfig;
use qcgrid_server::router::build_router;
use qcgrid_server::runner::InternalJobRunner;
use qcgrid_server::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,qcgrid_server=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env().expect("invalid configuration");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");
    tracing::info!("connected to database");

    qcgrid_postgres::apply_schema(&pool)
        .await
        .expect("failed to apply schema");

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(pool, config);

    // background worker for heartbeat checks, service iteration, stats
    let runner = InternalJobRunner::new(state.clone());
    runner
        .seed_periodic_jobs()
        .await
        .expect("failed to seed periodic jobs");
    tokio::spawn(async move {
        runner.run().await;
    });

    let app = build_router(state);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind to {bind_addr}: {e}"));
    tracing::info!("qcgrid server listening on {bind_addr}");

    axum::serve(listener, app).await.expect("server error");
}
