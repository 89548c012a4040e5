//! Router construction for the qcgrid server.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, patch, post},
    Extension, Router,
};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::InternalErrorText;
use crate::handlers;
use crate::state::AppState;

/// Build the full axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let api_v1 = Router::new()
        .route("/information", get(handlers::info::information))
        .route(
            "/records",
            patch(handlers::records::modify).delete(handlers::records::delete_records),
        )
        .route("/records/query", post(handlers::records::query))
        .route("/records/reset", post(handlers::records::reset))
        .route("/records/cancel", post(handlers::records::cancel))
        .route("/records/invalidate", post(handlers::records::invalidate))
        .route("/records/undelete", post(handlers::records::undelete))
        // POST takes a record type, GET takes an id
        .route(
            "/records/:key",
            post(handlers::records::add).get(handlers::records::get_record),
        )
        .route(
            "/records/:key/short_description",
            get(handlers::records::short_description),
        )
        .route("/managers/query", post(handlers::managers::query_managers))
        .route("/managers/:name", get(handlers::managers::get_manager))
        .route("/managers/:name/log", get(handlers::managers::get_manager_log));

    let compute_v1 = Router::new()
        .route("/managers", post(handlers::managers::activate))
        .route("/managers/:fullname", patch(handlers::managers::update))
        .route("/tasks/claim", post(handlers::tasks::claim))
        .route("/tasks/return", post(handlers::tasks::return_tasks));

    let pool = state.pool.clone();
    Router::new()
        .nest("/api/v1", api_v1)
        .nest("/compute/v1", compute_v1)
        .layer(Extension(state))
        .layer(middleware::from_fn(move |req: Request, next: Next| {
            let pool = pool.clone();
            async move { log_internal_errors(pool, req, next).await }
        }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Record 500s in the internal error log, keyed by request path.
async fn log_internal_errors(pool: PgPool, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let response = next.run(req).await;
    if response.status() == StatusCode::INTERNAL_SERVER_ERROR {
        if let Some(InternalErrorText(msg)) = response.extensions().get::<InternalErrorText>() {
            qcgrid_postgres::serverinfo::log_internal_error(&pool, msg, None, Some(&path)).await;
        }
    }
    response
}
