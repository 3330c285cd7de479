//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let operator_routes = Router::new()
        .route("/status", get(handlers::status))
        .route("/status/{slug}", get(handlers::status_dataset))
        .route("/datasets", get(handlers::datasets))
        // Sync
        .route("/sync", get(handlers::sync_all))
        .route("/sync/{slug}", get(handlers::sync_dataset))
        .route("/sync/{slug}/{branch}", get(handlers::sync_branch))
        .route("/syncprogress", get(handlers::sync_progress))
        // Git worker
        .route("/gitjobs", get(handlers::list_git_jobs))
        .route("/gitjobs/{job_id}", get(handlers::get_git_job))
        .route("/gitjobs/{job_id}/cancel", post(handlers::cancel_git_job))
        // Event ledger
        .route("/events", get(handlers::events))
        .route("/backupevents", get(handlers::backup_events))
        .route("/backupevents/{name}", get(handlers::backup_events_named))
        .route("/restoreevents/{name}", get(handlers::restore_events))
        .route("/resetevents", get(handlers::reset_events));

    let data_routes = Router::new()
        .route("/info", get(handlers::info_root))
        .route("/info/{slug}", get(handlers::info))
        .route("/info/{slug}/{branch}", get(handlers::info))
        .route("/info/{slug}/{branch}/{commit}", get(handlers::info))
        .route("/v2", get(handlers::query_root))
        .route("/v2/{slug}", get(handlers::query_v2))
        .route("/v2/{slug}/{branch}", get(handlers::query_v2))
        .route("/v2/{slug}/{branch}/{commit}", get(handlers::query_v2))
        .route("/v2/{slug}/assets/{asset}", get(handlers::asset))
        .route("/v2/{slug}/{branch}/assets/{asset}", get(handlers::asset))
        .route("/v2/{slug}/{branch}/{commit}/assets", get(handlers::asset))
        .route(
            "/v2/{slug}/{branch}/{commit}/assets/{asset}",
            get(handlers::asset),
        )
        // Legacy routes without a version prefix
        .route("/{slug}", get(handlers::query_v1))
        .route("/{slug}/{branch}", get(handlers::query_v1))
        .route("/{slug}/{branch}/{commit}", get(handlers::query_v1));

    let router = Router::new()
        .merge(operator_routes)
        .merge(data_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Health check (intentionally unauthenticated for load balancers/k8s probes)
    let mut router = router.route("/health", get(handlers::health_check));

    // SECURITY: When enabled, this endpoint MUST be network-restricted
    // to authorized Prometheus scraper IPs only.
    // See crate::metrics module documentation for details.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
