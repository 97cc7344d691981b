use crate::api;
use crate::auth;
use crate::logging;
use crate::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

/// Plugin binaries arrive through multipart uploads; the default body
/// limit is far too small for them.
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

pub fn build_http_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let public = Router::new().route("/v1/health", get(api::health));

    let protected = Router::new()
        .route(
            "/v1/plugins",
            post(api::plugins::load_plugin).get(api::plugins::list_plugins),
        )
        .route("/v1/plugins/{type}", get(api::plugins::list_plugins_by_type))
        .route(
            "/v1/plugins/{type}/{name}",
            get(api::plugins::list_plugins_by_name),
        )
        .route(
            "/v1/plugins/{type}/{name}/{version}",
            get(api::plugins::get_plugin)
                .post(api::plugins::swap_plugin)
                .delete(api::plugins::unload_plugin),
        )
        .route("/v1/metrics", get(api::metrics::list_metrics))
        .route("/v1/metric", get(api::metrics::get_metric))
        .route(
            "/v1/tasks",
            post(api::tasks::create_task).get(api::tasks::list_tasks),
        )
        .route(
            "/v1/tasks/{id}",
            get(api::tasks::get_task).delete(api::tasks::remove_task),
        )
        .route("/v1/tasks/{id}/export", get(api::tasks::export_task))
        .route("/v1/tasks/{id}/start", put(api::tasks::start_task))
        .route("/v1/tasks/{id}/stop", put(api::tasks::stop_task))
        .route("/v1/tasks/{id}/enable", put(api::tasks::enable_task))
        .route("/v1/tasks/{id}/watch", get(api::tasks::watch_task))
        .route(
            "/v1/tribe/agreements",
            get(api::tribe::list_agreements).post(api::tribe::add_agreement),
        )
        .route(
            "/v1/tribe/agreements/{name}",
            delete(api::tribe::remove_agreement),
        )
        .route(
            "/v1/tribe/agreements/{name}/join",
            put(api::tribe::join_agreement),
        )
        .route(
            "/v1/tribe/agreements/{name}/leave",
            put(api::tribe::leave_agreement),
        )
        .route("/v1/tribe/members", get(api::tribe::list_members))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::basic_auth_middleware,
        ));

    public
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(middleware::from_fn(logging::request_logging))
}
