use crate::auth::authenticate;
use crate::handlers;
use crate::state::AppState;
use axum::routing::{get, post};
use axum::{middleware, Router};

pub fn router(state: AppState) -> Router {
    let evaluation = Router::new()
        .route("/evaluation/suites", post(handlers::create_suite))
        .route(
            "/evaluation/suites/{suite_id}/evals",
            post(handlers::add_case),
        )
        .route(
            "/evaluation/suites/{suite_id}/execute",
            post(handlers::execute),
        )
        .route(
            "/evaluation/suites/{suite_id}/executions",
            get(handlers::list_suite_executions),
        )
        .route(
            "/evaluation/executions/{execution_id}/status",
            get(handlers::execution_status),
        )
        .route(
            "/evaluation/executions/{execution_id}/summary",
            get(handlers::execution_summary),
        )
        .route(
            "/evaluation/executions/{execution_id}/cancel",
            post(handlers::cancel_execution),
        )
        .route(
            "/evaluation/executions/{execution_id}/events",
            get(handlers::execution_events),
        )
        .route("/flows", get(handlers::list_flows));

    Router::new()
        .nest("/api/v1", evaluation)
        .route("/api/flows", get(handlers::list_flows))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
