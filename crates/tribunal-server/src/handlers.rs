use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Extension, Json};
use futures::stream::Stream;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use tokio::sync::broadcast;
use tribunal_core::context::Context;
use tribunal_core::model::{
    CasePayload, EventFrame, EventKind, ExecutionParams, Page, Suite, TestCase,
};
use tribunal_core::storage::filter::{Filter, FilterOp, ListQuery, Sort};

#[derive(Debug, Deserialize)]
pub struct CreateSuiteBody {
    pub name: String,
    #[serde(default)]
    pub evaluator_config: serde_json::Value,
}

pub async fn create_suite(
    State(state): State<AppState>,
    Extension(ctx): Extension<Context>,
    Json(body): Json<CreateSuiteBody>,
) -> Result<(StatusCode, Json<Suite>), ApiError> {
    let suite = state
        .definitions
        .create_suite(&ctx, &body.name, body.evaluator_config)?;
    Ok((StatusCode::CREATED, Json(suite)))
}

pub async fn add_case(
    State(state): State<AppState>,
    Extension(ctx): Extension<Context>,
    Path(suite_id): Path<i64>,
    Json(payload): Json<CasePayload>,
) -> Result<(StatusCode, Json<TestCase>), ApiError> {
    let case = state.definitions.add_case(&ctx, suite_id, &payload)?;
    Ok((StatusCode::CREATED, Json(case)))
}

#[derive(Debug, Deserialize, Default)]
pub struct ExecuteBody {
    #[serde(default)]
    pub conversation_spec_id: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub async fn execute(
    State(state): State<AppState>,
    Extension(ctx): Extension<Context>,
    Path(suite_id): Path<i64>,
    Json(body): Json<ExecuteBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    // the header wins; the body field is a convenience fallback
    let ctx = if ctx.idempotency_key.is_none() {
        ctx.with_idempotency_key(body.idempotency_key.clone())
    } else {
        ctx
    };
    let params = ExecutionParams {
        conversation_spec_id: body.conversation_spec_id,
        batch_size: body.batch_size,
        max_concurrent: body.max_concurrent,
        extra: Default::default(),
    };
    let execution = state.orchestrator.start(&ctx, suite_id, params)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "execution_id": execution.execution_id,
            "status": execution.status.as_str(),
        })),
    ))
}

pub async fn list_suite_executions(
    State(state): State<AppState>,
    Extension(ctx): Extension<Context>,
    Path(suite_id): Path<i64>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    state.definitions.get_suite(&ctx, suite_id)?;
    let executions = state.executions.list_for_suite(&ctx, suite_id)?;
    Ok(Json(
        executions
            .iter()
            .map(|e| {
                serde_json::json!({
                    "execution_id": e.execution_id,
                    "suite_version": e.suite_version,
                    "status": e.status.as_str(),
                    "progress_pct": e.progress_pct,
                    "started_at": e.started_at,
                    "finished_at": e.finished_at,
                })
            })
            .collect(),
    ))
}

pub async fn execution_status(
    State(state): State<AppState>,
    Extension(ctx): Extension<Context>,
    Path(execution_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let view = state.executions.get_status(&ctx, execution_id)?;
    Ok(Json(serde_json::json!({
        "status": view.status.as_str(),
        "progress_pct": view.progress_pct,
    })))
}

pub async fn execution_summary(
    State(state): State<AppState>,
    Extension(ctx): Extension<Context>,
    Path(execution_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state.executions.get_summary(&ctx, execution_id)?;
    Ok(Json(summary))
}

pub async fn cancel_execution(
    State(state): State<AppState>,
    Extension(ctx): Extension<Context>,
    Path(execution_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.orchestrator.cancel(&ctx, execution_id)?;
    Ok(Json(serde_json::json!({ "status": status.as_str() })))
}

enum FrameSource {
    Done,
    /// Terminal execution: one synthetic complete frame, then EOF.
    Single(Box<EventFrame>),
    Live(broadcast::Receiver<EventFrame>),
}

/// Server-sent event stream of runner frames. Frames are re-sequenced per
/// connection starting at 1 and the stream ends after `complete`.
pub async fn execution_events(
    State(state): State<AppState>,
    Extension(ctx): Extension<Context>,
    Path(execution_id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // subscribe before the status read so frames emitted in between are
    // not lost
    let rx = state.events.subscribe(execution_id);
    let view = state.executions.get_status(&ctx, execution_id)?;

    let source = if view.status.is_terminal() {
        FrameSource::Single(Box::new(EventFrame {
            execution_id,
            sequence: 1,
            kind: EventKind::Complete,
            payload: serde_json::json!({ "status": view.status.as_str() }),
            at: chrono_now(),
        }))
    } else {
        FrameSource::Live(rx)
    };

    let stream = futures::stream::unfold((source, 1u64), |(source, seq)| async move {
        match source {
            FrameSource::Done => None,
            FrameSource::Single(frame) => {
                Some((Ok(sse_event(&frame, seq)), (FrameSource::Done, seq + 1)))
            }
            FrameSource::Live(mut rx) => loop {
                match rx.recv().await {
                    Ok(frame) => {
                        let next = if frame.kind == EventKind::Complete {
                            FrameSource::Done
                        } else {
                            FrameSource::Live(rx)
                        };
                        break Some((Ok(sse_event(&frame, seq)), (next, seq + 1)));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(event = "sse_subscriber_lagged", skipped = n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break None,
                }
            },
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(frame: &EventFrame, sequence: u64) -> Event {
    let body = serde_json::json!({
        "sequence": sequence,
        "kind": frame.kind.as_str(),
        "value": frame.payload,
        "at": frame.at,
    });
    Event::default().data(body.to_string())
}

fn chrono_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Query grammar: `field=value`, `field__in=a,b`, `field__contains=s`,
/// `field__gte=x`, `field__lte=x`, `field__ne_field=other`, plus the
/// reserved `sort` (`-` prefix descends), `limit`, and `cursor` keys.
pub async fn list_flows(
    State(state): State<AppState>,
    Extension(ctx): Extension<Context>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Page<Suite>>, ApiError> {
    let query = parse_list_query(&params)?;
    let page = state.definitions.list_suites(&ctx, &query)?;
    Ok(Json(page))
}

fn parse_list_query(params: &HashMap<String, String>) -> Result<ListQuery, ApiError> {
    let mut query = ListQuery::default();
    for (key, value) in params {
        match key.as_str() {
            "sort" => {
                let (field, descending) = match value.strip_prefix('-') {
                    Some(rest) => (rest.to_string(), true),
                    None => (value.clone(), false),
                };
                query.sort = Some(Sort { field, descending });
            }
            "limit" => {
                query.limit = value.parse::<usize>().map_err(|_| {
                    ApiError(tribunal_core::errors::CoreError::Invalid(
                        "limit must be an integer".into(),
                    ))
                })?;
            }
            "cursor" => query.cursor = Some(value.clone()),
            _ => {
                let (field, op) = match key.rsplit_once("__") {
                    Some((field, "in")) => (
                        field.to_string(),
                        FilterOp::In(value.split(',').map(scalar).collect()),
                    ),
                    Some((field, "contains")) => {
                        (field.to_string(), FilterOp::Contains(value.clone()))
                    }
                    Some((field, "gte")) => (field.to_string(), FilterOp::Gte(scalar(value))),
                    Some((field, "lte")) => (field.to_string(), FilterOp::Lte(scalar(value))),
                    Some((field, "ne_field")) => {
                        (field.to_string(), FilterOp::NeField(value.clone()))
                    }
                    _ => (key.clone(), FilterOp::Eq(scalar(value))),
                };
                query.filters.push(Filter { field, op });
            }
        }
    }
    Ok(query)
}

fn scalar(raw: &str) -> serde_json::Value {
    if let Ok(n) = raw.parse::<i64>() {
        serde_json::json!(n)
    } else {
        serde_json::json!(raw)
    }
}

pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let metrics = state.connector.metrics();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "connector": metrics,
    }))
}
