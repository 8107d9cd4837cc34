//! Management REST handlers
//!
//! Config, rules, logs, and health. Every JSON response uses the
//! `{success, data?, error?}` envelope.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use engine::{ConfigPatch, EngineError, RuleDraft};

use crate::server::AppState;
use crate::services::upstream::UpstreamClient;

fn ok(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

fn fail(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
}

pub async fn get_config<U>(State(state): State<AppState<U>>) -> Json<Value>
where
    U: UpstreamClient + 'static,
{
    let config = state.engine.config().await;
    ok(json!(config))
}

pub async fn update_config<U>(
    State(state): State<AppState<U>>,
    Json(patch): Json<ConfigPatch>,
) -> Json<Value>
where
    U: UpstreamClient + 'static,
{
    let config = state.engine.update_config(patch).await;
    info!(
        "config updated: target={:?} enabled={}",
        config.target_url, config.enabled
    );
    ok(json!(config))
}

pub async fn list_rules<U>(State(state): State<AppState<U>>) -> Json<Value>
where
    U: UpstreamClient + 'static,
{
    let rules: Vec<Value> = state
        .engine
        .list_rules()
        .await
        .iter()
        .map(|rule| json!(rule.to_wire()))
        .collect();
    ok(Value::Array(rules))
}

pub async fn get_rule<U>(
    State(state): State<AppState<U>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)>
where
    U: UpstreamClient + 'static,
{
    match state.engine.get_rule(&id).await {
        Some(rule) => Ok(ok(json!(rule.to_wire()))),
        None => Err(fail(StatusCode::NOT_FOUND, format!("Rule not found: {id}"))),
    }
}

pub async fn create_rule<U>(
    State(state): State<AppState<U>>,
    Json(draft): Json<RuleDraft>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>
where
    U: UpstreamClient + 'static,
{
    match state.engine.create_rule(draft).await {
        Ok(rule) => {
            info!("rule created: {} ({})", rule.name, rule.id);
            Ok((StatusCode::CREATED, ok(json!(rule.to_wire()))))
        }
        Err(err @ EngineError::MissingField { .. })
        | Err(err @ EngineError::UnknownChaosType { .. })
        | Err(err @ EngineError::DuplicateRuleId { .. }) => {
            Err(fail(StatusCode::BAD_REQUEST, err.to_string()))
        }
        Err(err) => Err(fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
    }
}

pub async fn update_rule<U>(
    State(state): State<AppState<U>>,
    Path(id): Path<String>,
    Json(patch): Json<RuleDraft>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)>
where
    U: UpstreamClient + 'static,
{
    match state.engine.update_rule(&id, patch).await {
        Ok(rule) => Ok(ok(json!(rule.to_wire()))),
        Err(EngineError::RuleNotFound { id }) => {
            Err(fail(StatusCode::NOT_FOUND, format!("Rule not found: {id}")))
        }
        Err(err) => Err(fail(StatusCode::BAD_REQUEST, err.to_string())),
    }
}

pub async fn delete_rule<U>(
    State(state): State<AppState<U>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)>
where
    U: UpstreamClient + 'static,
{
    match state.engine.delete_rule(&id).await {
        Ok(()) => {
            info!("rule deleted: {id}");
            Ok(ok(json!({ "deleted": id })))
        }
        Err(EngineError::RuleNotFound { id }) => {
            Err(fail(StatusCode::NOT_FOUND, format!("Rule not found: {id}")))
        }
        Err(err) => Err(fail(StatusCode::BAD_REQUEST, err.to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

pub async fn read_logs<U>(
    State(state): State<AppState<U>>,
    Query(query): Query<LogQuery>,
) -> Json<Value>
where
    U: UpstreamClient + 'static,
{
    let logs = state.engine.read_logs(query.limit).await;
    ok(json!(logs))
}

pub async fn clear_logs<U>(State(state): State<AppState<U>>) -> Json<Value>
where
    U: UpstreamClient + 'static,
{
    let cleared = state.engine.clear_logs().await;
    info!("cleared {cleared} log entries");
    ok(json!({ "cleared": cleared }))
}

pub async fn health<U>(State(state): State<AppState<U>>) -> Json<Value>
where
    U: UpstreamClient + 'static,
{
    ok(json!({
        "status": "healthy",
        "uptimeSeconds": state.engine.uptime_seconds(),
        "rules": state.engine.list_rules().await.len(),
    }))
}
