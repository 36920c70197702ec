use actix_web::{HttpRequest, HttpResponse, web};
use constant_time_eq::constant_time_eq;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use sync::error::ErrorKind;
use sync::pipeline::{RunOptions, parse_only_filter, run_once};
use sync::types::RunSummary;

use crate::AppState;

/// JSON body accepted by `POST /run`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunRequest {
    #[serde(default)]
    pub full_reload: bool,
    /// Entity filter; items may themselves be comma-separated.
    #[serde(default)]
    pub only: Vec<String>,
}

/// Query parameters accepted by `GET /run`.
#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    #[serde(default)]
    pub full_reload: bool,
    /// Comma-separated entity filter.
    pub only: Option<String>,
}

/// Liveness probe.
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({"ok": true}))
}

/// `POST /run` with an optional JSON body.
pub async fn trigger_run(
    request: HttpRequest,
    state: web::Data<AppState>,
    body: Option<web::Json<RunRequest>>,
) -> HttpResponse {
    let body = body.map(web::Json::into_inner).unwrap_or_default();
    let options = RunOptions {
        full_reload: body.full_reload,
        only: parse_only_filter(&body.only),
    };

    execute_run(&request, &state, options).await
}

/// `GET /run`, for manual triggering with query parameters.
pub async fn trigger_run_query(
    request: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<RunQuery>,
) -> HttpResponse {
    let only = query
        .only
        .as_ref()
        .map(|raw| vec![raw.clone()])
        .unwrap_or_default();
    let options = RunOptions {
        full_reload: query.full_reload,
        only: parse_only_filter(&only),
    };

    execute_run(&request, &state, options).await
}

async fn execute_run(
    request: &HttpRequest,
    state: &web::Data<AppState>,
    options: RunOptions,
) -> HttpResponse {
    if !authorized(request, state) {
        return HttpResponse::Unauthorized().json(json!({
            "status": "unauthorized",
            "error": "missing or invalid bearer token",
        }));
    }

    // Concurrent runs of the same entity race on staging contents, so only
    // one run may be active per process.
    let Ok(_guard) = state.run_lock.try_lock() else {
        return HttpResponse::Conflict().json(json!({
            "status": "conflict",
            "error": "a sync run is already in progress",
        }));
    };

    match run_once(state.config.clone(), options).await {
        Ok(summary) if summary.all_failed() => {
            error!(run_id = %summary.run_id, "every entity in the run failed");
            HttpResponse::InternalServerError().json(summary_json("failed", &summary))
        }
        Ok(summary) => HttpResponse::Ok().json(summary_json("ok", &summary)),
        Err(error) if error.kind() == ErrorKind::ConfigError => {
            HttpResponse::BadRequest().json(json!({
                "status": "invalid",
                "error": error.to_string(),
            }))
        }
        Err(error) => {
            error!(%error, "sync run could not be executed");
            HttpResponse::InternalServerError().json(json!({
                "status": "error",
                "error": error.to_string(),
            }))
        }
    }
}

/// Renders the run summary as the trigger response payload.
fn summary_json(status: &str, summary: &RunSummary) -> serde_json::Value {
    let per_entity: serde_json::Map<String, serde_json::Value> = summary
        .entities
        .iter()
        .map(|outcome| (outcome.entity.clone(), json!(outcome.rows_written)))
        .collect();

    let errors: serde_json::Map<String, serde_json::Value> = summary
        .entities
        .iter()
        .filter_map(|outcome| {
            outcome
                .error
                .as_ref()
                .map(|error| (outcome.entity.clone(), json!(error.to_string())))
        })
        .collect();

    json!({
        "status": status,
        "run_id": summary.run_id,
        "full_reload": summary.full_reload,
        "total_rows": summary.total_rows(),
        "per_entity": per_entity,
        "errors": errors,
        "match_report": summary.match_report,
    })
}

/// Validates the bearer token when one is configured.
///
/// Comparison is constant-time to avoid leaking the token through timing.
fn authorized(request: &HttpRequest, state: &web::Data<AppState>) -> bool {
    let Some(expected) = &state.config.api.auth_token else {
        return true;
    };

    let provided = request
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match provided {
        Some(token) => constant_time_eq(token.as_bytes(), expected.expose_secret().as_bytes()),
        None => false,
    }
}
