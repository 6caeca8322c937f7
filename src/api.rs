use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use url::Url;

use crate::{
    app_state::{AppState, Status},
    audit::AuditReport,
    error::ConfigError,
    evidence_gate::GateStats,
    rerun::{RerunOutcome, RerunRecord},
};

// --- Payloads y respuestas de la API ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAuditPayload {
    call_id: String,
    audit_config_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RerunPayload {
    #[serde(default)]
    instructions: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RerunResponse {
    rerun: RerunRecord,
    gate_stats: GateStats,
    audit: AuditReport,
}

impl From<RerunOutcome> for RerunResponse {
    fn from(outcome: RerunOutcome) -> Self {
        Self {
            rerun: outcome.record,
            gate_stats: outcome.stats,
            audit: outcome.report,
        }
    }
}

type ApiError = (StatusCode, Json<serde_json::Value>);

/// Errores de configuración → 400; el resto → 500.
fn api_error(context: &str, err: anyhow::Error) -> ApiError {
    let status = if ConfigError::find_in(&err).is_some() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    error!("{context}: {err:#}");
    (status, Json(json!({ "error": format!("{context}: {err:#}") })))
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/audits/run", post(run_audit_handler))
        .route("/api/audits/:audit_id/steps/:position/rerun", post(rerun_step_handler))
        .route(
            "/api/audits/:audit_id/steps/:position/control-points/:index/rerun",
            post(rerun_control_point_handler),
        )
        .route("/api/status", get(status_handler))
        .route("/api/health", get(health_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

/// Marca un trabajo en curso en el `Status`. Se cierra siempre al soltarse,
/// también si axum descarta el handler porque el cliente se desconectó.
struct JobGuard {
    status: Arc<Mutex<Status>>,
    outcome: Option<String>,
}

impl JobGuard {
    fn begin(status: Arc<Mutex<Status>>, message: String) -> Self {
        status.lock().unwrap_or_else(PoisonError::into_inner).begin(message);
        Self { status, outcome: None }
    }

    fn finish(mut self, message: String) {
        self.outcome = Some(message);
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let message = self
            .outcome
            .take()
            .unwrap_or_else(|| "Petición interrumpida antes de terminar.".to_string());
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish(message);
    }
}

// --- Handlers ---

#[axum::debug_handler]
async fn run_audit_handler(
    State(state): State<AppState>,
    Json(payload): Json<RunAuditPayload>,
) -> Result<Json<AuditReport>, ApiError> {
    let job = JobGuard::begin(
        state.status.clone(),
        format!("Auditando la llamada '{}' con '{}'...", payload.call_id, payload.audit_config_id),
    );
    let result = state
        .runner
        .run(&payload.call_id, &payload.audit_config_id)
        .await;

    match result {
        Ok(report) => {
            job.finish(format!(
                "¡Auditoría completada! {}: {}/{} ({} %)",
                report.call_id, report.totals.total_score, report.totals.max_score, report.totals.percentage
            ));
            Ok(Json(report))
        }
        Err(err) => {
            job.finish(format!("Error en la auditoría: {err}"));
            Err(api_error("Error al ejecutar la auditoría", err))
        }
    }
}

#[axum::debug_handler]
async fn rerun_step_handler(
    State(state): State<AppState>,
    Path((audit_id, position)): Path<(String, u32)>,
    Json(payload): Json<RerunPayload>,
) -> Result<Json<RerunResponse>, ApiError> {
    let job = JobGuard::begin(
        state.status.clone(),
        format!("Re-ejecutando la etapa {position} de '{audit_id}'..."),
    );
    let result = state
        .reruns
        .rerun_step(&audit_id, position, payload.instructions.as_deref())
        .await;
    job.finish(format!("Re-ejecución de la etapa {position} terminada."));

    result
        .map(|outcome| Json(outcome.into()))
        .map_err(|err| api_error("Error al re-ejecutar la etapa", err))
}

#[axum::debug_handler]
async fn rerun_control_point_handler(
    State(state): State<AppState>,
    Path((audit_id, position, index)): Path<(String, u32, usize)>,
    Json(payload): Json<RerunPayload>,
) -> Result<Json<RerunResponse>, ApiError> {
    let job = JobGuard::begin(
        state.status.clone(),
        format!("Re-ejecutando el punto {index} de la etapa {position} de '{audit_id}'..."),
    );
    let result = state
        .reruns
        .rerun_control_point(&audit_id, position, index, payload.instructions.as_deref())
        .await;
    job.finish(format!("Re-ejecución del punto {index} terminada."));

    result
        .map(|outcome| Json(outcome.into()))
        .map_err(|err| api_error("Error al re-ejecutar el punto de control", err))
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(
        state
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone(),
    )
}

#[axum::debug_handler]
async fn health_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let browser_url = match Url::parse(&state.config.neo4j_uri) {
        Ok(mut url) => {
            let _ = url.set_scheme("http");
            let _ = url.set_port(Some(7474));
            url.to_string()
        }
        Err(_) => "http://localhost:7474".to_string(),
    };

    match state.store.ping().await {
        Ok(()) => Ok(Json(json!({
            "status": "ok",
            "browser_url": browser_url,
            "llm_model": state.config.llm_chat_model,
        }))),
        Err(e) => {
            error!("Error en el health check de Neo4j: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state
        .shutdown_sender
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
    {
        let _ = sender.send(());
    }
    StatusCode::OK
}
