use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State, multipart::MultipartRejection},
    http::{HeaderValue, Method, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::warn;

use crate::{
    config::AppConfig,
    error::ServiceError,
    governor::MemoryInfo,
    jobs::{
        JobOrchestrator, JobProgress, SubmittedJob, Upload,
        layout::{OUTPUTS_ROUTE, UPLOADS_ROUTE},
    },
    model::{ModelDescriptor, ModelRegistry},
};

/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
    pub orchestrator: Arc<JobOrchestrator>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    device: String,
    timestamp: String,
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<ModelDescriptor>,
}

#[derive(Serialize)]
struct SystemResponse {
    #[serde(flatten)]
    memory: MemoryInfo,
    jobs_in_flight: usize,
}

pub fn build_router(config: Arc<AppConfig>, registry: Arc<ModelRegistry>) -> Router {
    let orchestrator = Arc::new(JobOrchestrator::new(config.as_ref(), registry.clone()));
    let layout = orchestrator.layout().clone();
    let body_limit = config.max_file_size + MULTIPART_OVERHEAD;
    let cors = cors_layer(&config.cors_origins);

    let state = AppState {
        orchestrator,
        registry,
        config,
    };

    Router::new()
        .route("/", get(root))
        .route("/api/health", get(health))
        .route("/api/models", get(models))
        .route("/api/system", get(system))
        .route("/api/colorize", post(colorize))
        .route("/api/progress/:file_id", get(progress))
        .route("/api/download/:file_id", get(download))
        .nest_service(UPLOADS_ROUTE, ServeDir::new(layout.upload_dir()))
        .nest_service(OUTPUTS_ROUTE, ServeDir::new(layout.output_dir()))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Image Colorization API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model_loaded: state.registry.is_loaded(),
        device: state.registry.device(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.registry.descriptors(),
    })
}

async fn system(State(state): State<AppState>) -> Json<SystemResponse> {
    Json(SystemResponse {
        memory: state.registry.memory_info(),
        jobs_in_flight: state.orchestrator.jobs_in_flight(),
    })
}

async fn colorize(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<SubmittedJob>, ServiceError> {
    // An unavailable engine wins over any problem with the payload.
    if !state.registry.is_loaded() {
        return Err(ServiceError::EngineUnavailable);
    }
    let mut multipart = multipart.map_err(|_| ServiceError::MissingField("file"))?;
    let upload = read_upload(&mut multipart, state.orchestrator.max_file_size()).await?;

    let submitted = state.orchestrator.submit(upload).await?;
    Ok(Json(submitted))
}

/// Pull the `file` part out of the form, refusing to buffer past `max_bytes`.
async fn read_upload(multipart: &mut Multipart, max_bytes: usize) -> Result<Upload, ServiceError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::Validation(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);

        let mut buffer = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ServiceError::Validation(e.body_text()))?
        {
            if buffer.len() + chunk.len() > max_bytes {
                return Err(ServiceError::Validation(format!(
                    "File size too large (max {}MB)",
                    max_bytes / (1024 * 1024)
                )));
            }
            buffer.extend_from_slice(&chunk);
        }

        return Ok(Upload {
            file_name,
            content_type,
            bytes: Bytes::from(buffer),
        });
    }

    Err(ServiceError::MissingField("file"))
}

async fn progress(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Json<JobProgress> {
    Json(state.orchestrator.status(&file_id).await)
}

async fn download(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Response, ServiceError> {
    let artifact = state.orchestrator.fetch(&file_id).await?;
    let disposition = format!("attachment; filename=\"{}\"", artifact.file_name);

    Ok((
        [
            (header::CONTENT_TYPE, artifact.content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.bytes,
    )
        .into_response())
}
