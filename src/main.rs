mod downloader;
mod encoder;

use std::{collections::HashSet, sync::Arc};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{net::TcpListener, time::Duration};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::downloader::Y2MateClient;
use crate::encoder::{Encoder, MemoryTokenStore, TokenStore};

#[derive(Clone)]
struct AppState {
    encoder: Arc<Encoder>,
    http_client: reqwest::Client,
    upstream_domain: Option<String>,
}

const DEFAULT_ACTION: &str = "download";
const DEFAULT_QUALITY: &str = "360";
const DEFAULT_UPSTREAM_TIMEOUT_SECONDS: usize = 30;

#[derive(Debug, Default, Deserialize)]
struct ApiParams {
    action: Option<String>,
    url: Option<String>,
    quality: Option<String>,
    task_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "y2mate_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let key = std::env::var("ENCRYPTION_KEY")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
        .ok_or_else(|| {
            ApiError::internal("ENCRYPTION_KEY is not set. Provide the token encryption secret.")
        })?;

    let store: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::default());
    let encoder = Arc::new(
        Encoder::new(&key, store)
            .map_err(|error| ApiError::internal(format!("Invalid ENCRYPTION_KEY: {error}")))?,
    );

    let timeout_seconds = read_usize_env("UPSTREAM_TIMEOUT_SECONDS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECONDS);
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds as u64))
        .build()
        .map_err(|error| ApiError::internal(format!("Could not build HTTP client: {error}")))?;

    let upstream_domain = std::env::var("Y2MATE_BASE_URL")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string));
    if let Some(domain) = &upstream_domain {
        info!("Upstream domain pinned to {domain}");
    }

    let state = AppState {
        encoder,
        http_client,
        upstream_domain,
    };

    let cors = build_cors_layer()?;

    let app = Router::new()
        .route("/", get(index))
        .route("/api/health", get(health))
        .route("/api/y2mate", get(y2mate_query).post(y2mate_json))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("Backend listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn index() -> Json<Value> {
    Json(serde_json::json!({
        "message": "Y2Mate relay API",
        "endpoints": {
            "/api/y2mate": {
                "methods": ["GET", "POST"],
                "params": ["action=download|status", "url", "quality", "task_id"],
                "example": "/api/y2mate?action=download&url=VIDEO_URL&quality=360"
            }
        }
    }))
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn y2mate_query(
    State(state): State<AppState>,
    Query(params): Query<ApiParams>,
) -> Result<Json<Value>, ApiError> {
    dispatch(state, params).await
}

async fn y2mate_json(
    State(state): State<AppState>,
    Json(params): Json<ApiParams>,
) -> Result<Json<Value>, ApiError> {
    dispatch(state, params).await
}

async fn dispatch(state: AppState, params: ApiParams) -> Result<Json<Value>, ApiError> {
    let action = params
        .action
        .as_deref()
        .and_then(non_empty)
        .unwrap_or(DEFAULT_ACTION);
    let client = Y2MateClient::new(
        state.http_client.clone(),
        Arc::clone(&state.encoder),
        state.upstream_domain.as_deref(),
    );

    match action {
        "download" => {
            let url = params
                .url
                .as_deref()
                .and_then(non_empty)
                .ok_or_else(|| ApiError::bad_request("Missing required field: url"))?;
            let quality = params
                .quality
                .as_deref()
                .and_then(non_empty)
                .unwrap_or(DEFAULT_QUALITY);
            Ok(Json(client.download(url, Some(quality)).await))
        }
        "status" => {
            let task_id = params
                .task_id
                .as_deref()
                .and_then(non_empty)
                .ok_or_else(|| ApiError::bad_request("Missing required field: task_id"))?;
            Ok(Json(client.status(task_id).await))
        }
        other => Err(ApiError::bad_request(format!(
            "Invalid action: {other}. Allowed: download | status"
        ))),
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8787".to_string()
}

fn build_cors_layer() -> Result<CorsLayer, ApiError> {
    let configured = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Requests from any origin will be accepted.");
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any));
    }

    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://domain.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });
    info!(
        "CORS allow-list loaded with {} origin(s)",
        allowed_origins.len()
    );

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let port = parsed.port();

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    let include_port = port.is_some_and(|explicit| explicit != default_port);

    if include_port {
        Some(format!("{scheme}://{host}:{}", port?))
    } else {
        Some(format!("{scheme}://{host}"))
    }
}
