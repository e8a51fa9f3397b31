use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn, Level};

use crate::{
    app_context::AppContext,
    config::GatewayConfig,
    logging::{self, LoggingConfig},
    protocols::responses::ResponsesListQuery,
    routers::OpenAIRouter,
};

/// Requests larger than this are rejected before parsing.
const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<OpenAIRouter>,
    pub context: Arc<AppContext>,
}

async fn healthz() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn v1_models(State(state): State<Arc<AppState>>) -> Response {
    state.router.models()
}

async fn v1_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.router.route_chat(&headers, body).await
}

async fn v1_responses_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.router.route_responses(&headers, body).await
}

async fn v1_responses_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResponsesListQuery>,
) -> Response {
    state.router.list_responses(query.limit.as_deref()).await
}

async fn v1_responses_get(
    State(state): State<Arc<AppState>>,
    Path(response_id): Path<String>,
) -> Response {
    state.router.get_response(&response_id).await
}

async fn v1_responses_delete(
    State(state): State<Arc<AppState>>,
    Path(response_id): Path<String>,
) -> Response {
    state.router.delete_response(&response_id).await
}

/// Build the HTTP application. Every API route is served both under
/// `/v1/...` and `/openai/v1/...`.
pub fn build_app(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/models", get(v1_models))
        .route("/v1/chat/completions", post(v1_chat_completions))
        .route(
            "/v1/responses",
            post(v1_responses_create).get(v1_responses_list),
        )
        .route(
            "/v1/responses/{response_id}",
            get(v1_responses_get).delete(v1_responses_delete),
        );

    Router::new()
        .route("/healthz", get(healthz))
        .merge(api.clone())
        .nest("/openai", api)
        .layer(axum::extract::DefaultBodyLimit::max(MAX_PAYLOAD_SIZE))
        .layer(create_cors_layer())
        .with_state(state)
}

pub async fn startup(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

    let _log_guard = if !LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        Some(logging::init_logging(LoggingConfig {
            level: config
                .log_level
                .as_deref()
                .and_then(|value| match value.to_uppercase().parse::<Level>() {
                    Ok(level) => Some(level),
                    Err(_) => {
                        warn!("Invalid log level string: '{value}'. Defaulting to INFO.");
                        None
                    }
                })
                .unwrap_or(Level::INFO),
            json_format: false,
            log_dir: config.log_dir.clone(),
            colorize: true,
            log_file_name: "m365-gateway".to_string(),
        }))
    } else {
        None
    };

    let listen_url = config.listen_url.clone();
    info!(
        "Starting gateway on {} | default transport: {} | model: {}",
        listen_url, config.transport, config.default_model
    );

    let context = Arc::new(AppContext::from_config(config)?);
    let router = Arc::new(OpenAIRouter::new(context.clone()));
    let state = Arc::new(AppState { router, context });
    let app = build_app(state);

    let listener = TcpListener::bind(&listen_url)
        .await
        .map_err(|err| format!("Failed to bind to {}: {}", listen_url, err))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| Box::new(err) as Box<dyn std::error::Error>)?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}

fn create_cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::Any;

    tower_http::cors::CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
        .max_age(Duration::from_secs(3600))
}
