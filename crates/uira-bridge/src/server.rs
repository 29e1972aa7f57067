//! HTTP surface.
//!
//! - `GET /health`
//! - `GET /v1/models`
//! - `POST /v1/chat/completions` (JSON, or SSE when `stream: true`)
//! - `OPTIONS *` answered with 204 and permissive CORS headers

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;

use crate::classify::ErrorCategory;
use crate::config::BridgeConfig;
use crate::error::error_response;
use crate::launcher::OutputShape;
use crate::prompt::build_prompt;
use crate::session::RequestContext;
use crate::types::{ChatRequest, HealthResponse, ModelCard, ModelList};

const SERVICE_NAME: &str = "uira-bridge";
const MODEL_OWNER: &str = "google";

struct AppState {
    config: Arc<BridgeConfig>,
    /// Reported as `created` for every model.
    started_at: i64,
}

pub struct BridgeServer {
    config: Arc<BridgeConfig>,
}

impl BridgeServer {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            started_at: chrono::Utc::now().timestamp(),
        });
        Router::new()
            .route("/health", get(health_handler))
            .route("/v1/models", get(models_handler))
            .route("/v1/chat/completions", post(chat_completions_handler))
            .fallback(not_found_handler)
            .layer(middleware::from_fn(cors))
            .with_state(state)
    }

    /// Serve until Ctrl-C or SIGTERM.
    pub async fn start(&self) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;

        tracing::info!(
            addr = %addr,
            agent = %self.config.gemini_bin.display(),
            model = %self.config.default_model,
            "uira-bridge listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server error")?;

        tracing::info!("server stopped");
        Ok(())
    }
}

pub async fn serve(config: BridgeConfig) -> Result<()> {
    BridgeServer::new(config).start().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining connections");
}

async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.config.default_model.clone(),
        approval_mode: state.config.approval_mode.clone(),
    })
}

async fn models_handler(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList {
        object: "list".to_string(),
        data: state
            .config
            .models
            .iter()
            .map(|id| ModelCard {
                id: id.clone(),
                object: "model".to_string(),
                created: state.started_at,
                owned_by: MODEL_OWNER.to_string(),
            })
            .collect(),
    })
}

async fn chat_completions_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::debug!(error = %rejection.body_text(), "rejected chat request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorCategory::InvalidRequest,
                rejection.body_text(),
            );
        }
    };

    let prompt = match build_prompt(&request.messages) {
        Ok(prompt) => prompt,
        Err(e) => return e.into_response(),
    };

    let model = state.config.resolve_model(request.model.as_deref());
    let shape = if request.is_stream() {
        OutputShape::Stream
    } else {
        OutputShape::SingleDocument
    };

    let ctx = match RequestContext::spawn(&state.config, model, prompt, shape) {
        Ok(ctx) => ctx,
        Err(e) => return e.into_response(),
    };

    match shape {
        OutputShape::Stream => (
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
                (HeaderName::from_static("x-accel-buffering"), "no"),
            ],
            Body::from_stream(ctx.into_sse_stream()),
        )
            .into_response(),
        OutputShape::SingleDocument => match ctx.complete().await {
            Ok(document) => Json(document).into_response(),
            Err(e) => e.into_response(),
        },
    }
}

async fn not_found_handler(method: Method, uri: Uri) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        ErrorCategory::NotFound,
        format!("No route for {} {}", method, uri.path()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    async fn start_test_server(config: BridgeConfig) -> String {
        let server = BridgeServer::new(config);
        let app = server.router();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_health_returns_configured_model() {
        let base = start_test_server(BridgeConfig::default()).await;
        let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "uira-bridge");
        assert_eq!(body["model"], "gemini-2.5-pro");
        assert_eq!(body["approvalMode"], "yolo");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_models_share_startup_timestamp() {
        let base = start_test_server(BridgeConfig::default()).await;
        let body: Value = reqwest::get(format!("{}/v1/models", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["object"], "list");
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0]["id"], "gemini-2.5-pro");
        assert_eq!(data[0]["owned_by"], "google");
        assert!(data.iter().all(|m| m["object"] == "model" && m["created"] == data[0]["created"]));
    }

    #[tokio::test]
    async fn test_options_preflight() {
        let base = start_test_server(BridgeConfig::default()).await;
        let resp = reqwest::Client::new()
            .request(reqwest::Method::OPTIONS, format!("{}/v1/chat/completions", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
        assert!(resp.headers().contains_key("access-control-allow-methods"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404_error_body() {
        let base = start_test_server(BridgeConfig::default()).await;
        let resp = reqwest::get(format!("{}/v2/nothing", base)).await.unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "not_found");
        assert_eq!(body["error"]["code"], "not_found");
        assert!(body["error"]["message"].as_str().unwrap().contains("/v2/nothing"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_request() {
        let base = start_test_server(BridgeConfig::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", base))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn test_empty_messages_rejected_before_spawn() {
        let config = BridgeConfig {
            gemini_bin: "/nonexistent/uira-bridge-test/gemini".into(),
            ..BridgeConfig::default()
        };
        let base = start_test_server(config).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", base))
            .json(&serde_json::json!({"messages": []}))
            .send()
            .await
            .unwrap();
        // A spawn attempt would have produced binary_not_found instead.
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_missing_binary_is_500() {
        let config = BridgeConfig {
            gemini_bin: "/nonexistent/uira-bridge-test/gemini".into(),
            ..BridgeConfig::default()
        };
        let base = start_test_server(config).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", base))
            .json(&serde_json::json!({"messages": [{"role": "user", "content": "hi"}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "binary_not_found");
    }
}
