use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

mod catalog;
pub mod context;
pub mod forward;
pub mod handlers;
pub mod transform;

use crate::config::RelayConfig;
use crate::logging::RequestLogger;

const CHAT_PATHS: [&str; 2] = ["/v1/chat/completions", "/v1/v1/chat/completions"];
const CODE_PATHS: [&str; 2] = [
    "/v1/engines/copilot-codex/completions",
    "/v1/v1/engines/copilot-codex/completions",
];

/// Build the shared upstream client: optional outbound proxy and overall timeout.
pub fn build_client(cfg: &RelayConfig) -> Result<Client> {
    let mut builder = Client::builder();
    if cfg.timeout > 0 {
        builder = builder.timeout(Duration::from_secs(cfg.timeout));
    }
    if !cfg.proxy_url.trim().is_empty() {
        let proxy = reqwest::Proxy::all(cfg.proxy_url.trim())
            .with_context(|| format!("invalid proxy_url {:?}", cfg.proxy_url))?;
        builder = builder.proxy(proxy);
    }
    builder.build().context("failed to build upstream http client")
}

/// Chat and code-completion relay. Cheap to clone; every clone shares the client,
/// the config snapshot and the shutdown token.
#[derive(Clone)]
pub struct ProxyService {
    pub client: Client,
    pub config: Arc<RelayConfig>,
    logger: RequestLogger,
    shutdown: CancellationToken,
}

impl ProxyService {
    pub fn new(client: Client, config: Arc<RelayConfig>) -> Self {
        let logger = RequestLogger::from_config(config.request_log);
        Self {
            client,
            config,
            logger,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_logger(mut self, logger: RequestLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Cancelling this token aborts every in-flight upstream call.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_gated(&self) -> bool {
        !self.config.auth_token.is_empty()
    }
}

#[derive(Debug, Serialize)]
struct Pong {
    now: u64,
    status: &'static str,
    ns1: &'static str,
}

async fn ping() -> Json<Pong> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Json(Pong {
        now,
        status: "ok",
        ns1: "200 OK",
    })
}

#[derive(Clone)]
struct AuthToken(Arc<str>);

#[derive(Deserialize)]
struct TokenParam {
    token: String,
}

/// Path-token gate: the `{token}` segment must equal the configured token exactly.
async fn auth_gate(
    State(expected): State<AuthToken>,
    Path(param): Path<TokenParam>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if param.token != *expected.0 {
        warn!(path = %req.uri().path(), "rejecting request with wrong path token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }
    next.run(req).await
}

fn completion_routes(proxy: &ProxyService) -> Router {
    let prefix = if proxy.is_gated() { "/{token}" } else { "" };
    let mut routes = Router::new();
    for path in CHAT_PATHS {
        let p = proxy.clone();
        routes = routes.route(
            &format!("{prefix}{path}"),
            post(move |req| handlers::chat_completions(p.clone(), req)),
        );
    }
    for path in CODE_PATHS {
        let p = proxy.clone();
        routes = routes.route(
            &format!("{prefix}{path}"),
            post(move |req| handlers::code_completions(p.clone(), req)),
        );
    }
    if proxy.is_gated() {
        let token = AuthToken(Arc::from(proxy.config.auth_token.as_str()));
        routes = routes.route_layer(middleware::from_fn_with_state(token, auth_gate));
    }
    routes
}

pub fn router(proxy: ProxyService) -> Router {
    Router::new()
        .route("/_ping", get(ping))
        .route("/models", get(catalog::models))
        .route("/v1/models", get(catalog::models))
        .merge(completion_routes(&proxy))
        .layer(middleware::from_fn_with_state(
            proxy.shutdown_token(),
            context::attach_context,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
