use std::time::{Duration, Instant};

use axum::body::{Body, Bytes, to_bytes};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Request, Response, StatusCode};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::logging::{BODY_PREVIEW_MAX, RequestLog, RequestLogger, make_body_preview, now_ms};

use super::ProxyService;
use super::context::{RequestContext, context_of};
use super::forward::{
    Endpoint, ForwardError, content_type, drain_body, forward, relay, relay_buffered,
    upstream_url,
};
use super::transform::{encode_code_body, transform_chat, transform_code};

/// Largest inbound request body accepted by the completion endpoints.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
/// Fixed pacing applied to every code-completion request before any work.
pub const CODE_ADMISSION_DELAY: Duration = Duration::from_millis(200);
pub const CODE_ABORT_BODY: &str = "data: [DONE]\n";

/// The editor's completion client only understands event streams, so code-completion
/// failures are reported as a terminated stream with the failure status.
pub fn abort_codex(status: StatusCode) -> Response<Body> {
    let mut resp = Response::new(Body::from(CODE_ABORT_BODY));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    resp
}

fn bare_status(status: StatusCode) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = status;
    resp
}

/// Status reported to the caller for a failed upstream call.
fn forward_error_status(err: &ForwardError) -> StatusCode {
    if err.is_timeout() {
        StatusCode::REQUEST_TIMEOUT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[derive(Debug, Error)]
enum InboundError {
    #[error("failed to read request body: {0}")]
    Read(#[source] axum::Error),
    #[error("request body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request body is not a JSON object")]
    NotObject,
}

async fn read_json_object(body: Body) -> Result<Map<String, Value>, InboundError> {
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(InboundError::Read)?;
    match serde_json::from_slice::<Value>(&bytes)? {
        Value::Object(map) => Ok(map),
        _ => Err(InboundError::NotObject),
    }
}

/// Bookkeeping for one proxied request; written to the request log when it finishes.
struct Exchange {
    logger: RequestLogger,
    ctx: RequestContext,
    endpoint: Endpoint,
    path: String,
    start: Instant,
    requested_model: Option<String>,
    upstream_model: Option<String>,
    upstream_url: Option<String>,
    upstream_status: Option<u16>,
}

impl Exchange {
    fn new(proxy: &ProxyService, ctx: &RequestContext, endpoint: Endpoint, path: &str) -> Self {
        let upstream_url = {
            let cfg = &proxy.config;
            let base = match endpoint {
                Endpoint::Chat => cfg.chat_api_base.as_str(),
                Endpoint::Code => cfg.codex_api_base.as_str(),
            };
            upstream_url(base, endpoint).ok().map(|u| u.to_string())
        };
        Self {
            logger: proxy.logger.clone(),
            ctx: ctx.clone(),
            endpoint,
            path: path.to_string(),
            start: Instant::now(),
            requested_model: None,
            upstream_model: None,
            upstream_url,
            upstream_status: None,
        }
    }

    fn note_models(&mut self, requested: Option<String>, body: &Map<String, Value>) {
        self.requested_model = requested;
        self.upstream_model = body
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string);
    }

    fn finish(
        &self,
        status: StatusCode,
        error_class: Option<&str>,
        error: Option<String>,
        upstream_body: Option<(&[u8], Option<&HeaderValue>)>,
    ) {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        debug!(
            endpoint = self.endpoint.name(),
            status = status.as_u16(),
            duration_ms,
            "request finished"
        );
        let logger = &self.logger;
        if !logger.is_enabled() {
            return;
        }
        let upstream_response_body = upstream_body.map(|(bytes, ct)| {
            make_body_preview(bytes, ct.and_then(|v| v.to_str().ok()), BODY_PREVIEW_MAX)
        });
        logger.write(&RequestLog {
            request_id: self.ctx.id.clone(),
            timestamp_ms: now_ms(),
            endpoint: self.endpoint.name(),
            path: self.path.clone(),
            status_code: status.as_u16(),
            duration_ms,
            requested_model: self.requested_model.clone(),
            upstream_model: self.upstream_model.clone(),
            upstream_url: self.upstream_url.clone(),
            upstream_status: self.upstream_status,
            error_class: error_class.map(str::to_string),
            error,
            upstream_response_body,
        });
    }
}

/// Rides along with a relayed body and logs the exchange once the body is dropped, so
/// `duration_ms` covers the whole stream.
struct StreamEnd {
    exchange: Exchange,
    status: StatusCode,
    error: Option<String>,
}

impl StreamEnd {
    fn observe(&mut self, chunk: &Result<Bytes, reqwest::Error>) {
        if let Err(e) = chunk
            && self.error.is_none()
        {
            self.error = Some(e.to_string());
        }
    }
}

impl Drop for StreamEnd {
    fn drop(&mut self) {
        let error = self.error.take();
        let class = if error.is_some() {
            Some("stream_error")
        } else if self.exchange.ctx.is_cancelled() {
            Some("stream_cancelled")
        } else {
            None
        };
        self.exchange.finish(self.status, class, error, None);
    }
}

fn relay_and_log(resp: reqwest::Response, exchange: Exchange) -> Response<Body> {
    let ctx = exchange.ctx.clone();
    let mut end = StreamEnd {
        exchange,
        status: resp.status(),
        error: None,
    };
    relay(resp, &ctx, move |chunk| end.observe(chunk))
}

#[instrument(skip_all, fields(endpoint = "chat", request_id = tracing::field::Empty))]
pub async fn chat_completions(proxy: ProxyService, req: Request<Body>) -> Response<Body> {
    let ctx = context_of(&req);
    tracing::Span::current().record("request_id", ctx.id.as_str());
    let path = req.uri().path().to_string();
    let mut exchange = Exchange::new(&proxy, &ctx, Endpoint::Chat, &path);

    let mut body = match read_json_object(req.into_body()).await {
        Ok(b) => b,
        Err(e) => {
            warn!("rejecting chat request: {e}");
            exchange.finish(
                StatusCode::BAD_REQUEST,
                Some("bad_request"),
                Some(e.to_string()),
                None,
            );
            return bare_status(StatusCode::BAD_REQUEST);
        }
    };

    let requested = body.get("model").and_then(Value::as_str).map(str::to_string);
    transform_chat(&mut body, &proxy.config);
    exchange.note_models(requested, &body);

    let payload = match serde_json::to_vec(&body) {
        Ok(p) => p,
        Err(e) => {
            let err = ForwardError::from(e);
            exchange.finish(
                StatusCode::INTERNAL_SERVER_ERROR,
                Some(err.class()),
                Some(err.to_string()),
                None,
            );
            return bare_status(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let resp = match forward(
        &proxy.client,
        &ctx,
        Endpoint::Chat,
        proxy.config.chat_target(),
        payload,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            let status = forward_error_status(&e);
            if !e.is_timeout() {
                warn!("request conversation failed: {e}");
            }
            exchange.finish(status, Some(e.class()), Some(e.to_string()), None);
            return bare_status(status);
        }
    };

    let status = resp.status();
    exchange.upstream_status = Some(status.as_u16());
    if status != StatusCode::OK {
        // Non-200 answers are passed through as-is; only the body is buffered for the log.
        let ct = content_type(&resp);
        let bytes = match drain_body(resp, &ctx).await {
            Ok(b) => b,
            Err(e) => {
                let status = forward_error_status(&e);
                exchange.finish(status, Some(e.class()), Some(e.to_string()), None);
                return bare_status(status);
            }
        };
        warn!(
            "request chat completions failed: status={} body={}",
            status.as_u16(),
            String::from_utf8_lossy(&bytes)
        );
        exchange.finish(
            status,
            Some("upstream_status"),
            None,
            Some((&bytes[..], ct.as_ref())),
        );
        return relay_buffered(status, ct, bytes);
    }

    relay_and_log(resp, exchange)
}

#[instrument(skip_all, fields(endpoint = "code", request_id = tracing::field::Empty))]
pub async fn code_completions(proxy: ProxyService, req: Request<Body>) -> Response<Body> {
    let ctx = context_of(&req);
    tracing::Span::current().record("request_id", ctx.id.as_str());
    let path = req.uri().path().to_string();
    let mut exchange = Exchange::new(&proxy, &ctx, Endpoint::Code, &path);

    tokio::time::sleep(CODE_ADMISSION_DELAY).await;
    if ctx.is_cancelled() {
        exchange.finish(StatusCode::REQUEST_TIMEOUT, Some("timeout"), None, None);
        return abort_codex(StatusCode::REQUEST_TIMEOUT);
    }

    let mut body = match read_json_object(req.into_body()).await {
        Ok(b) => b,
        Err(e) => {
            warn!("rejecting code completion request: {e}");
            exchange.finish(
                StatusCode::BAD_REQUEST,
                Some("bad_request"),
                Some(e.to_string()),
                None,
            );
            return abort_codex(StatusCode::BAD_REQUEST);
        }
    };

    let requested = body.get("model").and_then(Value::as_str).map(str::to_string);
    let style = transform_code(&mut body, &proxy.config);
    exchange.note_models(requested, &body);
    debug!(?style, "code completion prompt style");

    let payload = match encode_code_body(&body, style) {
        Ok(p) => p,
        Err(e) => {
            let err = ForwardError::from(e);
            exchange.finish(
                StatusCode::INTERNAL_SERVER_ERROR,
                Some(err.class()),
                Some(err.to_string()),
                None,
            );
            return abort_codex(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let resp = match forward(
        &proxy.client,
        &ctx,
        Endpoint::Code,
        proxy.config.codex_target(),
        payload,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            let status = forward_error_status(&e);
            if !e.is_timeout() {
                warn!("request completions failed: {e}");
            }
            exchange.finish(status, Some(e.class()), Some(e.to_string()), None);
            return abort_codex(status);
        }
    };

    let status = resp.status();
    exchange.upstream_status = Some(status.as_u16());
    if status != StatusCode::OK {
        let ct = content_type(&resp);
        match drain_body(resp, &ctx).await {
            Ok(bytes) => {
                warn!(
                    "request completions failed: status={} body={}",
                    status.as_u16(),
                    String::from_utf8_lossy(&bytes)
                );
                exchange.finish(
                    status,
                    Some("upstream_status"),
                    None,
                    Some((&bytes[..], ct.as_ref())),
                );
            }
            Err(e) => {
                warn!(
                    "request completions failed: status={} (body unavailable: {e})",
                    status.as_u16()
                );
                exchange.finish(status, Some("upstream_status"), Some(e.to_string()), None);
            }
        }
        return abort_codex(status);
    }

    relay_and_log(resp, exchange)
}
