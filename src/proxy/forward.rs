use axum::body::{Body, Bytes};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Response, StatusCode};
use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;

use crate::config::UpstreamTarget;

use super::context::RequestContext;

#[derive(Debug, Error)]
pub enum ForwardError {
    /// The request context was cancelled, or the client deadline passed.
    #[error("upstream request cancelled or timed out")]
    Timeout,
    #[error("upstream transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("invalid upstream url {0}")]
    InvalidTarget(String),
    #[error("failed to encode upstream request body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ForwardError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ForwardError::Timeout
        } else {
            ForwardError::Transport(e)
        }
    }
}

impl ForwardError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ForwardError::Timeout)
    }

    pub fn class(&self) -> &'static str {
        match self {
            ForwardError::Timeout => "timeout",
            ForwardError::Transport(_) => "upstream_transport_error",
            ForwardError::InvalidTarget(_) => "target_build_error",
            ForwardError::Encode(_) => "encode_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Chat,
    Code,
}

impl Endpoint {
    pub fn name(self) -> &'static str {
        match self {
            Endpoint::Chat => "chat",
            Endpoint::Code => "code",
        }
    }

    fn upstream_suffix(self) -> &'static str {
        match self {
            Endpoint::Chat => "/chat/completions",
            Endpoint::Code => "/completions",
        }
    }
}

pub fn upstream_url(base_url: &str, endpoint: Endpoint) -> Result<reqwest::Url, ForwardError> {
    let full = format!(
        "{}{}",
        base_url.trim_end_matches('/'),
        endpoint.upstream_suffix()
    );
    reqwest::Url::parse(&full).map_err(|e| ForwardError::InvalidTarget(format!("{full}: {e}")))
}

/// POST `body` to the endpoint's upstream and wait for the response headers.
/// The call is dropped as soon as `ctx` is cancelled.
pub async fn forward(
    client: &Client,
    ctx: &RequestContext,
    endpoint: Endpoint,
    target: UpstreamTarget<'_>,
    body: Vec<u8>,
) -> Result<reqwest::Response, ForwardError> {
    let url = upstream_url(target.base_url, endpoint)?;

    let mut builder = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .bearer_auth(target.api_key)
        .body(body);
    if !target.organization.is_empty() {
        builder = builder.header("OpenAI-Organization", target.organization);
    }
    if !target.project.is_empty() {
        builder = builder.header("OpenAI-Project", target.project);
    }

    match ctx.run(builder.send()).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(ForwardError::Timeout),
    }
}

pub fn content_type(resp: &reqwest::Response) -> Option<HeaderValue> {
    resp.headers().get(CONTENT_TYPE).cloned()
}

/// Read the rest of an upstream body, e.g. to log an error response. The response is
/// consumed either way, which releases the connection.
pub async fn drain_body(
    resp: reqwest::Response,
    ctx: &RequestContext,
) -> Result<Bytes, ForwardError> {
    match ctx.run(resp.bytes()).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(ForwardError::Timeout),
    }
}

fn with_status_and_type(
    body: Body,
    status: StatusCode,
    content_type: Option<HeaderValue>,
) -> Response<Body> {
    let mut out = Response::new(body);
    *out.status_mut() = status;
    if let Some(ct) = content_type {
        out.headers_mut().insert(CONTENT_TYPE, ct);
    }
    out
}

/// Relay an upstream response as it arrives: status, `Content-Type` (when present) and
/// the raw body stream. The stream ends early if `ctx` is cancelled. `observe` sees every
/// chunk and is dropped together with the body.
pub fn relay<F>(resp: reqwest::Response, ctx: &RequestContext, mut observe: F) -> Response<Body>
where
    F: FnMut(&Result<Bytes, reqwest::Error>) + Send + 'static,
{
    let status = resp.status();
    let ct = content_type(&resp);
    let stream = resp
        .bytes_stream()
        .take_until(ctx.token().cancelled_owned())
        .inspect(move |chunk| observe(chunk));
    with_status_and_type(Body::from_stream(stream), status, ct)
}

/// Same shape as `relay`, for a body that has already been read.
pub fn relay_buffered(
    status: StatusCode,
    content_type: Option<HeaderValue>,
    body: Bytes,
) -> Response<Body> {
    with_status_and_type(Body::from(body), status, content_type)
}
