use std::future::Future;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-request cancellation scope. Derived from the server shutdown token, so stopping the
/// server cancels every outstanding upstream call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: String,
    cancel: CancellationToken,
}

/// The awaited future lost the race against cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl RequestContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive `fut` unless the context is cancelled first. Cancellation drops `fut`.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Cancelled),
            out = fut => Ok(out),
        }
    }
}

/// Middleware: attach a fresh `RequestContext` unless an outer layer already did.
pub async fn attach_context(
    State(shutdown): State<CancellationToken>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if req.extensions().get::<RequestContext>().is_none() {
        req.extensions_mut()
            .insert(RequestContext::new(shutdown.child_token()));
    }
    next.run(req).await
}

/// Context for a request that arrived without the middleware (direct handler calls).
pub fn context_of(req: &Request<Body>) -> RequestContext {
    req.extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(|| RequestContext::new(CancellationToken::new()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn run_returns_output_when_not_cancelled() {
        let ctx = RequestContext::new(CancellationToken::new());
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn run_short_circuits_on_already_cancelled_context() {
        let ctx = RequestContext::new(CancellationToken::new());
        ctx.token().cancel();
        assert_eq!(ctx.run(async { 7 }).await, Err(Cancelled));
    }

    #[tokio::test]
    async fn parent_cancellation_interrupts_pending_future() {
        let shutdown = CancellationToken::new();
        let ctx = RequestContext::new(shutdown.child_token());
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let out = ctx
            .run(tokio::time::sleep(Duration::from_secs(30)))
            .await;
        assert_eq!(out, Err(Cancelled));
        assert!(ctx.is_cancelled());
    }
}
