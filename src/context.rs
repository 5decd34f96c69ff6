//! Request-scoped context that follows a bulk session across threads
//!
//! Retry rounds run wherever the scheduler fires them, usually on a
//! different worker than the one that submitted the batch. Anything the
//! caller attached to the request (headers such as an opaque id, the current
//! tracing span) is snapshotted when a retry is scheduled and restored when
//! it runs.

use std::collections::BTreeMap;
use std::future::Future;
use tracing::Instrument;

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
}

/// Headers attached to the request currently being served
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    headers: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// The context active on the current task, if any
    pub fn current() -> Option<RequestContext> {
        REQUEST_CONTEXT.try_with(|ctx| ctx.clone()).ok()
    }

    /// Runs `fut` with this context active
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        REQUEST_CONTEXT.scope(self, fut).await
    }

    /// Runs `f` with this context active
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        REQUEST_CONTEXT.sync_scope(self, f)
    }
}

/// Everything ambient that has to survive a thread hand-off
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    request: Option<RequestContext>,
    span: tracing::Span,
}

impl ContextSnapshot {
    /// Captures the request context and tracing span of the caller
    pub fn capture() -> Self {
        Self {
            request: RequestContext::current(),
            span: tracing::Span::current(),
        }
    }

    pub fn request(&self) -> Option<&RequestContext> {
        self.request.as_ref()
    }

    /// Runs `f` with the captured context restored
    pub fn run<R>(self, f: impl FnOnce() -> R) -> R {
        let _entered = self.span.enter();
        match self.request {
            Some(ctx) => ctx.sync_scope(f),
            None => f(),
        }
    }

    /// Wraps `fut` so it polls with the captured context restored
    pub fn instrument<F: Future>(self, fut: F) -> impl Future<Output = F::Output> {
        let fut = fut.instrument(self.span);
        let request = self.request;
        async move {
            match request {
                Some(ctx) => ctx.scope(fut).await,
                None => fut.await,
            }
        }
    }
}

/// Snapshots the caller's context now and restores it when `task` runs
pub fn preserve<F>(task: F) -> Box<dyn FnOnce() + Send + 'static>
where
    F: FnOnce() + Send + 'static,
{
    let snapshot = ContextSnapshot::capture();
    Box::new(move || snapshot.run(task))
}
