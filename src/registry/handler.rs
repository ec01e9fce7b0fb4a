//! Handler descriptors and the loader seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::envelope::{Protocol, Reply, Request};

/// Failure produced by a handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// Deliberate error reply, forwarded to the caller unchanged.
    #[error("{code}: {error}")]
    Reply { code: u16, error: String },

    /// Unexpected fault; surfaces as a generic 500.
    #[error("handler fault: {0}")]
    Fault(String),
}

impl HandlerError {
    pub fn reply(code: u16, error: impl Into<String>) -> Self {
        Self::Reply {
            code,
            error: error.into(),
        }
    }

    pub fn fault(msg: impl Into<String>) -> Self {
        Self::Fault(msg.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fault(err.to_string())
    }
}

/// Handler callback.
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Value, HandlerError>;

    /// Readiness hook run once inside a pooled unit before it takes tasks.
    async fn on_mount(&self) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Adapter turning an async closure into an [`ActionHandler`].
pub struct FnHandler<F>(F);

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnHandler")
    }
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<Value, HandlerError> {
        (self.0)(request).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// How a handler is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Called directly on the dispatching task.
    Inline,
    /// Fresh isolated unit per call, torn down afterwards.
    Ephemeral,
    /// Long-lived supervised unit shared by all calls.
    #[default]
    Pooled,
}

/// Registration descriptor.
#[derive(Clone)]
pub struct HandlerSpec {
    pub name: String,
    pub url: String,
    /// Empty means any protocol.
    pub protocols: Vec<Protocol>,
    /// Empty means any method.
    pub methods: Vec<String>,
    pub only_full_path: bool,
    /// 0 means unbounded.
    pub concurrent: usize,
    pub mode: ExecutionMode,
    pub handler: Arc<dyn ActionHandler>,
}

impl HandlerSpec {
    pub fn new(name: impl Into<String>, url: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            protocols: Vec::new(),
            methods: Vec::new(),
            only_full_path: false,
            concurrent: 0,
            mode: ExecutionMode::default(),
            handler,
        }
    }

    pub fn protocols(mut self, protocols: impl IntoIterator<Item = Protocol>) -> Self {
        self.protocols = protocols.into_iter().collect();
        self
    }

    pub fn methods<S: Into<String>>(mut self, methods: impl IntoIterator<Item = S>) -> Self {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn only_full_path(mut self, only_full_path: bool) -> Self {
        self.only_full_path = only_full_path;
        self
    }

    pub fn concurrent(mut self, concurrent: usize) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

impl fmt::Debug for HandlerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSpec")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("protocols", &self.protocols)
            .field("methods", &self.methods)
            .field("only_full_path", &self.only_full_path)
            .field("concurrent", &self.concurrent)
            .field("mode", &self.mode)
            .finish()
    }
}

/// A loadable group of handlers.
pub trait HandlerModule: Send + Sync {
    /// Stable identity, the first half of every action id.
    fn module_id(&self) -> &str;

    fn handlers(&self) -> Vec<HandlerSpec>;
}

/// Run a handler and fold its outcome into a reply. `fault_reply` is used
/// for faults; deliberate error replies pass through.
pub(crate) async fn run_to_reply(
    handler: &dyn ActionHandler,
    request: Request,
    fault_reply: fn() -> Reply,
) -> Reply {
    match super::recovery::catch_panic(handler.handle(request)).await {
        Ok(Ok(data)) => Reply::Success(data),
        Ok(Err(HandlerError::Reply { code, error })) => Reply::failure(code, error),
        Ok(Err(HandlerError::Fault(msg))) => {
            tracing::error!("handler fault: {}", msg);
            fault_reply()
        }
        Err(panic_msg) => {
            tracing::error!("handler panicked: {}", panic_msg);
            fault_reply()
        }
    }
}
