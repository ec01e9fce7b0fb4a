//! Built-in handlers mounted by the `synego` binary.

use serde_json::json;

use crate::envelope::Request;
use crate::registry::{handler_fn, ExecutionMode, HandlerModule, HandlerSpec};

/// Echo handlers, handy for smoke-testing transports.
///
/// - `/echo` (inline) returns the request body.
/// - `/echo/describe` (pooled, exact path) describes how the request arrived.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoModule;

impl HandlerModule for EchoModule {
    fn module_id(&self) -> &str {
        "builtin"
    }

    fn handlers(&self) -> Vec<HandlerSpec> {
        vec![
            HandlerSpec::new("echo", "/echo", handler_fn(|req: Request| async move { Ok(req.body) }))
                .mode(ExecutionMode::Inline)
                .concurrent(64),
            HandlerSpec::new(
                "describe",
                "/echo/describe",
                handler_fn(|req: Request| async move {
                    Ok(json!(format!(
                        "{}://{} said ({}) to {}: {}",
                        req.protocol,
                        req.event,
                        req.method,
                        req.host.as_deref().unwrap_or("unknown"),
                        req.body,
                    )))
                }),
            )
            .only_full_path(true)
            .concurrent(3),
        ]
    }
}
