//! Panic boundary for handler execution.
//!
//! A panicking handler must never take down the unit, the dispatching task
//! or the kernel. Every execution mode runs the handler future through
//! [`catch_panic`] and turns a caught panic into a fault reply.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Poll `future` to completion, capturing a panic as its message.
pub async fn catch_panic<F>(future: F) -> Result<F::Output, String>
where
    F: Future,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|payload| extract_panic_message(&payload))
}

/// Extract panic message from panic payload.
pub fn extract_panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_catch_panic_passes_output_through() {
        let out = catch_panic(async { 42 }).await;
        assert_eq!(out, Ok(42));
    }

    #[tokio::test]
    async fn test_catch_panic_captures_message() {
        let out: Result<(), String> = catch_panic(async {
            panic!("{}", "dynamic panic message");
        })
        .await;
        assert_eq!(out.unwrap_err(), "dynamic panic message");
    }

    #[test]
    fn test_extract_panic_message_unknown_payload() {
        let payload = std::panic::catch_unwind(|| std::panic::panic_any(17_u8)).unwrap_err();
        assert_eq!(extract_panic_message(&payload), "Unknown panic (no message)");
    }
}
