//! Host-calling-convention shim (§6).
//!
//! The host's extension loader expects a synchronous
//! `(command, args) -> short string` entry point. This module is
//! deliberately thin: it blocks the calling thread on the dispatcher's
//! async `dispatch` via a runtime handle and translates errors into short
//! tokens. It is not a reimplementation of the host's extension ABI —
//! building the actual `extern "C"` calling convention (argument marshalling,
//! the host's async callback channel) is the out-of-scope part.

use std::sync::Arc;

use crate::dispatcher::Dispatcher;

/// Called from the host's main thread. `runtime` must be a handle to the
/// multi-threaded runtime the rest of the crate already runs on; this
/// function blocks it, so it must never be invoked from inside that
/// runtime's own worker threads.
pub fn call_extension(
    runtime: &tokio::runtime::Handle,
    dispatcher: &Arc<Dispatcher>,
    command: &str,
    args: Vec<String>,
) -> String {
    let dispatcher = dispatcher.clone();
    let command = command.to_string();
    match runtime.block_on(async move { dispatcher.dispatch(&command, args).await }) {
        Ok(token) => token,
        Err(e) => format!("ERROR:{e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::RegisterOptions;

    #[test]
    fn call_extension_returns_ok_token_for_direct_handler() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let meter = opentelemetry::global::meter("test");
        let dispatcher = Arc::new(runtime.block_on(async { Dispatcher::new(meter).unwrap() }));
        runtime
            .block_on(dispatcher.register(
                ":PING:",
                Arc::new(|_args| Box::pin(async { Ok("PONG".to_string()) })),
                RegisterOptions::new(),
            ))
            .unwrap();

        let result = call_extension(runtime.handle(), &dispatcher, ":PING:", vec![]);
        assert_eq!(result, "PONG");
    }

    #[test]
    fn call_extension_returns_error_token_for_unknown_command() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let meter = opentelemetry::global::meter("test");
        let dispatcher = Arc::new(runtime.block_on(async { Dispatcher::new(meter).unwrap() }));

        let result = call_extension(runtime.handle(), &dispatcher, ":NOPE:", vec![]);
        assert!(result.starts_with("ERROR:"));
    }
}
