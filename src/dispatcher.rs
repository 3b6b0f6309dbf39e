//! Command dispatcher (§4.5).
//!
//! Central multiplexer from command string to wrapped handler. Registration
//! composes a handler in a fixed order — inner handler, then optional
//! buffering, then optional logging around the inner handler so logs fire
//! at processing time even when buffered — and the command-to-handler map
//! is copy-on-replace the way the spec's concurrency model requires
//! (`register` may run concurrently with `dispatch`/`has_handler`).

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, error, info};

use crate::error::RecorderError;
use crate::metrics::{CommandMetrics, DispatcherMetrics};

pub type HandlerResult = Result<String, RecorderError>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
pub type HandlerFn = Arc<dyn Fn(Vec<String>) -> HandlerFuture + Send + Sync>;

/// An externally-closable signal a `Gated` consumer waits on before it
/// starts draining its channel. Fires exactly once; late waiters that
/// arrive after firing proceed immediately.
#[derive(Default)]
pub struct Gate {
    fired: AtomicBool,
    notify: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opens the gate. Logs once at INFO, matching the spec's "an INFO log
    /// is emitted when the gate opens".
    pub fn fire(&self, command: &str) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            info!(command, "dispatcher gate opened");
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        let notified = self.notify.notified();
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

#[derive(Default, Clone)]
pub struct RegisterOptions {
    pub buffer_size: Option<usize>,
    pub blocking: bool,
    pub gate: Option<Arc<Gate>>,
    pub logged: bool,
}

impl RegisterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffered(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    pub fn gated(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn logged(mut self) -> Self {
        self.logged = true;
        self
    }
}

struct QueueItem {
    args: Vec<String>,
}

enum Submit {
    Direct(HandlerFn),
    Buffered {
        tx: mpsc::Sender<QueueItem>,
        blocking: bool,
        queue_len: Arc<AtomicUsize>,
    },
}

struct CommandEntry {
    submit: Submit,
    metrics: CommandMetrics,
}

fn wrap_logged(command: Arc<str>, handler: HandlerFn, logged: bool) -> HandlerFn {
    if !logged {
        return handler;
    }
    Arc::new(move |args: Vec<String>| {
        let handler = handler.clone();
        let command = command.clone();
        Box::pin(async move {
            debug!(%command, ?args, "dispatcher: handler entry");
            let started = Instant::now();
            let result = handler(args).await;
            match &result {
                Ok(_) => debug!(%command, elapsed = ?started.elapsed(), "dispatcher: handler success"),
                Err(e) => error!(%command, elapsed = ?started.elapsed(), error = %e, "dispatcher: handler failure"),
            }
            result
        })
    })
}

/// Wraps a handler so a panic inside it is caught, logged, and turned into
/// a `PanicInHandler` error instead of unwinding the consumer task.
async fn call_with_panic_isolation(command: &str, handler: &HandlerFn, args: Vec<String>) -> HandlerResult {
    match AssertUnwindSafe(handler(args)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "<non-string panic payload>".to_string()
            };
            error!(command, panic_payload = %message, "dispatcher: handler panicked, recovered");
            Err(RecorderError::PanicInHandler {
                command: command.to_string(),
                payload: message,
            })
        }
    }
}

pub struct Dispatcher {
    commands: RwLock<HashMap<String, Arc<CommandEntry>>>,
    metrics: DispatcherMetrics,
}

impl Dispatcher {
    pub fn new(meter: opentelemetry::metrics::Meter) -> Result<Self, RecorderError> {
        Ok(Self {
            commands: RwLock::new(HashMap::new()),
            metrics: DispatcherMetrics::new(meter)?,
        })
    }

    pub async fn has_handler(&self, command: &str) -> bool {
        self.commands.read().await.contains_key(command)
    }

    /// Registers a handler for `command`, replacing any prior registration.
    /// Safe to call concurrently with `dispatch`/`has_handler`.
    pub async fn register(
        &self,
        command: impl Into<String>,
        handler: HandlerFn,
        opts: RegisterOptions,
    ) -> Result<(), RecorderError> {
        let command: Arc<str> = Arc::from(command.into());
        let logged_handler = wrap_logged(command.clone(), handler, opts.logged);

        // Buffered commands need a channel + queue-length counter in place
        // before the gauge metric can be registered, but the consumer task
        // that drains the channel must record `processed` against that same
        // metric once it actually finishes a handler — so the channel is
        // built first, metrics second, and the consumer is spawned last.
        enum PendingSubmit {
            Direct,
            Buffered {
                rx: mpsc::Receiver<QueueItem>,
                tx: mpsc::Sender<QueueItem>,
                queue_len: Arc<AtomicUsize>,
            },
        }

        let pending = match opts.buffer_size {
            None => PendingSubmit::Direct,
            Some(size) => {
                let (tx, rx) = mpsc::channel::<QueueItem>(size);
                PendingSubmit::Buffered {
                    rx,
                    tx,
                    queue_len: Arc::new(AtomicUsize::new(0)),
                }
            }
        };

        let metrics = {
            let read_len_submit = match &pending {
                PendingSubmit::Direct => None,
                PendingSubmit::Buffered { queue_len, .. } => Some(queue_len.clone()),
            };
            self.metrics.for_command(&command, move || {
                read_len_submit
                    .as_ref()
                    .map(|l| l.load(Ordering::SeqCst) as u64)
                    .unwrap_or(0)
            })?
        };

        let submit = match pending {
            PendingSubmit::Direct => Submit::Direct(logged_handler),
            PendingSubmit::Buffered { mut rx, tx, queue_len } => {
                let consumer_len = queue_len.clone();
                let consumer_command = command.clone();
                let consumer_handler = logged_handler.clone();
                let consumer_metrics = metrics.clone();
                let gate = opts.gate.clone();

                tokio::spawn(async move {
                    if let Some(gate) = &gate {
                        gate.wait().await;
                    }
                    while let Some(item) = rx.recv().await {
                        consumer_len.fetch_sub(1, Ordering::SeqCst);
                        if call_with_panic_isolation(&consumer_command, &consumer_handler, item.args)
                            .await
                            .is_ok()
                        {
                            consumer_metrics.record_processed();
                        }
                    }
                });

                Submit::Buffered {
                    tx,
                    blocking: opts.blocking,
                    queue_len,
                }
            }
        };

        let entry = Arc::new(CommandEntry { submit, metrics });
        self.commands.write().await.insert(command.to_string(), entry);
        Ok(())
    }

    /// Routes one event. Unknown commands error; otherwise the wrapped
    /// handler's result, or `"queued"` if the command is buffered and the
    /// submit succeeded.
    pub async fn dispatch(&self, command: &str, args: Vec<String>) -> HandlerResult {
        let entry = {
            let map = self.commands.read().await;
            map.get(command).cloned()
        };
        let Some(entry) = entry else {
            return Err(RecorderError::UnknownCommand(command.to_string()));
        };

        match &entry.submit {
            Submit::Direct(handler) => {
                let result = call_with_panic_isolation(command, handler, args).await;
                if result.is_ok() {
                    entry.metrics.record_processed();
                }
                result
            }
            Submit::Buffered { tx, blocking, queue_len } => {
                let item = QueueItem { args };
                if *blocking {
                    if tx.send(item).await.is_err() {
                        return Err(RecorderError::UnknownCommand(command.to_string()));
                    }
                    queue_len.fetch_add(1, Ordering::SeqCst);
                    Ok("queued".to_string())
                } else {
                    match tx.try_send(item) {
                        Ok(()) => {
                            queue_len.fetch_add(1, Ordering::SeqCst);
                            Ok("queued".to_string())
                        }
                        Err(_) => {
                            entry.metrics.record_dropped();
                            Err(RecorderError::BufferFull(command.to_string()))
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn test_meter() -> opentelemetry::metrics::Meter {
        opentelemetry::global::meter("mission_recorder_tests")
    }

    fn counting_handler(counter: Arc<AtomicU32>) -> HandlerFn {
        Arc::new(move |_args| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("ok".to_string())
            })
        })
    }

    #[tokio::test]
    async fn unknown_command_errors() {
        let d = Dispatcher::new(test_meter()).unwrap();
        let result = d.dispatch(":NOPE:", vec![]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn buffered_without_blocking_drops_when_full() {
        let d = Dispatcher::new(test_meter()).unwrap();
        let gate = Gate::new();
        let counter = Arc::new(AtomicU32::new(0));
        d.register(
            ":SLOW:",
            counting_handler(counter.clone()),
            RegisterOptions::new().buffered(2).gated(gate.clone()),
        )
        .await
        .unwrap();

        // Gate never fires in this test, so the consumer never drains —
        // every dispatch only exercises the channel's own capacity.
        assert_eq!(d.dispatch(":SLOW:", vec![]).await.unwrap(), "queued");
        assert_eq!(d.dispatch(":SLOW:", vec![]).await.unwrap(), "queued");
        let third = d.dispatch(":SLOW:", vec![]).await;
        assert!(third.is_err());
    }

    #[tokio::test]
    async fn blocking_buffered_one_blocks_until_slot_frees() {
        let d = Dispatcher::new(test_meter()).unwrap();
        let counter = Arc::new(AtomicU32::new(0));
        let release = Arc::new(Notify::new());
        let release_wait = release.clone();

        let handler: HandlerFn = Arc::new(move |_args| {
            let counter = counter.clone();
            let release_wait = release_wait.clone();
            Box::pin(async move {
                release_wait.notified().await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("ok".to_string())
            })
        });

        d.register(":ONE:", handler, RegisterOptions::new().buffered(1).blocking())
            .await
            .unwrap();

        // First dispatch is picked up by the consumer and blocks inside the handler.
        assert_eq!(d.dispatch(":ONE:", vec![]).await.unwrap(), "queued");
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Second dispatch fills the single channel slot.
        let d2 = Arc::new(d);
        let d2_clone = d2.clone();
        assert_eq!(d2_clone.dispatch(":ONE:", vec![]).await.unwrap(), "queued");

        // Third dispatch must block: nothing is free until the handler unblocks.
        let d3 = d2.clone();
        let third = tokio::spawn(async move { d3.dispatch(":ONE:", vec![]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third.is_finished());

        release.notify_waiters();
        let result = tokio::time::timeout(Duration::from_secs(1), third)
            .await
            .expect("third dispatch should complete after release")
            .unwrap();
        assert_eq!(result.unwrap(), "queued");
    }

    #[tokio::test]
    async fn gated_consumer_preserves_submission_order() {
        let d = Dispatcher::new(test_meter()).unwrap();
        let gate = Gate::new();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::<u32>::new()));

        for i in 0..5u32 {
            let order = order.clone();
            let handler: HandlerFn = Arc::new(move |_args| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().await.push(i);
                    Ok("ok".to_string())
                })
            });
            d.register(
                format!(":GATED:{i}:"),
                handler,
                RegisterOptions::new().buffered(10).gated(gate.clone()),
            )
            .await
            .unwrap();
        }

        for i in 0..5u32 {
            d.dispatch(&format!(":GATED:{i}:"), vec![]).await.unwrap();
        }

        // None handled before the gate fires.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(order.lock().await.is_empty());

        gate.fire("test");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = order.lock().await.clone();
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn panic_in_handler_is_recovered_and_consumer_continues() {
        let d = Dispatcher::new(test_meter()).unwrap();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let handler: HandlerFn = Arc::new(move |args: Vec<String>| {
            let counter = counter_clone.clone();
            Box::pin(async move {
                if args.first().map(|s| s.as_str()) == Some("boom") {
                    panic!("synthetic handler panic");
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("ok".to_string())
            })
        });

        d.register(":MAYBE_PANIC:", handler, RegisterOptions::new())
            .await
            .unwrap();

        assert!(d.dispatch(":MAYBE_PANIC:", vec!["boom".to_string()]).await.is_err());
        assert!(d.dispatch(":MAYBE_PANIC:", vec!["fine".to_string()]).await.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
