use thiserror::Error;

/// Error kinds surfaced by the ingestion path (spec.md §7).
///
/// Most variants never escape the dispatcher's synchronous path — they are
/// logged and counted. `ConfigurationError` and `AckTimeout` are the
/// exceptions: they are mission-level failures the caller may want to act on.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("malformed field `{field}` in `{command}`: {reason}")]
    Parse {
        command: &'static str,
        field: &'static str,
        reason: String,
    },

    #[error("{command}: unknown id {id} not present in {cache} cache")]
    CacheMiss {
        command: &'static str,
        cache: &'static str,
        id: i64,
    },

    #[error("transient backend error in {backend}: {source}")]
    TransientBackend {
        backend: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("ack for `{envelope_type}` was not received within {timeout_secs}s")]
    AckTimeout {
        envelope_type: &'static str,
        timeout_secs: u64,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("handler for `{command}` panicked: {payload}")]
    PanicInHandler { command: String, payload: String },

    #[error("no handler registered for command `{0}`")]
    UnknownCommand(String),

    #[error("dispatch buffer for `{0}` is full")]
    BufferFull(String),
}

pub type Result<T> = std::result::Result<T, RecorderError>;
