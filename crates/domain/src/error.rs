/// Shared error type used across all cascade crates.
///
/// Variants map one-to-one onto the engine's error taxonomy; `kind()` gives
/// the stable string recorded in echo error entries and log rows.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema or ward violation that the cell loop may recover from by
    /// looping with a corrective message.
    #[error("validation: {0}")]
    Validation(String),

    /// Transient provider failure (5xx, timeout). Retried with backoff
    /// inside a single turn.
    #[error("provider transient: {0}")]
    ProviderTransient(String),

    /// Permanent provider failure (4xx, auth). Fails the cell.
    #[error("provider: {0}")]
    ProviderPermanent(String),

    /// Tool invocation failure. Fed back to the model as an error
    /// tool_result rather than aborting the turn.
    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Deterministic cell failure. Fatal unless the cell declares
    /// `rules.on_error`.
    #[error("deterministic cell {cell} ({tool}): {message}")]
    Deterministic {
        cell: String,
        tool: String,
        message: String,
    },

    /// A ward with `on_fail: fail` rejected the output.
    #[error("ward: {0}")]
    WardFatal(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("checkpoint cancelled: {0}")]
    CheckpointCancelled(String),

    /// Post-run analytics failure. Swallowed by the worker, never
    /// visible to the cascade.
    #[error("analytics: {0}")]
    Analytics(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable kind string for error records and log rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Validation(_) => "validation",
            Error::ProviderTransient(_) => "provider_transient",
            Error::ProviderPermanent(_) => "provider_permanent",
            Error::Tool { .. } => "tool",
            Error::Deterministic { .. } => "deterministic",
            Error::WardFatal(_) => "ward_fatal",
            Error::Timeout(_) => "timeout",
            Error::CheckpointCancelled(_) => "checkpoint_cancelled",
            Error::Analytics(_) => "analytics",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }

    /// Whether the cell loop should retry the provider call that produced
    /// this error (capped backoff, does not consume a turn).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ProviderTransient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
