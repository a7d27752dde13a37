use std::path::PathBuf;

/// Result alias that carries the custom [`CompanionError`] type.
pub type Result<T> = std::result::Result<T, CompanionError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    /// Free-form error raised by subsystems that have no dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// JSON documents (glTF, model3, configuration) that failed to parse.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// A locator that could not be turned into a fetchable URL.
    #[error("invalid asset url: {0}")]
    Url(#[from] url::ParseError),
    /// A model file that was read but does not match its format.
    #[error("invalid {format} asset: {reason}")]
    InvalidAsset {
        format: &'static str,
        reason: String,
    },
    /// Fetching an asset took longer than the configured load timeout.
    #[error("loading `{path}` timed out after {timeout_ms} ms")]
    LoadTimeout { path: String, timeout_ms: u64 },
    /// A newer load superseded the one in flight. Never surfaced to callers of
    /// `load`, which report it as [`crate::LoadOutcome::Cancelled`] instead.
    #[error("load was superseded by a newer request")]
    Cancelled,
    /// The renderer has been disposed and cannot be reused.
    #[error("renderer has been disposed")]
    Disposed,
    /// An operation that needs a loaded model was called without one.
    #[error("no model is loaded")]
    NotLoaded,
    /// No renderer is able to handle the given file.
    #[error("no renderer can handle `{}`", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("unknown expression `{0}`")]
    UnknownExpression(String),
    #[error("unknown animation `{0}`")]
    UnknownAnimation(String),
    #[error("unknown motion `{group}`[{index}]")]
    UnknownMotion { group: String, index: usize },
    /// The renderer does not implement an optional capability.
    #[error("{0} is not supported by this renderer")]
    Unsupported(&'static str),
    /// Releasing a scene resource failed.
    #[error("resource error: {0}")]
    Resource(String),
}

impl CompanionError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn invalid(format: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidAsset {
            format,
            reason: reason.into(),
        }
    }

    /// Whether this error only signals that a load lost the race to a newer one.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<&str> for CompanionError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for CompanionError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
