use thiserror::Error;

#[derive(Error, Debug)]
pub enum CmdletError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Source / build-resolver errors
    #[error("Invalid command source: {reason}")]
    InvalidSource { reason: String },

    #[error("unsupported image: {image}")]
    UnsupportedImage { image: String },

    // Resource-limit errors
    #[error("image size {size} exceeds plan limit of {limit} bytes")]
    ImageTooLarge { size: i64, limit: i64 },

    #[error("command limit reached ({max} commands allowed by plan)")]
    CommandLimit { max: u32 },

    // Engine errors
    #[error("Container engine error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Image build failed: {0}")]
    Build(String),

    // Distinguished timeout condition; always reported the same way
    // regardless of what the container was doing.
    #[error("maximum runtime exceeded")]
    RuntimeExceeded,

    // Session errors
    #[error("Session error: {0}")]
    Session(String),

    #[error("session does not support agent forwarding")]
    AgentUnsupported,

    #[error("access denied for '{subject}'")]
    AccessDenied { subject: String },

    // Store errors
    #[error("Command not found: {owner}/{name}")]
    CommandNotFound { owner: String, name: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CmdletError {
    /// True for errors produced before any container resources exist,
    /// i.e. rejected input rather than a failed engine operation.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidSource { .. } | Self::UnsupportedImage { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CmdletError>;
