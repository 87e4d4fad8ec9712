//! Top-level error types for Pulsebot.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Load {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Streaming-response decode errors.
///
/// A fragment that is not yet parseable is not an error at all; the tracker
/// simply waits for more input. These variants cover the terminal cases.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("response stream ended with {buffered} unparseable buffered bytes")]
    Truncated { buffered: usize },

    #[error("element {index} is not a valid action: {source}")]
    Decode {
        index: usize,
        source: serde_json::Error,
    },

    #[error("model transport failed: {0}")]
    Transport(String),
}

/// Errors local to executing one action. Never fatal to the channel worker:
/// the failing action is logged and skipped, the queue continues.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("message {message_id} not found on the messaging surface")]
    MessageNotFound { message_id: i64 },

    #[error("memory cell {id} not found under topic {topic:?}")]
    CellNotFound { topic: String, id: i64 },

    #[error("messaging surface call failed: {0}")]
    Surface(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Memory store persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("failed to save memory snapshot: {0}")]
    Save(String),

    #[error("failed to load memory snapshot: {0}")]
    Load(String),

    #[error("failed to back up memory snapshot: {0}")]
    Backup(String),
}

/// Request-level agent errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("no channel selected")]
    ChannelNotSelected,

    #[error("author {author:?} is not authorized for {command}")]
    Unauthorized { command: String, author: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
