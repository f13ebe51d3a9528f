use std::error::Error as StdError;

use crate::ClusterId;

/// Errors surfaced by the connectivity and dispatch layers.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    #[error("unknown cluster: {0}")]
    UnknownCluster(ClusterId),
    #[error("cluster already registered: {0}")]
    AlreadyRegistered(ClusterId),
    #[error("cluster {0} is not connected")]
    NotConnected(ClusterId),
    #[error("connecting to {cluster} failed: {message}")]
    Connection { cluster: ClusterId, message: String },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unsupported resource type: {0}")]
    UnsupportedResource(String),
    #[error("kind {kind} is served by several groups ({}); specify a group", groups.join(", "))]
    AmbiguousKind { kind: String, groups: Vec<String> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(#[source] Box<dyn StdError + Send + Sync>),
    #[error("interceptor ordering: {0}")]
    Ordering(String),
    #[error("interceptor: {0}")]
    Interceptor(anyhow::Error),
    #[error("reconnect to {cluster} gave up after {attempts} attempts")]
    ReconnectExhausted { cluster: ClusterId, attempts: u32 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("registry is shut down")]
    ShutDown,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type TetherResult<T> = Result<T, TetherError>;

impl TetherError {
    pub fn transport<E>(e: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        TetherError::Transport(Box::new(e))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TetherError::NotFound(_))
    }

    /// Recover a `TetherError` that travelled through an interceptor as `anyhow::Error`.
    pub fn from_anyhow(e: anyhow::Error) -> Self {
        match e.downcast::<TetherError>() {
            Ok(te) => te,
            Err(other) => TetherError::Interceptor(other),
        }
    }
}
