//! Runtime error kinds. Configuration problems are fatal at startup;
//! everything else is retried with back-off at the smallest scope that can
//! recover (see the supervisor loop in `forward`).

use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("authentication rejected by '{server}': {reason}")]
    Auth { server: String, reason: String },

    #[error("transport failure on '{server}': {reason}")]
    Transport { server: String, reason: String },

    #[error("session to '{server}' is closed")]
    SessionClosed { server: String },

    #[error("listener failure on {addr}: {source}")]
    Listener {
        addr: String,
        source: std::io::Error,
    },

    #[error("unknown server '{0}'")]
    UnknownServer(String),

    #[error("unknown forward '{0}'")]
    UnknownForward(String),
}

impl Error {
    pub(crate) fn transport(server: impl Into<String>, reason: impl ToString) -> Self {
        Error::Transport {
            server: server.into(),
            reason: reason.to_string(),
        }
    }

    /// True when retrying cannot help (bad config, unknown names). The
    /// supervisor retries everything else.
    pub fn is_non_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::UnknownServer(_) | Error::UnknownForward(_)
        )
    }
}
