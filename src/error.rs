use thiserror::Error;

use crate::core::task::TaskId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Rejected credentials or a failed auth call. The message is shown to the user as-is.
    #[error("{0}")]
    Auth(String),

    /// A mutation was attempted without a signed-in user. Raised before any network call.
    #[error("User not authenticated")]
    NotAuthenticated,

    #[error("Store returned {status}: {message}")]
    Store { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed row: {0}")]
    Decode(String),

    /// The task still carries a client-local id; its insert has not been confirmed yet.
    #[error("Task {0} is still being created")]
    PendingIdentity(TaskId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn store(status: u16, message: impl Into<String>) -> Self {
        Self::Store {
            status,
            message: message.into(),
        }
    }

    /// Whether the error came from the store or the transport, as opposed to local validation.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Store { .. } | Self::Http(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
