use std::path::PathBuf;

use thiserror::Error;

/// Exit status read by the MTA: accepted.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit status read by the MTA: bounce the message.
pub const EXIT_PERMANENT: i32 = 100;
/// Exit status read by the MTA: keep the message queued and retry later.
pub const EXIT_TEMPORARY: i32 = 111;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("malformed recipient address: {0}")]
    MalformedAddress(String),

    #[error("no mailbox found for {0}")]
    UnknownRecipient(String),

    #[error("directory store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("directory store query failed: {0}")]
    StoreQuery(String),

    #[error("{} is not a valid maildir: {reason}", .path.display())]
    InvalidMaildir { path: PathBuf, reason: String },

    #[error("{action} {} failed: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("program {0} does not exist or is not executable")]
    NotExecutable(String),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid destination {0:?}")]
    InvalidDestination(String),

    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
}

impl DeliveryError {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DeliveryError::Io {
            action,
            path: path.into(),
            source,
        }
    }

    /// Map the failure onto the MTA's exit-status classes.
    /// Malformed addresses are retried, not bounced.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeliveryError::UnknownRecipient(_) | DeliveryError::InvalidMaildir { .. } => {
                EXIT_PERMANENT
            }
            DeliveryError::MalformedAddress(_)
            | DeliveryError::StoreUnavailable(_)
            | DeliveryError::StoreQuery(_)
            | DeliveryError::Io { .. }
            | DeliveryError::NotExecutable(_)
            | DeliveryError::Spawn { .. }
            | DeliveryError::InvalidDestination(_)
            | DeliveryError::MissingEnv(_) => EXIT_TEMPORARY,
        }
    }
}

impl From<postgres::Error> for DeliveryError {
    fn from(e: postgres::Error) -> Self {
        if e.is_closed() {
            DeliveryError::StoreUnavailable(e.to_string())
        } else {
            DeliveryError::StoreQuery(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, DeliveryError>;
