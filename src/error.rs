use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::time::Duration;

use crate::data::Mutation;
use crate::encoding::EncodingError;
use crate::retry::{AuthorizationCode, ConstraintViolation};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    Format(EncodingError),
    Fatal(FatalWriteError),
    Transient(TransientWriteError),
    /// An ingestion run stopped. `written` records were durably applied
    /// before the failure; `unflushed` is the batch that was not.
    Aborted {
        cause: Box<Error>,
        written: u64,
        unflushed: Vec<Mutation>,
    },
    InvalidMutation(String),
    InvalidConfig(String),
    TableNotFound(String),
    InvalidState(String),
    MutexPoisoned,
}

/// Write failures that retrying the same batch cannot fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalWriteError {
    /// Authorization failures, keyed by the table or endpoint that refused.
    AuthorizationDenied(BTreeMap<String, BTreeSet<AuthorizationCode>>),
    ConstraintViolation {
        violations: Vec<ConstraintViolation>,
    },
}

/// Write failures that may succeed when the identical batch is resubmitted
/// on a fresh channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransientWriteError {
    EndpointUnreachable(BTreeSet<String>),
    UnknownServerFault(usize),
    Timeout(Duration),
    ResourceExhausted { pending_bytes: usize },
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Fatal(_) => true,
            Error::Aborted { cause, .. } => cause.is_fatal(),
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<FatalWriteError> for Error {
    fn from(err: FatalWriteError) -> Self {
        Error::Fatal(err)
    }
}

impl From<TransientWriteError> for Error {
    fn from(err: TransientWriteError) -> Self {
        Error::Transient(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for FatalWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalWriteError::AuthorizationDenied(targets) => {
                write!(f, "authorization denied")?;
                for (target, codes) in targets {
                    write!(f, " [{}: {:?}]", target, codes)?;
                }
                Ok(())
            }
            FatalWriteError::ConstraintViolation { violations } => {
                write!(f, "{} constraint violation(s)", violations.len())?;
                if let Some(first) = violations.first() {
                    write!(f, ", first: {}", first)?;
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Display for TransientWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientWriteError::EndpointUnreachable(endpoints) => {
                write!(f, "unreachable endpoints: {:?}", endpoints)
            }
            TransientWriteError::UnknownServerFault(count) => {
                write!(f, "{} failure(s) of unknown cause", count)
            }
            TransientWriteError::Timeout(after) => write!(f, "timed out after {:?}", after),
            TransientWriteError::ResourceExhausted { pending_bytes } => write!(
                f,
                "{} bytes pending without a successful flush",
                pending_bytes
            ),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Format(err) => write!(f, "Format error: {}", err),
            Error::Fatal(err) => write!(f, "Fatal write error: {}", err),
            Error::Transient(err) => write!(f, "Transient write error: {}", err),
            Error::Aborted {
                cause,
                written,
                unflushed,
            } => write!(
                f,
                "Ingestion aborted after {} durable writes ({} unflushed): {}",
                written,
                unflushed.len(),
                cause
            ),
            Error::InvalidMutation(msg) => write!(f, "Invalid mutation: {}", msg),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::TableNotFound(table) => write!(f, "Table not found: {}", table),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            Error::Format(err) => Some(err),
            Error::Aborted { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}
