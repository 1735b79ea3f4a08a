use std::io;
use std::time::Duration;

use thiserror::Error as ThisError;

use crate::frame;
use crate::transaction::TransactionState;

/// Every failure the client can report. Variants are kept apart so callers can decide what is
/// worth retrying: `Protocol` and `Connection` errors always invalidate the connection that
/// produced them, a `Command` error only concerns the command that caused it.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("protocol error; {0}")]
    Protocol(#[from] frame::Error),
    #[error("connection error; {0}")]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("transaction aborted; a watched key was modified")]
    OptimisticLockFailure,
    #[error("invalid transaction state; cannot {operation} while {state}")]
    QueueState {
        operation: &'static str,
        state: TransactionState,
    },
    #[error("pool exhausted; no connection available within {0:?}")]
    PoolExhausted(Duration),
    #[error("pool is closed")]
    PoolClosed,
}

impl Error {
    /// Whether the connection that produced this error must be thrown away.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Connection(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Connection(ConnectionError::Io(err))
    }
}

#[derive(Debug, ThisError)]
pub enum ConnectionError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("connection is no longer usable after a previous failure")]
    Invalidated,
}

/// An error reply sent by the server for a single command.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{message}")]
pub struct CommandError {
    message: String,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> CommandError {
        CommandError {
            message: message.into(),
        }
    }

    /// The error prefix, by convention the first word of the message (`ERR`, `WRONGTYPE`, ...).
    pub fn kind(&self) -> &str {
        self.message.split_whitespace().next().unwrap_or("")
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
