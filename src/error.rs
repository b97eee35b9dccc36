use thiserror::Error;

use crate::recovery::Lsn;

pub type WalResult<T, E = WalError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Corrupt WAL: {0}")]
    Corrupt(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The current engine instance must not continue; a restart re-derives
    /// state from the control file and WAL.
    #[error("FATAL: {0}")]
    Fatal(String),

    /// Shared WAL state is no longer trustworthy for any cooperating thread.
    #[error("PANIC: {0}")]
    Panic(String),

    #[error("xlog flush request {requested} is not satisfied --- flushed only to {flushed}")]
    FlushNotSatisfied { requested: Lsn, flushed: Lsn },

    #[error("cannot make new WAL entries during recovery")]
    RecoveryInProgress,
}

impl WalError {
    /// Errors that end the current engine instance.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WalError::Fatal(_) | WalError::Panic(_))
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, WalError::Panic(_))
    }

    /// Promotes an error raised inside a critical section to PANIC.
    pub fn into_panic(self) -> WalError {
        match self {
            WalError::Panic(_) => self,
            other => WalError::Panic(other.to_string()),
        }
    }
}
