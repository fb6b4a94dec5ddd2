use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid credentials for user {username:?}")]
    Unauthorized { username: String },

    #[error("session {session} not found")]
    SessionNotFound { session: crate::SessionId },

    #[error("session {session} has expired")]
    SessionExpired { session: crate::SessionId },

    #[error("no such lock {name:?}")]
    NoSuchLock { name: String },

    #[error("lock {name:?} is held in a conflicting mode")]
    ModeConflict { name: String },

    #[error("acquire of lock {name:?} was cancelled")]
    AcquireCancelled { name: String },

    #[error("stale sequencer {presented} for lock {name:?}, current is {current}")]
    StaleSequencer {
        name: String,
        presented: u64,
        current: u64,
    },

    #[error("store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("lease {lease} not found")]
    LeaseNotFound { lease: crate::LeaseId },

    #[error("lease {lease} has expired")]
    LeaseExpired { lease: crate::LeaseId },

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
