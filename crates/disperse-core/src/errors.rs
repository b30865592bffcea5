//! Engine error taxonomy.
//!
//! Brick replies carry raw errno values; the engine folds them into
//! [`EcError`] at the API boundary. Each variant maps back onto the errno
//! an upper layer expects.

use thiserror::Error;

use crate::types::Errno;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EcError {
    /// Fewer than K bricks reachable at dispatch.
    #[error("insufficient bricks available (have {have}, need {need})")]
    InsufficientBricks { have: usize, need: usize },

    /// inodelk/entrylk failed across bricks.
    #[error("distributed lock failed (errno {errno})")]
    LockFailed { errno: Errno },

    /// Version/size/config xattr decode failure or config mismatch.
    #[error("versioned metadata corrupt or mismatching")]
    MetadataCorrupt,

    /// No answer group reached the required quorum.
    #[error("brick answers diverged below quorum")]
    AnswerDiverged,

    /// Background heal queue exhausted.
    #[error("self-heal queue is full")]
    HealBusy,

    /// The volume is shutting down.
    #[error("volume is shutting down")]
    ShuttingDown,

    /// Plain errno from the chosen answer.
    #[error("operation failed (errno {0})")]
    Errno(Errno),
}

impl EcError {
    /// The errno reported to the upper layer.
    pub fn errno(&self) -> Errno {
        match self {
            EcError::InsufficientBricks { .. } => libc::ENOTCONN,
            EcError::LockFailed { errno } => *errno,
            EcError::MetadataCorrupt => libc::EIO,
            EcError::AnswerDiverged => libc::EIO,
            EcError::HealBusy => libc::EBUSY,
            EcError::ShuttingDown => libc::ENOTCONN,
            EcError::Errno(e) => *e,
        }
    }

    pub fn from_errno(errno: Errno) -> Self {
        EcError::Errno(errno)
    }
}

/// Errors a retried single-brick read may recover from by asking another
/// brick: lost connection, stale/missing backend state, bad fd after a
/// reconnect, or a backend filesystem error.
pub fn is_recoverable(errno: Errno) -> bool {
    matches!(
        errno,
        libc::ENOTCONN | libc::ESTALE | libc::ENOENT | libc::EBADFD | libc::EIO
    )
}

pub type EcResult<T> = Result<T, EcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(
            EcError::InsufficientBricks { have: 2, need: 4 }.errno(),
            libc::ENOTCONN
        );
        assert_eq!(EcError::MetadataCorrupt.errno(), libc::EIO);
        assert_eq!(EcError::AnswerDiverged.errno(), libc::EIO);
        assert_eq!(EcError::HealBusy.errno(), libc::EBUSY);
        assert_eq!(EcError::LockFailed { errno: libc::EAGAIN }.errno(), libc::EAGAIN);
        assert_eq!(EcError::Errno(libc::ENOENT).errno(), libc::ENOENT);
    }

    #[test]
    fn recoverable_errnos() {
        for e in [
            libc::ENOTCONN,
            libc::ESTALE,
            libc::ENOENT,
            libc::EBADFD,
            libc::EIO,
        ] {
            assert!(is_recoverable(e));
        }
        assert!(!is_recoverable(libc::EACCES));
        assert!(!is_recoverable(libc::ENOSPC));
    }
}
