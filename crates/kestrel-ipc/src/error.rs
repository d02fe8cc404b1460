//! IPC and thread-control error codes.
//!
//! IPC errors use the conventional status-word layout: bit 0 is the phase
//! (0 = send, 1 = receive) and bits 1..=3 carry the code.

use thiserror::Error;

use crate::id::{SpaceId, ThreadId, Word};

/// Which half of an IPC operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Send,
    Receive,
}

/// IPC failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The phase timed out before a partner was ready.
    Timeout,
    /// The partner does not exist (never did, was deleted, or halted).
    NoPartner,
    /// Canceled by another thread before transfer began.
    Canceled,
    /// Message did not fit.
    Overflow,
    /// Transfer timeout on the caller's side.
    XferTimeoutOwn,
    /// Transfer timeout on the partner's side.
    XferTimeoutPartner,
    /// Aborted by another thread.
    Aborted,
}

impl ErrorCode {
    const fn number(self) -> Word {
        match self {
            Self::Timeout => 1,
            Self::NoPartner => 2,
            Self::Canceled => 3,
            Self::Overflow => 4,
            Self::XferTimeoutOwn => 5,
            Self::XferTimeoutPartner => 6,
            Self::Aborted => 7,
        }
    }

    const fn from_number(n: Word) -> Option<Self> {
        Some(match n {
            1 => Self::Timeout,
            2 => Self::NoPartner,
            3 => Self::Canceled,
            4 => Self::Overflow,
            5 => Self::XferTimeoutOwn,
            6 => Self::XferTimeoutPartner,
            7 => Self::Aborted,
            _ => return None,
        })
    }
}

/// A failed IPC phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("ipc {phase:?} phase failed: {code:?}")]
pub struct IpcError {
    pub phase: Phase,
    pub code: ErrorCode,
}

impl IpcError {
    #[must_use]
    pub const fn send(code: ErrorCode) -> Self {
        Self {
            phase: Phase::Send,
            code,
        }
    }

    #[must_use]
    pub const fn receive(code: ErrorCode) -> Self {
        Self {
            phase: Phase::Receive,
            code,
        }
    }

    #[must_use]
    pub const fn is_receive(self) -> bool {
        matches!(self.phase, Phase::Receive)
    }

    /// Timeout classes, cancellation and abort. Retrying makes sense as long
    /// as the partner still exists.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        !matches!(self.code, ErrorCode::NoPartner | ErrorCode::Overflow)
    }

    /// Interrupted by another thread (exchange-registers style).
    #[must_use]
    pub const fn is_interrupt(self) -> bool {
        matches!(self.code, ErrorCode::Canceled | ErrorCode::Aborted)
    }

    /// Status-word encoding.
    #[must_use]
    pub const fn to_word(self) -> Word {
        let phase = match self.phase {
            Phase::Send => 0,
            Phase::Receive => 1,
        };
        self.code.number() << 1 | phase
    }

    /// Decodes a status word. Returns `None` for 0 (no error) and for
    /// unknown codes.
    #[must_use]
    pub const fn from_word(word: Word) -> Option<Self> {
        let phase = if word & 1 == 0 {
            Phase::Send
        } else {
            Phase::Receive
        };
        match ErrorCode::from_number((word >> 1) & 0x7) {
            Some(code) => Some(Self { phase, code }),
            None => None,
        }
    }
}

/// Thread-control failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadControlError {
    #[error("{0} has no free thread slots")]
    SpaceFull(SpaceId),
    #[error("{0} does not exist")]
    NoSuchSpace(SpaceId),
    #[error("thread {0} does not exist")]
    NoSuchThread(ThreadId),
    #[error("thread {0} was already started")]
    AlreadyStarted(ThreadId),
    #[error("host refused to spawn thread: {0}")]
    Spawn(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_word_roundtrips_every_code() {
        let codes = [
            ErrorCode::Timeout,
            ErrorCode::NoPartner,
            ErrorCode::Canceled,
            ErrorCode::Overflow,
            ErrorCode::XferTimeoutOwn,
            ErrorCode::XferTimeoutPartner,
            ErrorCode::Aborted,
        ];
        for code in codes {
            for err in [IpcError::send(code), IpcError::receive(code)] {
                assert_eq!(IpcError::from_word(err.to_word()), Some(err));
            }
        }
    }

    #[test]
    fn zero_word_is_no_error() {
        assert_eq!(IpcError::from_word(0), None);
        assert_eq!(IpcError::from_word(1), None);
    }

    #[test]
    fn no_partner_is_terminal() {
        assert!(!IpcError::receive(ErrorCode::NoPartner).is_transient());
        assert!(IpcError::receive(ErrorCode::Canceled).is_transient());
        assert!(IpcError::send(ErrorCode::Timeout).is_transient());
        assert!(IpcError::receive(ErrorCode::Aborted).is_interrupt());
    }
}
