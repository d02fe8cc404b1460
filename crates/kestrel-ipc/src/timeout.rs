//! IPC phase timeouts.

use std::time::{Duration, Instant};

/// Timeout for one IPC phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Block until the partner is ready.
    #[default]
    Never,
    /// Fail immediately unless the partner is already waiting.
    Zero,
    /// Block for at most this long.
    After(Duration),
}

impl Timeout {
    #[must_use]
    pub fn millis(ms: u64) -> Self {
        Self::After(Duration::from_millis(ms))
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        match self {
            Self::Zero => true,
            Self::After(d) => d.is_zero(),
            Self::Never => false,
        }
    }

    /// Absolute deadline for a phase that starts now. `None` means no
    /// deadline.
    #[must_use]
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Self::Never => None,
            Self::Zero => Some(Instant::now()),
            Self::After(d) => Some(Instant::now() + d),
        }
    }
}
