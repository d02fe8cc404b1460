//! Substrate configuration.
//!
//! Read from the environment once when the kernel is first touched:
//! - `KESTREL_SPACE_THREADS`: thread slots per address space
//!   (default and maximum [`MAX_SPACE_THREADS`]).

use crate::id::MAX_SPACE_THREADS;

/// Kernel-wide limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub space_threads: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            space_threads: MAX_SPACE_THREADS,
        }
    }
}

impl KernelConfig {
    /// Resolve from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve through `lookup`. Garbage values fall back to defaults.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(n) = lookup("KESTREL_SPACE_THREADS").and_then(|v| v.trim().parse::<usize>().ok())
        {
            cfg.space_threads = n.clamp(1, MAX_SPACE_THREADS);
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset_or_garbage() {
        assert_eq!(KernelConfig::from_lookup(|_| None), KernelConfig::default());
        let cfg = KernelConfig::from_lookup(|_| Some("lots".to_string()));
        assert_eq!(cfg.space_threads, MAX_SPACE_THREADS);
    }

    #[test]
    fn space_threads_is_clamped() {
        let cfg = KernelConfig::from_lookup(|_| Some("0".to_string()));
        assert_eq!(cfg.space_threads, 1);
        let cfg = KernelConfig::from_lookup(|_| Some("999999".to_string()));
        assert_eq!(cfg.space_threads, MAX_SPACE_THREADS);
        let cfg = KernelConfig::from_lookup(|_| Some(" 64 ".to_string()));
        assert_eq!(cfg.space_threads, 64);
    }
}
