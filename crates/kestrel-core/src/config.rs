//! Runtime configuration.
//!
//! Resolved once from the environment:
//! - `KESTREL_STACK_SIZE`: bytes reserved per thread stack
//!   (default 256 KiB, never below 64 KiB).
//! - `KESTREL_EXIT_NOTIFY_MS`: how long an exiting thread waits for its
//!   joiner to take the exit message (default 250 ms).
//! - `KESTREL_MAX_WAITERS`: capacity of the waiter-record arena shared by
//!   mutexes and condition variables (default 4096).
//! - `KESTREL_LOG`: `off|error|warn|info|debug|trace` (default `warn`).
//!
//! Unparseable values fall back to the default rather than failing.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;

pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
pub const MIN_STACK_SIZE: usize = 64 * 1024;
pub const DEFAULT_EXIT_NOTIFY_MS: u64 = 250;
pub const DEFAULT_MAX_WAITERS: usize = 4096;

/// Diagnostic verbosity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse from string (case-insensitive). Unknown names give the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "0" => Self::Off,
            "error" | "err" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" | "all" => Self::Trace,
            _ => Self::default(),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Off => 1,
            Self::Error => 2,
            Self::Warn => 3,
            Self::Info => 4,
            Self::Debug => 5,
            Self::Trace => 6,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Off,
            2 => Self::Error,
            4 => Self::Info,
            5 => Self::Debug,
            6 => Self::Trace,
            _ => Self::Warn,
        }
    }
}

/// Process-wide runtime settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    pub stack_size: usize,
    pub exit_notify_ms: u64,
    pub max_waiters: usize,
    pub log_level: LogLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            exit_notify_ms: DEFAULT_EXIT_NOTIFY_MS,
            max_waiters: DEFAULT_MAX_WAITERS,
            log_level: LogLevel::default(),
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve through `lookup` instead of the process environment.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(n) = parse_num::<usize>(lookup("KESTREL_STACK_SIZE")) {
            cfg.stack_size = n.max(MIN_STACK_SIZE);
        }
        if let Some(n) = parse_num::<u64>(lookup("KESTREL_EXIT_NOTIFY_MS")) {
            cfg.exit_notify_ms = n;
        }
        if let Some(n) = parse_num::<usize>(lookup("KESTREL_MAX_WAITERS")) {
            cfg.max_waiters = n.clamp(1, u32::MAX as usize - 1);
        }
        if let Some(raw) = lookup("KESTREL_LOG") {
            cfg.log_level = LogLevel::from_str_loose(&raw);
        }
        cfg
    }

    #[must_use]
    pub fn exit_notify_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_notify_ms)
    }
}

fn parse_num<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|v| v.trim().parse::<T>().ok())
}

// 0 = unresolved, 255 = resolving, otherwise LogLevel::to_u8.
static CACHED_LOG_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_UNRESOLVED);

const LEVEL_UNRESOLVED: u8 = 0;
const LEVEL_RESOLVING: u8 = 255;

/// Active log level. Reads `KESTREL_LOG` on first call and caches it.
///
/// Kept apart from [`RuntimeConfig`] so diagnostics emitted while the
/// runtime itself is being constructed never recurse into it. A caller
/// racing the first resolution sees the default level.
#[must_use]
pub fn log_level() -> LogLevel {
    let cached = CACHED_LOG_LEVEL.load(Ordering::Acquire);
    if cached != LEVEL_UNRESOLVED && cached != LEVEL_RESOLVING {
        return LogLevel::from_u8(cached);
    }
    if cached == LEVEL_RESOLVING
        || CACHED_LOG_LEVEL
            .compare_exchange(
                LEVEL_UNRESOLVED,
                LEVEL_RESOLVING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
    {
        return LogLevel::default();
    }
    let level = std::env::var("KESTREL_LOG")
        .map(|v| LogLevel::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_LOG_LEVEL.store(level.to_u8(), Ordering::Release);
    level
}

/// Overrides the cached log level (harness `--log-level`).
pub fn set_log_level(level: LogLevel) {
    CACHED_LOG_LEVEL.store(level.to_u8(), Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        assert_eq!(RuntimeConfig::from_lookup(|_| None), RuntimeConfig::default());
    }

    #[test]
    fn stack_size_has_a_floor() {
        let cfg = RuntimeConfig::from_lookup(lookup_from(&[("KESTREL_STACK_SIZE", "4096")]));
        assert_eq!(cfg.stack_size, MIN_STACK_SIZE);
        let cfg = RuntimeConfig::from_lookup(lookup_from(&[("KESTREL_STACK_SIZE", "1048576")]));
        assert_eq!(cfg.stack_size, 1 << 20);
    }

    #[test]
    fn garbage_values_fall_back() {
        let cfg = RuntimeConfig::from_lookup(lookup_from(&[
            ("KESTREL_EXIT_NOTIFY_MS", "soon"),
            ("KESTREL_MAX_WAITERS", "-3"),
            ("KESTREL_LOG", "loud"),
        ]));
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn parse_log_levels() {
        assert_eq!(LogLevel::from_str_loose("OFF"), LogLevel::Off);
        assert_eq!(LogLevel::from_str_loose("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from_str_loose(" debug "), LogLevel::Debug);
        assert_eq!(LogLevel::from_str_loose("bogus"), LogLevel::Warn);
        assert!(LogLevel::Trace > LogLevel::Info);
    }

    #[test]
    fn level_cache_encoding_roundtrips() {
        for level in [
            LogLevel::Off,
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert_eq!(LogLevel::from_u8(level.to_u8()), level);
        }
    }
}
