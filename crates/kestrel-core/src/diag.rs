//! Structured diagnostics and runtime counters.
//!
//! Every diagnostic is one JSON object per line on stderr:
//! `{"timestamp", "level", "event", "thread", "details"}`. Emission is gated
//! by [`crate::config::log_level`]. Protocol violations by runtime clients
//! (non-owner unlock, destroying a busy object, stale rollbacks) are logged
//! and counted; they never corrupt runtime state.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::{LogLevel, log_level};

/// One diagnostic record.
#[derive(Debug, Clone, Serialize)]
pub struct DiagEvent<'a> {
    pub timestamp: String,
    pub level: LogLevel,
    pub event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

/// Emits one diagnostic line if `level` passes the gate.
pub fn emit(level: LogLevel, event: &str, details: serde_json::Value) {
    if !enabled(level) {
        return;
    }
    let record = DiagEvent {
        timestamp: timestamp_utc(),
        level,
        event,
        thread: kestrel_ipc::try_current().map(|t| t.to_string()),
        details,
    };
    if let Ok(line) = serde_json::to_string(&record) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{line}");
    }
}

pub fn error(event: &str, details: serde_json::Value) {
    emit(LogLevel::Error, event, details);
}

pub fn warn(event: &str, details: serde_json::Value) {
    emit(LogLevel::Warn, event, details);
}

pub fn debug(event: &str, details: serde_json::Value) {
    emit(LogLevel::Debug, event, details);
}

/// Internal-invariant violation: logs unconditionally and panics.
pub fn fatal(event: &str, details: serde_json::Value) -> ! {
    let record = DiagEvent {
        timestamp: timestamp_utc(),
        level: LogLevel::Error,
        event,
        thread: kestrel_ipc::try_current().map(|t| t.to_string()),
        details: details.clone(),
    };
    if let Ok(line) = serde_json::to_string(&record) {
        let _ = writeln!(std::io::stderr().lock(), "{line}");
    }
    panic!("kestrel: fatal runtime invariant violation: {event} {details}");
}

/// RFC 3339 UTC timestamp with millisecond precision.
#[must_use]
pub fn timestamp_utc() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60,
        now.subsec_millis(),
    )
}

// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Monotonic event counters shared by the whole runtime.
#[derive(Debug, Default)]
pub struct RuntimeCounters {
    pub fast_locks: AtomicU64,
    pub slow_locks: AtomicU64,
    pub handoffs: AtomicU64,
    pub nonowner_unlocks: AtomicU64,
    pub busy_destroys: AtomicU64,
    pub cond_wakeups: AtomicU64,
    pub rollbacks_fired: AtomicU64,
    pub confirms_fired: AtomicU64,
    pub stale_rollbacks: AtomicU64,
    pub sysmsg_deliveries: AtomicU64,
    pub thread_panics: AtomicU64,
}

/// Point-in-time copy of [`RuntimeCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub fast_locks: u64,
    pub slow_locks: u64,
    pub handoffs: u64,
    pub nonowner_unlocks: u64,
    pub busy_destroys: u64,
    pub cond_wakeups: u64,
    pub rollbacks_fired: u64,
    pub confirms_fired: u64,
    pub stale_rollbacks: u64,
    pub sysmsg_deliveries: u64,
    pub thread_panics: u64,
}

impl RuntimeCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            fast_locks: load(&self.fast_locks),
            slow_locks: load(&self.slow_locks),
            handoffs: load(&self.handoffs),
            nonowner_unlocks: load(&self.nonowner_unlocks),
            busy_destroys: load(&self.busy_destroys),
            cond_wakeups: load(&self.cond_wakeups),
            rollbacks_fired: load(&self.rollbacks_fired),
            confirms_fired: load(&self.confirms_fired),
            stale_rollbacks: load(&self.stale_rollbacks),
            sysmsg_deliveries: load(&self.sysmsg_deliveries),
            thread_panics: load(&self.thread_panics),
        }
    }
}

impl CounterSnapshot {
    /// Per-field difference `self - earlier`, saturating at zero.
    #[must_use]
    pub fn since(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            fast_locks: self.fast_locks.saturating_sub(earlier.fast_locks),
            slow_locks: self.slow_locks.saturating_sub(earlier.slow_locks),
            handoffs: self.handoffs.saturating_sub(earlier.handoffs),
            nonowner_unlocks: self
                .nonowner_unlocks
                .saturating_sub(earlier.nonowner_unlocks),
            busy_destroys: self.busy_destroys.saturating_sub(earlier.busy_destroys),
            cond_wakeups: self.cond_wakeups.saturating_sub(earlier.cond_wakeups),
            rollbacks_fired: self.rollbacks_fired.saturating_sub(earlier.rollbacks_fired),
            confirms_fired: self.confirms_fired.saturating_sub(earlier.confirms_fired),
            stale_rollbacks: self.stale_rollbacks.saturating_sub(earlier.stale_rollbacks),
            sysmsg_deliveries: self
                .sysmsg_deliveries
                .saturating_sub(earlier.sysmsg_deliveries),
            thread_panics: self.thread_panics.saturating_sub(earlier.thread_panics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_dates_are_exact() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(59), (1970, 3, 1));
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
    }

    #[test]
    fn timestamp_shape() {
        let ts = timestamp_utc();
        assert_eq!(ts.len(), "2026-01-01T00:00:00.000Z".len());
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
    }

    #[test]
    fn event_serializes_without_empty_fields() {
        let ev = DiagEvent {
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
            level: LogLevel::Warn,
            event: "mutex_unlock_not_owner",
            thread: None,
            details: serde_json::Value::Null,
        };
        let v: serde_json::Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["level"], "warn");
        assert_eq!(v["event"], "mutex_unlock_not_owner");
        assert!(v.get("thread").is_none());
        assert!(v.get("details").is_none());
    }

    #[test]
    fn snapshot_delta_saturates() {
        let counters = RuntimeCounters::default();
        let before = counters.snapshot();
        RuntimeCounters::bump(&counters.slow_locks);
        RuntimeCounters::bump(&counters.slow_locks);
        let delta = counters.snapshot().since(&before);
        assert_eq!(delta.slow_locks, 2);
        assert_eq!(before.since(&counters.snapshot()).slow_locks, 0);
    }
}
