//! Process-wide runtime state.
//!
//! Holds the resolved configuration, the TSS key registry, the waiter arena
//! and the runtime counters, and starts each space's lock-serializer thread
//! on first demand. Constructed lazily on first use; constructing it never
//! spawns a thread, so spawning code may call [`Runtime::get`] freely.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU64, Ordering};

use kestrel_ipc::{SpaceId, ThreadId};
use parking_lot::Mutex;
use serde_json::json;

use crate::config::RuntimeConfig;
use crate::diag::{self, CounterSnapshot, RuntimeCounters};
use crate::error::ThreadError;
use crate::once::Once;
use crate::threads::serializer;
use crate::threads::thread::ThreadBuilder;
use crate::threads::tss::TssRegistry;
use crate::threads::waiter::WaiterArena;

/// Name of the lock-serializer thread.
pub const SERIALIZER_NAME: &str = "kestrel-lock-serializer";

pub struct Runtime {
    config: RuntimeConfig,
    tss: TssRegistry,
    waiters: WaiterArena,
    counters: RuntimeCounters,
    /// One serializer per space; mutex words hold space-local ids.
    serializers: Mutex<HashMap<SpaceId, Arc<SerializerSlot>>>,
}

#[derive(Default)]
struct SerializerSlot {
    once: Once,
    tid: AtomicU64,
}

impl Runtime {
    /// The process-wide instance.
    pub fn get() -> &'static Runtime {
        static RUNTIME: OnceLock<Runtime> = OnceLock::new();
        RUNTIME.get_or_init(|| Runtime::new(RuntimeConfig::from_env()))
    }

    fn new(config: RuntimeConfig) -> Self {
        Self {
            tss: TssRegistry::new(),
            waiters: WaiterArena::with_capacity(config.max_waiters),
            counters: RuntimeCounters::default(),
            serializers: Mutex::new(HashMap::new()),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn counters(&self) -> &RuntimeCounters {
        &self.counters
    }

    /// Current counter values.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub(crate) fn tss(&self) -> &TssRegistry {
        &self.tss
    }

    pub(crate) fn waiters(&self) -> &WaiterArena {
        &self.waiters
    }

    /// Id of the calling space's lock-serializer thread, starting it if
    /// needed.
    pub fn serializer(&self) -> Result<ThreadId, ThreadError> {
        let space = kestrel_ipc::current_space();
        let slot = Arc::clone(self.serializers.lock().entry(space).or_default());
        slot.once.call_once(|| {
            match ThreadBuilder::new()
                .name(SERIALIZER_NAME)
                .space(space)
                .spawn(serializer::run)
            {
                Ok(thread) => {
                    slot.tid.store(thread.id().raw(), Ordering::Release);
                    // Runs for the life of the space.
                    thread.detach();
                }
                Err(e) => diag::error(
                    "lock_serializer_start_failed",
                    json!({ "space": space.0, "error": e.to_string() }),
                ),
            }
        });
        match slot.tid.load(Ordering::Acquire) {
            0 => Err(ThreadError::Failed),
            raw => Ok(ThreadId::from_raw(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializer_is_started_once() {
        let rt = Runtime::get();
        let a = rt.serializer().unwrap();
        let b = rt.serializer().unwrap();
        assert_eq!(a, b);
        assert!(kestrel_ipc::kernel().exists(a));
        assert_eq!(a.pid(), kestrel_ipc::current_space());
    }

    #[test]
    fn each_space_gets_its_own_serializer() {
        let here = Runtime::get().serializer().unwrap();
        let space = kestrel_ipc::kernel().create_space();
        let there = ThreadBuilder::new()
            .space(space)
            .spawn(|| {
                let id = Runtime::get().serializer().map(|t| t.raw()).unwrap_or(0);
                i32::from(ThreadId::from_raw(id).pid() == kestrel_ipc::current_space())
            })
            .unwrap();
        assert_eq!(there.join(), Ok(1));
        assert_ne!(here.pid(), space);
    }

    #[test]
    fn arena_follows_configured_capacity() {
        let rt = Runtime::new(RuntimeConfig {
            max_waiters: 3,
            ..RuntimeConfig::default()
        });
        assert!(rt.waiters().lookup(3).is_none());
        assert!(rt.waiters().lookup(4).is_none());
        assert_eq!(rt.config().max_waiters, 3);
    }
}
