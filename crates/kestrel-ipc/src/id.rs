//! Thread and address-space identifiers.
//!
//! A [`ThreadId`] is one machine word with two interpretations:
//!
//! - **global**: `thread_no << 14 | version`. Unique system-wide. The version
//!   field changes whenever a thread slot is reused, so stale ids stop
//!   resolving. The low six bits of a global id are never all zero.
//! - **local**: `(index + 1) << 6`. Only meaningful inside the address space
//!   that issued it. The low six bits are always zero, which leaves room for
//!   flag bits when a local id is packed into a lock word.
//!
//! `thread_no` itself is `pid << SPACE_SHIFT | index`, so the owning process
//! is derivable from any global id.

use std::fmt;

/// One message register / machine word.
pub type Word = u64;

/// Bits of `thread_no` that select the thread inside its space.
pub const SPACE_SHIFT: u32 = 12;
/// Maximum number of threads a single space can hold.
pub const MAX_SPACE_THREADS: usize = 1 << SPACE_SHIFT;

const VERSION_BITS: u32 = 14;
const VERSION_MASK: u64 = (1 << VERSION_BITS) - 1;
const LOCAL_SHIFT: u32 = 6;
const LOCAL_MASK: u64 = (1 << LOCAL_SHIFT) - 1;

/// Address-space (process) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceId(pub u32);

impl SpaceId {
    /// The space host threads are adopted into.
    pub const ROOT: SpaceId = SpaceId(1);
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "space:{}", self.0)
    }
}

/// Kernel thread identifier, either global or local.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(Word);

impl ThreadId {
    /// The nil thread. Never names a real thread.
    pub const NIL: ThreadId = ThreadId(0);
    /// Wildcard used by open receives.
    pub const ANY: ThreadId = ThreadId(Word::MAX);

    /// Reinterprets a raw word as a thread id.
    #[must_use]
    pub const fn from_raw(raw: Word) -> Self {
        Self(raw)
    }

    /// The raw word.
    #[must_use]
    pub const fn raw(self) -> Word {
        self.0
    }

    /// Builds a global id. `version` is normalised so the low six bits are
    /// never all zero (that pattern is reserved for local ids).
    #[must_use]
    pub const fn global(thread_no: u64, version: u16) -> Self {
        Self(thread_no << VERSION_BITS | normalize_version(version as u64))
    }

    /// Builds a local id for the slot `index` of some space.
    #[must_use]
    pub const fn local(index: usize) -> Self {
        Self(((index as u64) + 1) << LOCAL_SHIFT)
    }

    #[must_use]
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_any(self) -> bool {
        self.0 == Word::MAX
    }

    #[must_use]
    pub const fn is_local(self) -> bool {
        !self.is_nil() && !self.is_any() && self.0 & LOCAL_MASK == 0
    }

    #[must_use]
    pub const fn is_global(self) -> bool {
        !self.is_any() && self.0 & LOCAL_MASK != 0
    }

    /// Thread number of a global id.
    #[must_use]
    pub const fn thread_no(self) -> u64 {
        self.0 >> VERSION_BITS
    }

    /// Version (generation) field of a global id.
    #[must_use]
    pub const fn version(self) -> u16 {
        (self.0 & VERSION_MASK) as u16
    }

    /// Process id derived from a global id.
    #[must_use]
    pub const fn pid(self) -> SpaceId {
        SpaceId((self.thread_no() >> SPACE_SHIFT) as u32)
    }

    /// Slot index inside the owning space, for either form.
    #[must_use]
    pub const fn index(self) -> usize {
        if self.is_local() {
            ((self.0 >> LOCAL_SHIFT) - 1) as usize
        } else {
            (self.thread_no() & ((1 << SPACE_SHIFT) - 1)) as usize
        }
    }
}

/// Next usable version after `version`, skipping the local-id pattern.
#[must_use]
pub const fn next_version(version: u16) -> u16 {
    normalize_version(version as u64 + 1) as u16
}

const fn normalize_version(v: u64) -> u64 {
    let v = v & VERSION_MASK;
    if v & LOCAL_MASK == 0 { v | 1 } else { v }
}

/// Builds the thread number of slot `index` in `space`.
#[must_use]
pub const fn thread_no(space: SpaceId, index: usize) -> u64 {
    (space.0 as u64) << SPACE_SHIFT | index as u64
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "ThreadId(nil)")
        } else if self.is_any() {
            write!(f, "ThreadId(any)")
        } else if self.is_local() {
            write!(f, "ThreadId(local:{})", self.index())
        } else {
            write!(f, "ThreadId({}:{})", self.thread_no(), self.version())
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_and_local_forms_are_disjoint() {
        let g = ThreadId::global(thread_no(SpaceId(3), 7), 1);
        let l = ThreadId::local(7);
        assert!(g.is_global() && !g.is_local());
        assert!(l.is_local() && !l.is_global());
        assert_eq!(g.index(), 7);
        assert_eq!(l.index(), 7);
        assert_eq!(g.pid(), SpaceId(3));
    }

    #[test]
    fn version_never_collides_with_local_pattern() {
        let mut v = 1u16;
        for _ in 0..20_000 {
            v = next_version(v);
            assert_ne!(v as u64 & LOCAL_MASK, 0, "version {v} looks local");
        }
        let g = ThreadId::global(5, 64);
        assert!(g.is_global());
    }

    #[test]
    fn local_ids_leave_two_flag_bits_free() {
        let l = ThreadId::local(MAX_SPACE_THREADS - 1);
        assert_eq!(l.raw() & 0b11, 0);
        assert!(l.is_local());
    }

    #[test]
    fn nil_and_any_are_neither_form() {
        assert!(!ThreadId::NIL.is_local());
        assert!(!ThreadId::NIL.is_global());
        assert!(!ThreadId::ANY.is_local());
        assert!(!ThreadId::ANY.is_global());
    }
}
