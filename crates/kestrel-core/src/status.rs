//! Status words returned across the C11-style threading surface.

// ---------------------------------------------------------------------------
// C11 thread status codes
// ---------------------------------------------------------------------------

pub const THRD_SUCCESS: i32 = 0;
pub const THRD_BUSY: i32 = 1;
pub const THRD_ERROR: i32 = 2;
pub const THRD_NOMEM: i32 = 3;
pub const THRD_TIMEDOUT: i32 = 4;

// ---------------------------------------------------------------------------
// errno values used by the runtime
// ---------------------------------------------------------------------------

pub const EPERM: i32 = 1;
pub const ESRCH: i32 = 3;
pub const EIO: i32 = 5;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const EDEADLK: i32 = 35;
pub const ENOSYS: i32 = 38;
pub const ETIMEDOUT: i32 = 110;
