//! Scenario runner for the kestrel runtime.
//!
//! - [`scenarios`]: multi-threaded checks of the mutex, condition variable,
//!   join, rollback and sysmsg paths, each reporting counter deltas.
//! - [`structured_log`]: the JSONL record format the runner writes, its
//!   validator and the artifact index.

#![forbid(unsafe_code)]

pub mod scenarios;
pub mod structured_log;

pub use scenarios::{Scenario, ScenarioConfig, ScenarioError, ScenarioReport};
pub use structured_log::{ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome};
