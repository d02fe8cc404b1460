//! System-message broadcast: the client library and a broadcaster server.

pub mod broadcaster;
pub mod client;
pub mod protocol;

pub use broadcaster::Broadcaster;
pub use client::{Delivery, ListenHandle, Sysmsg};
pub use protocol::{BroadcastStatus, MAX_BODY_WORDS, SYSMSG_BITS};
