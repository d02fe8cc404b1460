//! Wire format shared by the broadcaster and its clients.
//!
//! Control channel (client → broadcaster control thread, `call`):
//!
//! | label            | words                              | reply            |
//! |------------------|------------------------------------|------------------|
//! | `SUBSCRIBE`      | receiver, mask                     | `ACK`            |
//! | `FILTER_RESET`   | receiver                           | `ACK`            |
//! | `FILTER_ADD`     | receiver, label...                 | `ACK`            |
//! | `FILTER_COMMIT`  | receiver, enable, mask             | `ACK`            |
//! | `BROADCAST`      | maskp, maskn, body...              | `STATUS` deferred |
//! | `SHUTDOWN`       | -                                  | `ACK`            |
//!
//! `FILTER_COMMIT` installs the mask and the staged filter together, so a
//! delivery never sees a new mask paired with an old filter.
//!
//! Delivery channel (broadcaster delivery thread → client receiver, `call`):
//! `DELIVER [mask, body...]`, answered with `STATUS [deferred]`. A client
//! stops its own receiver with `STOP`.

use kestrel_ipc::{MSG_WORDS, Message, Word};

use crate::error::SysmsgError;

/// Number of broadcast bits.
pub const SYSMSG_BITS: u32 = 32;

/// Largest body a broadcast can carry.
pub const MAX_BODY_WORDS: usize = MSG_WORDS - 2;

pub(crate) const LABEL_SUBSCRIBE: u16 = 0x5301;
pub(crate) const LABEL_FILTER_RESET: u16 = 0x5302;
pub(crate) const LABEL_FILTER_ADD: u16 = 0x5303;
pub(crate) const LABEL_FILTER_COMMIT: u16 = 0x5304;
pub(crate) const LABEL_BROADCAST: u16 = 0x5305;
pub(crate) const LABEL_SHUTDOWN: u16 = 0x5306;
pub(crate) const LABEL_DONE: u16 = 0x5307;
pub(crate) const LABEL_DELIVER: u16 = 0x5310;
pub(crate) const LABEL_STOP: u16 = 0x5311;
pub(crate) const LABEL_ACK: u16 = 0x5320;
pub(crate) const LABEL_STATUS: u16 = 0x5321;

/// Labels per `FILTER_ADD` message.
pub(crate) const FILTER_CHUNK: usize = MSG_WORDS - 1;

/// Outcome of a broadcast that reached the broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastStatus {
    /// Every receiving handler finished its work.
    Delivered,
    /// At least one handler deferred its work.
    Deferred,
}

impl BroadcastStatus {
    /// `0` for delivered, `1` for deferred.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Delivered => 0,
            Self::Deferred => 1,
        }
    }

    pub(crate) const fn from_deferred(deferred: bool) -> Self {
        if deferred { Self::Deferred } else { Self::Delivered }
    }
}

/// Whether a subscriber with `mask` receives a broadcast to `maskp`
/// excluding `maskn`.
#[must_use]
pub const fn matches(mask: u32, maskp: u32, maskn: u32) -> bool {
    mask & maskp != 0 && mask & maskn == 0
}

pub(crate) fn broadcast_request(maskp: u32, maskn: u32, body: &[Word]) -> Result<Message, SysmsgError> {
    if body.len() > MAX_BODY_WORDS {
        return Err(SysmsgError::BodyTooLong(body.len()));
    }
    let mut msg = Message::with_words(LABEL_BROADCAST, &[Word::from(maskp), Word::from(maskn)]);
    for &w in body {
        msg.push(w);
    }
    Ok(msg)
}

pub(crate) fn deliver_request(mask: u32, body: &[Word]) -> Message {
    let mut msg = Message::with_words(LABEL_DELIVER, &[Word::from(mask)]);
    for &w in body.iter().take(MSG_WORDS - 1) {
        msg.push(w);
    }
    msg
}

pub(crate) fn status_reply(deferred: bool) -> Message {
    Message::with_words(LABEL_STATUS, &[Word::from(deferred)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_mask_excludes_subscribers() {
        assert!(matches(0b0010, 0b0010, 0));
        assert!(matches(0b0110, 0b0010, 0b1000));
        assert!(!matches(0b0110, 0b0010, 0b0100));
        assert!(!matches(0b0001, 0b0010, 0));
    }

    #[test]
    fn broadcast_body_limit() {
        let body = [7; MAX_BODY_WORDS];
        let msg = broadcast_request(1, 0, &body).unwrap();
        assert_eq!(msg.len(), MSG_WORDS);
        assert_eq!(msg.word(2), 7);
        assert_eq!(
            broadcast_request(1, 0, &[0; MAX_BODY_WORDS + 1]).unwrap_err(),
            SysmsgError::BodyTooLong(MAX_BODY_WORDS + 1)
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(BroadcastStatus::from_deferred(false).code(), 0);
        assert_eq!(BroadcastStatus::from_deferred(true).code(), 1);
        assert_eq!(status_reply(true).word(0), 1);
    }
}
