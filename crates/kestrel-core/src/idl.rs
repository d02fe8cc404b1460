//! Server dispatch loop.
//!
//! [`serve`] receives a request, hands it to a [`Dispatch`] implementation,
//! then replies and waits for the next request in one `reply_wait`. The
//! outcome of that combined operation goes through
//! [`check_rollback`](crate::rollback::check_rollback), so handler
//! mutations registered with [`set_rollback`](crate::rollback::set_rollback)
//! are undone when the reply did not reach the caller.

use kestrel_ipc::{ErrorCode, IpcError, Message, Source, ThreadId, Timeout, recv, reply_wait};
use serde_json::json;

use crate::diag;
use crate::rollback::{DispatchStatus, begin_dispatch, check_rollback, end_dispatch};

/// What the loop does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Reply with this message and wait for the next request.
    Send(Message),
    /// Do not reply; wait for the next request.
    NoReply,
    /// Leave the loop without replying.
    Exit,
}

/// A request handler.
pub trait Dispatch {
    fn dispatch(&mut self, from: ThreadId, request: &Message) -> Reply;
}

impl<F> Dispatch for F
where
    F: FnMut(ThreadId, &Message) -> Reply,
{
    fn dispatch(&mut self, from: ThreadId, request: &Message) -> Reply {
        self(from, request)
    }
}

/// Loop events reported to the observer passed to [`serve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeEvent {
    Received { from: ThreadId, label: u16 },
    /// The reply failed and the handler's rollback ran.
    RolledBack { to: ThreadId, error: IpcError },
    /// The reply failed and no rollback belonged to this call.
    ReplyFailed { to: ThreadId, error: IpcError },
    /// Waiting for the next request failed and will be retried.
    ReceiveFailed { error: IpcError },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServeOptions {
    /// Receive timeout. A finite timeout that expires ends the loop.
    pub rcv_timeout: Timeout,
}

/// Serves requests until the handler returns [`Reply::Exit`], a finite
/// receive timeout expires, or the loop hits a terminal IPC failure.
pub fn serve<D, O>(handler: &mut D, options: ServeOptions, mut observer: O) -> Result<(), IpcError>
where
    D: Dispatch + ?Sized,
    O: FnMut(ServeEvent),
{
    let mut next: Option<(ThreadId, Message)> = None;
    loop {
        let (from, request) = match next.take() {
            Some(request) => request,
            None => match recv(Source::Any, options.rcv_timeout) {
                Ok(request) => request,
                Err(error) => {
                    check_rollback(DispatchStatus::from_ipc(error));
                    if stop_after_receive_failure(error, options)? {
                        return Ok(());
                    }
                    observer(ServeEvent::ReceiveFailed { error });
                    continue;
                }
            },
        };

        begin_dispatch(from, request.tag());
        observer(ServeEvent::Received {
            from,
            label: request.label(),
        });
        let reply = handler.dispatch(from, &request);

        match reply {
            Reply::Send(msg) => match reply_wait(from, msg, options.rcv_timeout) {
                Ok(request) => {
                    check_rollback(DispatchStatus::OK);
                    next = Some(request);
                }
                Err(error) if error.is_receive() => {
                    check_rollback(DispatchStatus::from_ipc(error));
                    end_dispatch();
                    if stop_after_receive_failure(error, options)? {
                        return Ok(());
                    }
                    observer(ServeEvent::ReceiveFailed { error });
                    continue;
                }
                Err(error) => {
                    let event = if check_rollback(DispatchStatus::from_ipc(error)) {
                        ServeEvent::RolledBack { to: from, error }
                    } else {
                        ServeEvent::ReplyFailed { to: from, error }
                    };
                    diag::debug(
                        "idl_reply_failed",
                        json!({ "to": from.raw(), "error": error.to_string() }),
                    );
                    observer(event);
                }
            },
            Reply::NoReply => {}
            Reply::Exit => {
                end_dispatch();
                return Ok(());
            }
        }
        end_dispatch();
    }
}

/// Classifies a failed receive: `Ok(true)` ends the loop quietly,
/// `Ok(false)` retries, `Err` ends it with the failure.
fn stop_after_receive_failure(error: IpcError, options: ServeOptions) -> Result<bool, IpcError> {
    match error.code {
        ErrorCode::Timeout if !matches!(options.rcv_timeout, Timeout::Never) => Ok(true),
        _ if error.is_transient() => Ok(false),
        _ => Err(error),
    }
}
