//! Dispatch loop controller.
//!
//! A dispatch loop owns a subscriber's inbox on a dedicated thread, polling
//! it every `poll_interval` and handing matching messages to a handler one at
//! a time. Each loop has its own state machine and cancellation token:
//!
//! ```text
//! NotRunning --start--> Running --stop requested--> Stopping --joined--> NotRunning
//! ```
//!
//! Handler errors and panics are contained per message.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, HandlerError, Result};
use crate::filter::FilterSet;
use crate::frame::Message;
use crate::socket::{Inbox, Recv};
use crate::stats::SubscriberStats;
use crate::subscriber::admit;

/// Receives messages from a dispatch loop.
///
/// Implemented for any `FnMut(Message) -> Result<(), HandlerError>` closure.
/// An `Err` is logged and counted; the loop moves on to the next message.
pub trait MessageHandler: Send + 'static {
    fn on_message(&mut self, message: Message) -> std::result::Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: FnMut(Message) -> std::result::Result<(), HandlerError> + Send + 'static,
{
    fn on_message(&mut self, message: Message) -> std::result::Result<(), HandlerError> {
        self(message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    NotRunning = 0,
    Running = 1,
    Stopping = 2,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRunning => "not_running",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::NotRunning,
        }
    }
}

#[derive(Debug)]
pub(crate) struct LoopStateCell(AtomicU8);

impl Default for LoopStateCell {
    fn default() -> Self {
        Self(AtomicU8::new(LoopState::NotRunning as u8))
    }
}

impl LoopStateCell {
    pub(crate) fn get(&self) -> LoopState {
        LoopState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: LoopState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Running -> Stopping. Returns false if the loop was not running.
    fn request_stop(&self) -> bool {
        self.0
            .compare_exchange(
                LoopState::Running as u8,
                LoopState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Cloneable handle that asks a running dispatch loop to stop.
///
/// Safe to use from inside the handler. The loop stays `Stopping` until the
/// owning subscriber's `stop_loop` (or `close`) reclaims it. A stopper only
/// ever affects the loop it was taken from; later loops have their own state.
#[derive(Debug, Clone)]
pub struct LoopStopper {
    stop: CancellationToken,
    state: Arc<LoopStateCell>,
}

impl LoopStopper {
    pub fn request_stop(&self) {
        if self.state.request_stop() {
            tracing::debug!("Dispatch loop stop requested");
        }
        self.stop.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// Everything the worker thread needs besides the inbox and handler.
pub(crate) struct LoopShared {
    pub channel: String,
    pub filters: Arc<FilterSet>,
    pub stats: Arc<SubscriberStats>,
    pub poll_interval: Duration,
}

pub(crate) struct DispatchLoop {
    stop: CancellationToken,
    state: Arc<LoopStateCell>,
    worker: Option<JoinHandle<Inbox>>,
}

impl DispatchLoop {
    /// Move `inbox` onto a new worker thread.
    ///
    /// On failure the inbox is lost with the unspawned closure and the caller
    /// must treat the subscriber as closed.
    pub(crate) fn start<H: MessageHandler>(
        inbox: Inbox,
        handler: H,
        shared: LoopShared,
    ) -> Result<Self> {
        let stop = CancellationToken::new();
        let state = Arc::new(LoopStateCell::default());
        let thread_name = format!("topicbus-dispatch-{}", shared.channel);

        state.set(LoopState::Running);
        let worker = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || run(inbox, handler, shared, stop))
        };

        match worker {
            Ok(worker) => Ok(Self {
                stop,
                state,
                worker: Some(worker),
            }),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub(crate) fn state(&self) -> LoopState {
        self.state.get()
    }

    pub(crate) fn stopper(&self) -> LoopStopper {
        LoopStopper {
            stop: self.stop.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Stop the worker and take back the inbox.
    ///
    /// Returns `None` only if the worker thread itself panicked.
    pub(crate) fn stop(mut self) -> Option<Inbox> {
        self.state.request_stop();
        self.stop.cancel();

        let inbox = match self.worker.take().map(JoinHandle::join) {
            Some(Ok(inbox)) => Some(inbox),
            Some(Err(_)) => {
                tracing::error!("Dispatch worker panicked, inbox lost");
                None
            }
            None => None,
        };

        self.state.set(LoopState::NotRunning);
        inbox
    }
}

fn run<H: MessageHandler>(
    mut inbox: Inbox,
    mut handler: H,
    shared: LoopShared,
    stop: CancellationToken,
) -> Inbox {
    let LoopShared {
        channel,
        filters,
        stats,
        poll_interval,
    } = shared;

    tracing::debug!(%channel, ?poll_interval, "Dispatch loop started");

    loop {
        let frame = match inbox.recv_until(Some(poll_interval), &stop) {
            Ok(Recv::Frame(frame)) => frame,
            Ok(Recv::Timeout) => continue,
            Ok(Recv::Stopped) => break,
            Err(Error::Closed) => {
                tracing::debug!(%channel, "Inbox closed, dispatch loop exiting");
                break;
            }
            Err(e) => {
                tracing::error!(%channel, error = %e, "Dispatch loop receive failed");
                break;
            }
        };

        let Some(message) = admit(frame, &filters, &stats) else {
            continue;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                stats.record_handler_error();
                tracing::warn!(%channel, error = %e, "Message handler failed");
            }
            Err(payload) => {
                stats.record_handler_error();
                let reason = panic_message(payload.as_ref());
                tracing::error!(%channel, panic = %reason, "Message handler panicked");
            }
        }
    }

    tracing::debug!(%channel, "Dispatch loop stopped");
    inbox
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrips_through_cell() {
        let cell = LoopStateCell::default();
        assert_eq!(cell.get(), LoopState::NotRunning);
        assert!(!cell.request_stop());

        cell.set(LoopState::Running);
        assert!(cell.request_stop());
        assert_eq!(cell.get(), LoopState::Stopping);
        assert!(!cell.request_stop());
    }

    #[test]
    fn state_names() {
        let names: Vec<_> = [LoopState::NotRunning, LoopState::Running, LoopState::Stopping]
            .iter()
            .map(LoopState::as_str)
            .collect();
        assert_eq!(names, ["not_running", "running", "stopping"]);
    }

    #[test]
    fn closures_are_handlers() {
        let mut seen = 0;
        let mut handler = move |m: Message| -> std::result::Result<(), HandlerError> {
            seen += 1;
            if m.topic() == "bad" {
                return Err(format!("rejected message {seen}").into());
            }
            Ok(())
        };

        assert!(handler.on_message(Message::new("ok", "1")).is_ok());
        let err = handler.on_message(Message::new("bad", "2")).unwrap_err();
        assert_eq!(err.to_string(), "rejected message 2");
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");

        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }
}
