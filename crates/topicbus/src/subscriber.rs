//! Subscribe-role endpoint with a topic filter set.
//!
//! A subscriber starts with no filters and therefore receives nothing until
//! `subscribe` is called. Messages are consumed either by pulling with
//! `receive` or by a dispatch loop, never both at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::bytes::Bytes;

use crate::config::BusConfig;
use crate::context::Context;
use crate::dispatch::{DispatchLoop, LoopShared, LoopState, LoopStopper, MessageHandler};
use crate::error::{Error, HandlerError, Result};
use crate::filter::FilterSet;
use crate::frame::{self, Message};
use crate::socket::{Inbox, SubSocket};
use crate::stats::{SubscriberStats, SubscriberStatsSnapshot};
use crate::transport::{self, Address, TransportKind};

pub struct Subscriber {
    channel: String,
    address: Address,
    config: BusConfig,
    // Keeps the runtime alive for the socket and inbox.
    _context: Context,
    socket: SubSocket,
    /// `None` while a dispatch loop owns the inbox, or after it was lost.
    inbox: Option<Inbox>,
    filters: Arc<FilterSet>,
    stats: Arc<SubscriberStats>,
    dispatch: Option<DispatchLoop>,
    closed: bool,
}

impl Subscriber {
    /// Connect with configuration from the environment and a private context.
    pub fn new(channel: &str, kind: TransportKind) -> Result<Self> {
        Self::with_config(channel, kind, BusConfig::from_env())
    }

    pub fn with_config(channel: &str, kind: TransportKind, config: BusConfig) -> Result<Self> {
        let context = Context::with_threads(config.io_threads)?;
        Self::with_context(channel, kind, config, &context)
    }

    pub fn with_context(
        channel: &str,
        kind: TransportKind,
        config: BusConfig,
        context: &Context,
    ) -> Result<Self> {
        let address = transport::resolve(channel, kind, &config)?;
        let stats = Arc::new(SubscriberStats::default());
        let (socket, inbox) = SubSocket::connect(&address, context, &config, Arc::clone(&stats))?;

        Ok(Self {
            channel: channel.to_string(),
            address,
            config,
            _context: context.clone(),
            socket,
            inbox: Some(inbox),
            filters: Arc::new(FilterSet::new()),
            stats,
            dispatch: None,
            closed: false,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Add a topic prefix filter. Returns false if it was already present.
    pub fn subscribe(&self, filter: &str) -> bool {
        let added = self.filters.insert(filter);
        if added {
            tracing::debug!(channel = %self.channel, filter, "Subscribed");
        }
        added
    }

    /// Remove a topic prefix filter. Returns false if it was not present.
    pub fn unsubscribe(&self, filter: &str) -> bool {
        let removed = self.filters.remove(filter);
        if removed {
            tracing::debug!(channel = %self.channel, filter, "Unsubscribed");
        }
        removed
    }

    /// Sorted snapshot of the active filters.
    pub fn filters(&self) -> Vec<String> {
        self.filters.snapshot()
    }

    /// Wait for the next matching message.
    ///
    /// `None` waits indefinitely, `Some(Duration::ZERO)` drains what is
    /// already buffered without waiting. Returns `Ok(None)` on timeout.
    pub fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<Message>> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.dispatch.is_some() {
            return Err(Error::LoopActive);
        }
        let inbox = self.inbox.as_mut().ok_or(Error::Closed)?;

        // A timeout too large to represent as an instant means no deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let Some(frame) = inbox.recv(remaining)? else {
                return Ok(None);
            };
            if let Some(message) = admit(frame, &self.filters, &self.stats) {
                return Ok(Some(message));
            }
            if remaining == Some(Duration::ZERO) && timeout != Some(Duration::ZERO) {
                return Ok(None);
            }
        }
    }

    /// `receive` with a millisecond timeout; negative waits indefinitely.
    pub fn receive_ms(&mut self, timeout_ms: i64) -> Result<Option<Message>> {
        let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
        self.receive(timeout)
    }

    /// Start a dispatch loop that calls `callback` for every matching message.
    pub fn start_loop<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(Message) -> std::result::Result<(), HandlerError> + Send + 'static,
    {
        self.start_handler(callback)
    }

    pub fn start_handler<H: MessageHandler>(&mut self, handler: H) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.dispatch.is_some() {
            return Err(Error::LoopAlreadyRunning);
        }
        let inbox = self.inbox.take().ok_or(Error::Closed)?;

        let shared = LoopShared {
            channel: self.channel.clone(),
            filters: Arc::clone(&self.filters),
            stats: Arc::clone(&self.stats),
            poll_interval: self.config.poll_interval(),
        };
        match DispatchLoop::start(inbox, handler, shared) {
            Ok(dispatch) => {
                self.dispatch = Some(dispatch);
                tracing::info!(channel = %self.channel, "Dispatch loop running");
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Stop the dispatch loop and wait for it to exit. No-op if none is running.
    pub fn stop_loop(&mut self) {
        let Some(dispatch) = self.dispatch.take() else {
            return;
        };
        match dispatch.stop() {
            Some(inbox) => self.inbox = Some(inbox),
            None => self.close(),
        }
        tracing::info!(channel = %self.channel, "Dispatch loop stopped");
    }

    /// State of the current loop; `NotRunning` once it has been reclaimed.
    pub fn loop_state(&self) -> LoopState {
        self.dispatch
            .as_ref()
            .map_or(LoopState::NotRunning, DispatchLoop::state)
    }

    /// Handle for stopping the running loop from its own handler.
    pub fn stopper(&self) -> Option<LoopStopper> {
        self.dispatch.as_ref().map(DispatchLoop::stopper)
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    /// Block until connected to the publisher or `timeout` elapses.
    pub fn wait_connected(&self, timeout: Duration) -> Result<bool> {
        self.socket.wait_connected(timeout)
    }

    pub fn stats(&self) -> SubscriberStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop any dispatch loop and disconnect. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stop_loop();
        self.closed = true;
        self.socket.close();
        self.inbox = None;
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decode a frame and keep it only if its topic passes the filters.
pub(crate) fn admit(frame: Bytes, filters: &FilterSet, stats: &SubscriberStats) -> Option<Message> {
    stats.record_received();
    let message = match frame::decode(frame) {
        Ok(message) => message,
        Err(e) => {
            stats.record_malformed();
            tracing::warn!(error = %e, "Discarding malformed frame");
            return None;
        }
    };

    if !filters.matches(message.topic()) {
        stats.record_filtered();
        tracing::trace!(topic = message.topic(), "Filtered out");
        return None;
    }

    stats.record_delivered();
    Some(message)
}
