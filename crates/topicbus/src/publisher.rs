//! Publish-role endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::BusConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::frame;
use crate::socket::PubSocket;
use crate::stats::{PublisherStats, PublisherStatsSnapshot};
use crate::transport::{self, Address, TransportKind};

/// Interval between peer-count checks in `wait_for_subscribers`.
const PEER_POLL: Duration = Duration::from_millis(5);

/// Sends topic-tagged messages to every connected subscriber.
///
/// `publish` never waits for subscribers. Messages published before a
/// subscriber has connected are not delivered to it.
pub struct Publisher {
    channel: String,
    address: Address,
    max_frame_len: usize,
    _context: Context,
    socket: PubSocket,
    stats: Arc<PublisherStats>,
    closed: bool,
}

impl Publisher {
    /// Bind with configuration from the environment and a private context.
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
        let socket = PubSocket::bind(&address, context, &config)?;

        Ok(Self {
            channel: channel.to_string(),
            address,
            max_frame_len: config.max_frame_len,
            _context: context.clone(),
            socket,
            stats: Arc::new(PublisherStats::default()),
            closed: false,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Publish one message. Succeeds even when nobody is subscribed.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }

        let len = frame::encoded_len(topic, payload);
        if len > self.max_frame_len {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let body = frame::encode(topic, payload)?;
        let report = self.socket.send(body)?;
        self.stats.record_publish(report.queued, report.dropped);

        if report.dropped > 0 {
            tracing::warn!(
                channel = %self.channel,
                topic,
                dropped = report.dropped,
                "Subscriber queues full, message dropped for some subscribers"
            );
        } else {
            tracing::trace!(channel = %self.channel, topic, peers = report.queued, "Published");
        }
        Ok(())
    }

    /// Number of currently connected subscribers.
    pub fn peer_count(&self) -> usize {
        self.socket.peer_count()
    }

    /// Block until at least `n` subscribers are connected or `timeout` elapses.
    pub fn wait_for_subscribers(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.peer_count() >= n {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            std::thread::sleep(PEER_POLL);
        }
    }

    pub fn stats(&self) -> PublisherStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the address. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.socket.close();
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.close();
    }
}
