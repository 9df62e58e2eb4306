//! Endpoint counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub(crate) struct PublisherStats {
    published: AtomicU64,
    deliveries: AtomicU64,
    dropped: AtomicU64,
}

impl PublisherStats {
    pub(crate) fn record_publish(&self, deliveries: usize, dropped: usize) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(deliveries as u64, Ordering::Relaxed);
        self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStatsSnapshot {
    /// Successful `publish` calls.
    pub published: u64,
    /// Frames queued to subscriber connections.
    pub deliveries: u64,
    /// Frames dropped because a subscriber's send queue was full.
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SubscriberStats {
    received: AtomicU64,
    delivered: AtomicU64,
    filtered: AtomicU64,
    malformed: AtomicU64,
    handler_errors: AtomicU64,
    connects: AtomicU64,
}

impl SubscriberStats {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SubscriberStatsSnapshot {
        SubscriberStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriberStatsSnapshot {
    /// Frames taken from the inbox.
    pub received: u64,
    /// Messages returned by `receive` or handed to a handler.
    pub delivered: u64,
    /// Frames whose topic matched no filter.
    pub filtered: u64,
    /// Frames discarded as undecodable.
    pub malformed: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_errors: u64,
    /// Successful connections to the publisher, reconnects included.
    pub connects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publisher_snapshot_accumulates() {
        let stats = PublisherStats::default();
        stats.record_publish(2, 0);
        stats.record_publish(1, 1);
        insta::assert_json_snapshot!(stats.snapshot(), @r#"
        {
          "published": 2,
          "deliveries": 3,
          "dropped": 1
        }
        "#);
    }

    #[test]
    fn subscriber_snapshot_serializes() {
        let stats = SubscriberStats::default();
        stats.record_connect();
        stats.record_received();
        stats.record_received();
        stats.record_delivered();
        stats.record_filtered();
        insta::assert_json_snapshot!(stats.snapshot(), @r#"
        {
          "received": 2,
          "delivered": 1,
          "filtered": 1,
          "malformed": 0,
          "handler_errors": 0,
          "connects": 1
        }
        "#);
    }
}
