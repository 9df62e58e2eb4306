//! topicbus: topic-filtered publish/subscribe over IPC, TCP and in-process
//! transports.
//!
//! A [`Publisher`] binds a named channel and fans every message out to all
//! connected [`Subscriber`]s. Subscribers keep a set of topic prefix filters
//! and either pull messages with `receive` or run a dispatch loop that calls a
//! [`MessageHandler`] on its own thread.

mod codec;
mod config;
mod context;
mod dispatch;
mod error;
mod filter;
mod frame;
mod inproc;
mod publisher;
mod socket;
mod stats;
mod subscriber;
mod transport;

pub use codec::FrameCodec;
pub use config::{
    BusConfig, ConnectMode, DEFAULT_IPC_DIR, DEFAULT_MAX_FRAME_LEN, DEFAULT_NETWORK_HOST,
    DEFAULT_PORT_BASE, DEFAULT_PORT_SPAN,
};
pub use context::Context;
pub use dispatch::{LoopState, LoopStopper, MessageHandler};
pub use error::{Error, HandlerError, Result};
pub use filter::FilterSet;
pub use frame::{MAX_TOPIC_LEN, Message, decode, encode, encoded_len};
pub use publisher::Publisher;
pub use stats::{PublisherStatsSnapshot, SubscriberStatsSnapshot};
pub use subscriber::Subscriber;
pub use transport::{Address, TransportKind, channel_port, resolve, validate_channel_name};
