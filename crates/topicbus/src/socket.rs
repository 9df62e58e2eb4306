//! Endpoint sockets.
//!
//! - **PubSocket**: bound listener plus one bounded send queue per connected
//!   subscriber. Sends never block: a full queue drops the frame for that
//!   subscriber only.
//! - **SubSocket**: background connector that dials the publisher, reconnects
//!   after `reconnect_interval`, and forwards frames into an `Inbox`.
//!
//! All socket I/O runs on the `Context` runtime; the blocking API surface is
//! `PubSocket::send` (never waits) and `Inbox::recv` (waits up to a timeout).

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::FrameCodec;
use crate::config::{BusConfig, ConnectMode};
use crate::context::{Context, ensure_blocking_allowed};
use crate::error::{Error, Result};
use crate::inproc::{self, InprocListener};
use crate::stats::SubscriberStats;
use crate::transport::Address;

/// How long `close` waits for the accept task to release the address.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

pub(crate) trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub(crate) type BoxedStream = Box<dyn Stream>;

/// Identifies one subscriber connection on a publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PeerId(uuid::Uuid);

impl PeerId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
    Inproc(InprocListener),
}

impl Listener {
    fn bind(address: &Address, context: &Context) -> Result<Self> {
        let _guard = context.handle().enter();
        match address {
            Address::Ipc(path) => {
                let listener = bind_unix(path).map_err(|e| map_bind_error(e, address))?;
                listener.set_nonblocking(true)?;
                Ok(Self::Unix(UnixListener::from_std(listener)?))
            }
            Address::Network { host, port } => {
                let listener = std::net::TcpListener::bind((host.as_str(), *port))
                    .map_err(|e| map_bind_error(e, address))?;
                listener.set_nonblocking(true)?;
                Ok(Self::Tcp(TcpListener::from_std(listener)?))
            }
            Address::Inproc(name) => Ok(Self::Inproc(InprocListener::bind(name)?)),
        }
    }

    async fn accept(&mut self) -> io::Result<BoxedStream> {
        match self {
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Self::Inproc(listener) => Ok(Box::new(listener.accept().await?)),
        }
    }
}

/// Bind a Unix socket, replacing a stale socket file nobody listens on.
fn bind_unix(path: &Path) -> io::Result<std::os::unix::net::UnixListener> {
    use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    match StdUnixListener::bind(path) {
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            if StdUnixStream::connect(path).is_ok() {
                return Err(e);
            }
            tracing::debug!(path = %path.display(), "Removing stale socket file");
            std::fs::remove_file(path)?;
            StdUnixListener::bind(path)
        }
        other => other,
    }
}

fn map_bind_error(err: io::Error, address: &Address) -> Error {
    if err.kind() == io::ErrorKind::AddrInUse {
        Error::AddressInUse(address.to_string())
    } else {
        Error::Io(err)
    }
}

async fn dial(address: &Address) -> io::Result<BoxedStream> {
    match address {
        Address::Ipc(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        Address::Network { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        Address::Inproc(name) => Ok(Box::new(inproc::connect(name)?)),
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Outcome of one `PubSocket::send`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SendReport {
    pub queued: usize,
    pub dropped: usize,
}

type PeerTable = Arc<DashMap<PeerId, mpsc::Sender<Bytes>>>;

/// Publish-role endpoint.
pub(crate) struct PubSocket {
    address: Address,
    context: Context,
    peers: PeerTable,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    failure: Arc<OnceLock<String>>,
}

impl PubSocket {
    pub(crate) fn bind(address: &Address, context: &Context, config: &BusConfig) -> Result<Self> {
        let listener = Listener::bind(address, context)?;

        let peers: PeerTable = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();
        let failure = Arc::new(OnceLock::new());

        let accept_task = context.handle().spawn(accept_loop(
            listener,
            Arc::clone(&peers),
            cancel.clone(),
            Arc::clone(&failure),
            config.send_capacity(),
            config.max_frame_len,
        ));

        tracing::info!(address = %address, "Publisher bound");

        Ok(Self {
            address: address.clone(),
            context: context.clone(),
            peers,
            cancel,
            accept_task: Some(accept_task),
            failure,
        })
    }

    /// Queue a frame for every connected subscriber without waiting.
    pub(crate) fn send(&self, frame: Bytes) -> Result<SendReport> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }
        if let Some(reason) = self.failure.get() {
            return Err(Error::send_failed(reason.clone()));
        }

        let mut report = SendReport::default();
        let mut gone = Vec::new();
        for peer in self.peers.iter() {
            match peer.value().try_send(frame.clone()) {
                Ok(()) => report.queued += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(peer = %peer.key(), "Send queue full, dropping frame");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => gone.push(*peer.key()),
            }
        }
        for peer in gone {
            self.peers.remove(&peer);
        }

        Ok(report)
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn close(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.peers.clear();

        // Wait briefly so the listener is released before we return; skipped
        // inside async code where blocking is not allowed. The timer must be
        // created on the runtime, hence the async block.
        if let Some(task) = self.accept_task.take()
            && ensure_blocking_allowed().is_ok()
        {
            let _ = self
                .context
                .handle()
                .block_on(async move { tokio::time::timeout(CLOSE_GRACE, task).await });
        }

        if let Address::Ipc(path) = &self.address
            && let Err(e) = std::fs::remove_file(path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket file");
        }

        tracing::info!(address = %self.address, "Publisher closed");
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    mut listener: Listener,
    peers: PeerTable,
    cancel: CancellationToken,
    failure: Arc<OnceLock<String>>,
    send_capacity: usize,
    max_frame_len: usize,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let stream = match accepted {
            Ok(stream) => stream,
            Err(e) if is_transient_accept_error(&e) => {
                tracing::debug!(error = %e, "Transient accept error");
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "Accept failed, publisher can no longer take subscribers");
                let _ = failure.set(format!("listener failed: {e}"));
                break;
            }
        };

        let peer = PeerId::new();
        let (tx, rx) = mpsc::channel(send_capacity);
        peers.insert(peer, tx);
        tracing::debug!(%peer, peers = peers.len(), "Subscriber connected");

        tokio::spawn(peer_writer(
            peer,
            stream,
            rx,
            Arc::clone(&peers),
            cancel.child_token(),
            max_frame_len,
        ));
    }
}

/// Drains one subscriber's send queue onto its stream.
async fn peer_writer(
    peer: PeerId,
    stream: BoxedStream,
    mut rx: mpsc::Receiver<Bytes>,
    peers: PeerTable,
    cancel: CancellationToken,
    max_frame_len: usize,
) {
    let (mut read_half, write_half) = tokio::io::split(stream);
    let mut writer = FramedWrite::new(write_half, FrameCodec::new(max_frame_len));
    // Subscribers never write; a read only completes on disconnect.
    let mut probe = [0u8; 64];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let sent = tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = writer.send(frame) => sent,
                };
                if let Err(e) = sent {
                    tracing::debug!(%peer, error = %e, "Subscriber write failed");
                    break;
                }
            }
            read = read_half.read(&mut probe) => {
                if matches!(read, Ok(0) | Err(_)) {
                    tracing::debug!(%peer, "Subscriber disconnected");
                    break;
                }
            }
        }
    }

    peers.remove(&peer);
}

/// Result of waiting on an inbox.
pub(crate) enum Recv {
    Frame(Bytes),
    Timeout,
    Stopped,
}

/// Receive side of a subscriber endpoint. Owned by exactly one consumer.
pub(crate) struct Inbox {
    rx: mpsc::Receiver<Bytes>,
    context: Context,
}

impl Inbox {
    /// `None` blocks indefinitely, zero polls once.
    pub(crate) fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        match self.recv_until(timeout, &CancellationToken::new())? {
            Recv::Frame(frame) => Ok(Some(frame)),
            Recv::Timeout | Recv::Stopped => Ok(None),
        }
    }

    /// Like `recv`, but returns early once `stop` is cancelled.
    pub(crate) fn recv_until(
        &mut self,
        timeout: Option<Duration>,
        stop: &CancellationToken,
    ) -> Result<Recv> {
        if stop.is_cancelled() {
            return Ok(Recv::Stopped);
        }

        if timeout == Some(Duration::ZERO) {
            return match self.rx.try_recv() {
                Ok(frame) => Ok(Recv::Frame(frame)),
                Err(TryRecvError::Empty) => Ok(Recv::Timeout),
                Err(TryRecvError::Disconnected) => Err(Error::Closed),
            };
        }

        let rx = &mut self.rx;
        self.context.block_on(async move {
            let next = async {
                match timeout {
                    Some(t) => tokio::time::timeout(t, rx.recv()).await.ok(),
                    None => Some(rx.recv().await),
                }
            };
            tokio::select! {
                _ = stop.cancelled() => Ok(Recv::Stopped),
                next = next => match next {
                    None => Ok(Recv::Timeout),
                    Some(Some(frame)) => Ok(Recv::Frame(frame)),
                    Some(None) => Err(Error::Closed),
                },
            }
        })?
    }
}

/// Subscribe-role endpoint: the background connection to the publisher.
pub(crate) struct SubSocket {
    address: Address,
    context: Context,
    cancel: CancellationToken,
    connected: watch::Receiver<bool>,
}

impl SubSocket {
    pub(crate) fn connect(
        address: &Address,
        context: &Context,
        config: &BusConfig,
        stats: Arc<SubscriberStats>,
    ) -> Result<(Self, Inbox)> {
        let (tx, rx) = mpsc::channel(config.recv_capacity());
        let (state_tx, state_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        context.handle().spawn(connect_loop(
            address.clone(),
            tx,
            state_tx,
            cancel.clone(),
            config.reconnect_interval(),
            config.max_frame_len,
            stats,
        ));

        let socket = Self {
            address: address.clone(),
            context: context.clone(),
            cancel,
            connected: state_rx,
        };

        if config.connect_mode == ConnectMode::Eager
            && !socket.wait_connected(config.connect_timeout())?
        {
            // Dropping the socket cancels the connector.
            return Err(Error::ConnectionUnavailable(address.to_string()));
        }

        tracing::info!(address = %address, mode = ?config.connect_mode, "Subscriber connecting");

        let inbox = Inbox {
            rx,
            context: context.clone(),
        };
        Ok((socket, inbox))
    }

    pub(crate) fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub(crate) fn wait_connected(&self, timeout: Duration) -> Result<bool> {
        if self.is_connected() {
            return Ok(true);
        }
        let mut state = self.connected.clone();
        self.context.block_on(async move {
            matches!(
                tokio::time::timeout(timeout, state.wait_for(|connected| *connected)).await,
                Ok(Ok(_))
            )
        })
    }

    pub(crate) fn close(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        tracing::info!(address = %self.address, "Subscriber closed");
    }
}

impl Drop for SubSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn connect_loop(
    address: Address,
    tx: mpsc::Sender<Bytes>,
    state: watch::Sender<bool>,
    cancel: CancellationToken,
    reconnect_interval: Duration,
    max_frame_len: usize,
    stats: Arc<SubscriberStats>,
) {
    loop {
        let dialed = tokio::select! {
            _ = cancel.cancelled() => break,
            dialed = dial(&address) => dialed,
        };

        match dialed {
            Ok(stream) => {
                stats.record_connect();
                state.send_replace(true);
                tracing::debug!(address = %address, "Connected to publisher");

                let mut reader = FramedRead::new(stream, FrameCodec::new(max_frame_len));
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => None,
                        next = reader.next() => Some(next),
                    };
                    let Some(next) = next else {
                        state.send_replace(false);
                        return;
                    };
                    match next {
                        Some(Ok(frame)) => {
                            let forwarded = tokio::select! {
                                _ = cancel.cancelled() => false,
                                sent = tx.send(frame) => sent.is_ok(),
                            };
                            if !forwarded {
                                state.send_replace(false);
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(address = %address, error = %e, "Dropping publisher connection after framing error");
                            break;
                        }
                        None => {
                            tracing::debug!(address = %address, "Publisher closed connection");
                            break;
                        }
                    }
                }
                state.send_replace(false);
            }
            Err(e) => {
                tracing::trace!(address = %address, error = %e, "Publisher not reachable yet");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(reconnect_interval) => {}
        }
    }
    state.send_replace(false);
}
