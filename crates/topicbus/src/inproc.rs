//! In-process endpoints.
//!
//! A bound publisher registers a channel in a process-wide table. Connecting
//! creates an in-memory duplex stream and hands one end to the publisher's
//! accept loop, so inproc traffic uses the same framing as sockets.

use std::io;
use std::sync::LazyLock;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Bytes buffered in each direction of an inproc connection.
const DUPLEX_BUFFER: usize = 64 * 1024;

static REGISTRY: LazyLock<DashMap<String, mpsc::UnboundedSender<DuplexStream>>> =
    LazyLock::new(DashMap::new);

pub(crate) struct InprocListener {
    name: String,
    tx: mpsc::UnboundedSender<DuplexStream>,
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl InprocListener {
    pub(crate) fn bind(name: &str) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        match REGISTRY.entry(name.to_string()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_closed() {
                    return Err(Error::AddressInUse(format!("inproc://{name}")));
                }
                existing.insert(tx.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
            }
        }

        Ok(Self {
            name: name.to_string(),
            tx,
            rx,
        })
    }

    pub(crate) async fn accept(&mut self) -> io::Result<DuplexStream> {
        // We hold a sender ourselves, so recv only ends if the runtime is torn down.
        self.rx.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "inproc listener closed")
        })
    }
}

impl Drop for InprocListener {
    fn drop(&mut self) {
        REGISTRY.remove_if(&self.name, |_, tx| tx.same_channel(&self.tx));
        tracing::trace!(channel = %self.name, "Unregistered inproc endpoint");
    }
}

pub(crate) fn connect(name: &str) -> io::Result<DuplexStream> {
    let tx = REGISTRY
        .get(name)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no inproc endpoint bound at {name}"),
            )
        })?;

    let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
    tx.send(remote).map_err(|_| {
        io::Error::new(io::ErrorKind::ConnectionRefused, "inproc endpoint closed")
    })?;
    Ok(local)
}
