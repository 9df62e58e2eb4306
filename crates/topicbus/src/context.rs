//! Shared I/O context.
//!
//! A `Context` owns the tokio runtime that drives listeners, per-subscriber
//! writers and reconnecting readers. Cloning is cheap; many publishers and
//! subscribers in one process can share one context. The runtime shuts down
//! when the last clone is dropped.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl Context {
    /// Context with the default number of I/O threads.
    pub fn new() -> Result<Self> {
        Self::with_threads(crate::config::BusConfig::default().io_threads)
    }

    pub fn with_threads(io_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(io_threads.max(1))
            .thread_name("topicbus-io")
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(e.to_string()))?;
        let handle = runtime.handle().clone();

        tracing::debug!(io_threads, "Created I/O context");

        Ok(Self {
            inner: Arc::new(ContextInner {
                runtime: Some(runtime),
                handle,
            }),
        })
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Run a future to completion from a blocking caller.
    pub(crate) fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        ensure_blocking_allowed()?;
        Ok(self.inner.handle.block_on(future))
    }
}

/// Blocking entry points cannot run on a runtime thread.
pub(crate) fn ensure_blocking_allowed() -> Result<()> {
    if Handle::try_current().is_ok() {
        return Err(Error::Runtime(
            "blocking topicbus call made from inside an async runtime".to_string(),
        ));
    }
    Ok(())
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Never blocks, so dropping from async code is safe.
            runtime.shutdown_background();
        }
    }
}
