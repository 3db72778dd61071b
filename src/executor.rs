//! Async Executor
//!
//! Runs blocking cache operations on tokio's blocking pool and hands back a
//! [`CacheFuture`] that resolves once the operation, including its
//! replication round, has finished.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{CacheError, Result};

/// Runtime built by the executor when none was running.
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

#[derive(Clone)]
pub struct AsyncExecutor {
    handle: Handle,
    owned: Option<Arc<OwnedRuntime>>,
}

impl AsyncExecutor {
    /// Uses the ambient tokio runtime, or starts a small one of its own.
    pub fn new() -> Result<Self> {
        if let Ok(handle) = Handle::try_current() {
            return Ok(Self {
                handle,
                owned: None,
            });
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("mesh-cache-async")
            .enable_all()
            .build()
            .map_err(|err| CacheError::Internal(format!("failed to start runtime: {}", err)))?;
        debug!("async executor started its own runtime");
        Ok(Self {
            handle: runtime.handle().clone(),
            owned: Some(Arc::new(OwnedRuntime(Some(runtime)))),
        })
    }

    /// Runs `work` off the calling context.
    pub fn spawn<T, F>(&self, work: F) -> CacheFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.handle.spawn_blocking(move || {
            // The caller may have dropped the future
            let _ = tx.send(work());
        });
        CacheFuture::pending(rx)
    }
}

impl fmt::Debug for AsyncExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncExecutor")
            .field("owns_runtime", &self.owned.is_some())
            .finish()
    }
}

// == Cache Future ==
/// One-shot result of an asynchronous cache operation.
///
/// Await it from async code or call [`CacheFuture::get`] from a thread that
/// is not driving a runtime.
pub struct CacheFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
    ready: Option<Result<T>>,
}

impl<T> CacheFuture<T> {
    fn pending(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self { rx, ready: None }
    }

    /// Blocks until the operation completes.
    ///
    /// # Panics
    /// When called from within an async execution context.
    pub fn get(mut self) -> Result<T> {
        match self.ready.take() {
            Some(result) => result,
            None => self.rx.blocking_recv().unwrap_or_else(|_| Err(abandoned())),
        }
    }

    /// True once the result is available.
    pub fn is_done(&mut self) -> bool {
        if self.ready.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.ready = Some(result);
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.ready = Some(Err(abandoned()));
                true
            }
        }
    }

    /// Operations cannot be interrupted once submitted; always false.
    pub fn cancel(&self) -> bool {
        false
    }
}

impl<T> Unpin for CacheFuture<T> {}

impl<T> Future for CacheFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(result) = this.ready.take() {
            return Poll::Ready(result);
        }
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(abandoned())))
    }
}

impl<T> fmt::Debug for CacheFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFuture")
            .field("ready", &self.ready.is_some())
            .finish()
    }
}

fn abandoned() -> CacheError {
    CacheError::Internal("operation was abandoned before completing".to_string())
}
