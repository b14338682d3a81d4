//! Per-report task pool and load handles
//!
//! Every open report owns one pool; dropping the report drops the pool.
//! Work posted to the pool comes back as a [`LoadHandle`], which is a
//! `Future` and can also be waited on from synchronous code.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::error;

use crate::error::{ReportError, Result};

/// Bounded worker pool executing report loads.
pub struct TaskPool {
    pool: ThreadPool,
}

impl TaskPool {
    /// Pool of `threads` workers named `{name}-{i}`.
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let prefix = name.to_string();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{}-{}", prefix, i))
            .panic_handler(|_| error!("Report task panicked; its handle resolves to TaskAborted"))
            .build()
            .map_err(|e| ReportError::InvalidConfig(format!("failed to start task pool: {}", e)))?;
        Ok(Self { pool })
    }

    /// Run `task` on a worker; the result arrives through the returned handle.
    pub fn post<T, F>(&self, task: F) -> LoadHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.pool.spawn(move || {
            // receiver dropped: nobody is waiting
            let _ = sender.send(task());
        });
        LoadHandle { receiver }
    }

    /// Run `op` inside the pool, blocking the caller until it finishes.
    pub fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(op)
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

/// Pending result of a posted load.
#[must_use = "a load handle does nothing unless waited on or polled"]
pub struct LoadHandle<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> LoadHandle<T> {
    /// Handle that is already resolved.
    pub fn ready(result: Result<T>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self { receiver }
    }

    /// Block the calling thread until the load finishes.
    pub fn wait(self) -> Result<T> {
        futures::executor::block_on(self)
    }

    /// The result if the load has finished, without blocking.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(Some(result)) => Some(result),
            Ok(None) => None,
            Err(oneshot::Canceled) => Some(Err(ReportError::TaskAborted)),
        }
    }
}

impl<T> Future for LoadHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ReportError::TaskAborted)))
    }
}
