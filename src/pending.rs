use anyhow::{Result, anyhow};
use std::thread::{self, JoinHandle};

/// A request running in the background.
///
/// The handle settles exactly once: [`Pending::then`] and [`Pending::wait`]
/// both consume it, so only one of the success or failure paths can ever
/// observe the outcome.
#[derive(Debug)]
pub struct Pending<T> {
    handle: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> Pending<T> {
    pub(crate) fn spawn<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Self {
            handle: thread::spawn(f),
        }
    }

    /// Returns `true` once the request has finished, without blocking.
    pub fn is_settled(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until the request settles.
    pub fn wait(self) -> Result<T> {
        self.handle
            .join()
            .unwrap_or_else(|_| Err(anyhow!("request worker panicked")))
    }

    /// Registers the continuations and returns immediately.
    ///
    /// `on_ok` runs with the result or `on_err` with the error, on a worker
    /// thread, once the request settles. The returned handle settles with
    /// whatever the continuation that ran produced.
    pub fn then<R, F, E>(self, on_ok: F, on_err: E) -> Pending<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
        E: FnOnce(anyhow::Error) -> R + Send + 'static,
    {
        Pending::spawn(move || {
            Ok(match self.wait() {
                Ok(v) => on_ok(v),
                Err(e) => on_err(e),
            })
        })
    }
}
