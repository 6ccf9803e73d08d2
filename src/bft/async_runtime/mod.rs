//! A thin wrapper around `tokio`'s async runtime.
//!
//! The rest of the crate never touches `tokio` directly; it spawns
//! tasks and schedules timers through this module instead, so the
//! underlying executor could be swapped without touching call sites.

pub mod tokio;

use std::future::Future;

use parking_lot::RwLock;

use crate::bft::error::*;

use self::tokio::Runtime;

pub use self::tokio::JoinHandle;

static RUNTIME: RwLock<Option<Runtime>> = RwLock::new(None);

/// Initializes the global async runtime, with `num_threads` worker threads.
pub fn init(num_threads: usize) -> Result<()> {
    let runtime = tokio::init(num_threads)
        .map_err(|_| Error::simple(ErrorKind::Config))?;
    *RUNTIME.write() = Some(runtime);
    Ok(())
}

/// Tears down the global async runtime.
pub fn drop() -> Result<()> {
    if let Some(runtime) = RUNTIME.write().take() {
        runtime.shutdown_background();
    }
    Ok(())
}

/// Spawns a new asynchronous task onto the global runtime.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let guard = RUNTIME.read();
    let handle = guard.as_ref().expect("async runtime not initialized").handle();
    handle.spawn(future)
}

/// Blocks the current thread until `future` completes, driven by the
/// global runtime.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let guard = RUNTIME.read();
    let handle = guard.as_ref().expect("async runtime not initialized").handle();
    handle.block_on(future)
}
