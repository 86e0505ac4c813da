//! Graceful shutdown registry
//!
//! Cleanup callbacks run in registration order, exactly once, each isolated
//! from the failures of the others.

use anyhow::Result;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

type ShutdownHandler = Box<dyn FnOnce() -> Result<()> + Send>;

/// FIFO list of cleanup callbacks plus the process-wide shutdown flag
pub struct ShutdownRegistry {
    handlers: Mutex<Vec<(String, ShutdownHandler)>>,
    requested: AtomicBool,
    completed: AtomicBool,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            requested: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        }
    }

    /// Register a callback to run during shutdown
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.handlers.lock().push((name.into(), Box::new(handler)));
    }

    /// Ask the main loop to stop at its next tick
    pub fn request_shutdown(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
    }

    /// Whether a shutdown was requested or has already run
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Whether the handlers have already run
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Number of handlers still waiting to run
    pub fn pending(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Run every registered handler once. Later calls are no-ops.
    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Starting graceful shutdown...");

        let handlers = std::mem::take(&mut *self.handlers.lock());
        let total = handlers.len();
        for (i, (name, handler)) in handlers.into_iter().enumerate() {
            info!("Calling shutdown handler {}/{} ({})", i + 1, total, name);
            match panic::catch_unwind(AssertUnwindSafe(handler)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Error in shutdown handler {} ({}): {:#}", i + 1, name, e),
                Err(_) => error!("Shutdown handler {} ({}) panicked", i + 1, name),
            }
        }

        info!("Graceful shutdown complete");
    }
}

impl Default for ShutdownRegistry {
    fn default() -> Self {
        Self::new()
    }
}
