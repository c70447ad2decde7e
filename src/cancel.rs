//! Cooperative cancellation.
//!
//! A [`Session`] carries the two pieces of state the interrupt handler is
//! allowed to touch: a sticky stop flag and the table of live child
//! processes. The handler itself only calls [`Session::request_stop`]; all
//! real cleanup happens on the pipeline's control thread, which polls
//! [`Session::should_stop`] at every loop boundary.
//!
//! # Example
//!
//! ```
//! use anime_upscaler::Session;
//!
//! let session = Session::new();
//! assert!(!session.should_stop());
//!
//! assert!(session.request_stop());
//! // Later requests are no-ops.
//! assert!(!session.request_stop());
//! assert!(session.should_stop());
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::error::UpscalerError;
use crate::process::ProcessSupervisor;

/// Shared state of one pipeline run.
///
/// Clone this handle to give the interrupt handler access; every clone
/// observes the same flag and the same process table.
#[derive(Debug, Clone, Default)]
pub struct Session {
    inner: Arc<SessionState>,
}

#[derive(Debug, Default)]
struct SessionState {
    stop_requested: AtomicBool,
    broadcasts: AtomicUsize,
    supervisor: ProcessSupervisor,
}

impl Session {
    /// Create a session with the flag cleared and no tracked processes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Supervisor whose children are interrupted on stop.
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.inner.supervisor
    }

    /// Request a shutdown.
    ///
    /// The first call sets the sticky flag and interrupts every tracked
    /// child. Every later call does nothing. Returns `true` only for the call
    /// that initiated the shutdown.
    pub fn request_stop(&self) -> bool {
        if self.inner.stop_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.broadcasts.fetch_add(1, Ordering::AcqRel);
        self.inner.supervisor.broadcast_terminate();
        true
    }

    /// Returns `true` once a stop has been requested. Never resets.
    pub fn should_stop(&self) -> bool {
        self.inner.stop_requested.load(Ordering::Acquire)
    }

    /// How many times the termination broadcast ran (0 or 1).
    pub fn termination_broadcasts(&self) -> usize {
        self.inner.broadcasts.load(Ordering::Acquire)
    }
}

/// Route SIGINT and SIGTERM to [`Session::request_stop`].
///
/// Must be called before any temporary files are created so an early
/// interrupt cannot leave them behind. Only one handler can be installed
/// per process.
///
/// # Errors
///
/// Returns [`UpscalerError::InterruptHandler`] if a handler is already
/// installed or the OS refuses the registration.
pub fn install_interrupt_handler(session: &Session) -> Result<(), UpscalerError> {
    let session = session.clone();
    ctrlc::set_handler(move || {
        if session.request_stop() {
            log::info!("Interrupt received, stopping after the current step");
        }
    })
    .map_err(|error| UpscalerError::InterruptHandler(error.to_string()))
}
