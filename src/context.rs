//! Execution context detection.
//!
//! A session serves either blocking callers or cooperative (tokio) callers,
//! never both. The mode starts undetermined and is fixed by the first call.

use std::fmt;
use std::sync::OnceLock;

use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;

use crate::error::{Error, Result};

/// How calls on a session are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// The calling thread blocks until the response arrives.
    Blocking,
    /// Calls return futures driven by the caller's tokio runtime.
    Cooperative,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Blocking => write!(f, "blocking"),
            ExecutionMode::Cooperative => write!(f, "cooperative"),
        }
    }
}

/// Detect the mode of the current thread.
///
/// Returns `Cooperative` when a tokio runtime is entered on this thread and
/// `Blocking` otherwise. Anything that is not clearly inside a runtime falls
/// back to `Blocking`.
pub fn detect() -> ExecutionMode {
    match Handle::try_current() {
        Ok(_) => ExecutionMode::Cooperative,
        Err(e) => {
            debug!("No tokio runtime on this thread ({}), using blocking mode", e);
            ExecutionMode::Blocking
        }
    }
}

/// What a blocking call may do on the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockingStrategy {
    /// No runtime is entered; block directly.
    Direct,
    /// Inside a multi-threaded runtime worker; hand the worker off first.
    BlockInPlace,
}

/// Decide how a blocking call can run on this thread.
///
/// # Errors
///
/// Returns `Error::Context` inside a current-thread runtime, where blocking
/// would stall the only worker.
pub(crate) fn blocking_strategy() -> Result<BlockingStrategy> {
    match Handle::try_current() {
        Err(_) => Ok(BlockingStrategy::Direct),
        Ok(handle) => match handle.runtime_flavor() {
            RuntimeFlavor::MultiThread => Ok(BlockingStrategy::BlockInPlace),
            _ => Err(Error::Context(
                "blocking call made from inside a current-thread tokio runtime; use the async client"
                    .to_string(),
            )),
        },
    }
}

/// Write-once execution mode of a session.
///
/// `Undetermined -> Blocking | Cooperative`, with no way back.
#[derive(Debug, Default)]
pub struct ModeCell {
    mode: OnceLock<ExecutionMode>,
}

impl ModeCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// The resolved mode, or `None` while undetermined.
    pub fn get(&self) -> Option<ExecutionMode> {
        self.mode.get().copied()
    }

    /// Claim the session for `mode`.
    ///
    /// The first claim wins. Later claims for the same mode succeed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Context` when the session is already bound to the
    /// other mode.
    pub fn claim(&self, mode: ExecutionMode) -> Result<ExecutionMode> {
        let bound = *self.mode.get_or_init(|| {
            debug!("Session bound to {} mode", mode);
            mode
        });
        if bound == mode {
            Ok(bound)
        } else {
            Err(Error::Context(format!(
                "session is bound to {} mode, cannot serve a {} call",
                bound, mode
            )))
        }
    }
}
