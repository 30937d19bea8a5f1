//! Process-wide interrupt flag.
//!
//! Long-running walks (canonicalisation, upgrades, archive dumps) call
//! [`Interrupt::check`] at the top of each step; a triggered flag turns into
//! a fatal error for the current operation and aborts any open transaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use strata_error::{Result, StrataError};

/// Cloneable handle to a shared cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of in-flight operations.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clear the flag, e.g. between top-level operations.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`StrataError::Interrupted`] if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(StrataError::Interrupted)
        } else {
            Ok(())
        }
    }
}
