//! One-shot claims on PTY resources

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Claim, Error, Result};

/// A value that can be taken out exactly once
#[derive(Debug)]
pub(crate) struct StreamSlot<T> {
    claim: Claim,
    value: Option<T>,
}

impl<T> StreamSlot<T> {
    pub(crate) fn new(claim: Claim, value: T) -> Self {
        Self {
            claim,
            value: Some(value),
        }
    }

    /// Move the value out; every later call fails with `AlreadyTaken`
    pub(crate) fn take(&mut self) -> Result<T> {
        self.value.take().ok_or(Error::AlreadyTaken(self.claim))
    }

    /// Drop the value if it was never taken
    pub(crate) fn clear(&mut self) {
        self.value = None;
    }

    /// `true` once the value has been taken or cleared
    pub(crate) fn is_taken(&self) -> bool {
        self.value.is_none()
    }
}

/// Tracks whether a live child is attached to a PTY
#[derive(Debug, Default)]
pub(crate) struct ConsoleClaim {
    attached: Arc<AtomicBool>,
}

impl ConsoleClaim {
    /// Claim the console for a new child
    pub(crate) fn acquire(&self) -> Result<ConsoleLease> {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::AlreadyTaken(Claim::Console))?;
        Ok(ConsoleLease {
            attached: Arc::clone(&self.attached),
        })
    }

    #[cfg(test)]
    pub(crate) fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

/// Held by a child while it runs; releases the claim on drop
#[derive(Debug)]
pub(crate) struct ConsoleLease {
    attached: Arc<AtomicBool>,
}

impl Drop for ConsoleLease {
    fn drop(&mut self) {
        self.attached.store(false, Ordering::Release);
    }
}
