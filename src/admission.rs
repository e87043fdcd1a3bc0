//! # Admission Controller
//!
//! Gates how many processor invocations run at the same time.
//!
//! The controller hands out [`AdmissionPermit`]s backed by a counting semaphore.
//! A permit returns its slot exactly once: either explicitly through
//! [`AdmissionPermit::release`] or implicitly when it is dropped, which covers
//! early returns, errors and panics inside the guarded work.
//!
//! ```text
//! acquire() ──► [Semaphore: N slots] ──► permit ──► spawned work ──► drop(permit)
//!                      ▲                                                 │
//!                      └───────────────────── slot returned ◄────────────┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

use crate::error::{ReprocessorError, Result};

/// Bounded admission for concurrent work
#[derive(Debug, Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

/// One reserved slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl AdmissionController {
    /// Create a controller admitting at most `max_concurrent` holders
    pub fn new(max_concurrent: usize) -> Result<Self> {
        if max_concurrent == 0 || max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ReprocessorError::ValidationError(format!(
                "max_concurrent must be between 1 and {}, got {max_concurrent}",
                Semaphore::MAX_PERMITS
            )));
        }

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        })
    }

    /// Reserve a slot if one is free, without waiting
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(self.admit(permit)),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => {
                debug!("Admission controller closed - refusing try_acquire");
                None
            }
        }
    }

    /// Wait for a free slot and reserve it.
    ///
    /// Fails only once the controller has been closed.
    pub async fn acquire(&self) -> Result<AdmissionPermit> {
        let permit = self.semaphore.clone().acquire_owned().await.map_err(|_| {
            warn!("Admission controller closed while waiting for a slot");
            ReprocessorError::AdmissionError("admission controller is closed".to_string())
        })?;
        Ok(self.admit(permit))
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> AdmissionPermit {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        AdmissionPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
            idle: self.idle.clone(),
        }
    }

    /// Wait until no permits are outstanding
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Refuse all future acquisitions. Outstanding permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Number of permits currently held
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Number of slots that could be acquired right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Highest number of simultaneously held permits since creation
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

impl AdmissionPermit {
    /// Return the slot now
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}
