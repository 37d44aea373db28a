use std::sync::{Mutex, PoisonError};

use tokio::sync::{Notify, Semaphore};

use crate::config::Fairness;
use crate::error::{Error, Result};

/// Counting semaphore whose acquisitions are all-or-nothing.
///
/// Permits are handed out without RAII: whoever acquires must call
/// `release_if` with the same count. Dropping an `acquire` future before it
/// resolves never leaks permits.
pub(crate) struct PermitPool {
    inner: Pool,
}

enum Pool {
    Barging {
        available: Mutex<usize>,
        notify: Notify,
    },
    Fifo {
        semaphore: Semaphore,
        // Serializes conditional releases; acquisitions only lower the count.
        releasing: Mutex<()>,
    },
}

impl PermitPool {
    pub fn new(permits: usize, fairness: Fairness) -> Self {
        let inner = match fairness {
            Fairness::Barging => Pool::Barging {
                available: Mutex::new(permits),
                notify: Notify::new(),
            },
            Fairness::Fifo => Pool::Fifo {
                semaphore: Semaphore::new(permits),
                releasing: Mutex::new(()),
            },
        };
        Self { inner }
    }

    pub async fn acquire(&self, permits: usize) -> Result<()> {
        match &self.inner {
            Pool::Barging { notify, .. } => loop {
                // Register interest before checking so a release between the
                // check and the await still wakes us.
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.try_acquire(permits) {
                    return Ok(());
                }
                notified.await;
            },
            Pool::Fifo { semaphore, .. } => {
                let count = u32::try_from(permits).map_err(|_| {
                    Error::InternalOperation(format!("permit count {} too large", permits))
                })?;
                semaphore
                    .acquire_many(count)
                    .await
                    .map_err(|e| Error::InternalOperation(e.to_string()))?
                    .forget();
                Ok(())
            }
        }
    }

    pub fn try_acquire(&self, permits: usize) -> bool {
        match &self.inner {
            Pool::Barging { available, .. } => {
                let mut available = available.lock().unwrap_or_else(PoisonError::into_inner);
                if *available >= permits {
                    *available -= permits;
                    true
                } else {
                    false
                }
            }
            Pool::Fifo { semaphore, .. } => match u32::try_from(permits) {
                Ok(count) => semaphore
                    .try_acquire_many(count)
                    .map(|permit| permit.forget())
                    .is_ok(),
                Err(_) => false,
            },
        }
    }

    /// Return `permits` only if `allowed` accepts the current free count.
    /// The check and the return happen as one step, so two racing callers
    /// cannot both pass on the same count.
    pub fn release_if(&self, permits: usize, allowed: impl FnOnce(usize) -> bool) -> bool {
        match &self.inner {
            Pool::Barging { available, notify } => {
                let mut available = available.lock().unwrap_or_else(PoisonError::into_inner);
                if !allowed(*available) {
                    return false;
                }
                *available += permits;
                drop(available);
                notify.notify_waiters();
                true
            }
            Pool::Fifo {
                semaphore,
                releasing,
            } => {
                let _serial = releasing.lock().unwrap_or_else(PoisonError::into_inner);
                if !allowed(semaphore.available_permits()) {
                    return false;
                }
                semaphore.add_permits(permits);
                true
            }
        }
    }

    pub fn available(&self) -> usize {
        match &self.inner {
            Pool::Barging { available, .. } => {
                *available.lock().unwrap_or_else(PoisonError::into_inner)
            }
            Pool::Fifo { semaphore, .. } => semaphore.available_permits(),
        }
    }
}
