use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::semaphore::PermitPool;
use super::LockType;
use crate::config::Fairness;
use crate::error::{Error, Result};

/// N concurrent readers XOR one writer, over a counting semaphore.
///
/// A read takes one permit, a write takes all of them. Releases are
/// permissive: releasing a lock that is not held in the matching mode is a
/// silent no-op rather than an error.
///
/// `lock_type` is advisory. It reads the permit count and the last mode set
/// by an acquisition separately, so a reader releasing while a writer is
/// mid-transition can make it briefly stale.
pub struct ReadWriteLock {
    name: String,
    pool: PermitPool,
    total_permits: usize,
    state: AtomicU8,
    last_operated: Mutex<Instant>,
}

impl ReadWriteLock {
    pub fn new(name: impl Into<String>, total_permits: usize, fairness: Fairness) -> Self {
        let total_permits = total_permits.max(1);
        Self {
            name: name.into(),
            pool: PermitPool::new(total_permits, fairness),
            total_permits,
            state: AtomicU8::new(LockType::None as u8),
            last_operated: Mutex::new(Instant::now()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_permits(&self) -> usize {
        self.total_permits
    }

    pub fn available_permits(&self) -> usize {
        self.pool.available()
    }

    pub fn lock_type(&self) -> LockType {
        if self.pool.available() == self.total_permits {
            return LockType::None;
        }
        LockType::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Last time an acquire or release touched this lock
    pub fn last_operated_at(&self) -> Instant {
        *self
            .last_operated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_operated_at())
    }

    fn touch(&self) {
        *self
            .last_operated
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn set_state(&self, state: LockType) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Wait for one permit
    pub async fn acquire_read(&self) -> Result<()> {
        self.touch();
        self.pool.acquire(1).await?;
        self.set_state(LockType::Read);
        self.touch();
        Ok(())
    }

    /// Wait until every permit is free and take them all at once
    pub async fn acquire_write(&self) -> Result<()> {
        self.touch();
        self.pool.acquire(self.total_permits).await?;
        self.set_state(LockType::Write);
        self.touch();
        Ok(())
    }

    pub async fn acquire_read_within(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.acquire_read())
            .await
            .map_err(|_| Error::LockTimeout(self.name.clone()))?
    }

    pub async fn acquire_write_within(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.acquire_write())
            .await
            .map_err(|_| Error::LockTimeout(self.name.clone()))?
    }

    pub fn try_acquire_read(&self) -> bool {
        self.touch();
        let acquired = self.pool.try_acquire(1);
        if acquired {
            self.set_state(LockType::Read);
        }
        acquired
    }

    pub fn try_acquire_write(&self) -> bool {
        self.touch();
        let acquired = self.pool.try_acquire(self.total_permits);
        if acquired {
            self.set_state(LockType::Write);
        }
        acquired
    }

    /// Return one read permit. No-op unless a read is outstanding.
    pub fn release_read(&self) {
        self.touch();
        let total = self.total_permits;
        self.pool.release_if(1, |free| {
            LockType::from_u8(self.state.load(Ordering::SeqCst)) == LockType::Read && free < total
        });
    }

    /// Return every permit. No-op unless the write lock is held.
    pub fn release_write(&self) {
        self.touch();
        self.pool.release_if(self.total_permits, |free| {
            LockType::from_u8(self.state.load(Ordering::SeqCst)) == LockType::Write && free == 0
        });
    }

    /// Read access released when the guard drops
    pub async fn read(&self) -> Result<ReadGuard<'_>> {
        self.acquire_read().await?;
        Ok(ReadGuard { lock: self })
    }

    /// Write access released when the guard drops
    pub async fn write(&self) -> Result<WriteGuard<'_>> {
        self.acquire_write().await?;
        Ok(WriteGuard { lock: self })
    }
}

pub struct ReadGuard<'a> {
    lock: &'a ReadWriteLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

pub struct WriteGuard<'a> {
    lock: &'a ReadWriteLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
