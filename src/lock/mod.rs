// Copyright 2025 the waitlock authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An async mutual-exclusion lock with cancellable waits.
//!
//! A [`Lock`] is a [`Semaphore`] with a limit of one and a fixed weight of one: at most one
//! holder at a time, granted in strict FIFO order. Every wait takes a [`Context`] and aborts
//! on its deadline or signal.
//!
//! # Examples
//!
//! ```
//! # #[tokio::main]
//! # async fn main() {
//! use waitlock::context::Context;
//! use waitlock::lock::Lock;
//!
//! let lock = Lock::new();
//! let guard = lock.lock(&Context::new()).await.unwrap();
//! assert!(lock.is_locked());
//! guard.release();
//! assert!(!lock.is_locked());
//! # }
//! ```
//!
//! [`Semaphore`]: crate::semaphore::Semaphore
//! [`Context`]: crate::context::Context

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::Stream;

use crate::context::Context;
use crate::error::AcquireError;
use crate::scoped::Guarded;
use crate::semaphore::Semaphore;


/// An async mutual-exclusion lock.
///
/// See the [module level documentation](self) for more.
pub struct Lock {
    sem: Semaphore,
}

impl Lock {
    /// Creates a new, unlocked lock.
    pub fn new() -> Self {
        Self {
            sem: Semaphore::new(1),
        }
    }

    /// Acquires the lock, waiting until it is free.
    ///
    /// The returned future is lazy; its first poll counts the caller (observable through
    /// [`count`]) and queues it. Dropping the future abandons the wait.
    ///
    /// [`count`]: Lock::count
    pub async fn lock(&self, ctx: &Context) -> Result<LockGuard<'_>, AcquireError> {
        self.sem.acquire(1, ctx).await?;
        Ok(LockGuard {
            lock: self,
            released: false,
        })
    }

    /// Like [`lock`], but the guard owns a reference to the lock.
    ///
    /// The lock must be wrapped in an [`Arc`] to call this method.
    ///
    /// [`lock`]: Lock::lock
    pub async fn lock_owned(self: &Arc<Self>, ctx: &Context) -> Result<OwnedLockGuard, AcquireError> {
        self.sem.acquire(1, ctx).await?;
        Ok(OwnedLockGuard {
            lock: Arc::clone(self),
            released: false,
        })
    }

    /// Attempts to acquire the lock without waiting.
    ///
    /// Fails if the lock is held or any waiter is queued; this method never jumps the queue.
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        self.sem.try_acquire_raw(1).then(|| LockGuard {
            lock: self,
            released: false,
        })
    }

    /// Like [`try_lock`], but the guard owns a reference to the lock.
    ///
    /// [`try_lock`]: Lock::try_lock
    pub fn try_lock_owned(self: &Arc<Self>) -> Option<OwnedLockGuard> {
        self.sem.try_acquire_raw(1).then(|| OwnedLockGuard {
            lock: Arc::clone(self),
            released: false,
        })
    }

    /// Resolves when the lock is observably unlocked from this caller's place in the queue.
    ///
    /// Nothing is held when this returns.
    pub async fn wait_unlocked(&self, ctx: &Context) -> Result<(), AcquireError> {
        self.sem.wait_unlocked(1, ctx).await
    }

    /// Whether any task holds or is queued on the lock.
    pub fn is_locked(&self) -> bool {
        self.sem.is_locked()
    }

    /// The number of tasks inside: the holder plus queued waiters.
    pub fn count(&self) -> usize {
        self.sem.count()
    }

    /// Runs `f` while holding the lock, releasing on every exit path.
    ///
    /// # Examples
    ///
    /// ```
    /// # #[tokio::main]
    /// # async fn main() {
    /// use waitlock::context::Context;
    /// use waitlock::lock::Lock;
    ///
    /// let lock = Lock::new();
    /// let out = lock.with(&Context::new(), || async { 1 + 1 }).await.unwrap();
    /// assert_eq!(out, 2);
    /// assert!(!lock.is_locked());
    /// # }
    /// ```
    pub async fn with<F, Fut, R>(&self, ctx: &Context, f: F) -> Result<R, AcquireError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let guard = self.lock(ctx).await?;
        let out = f().await;
        guard.release();
        Ok(out)
    }

    /// Wraps `stream` so that it holds the lock for its whole life.
    ///
    /// The lock is released when the returned stream is dropped or runs out.
    pub async fn with_stream<S>(
        &self,
        ctx: &Context,
        stream: S,
    ) -> Result<Guarded<S, LockGuard<'_>>, AcquireError>
    where
        S: Stream,
    {
        let guard = self.lock(ctx).await?;
        Ok(Guarded::new(guard, stream))
    }

    pub(crate) fn release_raw(&self) {
        self.sem.release_raw(1);
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock").field("count", &self.count()).finish()
    }
}

/// Holds the lock until released or dropped.
///
/// This type is created by [`lock`] and [`try_lock`] on [`Lock`]. Releasing is single-shot.
///
/// [`lock`]: Lock::lock
/// [`try_lock`]: Lock::try_lock
#[must_use = "the lock is released immediately when the guard is dropped"]
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a Lock,
    released: bool,
}

impl LockGuard<'_> {
    /// Releases the lock.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.lock.release_raw();
        }
    }
}

/// An owned variant of [`LockGuard`], created by [`lock_owned`] and [`try_lock_owned`].
///
/// [`lock_owned`]: Lock::lock_owned
/// [`try_lock_owned`]: Lock::try_lock_owned
#[must_use = "the lock is released immediately when the guard is dropped"]
#[derive(Debug)]
pub struct OwnedLockGuard {
    lock: Arc<Lock>,
    released: bool,
}

impl OwnedLockGuard {
    /// Releases the lock.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for OwnedLockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.lock.release_raw();
        }
    }
}
