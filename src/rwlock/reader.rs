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

//! The read-preferring reader-writer lock.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::try_join;
use futures_util::Stream;

use crate::context::Context;
use crate::error::AcquireError;
use crate::internal;
use crate::lock::Lock;
use crate::lock::OwnedLockGuard;
use crate::rwlock::LockType;
use crate::scoped::Guarded;

/// A read-preferring reader-writer lock.
///
/// Readers only ever wait on the reader gate, never behind a queued writer, so reads proceed
/// as long as other reads are in flight and writers can starve. The first reader in acquires
/// the write-exclusion lock on behalf of the whole reader cohort; the last reader out hands it
/// back.
///
/// See the [module level documentation](super) for more.
pub struct RwLockReader {
    /// Serializes reader entry so exactly one reader takes the cohort role.
    readers_lock: Lock,
    /// The write exclusion, held by a writer or by the reader cohort.
    writers_lock: Arc<Lock>,
    state: internal::Mutex<ReaderState>,
}

#[derive(Default)]
struct ReaderState {
    /// Admitted readers.
    readers: usize,
    /// Readers queued on the reader gate.
    readers_blocked: usize,
    /// Admitted plus queued writers.
    writers: usize,
    /// The write exclusion held on behalf of the readers, while any reader is in.
    cohort: Option<OwnedLockGuard>,
}

impl RwLockReader {
    /// Creates a new, unlocked lock.
    pub fn new() -> Self {
        Self {
            readers_lock: Lock::new(),
            writers_lock: Arc::new(Lock::new()),
            state: internal::Mutex::new(ReaderState::default()),
        }
    }

    /// Acquires shared read access.
    ///
    /// Waits only while another reader is entering or while a writer holds the lock; queued
    /// writers do not block new readers. A reader cancelled while taking the write exclusion
    /// for the cohort fails alone: the next queued reader retries with its own context.
    pub async fn read(&self, ctx: &Context) -> Result<ReaderReadGuard<'_>, AcquireError> {
        self.acquire_read(ctx).await?;
        Ok(ReaderReadGuard {
            rw: self,
            released: false,
        })
    }

    /// Like [`read`], but the guard owns a reference to the lock.
    ///
    /// [`read`]: RwLockReader::read
    pub async fn read_owned(
        self: &Arc<Self>,
        ctx: &Context,
    ) -> Result<OwnedReaderReadGuard, AcquireError> {
        self.acquire_read(ctx).await?;
        Ok(OwnedReaderReadGuard {
            rw: Arc::clone(self),
            released: false,
        })
    }

    /// Acquires exclusive write access.
    pub async fn write(&self, ctx: &Context) -> Result<ReaderWriteGuard<'_>, AcquireError> {
        let hold = self.acquire_write(ctx).await?;
        Ok(ReaderWriteGuard {
            rw: self,
            hold: Some(hold),
        })
    }

    /// Like [`write`], but the guard owns a reference to the lock.
    ///
    /// [`write`]: RwLockReader::write
    pub async fn write_owned(
        self: &Arc<Self>,
        ctx: &Context,
    ) -> Result<OwnedReaderWriteGuard, AcquireError> {
        let hold = self.acquire_write(ctx).await?;
        Ok(OwnedReaderWriteGuard {
            rw: Arc::clone(self),
            hold: Some(hold),
        })
    }

    /// Acquires the lock in the given mode.
    pub async fn lock(&self, ty: LockType, ctx: &Context) -> Result<ReaderGuard<'_>, AcquireError> {
        match ty {
            LockType::Read => Ok(ReaderGuard::Read(self.read(ctx).await?)),
            LockType::Write => Ok(ReaderGuard::Write(self.write(ctx).await?)),
        }
    }

    /// Like [`lock`], but the guard owns a reference to the lock.
    ///
    /// [`lock`]: RwLockReader::lock
    pub async fn lock_owned(
        self: &Arc<Self>,
        ty: LockType,
        ctx: &Context,
    ) -> Result<OwnedReaderGuard, AcquireError> {
        match ty {
            LockType::Read => Ok(OwnedReaderGuard::Read(self.read_owned(ctx).await?)),
            LockType::Write => Ok(OwnedReaderGuard::Write(self.write_owned(ctx).await?)),
        }
    }

    /// Resolves when both inner locks are observably unlocked.
    ///
    /// Nothing is held when this returns.
    pub async fn wait_unlocked(&self, ctx: &Context) -> Result<(), AcquireError> {
        try_join(
            self.readers_lock.wait_unlocked(ctx),
            self.writers_lock.wait_unlocked(ctx),
        )
        .await?;
        Ok(())
    }

    /// Whether the lock is held in the given mode, or in any mode when `ty` is `None`.
    pub fn is_locked(&self, ty: Option<LockType>) -> bool {
        match ty {
            None => self.readers_lock.is_locked() || self.writers_lock.is_locked(),
            Some(LockType::Read) => {
                self.state.with(|s| s.readers > 0) || self.readers_lock.is_locked()
            }
            Some(LockType::Write) => {
                self.state.with(|s| s.writers > 0 && s.cohort.is_none())
                    && self.writers_lock.is_locked()
            }
        }
    }

    /// Admitted readers plus readers queued on the reader gate.
    pub fn reader_count(&self) -> usize {
        self.state.with(|s| s.readers + s.readers_blocked)
    }

    /// Admitted plus queued writers.
    pub fn writer_count(&self) -> usize {
        self.state.with(|s| s.writers)
    }

    /// Live holders plus waiters across both sides.
    pub fn count(&self) -> usize {
        self.reader_count() + self.writer_count()
    }

    /// Runs `f` while holding the lock in the given mode, releasing on every exit path.
    pub async fn with<F, Fut, R>(
        &self,
        ty: LockType,
        ctx: &Context,
        f: F,
    ) -> Result<R, AcquireError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let guard = self.lock(ty, ctx).await?;
        let out = f().await;
        guard.release();
        Ok(out)
    }

    /// Wraps `stream` so that it holds the lock in the given mode for its whole life.
    pub async fn with_stream<S>(
        &self,
        ty: LockType,
        ctx: &Context,
        stream: S,
    ) -> Result<Guarded<S, ReaderGuard<'_>>, AcquireError>
    where
        S: Stream,
    {
        let guard = self.lock(ty, ctx).await?;
        Ok(Guarded::new(guard, stream))
    }

    async fn acquire_read(&self, ctx: &Context) -> Result<(), AcquireError> {
        self.state.with(|s| s.readers_blocked += 1);
        let gate = self.readers_lock.lock(ctx).await;
        self.state.with(|s| s.readers_blocked -= 1);
        let gate = gate?;

        // While the gate is held no other reader can enter, so the cohort check and the
        // counter bump must still happen in one critical section against releases.
        let entered = self.state.with(|s| {
            if s.cohort.is_some() {
                s.readers += 1;
                true
            } else {
                false
            }
        });
        if !entered {
            // First reader in: take the write exclusion on behalf of the cohort. Later
            // readers queue on the gate behind this await with their own contexts.
            match self.writers_lock.lock_owned(ctx).await {
                Ok(cohort) => self.state.with(|s| {
                    s.cohort = Some(cohort);
                    s.readers += 1;
                }),
                Err(err) => {
                    drop(gate);
                    return Err(err);
                }
            }
        }
        drop(gate);
        Ok(())
    }

    fn release_read(&self) {
        let cohort = self.state.with(|s| {
            s.readers -= 1;
            if s.readers == 0 {
                s.cohort.take()
            } else {
                None
            }
        });
        // Dropping outside the critical section hands the write exclusion back.
        drop(cohort);
    }

    async fn acquire_write(&self, ctx: &Context) -> Result<OwnedLockGuard, AcquireError> {
        self.state.with(|s| s.writers += 1);
        match self.writers_lock.lock_owned(ctx).await {
            Ok(hold) => Ok(hold),
            Err(err) => {
                self.state.with(|s| s.writers -= 1);
                Err(err)
            }
        }
    }

    fn release_write(&self, hold: OwnedLockGuard) {
        drop(hold);
        self.state.with(|s| s.writers -= 1);
    }
}

impl Default for RwLockReader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwLockReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLockReader")
            .field("reader_count", &self.reader_count())
            .field("writer_count", &self.writer_count())
            .finish()
    }
}

/// Shared read access to a [`RwLockReader`], released on drop.
#[must_use = "the read access is released immediately when the guard is dropped"]
#[derive(Debug)]
pub struct ReaderReadGuard<'a> {
    rw: &'a RwLockReader,
    released: bool,
}

impl ReaderReadGuard<'_> {
    /// Releases the read access.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ReaderReadGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.rw.release_read();
        }
    }
}

/// Exclusive write access to a [`RwLockReader`], released on drop.
#[must_use = "the write access is released immediately when the guard is dropped"]
#[derive(Debug)]
pub struct ReaderWriteGuard<'a> {
    rw: &'a RwLockReader,
    hold: Option<OwnedLockGuard>,
}

impl ReaderWriteGuard<'_> {
    /// Releases the write access.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ReaderWriteGuard<'_> {
    fn drop(&mut self) {
        if let Some(hold) = self.hold.take() {
            self.rw.release_write(hold);
        }
    }
}

/// An owned variant of [`ReaderReadGuard`].
#[must_use = "the read access is released immediately when the guard is dropped"]
#[derive(Debug)]
pub struct OwnedReaderReadGuard {
    rw: Arc<RwLockReader>,
    released: bool,
}

impl OwnedReaderReadGuard {
    /// Releases the read access.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for OwnedReaderReadGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.rw.release_read();
        }
    }
}

/// An owned variant of [`ReaderWriteGuard`].
#[must_use = "the write access is released immediately when the guard is dropped"]
#[derive(Debug)]
pub struct OwnedReaderWriteGuard {
    rw: Arc<RwLockReader>,
    hold: Option<OwnedLockGuard>,
}

impl OwnedReaderWriteGuard {
    /// Releases the write access.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for OwnedReaderWriteGuard {
    fn drop(&mut self) {
        if let Some(hold) = self.hold.take() {
            self.rw.release_write(hold);
        }
    }
}

/// Either access mode on a [`RwLockReader`], as returned by [`lock`].
///
/// [`lock`]: RwLockReader::lock
#[must_use = "the lock is released immediately when the guard is dropped"]
#[derive(Debug)]
pub enum ReaderGuard<'a> {
    /// Shared access.
    Read(ReaderReadGuard<'a>),
    /// Exclusive access.
    Write(ReaderWriteGuard<'a>),
}

impl ReaderGuard<'_> {
    /// The mode this guard holds.
    pub fn lock_type(&self) -> LockType {
        match self {
            ReaderGuard::Read(_) => LockType::Read,
            ReaderGuard::Write(_) => LockType::Write,
        }
    }

    /// Releases the lock.
    pub fn release(self) {
        drop(self);
    }
}

/// Either access mode on a [`RwLockReader`], as returned by [`lock_owned`].
///
/// [`lock_owned`]: RwLockReader::lock_owned
#[must_use = "the lock is released immediately when the guard is dropped"]
#[derive(Debug)]
pub enum OwnedReaderGuard {
    /// Shared access.
    Read(OwnedReaderReadGuard),
    /// Exclusive access.
    Write(OwnedReaderWriteGuard),
}

impl OwnedReaderGuard {
    /// The mode this guard holds.
    pub fn lock_type(&self) -> LockType {
        match self {
            OwnedReaderGuard::Read(_) => LockType::Read,
            OwnedReaderGuard::Write(_) => LockType::Write,
        }
    }

    /// Releases the lock.
    pub fn release(self) {
        drop(self);
    }
}
