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

//! The write-preferring reader-writer lock.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::try_join;
use futures_util::Stream;

use crate::context::Context;
use crate::error::AcquireError;
use crate::internal;
use crate::internal::Event;
use crate::lock::Lock;
use crate::lock::OwnedLockGuard;
use crate::rwlock::LockType;
use crate::scoped::Guarded;

/// A write-preferring reader-writer lock.
///
/// Any admitted or queued writer blocks new readers until the writer sequence is done, so
/// writers cannot starve. A writer takes the write exclusion and then the reader gate; the
/// first reader of a cohort takes the reader gate on behalf of all concurrent readers and the
/// last one out hands it back.
///
/// See the [module level documentation](super) for more.
pub struct RwLockWriter {
    /// Held by the reader cohort while any reader is in; writers take it after the exclusion
    /// so late readers cannot slip past an admitted writer.
    readers_lock: Arc<Lock>,
    /// The write exclusion writers hold, and new readers watch, while writers are around.
    writers_lock: Arc<Lock>,
    state: internal::Mutex<WriterState>,
}

struct WriterState {
    /// Admitted readers (including those waiting on the cohort hand-off).
    readers: usize,
    /// Readers blocked behind a writer.
    readers_blocked: usize,
    /// Admitted plus queued writers.
    writers: usize,
    cohort: Cohort,
}

/// The reader cohort's claim on the reader gate.
enum Cohort {
    /// No reader is in.
    Idle,
    /// One reader is acquiring the gate for the cohort; the rest await the event.
    ///
    /// Errors of the in-flight acquisition are swallowed by the waiters: each re-checks the
    /// state once the event settles and retries the acquisition itself with its own context
    /// if the gate is still unclaimed. A waiter's own context still bounds its wait on the
    /// hand-off.
    Acquiring(Arc<Event>),
    /// The gate is held on behalf of every admitted reader.
    Held(OwnedLockGuard),
}

enum ReadEntry {
    Done,
    Acquire(Arc<Event>),
    Wait(Arc<Event>),
}

impl RwLockWriter {
    /// Creates a new, unlocked lock.
    pub fn new() -> Self {
        Self {
            readers_lock: Arc::new(Lock::new()),
            writers_lock: Arc::new(Lock::new()),
            state: internal::Mutex::new(WriterState {
                readers: 0,
                readers_blocked: 0,
                writers: 0,
                cohort: Cohort::Idle,
            }),
        }
    }

    /// Acquires shared read access.
    ///
    /// Blocks while any writer is admitted or queued, resuming once the write exclusion is
    /// observably unlocked.
    pub async fn read(&self, ctx: &Context) -> Result<WriterReadGuard<'_>, AcquireError> {
        self.acquire_read(ctx).await?;
        Ok(WriterReadGuard {
            rw: self,
            released: false,
        })
    }

    /// Like [`read`], but the guard owns a reference to the lock.
    ///
    /// [`read`]: RwLockWriter::read
    pub async fn read_owned(
        self: &Arc<Self>,
        ctx: &Context,
    ) -> Result<OwnedWriterReadGuard, AcquireError> {
        self.acquire_read(ctx).await?;
        Ok(OwnedWriterReadGuard {
            rw: Arc::clone(self),
            released: false,
        })
    }

    /// Acquires exclusive write access.
    ///
    /// Once this is queued, new readers block until the writer sequence is done.
    pub async fn write(&self, ctx: &Context) -> Result<WriterWriteGuard<'_>, AcquireError> {
        let (exclusion, gate) = self.acquire_write(ctx).await?;
        Ok(WriterWriteGuard {
            rw: self,
            gate: Some(gate),
            exclusion: Some(exclusion),
        })
    }

    /// Like [`write`], but the guard owns a reference to the lock.
    ///
    /// [`write`]: RwLockWriter::write
    pub async fn write_owned(
        self: &Arc<Self>,
        ctx: &Context,
    ) -> Result<OwnedWriterWriteGuard, AcquireError> {
        let (exclusion, gate) = self.acquire_write(ctx).await?;
        Ok(OwnedWriterWriteGuard {
            rw: Arc::clone(self),
            gate: Some(gate),
            exclusion: Some(exclusion),
        })
    }

    /// Acquires the lock in the given mode.
    pub async fn lock(&self, ty: LockType, ctx: &Context) -> Result<WriterGuard<'_>, AcquireError> {
        match ty {
            LockType::Read => Ok(WriterGuard::Read(self.read(ctx).await?)),
            LockType::Write => Ok(WriterGuard::Write(self.write(ctx).await?)),
        }
    }

    /// Like [`lock`], but the guard owns a reference to the lock.
    ///
    /// [`lock`]: RwLockWriter::lock
    pub async fn lock_owned(
        self: &Arc<Self>,
        ty: LockType,
        ctx: &Context,
    ) -> Result<OwnedWriterGuard, AcquireError> {
        match ty {
            LockType::Read => Ok(OwnedWriterGuard::Read(self.read_owned(ctx).await?)),
            LockType::Write => Ok(OwnedWriterGuard::Write(self.write_owned(ctx).await?)),
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
                self.state.with(|s| s.writers == 0) && self.readers_lock.is_locked()
            }
            Some(LockType::Write) => {
                self.state.with(|s| s.writers > 0) && self.writers_lock.is_locked()
            }
        }
    }

    /// Admitted readers plus readers blocked behind a writer.
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
    ) -> Result<Guarded<S, WriterGuard<'_>>, AcquireError>
    where
        S: Stream,
    {
        let guard = self.lock(ty, ctx).await?;
        Ok(Guarded::new(guard, stream))
    }

    async fn acquire_read(&self, ctx: &Context) -> Result<(), AcquireError> {
        // Writers go first: block until no writer is admitted or queued.
        loop {
            if self.state.with(|s| s.writers) == 0 {
                break;
            }
            self.state.with(|s| s.readers_blocked += 1);
            let waited = self.writers_lock.wait_unlocked(ctx).await;
            self.state.with(|s| s.readers_blocked -= 1);
            waited?;
        }
        self.state.with(|s| s.readers += 1);
        loop {
            let entry = self.state.with(|s| match &s.cohort {
                Cohort::Held(_) => ReadEntry::Done,
                Cohort::Idle => {
                    let event = Arc::new(Event::new());
                    s.cohort = Cohort::Acquiring(Arc::clone(&event));
                    ReadEntry::Acquire(event)
                }
                Cohort::Acquiring(event) => ReadEntry::Wait(Arc::clone(event)),
            });
            match entry {
                ReadEntry::Done => return Ok(()),
                ReadEntry::Acquire(event) => {
                    let result = self.readers_lock.lock_owned(ctx).await;
                    let out = match result {
                        Ok(gate) => {
                            self.state.with(|s| s.cohort = Cohort::Held(gate));
                            Ok(())
                        }
                        Err(err) => {
                            self.state.with(|s| {
                                s.readers -= 1;
                                s.cohort = Cohort::Idle;
                            });
                            Err(err)
                        }
                    };
                    event.set();
                    return out;
                }
                ReadEntry::Wait(event) => {
                    // The cohort acquisition is in flight; its errors are not ours to fail
                    // on, but this reader's own context still bounds the wait. Re-check the
                    // state once the hand-off settles.
                    if let Err(err) = ctx.run(event.wait()).await {
                        self.state.with(|s| s.readers -= 1);
                        return Err(err);
                    }
                }
            }
        }
    }

    fn release_read(&self) {
        let cohort = self.state.with(|s| {
            s.readers -= 1;
            if s.readers == 0 {
                match std::mem::replace(&mut s.cohort, Cohort::Idle) {
                    Cohort::Held(gate) => Some(gate),
                    other => {
                        s.cohort = other;
                        None
                    }
                }
            } else {
                None
            }
        });
        drop(cohort);
    }

    async fn acquire_write(
        &self,
        ctx: &Context,
    ) -> Result<(OwnedLockGuard, OwnedLockGuard), AcquireError> {
        self.state.with(|s| s.writers += 1);
        let exclusion = match self.writers_lock.lock_owned(ctx).await {
            Ok(hold) => hold,
            Err(err) => {
                self.state.with(|s| s.writers -= 1);
                return Err(err);
            }
        };
        // Holding the exclusion keeps new readers out; taking the gate waits out the ones
        // already admitted.
        match self.readers_lock.lock_owned(ctx).await {
            Ok(gate) => Ok((exclusion, gate)),
            Err(err) => {
                drop(exclusion);
                self.state.with(|s| s.writers -= 1);
                Err(err)
            }
        }
    }

    fn release_write(&self, gate: Option<OwnedLockGuard>, exclusion: Option<OwnedLockGuard>) {
        drop(gate);
        drop(exclusion);
        self.state.with(|s| s.writers -= 1);
    }
}

impl Default for RwLockWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwLockWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLockWriter")
            .field("reader_count", &self.reader_count())
            .field("writer_count", &self.writer_count())
            .finish()
    }
}

/// Shared read access to a [`RwLockWriter`], released on drop.
#[must_use = "the read access is released immediately when the guard is dropped"]
#[derive(Debug)]
pub struct WriterReadGuard<'a> {
    rw: &'a RwLockWriter,
    released: bool,
}

impl WriterReadGuard<'_> {
    /// Releases the read access.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for WriterReadGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.rw.release_read();
        }
    }
}

/// Exclusive write access to a [`RwLockWriter`], released on drop.
#[must_use = "the write access is released immediately when the guard is dropped"]
#[derive(Debug)]
pub struct WriterWriteGuard<'a> {
    rw: &'a RwLockWriter,
    gate: Option<OwnedLockGuard>,
    exclusion: Option<OwnedLockGuard>,
}

impl WriterWriteGuard<'_> {
    /// Releases the write access.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for WriterWriteGuard<'_> {
    fn drop(&mut self) {
        if self.gate.is_some() || self.exclusion.is_some() {
            self.rw.release_write(self.gate.take(), self.exclusion.take());
        }
    }
}

/// An owned variant of [`WriterReadGuard`].
#[must_use = "the read access is released immediately when the guard is dropped"]
#[derive(Debug)]
pub struct OwnedWriterReadGuard {
    rw: Arc<RwLockWriter>,
    released: bool,
}

impl OwnedWriterReadGuard {
    /// Releases the read access.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for OwnedWriterReadGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.rw.release_read();
        }
    }
}

/// An owned variant of [`WriterWriteGuard`].
#[must_use = "the write access is released immediately when the guard is dropped"]
#[derive(Debug)]
pub struct OwnedWriterWriteGuard {
    rw: Arc<RwLockWriter>,
    gate: Option<OwnedLockGuard>,
    exclusion: Option<OwnedLockGuard>,
}

impl OwnedWriterWriteGuard {
    /// Releases the write access.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for OwnedWriterWriteGuard {
    fn drop(&mut self) {
        if self.gate.is_some() || self.exclusion.is_some() {
            self.rw.release_write(self.gate.take(), self.exclusion.take());
        }
    }
}

/// Either access mode on a [`RwLockWriter`], as returned by [`lock`].
///
/// [`lock`]: RwLockWriter::lock
#[must_use = "the lock is released immediately when the guard is dropped"]
#[derive(Debug)]
pub enum WriterGuard<'a> {
    /// Shared access.
    Read(WriterReadGuard<'a>),
    /// Exclusive access.
    Write(WriterWriteGuard<'a>),
}

impl WriterGuard<'_> {
    /// The mode this guard holds.
    pub fn lock_type(&self) -> LockType {
        match self {
            WriterGuard::Read(_) => LockType::Read,
            WriterGuard::Write(_) => LockType::Write,
        }
    }

    /// Releases the lock.
    pub fn release(self) {
        drop(self);
    }
}

/// Either access mode on a [`RwLockWriter`], as returned by [`lock_owned`].
///
/// [`lock_owned`]: RwLockWriter::lock_owned
#[must_use = "the lock is released immediately when the guard is dropped"]
#[derive(Debug)]
pub enum OwnedWriterGuard {
    /// Shared access.
    Read(OwnedWriterReadGuard),
    /// Exclusive access.
    Write(OwnedWriterWriteGuard),
}

impl OwnedWriterGuard {
    /// The mode this guard holds.
    pub fn lock_type(&self) -> LockType {
        match self {
            OwnedWriterGuard::Read(_) => LockType::Read,
            OwnedWriterGuard::Write(_) => LockType::Write,
        }
    }

    /// Releases the lock.
    pub fn release(self) {
        drop(self);
    }
}
