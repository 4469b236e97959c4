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

//! A keyed box of lockables with sorted multi-key acquisition.
//!
//! A [`LockBox`] grows a lockable per string key on first use and removes it again once the
//! last holder or waiter is gone, so the map only ever contains live entries. Multi-key
//! requests are acquired in canonical key order (byte order, duplicates collapsed first-wins),
//! which makes inverse-order deadlock between overlapping request sets impossible: both
//! callers walk the same sequence.
//!
//! Any primitive implementing [`Lockable`] can live in a box: [`Lock`] (no per-call
//! parameters), [`RwLockReader`] and [`RwLockWriter`] (parameterised by [`LockType`]).
//!
//! # Examples
//!
//! ```
//! # #[tokio::main]
//! # async fn main() {
//! use waitlock::context::Context;
//! use waitlock::lock::Lock;
//! use waitlock::lockbox::LockBox;
//! use waitlock::lockbox::LockRequest;
//!
//! let boxed: LockBox<Lock> = LockBox::new();
//! let ctx = Context::new();
//!
//! let held = boxed
//!     .lock([LockRequest::from("b"), LockRequest::from("a")], &ctx)
//!     .await
//!     .unwrap();
//! // Acquired in canonical order regardless of request order.
//! assert_eq!(held.keys(), ["a", "b"]);
//! assert_eq!(boxed.len(), 2);
//! held.release();
//! // Entries vanish once nothing holds them.
//! assert_eq!(boxed.len(), 0);
//! # }
//! ```
//!
//! [`Lock`]: crate::lock::Lock
//! [`RwLockReader`]: crate::rwlock::RwLockReader
//! [`RwLockWriter`]: crate::rwlock::RwLockWriter
//! [`LockType`]: crate::rwlock::LockType

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use futures_util::future::try_join_all;
use futures_util::future::BoxFuture;
use futures_util::Stream;
use log::trace;

use crate::context::Context;
use crate::error::AcquireError;
use crate::internal;
use crate::lock::Lock;
use crate::lock::OwnedLockGuard;
use crate::rwlock::reader::OwnedReaderGuard;
use crate::rwlock::writer::OwnedWriterGuard;
use crate::rwlock::LockType;
use crate::rwlock::RwLockReader;
use crate::rwlock::RwLockWriter;
use crate::scoped::Guarded;

#[cfg(test)]
mod tests;

/// A primitive that can live in a [`LockBox`].
///
/// Entries are default-constructed per key on first use, acquired with per-call parameters,
/// and removed once [`count`] reports nothing inside and no task references them.
///
/// [`count`]: Lockable::count
pub trait Lockable: Default + Send + Sync + 'static {
    /// Per-call locking parameters (the acquisition mode of a reader-writer lock, nothing for
    /// a plain lock).
    type Params: Copy + Send + Sync + fmt::Debug + 'static;

    /// The owned guard released when the box entry is let go.
    type Guard: Send + 'static;

    /// Acquires with the given parameters under the given context.
    fn acquire(
        self: Arc<Self>,
        params: Self::Params,
        ctx: Context,
    ) -> BoxFuture<'static, Result<Self::Guard, AcquireError>>;

    /// Resolves when the lockable is observably unlocked.
    fn unlocked<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<(), AcquireError>>;

    /// Whether the lockable is held in the given mode, or in any mode when `params` is `None`.
    fn is_locked_for(&self, params: Option<Self::Params>) -> bool;

    /// Tasks inside: holders plus waiters.
    fn count(&self) -> usize;
}

impl Lockable for Lock {
    type Params = ();
    type Guard = OwnedLockGuard;

    fn acquire(
        self: Arc<Self>,
        _params: (),
        ctx: Context,
    ) -> BoxFuture<'static, Result<Self::Guard, AcquireError>> {
        Box::pin(async move { self.lock_owned(&ctx).await })
    }

    fn unlocked<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<(), AcquireError>> {
        Box::pin(self.wait_unlocked(ctx))
    }

    fn is_locked_for(&self, _params: Option<()>) -> bool {
        self.is_locked()
    }

    fn count(&self) -> usize {
        self.count()
    }
}

impl Lockable for RwLockReader {
    type Params = LockType;
    type Guard = OwnedReaderGuard;

    fn acquire(
        self: Arc<Self>,
        params: LockType,
        ctx: Context,
    ) -> BoxFuture<'static, Result<Self::Guard, AcquireError>> {
        Box::pin(async move { self.lock_owned(params, &ctx).await })
    }

    fn unlocked<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<(), AcquireError>> {
        Box::pin(self.wait_unlocked(ctx))
    }

    fn is_locked_for(&self, params: Option<LockType>) -> bool {
        self.is_locked(params)
    }

    fn count(&self) -> usize {
        self.count()
    }
}

impl Lockable for RwLockWriter {
    type Params = LockType;
    type Guard = OwnedWriterGuard;

    fn acquire(
        self: Arc<Self>,
        params: LockType,
        ctx: Context,
    ) -> BoxFuture<'static, Result<Self::Guard, AcquireError>> {
        Box::pin(async move { self.lock_owned(params, &ctx).await })
    }

    fn unlocked<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<(), AcquireError>> {
        Box::pin(self.wait_unlocked(ctx))
    }

    fn is_locked_for(&self, params: Option<LockType>) -> bool {
        self.is_locked(params)
    }

    fn count(&self) -> usize {
        self.count()
    }
}

/// One key of a multi-key acquisition.
pub struct LockRequest<L: Lockable> {
    /// The entry to lock.
    pub key: String,
    /// Parameters forwarded to the entry's own acquisition.
    pub params: L::Params,
}

impl<L: Lockable> LockRequest<L> {
    /// Creates a request for `key` with the given parameters.
    pub fn new(key: impl Into<String>, params: L::Params) -> Self {
        Self {
            key: key.into(),
            params,
        }
    }
}

impl<L: Lockable<Params = ()>> From<&str> for LockRequest<L> {
    fn from(key: &str) -> Self {
        Self::new(key, ())
    }
}

impl<L: Lockable<Params = ()>> From<String> for LockRequest<L> {
    fn from(key: String) -> Self {
        Self::new(key, ())
    }
}

impl<L: Lockable> From<(&str, L::Params)> for LockRequest<L> {
    fn from((key, params): (&str, L::Params)) -> Self {
        Self::new(key, params)
    }
}

impl<L: Lockable> From<(String, L::Params)> for LockRequest<L> {
    fn from((key, params): (String, L::Params)) -> Self {
        Self::new(key, params)
    }
}

impl<L: Lockable> fmt::Debug for LockRequest<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRequest")
            .field("key", &self.key)
            .field("params", &self.params)
            .finish()
    }
}

/// A keyed box of lockables. Cloning shares the box.
///
/// See the [module level documentation](self) for more.
pub struct LockBox<L: Lockable> {
    inner: Arc<BoxInner<L>>,
}

struct BoxInner<L: Lockable> {
    entries: internal::Mutex<HashMap<String, Arc<L>>>,
}

impl<L: Lockable> Clone for LockBox<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Lockable> Default for LockBox<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Lockable> LockBox<L> {
    /// Creates an empty box.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BoxInner {
                entries: internal::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Acquires every requested key in canonical order, all-or-nothing.
    ///
    /// Requests are sorted by key (byte order) and deduplicated first-wins before the walk.
    /// On any failure the keys acquired so far are released in reverse order, with the usual
    /// per-entry cleanup, and the error propagates. On success the returned guard releases in
    /// reverse order.
    pub async fn lock<I, R>(&self, requests: I, ctx: &Context) -> Result<LockBoxMultiGuard<L>, AcquireError>
    where
        I: IntoIterator<Item = R>,
        R: Into<LockRequest<L>>,
    {
        let acquires = self.lock_multi(requests, ctx);
        let mut guards = Vec::with_capacity(acquires.len());
        for acquire in acquires {
            match acquire.await {
                Ok(guard) => guards.push(guard),
                Err(err) => {
                    while let Some(guard) = guards.pop() {
                        guard.release();
                    }
                    return Err(err);
                }
            }
        }
        Ok(LockBoxMultiGuard { guards })
    }

    /// Returns one lazy acquire per requested key, in canonical order.
    ///
    /// The acquires are independently awaitable; each resolves to its own [`LockBoxGuard`].
    /// Per-entry bookkeeping (creation on first poll, cleanup on release, failure, or drop) is
    /// handled per acquire, but release ordering across keys is the caller's business.
    pub fn lock_multi<I, R>(&self, requests: I, ctx: &Context) -> Vec<LockBoxAcquire<L>>
    where
        I: IntoIterator<Item = R>,
        R: Into<LockRequest<L>>,
    {
        let mut requests: Vec<LockRequest<L>> = requests.into_iter().map(Into::into).collect();
        requests.sort_by(|a, b| a.key.cmp(&b.key));
        requests.dedup_by(|b, a| a.key == b.key);
        requests
            .into_iter()
            .map(|request| self.lock_key(request, ctx))
            .collect()
    }

    /// Returns a lazy acquire for one key.
    pub fn lock_key(&self, request: LockRequest<L>, ctx: &Context) -> LockBoxAcquire<L> {
        LockBoxAcquire {
            state: AcquireState::Init {
                lockbox: self.clone(),
                key: request.key,
                params: request.params,
                ctx: ctx.clone(),
            },
        }
    }

    /// Whether the given entry (or, with `None`, any entry) is locked.
    ///
    /// `params` narrows the check to one acquisition mode where the lockable distinguishes.
    pub fn is_locked(&self, key: Option<&str>, params: Option<L::Params>) -> bool {
        self.inner.entries.with(|entries| match key {
            Some(key) => entries
                .get(key)
                .map(|entry| entry.is_locked_for(params))
                .unwrap_or(false),
            None => entries.values().any(|entry| entry.is_locked_for(params)),
        })
    }

    /// Resolves when the given entry (or, with `None`, every entry) is observably unlocked.
    ///
    /// A missing key is already unlocked. The one context bounds the whole wait.
    pub async fn wait_unlocked(&self, key: Option<&str>, ctx: &Context) -> Result<(), AcquireError> {
        match key {
            Some(key) => {
                let entry = self.inner.entries.with(|entries| entries.get(key).cloned());
                match entry {
                    Some(entry) => entry.unlocked(ctx).await,
                    None => Ok(()),
                }
            }
            None => {
                let entries: Vec<Arc<L>> =
                    self.inner.entries.with(|entries| entries.values().cloned().collect());
                try_join_all(entries.iter().map(|entry| entry.unlocked(ctx))).await?;
                Ok(())
            }
        }
    }

    /// The sum of every entry's count: holders plus waiters across the whole box.
    pub fn count(&self) -> usize {
        self.inner
            .entries
            .with(|entries| entries.values().map(|entry| entry.count()).sum())
    }

    /// A snapshot of the live keys.
    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.with(|entries| entries.keys().cloned().collect())
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.inner.entries.with(|entries| entries.len())
    }

    /// Whether the box has no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` while holding every requested key, releasing on every exit path.
    pub async fn with<I, R, F, Fut, Out>(
        &self,
        requests: I,
        ctx: &Context,
        f: F,
    ) -> Result<Out, AcquireError>
    where
        I: IntoIterator<Item = R>,
        R: Into<LockRequest<L>>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Out>,
    {
        let guard = self.lock(requests, ctx).await?;
        let out = f().await;
        guard.release();
        Ok(out)
    }

    /// Wraps `stream` so that it holds every requested key for its whole life.
    pub async fn with_stream<I, R, S>(
        &self,
        requests: I,
        ctx: &Context,
        stream: S,
    ) -> Result<Guarded<S, LockBoxMultiGuard<L>>, AcquireError>
    where
        I: IntoIterator<Item = R>,
        R: Into<LockRequest<L>>,
        S: Stream,
    {
        let guard = self.lock(requests, ctx).await?;
        Ok(Guarded::new(guard, stream))
    }

    fn checkout(&self, key: &str) -> Arc<L> {
        self.inner.entries.with(|entries| {
            if let Some(entry) = entries.get(key) {
                Arc::clone(entry)
            } else {
                trace!("lockbox: creating entry for key {key:?}");
                let entry = Arc::new(L::default());
                entries.insert(key.to_string(), Arc::clone(&entry));
                entry
            }
        })
    }

    /// Removes the entry once nothing is inside it and no task still references it.
    fn evict_if_idle(&self, key: &str) {
        self.inner.entries.with(|entries| {
            let idle = entries
                .get(key)
                .map(|entry| entry.count() == 0 && Arc::strong_count(entry) == 1)
                .unwrap_or(false);
            if idle {
                entries.remove(key);
                trace!("lockbox: removed idle entry for key {key:?}");
            }
        });
    }
}

impl<L: Lockable> fmt::Debug for LockBox<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockBox")
            .field("len", &self.len())
            .field("count", &self.count())
            .finish()
    }
}

enum AcquireState<L: Lockable> {
    Init {
        lockbox: LockBox<L>,
        key: String,
        params: L::Params,
        ctx: Context,
    },
    Acquiring {
        lockbox: LockBox<L>,
        key: String,
        entry: Arc<L>,
        fut: BoxFuture<'static, Result<L::Guard, AcquireError>>,
    },
    Done,
}

/// A lazy single-key acquire, as handed out by [`lock_multi`] and [`lock_key`].
///
/// The entry is created (or joined) on first poll. Dropping the future mid-wait abandons the
/// underlying acquisition and cleans the entry up if that left it idle.
///
/// [`lock_multi`]: LockBox::lock_multi
/// [`lock_key`]: LockBox::lock_key
#[must_use = "futures do nothing unless awaited"]
pub struct LockBoxAcquire<L: Lockable> {
    state: AcquireState<L>,
}

impl<L: Lockable> LockBoxAcquire<L> {
    /// The key this acquire is for.
    pub fn key(&self) -> &str {
        match &self.state {
            AcquireState::Init { key, .. } => key,
            AcquireState::Acquiring { key, .. } => key,
            AcquireState::Done => "",
        }
    }
}

impl<L: Lockable> Future for LockBoxAcquire<L> {
    type Output = Result<LockBoxGuard<L>, AcquireError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        // Safety: `AcquireState` is never pinned structurally — every field is moved by
        // value between states (no self-referential pointers into `self`), so it is sound
        // to obtain an unpinned `&mut` here even when `L::Params` is not `Unpin`.
        let this = unsafe { self.get_unchecked_mut() };
        loop {
            match &mut this.state {
                AcquireState::Init { .. } => {
                    let state = std::mem::replace(&mut this.state, AcquireState::Done);
                    let AcquireState::Init {
                        lockbox,
                        key,
                        params,
                        ctx,
                    } = state
                    else {
                        unreachable!("state checked above");
                    };
                    let entry = lockbox.checkout(&key);
                    let fut = Arc::clone(&entry).acquire(params, ctx);
                    this.state = AcquireState::Acquiring {
                        lockbox,
                        key,
                        entry,
                        fut,
                    };
                }
                AcquireState::Acquiring { fut, .. } => {
                    let ready = match fut.as_mut().poll(cx) {
                        Poll::Ready(ready) => ready,
                        Poll::Pending => return Poll::Pending,
                    };
                    let state = std::mem::replace(&mut this.state, AcquireState::Done);
                    let AcquireState::Acquiring {
                        lockbox,
                        key,
                        entry,
                        fut,
                    } = state
                    else {
                        unreachable!("state checked above");
                    };
                    drop(fut);
                    drop(entry);
                    return match ready {
                        Ok(guard) => Poll::Ready(Ok(LockBoxGuard {
                            lockbox,
                            key,
                            guard: Some(guard),
                        })),
                        Err(err) => {
                            lockbox.evict_if_idle(&key);
                            Poll::Ready(Err(err))
                        }
                    };
                }
                AcquireState::Done => panic!("LockBoxAcquire polled after completion"),
            }
        }
    }
}

impl<L: Lockable> Drop for LockBoxAcquire<L> {
    fn drop(&mut self) {
        if let AcquireState::Acquiring {
            lockbox,
            key,
            entry,
            fut,
        } = std::mem::replace(&mut self.state, AcquireState::Done)
        {
            // Dropping the future first abandons the pending acquisition, so the idle check
            // sees the entry without this waiter.
            drop(fut);
            drop(entry);
            lockbox.evict_if_idle(&key);
        }
    }
}

/// Holds one box entry until released or dropped.
///
/// Releasing runs the per-entry cleanup: the entry is removed from the box if this was the
/// last task inside it.
#[must_use = "the entry is released immediately when the guard is dropped"]
pub struct LockBoxGuard<L: Lockable> {
    lockbox: LockBox<L>,
    key: String,
    guard: Option<L::Guard>,
}

impl<L: Lockable> LockBoxGuard<L> {
    /// The key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the entry.
    pub fn release(self) {
        drop(self);
    }
}

impl<L: Lockable> Drop for LockBoxGuard<L> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
            self.lockbox.evict_if_idle(&self.key);
        }
    }
}

impl<L: Lockable> fmt::Debug for LockBoxGuard<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockBoxGuard").field("key", &self.key).finish()
    }
}

/// Holds a whole multi-key acquisition, releasing in reverse key order.
///
/// This type is created by [`lock`] on [`LockBox`].
///
/// [`lock`]: LockBox::lock
#[must_use = "the entries are released immediately when the guard is dropped"]
pub struct LockBoxMultiGuard<L: Lockable> {
    guards: Vec<LockBoxGuard<L>>,
}

impl<L: Lockable> LockBoxMultiGuard<L> {
    /// The held keys, in acquisition order.
    pub fn keys(&self) -> Vec<&str> {
        self.guards.iter().map(|guard| guard.key()).collect()
    }

    /// The number of held keys.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// Whether the acquisition covered no keys at all.
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Releases every entry, last acquired first.
    pub fn release(self) {
        drop(self);
    }
}

impl<L: Lockable> Drop for LockBoxMultiGuard<L> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

impl<L: Lockable> fmt::Debug for LockBoxMultiGuard<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockBoxMultiGuard")
            .field("keys", &self.keys())
            .finish()
    }
}
