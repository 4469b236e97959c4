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

//! A weighted, ordered, async semaphore with cancellable waits.
//!
//! A semaphore admits callers as long as the sum of their weights stays within its limit. Each
//! [`lock`] call names a weight and blocks until that weight fits; the returned guard gives the
//! weight back when released or dropped. Every wait takes a [`Context`] and aborts on its
//! deadline or signal.
//!
//! The wait queue runs in one of two disciplines, chosen at construction:
//!
//! - **Unprioritised** (the default): strict FIFO. A waiter whose weight does not currently fit
//!   blocks everyone behind it, even waiters that would fit. No task can starve.
//! - **Prioritised**: the queue stays sorted so the smallest weight is admitted first. Light
//!   tasks slip past a heavy blocked one, which raises concurrency but lets the heavy task
//!   starve under a steady stream of light ones. This is an explicit trade.
//!
//! Every other lock in this crate is layered on this type.
//!
//! # Examples
//!
//! ```
//! # #[tokio::main]
//! # async fn main() {
//! use waitlock::context::Context;
//! use waitlock::semaphore::Semaphore;
//!
//! let semaphore = Semaphore::new(3);
//! let ctx = Context::new();
//!
//! let one = semaphore.lock(1, &ctx).await.unwrap();
//! let two = semaphore.lock(2, &ctx).await.unwrap();
//! assert_eq!(semaphore.current_weight(), 3);
//! assert!(semaphore.try_lock(1).is_none());
//!
//! one.release();
//! assert_eq!(semaphore.current_weight(), 2);
//! two.release();
//! assert!(!semaphore.is_locked());
//! # }
//! ```
//!
//! [`lock`]: Semaphore::lock
//! [`Context`]: crate::context::Context

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::task::Waker;

use futures_util::Stream;

use crate::context::Context;
use crate::error::AcquireError;
use crate::internal;
use crate::scoped::Guarded;


/// A weighted, ordered, async semaphore.
///
/// See the [module level documentation](self) for more.
pub struct Semaphore {
    limit: usize,
    priority: bool,
    state: internal::Mutex<SemState>,
}

struct SemState {
    /// Sum of the weights of currently admitted holders.
    current_weight: usize,
    /// Tasks currently inside: admitted plus queued.
    count: usize,
    /// Pending waiters. Insertion at the front (FIFO) or sorted with the smallest weight
    /// nearest the back (prioritised); admission always pops from the back.
    queue: VecDeque<Arc<Waiter>>,
}

struct Waiter {
    weight: usize,
    state: internal::Mutex<WaiterState>,
}

#[derive(Default)]
struct WaiterState {
    admitted: bool,
    aborted: bool,
    waker: Option<Waker>,
}

enum Sweep {
    Admit,
    Skip,
    Blocked,
}

impl SemState {
    fn enqueue(&mut self, priority: bool, waiter: Arc<Waiter>) {
        if priority {
            // Weights descend from front to back; equal weights keep arrival order by
            // inserting ahead of their peers.
            let weight = waiter.weight;
            match self.queue.iter().position(|w| w.weight <= weight) {
                Some(at) => self.queue.insert(at, waiter),
                None => self.queue.push_back(waiter),
            }
        } else {
            self.queue.push_front(waiter);
        }
    }

    /// Admits from the back of the queue while the next waiter fits, lazily discarding
    /// aborted entries. Runs on every enqueue, release, and abort.
    fn sweep(&mut self, limit: usize) {
        while let Some(next) = self.queue.back() {
            let weight = next.weight;
            let current = self.current_weight;
            let disposition = next.state.with(|ws| {
                if ws.aborted {
                    Sweep::Skip
                } else if current + weight <= limit {
                    ws.admitted = true;
                    if let Some(waker) = ws.waker.take() {
                        waker.wake();
                    }
                    Sweep::Admit
                } else {
                    Sweep::Blocked
                }
            });
            match disposition {
                Sweep::Admit => {
                    self.current_weight += weight;
                    self.queue.pop_back();
                }
                Sweep::Skip => {
                    self.queue.pop_back();
                }
                Sweep::Blocked => break,
            }
        }
    }
}

impl Semaphore {
    /// Creates a semaphore with the given weight limit and a FIFO queue.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is zero.
    pub fn new(limit: usize) -> Self {
        Self::with_queue(limit, false)
    }

    /// Creates a semaphore whose queue admits smaller weights first.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is zero.
    pub fn with_priority(limit: usize) -> Self {
        Self::with_queue(limit, true)
    }

    fn with_queue(limit: usize, priority: bool) -> Self {
        assert!(limit >= 1, "semaphore limit must be at least 1");
        Self {
            limit,
            priority,
            state: internal::Mutex::new(SemState {
                current_weight: 0,
                count: 0,
                queue: VecDeque::new(),
            }),
        }
    }

    /// The immutable weight limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether the queue admits smaller weights first.
    pub fn priority(&self) -> bool {
        self.priority
    }

    /// The number of tasks currently inside: admitted holders plus queued waiters.
    ///
    /// Incremented synchronously when an acquisition starts, decremented on release or abort.
    pub fn count(&self) -> usize {
        self.state.with(|s| s.count)
    }

    /// The sum of the weights of currently admitted holders.
    pub fn current_weight(&self) -> usize {
        self.state.with(|s| s.current_weight)
    }

    /// Whether any task is inside (admitted or queued).
    pub fn is_locked(&self) -> bool {
        self.count() > 0
    }

    /// Acquires `weight` units, waiting until they fit under the queue discipline.
    ///
    /// The returned future is lazy: nothing happens until it is first polled, at which point
    /// the caller is counted (observable through [`count`] and [`is_locked`]) and queued.
    /// Dropping the future before it resolves abandons the wait and restores the count; an
    /// already-fired context signal rejects on that first poll without queueing.
    ///
    /// # Panics
    ///
    /// Panics if `weight` is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// # #[tokio::main]
    /// # async fn main() {
    /// use waitlock::context::Context;
    /// use waitlock::semaphore::Semaphore;
    ///
    /// let semaphore = Semaphore::new(2);
    /// let guard = semaphore.lock(2, &Context::new()).await.unwrap();
    /// assert!(semaphore.is_locked());
    /// guard.release();
    /// # }
    /// ```
    ///
    /// [`count`]: Semaphore::count
    /// [`is_locked`]: Semaphore::is_locked
    pub async fn lock(
        &self,
        weight: usize,
        ctx: &Context,
    ) -> Result<SemaphoreGuard<'_>, AcquireError> {
        self.acquire(weight, ctx).await?;
        Ok(SemaphoreGuard {
            sem: self,
            weight,
            released: false,
        })
    }

    /// Like [`lock`], but the guard owns a reference to the semaphore.
    ///
    /// The semaphore must be wrapped in an [`Arc`] to call this method.
    ///
    /// # Panics
    ///
    /// Panics if `weight` is zero.
    ///
    /// [`lock`]: Semaphore::lock
    pub async fn lock_owned(
        self: &Arc<Self>,
        weight: usize,
        ctx: &Context,
    ) -> Result<OwnedSemaphoreGuard, AcquireError> {
        self.acquire(weight, ctx).await?;
        Ok(OwnedSemaphoreGuard {
            sem: Arc::clone(self),
            weight,
            released: false,
        })
    }

    /// Attempts to acquire `weight` units without waiting.
    ///
    /// Fails if the weight does not currently fit or if any live waiter is queued; this method
    /// never jumps the queue.
    ///
    /// # Panics
    ///
    /// Panics if `weight` is zero.
    pub fn try_lock(&self, weight: usize) -> Option<SemaphoreGuard<'_>> {
        assert!(weight >= 1, "lock weight must be at least 1");
        self.try_acquire_raw(weight).then(|| SemaphoreGuard {
            sem: self,
            weight,
            released: false,
        })
    }

    /// Like [`try_lock`], but the guard owns a reference to the semaphore.
    ///
    /// # Panics
    ///
    /// Panics if `weight` is zero.
    ///
    /// [`try_lock`]: Semaphore::try_lock
    pub fn try_lock_owned(self: &Arc<Self>, weight: usize) -> Option<OwnedSemaphoreGuard> {
        assert!(weight >= 1, "lock weight must be at least 1");
        self.try_acquire_raw(weight).then(|| OwnedSemaphoreGuard {
            sem: Arc::clone(self),
            weight,
            released: false,
        })
    }

    /// Resolves when a hypothetical acquisition of `weight` would be admitted.
    ///
    /// The wait takes a place in the queue under the normal discipline and gives it up the
    /// moment it is reached, so nothing is held when this returns.
    ///
    /// # Panics
    ///
    /// Panics if `weight` is zero.
    pub async fn wait_unlocked(&self, weight: usize, ctx: &Context) -> Result<(), AcquireError> {
        self.acquire(weight, ctx).await?;
        self.release_raw(weight);
        Ok(())
    }

    /// Runs `f` while holding `weight` units, releasing on every exit path.
    ///
    /// # Panics
    ///
    /// Panics if `weight` is zero.
    pub async fn with<F, Fut, R>(
        &self,
        weight: usize,
        ctx: &Context,
        f: F,
    ) -> Result<R, AcquireError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let guard = self.lock(weight, ctx).await?;
        let out = f().await;
        guard.release();
        Ok(out)
    }

    /// Wraps `stream` so that it holds `weight` units for its whole life.
    ///
    /// The units are released when the returned stream is dropped or runs out.
    ///
    /// # Panics
    ///
    /// Panics if `weight` is zero.
    pub async fn with_stream<S>(
        &self,
        weight: usize,
        ctx: &Context,
        stream: S,
    ) -> Result<Guarded<S, SemaphoreGuard<'_>>, AcquireError>
    where
        S: Stream,
    {
        let guard = self.lock(weight, ctx).await?;
        Ok(Guarded::new(guard, stream))
    }

    pub(crate) async fn acquire(&self, weight: usize, ctx: &Context) -> Result<(), AcquireError> {
        assert!(weight >= 1, "lock weight must be at least 1");
        // Everything up to the admission await is synchronous: the caller is counted before
        // the fired-signal fast path so an immediate rejection still leaves the counters as a
        // completed enter/leave pair.
        self.state.with(|s| s.count += 1);
        if let Some(reason) = ctx.fired_reason() {
            self.state.with(|s| s.count -= 1);
            return Err(AcquireError::Cancelled(reason));
        }
        let waiter = Arc::new(Waiter {
            weight,
            state: internal::Mutex::new(WaiterState::default()),
        });
        self.state.with(|s| {
            s.enqueue(self.priority, Arc::clone(&waiter));
            s.sweep(self.limit);
        });
        let admission = Admission {
            sem: self,
            waiter,
            done: false,
        };
        ctx.run(admission).await?
    }

    pub(crate) fn try_acquire_raw(&self, weight: usize) -> bool {
        self.state.with(|s| {
            let queued = s.queue.iter().any(|w| !w.state.with(|ws| ws.aborted));
            if !queued && s.current_weight + weight <= self.limit {
                s.count += 1;
                s.current_weight += weight;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn release_raw(&self, weight: usize) {
        self.state.with(|s| {
            s.count -= 1;
            s.current_weight -= weight;
            s.sweep(self.limit);
        });
    }

    /// Abandons a wait that never got admitted: uncount it, leave the queue entry to be
    /// lazily skipped, and re-run admission in case it was blocking the head.
    fn abort_raw(&self) {
        self.state.with(|s| {
            s.count -= 1;
            s.sweep(self.limit);
        });
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("limit", &self.limit)
            .field("priority", &self.priority)
            .field("count", &self.count())
            .field("current_weight", &self.current_weight())
            .finish()
    }
}

/// Resolves once the waiter is admitted. Dropping it before consumption aborts the wait, or
/// releases the admission if it raced in between the final poll and the drop.
struct Admission<'a> {
    sem: &'a Semaphore,
    waiter: Arc<Waiter>,
    done: bool,
}

impl Future for Admission<'_> {
    type Output = Result<(), AcquireError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let admitted = this.waiter.state.with(|ws| {
            if ws.admitted {
                true
            } else {
                match &mut ws.waker {
                    Some(w) if w.will_wake(cx.waker()) => {}
                    slot => *slot = Some(cx.waker().clone()),
                }
                false
            }
        });
        if admitted {
            this.done = true;
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let admitted = self.waiter.state.with(|ws| {
            if ws.admitted {
                true
            } else {
                ws.aborted = true;
                ws.waker = None;
                false
            }
        });
        if admitted {
            // Admitted between the last poll and the drop; undo as a release would.
            self.sem.release_raw(self.waiter.weight);
        } else {
            self.sem.abort_raw();
        }
    }
}

/// Holds acquired weight until released or dropped.
///
/// This type is created by [`lock`] and [`try_lock`] on [`Semaphore`]. Releasing is single-shot:
/// [`release`] consumes the guard and dropping an already-released guard does nothing further.
///
/// [`lock`]: Semaphore::lock
/// [`try_lock`]: Semaphore::try_lock
/// [`release`]: SemaphoreGuard::release
#[must_use = "the weight is given back immediately when the guard is dropped"]
#[derive(Debug)]
pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
    weight: usize,
    released: bool,
}

impl SemaphoreGuard<'_> {
    /// Gives the held weight back to the semaphore.
    pub fn release(self) {
        drop(self);
    }

    /// The weight this guard holds.
    pub fn weight(&self) -> usize {
        self.weight
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.sem.release_raw(self.weight);
        }
    }
}

/// An owned variant of [`SemaphoreGuard`], created by [`lock_owned`] and [`try_lock_owned`].
///
/// [`lock_owned`]: Semaphore::lock_owned
/// [`try_lock_owned`]: Semaphore::try_lock_owned
#[must_use = "the weight is given back immediately when the guard is dropped"]
#[derive(Debug)]
pub struct OwnedSemaphoreGuard {
    sem: Arc<Semaphore>,
    weight: usize,
    released: bool,
}

impl OwnedSemaphoreGuard {
    /// Gives the held weight back to the semaphore.
    pub fn release(self) {
        drop(self);
    }

    /// The weight this guard holds.
    pub fn weight(&self) -> usize {
        self.weight
    }
}

impl Drop for OwnedSemaphoreGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.sem.release_raw(self.weight);
        }
    }
}
