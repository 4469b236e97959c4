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

//! The timed-cancel context threaded through every blocking operation.
//!
//! A [`Context`] pairs an optional deadline with an optional external cancellation [`Signal`].
//! Every acquisition in this crate accepts a `&Context` and aborts its wait as soon as either
//! fires: the deadline yields [`AcquireError::Timeout`], the signal yields
//! [`AcquireError::Cancelled`] carrying the signal's reason verbatim. Compound operations
//! (reader-writer locks, [`LockBox`], [`Monitor`]) propagate the same context into whatever
//! primitive they are currently waiting on.
//!
//! A default context waits forever and cannot be cancelled.
//!
//! # Examples
//!
//! ```
//! # #[tokio::main]
//! # async fn main() {
//! use std::time::Duration;
//!
//! use waitlock::context::Context;
//! use waitlock::context::Signal;
//! use waitlock::error::AcquireError;
//! use waitlock::lock::Lock;
//!
//! let lock = Lock::new();
//! let held = lock.lock(&Context::new()).await.unwrap();
//!
//! // A deadline bounds the wait.
//! let ctx = Context::new().with_timeout(Duration::from_millis(10));
//! assert_eq!(lock.lock(&ctx).await.unwrap_err(), AcquireError::Timeout);
//!
//! // A signal aborts it from outside.
//! let signal = Signal::new();
//! let ctx = Context::new().with_signal(signal.clone());
//! signal.fire("shutting down");
//! let err = lock.lock(&ctx).await.unwrap_err();
//! assert_eq!(err, AcquireError::Cancelled("shutting down".to_string()));
//!
//! held.release();
//! # }
//! ```
//!
//! [`LockBox`]: crate::lockbox::LockBox
//! [`Monitor`]: crate::monitor::Monitor
//! [`AcquireError::Timeout`]: crate::error::AcquireError::Timeout
//! [`AcquireError::Cancelled`]: crate::error::AcquireError::Cancelled

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::task::Waker;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AcquireError;
use crate::internal;


/// A cloneable one-shot cancellation signal.
///
/// All clones share one core: the first [`fire`] wins, stores the reason, and wakes every
/// waiter; later calls are no-ops. A fired signal stays fired.
///
/// [`fire`]: Signal::fire
#[derive(Clone, Debug, Default)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    state: internal::Mutex<SignalState>,
}

#[derive(Debug, Default)]
struct SignalState {
    reason: Option<String>,
    wakers: Vec<Waker>,
}

impl Signal {
    /// Creates a new, unfired signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal with the given reason, aborting every wait attached to it.
    ///
    /// Only the first call has any effect.
    pub fn fire(&self, reason: impl Into<String>) {
        let wakers = self.inner.state.with(|s| {
            if s.reason.is_some() {
                return Vec::new();
            }
            s.reason = Some(reason.into());
            std::mem::take(&mut s.wakers)
        });
        for waker in wakers {
            waker.wake();
        }
    }

    /// Returns whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        self.inner.state.with(|s| s.reason.is_some())
    }

    /// Returns the reason the signal fired with, if it has.
    pub fn reason(&self) -> Option<String> {
        self.inner.state.with(|s| s.reason.clone())
    }

    /// Resolves with the reason once the signal fires.
    pub fn fired(&self) -> Fired<'_> {
        Fired { signal: self }
    }
}

/// Future returned by [`Signal::fired`].
#[must_use = "futures do nothing unless awaited"]
pub struct Fired<'a> {
    signal: &'a Signal,
}

impl Future for Fired<'_> {
    type Output = String;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.signal.inner.state.with(|s| match &s.reason {
            Some(reason) => Poll::Ready(reason.clone()),
            None => {
                if !s.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    s.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        })
    }
}

/// Deadline and cancellation for a blocking call.
///
/// See the [module level documentation](self) for more.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    signal: Option<Signal>,
}

impl Context {
    /// Creates a context that waits forever and cannot be cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds every wait under this context to `timeout` from now.
    ///
    /// The deadline is absolute: a context reused across several operations shares one
    /// deadline, it does not restart the clock per call.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Bounds every wait under this context to the given instant.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attaches an external cancellation signal.
    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Returns the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the attached signal, if any.
    pub fn signal(&self) -> Option<&Signal> {
        self.signal.as_ref()
    }

    /// Synchronous fast path: the reason of an already-fired signal.
    pub(crate) fn fired_reason(&self) -> Option<String> {
        self.signal.as_ref().and_then(|s| s.reason())
    }

    /// Races `fut` against the deadline and the signal.
    ///
    /// Admission-first bias: whenever `fut` is ready it wins, so a wait that succeeds in the
    /// same wake-up as a firing timer or signal is a success, never a late cancellation. The
    /// losing `fut` is dropped, which is the abort path of the pending acquisition.
    pub(crate) async fn run<T>(&self, fut: impl Future<Output = T>) -> Result<T, AcquireError> {
        tokio::pin!(fut);
        match (self.deadline, self.signal.clone()) {
            (None, None) => Ok(fut.await),
            (Some(deadline), None) => {
                tokio::select! {
                    biased;
                    out = &mut fut => Ok(out),
                    _ = tokio::time::sleep_until(deadline) => Err(AcquireError::Timeout),
                }
            }
            (None, Some(signal)) => {
                tokio::select! {
                    biased;
                    out = &mut fut => Ok(out),
                    reason = signal.fired() => Err(AcquireError::Cancelled(reason)),
                }
            }
            (Some(deadline), Some(signal)) => {
                tokio::select! {
                    biased;
                    out = &mut fut => Ok(out),
                    reason = signal.fired() => Err(AcquireError::Cancelled(reason)),
                    _ = tokio::time::sleep_until(deadline) => Err(AcquireError::Timeout),
                }
            }
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.deadline, &self.signal) {
            (None, None) => write!(f, "Context(unbounded)"),
            (Some(d), None) => write!(f, "Context(deadline: {d:?})"),
            (None, Some(_)) => write!(f, "Context(signal)"),
            (Some(d), Some(_)) => write!(f, "Context(deadline: {d:?}, signal)"),
        }
    }
}
