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

//! A countdown rendezvous point.
//!
//! A barrier built for `n` participants holds an inner [`Lock`] acquired at construction.
//! Each [`wait`] call counts one arrival down; the final arrival releases the hold and every
//! pending wait resolves. Once released, the barrier stays released and further waits return
//! immediately.
//!
//! # Examples
//!
//! ```
//! # #[tokio::main]
//! # async fn main() {
//! use std::sync::Arc;
//!
//! use waitlock::barrier::Barrier;
//! use waitlock::context::Context;
//!
//! let barrier = Arc::new(Barrier::new(3));
//! let mut arrivals = Vec::new();
//! for _ in 0..3 {
//!     let barrier = barrier.clone();
//!     arrivals.push(tokio::spawn(async move {
//!         barrier.wait(&Context::new()).await.unwrap();
//!     }));
//! }
//! for arrival in arrivals {
//!     arrival.await.unwrap();
//! }
//! // A late arrival passes straight through.
//! barrier.wait(&Context::new()).await.unwrap();
//! # }
//! ```
//!
//! [`Lock`]: crate::lock::Lock
//! [`wait`]: Barrier::wait

use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::error::AcquireError;
use crate::internal;
use crate::lock::Lock;
use crate::lock::OwnedLockGuard;

#[cfg(test)]
mod tests;

/// A countdown rendezvous point for a fixed number of participants.
///
/// See the [module level documentation](self) for more.
pub struct Barrier {
    lock: Arc<Lock>,
    state: internal::Mutex<BarrierState>,
}

struct BarrierState {
    remaining: usize,
    hold: Option<OwnedLockGuard>,
}

enum Arrival {
    Released,
    Releasing(OwnedLockGuard),
    Pending,
}

impl Barrier {
    /// Creates a barrier for `count` participants.
    ///
    /// A barrier for zero participants starts released.
    pub fn new(count: usize) -> Self {
        let lock = Arc::new(Lock::new());
        let hold = if count > 0 {
            // The lock is freshly built and uncontended.
            lock.try_lock_owned()
        } else {
            None
        };
        debug_assert_eq!(hold.is_some(), count > 0);
        Self {
            lock,
            state: internal::Mutex::new(BarrierState {
                remaining: count,
                hold,
            }),
        }
    }

    /// Arrives at the barrier, waiting until every participant has.
    ///
    /// The final arrival releases all pending waits at once; arrivals after release return
    /// immediately.
    pub async fn wait(&self, ctx: &Context) -> Result<(), AcquireError> {
        let arrival = self.state.with(|s| {
            if s.hold.is_none() {
                return Arrival::Released;
            }
            s.remaining = s.remaining.saturating_sub(1);
            if s.remaining == 0 {
                match s.hold.take() {
                    Some(hold) => Arrival::Releasing(hold),
                    None => Arrival::Released,
                }
            } else {
                Arrival::Pending
            }
        });
        match arrival {
            Arrival::Released => Ok(()),
            Arrival::Releasing(hold) => {
                hold.release();
                Ok(())
            }
            Arrival::Pending => self.lock.wait_unlocked(ctx).await,
        }
    }

    /// Force-releases the barrier regardless of how many arrivals are outstanding.
    pub fn destroy(&self) {
        let hold = self.state.with(|s| {
            s.remaining = 0;
            s.hold.take()
        });
        drop(hold);
    }

    /// The number of participants still to arrive.
    pub fn count(&self) -> usize {
        self.state.with(|s| s.remaining)
    }

    /// Whether the barrier has been released.
    pub fn is_released(&self) -> bool {
        self.state.with(|s| s.hold.is_none())
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("count", &self.count())
            .field("released", &self.is_released())
            .finish()
    }
}
