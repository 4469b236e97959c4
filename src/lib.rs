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

//! Async locking primitives with timed, cancellable waits.
//!
//! Every blocking operation in this crate takes a [`Context`](context::Context) pairing an
//! optional deadline with an optional cancellation [`Signal`](context::Signal), and aborts its
//! wait as soon as either fires. The primitives layer on each other:
//!
//! - [`semaphore::Semaphore`] — the root: weighted admission with FIFO or
//!   smallest-weight-first queueing.
//! - [`lock::Lock`] — mutual exclusion; a semaphore of limit one.
//! - [`rwlock::RwLockReader`] and [`rwlock::RwLockWriter`] — read-preferring and
//!   write-preferring reader-writer locks, each built from two locks.
//! - [`barrier::Barrier`] — a countdown rendezvous over a pre-acquired lock.
//! - [`lockbox::LockBox`] — a keyed map of lockables with sorted multi-key acquisition and
//!   automatic entry cleanup.
//! - [`monitor::Monitor`] — a transactional re-entrant view over a shared lock box, with
//!   optional cross-monitor deadlock detection.
//!
//! Guards release on drop and offer a single-shot `release()`; `with`/`with_stream` helpers
//! scope an acquisition to an async body or a stream. Everything is runtime-thread-safe:
//! counters and queues live behind internal mutexes held only between suspension points.
//!
//! # Examples
//!
//! ```
//! # #[tokio::main]
//! # async fn main() {
//! use std::time::Duration;
//!
//! use waitlock::context::Context;
//! use waitlock::error::AcquireError;
//! use waitlock::lock::Lock;
//!
//! let lock = Lock::new();
//! let guard = lock.lock(&Context::new()).await.unwrap();
//!
//! let hurried = Context::new().with_timeout(Duration::from_millis(10));
//! assert_eq!(lock.lock(&hurried).await.unwrap_err(), AcquireError::Timeout);
//!
//! guard.release();
//! assert!(!lock.is_locked());
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod barrier;
pub mod context;
pub mod error;
pub mod lock;
pub mod lockbox;
pub mod monitor;
pub mod rwlock;
pub mod scoped;
pub mod semaphore;

mod internal;
