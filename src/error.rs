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

//! Errors returned by blocking operations.
//!
//! Every acquisition in this crate can fail for one of a small number of reasons, all of them
//! carried by [`AcquireError`]. Errors propagate unchanged through compound operations (a
//! [`LockBox`] or [`Monitor`] multi-key acquisition fails with the error of the request that
//! failed, after unwinding whatever that call had already acquired).
//!
//! [`LockBox`]: crate::lockbox::LockBox
//! [`Monitor`]: crate::monitor::Monitor

use std::error;
use std::fmt;

use crate::rwlock::LockType;

/// The reason a blocking operation gave up waiting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireError {
    /// The context deadline elapsed before the wait completed.
    Timeout,
    /// The context signal fired; carries the signal's reason verbatim.
    Cancelled(String),
    /// Granting the request would close a hold-and-wait cycle across monitors.
    ///
    /// Raised on the acquire that would have closed the cycle. The detecting monitor keeps
    /// everything it already holds; the caller decides whether to unlock and retry or give up.
    Deadlock {
        /// The key whose acquisition would have closed the cycle.
        key: String,
    },
    /// A monitor was asked to re-lock a key it holds with a different lock type.
    ///
    /// Locks are neither upgraded nor downgraded while held.
    TypeMismatch {
        /// The key already held by the monitor.
        key: String,
        /// The type the monitor holds the key with.
        held: LockType,
        /// The type the rejected request asked for.
        requested: LockType,
    },
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::Timeout => write!(f, "timed out waiting for lock"),
            AcquireError::Cancelled(reason) => write!(f, "lock wait cancelled: {reason}"),
            AcquireError::Deadlock { key } => {
                write!(f, "acquiring key {key:?} would deadlock")
            }
            AcquireError::TypeMismatch {
                key,
                held,
                requested,
            } => write!(
                f,
                "key {key:?} is held as {held} and cannot be re-locked as {requested}"
            ),
        }
    }
}

impl error::Error for AcquireError {}
