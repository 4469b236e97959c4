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

//! Reader-writer locks that allow multiple readers or a single writer at a time.
//!
//! Two variants with the same surface and opposite priority policies, each built from two
//! inner [`Lock`]s:
//!
//! - [`RwLockReader`] is *read-preferring*: readers never wait behind a queued writer, so a
//!   steady stream of readers can starve writers.
//! - [`RwLockWriter`] is *write-preferring*: any admitted or queued writer blocks new readers
//!   until the writer sequence is done, so writers cannot starve.
//!
//! Every wait takes a [`Context`] and aborts on its deadline or signal.
//!
//! # Examples
//!
//! ```
//! # #[tokio::main]
//! # async fn main() {
//! use waitlock::context::Context;
//! use waitlock::rwlock::RwLockWriter;
//!
//! let rwlock = RwLockWriter::new();
//! let ctx = Context::new();
//!
//! // many read guards can be held at once
//! let r1 = rwlock.read(&ctx).await.unwrap();
//! let r2 = rwlock.read(&ctx).await.unwrap();
//! assert_eq!(rwlock.reader_count(), 2);
//! r1.release();
//! r2.release();
//!
//! // only one write guard may be held
//! let w = rwlock.write(&ctx).await.unwrap();
//! assert_eq!(rwlock.writer_count(), 1);
//! w.release();
//! # }
//! ```
//!
//! [`Lock`]: crate::lock::Lock
//! [`Context`]: crate::context::Context

use std::fmt;

pub mod reader;
pub mod writer;

pub use reader::RwLockReader;
pub use writer::RwLockWriter;

#[cfg(test)]
mod tests;

/// The mode a reader-writer lock is acquired in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LockType {
    /// Shared access; any number of concurrent holders.
    Read,
    /// Exclusive access. The default mode.
    #[default]
    Write,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Read => write!(f, "read"),
            LockType::Write => write!(f, "write"),
        }
    }
}
