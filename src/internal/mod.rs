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

//! Synchronized primitives for internal usage.
//!
//! Although this crate provides async utilities, to implement them properly, sync primitives are
//! still needed. Sync primitives are used internally only and mainly for exclusive access to
//! counters and wait queues. All the guards are expected to release the resources as soon as
//! updates are done, so that there is no need to worry about long blocking and never deadlocks.

mod event;
mod mutex;

pub(crate) use event::Event;
pub(crate) use mutex::Mutex;
