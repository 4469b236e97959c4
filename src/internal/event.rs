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

use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

use crate::internal::Mutex;

/// A one-shot settle event.
///
/// Tasks await [`wait`] until some task calls [`set`]; once set, the event stays set and every
/// wait resolves immediately. Used for cohort hand-off in the reader-writer locks, where later
/// readers must not run ahead of the cohort's in-flight inner acquisition.
///
/// [`wait`]: Event::wait
/// [`set`]: Event::set
#[derive(Debug)]
pub(crate) struct Event {
    state: Mutex<EventState>,
}

#[derive(Debug)]
struct EventState {
    set: bool,
    wakers: Vec<Waker>,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(EventState {
                set: false,
                wakers: Vec::new(),
            }),
        }
    }

    /// Settles the event and wakes every waiter. Later calls are no-ops.
    pub(crate) fn set(&self) {
        let wakers = self.state.with(|s| {
            s.set = true;
            std::mem::take(&mut s.wakers)
        });
        for waker in wakers {
            waker.wake();
        }
    }

    pub(crate) fn wait(&self) -> EventWait<'_> {
        EventWait { event: self }
    }
}

pub(crate) struct EventWait<'a> {
    event: &'a Event,
}

impl Future for EventWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.event.state.with(|s| {
            if s.set {
                Poll::Ready(())
            } else {
                if !s.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    s.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        })
    }
}
