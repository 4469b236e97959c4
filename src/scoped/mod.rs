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

//! Scoped-resource helpers.
//!
//! Each primitive offers a `with` method that acquires, runs an async body, and releases on
//! every exit path, and a `with_stream` method returning a [`Guarded`] stream that keeps the
//! acquisition alive for the life of a lazy sequence. Both lean on guard drop glue, so an
//! early-terminated consumer or a panicking body still releases.

use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use futures_util::Stream;


pin_project_lite::pin_project! {
    /// A stream that owns a lock guard for as long as it lives.
    ///
    /// Yields the inner stream's items unchanged. The guard is dropped when the inner stream
    /// finishes or when the `Guarded` itself is dropped, whichever comes first.
    #[must_use = "streams do nothing unless polled"]
    pub struct Guarded<S, G> {
        #[pin]
        stream: S,
        guard: Option<G>,
    }
}

impl<S, G> Guarded<S, G> {
    pub(crate) fn new(guard: G, stream: S) -> Self {
        Self {
            stream,
            guard: Some(guard),
        }
    }

    /// Whether the guard is still held.
    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }
}

impl<S: Stream, G> Stream for Guarded<S, G> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.stream.poll_next(cx) {
            Poll::Ready(None) => {
                // The sequence is exhausted; let go of the lock before the consumer does.
                this.guard.take();
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.stream.size_hint()
    }
}
