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

use std::time::Duration;

use super::*;
use crate::context::Signal;

#[tokio::test]
async fn test_entry_lifecycle() {
    let boxed: LockBox<Lock> = LockBox::new();
    let ctx = Context::new();
    assert!(boxed.is_empty());

    let guard = boxed.lock([LockRequest::from("a")], &ctx).await.unwrap();
    assert_eq!(boxed.len(), 1);
    assert!(boxed.is_locked(Some("a"), None));
    assert!(!boxed.is_locked(Some("b"), None));

    guard.release();
    assert!(boxed.is_empty());
    assert!(!boxed.is_locked(None, None));
}

#[tokio::test]
async fn test_requests_sorted_and_deduplicated() {
    let boxed: LockBox<Lock> = LockBox::new();
    let guard = boxed
        .lock(
            [
                LockRequest::from("c"),
                LockRequest::from("a"),
                LockRequest::from("b"),
                LockRequest::from("a"),
            ],
            &Context::new(),
        )
        .await
        .unwrap();
    assert_eq!(guard.keys(), ["a", "b", "c"]);
    assert_eq!(guard.len(), 3);
    guard.release();
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_inverse_order_requests_do_not_deadlock() {
    // Task A locks 1..4 ascending, task B descending; the canonical sort makes
    // both walks identical, so both complete and the shared counter ends at 2.
    let boxed: LockBox<Lock> = LockBox::new();
    let counter = Arc::new(internal::Mutex::new(0_usize));

    let a = {
        let boxed = boxed.clone();
        let counter = counter.clone();
        tokio::spawn(async move {
            let guard = boxed
                .lock(["1", "2", "3", "4"].map(LockRequest::from), &Context::new())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            counter.with(|c| *c += 1);
            guard.release();
        })
    };
    let b = {
        let boxed = boxed.clone();
        let counter = counter.clone();
        tokio::spawn(async move {
            let guard = boxed
                .lock(["4", "3", "2", "1"].map(LockRequest::from), &Context::new())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            counter.with(|c| *c += 1);
            guard.release();
        })
    };
    a.await.unwrap();
    b.await.unwrap();
    assert_eq!(counter.with(|c| *c), 2);
    assert!(boxed.is_empty());
    assert_eq!(boxed.count(), 0);
}

#[tokio::test]
async fn test_failed_walk_unwinds_acquired_keys() {
    let boxed: LockBox<Lock> = LockBox::new();
    // Hold "b" so a multi-acquire of [a, b] acquires "a" then times out on "b".
    let held = boxed.lock([LockRequest::from("b")], &Context::new()).await.unwrap();

    let ctx = Context::new().with_timeout(Duration::from_millis(50));
    let err = boxed
        .lock([LockRequest::from("a"), LockRequest::from("b")], &ctx)
        .await
        .unwrap_err();
    assert_eq!(err, AcquireError::Timeout);

    // "a" was acquired and must be unwound away; "b" stays for its holder.
    assert!(!boxed.is_locked(Some("a"), None));
    assert_eq!(boxed.keys(), ["b"]);
    held.release();
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_lock_multi_independent_acquires() {
    let boxed: LockBox<Lock> = LockBox::new();
    let ctx = Context::new();
    let acquires = boxed.lock_multi(["b", "a"].map(LockRequest::from), &ctx);
    assert_eq!(acquires.len(), 2);
    assert_eq!(acquires[0].key(), "a");
    assert_eq!(acquires[1].key(), "b");

    let mut guards = Vec::new();
    for acquire in acquires {
        guards.push(acquire.await.unwrap());
    }
    assert_eq!(boxed.len(), 2);
    while let Some(guard) = guards.pop() {
        guard.release();
    }
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_dropped_acquire_cleans_entry_up() {
    let boxed: LockBox<Lock> = LockBox::new();
    let ctx = Context::new();
    let held = boxed.lock([LockRequest::from("a")], &ctx).await.unwrap();
    {
        let pending = boxed.lock_key(LockRequest::from("a"), &ctx);
        tokio::pin!(pending);
        assert!(futures_util::poll!(pending.as_mut()).is_pending());
        assert_eq!(boxed.count(), 2);
    }
    assert_eq!(boxed.count(), 1);
    held.release();
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_cancelled_waiter_leaves_no_stuck_entry() {
    let boxed: LockBox<Lock> = LockBox::new();
    let held = boxed.lock([LockRequest::from("k")], &Context::new()).await.unwrap();

    let signal = Signal::new();
    let waiter = {
        let boxed = boxed.clone();
        let ctx = Context::new().with_signal(signal.clone());
        tokio::spawn(async move { boxed.lock([LockRequest::from("k")], &ctx).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    signal.fire("give up");
    assert_eq!(
        waiter.await.unwrap().unwrap_err(),
        AcquireError::Cancelled("give up".to_string())
    );

    held.release();
    assert!(boxed.is_empty());
    assert_eq!(boxed.count(), 0);
}

#[tokio::test]
async fn test_rwlock_entries_share_and_exclude() {
    let boxed: LockBox<RwLockWriter> = LockBox::new();
    let ctx = Context::new();
    let r1 = boxed
        .lock([LockRequest::new("k", LockType::Read)], &ctx)
        .await
        .unwrap();
    let r2 = boxed
        .lock([LockRequest::new("k", LockType::Read)], &ctx)
        .await
        .unwrap();
    assert!(boxed.is_locked(Some("k"), Some(LockType::Read)));
    assert!(!boxed.is_locked(Some("k"), Some(LockType::Write)));

    let timed = Context::new().with_timeout(Duration::from_millis(50));
    let err = boxed
        .lock([LockRequest::new("k", LockType::Write)], &timed)
        .await
        .unwrap_err();
    assert_eq!(err, AcquireError::Timeout);

    r1.release();
    r2.release();
    let w = boxed
        .lock([LockRequest::new("k", LockType::Write)], &ctx)
        .await
        .unwrap();
    assert!(boxed.is_locked(Some("k"), Some(LockType::Write)));
    w.release();
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_wait_unlocked_all_entries() {
    let boxed: LockBox<Lock> = LockBox::new();
    let held = boxed
        .lock(["a", "b"].map(LockRequest::from), &Context::new())
        .await
        .unwrap();
    let observer = {
        let boxed = boxed.clone();
        tokio::spawn(async move { boxed.wait_unlocked(None, &Context::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    held.release();
    observer.await.unwrap().unwrap();

    // A key that never existed is already unlocked.
    boxed
        .wait_unlocked(Some("missing"), &Context::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_with_releases_on_every_exit() {
    let boxed: LockBox<Lock> = LockBox::new();
    let out = boxed
        .with(["a", "b"].map(LockRequest::from), &Context::new(), || async { 5 })
        .await
        .unwrap();
    assert_eq!(out, 5);
    assert!(boxed.is_empty());

    let boxed2 = boxed.clone();
    let task = tokio::spawn(async move {
        boxed2
            .with(["a"].map(LockRequest::from), &Context::new(), || async {
                panic!("body failed");
            })
            .await
    });
    assert!(task.await.is_err());
    assert!(boxed.is_empty());
}
