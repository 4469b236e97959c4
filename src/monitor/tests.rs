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
use crate::rwlock::RwLockWriter;

fn shared() -> (LockBox<RwLockWriter>, PendingLocks) {
    (LockBox::new(), PendingLocks::new())
}

#[tokio::test]
async fn test_lock_and_unlock_all() {
    let boxed: LockBox<RwLockWriter> = LockBox::new();
    let monitor = Monitor::new(boxed.clone());
    let ctx = Context::new();

    monitor.lock(["b", "a"], &ctx).await.unwrap().forget();
    assert_eq!(monitor.count(), 2);
    assert_eq!(monitor.keys(), ["a", "b"]);
    assert!(monitor.is_locked(Some("a"), Some(LockType::Write)));
    assert!(monitor.is_locked(None, None));
    assert_eq!(boxed.len(), 2);

    monitor.unlock_all();
    assert_eq!(monitor.count(), 0);
    assert!(!monitor.is_locked(None, None));
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_reentrant_same_type_is_noop() {
    let boxed: LockBox<RwLockWriter> = LockBox::new();
    let monitor = Monitor::new(boxed.clone());
    let ctx = Context::new();

    monitor.lock([("k", LockType::Read)], &ctx).await.unwrap().forget();
    assert_eq!(monitor.count(), 1);

    // Same key, same type: nothing new is acquired.
    let again = monitor.lock([("k", LockType::Read)], &ctx).await.unwrap();
    assert!(again.keys().is_empty());
    again.release();
    assert_eq!(monitor.count(), 1);
    assert!(monitor.is_locked(Some("k"), Some(LockType::Read)));

    monitor.unlock_all();
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_cross_type_reentry_fails() {
    let boxed: LockBox<RwLockWriter> = LockBox::new();
    let monitor = Monitor::new(boxed);
    let ctx = Context::new();

    monitor.lock([("k", LockType::Read)], &ctx).await.unwrap().forget();
    let err = monitor
        .lock([("k", LockType::Write)], &ctx)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AcquireError::TypeMismatch {
            key: "k".to_string(),
            held: LockType::Read,
            requested: LockType::Write,
        }
    );
    // The failed call acquired nothing and the original hold is intact.
    assert_eq!(monitor.count(), 1);
    assert!(monitor.is_locked(Some("k"), Some(LockType::Read)));
    monitor.unlock_all();
}

#[tokio::test]
async fn test_monitors_contend_through_shared_box() {
    let boxed: LockBox<RwLockWriter> = LockBox::new();
    let m1 = Monitor::new(boxed.clone());
    let m2 = Monitor::new(boxed.clone());
    let ctx = Context::new();

    m1.lock(["k"], &ctx).await.unwrap().forget();
    let timed = Context::new().with_timeout(Duration::from_millis(50));
    assert_eq!(m2.lock(["k"], &timed).await.unwrap_err(), AcquireError::Timeout);
    assert_eq!(m2.count(), 0);

    m1.unlock_all();
    m2.lock(["k"], &ctx).await.unwrap().forget();
    m2.unlock_all();
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_deadlock_detected_on_closing_acquire() {
    // M1 holds a:write, M2 holds b:write. M1 starts waiting for b; M2's attempt
    // on a closes the cycle and is the one that fails. After M2 unlocks
    // everything, M1's wait completes.
    let (boxed, pending) = shared();
    let m1 = Arc::new(Monitor::with_deadlock_detection(boxed.clone(), pending.clone()));
    let m2 = Monitor::with_deadlock_detection(boxed.clone(), pending.clone());
    let ctx = Context::new();

    m1.lock(["a"], &ctx).await.unwrap().forget();
    m2.lock(["b"], &ctx).await.unwrap().forget();

    let m1_attempt = {
        let m1 = m1.clone();
        tokio::spawn(async move {
            m1.lock(["b"], &Context::new()).await.map(|g| g.forget())
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = m2.lock(["a"], &ctx).await.unwrap_err();
    assert_eq!(
        err,
        AcquireError::Deadlock {
            key: "a".to_string()
        }
    );
    // Nothing was auto-unwound: M2 still holds b until it acts.
    assert!(m2.is_locked(Some("b"), None));
    m2.unlock_all();

    m1_attempt.await.unwrap().unwrap();
    assert_eq!(m1.count(), 2);
    m1.unlock_all();
    assert!(boxed.is_empty());
    assert!(pending.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_same_schedule_hangs_without_detection() {
    // The identical hold-and-wait cycle with no shared pending table simply
    // blocks; both attempts run into their timers.
    let boxed: LockBox<RwLockWriter> = LockBox::new();
    let m1 = Arc::new(Monitor::new(boxed.clone()));
    let m2 = Arc::new(Monitor::new(boxed.clone()));
    let ctx = Context::new();

    m1.lock(["a"], &ctx).await.unwrap().forget();
    m2.lock(["b"], &ctx).await.unwrap().forget();

    let m1_attempt = {
        let m1 = m1.clone();
        let ctx = Context::new().with_timeout(Duration::from_millis(100));
        tokio::spawn(async move { m1.lock(["b"], &ctx).await.map(|g| g.forget()) })
    };
    let m2_attempt = {
        let m2 = m2.clone();
        let ctx = Context::new().with_timeout(Duration::from_millis(100));
        tokio::spawn(async move { m2.lock(["a"], &ctx).await.map(|g| g.forget()) })
    };
    assert_eq!(m1_attempt.await.unwrap().unwrap_err(), AcquireError::Timeout);
    assert_eq!(m2_attempt.await.unwrap().unwrap_err(), AcquireError::Timeout);

    m1.unlock_all();
    m2.unlock_all();
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_read_requests_do_not_false_positive() {
    // Two monitors reading the same keys never conflict, so the detector stays
    // quiet even with pending entries around.
    let (boxed, pending) = shared();
    let m1 = Monitor::with_deadlock_detection(boxed.clone(), pending.clone());
    let m2 = Monitor::with_deadlock_detection(boxed.clone(), pending.clone());
    let ctx = Context::new();

    m1.lock([("a", LockType::Read), ("b", LockType::Read)], &ctx)
        .await
        .unwrap()
        .forget();
    m2.lock([("b", LockType::Read), ("a", LockType::Read)], &ctx)
        .await
        .unwrap()
        .forget();

    m1.unlock_all();
    m2.unlock_all();
    assert!(boxed.is_empty());
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_failed_walk_releases_only_this_call() {
    let boxed: LockBox<RwLockWriter> = LockBox::new();
    let m1 = Monitor::new(boxed.clone());
    let m2 = Monitor::new(boxed.clone());
    let ctx = Context::new();

    m1.lock(["held"], &ctx).await.unwrap().forget();
    m2.lock(["c"], &ctx).await.unwrap().forget();

    // M2 acquires "a" then times out on "held": "a" is unwound, "c" survives.
    let timed = Context::new().with_timeout(Duration::from_millis(50));
    let err = m2.lock(["a", "held"], &timed).await.unwrap_err();
    assert_eq!(err, AcquireError::Timeout);
    assert_eq!(m2.keys(), ["c"]);
    assert!(!boxed.is_locked(Some("a"), None));

    m1.unlock_all();
    m2.unlock_all();
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_scope_guard_releases_only_its_acquisitions() {
    let boxed: LockBox<RwLockWriter> = LockBox::new();
    let monitor = Monitor::new(boxed.clone());
    let ctx = Context::new();

    monitor.lock(["base"], &ctx).await.unwrap().forget();
    {
        let scope = monitor.lock(["base", "extra"], &ctx).await.unwrap();
        assert_eq!(scope.keys(), ["extra"]);
        assert_eq!(monitor.count(), 2);
    }
    // Dropping the scope released "extra" but not the earlier "base".
    assert_eq!(monitor.keys(), ["base"]);
    monitor.unlock_all();
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_stale_scope_guard_skips_reacquired_key() {
    let boxed: LockBox<RwLockWriter> = LockBox::new();
    let monitor = Monitor::new(boxed.clone());
    let ctx = Context::new();

    let scope = monitor.lock(["k"], &ctx).await.unwrap();
    // Manual unlock, then a fresh acquisition of the same key.
    monitor.unlock(["k"]);
    monitor.lock(["k"], &ctx).await.unwrap().forget();

    // The stale scope must not release the fresh acquisition.
    scope.release();
    assert!(monitor.is_locked(Some("k"), None));
    monitor.unlock_all();
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_unlock_skips_unknown_keys() {
    let boxed: LockBox<RwLockWriter> = LockBox::new();
    let monitor = Monitor::new(boxed.clone());
    monitor.lock(["a"], &Context::new()).await.unwrap().forget();
    monitor.unlock(["missing", "a", "also-missing"]);
    assert_eq!(monitor.count(), 0);
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_wait_unlocked_is_monitor_local() {
    let boxed: LockBox<RwLockWriter> = LockBox::new();
    let m1 = Arc::new(Monitor::new(boxed.clone()));
    let m2 = Monitor::new(boxed.clone());

    m1.lock(["k"], &Context::new()).await.unwrap().forget();
    // M2 does not hold "k", so its local wait resolves immediately.
    m2.wait_unlocked(Some("k"), &Context::new()).await.unwrap();

    let observer = {
        let m1 = m1.clone();
        tokio::spawn(async move { m1.wait_unlocked(Some("k"), &Context::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    m1.unlock_all();
    observer.await.unwrap().unwrap();
    assert!(boxed.is_empty());
}

#[tokio::test]
async fn test_per_request_ctx_overrides_method_ctx() {
    let boxed: LockBox<RwLockWriter> = LockBox::new();
    let m1 = Monitor::new(boxed.clone());
    let m2 = Monitor::new(boxed.clone());

    m1.lock(["k"], &Context::new()).await.unwrap().forget();
    // The method ctx is unbounded; the request's own timer still fires.
    let request = MonitorRequest::new("k", LockType::Write)
        .with_ctx(Context::new().with_timeout(Duration::from_millis(50)));
    let err = m2.lock([request], &Context::new()).await.unwrap_err();
    assert_eq!(err, AcquireError::Timeout);

    m1.unlock_all();
    assert!(boxed.is_empty());
}
