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

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::context::Context;
use crate::context::Signal;
use crate::error::AcquireError;
use crate::internal;

#[tokio::test]
async fn test_reader_concurrent_reads() {
    let rw = RwLockReader::new();
    let ctx = Context::new();
    let r1 = rw.read(&ctx).await.unwrap();
    let r2 = rw.read(&ctx).await.unwrap();
    let r3 = rw.read(&ctx).await.unwrap();
    assert_eq!(rw.reader_count(), 3);
    assert!(rw.is_locked(Some(LockType::Read)));
    assert!(!rw.is_locked(Some(LockType::Write)));
    r1.release();
    r2.release();
    r3.release();
    assert_eq!(rw.reader_count(), 0);
    assert!(!rw.is_locked(None));
}

#[tokio::test]
async fn test_reader_writer_excludes_readers() {
    let rw = Arc::new(RwLockReader::new());
    let w = rw.write(&Context::new()).await.unwrap();
    assert!(rw.is_locked(Some(LockType::Write)));

    let timed = Context::new().with_timeout(Duration::from_millis(50));
    assert_eq!(rw.read(&timed).await.unwrap_err(), AcquireError::Timeout);

    let reader = {
        let rw = rw.clone();
        tokio::spawn(async move { rw.read_owned(&Context::new()).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    w.release();
    reader.await.unwrap().release();
    assert!(!rw.is_locked(None));
}

#[tokio::test]
async fn test_reader_writers_exclude_each_other() {
    let rw = Arc::new(RwLockReader::new());
    let w1 = rw.write(&Context::new()).await.unwrap();
    let w2 = {
        let rw = rw.clone();
        tokio::spawn(async move { rw.write_owned(&Context::new()).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(rw.writer_count(), 2);
    w1.release();
    let w2 = w2.await.unwrap();
    assert_eq!(rw.writer_count(), 1);
    w2.release();
    assert_eq!(rw.writer_count(), 0);
}

#[tokio::test]
async fn test_reader_readers_overtake_queued_writer() {
    // Read preference: with readers holding and a writer queued, a new reader
    // still gets in.
    let rw = Arc::new(RwLockReader::new());
    let r1 = rw.read(&Context::new()).await.unwrap();
    let writer = {
        let rw = rw.clone();
        tokio::spawn(async move { rw.write_owned(&Context::new()).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let r2 = rw.read(&Context::new()).await.unwrap();
    assert_eq!(rw.reader_count(), 2);
    r1.release();
    r2.release();
    writer.await.unwrap().release();
    assert!(!rw.is_locked(None));
}

#[tokio::test(start_paused = true)]
async fn test_reader_cancelled_cohort_acquirer_fails_alone() {
    // A writer holds the lock; the first reader times out while taking the write
    // exclusion for the cohort. The reader queued behind it must still succeed
    // once the writer leaves.
    let rw = Arc::new(RwLockReader::new());
    let w = rw.write(&Context::new()).await.unwrap();

    let first = {
        let rw = rw.clone();
        let ctx = Context::new().with_timeout(Duration::from_millis(20));
        tokio::spawn(async move { rw.read_owned(&ctx).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    let second = {
        let rw = rw.clone();
        tokio::spawn(async move { rw.read_owned(&Context::new()).await })
    };

    assert_eq!(first.await.unwrap().unwrap_err(), AcquireError::Timeout);
    tokio::time::sleep(Duration::from_millis(10)).await;
    w.release();
    second.await.unwrap().unwrap().release();
    assert!(!rw.is_locked(None));
    assert_eq!(rw.reader_count(), 0);
}

#[tokio::test]
async fn test_writer_write_preference() {
    // Readers R1, R2 hold; writer W queues; new readers R3, R4 with 100ms timers
    // both time out; once R1 and R2 release, W runs; the lock ends idle.
    let rw = Arc::new(RwLockWriter::new());
    let r1 = rw.read(&Context::new()).await.unwrap();
    let r2 = rw.read(&Context::new()).await.unwrap();

    let w = {
        let rw = rw.clone();
        tokio::spawn(async move { rw.write_owned(&Context::new()).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(rw.writer_count(), 1);

    let r3 = {
        let rw = rw.clone();
        let ctx = Context::new().with_timeout(Duration::from_millis(100));
        tokio::spawn(async move { rw.read_owned(&ctx).await })
    };
    let r4 = {
        let rw = rw.clone();
        let ctx = Context::new().with_timeout(Duration::from_millis(100));
        tokio::spawn(async move { rw.read_owned(&ctx).await })
    };
    assert_eq!(r3.await.unwrap().unwrap_err(), AcquireError::Timeout);
    assert_eq!(r4.await.unwrap().unwrap_err(), AcquireError::Timeout);

    r1.release();
    r2.release();
    let w = w.await.unwrap();
    assert!(rw.is_locked(Some(LockType::Write)));
    w.release();
    assert!(!rw.is_locked(None));
    assert_eq!(rw.count(), 0);
}

#[tokio::test]
async fn test_writer_concurrent_reads_when_no_writer() {
    let rw = RwLockWriter::new();
    let ctx = Context::new();
    let r1 = rw.read(&ctx).await.unwrap();
    let r2 = rw.read(&ctx).await.unwrap();
    assert_eq!(rw.reader_count(), 2);
    assert!(rw.is_locked(Some(LockType::Read)));
    r1.release();
    r2.release();
    assert!(!rw.is_locked(None));
}

#[tokio::test]
async fn test_writer_waits_for_admitted_readers() {
    let rw = Arc::new(RwLockWriter::new());
    let r = rw.read(&Context::new()).await.unwrap();
    let order = Arc::new(internal::Mutex::new(Vec::new()));
    let w = {
        let rw = rw.clone();
        let order = order.clone();
        tokio::spawn(async move {
            let guard = rw.write_owned(&Context::new()).await.unwrap();
            order.with(|o| o.push("write"));
            guard.release();
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    order.with(|o| o.push("read-release"));
    r.release();
    w.await.unwrap();
    assert_eq!(order.with(|o| o.clone()), vec!["read-release", "write"]);
}

#[tokio::test(start_paused = true)]
async fn test_writer_blocked_reader_cancelled_fails_alone() {
    // A reader cancelled while blocked behind a writer fails by itself; a reader
    // queued alongside it is untouched and proceeds once the writer leaves.
    let rw = Arc::new(RwLockWriter::new());
    let w = rw.write(&Context::new()).await.unwrap();

    let signal = Signal::new();
    let first = {
        let rw = rw.clone();
        let ctx = Context::new().with_signal(signal.clone());
        tokio::spawn(async move { rw.read_owned(&ctx).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    let second = {
        let rw = rw.clone();
        tokio::spawn(async move { rw.read_owned(&Context::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    signal.fire("cancel first reader");
    let err = first.await.unwrap().unwrap_err();
    assert_eq!(err, AcquireError::Cancelled("cancel first reader".to_string()));

    w.release();
    second.await.unwrap().unwrap().release();
    assert!(!rw.is_locked(None));
    assert_eq!(rw.reader_count(), 0);
}

#[tokio::test]
async fn test_lock_dispatch_and_lock_type() {
    let rw = RwLockWriter::new();
    let ctx = Context::new();
    let guard = rw.lock(LockType::Read, &ctx).await.unwrap();
    assert_eq!(guard.lock_type(), LockType::Read);
    guard.release();
    let guard = rw.lock(LockType::Write, &ctx).await.unwrap();
    assert_eq!(guard.lock_type(), LockType::Write);
    guard.release();
    assert!(!rw.is_locked(None));
}

#[tokio::test]
async fn test_wait_unlocked_sees_idle() {
    let rw = Arc::new(RwLockWriter::new());
    let w = rw.write(&Context::new()).await.unwrap();
    let observer = {
        let rw = rw.clone();
        tokio::spawn(async move { rw.wait_unlocked(&Context::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    w.release();
    observer.await.unwrap().unwrap();
    assert_eq!(rw.count(), 0);
}

#[tokio::test]
async fn test_with_releases_read_and_write() {
    let rw = RwLockReader::new();
    let ctx = Context::new();
    let out = rw
        .with(LockType::Read, &ctx, || async { "read body" })
        .await
        .unwrap();
    assert_eq!(out, "read body");
    let out = rw
        .with(LockType::Write, &ctx, || async { "write body" })
        .await
        .unwrap();
    assert_eq!(out, "write body");
    assert!(!rw.is_locked(None));
}
