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
use crate::error::AcquireError;

#[tokio::test]
async fn test_rendezvous() {
    // T1 and T2 pend; T3 arrives and all three resolve; a fourth call returns
    // immediately.
    let barrier = Arc::new(Barrier::new(3));
    let t1 = {
        let barrier = barrier.clone();
        tokio::spawn(async move { barrier.wait(&Context::new()).await })
    };
    let t2 = {
        let barrier = barrier.clone();
        tokio::spawn(async move { barrier.wait(&Context::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!barrier.is_released());
    assert_eq!(barrier.count(), 1);

    barrier.wait(&Context::new()).await.unwrap();
    t1.await.unwrap().unwrap();
    t2.await.unwrap().unwrap();
    assert!(barrier.is_released());
    barrier.wait(&Context::new()).await.unwrap();
}

#[tokio::test]
async fn test_zero_count_starts_released() {
    let barrier = Barrier::new(0);
    assert!(barrier.is_released());
    assert_eq!(barrier.count(), 0);
    barrier.wait(&Context::new()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_wait_times_out() {
    let barrier = Barrier::new(2);
    let ctx = Context::new().with_timeout(Duration::from_millis(50));
    assert_eq!(barrier.wait(&ctx).await.unwrap_err(), AcquireError::Timeout);
    // The timed-out arrival already counted down; one more releases.
    assert_eq!(barrier.count(), 1);
    barrier.wait(&Context::new()).await.unwrap();
    assert!(barrier.is_released());
}

#[tokio::test]
async fn test_destroy_releases_waiters() {
    let barrier = Arc::new(Barrier::new(5));
    let waiter = {
        let barrier = barrier.clone();
        tokio::spawn(async move { barrier.wait(&Context::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    barrier.destroy();
    waiter.await.unwrap().unwrap();
    assert!(barrier.is_released());
    assert_eq!(barrier.count(), 0);
}
