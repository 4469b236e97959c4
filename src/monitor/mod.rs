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

//! A transactional, re-entrant view over a shared [`LockBox`] of reader-writer locks.
//!
//! A [`Monitor`] is a short-lived scope: it records which keys it holds, treats re-locking a
//! held key with the same [`LockType`] as a no-op (and with a different type as a hard error),
//! acquires fresh keys in canonical order, and unlocks in reverse. Several monitors over one
//! box coordinate through the box's locks; when they also share a [`PendingLocks`] table, each
//! acquisition first runs a deadlock detector over everyone's pending requests.
//!
//! On [`AcquireError::Deadlock`] the detecting monitor keeps everything it already holds;
//! nothing is unwound automatically. The caller decides whether to [`unlock_all`] and retry or
//! give up.
//!
//! # Examples
//!
//! ```
//! # #[tokio::main]
//! # async fn main() {
//! use waitlock::context::Context;
//! use waitlock::lockbox::LockBox;
//! use waitlock::monitor::Monitor;
//! use waitlock::rwlock::LockType;
//! use waitlock::rwlock::RwLockWriter;
//!
//! let boxed: LockBox<RwLockWriter> = LockBox::new();
//! let monitor = Monitor::new(boxed.clone());
//! let ctx = Context::new();
//!
//! let held = monitor.lock(["balance"], &ctx).await.unwrap();
//! held.forget();
//! // Re-locking a held key with the same type is a no-op.
//! monitor.lock(["balance"], &ctx).await.unwrap().forget();
//! assert_eq!(monitor.count(), 1);
//!
//! monitor.unlock_all();
//! assert_eq!(monitor.count(), 0);
//! assert!(boxed.is_empty());
//! # }
//! ```
//!
//! [`unlock_all`]: Monitor::unlock_all
//! [`AcquireError::Deadlock`]: crate::error::AcquireError::Deadlock

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::try_join_all;
use log::trace;

use crate::context::Context;
use crate::error::AcquireError;
use crate::internal;
use crate::lockbox::LockBox;
use crate::lockbox::LockBoxGuard;
use crate::lockbox::LockRequest;
use crate::lockbox::Lockable;
use crate::rwlock::LockType;

#[cfg(test)]
mod tests;

/// The pending-acquisition table shared by monitors that want deadlock detection.
///
/// Tracks how many monitors are blocked on each `(key, type)` pair. Handing a clone of one
/// table to every monitor over a box enables the detector; monitors without one never check.
#[derive(Clone, Default)]
pub struct PendingLocks {
    inner: Arc<internal::Mutex<HashMap<(String, LockType), usize>>>,
}

impl PendingLocks {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of distinct `(key, type)` pairs currently being waited for.
    pub fn len(&self) -> usize {
        self.inner.with(|pending| pending.len())
    }

    /// Whether nothing is being waited for.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, key: &str, ty: LockType) {
        self.inner.with(|pending| {
            *pending.entry((key.to_string(), ty)).or_insert(0) += 1;
        });
    }

    fn unregister(&self, key: &str, ty: LockType) {
        self.inner.with(|pending| {
            let slot = (key.to_string(), ty);
            if let Some(count) = pending.get_mut(&slot) {
                *count -= 1;
                if *count == 0 {
                    pending.remove(&slot);
                }
            }
        });
    }

    fn any(&self, mut f: impl FnMut(&str, LockType) -> bool) -> bool {
        self.inner
            .with(|pending| pending.keys().any(|(key, ty)| f(key, *ty)))
    }
}

impl fmt::Debug for PendingLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLocks").field("len", &self.len()).finish()
    }
}

/// One key of a monitor acquisition: a key, a [`LockType`] (write by default), and an
/// optional per-request context overriding the method-level one.
pub struct MonitorRequest {
    /// The key to lock.
    pub key: String,
    /// The mode to lock it in.
    pub ty: LockType,
    /// Overrides the method-level context for this key only.
    pub ctx: Option<Context>,
}

impl MonitorRequest {
    /// Creates a request for `key` in the given mode.
    pub fn new(key: impl Into<String>, ty: LockType) -> Self {
        Self {
            key: key.into(),
            ty,
            ctx: None,
        }
    }

    /// Bounds this key's acquisition with its own context.
    pub fn with_ctx(mut self, ctx: Context) -> Self {
        self.ctx = Some(ctx);
        self
    }
}

impl From<&str> for MonitorRequest {
    fn from(key: &str) -> Self {
        Self::new(key, LockType::default())
    }
}

impl From<String> for MonitorRequest {
    fn from(key: String) -> Self {
        Self::new(key, LockType::default())
    }
}

impl From<(&str, LockType)> for MonitorRequest {
    fn from((key, ty): (&str, LockType)) -> Self {
        Self::new(key, ty)
    }
}

impl From<(String, LockType)> for MonitorRequest {
    fn from((key, ty): (String, LockType)) -> Self {
        Self::new(key, ty)
    }
}

impl From<(&str, LockType, Context)> for MonitorRequest {
    fn from((key, ty, ctx): (&str, LockType, Context)) -> Self {
        Self::new(key, ty).with_ctx(ctx)
    }
}

impl fmt::Debug for MonitorRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorRequest")
            .field("key", &self.key)
            .field("ty", &self.ty)
            .finish()
    }
}

enum LocalStatus<L: Lockable> {
    Acquiring,
    Acquired(LockBoxGuard<L>),
}

struct LocalEntry<L: Lockable> {
    ty: LockType,
    generation: u64,
    status: LocalStatus<L>,
}

struct MonitorState<L: Lockable> {
    /// Local insertion order; unlock_all walks it backwards.
    order: Vec<String>,
    entries: HashMap<String, LocalEntry<L>>,
    generation: u64,
}

/// A transactional, re-entrant view over a shared [`LockBox`].
///
/// See the [module level documentation](self) for more.
pub struct Monitor<L>
where
    L: Lockable<Params = LockType>,
{
    lockbox: LockBox<L>,
    pending: Option<PendingLocks>,
    state: internal::Mutex<MonitorState<L>>,
}

impl<L> Monitor<L>
where
    L: Lockable<Params = LockType>,
{
    /// Creates a monitor over `lockbox` without deadlock detection.
    pub fn new(lockbox: LockBox<L>) -> Self {
        Self {
            lockbox,
            pending: None,
            state: internal::Mutex::new(MonitorState {
                order: Vec::new(),
                entries: HashMap::new(),
                generation: 0,
            }),
        }
    }

    /// Creates a monitor that coordinates deadlock detection through `pending`.
    ///
    /// Every monitor over the same box must share the same table for the detector to see the
    /// whole picture.
    pub fn with_deadlock_detection(lockbox: LockBox<L>, pending: PendingLocks) -> Self {
        Self {
            pending: Some(pending),
            ..Self::new(lockbox)
        }
    }

    /// Acquires every requested key this monitor does not already hold, in canonical order.
    ///
    /// Keys already held with the same type are silent no-ops; a held key requested with a
    /// different type fails with [`AcquireError::TypeMismatch`] before anything is acquired.
    /// On failure partway, the keys this call had acquired are released in reverse order (the
    /// monitor's earlier holdings are untouched).
    ///
    /// With deadlock detection on, each fresh key is checked against every other monitor's
    /// pending acquisitions before this monitor suspends on it; a cycle fails the call with
    /// [`AcquireError::Deadlock`] and this monitor keeps what it already holds.
    ///
    /// The returned guard releases exactly the keys this call acquired. Call
    /// [`MonitorGuard::forget`] to manage them through [`unlock`]/[`unlock_all`] instead.
    ///
    /// [`unlock`]: Monitor::unlock
    /// [`unlock_all`]: Monitor::unlock_all
    /// [`AcquireError::TypeMismatch`]: crate::error::AcquireError::TypeMismatch
    /// [`AcquireError::Deadlock`]: crate::error::AcquireError::Deadlock
    pub async fn lock<I, R>(
        &self,
        requests: I,
        ctx: &Context,
    ) -> Result<MonitorGuard<'_, L>, AcquireError>
    where
        I: IntoIterator<Item = R>,
        R: Into<MonitorRequest>,
    {
        let requests: Vec<MonitorRequest> = requests.into_iter().map(Into::into).collect();

        // Screen for re-entry before acquiring anything: a type mismatch is a hard error, a
        // match is a no-op, and only unknown keys go into the walk.
        let mut fresh: Vec<MonitorRequest> = Vec::new();
        let (screened, generation) = self.state.with(|s| {
            for request in requests {
                if let Some(entry) = s.entries.get(&request.key) {
                    if entry.ty != request.ty {
                        return (
                            Err(AcquireError::TypeMismatch {
                                key: request.key,
                                held: entry.ty,
                                requested: request.ty,
                            }),
                            0,
                        );
                    }
                } else if !fresh.iter().any(|f| f.key == request.key) {
                    fresh.push(request);
                }
            }
            s.generation += 1;
            (Ok(()), s.generation)
        });
        screened?;
        fresh.sort_by(|a, b| a.key.cmp(&b.key));

        let mut acquired: Vec<(String, u64)> = Vec::new();
        for request in fresh {
            let key = request.key;
            let ty = request.ty;
            let req_ctx = request.ctx.unwrap_or_else(|| ctx.clone());

            // The detector runs synchronously, before this monitor suspends on the key.
            if self.pending.is_some() && self.detects_cycle(&key, ty) {
                trace!("monitor: deadlock detected acquiring key {key:?} as {ty}");
                self.unwind(&acquired);
                return Err(AcquireError::Deadlock { key });
            }

            self.state.with(|s| {
                s.entries.insert(
                    key.clone(),
                    LocalEntry {
                        ty,
                        generation,
                        status: LocalStatus::Acquiring,
                    },
                );
                s.order.push(key.clone());
            });
            if let Some(pending) = &self.pending {
                pending.register(&key, ty);
            }
            let result = self
                .lockbox
                .lock_key(LockRequest::new(key.clone(), ty), &req_ctx)
                .await;
            if let Some(pending) = &self.pending {
                pending.unregister(&key, ty);
            }
            match result {
                Ok(guard) => {
                    self.state.with(|s| {
                        if let Some(entry) = s.entries.get_mut(&key) {
                            entry.status = LocalStatus::Acquired(guard);
                        }
                    });
                    acquired.push((key, generation));
                }
                Err(err) => {
                    self.state.with(|s| {
                        s.entries.remove(&key);
                        s.order.retain(|k| k != &key);
                    });
                    self.unwind(&acquired);
                    return Err(err);
                }
            }
        }
        Ok(MonitorGuard {
            monitor: self,
            keys: acquired,
        })
    }

    /// Unlocks the given keys, in call order. Keys this monitor does not hold are skipped.
    pub fn unlock<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        for key in keys {
            self.release_local(key.as_ref(), None);
        }
    }

    /// Unlocks every held key, most recently acquired first.
    pub fn unlock_all(&self) {
        let keys: Vec<String> = self.state.with(|s| s.order.clone());
        for key in keys.iter().rev() {
            self.release_local(key, None);
        }
    }

    /// Whether this monitor holds the given key (or, with `None`, any key) in the given mode.
    ///
    /// Monitor-local: other monitors' holdings are invisible here.
    pub fn is_locked(&self, key: Option<&str>, ty: Option<LockType>) -> bool {
        self.state.with(|s| match key {
            Some(key) => s
                .entries
                .get(key)
                .map(|entry| {
                    matches!(entry.status, LocalStatus::Acquired(_))
                        && ty.map_or(true, |ty| entry.ty == ty)
                })
                .unwrap_or(false),
            None => s.entries.values().any(|entry| {
                matches!(entry.status, LocalStatus::Acquired(_))
                    && ty.map_or(true, |ty| entry.ty == ty)
            }),
        })
    }

    /// Resolves when the given held key (or, with `None`, every held key) is observably
    /// unlocked in the shared box. Keys this monitor does not hold resolve immediately.
    pub async fn wait_unlocked(&self, key: Option<&str>, ctx: &Context) -> Result<(), AcquireError> {
        match key {
            Some(key) => {
                if self.state.with(|s| s.entries.contains_key(key)) {
                    self.lockbox.wait_unlocked(Some(key), ctx).await
                } else {
                    Ok(())
                }
            }
            None => {
                let keys: Vec<String> = self.state.with(|s| s.order.clone());
                try_join_all(
                    keys.iter()
                        .map(|key| self.lockbox.wait_unlocked(Some(key.as_str()), ctx)),
                )
                .await?;
                Ok(())
            }
        }
    }

    /// The number of keys this monitor holds or is currently acquiring.
    pub fn count(&self) -> usize {
        self.state.with(|s| s.entries.len())
    }

    /// The held and in-flight keys, in local acquisition order.
    pub fn keys(&self) -> Vec<String> {
        self.state.with(|s| s.order.clone())
    }

    /// A read-only snapshot of the held and in-flight keys and their lock types.
    pub fn lock_types(&self) -> HashMap<String, LockType> {
        self.state.with(|s| {
            s.entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.ty))
                .collect()
        })
    }

    /// The deadlock check for one fresh `(key, ty)` acquisition.
    ///
    /// A cycle needs this monitor to be about to block on the key while some other monitor,
    /// blocked on a key we hold, cannot proceed until we let it go. Both conditions are read
    /// from shared state between suspension points.
    fn detects_cycle(&self, key: &str, ty: LockType) -> bool {
        let Some(pending) = &self.pending else {
            return false;
        };
        // Would we even block? Reads conflict with a held writer; writes with anything.
        let blocked = match ty {
            LockType::Read => self.lockbox.is_locked(Some(key), Some(LockType::Write)),
            LockType::Write => self.lockbox.is_locked(Some(key), None),
        };
        if !blocked {
            return false;
        }
        pending.any(|other_key, other_ty| {
            self.state.with(|s| match s.entries.get(other_key) {
                Some(local) if matches!(local.status, LocalStatus::Acquired(_)) => {
                    local.ty == LockType::Write || other_ty == LockType::Write
                }
                _ => false,
            })
        })
    }

    fn unwind(&self, acquired: &[(String, u64)]) {
        for (key, generation) in acquired.iter().rev() {
            self.release_local(key, Some(*generation));
        }
    }

    /// Removes and releases a local entry. With a generation, only the matching acquisition
    /// is touched, so a stale scope guard cannot release a key that was re-acquired since.
    fn release_local(&self, key: &str, generation: Option<u64>) {
        let guard = self.state.with(|s| {
            let matches_generation = s
                .entries
                .get(key)
                .map(|entry| generation.map_or(true, |g| entry.generation == g))
                .unwrap_or(false);
            if !matches_generation {
                return None;
            }
            s.order.retain(|k| k != key);
            match s.entries.remove(key) {
                Some(LocalEntry {
                    status: LocalStatus::Acquired(guard),
                    ..
                }) => Some(guard),
                _ => None,
            }
        });
        if let Some(guard) = guard {
            guard.release();
        }
    }
}

impl<L> fmt::Debug for Monitor<L>
where
    L: Lockable<Params = LockType>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("count", &self.count())
            .field("deadlock_detection", &self.pending.is_some())
            .finish()
    }
}

/// The scope of one [`Monitor::lock`] call.
///
/// Dropping or [`release`]-ing it unlocks exactly the keys that call acquired, most recent
/// first; keys that were re-entrant no-ops are untouched. [`forget`] leaves the keys held for
/// [`Monitor::unlock`]/[`Monitor::unlock_all`] to manage.
///
/// [`release`]: MonitorGuard::release
/// [`forget`]: MonitorGuard::forget
#[must_use = "the acquired keys are released immediately when the guard is dropped"]
pub struct MonitorGuard<'a, L>
where
    L: Lockable<Params = LockType>,
{
    monitor: &'a Monitor<L>,
    keys: Vec<(String, u64)>,
}

impl<L> MonitorGuard<'_, L>
where
    L: Lockable<Params = LockType>,
{
    /// The keys this call acquired (re-entrant no-ops excluded), in acquisition order.
    pub fn keys(&self) -> Vec<&str> {
        self.keys.iter().map(|(key, _)| key.as_str()).collect()
    }

    /// Releases the keys this call acquired, most recent first.
    pub fn release(self) {
        drop(self);
    }

    /// Keeps the keys held; the monitor's `unlock`/`unlock_all` own them from here.
    pub fn forget(mut self) {
        self.keys.clear();
    }
}

impl<L> Drop for MonitorGuard<'_, L>
where
    L: Lockable<Params = LockType>,
{
    fn drop(&mut self) {
        while let Some((key, generation)) = self.keys.pop() {
            self.monitor.release_local(&key, Some(generation));
        }
    }
}

impl<L> fmt::Debug for MonitorGuard<'_, L>
where
    L: Lockable<Params = LockType>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorGuard").field("keys", &self.keys()).finish()
    }
}
