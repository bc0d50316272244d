//! Shared memory: key/value buckets and named FIFO locks.
//!
//! [`SharedStore`] is the authoritative state. On a multiprocess runner it lives
//! inside the IPC host and is mutated only by the server loop. Bots reach it through
//! [`SharedMemory`], which talks to a [`SharedDriver`]: either a store in the same
//! process or the host over IPC.

mod driver;

pub use driver::{IpcDriver, LocalDriver, SharedDriver, SharedMemory};

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ipc::IpcError;

/// `bot_id:component_id[:sub_name]`, naming both buckets and locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SharedKey {
    pub bot_id: String,
    pub component_id: String,
    pub sub_name: Option<String>,
}

impl SharedKey {
    pub fn new(bot_id: impl Into<String>, component_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            component_id: component_id.into(),
            sub_name: None,
        }
    }

    pub fn with_sub(mut self, sub_name: impl Into<String>) -> Self {
        self.sub_name = Some(sub_name.into());
        self
    }
}

impl fmt::Display for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bot_id, self.component_id)?;
        if let Some(sub) = &self.sub_name {
            write!(f, ":{sub}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid shared key {0:?}: expected bot:component[:sub]")]
pub struct InvalidKey(String);

impl FromStr for SharedKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(bot), Some(component)) = (parts.next(), parts.next()) else {
            return Err(InvalidKey(s.to_string()));
        };
        let sub = parts.next();
        if bot.is_empty() || component.is_empty() || sub.is_some_and(str::is_empty) {
            return Err(InvalidKey(s.to_string()));
        }
        Ok(Self {
            bot_id: bot.to_string(),
            component_id: component.to_string(),
            sub_name: sub.map(str::to_string),
        })
    }
}

impl TryFrom<String> for SharedKey {
    type Error = InvalidKey;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SharedKey> for String {
    fn from(key: SharedKey) -> Self {
        key.to_string()
    }
}

/// A bucket's contents at the time it was read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub key: SharedKey,
    pub values: Map<String, Value>,
    /// The read created the bucket; initialisers should run.
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    pub held: bool,
    pub waiters: usize,
}

/// Transferable lock state. Waiters are tied to a live caller and are not carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub id: SharedKey,
    pub held: bool,
}

/// Everything needed to move shared memory from one driver to another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedSnapshot {
    pub buckets: BTreeMap<SharedKey, Map<String, Value>>,
    pub locks: Vec<LockSnapshot>,
}

#[derive(Debug, thiserror::Error)]
pub enum SharedError {
    #[error("lock {0} is not held")]
    NotHeld(SharedKey),
    #[error("shared memory is gone")]
    Closed,
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// Outcome of [`SharedStore::acquire`].
#[derive(Debug)]
pub enum Acquire<W> {
    /// The lock was free and now belongs to this waiter.
    Granted(W),
    /// The waiter is parked until a release hands the lock over.
    Queued,
}

#[derive(Debug)]
struct LockState<W> {
    held: bool,
    waiters: VecDeque<W>,
}

impl<W> LockState<W> {
    /// Give the lock to the first waiter `wake` accepts, or free it.
    fn hand_off<F>(&mut self, id: &SharedKey, wake: &mut F)
    where
        F: FnMut(W) -> bool,
    {
        while let Some(waiter) = self.waiters.pop_front() {
            if wake(waiter) {
                self.held = true;
                tracing::trace!(lock = %id, "Lock handed to next waiter");
                return;
            }
            tracing::debug!(lock = %id, "Skipping dead lock waiter");
        }
        self.held = false;
    }
}

impl<W> Default for LockState<W> {
    fn default() -> Self {
        Self {
            held: false,
            waiters: VecDeque::new(),
        }
    }
}

/// Authoritative bucket and lock state, generic over the waiter handle.
#[derive(Debug)]
pub struct SharedStore<W> {
    buckets: BTreeMap<SharedKey, Map<String, Value>>,
    locks: BTreeMap<SharedKey, LockState<W>>,
}

impl<W> Default for SharedStore<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> SharedStore<W> {
    pub fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
            locks: BTreeMap::new(),
        }
    }

    /// Read a bucket, creating it empty on first access.
    pub fn get(&mut self, key: &SharedKey) -> Bucket {
        let is_new = !self.buckets.contains_key(key);
        let values = self.buckets.entry(key.clone()).or_default().clone();
        Bucket {
            key: key.clone(),
            values,
            is_new,
        }
    }

    /// Write one value, returning the previous one.
    pub fn set(&mut self, bucket: &SharedKey, key: String, value: Value) -> Option<Value> {
        self.buckets
            .entry(bucket.clone())
            .or_default()
            .insert(key, value)
    }

    /// Remove a whole bucket. The next `get` recreates it with `is_new` set.
    pub fn delete(&mut self, key: &SharedKey) -> bool {
        self.buckets.remove(key).is_some()
    }

    pub fn list(&self) -> Vec<SharedKey> {
        self.buckets.keys().cloned().collect()
    }

    pub fn export_buckets(&self) -> BTreeMap<SharedKey, Map<String, Value>> {
        self.buckets.clone()
    }

    /// Replace the named buckets wholesale; others are left alone.
    pub fn import_buckets(&mut self, buckets: BTreeMap<SharedKey, Map<String, Value>>) {
        self.buckets.extend(buckets);
    }

    pub fn acquire(&mut self, id: &SharedKey, waiter: W) -> Acquire<W> {
        let lock = self.locks.entry(id.clone()).or_default();
        if lock.held {
            lock.waiters.push_back(waiter);
            Acquire::Queued
        } else {
            lock.held = true;
            Acquire::Granted(waiter)
        }
    }

    /// Release a held lock, handing it to the first waiter `wake` accepts.
    ///
    /// `wake` returns `false` for a waiter that has gone away; it is dropped and the
    /// next one is tried. With no live waiter left the lock becomes free.
    pub fn release<F>(&mut self, id: &SharedKey, mut wake: F) -> Result<(), SharedError>
    where
        F: FnMut(W) -> bool,
    {
        match self.locks.get_mut(id) {
            Some(lock) if lock.held => {
                lock.hand_off(id, &mut wake);
                Ok(())
            }
            _ => Err(SharedError::NotHeld(id.clone())),
        }
    }

    pub fn status(&self, id: &SharedKey) -> LockStatus {
        self.locks
            .get(id)
            .map(|lock| LockStatus {
                held: lock.held,
                waiters: lock.waiters.len(),
            })
            .unwrap_or(LockStatus {
                held: false,
                waiters: 0,
            })
    }

    pub fn export_locks(&self) -> Vec<LockSnapshot> {
        self.locks
            .iter()
            .map(|(id, lock)| LockSnapshot {
                id: id.clone(),
                held: lock.held,
            })
            .collect()
    }

    /// Set lock states from a snapshot. Existing waiters stay queued behind an
    /// imported held lock; an imported free lock goes to its first live waiter.
    pub fn import_locks<F>(&mut self, locks: Vec<LockSnapshot>, mut wake: F)
    where
        F: FnMut(W) -> bool,
    {
        for snapshot in locks {
            let lock = self.locks.entry(snapshot.id.clone()).or_default();
            if snapshot.held {
                lock.held = true;
            } else {
                lock.hand_off(&snapshot.id, &mut wake);
            }
        }
    }

    /// Drop lock waiters whose caller is gone.
    pub fn retain_waiters<F>(&mut self, mut keep: F)
    where
        F: FnMut(&W) -> bool,
    {
        for lock in self.locks.values_mut() {
            lock.waiters.retain(&mut keep);
        }
    }

    pub fn export(&self) -> SharedSnapshot {
        SharedSnapshot {
            buckets: self.export_buckets(),
            locks: self.export_locks(),
        }
    }

    pub fn import<F>(&mut self, snapshot: SharedSnapshot, wake: F)
    where
        F: FnMut(W) -> bool,
    {
        self.import_buckets(snapshot.buckets);
        self.import_locks(snapshot.locks, wake);
    }
}
