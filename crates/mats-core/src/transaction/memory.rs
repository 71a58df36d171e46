// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory key/value store usable as the external transactional resource.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ExternalResource, ResourceTransaction};
use crate::error::ResourceError;

const NAME: &str = "in-memory-kv";

#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    shared: Arc<KvShared>,
}

#[derive(Default)]
struct KvShared {
    data: Mutex<BTreeMap<String, String>>,
    fail_next_commit: AtomicBool,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value of `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        lock(&self.shared.data).get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        lock(&self.shared.data).clone()
    }

    /// The next commit fails without applying its writes.
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.shared.rollbacks.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for InMemoryKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryKeyValueStore")
            .field("entries", &lock(&self.shared.data).len())
            .finish()
    }
}

impl ExternalResource for InMemoryKeyValueStore {
    fn name(&self) -> &str {
        NAME
    }

    fn begin(&self) -> Result<Box<dyn ResourceTransaction>, ResourceError> {
        Ok(Box::new(KeyValueTransaction {
            shared: self.shared.clone(),
            writes: Mutex::new(BTreeMap::new()),
        }))
    }
}

/// Staged writes; reads see them first, then the committed data.
pub struct KeyValueTransaction {
    shared: Arc<KvShared>,
    writes: Mutex<BTreeMap<String, Option<String>>>,
}

impl KeyValueTransaction {
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.writes).insert(key.into(), Some(value.into()));
    }

    pub fn delete(&self, key: impl Into<String>) {
        lock(&self.writes).insert(key.into(), None);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(staged) = lock(&self.writes).get(key) {
            return staged.clone();
        }
        lock(&self.shared.data).get(key).cloned()
    }
}

impl ResourceTransaction for KeyValueTransaction {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn commit(self: Box<Self>) -> Result<(), ResourceError> {
        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
            return Err(ResourceError::Commit {
                resource: NAME.to_string(),
                details: "injected commit failure".to_string(),
            });
        }
        let writes = std::mem::take(&mut *lock(&self.writes));
        let mut data = lock(&self.shared.data);
        for (key, value) in writes {
            match value {
                Some(value) => data.insert(key, value),
                None => data.remove(&key),
            };
        }
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), ResourceError> {
        self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
