use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::anyhow;
use brief_core::{ArtifactKind, RefreshRecord};

use crate::traits::{ArtifactStore, Ledger, RefreshLease};
use crate::{StorageError, StorageResult};

/// In-memory storage for tests. Not durable, but good for unit/small scenario tests.
///
/// Write failures can be injected per artifact kind (and for the ledger) to
/// exercise the orchestrator's error paths.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    ledger: Vec<RefreshRecord>,
    artifacts: HashMap<ArtifactKind, String>,
    lease: Option<(String, i64)>,
    failing_writes: HashSet<ArtifactKind>,
    failing_ledger: bool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes_for(&self, kind: ArtifactKind, fail: bool) {
        let mut inner = self.inner.lock().unwrap();
        if fail {
            inner.failing_writes.insert(kind);
        } else {
            inner.failing_writes.remove(&kind);
        }
    }

    pub fn fail_ledger_appends(&self, fail: bool) {
        self.inner.lock().unwrap().failing_ledger = fail;
    }

    pub fn lease_holder(&self) -> Option<String> {
        self.inner.lock().unwrap().lease.as_ref().map(|(h, _)| h.clone())
    }
}

impl Ledger for InMemoryStorage {
    fn append(&self, record: RefreshRecord) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_ledger {
            return Err(anyhow!("ledger is read-only").into());
        }
        inner.ledger.push(record);
        Ok(())
    }

    fn last_timestamp(&self) -> StorageResult<Option<i64>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.ledger.last().map(|r| r.timestamp_unix))
    }

    fn history(&self) -> StorageResult<Vec<RefreshRecord>> {
        Ok(self.inner.lock().unwrap().ledger.clone())
    }
}

impl ArtifactStore for InMemoryStorage {
    fn write(&self, kind: ArtifactKind, payload: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_writes.contains(&kind) {
            return Err(anyhow!("{kind} store is read-only").into());
        }
        inner.artifacts.insert(kind, payload.to_string());
        Ok(())
    }

    fn read(&self, kind: ArtifactKind) -> StorageResult<String> {
        let inner = self.inner.lock().unwrap();
        inner.artifacts.get(&kind).cloned().ok_or(StorageError::NotFound(kind))
    }
}

impl RefreshLease for InMemoryStorage {
    fn try_acquire(&self, holder: &str, now_unix: i64, ttl_secs: i64) -> StorageResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((current, expires_at)) = &inner.lease {
            if current != holder && *expires_at > now_unix {
                return Ok(false);
            }
        }
        inner.lease = Some((holder.to_string(), now_unix + ttl_secs));
        Ok(true)
    }

    fn release(&self, holder: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.lease.as_ref().is_some_and(|(h, _)| h == holder) {
            inner.lease = None;
        }
        Ok(())
    }
}
