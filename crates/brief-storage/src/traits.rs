use brief_core::{ArtifactKind, RefreshRecord};

use crate::StorageResult;

/// Append-only record of successful refreshes.
pub trait Ledger: Send + Sync {
    fn append(&self, record: RefreshRecord) -> StorageResult<()>;

    /// Most recently appended entry, by insertion order rather than value;
    /// `None` when the ledger is empty or does not exist yet.
    fn last_timestamp(&self) -> StorageResult<Option<i64>>;

    /// Full audit trail, oldest first.
    fn history(&self) -> StorageResult<Vec<RefreshRecord>>;
}

/// Durable current value per artifact kind.
pub trait ArtifactStore: Send + Sync {
    /// Replaces the value for `kind` atomically; readers never see a partial payload.
    fn write(&self, kind: ArtifactKind, payload: &str) -> StorageResult<()>;

    /// `StorageError::NotFound` when nothing was ever written for `kind`.
    fn read(&self, kind: ArtifactKind) -> StorageResult<String>;
}

/// Cross-process single-flight gate around producing.
pub trait RefreshLease: Send + Sync {
    /// Returns true if `holder` now owns the lease. Expired leases are reclaimed.
    fn try_acquire(&self, holder: &str, now_unix: i64, ttl_secs: i64) -> StorageResult<bool>;
    fn release(&self, holder: &str) -> StorageResult<()>;
}
