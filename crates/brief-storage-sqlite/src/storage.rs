use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use brief_core::{ArtifactKind, RefreshRecord};
use brief_storage::{ArtifactStore, Ledger, RefreshLease, StorageError, StorageResult};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path).with_context(|| format!("open sqlite db {}", db_path.display()))?;
        // several processes may share one cache database
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql).context("apply schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Ledger for SqliteStorage {
    fn append(&self, record: RefreshRecord) -> StorageResult<()> {
        let conn = self.conn();
        conn.execute("INSERT INTO refresh_ledger(refreshed_at) VALUES (?1)", params![record.timestamp_unix])
            .context("append refresh_ledger")?;
        Ok(())
    }

    fn last_timestamp(&self) -> StorageResult<Option<i64>> {
        let conn = self.conn();
        let ts = conn
            .query_row("SELECT refreshed_at FROM refresh_ledger ORDER BY id DESC LIMIT 1", [], |r| r.get(0))
            .optional()
            .context("read refresh_ledger")?;
        Ok(ts)
    }

    fn history(&self) -> StorageResult<Vec<RefreshRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT refreshed_at FROM refresh_ledger ORDER BY id ASC")
            .context("prepare history")?;
        let rows = stmt
            .query_map([], |r| Ok(RefreshRecord { timestamp_unix: r.get(0)? }))
            .context("query history")?;
        let mut out = vec![];
        for row in rows {
            out.push(row.context("decode history row")?);
        }
        Ok(out)
    }
}

impl ArtifactStore for SqliteStorage {
    fn write(&self, kind: ArtifactKind, payload: &str) -> StorageResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO artifacts(kind, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(kind) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            params![kind.as_str(), payload, now_unix()],
        )
        .with_context(|| format!("upsert {kind} artifact"))?;
        debug!("stored {} ({} bytes)", kind, payload.len());
        Ok(())
    }

    fn read(&self, kind: ArtifactKind) -> StorageResult<String> {
        let conn = self.conn();
        let payload: Option<String> = conn
            .query_row("SELECT payload FROM artifacts WHERE kind = ?1", params![kind.as_str()], |r| r.get(0))
            .optional()
            .with_context(|| format!("read {kind} artifact"))?;
        payload.ok_or(StorageError::NotFound(kind))
    }
}

impl RefreshLease for SqliteStorage {
    fn try_acquire(&self, holder: &str, now_unix: i64, ttl_secs: i64) -> StorageResult<bool> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction().context("begin lease transaction")?;
        tx.execute(
            "DELETE FROM refresh_lease WHERE expires_at <= ?1 OR holder = ?2",
            params![now_unix, holder],
        )
        .context("clear stale lease")?;
        // primary key check keeps this to one holder
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO refresh_lease(id, holder, expires_at) VALUES (1, ?1, ?2)",
                params![holder, now_unix + ttl_secs],
            )
            .context("insert lease")?;
        tx.commit().context("commit lease")?;
        Ok(inserted == 1)
    }

    fn release(&self, holder: &str) -> StorageResult<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM refresh_lease WHERE holder = ?1", params![holder])
            .context("release lease")?;
        Ok(())
    }
}

pub fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let dur = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    dur.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sqlite_open_and_migrate() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("brief.db");
        let _ = SqliteStorage::open(&db_path).unwrap();
        // reopening must not fail on existing tables
        let _ = SqliteStorage::open(&db_path).unwrap();
    }

    #[test]
    fn ledger_is_append_only_and_durable() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("brief.db");
        {
            let store = SqliteStorage::open(&db_path).unwrap();
            assert_eq!(store.last_timestamp().unwrap(), None);
            store.append(RefreshRecord { timestamp_unix: 10 }).unwrap();
            store.append(RefreshRecord { timestamp_unix: 20 }).unwrap();
        }
        let store = SqliteStorage::open(&db_path).unwrap();
        assert_eq!(store.last_timestamp().unwrap(), Some(20));
        let history: Vec<i64> = store.history().unwrap().iter().map(|r| r.timestamp_unix).collect();
        assert_eq!(history, vec![10, 20]);

        // after a clock rollback the newest row wins, not the largest value
        store.append(RefreshRecord { timestamp_unix: 15 }).unwrap();
        assert_eq!(store.last_timestamp().unwrap(), Some(15));
    }

    #[test]
    fn artifacts_upsert_per_kind() {
        let dir = tempdir().unwrap();
        let store = SqliteStorage::open(&dir.path().join("brief.db")).unwrap();
        assert!(store.read(ArtifactKind::Summary).unwrap_err().is_not_found());
        store.write(ArtifactKind::Summary, "X").unwrap();
        store.write(ArtifactKind::Sentiment, "positive").unwrap();
        store.write(ArtifactKind::Summary, "Y").unwrap();
        assert_eq!(store.read(ArtifactKind::Summary).unwrap(), "Y");
        assert_eq!(store.read(ArtifactKind::Sentiment).unwrap(), "positive");
    }

    #[test]
    fn lease_is_exclusive_across_connections() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("brief.db");
        let a = SqliteStorage::open(&db_path).unwrap();
        let b = SqliteStorage::open(&db_path).unwrap();

        assert!(a.try_acquire("w1", 1_000, 60).unwrap());
        assert!(!b.try_acquire("w2", 1_030, 60).unwrap());
        a.release("w1").unwrap();
        assert!(b.try_acquire("w2", 1_031, 60).unwrap());
        // expired leases are reclaimed
        assert!(a.try_acquire("w1", 1_200, 60).unwrap());
    }
}
