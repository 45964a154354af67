use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use brief_core::{ArtifactKind, RefreshRecord};
use brief_storage::{ArtifactStore, Ledger, RefreshLease, StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::envelope::ArtifactEnvelope;

/// Flat-file cache rooted at one directory:
///
/// ```text
/// <root>/ledger.jsonl          one RefreshRecord per line, append-only
/// <root>/artifacts/<kind>.json ArtifactEnvelope, replaced by atomic rename
/// <root>/refresh.lock          present while a refresh is in flight, installed
///                              whole by hard link so it is never seen empty
/// ```
#[derive(Clone)]
pub struct FsCache {
    pub root: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct LockFile {
    holder: String,
    expires_at_unix: i64,
}

enum LockState {
    Absent,
    Held(LockFile),
    /// Left by another writer or damaged on disk; judged by file age alone.
    Unreadable { age: Duration },
}

impl FsCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join("ledger.jsonl")
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn artifact_path(&self, kind: ArtifactKind) -> PathBuf {
        self.artifact_dir().join(format!("{}.json", kind.as_str()))
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join("refresh.lock")
    }

    fn read_history(&self) -> Result<Vec<RefreshRecord>> {
        let path = self.ledger_path();
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).with_context(|| format!("read ledger {}", path.display())),
        };
        let mut out = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RefreshRecord>(line) {
                Ok(r) => out.push(r),
                // a crash mid-append can leave a torn final line
                Err(e) => warn!("skipping unreadable ledger line {} in {}: {e}", n + 1, path.display()),
            }
        }
        Ok(out)
    }

    fn read_lock(&self) -> Result<LockState> {
        let path = self.lock_path();
        let text = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockState::Absent),
            Err(e) => return Err(e).with_context(|| format!("read lock {}", path.display())),
        };
        if let Ok(lock) = serde_json::from_str(&text) {
            return Ok(LockState::Held(lock));
        }
        let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockState::Absent),
            Err(e) => return Err(e).with_context(|| format!("stat lock {}", path.display())),
        };
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        Ok(LockState::Unreadable { age })
    }

    fn remove_lock(&self) -> Result<()> {
        let path = self.lock_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove lock {}", path.display())),
        }
    }
}

fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    let mut tmp = NamedTempFile::new_in(dir).with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    // dropping the temp file here removes it on failure
    tmp.persist(dest).map_err(|e| e.error).with_context(|| format!("rename into {}", dest.display()))?;
    Ok(())
}

/// True when the file is non-empty and its last byte is not a newline, i.e. a
/// previous append was torn.
fn ends_mid_line(f: &mut File) -> std::io::Result<bool> {
    if f.metadata()?.len() == 0 {
        return Ok(false);
    }
    f.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    f.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

impl Ledger for FsCache {
    fn append(&self, record: RefreshRecord) -> StorageResult<()> {
        fs::create_dir_all(&self.root).with_context(|| format!("create cache root {}", self.root.display()))?;
        let path = self.ledger_path();
        let mut line = serde_json::to_string(&record).context("encode ledger record")?;
        line.push('\n');
        let mut f = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open ledger {}", path.display()))?;
        if ends_mid_line(&mut f).with_context(|| format!("inspect ledger {}", path.display()))? {
            warn!("ledger {} ends in a torn line; starting a new one", path.display());
            line.insert(0, '\n');
        }
        f.write_all(line.as_bytes()).with_context(|| format!("append ledger {}", path.display()))?;
        f.sync_data().with_context(|| format!("sync ledger {}", path.display()))?;
        Ok(())
    }

    fn last_timestamp(&self) -> StorageResult<Option<i64>> {
        Ok(self.read_history()?.last().map(|r| r.timestamp_unix))
    }

    fn history(&self) -> StorageResult<Vec<RefreshRecord>> {
        Ok(self.read_history()?)
    }
}

impl ArtifactStore for FsCache {
    fn write(&self, kind: ArtifactKind, payload: &str) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(&ArtifactEnvelope::seal(kind, payload))
            .with_context(|| format!("encode {kind} envelope"))?;
        write_atomic(&self.artifact_dir(), &self.artifact_path(kind), &bytes)?;
        debug!("stored {} ({} bytes)", kind, payload.len());
        Ok(())
    }

    fn read(&self, kind: ArtifactKind) -> StorageResult<String> {
        let path = self.artifact_path(kind);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StorageError::NotFound(kind)),
            Err(e) => return Err(anyhow::Error::new(e).context(format!("read {}", path.display())).into()),
        };
        let env: ArtifactEnvelope =
            serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
        Ok(env.open(kind)?)
    }
}

impl RefreshLease for FsCache {
    /// The lock body is written to a temp file and linked into place, so a
    /// reader sees either no lock or a complete one. Two processes reclaiming
    /// the same expired lock at the same instant can both succeed; the SQLite
    /// backend is strict.
    fn try_acquire(&self, holder: &str, now_unix: i64, ttl_secs: i64) -> StorageResult<bool> {
        fs::create_dir_all(&self.root).with_context(|| format!("create cache root {}", self.root.display()))?;
        let path = self.lock_path();
        let lock = LockFile { holder: holder.to_string(), expires_at_unix: now_unix + ttl_secs };
        let body = serde_json::to_vec(&lock).context("encode lock")?;
        for _ in 0..2 {
            let mut tmp = NamedTempFile::new_in(&self.root)
                .with_context(|| format!("create temp lock in {}", self.root.display()))?;
            tmp.write_all(&body).with_context(|| format!("write temp lock for {}", path.display()))?;
            tmp.as_file().sync_all().with_context(|| format!("sync temp lock for {}", path.display()))?;
            let err = match tmp.persist_noclobber(&path) {
                Ok(_) => return Ok(true),
                Err(e) => e.error,
            };
            if err.kind() != ErrorKind::AlreadyExists {
                return Err(anyhow::Error::new(err).context(format!("install lock {}", path.display())).into());
            }
            let live = match self.read_lock()? {
                LockState::Absent => false,
                LockState::Held(l) => l.holder != holder && l.expires_at_unix > now_unix,
                LockState::Unreadable { age } => age < Duration::from_secs(ttl_secs.max(0) as u64),
            };
            if live {
                return Ok(false);
            }
            debug!("reclaiming refresh lock {}", path.display());
            self.remove_lock()?;
        }
        Ok(false)
    }

    fn release(&self, holder: &str) -> StorageResult<()> {
        if let LockState::Held(l) = self.read_lock()? {
            if l.holder == holder {
                self.remove_lock()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_ledger_reads_as_empty() {
        let dir = tempdir().unwrap();
        let cache = FsCache::new(dir.path().join("never-created"));
        assert_eq!(cache.last_timestamp().unwrap(), None);
        assert!(cache.history().unwrap().is_empty());
    }

    #[test]
    fn ledger_appends_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let cache = FsCache::new(dir.path().to_path_buf());
        cache.append(RefreshRecord { timestamp_unix: 100 }).unwrap();
        cache.append(RefreshRecord { timestamp_unix: 200 }).unwrap();

        let reopened = FsCache::new(dir.path().to_path_buf());
        assert_eq!(reopened.last_timestamp().unwrap(), Some(200));
        assert_eq!(reopened.history().unwrap().len(), 2);
    }

    #[test]
    fn torn_ledger_line_is_skipped() {
        let dir = tempdir().unwrap();
        let cache = FsCache::new(dir.path().to_path_buf());
        cache.append(RefreshRecord { timestamp_unix: 100 }).unwrap();
        let mut f = OpenOptions::new().append(true).open(cache.ledger_path()).unwrap();
        write!(f, "{{\"timestamp_un").unwrap();
        assert_eq!(cache.last_timestamp().unwrap(), Some(100));

        cache.append(RefreshRecord { timestamp_unix: 200 }).unwrap();
        assert_eq!(cache.last_timestamp().unwrap(), Some(200));
        let stamps: Vec<i64> = cache.history().unwrap().iter().map(|r| r.timestamp_unix).collect();
        assert_eq!(stamps, vec![100, 200]);
    }

    #[test]
    fn artifact_round_trip_and_overwrite() {
        let dir = tempdir().unwrap();
        let cache = FsCache::new(dir.path().to_path_buf());
        cache.write(ArtifactKind::Summary, "first").unwrap();
        cache.write(ArtifactKind::Summary, "second\nline").unwrap();
        assert_eq!(cache.read(ArtifactKind::Summary).unwrap(), "second\nline");
        assert!(cache.read(ArtifactKind::Sentiment).unwrap_err().is_not_found());
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let cache = FsCache::new(dir.path().to_path_buf());
        cache.write(ArtifactKind::Summary, "X").unwrap();
        cache.write(ArtifactKind::Sentiment, "positive").unwrap();
        let names: Vec<_> = fs::read_dir(cache.artifact_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"summary.json".to_string()));
    }

    #[test]
    fn corrupt_artifact_is_io_failure_not_not_found() {
        let dir = tempdir().unwrap();
        let cache = FsCache::new(dir.path().to_path_buf());
        cache.write(ArtifactKind::Summary, "X").unwrap();
        fs::write(cache.artifact_path(ArtifactKind::Summary), b"{\"kind\":\"summary\",\"sha256\":\"00\",\"payload\":\"Y\"}").unwrap();
        let err = cache.read(ArtifactKind::Summary).unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[test]
    fn lock_is_exclusive_and_reclaimed_after_expiry() {
        let dir = tempdir().unwrap();
        let cache = FsCache::new(dir.path().to_path_buf());
        assert!(cache.try_acquire("a", 1_000, 60).unwrap());
        assert!(!cache.try_acquire("b", 1_010, 60).unwrap());
        assert!(cache.try_acquire("b", 1_061, 60).unwrap());
        cache.release("a").unwrap();
        assert!(cache.lock_path().exists());
        cache.release("b").unwrap();
        assert!(!cache.lock_path().exists());
    }

    #[test]
    fn lock_body_is_complete_and_no_temp_files_remain() {
        let dir = tempdir().unwrap();
        let cache = FsCache::new(dir.path().to_path_buf());
        assert!(cache.try_acquire("a", 1_000, 60).unwrap());
        assert!(!cache.try_acquire("b", 1_000, 60).unwrap());
        let lock: LockFile = serde_json::from_slice(&fs::read(cache.lock_path()).unwrap()).unwrap();
        assert_eq!(lock.holder, "a");
        assert_eq!(lock.expires_at_unix, 1_060);
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["refresh.lock".to_string()]);
    }

    #[test]
    fn unreadable_recent_lock_is_treated_as_held() {
        let dir = tempdir().unwrap();
        let cache = FsCache::new(dir.path().to_path_buf());
        fs::write(cache.lock_path(), b"").unwrap();
        assert!(!cache.try_acquire("b", 1_000, 60).unwrap());
        assert!(cache.lock_path().exists());
        // release by someone else must not remove it either
        cache.release("b").unwrap();
        assert!(cache.lock_path().exists());
    }

    #[test]
    fn unreadable_old_lock_is_reclaimed() {
        let dir = tempdir().unwrap();
        let cache = FsCache::new(dir.path().to_path_buf());
        fs::write(cache.lock_path(), b"{\"holder\":").unwrap();
        let old = SystemTime::now() - Duration::from_secs(600);
        File::options().write(true).open(cache.lock_path()).unwrap().set_modified(old).unwrap();
        assert!(cache.try_acquire("b", 1_000, 60).unwrap());
        cache.release("b").unwrap();
        assert!(!cache.lock_path().exists());
    }

    #[test]
    fn failed_write_leaves_other_kind_intact() {
        let dir = tempdir().unwrap();
        let cache = FsCache::new(dir.path().to_path_buf());
        cache.write(ArtifactKind::Summary, "old").unwrap();
        cache.write(ArtifactKind::Sentiment, "neutral").unwrap();

        // a directory squatting on the summary path makes the rename fail
        let summary_path = cache.artifact_path(ArtifactKind::Summary);
        fs::remove_file(&summary_path).unwrap();
        fs::create_dir(&summary_path).unwrap();
        fs::write(summary_path.join("keep"), b"x").unwrap();

        assert!(matches!(cache.write(ArtifactKind::Summary, "new").unwrap_err(), StorageError::Io(_)));
        assert_eq!(cache.read(ArtifactKind::Sentiment).unwrap(), "neutral");

        cache.write(ArtifactKind::Sentiment, "positive").unwrap();
        assert_eq!(cache.read(ArtifactKind::Sentiment).unwrap(), "positive");
        assert!(matches!(cache.read(ArtifactKind::Summary).unwrap_err(), StorageError::Io(_)));

        let mut names: Vec<_> = fs::read_dir(cache.artifact_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["sentiment.json".to_string(), "summary.json".to_string()]);
    }
}
