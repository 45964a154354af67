use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use brief_artifacts::FsCache;
use brief_core::{remaining, Digest, FreshnessState, RefreshRecord, StorageBackend};
use brief_storage::StorageError;
use brief_storage_sqlite::SqliteStorage;
use tracing::debug;

use crate::orchestrator::{Orchestrator, RefreshError, RefreshPolicy, RefreshReport};
use crate::producer::{CommandProducer, Producer};
use crate::{util::now_unix, Config};

pub struct Runner {
    pub repo_root: PathBuf,
    pub cfg: Config,
    pub orchestrator: Orchestrator,
}

/// Read-only view of the cache for `brief status`.
#[derive(Clone, Debug)]
pub struct CacheStatus {
    pub now_unix: i64,
    pub last_refresh_unix: Option<i64>,
    pub refresh_count: usize,
    pub freshness: FreshnessState,
    pub next_due_in: Duration,
    pub fingerprint: Option<String>,
}

impl Runner {
    pub fn open(repo_root: PathBuf) -> Result<Self> {
        let cfg = Self::load_config(&repo_root)?;
        Self::from_config(repo_root, cfg)
    }

    /// Loads `.brief/brief.toml`, writing the defaults on first use.
    pub fn load_config(repo_root: &Path) -> Result<Config> {
        let cfg_path = Config::config_path(repo_root);
        if cfg_path.exists() {
            Config::load_from(&cfg_path)
        } else {
            let cfg = Config::default_for_repo();
            cfg.save_to(&cfg_path)?;
            Ok(cfg)
        }
    }

    pub fn from_config(repo_root: PathBuf, cfg: Config) -> Result<Self> {
        let producer = Arc::new(CommandProducer::new(cfg.producer.command.clone(), cfg.producer.strip_trailing_line));
        Self::with_producer(repo_root, cfg, producer)
    }

    pub fn with_producer(repo_root: PathBuf, cfg: Config, producer: Arc<dyn Producer>) -> Result<Self> {
        let policy = RefreshPolicy { ttl: cfg.ttl(), producer_timeout: cfg.producer_timeout() };
        let orchestrator = match cfg.backend() {
            StorageBackend::Fs => {
                let root = cfg.cache_root(&repo_root);
                debug!("using filesystem cache at {}", root.display());
                Orchestrator::new(Arc::new(FsCache::new(root)), producer, policy)
            }
            StorageBackend::Sqlite => {
                let db_path = cfg.db_path(&repo_root);
                debug!("using sqlite cache at {}", db_path.display());
                Orchestrator::new(Arc::new(SqliteStorage::open(&db_path)?), producer, policy)
            }
        };
        Ok(Self { repo_root, cfg, orchestrator })
    }

    pub fn init_repo(repo_root: &Path) -> Result<()> {
        let cfg = Self::load_config(repo_root)?;
        let root = cfg.cache_root(repo_root);
        std::fs::create_dir_all(&root).with_context(|| format!("create cache dir {}", root.display()))?;
        if cfg.backend() == StorageBackend::Sqlite {
            let _ = SqliteStorage::open(&cfg.db_path(repo_root))?;
        }
        Ok(())
    }

    pub fn refresh(&self) -> Result<RefreshReport, RefreshError> {
        let ctx = self.cfg.query_context(now_unix());
        self.orchestrator.refresh(&ctx)
    }

    /// Stored digest, or `None` before the first successful refresh.
    pub fn show(&self) -> Result<Option<Digest>> {
        match self.orchestrator.read_digest() {
            Ok(d) => Ok(Some(d)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e).context("read cached digest"),
        }
    }

    pub fn status(&self) -> Result<CacheStatus> {
        let now = now_unix();
        let (last, freshness) = self.orchestrator.freshness(now).context("read ledger")?;
        let refresh_count = self.orchestrator.ledger().history().context("read ledger")?.len();
        Ok(CacheStatus {
            now_unix: now,
            last_refresh_unix: last,
            refresh_count,
            freshness,
            next_due_in: remaining(last, now, self.orchestrator.policy().ttl),
            fingerprint: self.show()?.map(|d| d.fingerprint()),
        })
    }

    pub fn history(&self) -> Result<Vec<RefreshRecord>> {
        self.orchestrator.ledger().history().context("read ledger")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{Origin, RefreshOutcome};
    use brief_core::{ProducerError, QueryContext, Sentiment};
    use tempfile::tempdir;

    fn ok_producer() -> Arc<dyn Producer> {
        Arc::new(|ctx: &QueryContext| -> Result<Digest, ProducerError> {
            Ok(Digest::new(format!("digest for {}", ctx.topic), Sentiment::Positive))
        })
    }

    fn failing_producer() -> Arc<dyn Producer> {
        Arc::new(|_: &QueryContext| -> Result<Digest, ProducerError> {
            Err(ProducerError::Network("offline".into()))
        })
    }

    #[test]
    fn open_writes_default_config() {
        let dir = tempdir().unwrap();
        let r = Runner::open(dir.path().to_path_buf()).unwrap();
        assert!(Config::config_path(dir.path()).exists());
        assert_eq!(r.cfg.backend(), StorageBackend::Fs);
        assert_eq!(r.show().unwrap(), None);
    }

    #[test]
    fn refresh_then_read_back_across_reopen_for_each_backend() {
        for backend in [StorageBackend::Fs, StorageBackend::Sqlite] {
            let dir = tempdir().unwrap();
            let mut cfg = Config::default_for_repo();
            cfg.cache.backend = backend;

            let r = Runner::with_producer(dir.path().to_path_buf(), cfg.clone(), ok_producer()).unwrap();
            let report = r.refresh().unwrap();
            assert!(matches!(report.outcome, RefreshOutcome::Done { origin: Origin::Produced, .. }));
            drop(r);

            // a restarted process with a broken producer still serves the stored digest
            let r = Runner::with_producer(dir.path().to_path_buf(), cfg, failing_producer()).unwrap();
            let report = r.refresh().unwrap();
            assert!(!report.producer_invoked, "backend {backend:?}");
            assert_eq!(
                report.outcome.digest(),
                Some(&Digest::new("digest for Golden State Warriors", Sentiment::Positive))
            );
            assert_eq!(r.history().unwrap().len(), 1);
        }
    }

    #[test]
    fn status_reports_age_and_fingerprint() {
        let dir = tempdir().unwrap();
        let r = Runner::with_producer(dir.path().to_path_buf(), Config::default_for_repo(), ok_producer()).unwrap();

        let before = r.status().unwrap();
        assert!(before.freshness.is_first_run);
        assert_eq!(before.fingerprint, None);

        r.refresh().unwrap();
        let after = r.status().unwrap();
        assert!(!after.freshness.should_refresh);
        assert_eq!(after.refresh_count, 1);
        assert!(after.next_due_in > Duration::from_secs(5 * 3600));
        assert_eq!(after.fingerprint, r.show().unwrap().map(|d| d.fingerprint()));
    }

    #[test]
    fn first_run_with_failing_producer_is_unavailable() {
        let dir = tempdir().unwrap();
        let r = Runner::with_producer(dir.path().to_path_buf(), Config::default_for_repo(), failing_producer()).unwrap();
        let report = r.refresh().unwrap();
        assert!(matches!(report.outcome, RefreshOutcome::Unavailable { .. }));
    }

    #[test]
    fn init_creates_cache_dir_and_db() {
        let dir = tempdir().unwrap();
        let mut cfg = Config::default_for_repo();
        cfg.cache.backend = StorageBackend::Sqlite;
        cfg.save_to(&Config::config_path(dir.path())).unwrap();
        Runner::init_repo(dir.path()).unwrap();
        assert!(cfg.db_path(dir.path()).exists());
    }
}
