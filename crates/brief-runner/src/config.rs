use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use brief_core::{QueryContext, StorageBackend, DEFAULT_TTL};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub cache: CacheConfig,
    pub producer: ProducerConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    pub backend: StorageBackend,
    pub root: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProducerConfig {
    pub topic: String,
    /// `{topic}` and `{date}` are substituted.
    pub query_template: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub strip_trailing_line: bool,
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TTL.as_secs()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn default_for_repo() -> Self {
        Self {
            cache: CacheConfig {
                ttl_secs: default_ttl_secs(),
                backend: StorageBackend::Fs,
                root: ".brief/cache".to_string(),
            },
            producer: ProducerConfig {
                topic: "Golden State Warriors".to_string(),
                query_template: "{topic} news as of today {date}".to_string(),
                command: vec![],
                timeout_secs: default_timeout_secs(),
                strip_trailing_line: default_true(),
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| "parse brief.toml")?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn backend(&self) -> StorageBackend {
        self.cache.backend
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn producer_timeout(&self) -> Duration {
        Duration::from_secs(self.producer.timeout_secs.max(1))
    }

    /// Absolute cache directory. `~` is expanded; relative paths hang off the repo root.
    pub fn cache_root(&self, repo_root: &Path) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(&self.cache.root).to_string());
        if expanded.is_absolute() {
            expanded
        } else {
            repo_root.join(expanded)
        }
    }

    pub fn db_path(&self, repo_root: &Path) -> PathBuf {
        self.cache_root(repo_root).join("brief.db")
    }

    pub fn config_path(repo_root: &Path) -> PathBuf {
        repo_root.join(".brief").join("brief.toml")
    }

    /// Builds the producer's input for an invocation running at `now_unix`.
    pub fn query_context(&self, now_unix: i64) -> QueryContext {
        let date = Local
            .timestamp_opt(now_unix, 0)
            .single()
            .map(|t| t.format("%B %d, %Y").to_string())
            .unwrap_or_default();
        let query = self
            .producer
            .query_template
            .replace("{topic}", &self.producer.topic)
            .replace("{date}", &date);
        QueryContext { topic: self.producer.topic.clone(), query, as_of_unix: now_unix }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_round_trips_through_toml() {
        let dir = tempdir().unwrap();
        let path = Config::config_path(dir.path());
        Config::default_for_repo().save_to(&path).unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.ttl(), DEFAULT_TTL);
        assert_eq!(cfg.backend(), StorageBackend::Fs);
        assert!(cfg.producer.strip_trailing_line);
    }

    #[test]
    fn missing_optional_keys_take_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [cache]
            backend = "sqlite"
            root = "/var/cache/brief"

            [producer]
            topic = "Warriors"
            query_template = "{topic}"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.cache.ttl_secs, 21_600);
        assert_eq!(cfg.producer.timeout_secs, 60);
        assert!(cfg.producer.command.is_empty());
        assert!(cfg.producer.strip_trailing_line);
        assert_eq!(cfg.backend(), StorageBackend::Sqlite);
        assert_eq!(cfg.cache_root(Path::new("/repo")), PathBuf::from("/var/cache/brief"));
    }

    #[test]
    fn unknown_backend_fails_to_load() {
        let dir = tempdir().unwrap();
        let path = Config::config_path(dir.path());
        let text = toml::to_string_pretty(&Config::default_for_repo())
            .unwrap()
            .replace("backend = \"fs\"", "backend = \"sqllite\"");
        assert!(text.contains("sqllite"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, text).unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn strip_trailing_line_can_be_disabled() {
        let cfg: Config = toml::from_str(
            r#"
            [cache]
            backend = "fs"
            root = ".brief/cache"

            [producer]
            topic = "Warriors"
            query_template = "{topic}"
            strip_trailing_line = false
            "#,
        )
        .unwrap();
        assert!(!cfg.producer.strip_trailing_line);
    }

    #[test]
    fn relative_cache_root_hangs_off_repo() {
        let cfg = Config::default_for_repo();
        assert_eq!(cfg.cache_root(Path::new("/repo")), PathBuf::from("/repo/.brief/cache"));
        assert_eq!(cfg.db_path(Path::new("/repo")), PathBuf::from("/repo/.brief/cache/brief.db"));
    }

    #[test]
    fn query_renders_topic_and_date() {
        let cfg = Config::default_for_repo();
        let ctx = cfg.query_context(1_700_000_000);
        assert_eq!(ctx.topic, "Golden State Warriors");
        assert!(ctx.query.starts_with("Golden State Warriors news as of today "));
        assert!(ctx.query.ends_with(", 2023"));
        assert_eq!(ctx.as_of_unix, 1_700_000_000);
    }
}
