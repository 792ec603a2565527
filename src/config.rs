use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::decider::Decider;
use crate::error::ConfigError;

/// Where the signature database lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreLayout {
    /// One database file for the whole build.
    Single { path: Utf8PathBuf },
    /// One database file per directory, named `file_name`, next to the files
    /// it describes.
    PerDirectory { file_name: String },
    /// Nothing is persisted. Useful for tests and dry runs.
    Memory,
}

impl Default for StoreLayout {
    fn default() -> Self {
        StoreLayout::Single {
            path: Utf8PathBuf::from(".kamado.sig"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory of the artifact cache.
    pub dir: Utf8PathBuf,
    /// Only retrieve from the cache, never push.
    #[serde(default)]
    pub readonly: bool,
    /// Log the action of targets retrieved from the cache as if it had run.
    #[serde(default)]
    pub show: bool,
}

/// Build engine configuration.
///
/// Every field has a sensible default, so a configuration file only needs to
/// list what it changes:
///
/// ```json
/// { "jobs": 4, "keep_going": true, "cache": { "dir": "/tmp/kamado-cache" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of tasks executed concurrently. `1` builds sequentially.
    pub jobs: usize,
    /// Continue with unrelated targets after a failure.
    pub keep_going: bool,
    /// Decider used for nodes without their own.
    pub decider: Decider,
    /// Reuse the implicit dependencies recorded at the last build instead of
    /// rescanning, as long as no explicit dependency changed.
    pub implicit_cache: bool,
    pub signatures: StoreLayout,
    pub cache: Option<CacheConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jobs: 1,
            keep_going: false,
            decider: Decider::default(),
            implicit_cache: false,
            signatures: StoreLayout::default(),
            cache: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_owned(), e))
    }

    /// Overrides fields from `KAMADO_*` environment variables.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(jobs) = std::env::var("KAMADO_JOBS") {
            self.jobs = jobs
                .parse()
                .map_err(|_| ConfigError::Env("KAMADO_JOBS", jobs.clone()))?;
        }
        if let Ok(value) = std::env::var("KAMADO_KEEP_GOING") {
            self.keep_going = parse_flag("KAMADO_KEEP_GOING", &value)?;
        }
        if let Ok(dir) = std::env::var("KAMADO_CACHE_DIR") {
            let cache = self.cache.get_or_insert_with(|| CacheConfig {
                dir: Utf8PathBuf::new(),
                readonly: false,
                show: false,
            });
            cache.dir = dir.into();
        }
        if let Ok(value) = std::env::var("KAMADO_CACHE_READONLY")
            && let Some(cache) = self.cache.as_mut()
        {
            cache.readonly = parse_flag("KAMADO_CACHE_READONLY", &value)?;
        }
        Ok(self)
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    pub fn decider(mut self, decider: Decider) -> Self {
        self.decider = decider;
        self
    }

    pub fn implicit_cache(mut self, enabled: bool) -> Self {
        self.implicit_cache = enabled;
        self
    }

    pub fn signatures(mut self, layout: StoreLayout) -> Self {
        self.signatures = layout;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Env(name, value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.jobs, 1);
        assert!(!config.keep_going);
        assert_eq!(config.decider, Decider::ContentTimestamp);
        assert!(config.cache.is_none());
    }

    #[test]
    fn test_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("kamado.json")).unwrap();
        fs::write(
            &path,
            r#"{ "jobs": 4, "decider": "content", "signatures": { "kind": "memory" },
                 "cache": { "dir": "cache", "readonly": true } }"#,
        )
        .unwrap();

        let config = Config::from_json_file(&path).unwrap();
        assert_eq!(config.jobs, 4);
        assert_eq!(config.decider, Decider::Content);
        assert_eq!(config.signatures, StoreLayout::Memory);
        let cache = config.cache.unwrap();
        assert!(cache.readonly);
        assert!(!cache.show);
        assert!(!config.keep_going);
    }

    #[test]
    fn test_broken_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("kamado.json")).unwrap();
        fs::write(&path, "{ jobs: ").unwrap();
        assert!(matches!(
            Config::from_json_file(&path),
            Err(ConfigError::Parse(..))
        ));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("X", "yes").unwrap());
        assert!(!parse_flag("X", "0").unwrap());
        assert!(parse_flag("X", "maybe").is_err());
    }

    #[test]
    fn test_jobs_at_least_one() {
        assert_eq!(Config::new().jobs(0).jobs, 1);
    }
}
