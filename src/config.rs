//! Cache configuration, loaded from YAML.  Option names and defaults
//! follow the classic `cgitrc` cache settings.
use serde::Deserialize;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use crate::process::SlotCache;
use crate::process::DEFAULT_LOCK_STALE_AFTER;
use crate::process::DEFAULT_SWEEP_PERIOD;
use crate::request::RequestClass;
use crate::Ttl;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file empty")]
    Empty,

    #[error("failed to parse config YAML: {0}")]
    Parsing(#[from] serde_yaml::Error),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Directory holding the slot files.
    pub cache_root: PathBuf,

    /// Number of slots.  Zero or negative disables caching.
    pub cache_size: i64,

    /// TTL, in minutes, of pages that don't name a repository.  For
    /// all TTLs, negative caches forever and zero disables caching.
    pub cache_root_ttl: i64,

    /// TTL of repository pages without a more specific setting.
    pub cache_repo_ttl: i64,

    /// TTL of `about` pages.
    pub cache_about_ttl: i64,

    /// TTL of `snapshot` downloads.
    pub cache_snapshot_ttl: i64,

    /// TTL of pages pinned to an object id, whose content can't change.
    pub cache_static_ttl: i64,

    /// TTL of pages that name a branch or other symbolic ref.
    pub cache_dynamic_ttl: i64,

    /// TTL of cached repository scan results.  Accepted so existing
    /// cgitrc cache settings carry over unchanged; this crate does not
    /// cache scans itself.
    pub cache_scanrc_ttl: i64,

    /// Unlocked lock files older than this are swept as orphans.
    #[serde(with = "humantime_serde")]
    pub lock_stale_after: Duration,

    /// Sweep orphaned lock files roughly once every this many cache
    /// fills.  Zero never sweeps.
    pub sweep_period: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_root: PathBuf::from("/var/cache/cgit"),
            cache_size: 0,
            cache_root_ttl: 5,
            cache_repo_ttl: 5,
            cache_about_ttl: 15,
            cache_snapshot_ttl: 5,
            cache_static_ttl: -1,
            cache_dynamic_ttl: 5,
            cache_scanrc_ttl: 15,
            lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
            sweep_period: DEFAULT_SWEEP_PERIOD,
        }
    }
}

impl Config {
    /// Loads the config file at `path`, or returns the defaults.
    pub fn get(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_reader(fs::File::open(path)?),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl Read) -> Result<Self, ConfigError> {
        let mut config = String::new();
        reader.read_to_string(&mut config)?;

        // serde_yaml would happily turn an empty file into defaults,
        // which hides typos in the path.
        if config.trim().is_empty() {
            return Err(ConfigError::Empty);
        }

        Ok(serde_yaml::from_str(&config)?)
    }

    /// Returns the slot table size; negative sizes disable caching.
    pub fn table_size(&self) -> usize {
        self.cache_size.max(0) as usize
    }

    /// Returns the TTL for a request of class `class`.
    pub fn ttl_for(&self, class: &RequestClass) -> Ttl {
        let minutes = match (&class.repo, class.page.as_deref()) {
            (None, _) => self.cache_root_ttl,
            (Some(_), None) => self.cache_repo_ttl,
            (Some(_), Some("about")) => self.cache_about_ttl,
            (Some(_), Some("snapshot")) => self.cache_snapshot_ttl,
            (Some(_), Some(_)) if class.has_oid => self.cache_static_ttl,
            (Some(_), Some(_)) if class.has_symref => self.cache_dynamic_ttl,
            (Some(_), Some(_)) => self.cache_repo_ttl,
        };

        Ttl::from(minutes)
    }

    /// Returns the cache described by this configuration.
    pub fn slot_cache(&self) -> SlotCache {
        SlotCache::new(&self.cache_root, self.table_size())
            .with_sweeps(self.lock_stale_after, self.sweep_period)
    }
}

#[test]
fn test_defaults() {
    let config = Config::get(None).expect("defaults must load");

    assert_eq!(config, Config::default());
    assert_eq!(config.table_size(), 0);
    assert_eq!(config.cache_scanrc_ttl, 15);
    assert_eq!(config.slot_cache().table_size(), 0);
}

#[test]
fn test_parse() {
    let yaml = r#"
cache-root: /tmp/slots
cache-size: 1000
cache-static-ttl: 60
lock-stale-after: 10m
"#;
    let config = Config::from_reader(yaml.as_bytes()).expect("config must parse");

    assert_eq!(config.cache_root, PathBuf::from("/tmp/slots"));
    assert_eq!(config.table_size(), 1000);
    assert_eq!(config.cache_static_ttl, 60);
    assert_eq!(config.lock_stale_after, Duration::from_secs(600));
    // Unspecified fields keep their defaults.
    assert_eq!(config.cache_about_ttl, 15);
    assert_eq!(config.sweep_period, DEFAULT_SWEEP_PERIOD);

    let cache = config.slot_cache();
    assert_eq!(cache.cache_root(), Some(Path::new("/tmp/slots")));
    assert_eq!(cache.table_size(), 1000);
}

#[test]
fn test_reject() {
    assert!(matches!(
        Config::from_reader(" \n".as_bytes()),
        Err(ConfigError::Empty)
    ));
    assert!(matches!(
        Config::from_reader("cache-sise: 10\n".as_bytes()),
        Err(ConfigError::Parsing(_))
    ));
    assert!(matches!(
        Config::get(Some(Path::new("/nonexistent/slot-cache.yml"))),
        Err(ConfigError::Io(_))
    ));
}

#[test]
fn test_negative_size() {
    let config = Config::from_reader("cache-size: -5\n".as_bytes()).expect("config must parse");

    assert_eq!(config.table_size(), 0);
}

#[test]
fn test_ttl_for() {
    let config = Config {
        cache_root_ttl: 1,
        cache_repo_ttl: 2,
        cache_about_ttl: 3,
        cache_snapshot_ttl: 4,
        cache_static_ttl: -1,
        cache_dynamic_ttl: 6,
        ..Config::default()
    };
    let class = |repo: Option<&str>, page: Option<&str>, has_oid, has_symref| RequestClass {
        repo: repo.map(String::from),
        page: page.map(String::from),
        has_oid,
        has_symref,
    };

    let cases = [
        (class(None, Some("about"), true, true), Ttl::Minutes(1)),
        (class(Some("git"), None, true, true), Ttl::Minutes(2)),
        (class(Some("git"), Some("about"), true, true), Ttl::Minutes(3)),
        (class(Some("git"), Some("snapshot"), true, false), Ttl::Minutes(4)),
        (class(Some("git"), Some("tree"), true, true), Ttl::Forever),
        (class(Some("git"), Some("log"), false, true), Ttl::Minutes(6)),
        (class(Some("git"), Some("log"), false, false), Ttl::Minutes(2)),
    ];

    for (class, expected) in cases.iter() {
        assert_eq!(config.ttl_for(class), *expected, "{:?}", class);
    }
}
