//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file. Command line flags override
//! whatever the file says.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dicom_fuse::cache::{ContentCacheConfig, MetaTtls};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn dicom_fuse_runtime_dir() -> Option<PathBuf> {
    let runtime_dir = dirs::runtime_dir();
    if let Some(path) = runtime_dir {
        return Some(path.join("dicom-fuse"));
    }

    let home_dir = dirs::home_dir();
    if let Some(path) = home_dir {
        return Some(path.join(".local").join("share").join("dicom-fuse"));
    }

    None
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

const fn default_true() -> bool {
    true
}

const fn default_attr_ttl_secs() -> u64 {
    60
}

const fn default_list_ttl_secs() -> u64 {
    300
}

const fn default_capacity() -> usize {
    10_000
}

const fn default_max_transfers() -> usize {
    5
}

const fn default_request_timeout_secs() -> u64 {
    60
}

fn default_cache_path() -> PathBuf {
    dicom_fuse_runtime_dir().map_or_else(
        || PathBuf::from("/tmp/dicom-fuse/cache"),
        |rd| rd.join("cache"),
    )
}

/// How the mount is going to be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountProfile {
    /// A mount for people and their tools. Uses the configured TTLs and capacity.
    #[default]
    Interactive,
    /// A mount for repeatable measurements: nothing expires and nothing is evicted.
    Benchmark,
}

/// The cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// How long attributes stay fresh, in seconds.
    #[serde(default = "default_attr_ttl_secs")]
    pub attr_ttl_secs: u64,

    /// How long directory listings stay fresh, in seconds.
    #[serde(default = "default_list_ttl_secs")]
    pub list_ttl_secs: u64,

    /// The maximum number of instances kept on local disk.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// The path to the cache directory.
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            attr_ttl_secs: default_attr_ttl_secs(),
            list_ttl_secs: default_list_ttl_secs(),
            capacity: default_capacity(),
            path: default_cache_path(),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Base URL of the DICOM store.
    #[serde(default)]
    pub dataset_addr: String,

    /// The mount point for the filesystem.
    #[serde(default)]
    pub mount_point: PathBuf,

    /// A file holding the bearer token. Without one, `DICOM_FUSE_TOKEN` is used.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Whether `rm` and `rmdir` are passed on to the store.
    #[serde(default = "default_true")]
    pub enable_deletion: bool,

    #[serde(default)]
    pub cache: CacheConfig,

    /// The maximum number of concurrent transfers.
    #[serde(default = "default_max_transfers")]
    pub max_transfers: usize,

    /// Per-request timeout, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// The user to mount the filesystem as. If not specified, runs as the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// The group to mount the filesystem as. If not specified, runs as the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,

    #[serde(default)]
    pub profile: MountProfile,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset_addr: String::new(),
            mount_point: PathBuf::new(),
            key_file: None,
            enable_deletion: true,
            cache: CacheConfig::default(),
            max_transfers: default_max_transfers(),
            request_timeout_secs: default_request_timeout_secs(),
            uid: current_uid(),
            gid: current_gid(),
            profile: MountProfile::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.dataset_addr.is_empty() {
            errors.push("No dataset address given (--dataset-addr).".to_owned());
        } else if !(self.dataset_addr.starts_with("https://")
            || self.dataset_addr.starts_with("http://"))
        {
            errors.push(format!(
                "Dataset address '{}' is not an http(s) URL.",
                self.dataset_addr
            ));
        }

        if self.mount_point.as_os_str().is_empty() {
            errors.push("No mount point given (--mount-path).".to_owned());
        }

        if self.cache.attr_ttl_secs == 0 {
            errors.push("Attribute TTL must be greater than zero.".to_owned());
        }
        if self.cache.list_ttl_secs == 0 {
            errors.push("Listing TTL must be greater than zero.".to_owned());
        }
        if self.cache.capacity == 0 {
            errors.push("Cache size must be greater than zero.".to_owned());
        }
        if self.max_transfers == 0 {
            errors.push("Max transfers must be greater than zero.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// TTLs for the metadata cache. The benchmark profile never expires anything.
    pub fn meta_ttls(&self) -> MetaTtls {
        match self.profile {
            MountProfile::Interactive => MetaTtls {
                attributes: Duration::from_secs(self.cache.attr_ttl_secs),
                listings: Duration::from_secs(self.cache.list_ttl_secs),
            },
            MountProfile::Benchmark => MetaTtls {
                attributes: Duration::MAX,
                listings: Duration::MAX,
            },
        }
    }

    /// Settings for the content cache. The benchmark profile never evicts.
    pub fn content_cache(&self) -> ContentCacheConfig {
        ContentCacheConfig {
            root: self.cache.path.clone(),
            capacity: match self.profile {
                MountProfile::Interactive => self.cache.capacity,
                MountProfile::Benchmark => usize::MAX,
            },
            max_transfers: self.max_transfers,
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("dicom-fuse").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("dicom-fuse").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/dicom-fuse/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads config, or the defaults if there is no config file.
    /// Errors if a config file exists but is malformed.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match Self::load(external_config_path) {
            Some(res) => {
                let config = res?;
                debug!("Loaded configuration successfully.");
                Ok(config)
            }
            None => {
                debug!("No configuration file found, using defaults.");
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn valid() -> Config {
        Config {
            dataset_addr: "https://healthcare.example/v1/projects/p/locations/l/datasets/d/\
                           dicomStores/s"
                .to_owned(),
            mount_point: PathBuf::from("/mnt/dicom"),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert!(config.enable_deletion);
        assert_eq!(config.cache.attr_ttl_secs, 60);
        assert_eq!(config.cache.list_ttl_secs, 300);
        assert_eq!(config.cache.capacity, 10_000);
        assert_eq!(config.max_transfers, 5);
        assert_eq!(config.profile, MountProfile::Interactive);
    }

    #[test]
    fn validate_reports_every_problem() {
        let config = Config {
            dataset_addr: "ftp://nope".to_owned(),
            max_transfers: 0,
            cache: CacheConfig {
                attr_ttl_secs: 0,
                ..CacheConfig::default()
            },
            ..Config::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4, "{errors:?}");
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn parses_kebab_case_toml() {
        let config: Config = toml::from_str(
            r#"
            dataset-addr = "https://store.example"
            mount-point = "/mnt/x"
            enable-deletion = false
            profile = "benchmark"

            [cache]
            attr-ttl-secs = 5
            capacity = 2
            "#,
        )
        .unwrap();
        assert!(!config.enable_deletion);
        assert_eq!(config.cache.attr_ttl_secs, 5);
        assert_eq!(config.cache.list_ttl_secs, 300);
        assert_eq!(config.cache.capacity, 2);
        assert_eq!(config.profile, MountProfile::Benchmark);
    }

    #[test]
    fn benchmark_profile_pins_caches() {
        let mut config = valid();
        config.profile = MountProfile::Benchmark;
        assert_eq!(config.meta_ttls().attributes, Duration::MAX);
        assert_eq!(config.meta_ttls().listings, Duration::MAX);
        assert_eq!(config.content_cache().capacity, usize::MAX);

        config.profile = MountProfile::Interactive;
        assert_eq!(config.meta_ttls().listings, Duration::from_secs(300));
        assert_eq!(config.content_cache().capacity, 10_000);
    }
}
