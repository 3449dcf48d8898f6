use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::ProviderSite;
use crate::error::RepoError;
use crate::store::DEFAULT_LOCK_TIMEOUT;
use crate::transfer::{DEFAULT_RETRIES, DEFAULT_SUBMIT_DELAY};
use crate::validator::DEFAULT_VALIDATE_DELAY;

pub const DEFAULT_CONFIG_FILE: &str = "sra-repo.json";
pub const DEFAULT_NTASKS: usize = 4;

/// Raw `sra-repo.json` contents; every field is optional.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub tmpdir: Option<String>,
    #[serde(default)]
    pub ntasks: Option<usize>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub lock_timeout_secs: Option<u64>,
    #[serde(default)]
    pub submit_delay_ms: Option<u64>,
    #[serde(default)]
    pub validate_delay_ms: Option<u64>,
    #[serde(default)]
    pub site: Option<ProviderSite>,
    #[serde(default)]
    pub command_prefix: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoConfig {
    /// Storage root; the CLI can still supply one when this is unset.
    pub root: Option<Utf8PathBuf>,
    pub tmpdir: Utf8PathBuf,
    pub ntasks: usize,
    pub retries: u32,
    pub lock_timeout: Duration,
    pub submit_delay: Duration,
    pub validate_delay: Duration,
    pub site: ProviderSite,
    pub command_prefix: Vec<String>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `sra-repo.json` in the working directory when it
    /// exists. Without either, every setting takes its default.
    pub fn resolve(path: Option<&str>) -> Result<RepoConfig, RepoError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| RepoError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| RepoError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<RepoConfig, RepoError> {
        let ntasks = config.ntasks.unwrap_or(DEFAULT_NTASKS);
        if ntasks == 0 {
            return Err(RepoError::ConfigParse(
                "ntasks must be at least 1".to_string(),
            ));
        }
        let retries = config.retries.unwrap_or(DEFAULT_RETRIES);
        if retries == 0 {
            return Err(RepoError::ConfigParse(
                "retries must be at least 1".to_string(),
            ));
        }
        let tmpdir = match config.tmpdir {
            Some(tmpdir) => Utf8PathBuf::from(tmpdir),
            None => default_tmpdir()?,
        };

        Ok(RepoConfig {
            root: config.root.map(Utf8PathBuf::from),
            tmpdir,
            ntasks,
            retries,
            lock_timeout: config
                .lock_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_LOCK_TIMEOUT),
            submit_delay: config
                .submit_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SUBMIT_DELAY),
            validate_delay: config
                .validate_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_VALIDATE_DELAY),
            site: config.site.unwrap_or_default(),
            command_prefix: config.command_prefix.unwrap_or_default(),
        })
    }
}

/// Scratch directory for in-flight downloads under the user cache.
pub fn default_tmpdir() -> Result<Utf8PathBuf, RepoError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.cache_dir().join("sra-repo").join("tmp")).ok()
        })
        .ok_or_else(|| RepoError::Filesystem("unable to resolve cache directory".to_string()))
}
