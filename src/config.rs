use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::TimeDelta;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::cache::CachePolicy;
use crate::error::MirrorError;
use crate::import::{ImportOptions, default_workers};
use crate::reader::DEFAULT_MAX_RECORD_BYTES;
use crate::store::SearchSettings;

pub const CONFIG_FILE_NAME: &str = "local-wikidata.json";
pub const DEFAULT_API_URL: &str = "https://www.wikidata.org/w/api.php";

/// On-disk config; every field is optional.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub dump_path: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub cache_ttl_days: Option<u64>,
    #[serde(default)]
    pub negative_ttl_secs: Option<u64>,
    #[serde(default)]
    pub fetch_timeout_secs: Option<u64>,
    #[serde(default)]
    pub display_language: Option<String>,
    #[serde(default)]
    pub index_languages: Option<Vec<String>>,
    #[serde(default)]
    pub import: ImportSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ImportSection {
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub max_decode_error_rate: Option<f64>,
    #[serde(default)]
    pub min_decode_errors_for_abort: Option<usize>,
    #[serde(default)]
    pub storage_retries: Option<usize>,
    #[serde(default)]
    pub retry_base_delay_ms: Option<u64>,
    #[serde(default)]
    pub report_interval_secs: Option<u64>,
    #[serde(default)]
    pub max_record_bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    /// File the values came from, if any.
    pub source: Option<PathBuf>,
    pub database_path: Utf8PathBuf,
    pub dump_path: Utf8PathBuf,
    pub api_url: String,
    pub cache_ttl_days: u64,
    pub negative_ttl: Duration,
    pub fetch_timeout: Duration,
    pub display_language: String,
    pub index_languages: Option<Vec<String>>,
    pub batch_size: usize,
    pub workers: usize,
    pub max_decode_error_rate: f64,
    pub min_decode_errors_for_abort: usize,
    pub storage_retries: usize,
    pub retry_base_delay: Duration,
    pub report_interval: Duration,
    pub max_record_bytes: usize,
}

impl ResolvedConfig {
    pub fn import_options(&self) -> ImportOptions {
        ImportOptions {
            batch_size: self.batch_size,
            workers: self.workers,
            max_decode_error_rate: self.max_decode_error_rate,
            min_decode_errors_for_abort: self.min_decode_errors_for_abort,
            storage_retries: self.storage_retries,
            retry_base_delay: self.retry_base_delay,
            report_interval: self.report_interval,
            max_record_bytes: self.max_record_bytes,
            max_batches: None,
            restart: false,
        }
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            ttl: TimeDelta::days(self.cache_ttl_days.min(i64::MAX as u64 / 86_400) as i64),
            negative_ttl: TimeDelta::from_std(self.negative_ttl).unwrap_or(TimeDelta::zero()),
        }
    }

    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            index_languages: self.index_languages.clone(),
            display_language: self.display_language.clone(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Explicit path, then `./local-wikidata.json`, then the user config
    /// dir, then built-in defaults; environment overrides apply last.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, MirrorError> {
        Self::resolve_with_env(path, |key| std::env::var(key).ok())
    }

    pub fn resolve_with_env(
        path: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ResolvedConfig, MirrorError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };

        let (config, source) = match config_path {
            Some(config_path) => {
                let content = fs::read_to_string(&config_path)
                    .map_err(|_| MirrorError::ConfigRead(config_path.clone()))?;
                let config: Config = serde_json::from_str(&content)
                    .map_err(|err| MirrorError::ConfigParse(err.to_string()))?;
                tracing::debug!(path = %config_path.display(), "loaded config");
                (config, Some(config_path))
            }
            None => (Config::default(), None),
        };

        let mut resolved = Self::resolve_config(config)?;
        resolved.source = source;
        Self::apply_env(&mut resolved, env)?;
        Ok(resolved)
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        let dirs = ProjectDirs::from("org", "wikidata", "local-wikidata")?;
        let user = dirs.config_dir().join("config.json");
        user.exists().then_some(user)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, MirrorError> {
        let import = config.import;
        if let Some(rate) = import.max_decode_error_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(MirrorError::ConfigParse(format!(
                    "import.max_decode_error_rate must be within 0..=1, got {rate}"
                )));
            }
        }

        Ok(ResolvedConfig {
            source: None,
            database_path: Utf8PathBuf::from(
                config.database_path.unwrap_or_else(|| "./data/wikidata.db".to_string()),
            ),
            dump_path: Utf8PathBuf::from(
                config.dump_path.unwrap_or_else(|| "./data/dump.json.bz2".to_string()),
            ),
            api_url: config.api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            cache_ttl_days: config.cache_ttl_days.unwrap_or(365),
            negative_ttl: Duration::from_secs(config.negative_ttl_secs.unwrap_or(300)),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs.unwrap_or(30)),
            display_language: config.display_language.unwrap_or_else(|| "en".to_string()),
            index_languages: config.index_languages,
            batch_size: import.batch_size.unwrap_or(1000).max(1),
            workers: import.workers.unwrap_or_else(default_workers).max(1),
            max_decode_error_rate: import.max_decode_error_rate.unwrap_or(0.05),
            min_decode_errors_for_abort: import.min_decode_errors_for_abort.unwrap_or(10),
            storage_retries: import.storage_retries.unwrap_or(5),
            retry_base_delay: Duration::from_millis(import.retry_base_delay_ms.unwrap_or(500)),
            report_interval: Duration::from_secs(import.report_interval_secs.unwrap_or(30)),
            max_record_bytes: import.max_record_bytes.unwrap_or(DEFAULT_MAX_RECORD_BYTES),
        })
    }

    fn apply_env(
        resolved: &mut ResolvedConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(), MirrorError> {
        if let Some(value) = env("DATABASE_PATH").filter(|v| !v.is_empty()) {
            resolved.database_path = Utf8PathBuf::from(value);
        }
        if let Some(value) = env("DUMP_PATH").filter(|v| !v.is_empty()) {
            resolved.dump_path = Utf8PathBuf::from(value);
        }
        if let Some(value) = env("WIKIDATA_API").filter(|v| !v.is_empty()) {
            resolved.api_url = value;
        }
        if let Some(value) = env("CACHE_TTL_DAYS").filter(|v| !v.is_empty()) {
            resolved.cache_ttl_days = value.trim().parse().map_err(|_| {
                MirrorError::ConfigParse(format!("CACHE_TTL_DAYS must be a whole number of days, got {value:?}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_config() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.database_path.as_str(), "./data/wikidata.db");
        assert_eq!(resolved.dump_path.as_str(), "./data/dump.json.bz2");
        assert_eq!(resolved.api_url, DEFAULT_API_URL);
        assert_eq!(resolved.cache_ttl_days, 365);
        assert_eq!(resolved.negative_ttl, Duration::from_secs(300));
        assert_eq!(resolved.batch_size, 1000);
        assert!((1..=8).contains(&resolved.workers));
        assert_eq!(resolved.min_decode_errors_for_abort, 10);
        assert_eq!(resolved.display_language, "en");
    }

    #[test]
    fn rejects_out_of_range_error_rate() {
        let config = Config {
            import: ImportSection {
                max_decode_error_rate: Some(1.5),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            ConfigLoader::resolve_config(config),
            Err(MirrorError::ConfigParse(_))
        ));
    }
}
