use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::{
    audio::{download::DownloadTiming, player::PlayerSettings},
    cache::{StorePolicy, WriteRetry},
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub guild_id: Option<u64>, // Para comandos de desarrollo
    pub admin_users: Vec<u64>,

    // Paths
    pub data_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub modules_dir: PathBuf,
    pub ytdlp_path: String,

    // Caché
    pub cache_capacity_mb: usize,
    pub cache_ttl_secs: u64, // 0 = sin expiración
    pub cache_eviction_batch: usize,
    pub cache_write_retries: u32,
    pub cache_retry_backoff_ms: u64,

    // Descargas y reproducción
    pub download_timeout_secs: u64,
    pub download_poll_ms: u64,
    pub skip_grace_ms: u64,
    pub max_queue_size: usize,
    pub search_results: usize,

    // Interfaz
    pub dashboard_settle_ms: u64,
    pub confirm_timeout_secs: u64,

    // Módulos
    pub autoreload: bool,
    pub watch_debounce_ms: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("no se pudo crear {}", config.data_dir.display()))?;
        std::fs::create_dir_all(&config.staging_dir)
            .with_context(|| format!("no se pudo crear {}", config.staging_dir.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Construye la configuración a partir de una función de búsqueda de variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let discord_token = var("DISCORD_TOKEN").context("DISCORD_TOKEN no está definido")?;

        let admin_users = match var("ADMIN_USERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<u64>().with_context(|| format!("ADMIN_USERS inválido: {s}")))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            discord_token,
            guild_id: parse_opt(&var, "GUILD_ID")?,
            admin_users,

            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            staging_dir: var("STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.staging_dir),
            modules_dir: var("MODULES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.modules_dir),
            ytdlp_path: var("YTDLP_PATH").unwrap_or(defaults.ytdlp_path),

            cache_capacity_mb: parse_or(&var, "CACHE_CAPACITY_MB", defaults.cache_capacity_mb)?,
            cache_ttl_secs: parse_or(&var, "CACHE_TTL_SECS", defaults.cache_ttl_secs)?,
            cache_eviction_batch: parse_or(
                &var,
                "CACHE_EVICTION_BATCH",
                defaults.cache_eviction_batch,
            )?,
            cache_write_retries: parse_or(&var, "CACHE_WRITE_RETRIES", defaults.cache_write_retries)?,
            cache_retry_backoff_ms: parse_or(
                &var,
                "CACHE_RETRY_BACKOFF_MS",
                defaults.cache_retry_backoff_ms,
            )?,

            download_timeout_secs: parse_or(
                &var,
                "DOWNLOAD_TIMEOUT_SECS",
                defaults.download_timeout_secs,
            )?,
            download_poll_ms: parse_or(&var, "DOWNLOAD_POLL_MS", defaults.download_poll_ms)?,
            skip_grace_ms: parse_or(&var, "SKIP_GRACE_MS", defaults.skip_grace_ms)?,
            max_queue_size: parse_or(&var, "MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            search_results: parse_or(&var, "SEARCH_RESULTS", defaults.search_results)?,

            dashboard_settle_ms: parse_or(&var, "DASHBOARD_SETTLE_MS", defaults.dashboard_settle_ms)?,
            confirm_timeout_secs: parse_or(
                &var,
                "CONFIRM_TIMEOUT_SECS",
                defaults.confirm_timeout_secs,
            )?,

            autoreload: parse_or(&var, "AUTORELOAD", defaults.autoreload)?,
            watch_debounce_ms: parse_or(&var, "WATCH_DEBOUNCE_MS", defaults.watch_debounce_ms)?,
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// - Token must not be empty
    /// - Cache capacity, eviction batch and write retries must be > 0
    /// - Download poll interval must be shorter than the timeout
    /// - Search results must fit in a Discord select menu (1..=25)
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN está vacío");
        }

        if self.cache_capacity_mb == 0 {
            anyhow::bail!("Cache capacity must be greater than 0");
        }

        if self.cache_eviction_batch == 0 {
            anyhow::bail!("Cache eviction batch must be greater than 0");
        }

        if self.cache_write_retries == 0 {
            anyhow::bail!("Cache write retries must be at least 1");
        }

        if self.download_timeout_secs == 0 {
            anyhow::bail!("Download timeout must be greater than 0");
        }

        if self.download_poll_ms == 0 || self.download_poll_ms >= self.download_timeout_secs * 1000 {
            anyhow::bail!(
                "Download poll interval must be between 1ms and the timeout, got: {}ms",
                self.download_poll_ms
            );
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if !(1..=25).contains(&self.search_results) {
            anyhow::bail!("Search results must be between 1 and 25, got: {}", self.search_results);
        }

        Ok(())
    }

    pub fn is_admin(&self, user_id: u64) -> bool {
        self.admin_users.contains(&user_id)
    }

    pub fn store_policy(&self) -> StorePolicy {
        StorePolicy {
            capacity_bytes: self.cache_capacity_mb * 1024 * 1024,
            ttl: (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs)),
            eviction_batch: self.cache_eviction_batch,
        }
    }

    pub fn write_retry(&self) -> WriteRetry {
        WriteRetry {
            attempts: self.cache_write_retries,
            backoff: Duration::from_millis(self.cache_retry_backoff_ms),
        }
    }

    pub fn download_timing(&self) -> DownloadTiming {
        DownloadTiming {
            timeout: Duration::from_secs(self.download_timeout_secs),
            poll_interval: Duration::from_millis(self.download_poll_ms),
        }
    }

    pub fn player_settings(&self) -> PlayerSettings {
        PlayerSettings {
            max_queue_size: self.max_queue_size,
            skip_grace: Duration::from_millis(self.skip_grace_ms),
            ..PlayerSettings::default()
        }
    }

    pub fn dashboard_settle(&self) -> Duration {
        Duration::from_millis(self.dashboard_settle_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    /// Resumen para logs, sin el token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: Guild {} / {} admins\n  \
            Paths: data={} staging={} modules={}\n  \
            Cache: {}MB, TTL {}, batch {}, {} reintentos\n  \
            Downloads: timeout {}s, poll {}ms, yt-dlp '{}'\n  \
            Player: cola {}, skip grace {}ms, {} resultados\n  \
            Modules: autoreload={}",
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.admin_users.len(),
            self.data_dir.display(),
            self.staging_dir.display(),
            self.modules_dir.display(),
            self.cache_capacity_mb,
            if self.cache_ttl_secs == 0 {
                "off".to_string()
            } else {
                humantime::format_duration(Duration::from_secs(self.cache_ttl_secs)).to_string()
            },
            self.cache_eviction_batch,
            self.cache_write_retries,
            self.download_timeout_secs,
            self.download_poll_ms,
            self.ytdlp_path,
            self.max_queue_size,
            self.skip_grace_ms,
            self.search_results,
            self.autoreload,
        )
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("valor inválido para {key}: {raw}")),
        None => Ok(default),
    }
}

fn parse_opt<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .with_context(|| format!("valor inválido para {key}: {raw}"))
        })
        .transpose()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (sin default para el token)
            discord_token: String::new(),
            guild_id: None,
            admin_users: Vec::new(),

            data_dir: "data".into(),
            staging_dir: "data/staging".into(),
            modules_dir: "modules".into(),
            ytdlp_path: "yt-dlp".to_string(),

            cache_capacity_mb: 512,
            cache_ttl_secs: 0,
            cache_eviction_batch: 8,
            cache_write_retries: 3,
            cache_retry_backoff_ms: 500,

            download_timeout_secs: 30,
            download_poll_ms: 100,
            skip_grace_ms: 500,
            max_queue_size: 100,
            search_results: 7,

            dashboard_settle_ms: 1000,
            confirm_timeout_secs: 30,

            autoreload: false,
            watch_debounce_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_missing_token_is_fatal() {
        let err = config_from(&[("GUILD_ID", "1")]).unwrap_err();
        assert!(err.to_string().contains("DISCORD_TOKEN"));
    }

    #[test]
    fn test_defaults_apply() {
        let config = config_from(&[("DISCORD_TOKEN", "token")]).unwrap();

        assert_eq!(config.guild_id, None);
        assert_eq!(config.search_results, 7);
        assert_eq!(config.store_policy().ttl, None);
        assert_eq!(config.download_timing().timeout, Duration::from_secs(30));
        config.validate().unwrap();
    }

    #[test]
    fn test_overrides_and_admins() {
        let config = config_from(&[
            ("DISCORD_TOKEN", "token"),
            ("GUILD_ID", "42"),
            ("ADMIN_USERS", "1, 2,3"),
            ("CACHE_TTL_SECS", "3600"),
            ("AUTORELOAD", "true"),
        ])
        .unwrap();

        assert_eq!(config.guild_id, Some(42));
        assert_eq!(config.admin_users, vec![1, 2, 3]);
        assert!(config.is_admin(2));
        assert!(!config.is_admin(4));
        assert_eq!(config.store_policy().ttl, Some(Duration::from_secs(3600)));
        assert!(config.autoreload);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(config_from(&[("DISCORD_TOKEN", "t"), ("MAX_QUEUE_SIZE", "many")]).is_err());

        let config = config_from(&[("DISCORD_TOKEN", "t"), ("SEARCH_RESULTS", "30")]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_summary_hides_token() {
        let config = config_from(&[("DISCORD_TOKEN", "super-secret")]).unwrap();
        assert!(!config.summary().contains("super-secret"));
    }
}
