use std::path::PathBuf;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Platform-wide settings read from the environment at process start.
///
/// Service URLs are optional because the shipped store and broker
/// implementations are file-backed / in-process; implementations that talk
/// to external services read them from here.
#[derive(Debug, Clone)]
pub struct PlatformSettings {
    pub config_dir: PathBuf,
    pub hot_reload: bool,
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    pub cache_url: Option<String>,
    pub broker_url: Option<String>,
    pub shutdown_timeout_seconds: u64,
    pub health_interval_seconds: u64,
}

impl PlatformSettings {
    pub fn from_env() -> Self {
        Self {
            config_dir: std::env::var("CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./config")),
            hot_reload: env_bool("CONFIG_HOT_RELOAD", true),
            data_dir: std::env::var("MAESTRO_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            database_url: std::env::var("DATABASE_URL").ok(),
            cache_url: std::env::var("CACHE_URL").ok(),
            broker_url: std::env::var("BROKER_URL").ok(),
            shutdown_timeout_seconds: env_u64("SHUTDOWN_TIMEOUT_SECONDS", 30),
            health_interval_seconds: env_u64("HEALTH_INTERVAL_SECONDS", 60),
        }
    }
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("./config"),
            hot_reload: true,
            data_dir: PathBuf::from("./data"),
            database_url: None,
            cache_url: None,
            broker_url: None,
            shutdown_timeout_seconds: 30,
            health_interval_seconds: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = PlatformSettings::default();
        assert_eq!(settings.shutdown_timeout_seconds, 30);
        assert_eq!(settings.health_interval_seconds, 60);
        assert!(settings.hot_reload);
        assert!(settings.database_url.is_none());
    }

    #[test]
    fn bool_parsing() {
        assert!(env_bool("MAESTRO_TEST_UNSET_FLAG", true));
        assert!(!env_bool("MAESTRO_TEST_UNSET_FLAG", false));
    }
}
