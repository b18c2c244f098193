use std::env;
use std::fs;

use crate::class::{ClassConfig, ClassKind, ClassRegistry};
use crate::error::{Result, RouterError};

/// Router-level settings read from the `QueueRouter` configuration section
/// (§4.1, §6). Backed by environment variables with an optional `.env`
/// fallback, the way `Config::load()` reads the rest of the deployment's
/// settings store.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub cargo_key: String,
    pub settings_key: String,
    pub amqp_host: String,
    pub amqp_port: u16,
    pub amqp_user: String,
    pub amqp_password: String,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub redis_url: String,
    pub db_updates_exchange: String,
    pub db_updates_queue_prefix: String,
    pub db_update_shards: u32,
    pub delay_exchange: String,
    pub dlr_exchange: String,
    pub dlr_route: String,
    pub rust_log: String,
}

impl RouterSettings {
    pub fn amqp_url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}",
            self.amqp_user, self.amqp_password, self.amqp_host, self.amqp_port
        )
    }

    pub fn mysql_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}?parseTime=true",
            self.db_user, self.db_password, self.db_host, self.db_port, self.db_name
        )
    }
}

/// Loads `RouterSettings` plus the `ClassRegistry` from the settings store
/// (§4.1). Construction fails with `MissingConfig` if a mandatory key is
/// absent — `exchange_class`, `work_class`, `cargo_key`, `settings_key` are
/// mandatory; everything else falls back to a documented default the way the
/// teacher's `Config::load()` does for operational keys.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Fetches the `QueueRouter` section, validates mandatory keys, and
    /// loads the class table named by `CLASS_CONFIG_PATH` (a JSON array of
    /// `ClassConfig`, §3).
    pub fn load() -> Result<(RouterSettings, ClassRegistry)> {
        let settings = Self::load_settings()?;
        let registry = Self::load_class_registry()?;

        if !registry.classes().any(|c| c.kind() == ClassKind::Work) {
            return Err(RouterError::MissingConfig("work_class".into()));
        }
        if !registry.classes().any(|c| c.kind() == ClassKind::Exchange) {
            return Err(RouterError::MissingConfig("exchange_class".into()));
        }

        Ok((settings, registry))
    }

    fn load_settings() -> Result<RouterSettings> {
        let cargo_key = env_or_default("ROUTER_CARGO_KEY", "cargo");
        let settings_key = env_or_default("ROUTER_SETTINGS_KEY", "settings");
        if cargo_key.is_empty() {
            return Err(RouterError::MissingConfig("cargo_key".into()));
        }
        if settings_key.is_empty() {
            return Err(RouterError::MissingConfig("settings_key".into()));
        }

        Ok(RouterSettings {
            cargo_key,
            settings_key,
            amqp_host: env_or_default("AMQP_HOST", "localhost"),
            amqp_port: env_parse_or("AMQP_PORT", 5672),
            amqp_user: env_or_default("AMQP_USER", "guest"),
            amqp_password: env_or_default("AMQP_PASSWORD", "guest"),
            db_host: env_or_default("DB_HOST", "localhost"),
            db_port: env_parse_or("DB_PORT", 3306),
            db_user: env_or_default("DB_USER", "router"),
            db_password: env_or_default("DB_PASSWORD", "router"),
            db_name: env_or_default("DB_NAME", "sito_messaging"),
            redis_url: env_or_default("REDIS_URL", "redis://127.0.0.1:6379"),
            db_updates_exchange: env_or_default("DB_UPDATES_EXCHANGE", "db_updates"),
            db_updates_queue_prefix: env_or_default("DB_UPDATES_QUEUE_PREFIX", "db_update"),
            db_update_shards: env_parse_or("DB_UPDATE_SHARDS", 4),
            delay_exchange: env_or_default("DELAY_EXCHANGE", "delay_exchange"),
            dlr_exchange: env_or_default("DLR_EXCHANGE", "dlr_exchange"),
            dlr_route: env_or_default("DLR_ROUTE", "dlr"),
            rust_log: env_or_default("RUST_LOG", "info"),
        })
    }

    /// The class table itself: a JSON array of `ClassConfig`, at a path named
    /// by `CLASS_CONFIG_PATH` (default `classes.json` in the working
    /// directory). This is the router's rendition of the settings store's
    /// per-class configuration blocks (§3 `ClassConfig`).
    fn load_class_registry() -> Result<ClassRegistry> {
        let path = env_or_default("CLASS_CONFIG_PATH", "classes.json");
        let text = fs::read_to_string(&path)
            .map_err(|e| RouterError::MissingConfig(format!("class table {}: {}", path, e)))?;
        let classes: Vec<ClassConfig> = serde_json::from_str(&text)
            .map_err(|e| RouterError::MissingConfig(format!("class table {}: {}", path, e)))?;
        Ok(ClassRegistry::new(classes))
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_class_table_is_missing_config() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("CLASS_CONFIG_PATH", "/nonexistent/classes.json");
        let err = ConfigLoader::load_class_registry().unwrap_err();
        assert!(matches!(err, RouterError::MissingConfig(_)));
        std::env::remove_var("CLASS_CONFIG_PATH");
    }

    #[test]
    fn settings_defaults_match_documented_keys() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("ROUTER_CARGO_KEY");
        std::env::remove_var("ROUTER_SETTINGS_KEY");
        let settings = ConfigLoader::load_settings().unwrap();
        assert_eq!(settings.cargo_key, "cargo");
        assert_eq!(settings.settings_key, "settings");
    }
}
