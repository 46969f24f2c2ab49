use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, ErrorDetails};
use crate::usage::redis_store::RedisStoreSettings;
use crate::usage::{LedgerConfig, DEFAULT_RETENTION_DAYS, MAX_DAILY_SECONDS};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub geoblock: GeoblockConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
    /// Origin allowed by CORS. When unset, the request's own origin is mirrored back.
    pub frontend_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaConfig {
    pub max_daily_seconds: f64,
    pub retention_days: u32,
    pub sweep_interval_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_daily_seconds: MAX_DAILY_SECONDS,
            retention_days: DEFAULT_RETENTION_DAYS,
            sweep_interval_secs: 60 * 60,
        }
    }
}

impl QuotaConfig {
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            max_daily_seconds: self.max_daily_seconds,
            retention_days: self.retention_days,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub redis_timeout_ms: u64,
    pub key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            redis_timeout_ms: 500,
            key_prefix: "santacall".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn redis_settings(&self, retention_days: u32) -> RedisStoreSettings {
        RedisStoreSettings {
            key_prefix: self.key_prefix.clone(),
            timeout: Duration::from_millis(self.redis_timeout_ms),
            retention_days,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
    pub cookie_name: String,
    pub cookie_max_age_secs: u64,
    /// Add `Secure` to the identifier cookie. Enable whenever the site is served over HTTPS.
    pub secure_cookie: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            cookie_name: "santa_user_id".to_string(),
            cookie_max_age_secs: 365 * 24 * 60 * 60,
            secure_cookie: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeoblockConfig {
    pub blocked_countries: Vec<String>,
    /// Countries treated as blocked when a request passes `?testCountry=`
    pub test_blocked_countries: Vec<String>,
}

impl Default for GeoblockConfig {
    fn default() -> Self {
        Self {
            blocked_countries: Vec::new(),
            test_blocked_countries: vec!["CN".to_string(), "RU".to_string(), "KP".to_string()],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    /// Mount `/api/test-bypass`
    #[serde(default)]
    pub enabled: bool,
}

impl Config {
    pub async fn load_and_verify_from_path(config_path: &Path) -> Result<Config, Error> {
        let contents = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!(
                    "Failed to read config file `{}`: {e}",
                    config_path.to_string_lossy()
                ),
            })
        })?;
        let config = Self::parse(&contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!(
                    "Failed to parse config file `{}`: {e}",
                    config_path.to_string_lossy()
                ),
            })
        })?;
        config.verify()?;
        Ok(config)
    }

    fn parse(contents: &str) -> Result<Config, String> {
        let deserializer = toml::Deserializer::new(contents);
        serde_path_to_error::deserialize(deserializer).map_err(|e| e.to_string())
    }

    /// Reject settings that would make the ledger or the sweep misbehave
    pub fn verify(&self) -> Result<(), Error> {
        let cap = self.quota.max_daily_seconds;
        if !cap.is_finite() || cap <= 0.0 {
            return Err(Error::new(ErrorDetails::Config {
                message: format!("`quota.max_daily_seconds` must be a positive number (got {cap})"),
            }));
        }
        if self.quota.sweep_interval_secs == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`quota.sweep_interval_secs` must be greater than zero".to_string(),
            }));
        }
        if self.storage.redis_timeout_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`storage.redis_timeout_ms` must be greater than zero".to_string(),
            }));
        }
        if self.identity.cookie_name.is_empty()
            || !self
                .identity
                .cookie_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "`identity.cookie_name` must be a non-empty token of letters, digits, `_` or `-` (got `{}`)",
                    self.identity.cookie_name
                ),
            }));
        }
        if let Some(frontend_url) = &self.gateway.frontend_url {
            let parsed = url::Url::parse(frontend_url).map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("`gateway.frontend_url` is not a valid URL: {e}"),
                })
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!(
                        "`gateway.frontend_url` must use http or https (got `{}`)",
                        parsed.scheme()
                    ),
                }));
            }
        }
        Ok(())
    }
}
