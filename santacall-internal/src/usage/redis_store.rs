use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{Error, ErrorDetails};
use crate::usage::backend::DurableConnector;
use crate::usage::day_key::DayKey;
use crate::usage::store::UsageStore;
use crate::usage::UsageRecord;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Settings shared by the Redis connector and the store it produces
#[derive(Debug, Clone)]
pub struct RedisStoreSettings {
    pub key_prefix: String,
    /// Upper bound for any single Redis round trip
    pub timeout: Duration,
    /// Days a record is kept before Redis expires it
    pub retention_days: u32,
}

impl RedisStoreSettings {
    fn ttl_secs(&self) -> u64 {
        (u64::from(self.retention_days) + 1) * SECONDS_PER_DAY
    }
}

/// Durable usage store backed by Redis. Records are JSON strings with a TTL.
///
/// Writes are a plain GET followed by SET EX, so concurrent writers for the same
/// identifier on different gateway instances can lose an update.
pub struct RedisUsageStore {
    conn: MultiplexedConnection,
    settings: RedisStoreSettings,
}

impl RedisUsageStore {
    pub async fn connect(url: &SecretString, settings: RedisStoreSettings) -> Result<Self, Error> {
        let client = redis::Client::open(url.expose_secret()).map_err(|e| {
            Error::new_without_logging(ErrorDetails::BackendUnavailable {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = match timeout(settings.timeout, client.get_multiplexed_async_connection()).await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(Error::new_without_logging(
                    ErrorDetails::BackendUnavailable {
                        message: format!("Failed to get Redis connection: {e}"),
                    },
                ))
            }
            Err(_) => {
                return Err(Error::new_without_logging(
                    ErrorDetails::BackendUnavailable {
                        message: "Timed out connecting to Redis".to_string(),
                    },
                ))
            }
        };
        info!("Connected to Redis for usage tracking");
        Ok(Self { conn, settings })
    }

    fn redis_key(&self, key: &DayKey) -> String {
        format!("{}:usage:{key}", self.settings.key_prefix)
    }

    async fn bounded<T, F>(&self, op: &str, key: &str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.settings.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::new_without_logging(
                ErrorDetails::TransientBackendFailure {
                    message: format!("Redis {op} for `{key}` failed: {e}"),
                },
            )),
            Err(_) => Err(Error::new_without_logging(
                ErrorDetails::TransientBackendFailure {
                    message: format!(
                        "Redis {op} for `{key}` timed out after {}ms",
                        self.settings.timeout.as_millis()
                    ),
                },
            )),
        }
    }
}

#[async_trait]
impl UsageStore for RedisUsageStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &DayKey) -> Result<Option<UsageRecord>, Error> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();
        let data: Option<String> = self
            .bounded("GET", &redis_key, conn.get(&redis_key))
            .await?;

        match data {
            Some(data) => serde_json::from_str(&data).map(Some).map_err(|e| {
                Error::new_without_logging(ErrorDetails::Serialization {
                    message: format!("Failed to parse usage record `{redis_key}`: {e}"),
                })
            }),
            None => {
                debug!("No usage record in Redis for {redis_key}");
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &DayKey, record: &UsageRecord) -> Result<(), Error> {
        let redis_key = self.redis_key(key);
        let data = serde_json::to_string(record).map_err(|e| {
            Error::new_without_logging(ErrorDetails::Serialization {
                message: format!("Failed to serialize usage record `{redis_key}`: {e}"),
            })
        })?;
        let mut conn = self.conn.clone();
        self.bounded::<(), _>(
            "SET",
            &redis_key,
            conn.set_ex(&redis_key, data, self.settings.ttl_secs()),
        )
        .await
    }

    async fn delete(&self, key: &DayKey) -> Result<bool, Error> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .bounded("DEL", &redis_key, conn.del(&redis_key))
            .await?;
        Ok(removed > 0)
    }
}

/// Opens a [`RedisUsageStore`] when the ledger first needs durable storage
pub struct RedisConnector {
    url: SecretString,
    settings: RedisStoreSettings,
}

impl RedisConnector {
    pub fn new(url: SecretString, settings: RedisStoreSettings) -> Self {
        Self { url, settings }
    }
}

#[async_trait]
impl DurableConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn UsageStore>, Error> {
        let store = RedisUsageStore::connect(&self.url, self.settings.clone()).await?;
        Ok(Arc::new(store))
    }
}
