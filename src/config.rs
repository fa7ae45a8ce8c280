//! Runtime settings, read from the environment (and `.env` when present)
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    const MAX_DELAY: Duration = Duration::from_secs(5);

    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Backoff before retry number `attempt` (1-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(Self::MAX_DELAY)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketConfig {
    pub db_path: PathBuf,
    pub object_root: PathBuf,
    pub outbox_max_attempts: u32,
    /// First backoff after a failed side effect; doubles per attempt.
    pub outbox_base_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("paylink.db"),
            object_root: PathBuf::from("paylink-objects"),
            outbox_max_attempts: 5,
            outbox_base_delay: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

impl MarketConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        // a missing .env file is fine
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            db_path: env_or("PAYLINK_DB_PATH", defaults.db_path)?,
            object_root: env_or("PAYLINK_OBJECT_ROOT", defaults.object_root)?,
            outbox_max_attempts: env_or("PAYLINK_OUTBOX_MAX_ATTEMPTS", defaults.outbox_max_attempts)?,
            outbox_base_delay: Duration::from_millis(env_or(
                "PAYLINK_OUTBOX_BASE_DELAY_MS",
                defaults.outbox_base_delay.as_millis() as u64,
            )?),
            retry: RetryPolicy {
                max_attempts: env_or("PAYLINK_RETRY_ATTEMPTS", defaults.retry.max_attempts)?,
                base_delay: Duration::from_millis(env_or(
                    "PAYLINK_RETRY_BASE_DELAY_MS",
                    defaults.retry.base_delay.as_millis() as u64,
                )?),
            },
        })
    }

    /// Backoff used between attempts of one outbox entry.
    pub fn outbox_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.outbox_max_attempts, self.outbox_base_delay)
    }

    pub fn set_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }
    pub fn set_object_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.object_root = path.into();
        self
    }
    pub fn set_outbox_max_attempts(mut self, attempts: u32) -> Self {
        self.outbox_max_attempts = attempts;
        self
    }
    pub fn set_outbox_base_delay(mut self, delay: Duration) -> Self {
        self.outbox_base_delay = delay;
        self
    }
    pub fn set_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("invalid value for {key}: {err}")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(anyhow!("cannot read {key}: {err}")),
    }
}
