use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::generation::GenerationConfig;
use crate::providers::heygen::HeyGenConfig;
use crate::resilience::{BackoffStrategy, CircuitBreakerConfig, RetryPolicy};
use crate::subscriptions::SubscriptionConfig;

/// Application configuration loaded from environment variables.
/// Fails at startup if `DATABASE_URL` is missing or any tunable is malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub rust_log: String,

    pub subscription_grace: Duration,
    pub subscription_debounce: Duration,
    pub subscription_connect_timeout: Duration,
    pub subscribe_rate_limit: u32,
    pub subscribe_rate_window: Duration,

    pub circuit_failure_threshold: u32,
    pub circuit_failure_window: Duration,
    pub circuit_recovery_timeout: Duration,
    pub circuit_success_threshold: u32,
    pub circuit_half_open_max_calls: u32,

    pub retry_max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub retry_jitter: f64,

    pub provider_call_timeout: Duration,
    pub generation_deadline: Duration,
    pub generation_rate_limit: u32,
    pub generation_rate_window: Duration,

    /// A provider is registered only when its key is set.
    pub anthropic_api_key: Option<String>,
    pub heygen: Option<HeyGenConfig>,
    pub runway_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let retry_jitter: f64 = env_or("RETRY_JITTER", 0.2)?;
        if !(0.0..=1.0).contains(&retry_jitter) {
            anyhow::bail!("RETRY_JITTER must be between 0 and 1, got {retry_jitter}");
        }

        let heygen = match optional_env("HEYGEN_API_KEY") {
            Some(api_key) => Some(HeyGenConfig {
                api_key,
                avatar_id: require_env("HEYGEN_AVATAR_ID")
                    .context("HEYGEN_API_KEY is set but the avatar is not")?,
                voice_id: require_env("HEYGEN_VOICE_ID")
                    .context("HEYGEN_API_KEY is set but the voice is not")?,
                callback_base_url: optional_env("HEYGEN_CALLBACK_BASE_URL"),
            }),
            None => None,
        };

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            port: env_or("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),

            subscription_grace: secs("SUBSCRIPTION_GRACE_SECS", 30)?,
            subscription_debounce: Duration::from_millis(env_or("SUBSCRIPTION_DEBOUNCE_MS", 100)?),
            subscription_connect_timeout: secs("SUBSCRIPTION_CONNECT_TIMEOUT_SECS", 5)?,
            subscribe_rate_limit: env_or("SUBSCRIBE_RATE_LIMIT", 10)?,
            subscribe_rate_window: secs("SUBSCRIBE_RATE_WINDOW_SECS", 60)?,

            circuit_failure_threshold: env_or("CIRCUIT_FAILURE_THRESHOLD", 5)?,
            circuit_failure_window: secs("CIRCUIT_FAILURE_WINDOW_SECS", 300)?,
            circuit_recovery_timeout: secs("CIRCUIT_RECOVERY_TIMEOUT_SECS", 60)?,
            circuit_success_threshold: env_or("CIRCUIT_SUCCESS_THRESHOLD", 3)?,
            circuit_half_open_max_calls: env_or("CIRCUIT_HALF_OPEN_MAX_CALLS", 3)?,

            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", 3)?,
            retry_base: Duration::from_millis(env_or("RETRY_BASE_MS", 1000)?),
            retry_max: Duration::from_millis(env_or("RETRY_MAX_MS", 30_000)?),
            retry_jitter,

            provider_call_timeout: secs("PROVIDER_CALL_TIMEOUT_SECS", 25)?,
            generation_deadline: secs("GENERATION_DEADLINE_SECS", 600)?,
            generation_rate_limit: env_or("GENERATION_RATE_LIMIT", 5)?,
            generation_rate_window: secs("GENERATION_RATE_WINDOW_SECS", 60)?,

            anthropic_api_key: optional_env("ANTHROPIC_API_KEY"),
            heygen,
            runway_api_key: optional_env("RUNWAY_API_KEY"),
        })
    }

    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            grace_period: self.subscription_grace,
            default_debounce: self.subscription_debounce,
            connect_timeout: self.subscription_connect_timeout,
            rate_limit: self.subscribe_rate_limit,
            rate_window: self.subscribe_rate_window,
            ..SubscriptionConfig::default()
        }
    }

    pub fn circuit_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            failure_window: self.circuit_failure_window,
            recovery_timeout: self.circuit_recovery_timeout,
            success_threshold: self.circuit_success_threshold,
            half_open_max_calls: self.circuit_half_open_max_calls,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            strategy: BackoffStrategy::Exponential,
            max_attempts: self.retry_max_attempts,
            base_delay: self.retry_base,
            max_delay: self.retry_max,
            jitter: self.retry_jitter,
        }
    }

    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            call_timeout: self.provider_call_timeout,
            deadline: self.generation_deadline,
            rate_limit: self.generation_rate_limit,
            rate_window: self.generation_rate_window,
            retry: self.retry_policy(),
        }
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    parse_or(key, std::env::var(key).ok(), default)
}

fn secs(key: &str, default: u64) -> Result<Duration> {
    env_or(key, default).map(Duration::from_secs)
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}='{value}' is invalid: {e}")),
    }
}
