use std::env;
use std::time::Duration;

use crate::engine::dispatcher::MatchingConfig;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub order_queue_size: usize,
    pub event_buffer_size: usize,
    pub response_timeout_secs: u64,
    pub cooldown_secs: u64,
    pub inter_batch_delay_ms: u64,
    pub max_simultaneous_offers: usize,
    pub peak_order_threshold: usize,
    pub peak_window_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            order_queue_size: 1024,
            event_buffer_size: 1024,
            response_timeout_secs: 10,
            cooldown_secs: 600,
            inter_batch_delay_ms: 2500,
            max_simultaneous_offers: 10,
            peak_order_threshold: 100,
            peak_window_secs: 900,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            order_queue_size: parse_or_default("ORDER_QUEUE_SIZE", defaults.order_queue_size)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            response_timeout_secs: parse_or_default(
                "RESPONSE_TIMEOUT_SECS",
                defaults.response_timeout_secs,
            )?,
            cooldown_secs: parse_or_default("COOLDOWN_SECS", defaults.cooldown_secs)?,
            inter_batch_delay_ms: parse_or_default(
                "INTER_BATCH_DELAY_MS",
                defaults.inter_batch_delay_ms,
            )?,
            max_simultaneous_offers: parse_or_default(
                "MAX_SIMULTANEOUS_OFFERS",
                defaults.max_simultaneous_offers,
            )?,
            peak_order_threshold: parse_or_default(
                "PEAK_ORDER_THRESHOLD",
                defaults.peak_order_threshold,
            )?,
            peak_window_secs: parse_or_default("PEAK_WINDOW_SECS", defaults.peak_window_secs)?,
        };

        if config.response_timeout_secs == 0 {
            return Err(AppError::Internal(
                "RESPONSE_TIMEOUT_SECS must be > 0".to_string(),
            ));
        }
        if config.order_queue_size == 0 || config.event_buffer_size == 0 {
            return Err(AppError::Internal(
                "ORDER_QUEUE_SIZE and EVENT_BUFFER_SIZE must be > 0".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn matching(&self) -> MatchingConfig {
        MatchingConfig {
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
            inter_batch_delay: Duration::from_millis(self.inter_batch_delay_ms),
            ..MatchingConfig::default()
        }
    }

    pub fn peak_window(&self) -> Duration {
        Duration::from_secs(self.peak_window_secs)
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
