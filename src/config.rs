use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    clients::cache::CacheConfig,
    models::{
        circuit_breaker::CircuitBreakerConfig,
        quota::{QuotaConfig, ReservationMode},
        retry::RetryConfig,
    },
    services::{
        dispatcher::DispatchConfig, geo_filter::GeoFilterConfig, notifier::SweepSchedule,
        token_selector::TokenPolicy,
    },
};

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    pub rabbitmq_url: Option<String>,
    pub events_queue_name: String,
    pub prefetch_count: u16,

    /// In-memory store when unset.
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,

    /// Dry-run gateway when unset.
    pub fcm_project_id: Option<String>,
    pub fcm_base_url: Option<String>,
    pub fcm_request_timeout_ms: u64,

    pub token_policy: TokenPolicy,

    pub geo_radius_km: f64,
    pub geo_inner_ratio: f64,
    pub geo_boundary_probability: f64,
    pub geo_unknown_location_probability: f64,
    pub rng_seed: Option<u64>,

    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,

    pub circuit_breaker_error_rate_threshold: f64,
    pub circuit_breaker_reset_timeout_seconds: u64,
    pub circuit_breaker_reduced_timeout_seconds: u64,
    pub circuit_breaker_success_threshold: u32,
    pub circuit_breaker_close_after_successes: u32,

    pub cache_ttl_seconds: u64,
    pub recipient_cache_capacity: usize,
    pub entity_cache_capacity: usize,
    pub location_cache_capacity: usize,

    pub max_retry_attempts: u32,
    pub retry_base_delay_minutes: u64,
    pub retry_max_delay_minutes: u64,
    pub retry_backoff_multiplier: u64,
    pub retry_batch_limit: usize,
    pub retry_stale_after_hours: i64,

    pub daily_quota: u64,
    pub quota_mode: ReservationMode,
    pub utc_offset_minutes: i32,

    pub dead_letter_retention_days: i64,
    pub dead_letter_unclassified: bool,

    pub retry_interval_seconds: u64,
    pub stale_sweep_interval_seconds: u64,
    pub dead_letter_sweep_interval_seconds: u64,
    pub cache_sweep_interval_seconds: u64,

    pub maintenance_mode: bool,
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rabbitmq_url: None,
            events_queue_name: "notification_events".to_string(),
            prefetch_count: 10,

            redis_url: None,
            redis_key_prefix: "push_fanout".to_string(),

            fcm_project_id: None,
            fcm_base_url: None,
            fcm_request_timeout_ms: 10_000,

            token_policy: TokenPolicy::OnePerUser,

            geo_radius_km: 30.0,
            geo_inner_ratio: 0.8,
            geo_boundary_probability: 0.5,
            geo_unknown_location_probability: 0.3,
            rng_seed: None,

            batch_size: 100,
            inter_batch_delay_ms: 1000,

            circuit_breaker_error_rate_threshold: 0.3,
            circuit_breaker_reset_timeout_seconds: 60,
            circuit_breaker_reduced_timeout_seconds: 30,
            circuit_breaker_success_threshold: 10,
            circuit_breaker_close_after_successes: 5,

            cache_ttl_seconds: 300,
            recipient_cache_capacity: 16,
            entity_cache_capacity: 1000,
            location_cache_capacity: 500,

            max_retry_attempts: 6,
            retry_base_delay_minutes: 5,
            retry_max_delay_minutes: 300,
            retry_backoff_multiplier: 2,
            retry_batch_limit: 50,
            retry_stale_after_hours: 24,

            daily_quota: 10_000,
            quota_mode: ReservationMode::AllowPartial,
            utc_offset_minutes: 7 * 60,

            dead_letter_retention_days: 7,
            dead_letter_unclassified: true,

            retry_interval_seconds: 5 * 60,
            stale_sweep_interval_seconds: 60 * 60,
            dead_letter_sweep_interval_seconds: 24 * 60 * 60,
            cache_sweep_interval_seconds: 60,

            maintenance_mode: false,
            server_port: 8080,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid environmental variable: {}", e))?;
        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts.max(1),
            base_delay_minutes: self.retry_base_delay_minutes,
            max_delay_minutes: self.retry_max_delay_minutes,
            backoff_multiplier: self.retry_backoff_multiplier,
            batch_limit: self.retry_batch_limit,
            stale_after_hours: self.retry_stale_after_hours,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            error_rate_threshold: self.circuit_breaker_error_rate_threshold,
            reset_timeout_seconds: self.circuit_breaker_reset_timeout_seconds,
            reduced_timeout_seconds: self.circuit_breaker_reduced_timeout_seconds,
            success_threshold: self.circuit_breaker_success_threshold,
            close_after_successes: self.circuit_breaker_close_after_successes,
        }
    }

    pub fn geo_filter_config(&self) -> GeoFilterConfig {
        GeoFilterConfig {
            radius_km: self.geo_radius_km,
            inner_ratio: self.geo_inner_ratio,
            boundary_probability: self.geo_boundary_probability,
            unknown_location_probability: self.geo_unknown_location_probability,
        }
    }

    pub fn recipient_cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl_seconds: self.cache_ttl_seconds,
            capacity: self.recipient_cache_capacity,
        }
    }

    pub fn entity_cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl_seconds: self.cache_ttl_seconds,
            capacity: self.entity_cache_capacity,
        }
    }

    pub fn location_cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl_seconds: self.cache_ttl_seconds,
            capacity: self.location_cache_capacity,
        }
    }

    pub fn quota_config(&self) -> QuotaConfig {
        QuotaConfig {
            daily_limit: self.daily_quota,
            mode: self.quota_mode,
            utc_offset_minutes: self.utc_offset_minutes,
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            batch_size: self.batch_size,
            inter_batch_delay: Duration::from_millis(self.inter_batch_delay_ms),
        }
    }

    pub fn sweep_schedule(&self) -> SweepSchedule {
        SweepSchedule {
            retry_interval: Duration::from_secs(self.retry_interval_seconds.max(1)),
            stale_sweep_interval: Duration::from_secs(self.stale_sweep_interval_seconds.max(1)),
            dead_letter_sweep_interval: Duration::from_secs(
                self.dead_letter_sweep_interval_seconds.max(1),
            ),
            cache_sweep_interval: Duration::from_secs(self.cache_sweep_interval_seconds.max(1)),
        }
    }
}
