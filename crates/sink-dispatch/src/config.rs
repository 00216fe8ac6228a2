// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use crate::http::{HttpRequest, Method};
use std::env;
use std::time::Duration;

pub const DEFAULT_MAX_RETRY_INTERVAL_SECS: u32 = 3600;
pub const DEFAULT_MIN_RETRY_INTERVAL_SECS: u32 = 30;
pub const DEFAULT_RETRY_INTERVAL_UP_RATIO: f64 = 1.5;
pub const DEFAULT_CONCURRENCY_DOWN_RATIO: f64 = 0.5;

/// Tuning knobs of a single [`crate::ConcurrencyLimiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    /// Label used in logs to identify the destination.
    pub description: String,
    /// Upper bound on simultaneous in-flight sends.
    pub max_concurrency: u32,
    pub max_retry_interval_secs: u32,
    pub min_retry_interval_secs: u32,
    /// Growth factor applied to the backoff on every overload signal.
    pub retry_interval_up_ratio: f64,
    /// Shrink factor applied to the concurrency budget on every overload signal.
    pub concurrency_down_ratio: f64,
}

impl LimiterConfig {
    pub fn new(description: impl Into<String>, max_concurrency: u32) -> Self {
        Self {
            description: description.into(),
            max_concurrency,
            max_retry_interval_secs: DEFAULT_MAX_RETRY_INTERVAL_SECS,
            min_retry_interval_secs: DEFAULT_MIN_RETRY_INTERVAL_SECS,
            retry_interval_up_ratio: DEFAULT_RETRY_INTERVAL_UP_RATIO,
            concurrency_down_ratio: DEFAULT_CONCURRENCY_DOWN_RATIO,
        }
    }

    #[must_use]
    pub fn with_retry_interval_secs(mut self, min: u32, max: u32) -> Self {
        self.min_retry_interval_secs = min;
        self.max_retry_interval_secs = max;
        self
    }

    #[must_use]
    pub fn with_ratios(mut self, retry_interval_up: f64, concurrency_down: f64) -> Self {
        self.retry_interval_up_ratio = retry_interval_up;
        self.concurrency_down_ratio = concurrency_down;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "{}: max concurrency must be greater than 0",
                self.description
            )));
        }
        if self.min_retry_interval_secs == 0
            || self.min_retry_interval_secs > self.max_retry_interval_secs
        {
            return Err(ConfigError::InvalidConfig(format!(
                "{}: retry interval bounds must satisfy 0 < min ({}) <= max ({})",
                self.description, self.min_retry_interval_secs, self.max_retry_interval_secs
            )));
        }
        if self.retry_interval_up_ratio.is_nan() || self.retry_interval_up_ratio <= 1.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "{}: retry interval up ratio must be greater than 1, got {}",
                self.description, self.retry_interval_up_ratio
            )));
        }
        if self.concurrency_down_ratio.is_nan()
            || self.concurrency_down_ratio <= 0.0
            || self.concurrency_down_ratio >= 1.0
        {
            return Err(ConfigError::InvalidConfig(format!(
                "{}: concurrency down ratio must be within (0, 1), got {}",
                self.description, self.concurrency_down_ratio
            )));
        }
        Ok(())
    }
}

/// Configuration of the dispatch layer, read from `SINK_*` environment variables.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Budget of each region-class limiter.
    pub region_max_concurrency: u32,
    /// Budget of each project-class limiter.
    pub project_max_concurrency: u32,
    /// Budget of each logstore-class limiter.
    pub logstore_max_concurrency: u32,
    pub min_retry_interval_secs: u32,
    pub max_retry_interval_secs: u32,
    pub retry_interval_up_ratio: f64,
    pub concurrency_down_ratio: f64,
    /// Immediate attempts per request before giving up.
    pub max_try_cnt: u32,
    pub request_timeout: Duration,
    /// Local interface name or address outbound connections bind to.
    pub bind_interface: Option<String>,
    /// How often denied requests are polled for admission again.
    pub admission_poll: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            region_max_concurrency: 100,
            project_max_concurrency: 20,
            logstore_max_concurrency: 10,
            min_retry_interval_secs: DEFAULT_MIN_RETRY_INTERVAL_SECS,
            max_retry_interval_secs: DEFAULT_MAX_RETRY_INTERVAL_SECS,
            retry_interval_up_ratio: DEFAULT_RETRY_INTERVAL_UP_RATIO,
            concurrency_down_ratio: DEFAULT_CONCURRENCY_DOWN_RATIO,
            max_try_cnt: 3,
            request_timeout: Duration::from_secs(15),
            bind_interface: None,
            admission_poll: Duration::from_millis(100),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}

impl DispatchConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            region_max_concurrency: env_parse("SINK_MAX_SEND_CONCURRENCY")
                .unwrap_or(defaults.region_max_concurrency),
            project_max_concurrency: env_parse("SINK_PROJECT_MAX_SEND_CONCURRENCY")
                .unwrap_or(defaults.project_max_concurrency),
            logstore_max_concurrency: env_parse("SINK_LOGSTORE_MAX_SEND_CONCURRENCY")
                .unwrap_or(defaults.logstore_max_concurrency),
            min_retry_interval_secs: env_parse("SINK_MIN_RETRY_INTERVAL_SECS")
                .unwrap_or(defaults.min_retry_interval_secs),
            max_retry_interval_secs: env_parse("SINK_MAX_RETRY_INTERVAL_SECS")
                .unwrap_or(defaults.max_retry_interval_secs),
            retry_interval_up_ratio: defaults.retry_interval_up_ratio,
            concurrency_down_ratio: defaults.concurrency_down_ratio,
            max_try_cnt: env_parse("SINK_MAX_TRY_CNT").unwrap_or(defaults.max_try_cnt),
            request_timeout: env_parse("SINK_REQUEST_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            bind_interface: env::var("SINK_BIND_INTERFACE")
                .ok()
                .map(|val| val.trim().to_string())
                .filter(|val| !val.is_empty()),
            admission_poll: env_parse("SINK_ADMISSION_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.admission_poll),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_try_cnt == 0 {
            return Err(ConfigError::InvalidConfig(
                "SINK_MAX_TRY_CNT must be greater than 0".to_string(),
            ));
        }
        if self.admission_poll.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "SINK_ADMISSION_POLL_MS must be greater than 0".to_string(),
            ));
        }
        for category in ["region", "project", "logstore"] {
            self.limiter_config(category, category).validate()?;
        }
        Ok(())
    }

    /// A request to `host` carrying this configuration's timeout, try count and bind interface.
    pub fn new_request(
        &self,
        method: Method,
        https: bool,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> HttpRequest {
        let request = HttpRequest::new(method, https, host, port, path)
            .with_timeout(self.request_timeout)
            .with_max_try_cnt(self.max_try_cnt);
        match &self.bind_interface {
            Some(interface) => request.with_bind_interface(interface.clone()),
            None => request,
        }
    }

    /// Limiter settings for a destination of the given category.
    ///
    /// Unknown categories get the logstore budget, the most conservative one.
    pub fn limiter_config(&self, category: &str, description: &str) -> LimiterConfig {
        let max_concurrency = match category {
            "region" => self.region_max_concurrency,
            "project" => self.project_max_concurrency,
            _ => self.logstore_max_concurrency,
        };
        LimiterConfig::new(description, max_concurrency)
            .with_retry_interval_secs(self.min_retry_interval_secs, self.max_retry_interval_secs)
            .with_ratios(self.retry_interval_up_ratio, self.concurrency_down_ratio)
    }
}
