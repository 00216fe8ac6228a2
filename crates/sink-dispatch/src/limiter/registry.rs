// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::ConcurrencyLimiter;
use crate::config::DispatchConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// A limiter together with the category it gates (`region`, `project`, `logstore`, ...).
#[derive(Debug, Clone)]
pub struct LimiterRef {
    pub category: String,
    pub limiter: Arc<ConcurrencyLimiter>,
}

impl LimiterRef {
    pub fn new(category: impl Into<String>, limiter: Arc<ConcurrencyLimiter>) -> Self {
        Self {
            category: category.into(),
            limiter,
        }
    }
}

/// Owns one limiter per destination, created on first use.
///
/// Build one registry per runner and hand it to every worker; destinations never share a
/// limiter, so unrelated destinations never contend.
#[derive(Debug)]
pub struct LimiterRegistry {
    config: DispatchConfig,
    limiters: Mutex<HashMap<(String, String), Arc<ConcurrencyLimiter>>>,
}

impl LimiterRegistry {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// The limiter for `key` within `category`, creating it with the category budget.
    pub fn get_or_create(&self, category: &str, key: &str) -> LimiterRef {
        let mut limiters = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        let limiter = limiters
            .entry((category.to_string(), key.to_string()))
            .or_insert_with(|| {
                let config = self
                    .config
                    .limiter_config(category, &format!("{category}:{key}"));
                debug!(
                    "LIMITER | creating {} with max concurrency {}",
                    config.description, config.max_concurrency
                );
                Arc::new(ConcurrencyLimiter::from_config(&config))
            })
            .clone();
        LimiterRef::new(category, limiter)
    }

    /// The region, project and logstore limiters that gate a send to one logstore.
    pub fn limiters_for(&self, region: &str, project: &str, logstore: &str) -> Vec<LimiterRef> {
        vec![
            self.get_or_create("region", region),
            self.get_or_create("project", project),
            self.get_or_create("logstore", &format!("{project}#{logstore}")),
        ]
    }

    pub fn len(&self) -> usize {
        self.limiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
