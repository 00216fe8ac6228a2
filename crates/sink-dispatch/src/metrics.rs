// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dispatch counters handed to the agent's metrics registry.
//!
//! Nothing here exports anything: [`SinkMetrics::snapshot`] is the hook an exporter polls.

use crate::limiter::limiter_metric_name;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub const OUT_SUCCESSFUL_ITEMS_TOTAL: &str = "runner_out_successful_items_total";
pub const OUT_FAILED_ITEMS_TOTAL: &str = "runner_out_failed_items_total";
pub const SUCCESSFUL_ITEM_TOTAL_RESPONSE_TIME_MS: &str =
    "runner_successful_item_total_response_time_ms";
pub const FAILED_ITEM_TOTAL_RESPONSE_TIME_MS: &str = "runner_failed_item_total_response_time_ms";
pub const SENDING_ITEMS_TOTAL: &str = "runner_sending_items_total";
pub const SEND_CONCURRENCY: &str = "runner_send_concurrency";

pub const FETCH_REJECTED_BY_REGION_LIMITER_TIMES_TOTAL: &str =
    "runner_fetch_rejected_by_region_limiter_times_total";
pub const FETCH_REJECTED_BY_PROJECT_LIMITER_TIMES_TOTAL: &str =
    "runner_fetch_rejected_by_project_limiter_times_total";
pub const FETCH_REJECTED_BY_LOGSTORE_LIMITER_TIMES_TOTAL: &str =
    "runner_fetch_rejected_by_logstore_limiter_times_total";

#[derive(Debug, Default)]
pub struct SinkMetrics {
    out_successful_items: AtomicU64,
    out_failed_items: AtomicU64,
    successful_response_time_ms: AtomicU64,
    failed_response_time_ms: AtomicU64,
    sending_items: AtomicU64,
    send_concurrency: AtomicU64,
    rejected: Mutex<BTreeMap<String, u64>>,
}

impl SinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.out_successful_items.fetch_add(1, Ordering::Relaxed);
        self.successful_response_time_ms
            .fetch_add(duration_ms(elapsed), Ordering::Relaxed);
    }

    pub fn record_failure(&self, elapsed: Duration) {
        self.out_failed_items.fetch_add(1, Ordering::Relaxed);
        self.failed_response_time_ms
            .fetch_add(duration_ms(elapsed), Ordering::Relaxed);
    }

    /// Count a fetch denied by a limiter of the given category.
    pub fn record_rejection(&self, category: &str) {
        let mut rejected = self.rejected.lock().unwrap_or_else(PoisonError::into_inner);
        *rejected
            .entry(limiter_metric_name(category).to_string())
            .or_default() += 1;
    }

    /// Count a send in `runner_sending_items_total` until the returned guard is dropped.
    pub fn track_sending(self: &Arc<Self>) -> SendingItem {
        self.sending_items.fetch_add(1, Ordering::Relaxed);
        SendingItem {
            metrics: Arc::clone(self),
        }
    }

    /// Budget of the limiter chain that reported last, i.e. its tightest limiter.
    pub fn set_send_concurrency(&self, concurrency: u32) {
        self.send_concurrency.store(u64::from(concurrency), Ordering::Relaxed);
    }

    /// All counters keyed by metric name.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let mut values: BTreeMap<String, u64> = [
            (OUT_SUCCESSFUL_ITEMS_TOTAL, &self.out_successful_items),
            (OUT_FAILED_ITEMS_TOTAL, &self.out_failed_items),
            (
                SUCCESSFUL_ITEM_TOTAL_RESPONSE_TIME_MS,
                &self.successful_response_time_ms,
            ),
            (
                FAILED_ITEM_TOTAL_RESPONSE_TIME_MS,
                &self.failed_response_time_ms,
            ),
            (SENDING_ITEMS_TOTAL, &self.sending_items),
            (SEND_CONCURRENCY, &self.send_concurrency),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.load(Ordering::Relaxed)))
        .collect();
        let rejected = self.rejected.lock().unwrap_or_else(PoisonError::into_inner);
        values.extend(rejected.iter().map(|(name, count)| (name.clone(), *count)));
        values
    }

    /// Value of a single counter, zero if it was never recorded.
    pub fn get(&self, name: &str) -> u64 {
        self.snapshot().get(name).copied().unwrap_or_default()
    }
}

/// One live send counted by [`SinkMetrics::track_sending`].
#[derive(Debug)]
pub struct SendingItem {
    metrics: Arc<SinkMetrics>,
}

impl Drop for SendingItem {
    fn drop(&mut self) {
        self.metrics.sending_items.fetch_sub(1, Ordering::Relaxed);
    }
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
