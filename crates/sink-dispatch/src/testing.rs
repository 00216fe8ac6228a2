// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers for reading and forcing limiter internals in tests.
//!
//! Compiled for this crate's own tests and behind the `test-utils` feature for downstream ones.

use crate::errors::TransportError;
use crate::http::{HttpRequest, HttpResponse, StatusCode, TransportClient};
use crate::limiter::ConcurrencyLimiter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub trait LimiterInspect {
    fn current_limit(&self) -> u32;
    fn current_interval(&self) -> u32;
    fn is_tripped(&self) -> bool;
    fn set_current_limit(&self, limit: u32);
    fn set_in_sending_count(&self, count: u32);
    /// Backdate the last trip so the backoff has already elapsed on the wall clock.
    fn expire_backoff(&self);
}

impl LimiterInspect for ConcurrencyLimiter {
    fn current_limit(&self) -> u32 {
        self.current_concurrency()
    }

    fn current_interval(&self) -> u32 {
        self.lock_state().retry_interval_secs
    }

    fn is_tripped(&self) -> bool {
        self.lock_state().tripped
    }

    fn set_current_limit(&self, limit: u32) {
        let mut state = self.lock_state();
        state.current_concurrency = limit;
        if !state.tripped {
            self.admit_limit.store(limit, Ordering::Release);
        }
    }

    fn set_in_sending_count(&self, count: u32) {
        self.in_sending_cnt.store(count, Ordering::Release);
    }

    fn expire_backoff(&self) {
        let mut state = self.lock_state();
        let backoff = Duration::from_secs(u64::from(state.retry_interval_secs));
        if let Some(earlier) = state.last_check_time.checked_sub(backoff) {
            state.last_check_time = earlier;
        }
    }
}

/// Transport that replays a fixed list of attempt results, then answers `200 OK`.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<StatusCode, TransportError>>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<StatusCode, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of attempts made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TransportClient for ScriptedTransport {
    async fn send(&self, _request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.unwrap_or(Ok(StatusCode::OK)).map(HttpResponse::new)
    }
}
