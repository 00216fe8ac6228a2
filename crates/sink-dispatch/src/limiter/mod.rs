// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-destination admission control.
//!
//! A [`ConcurrencyLimiter`] admits sends while fewer than its current budget are in flight.
//! Overload shrinks the budget multiplicatively and trips the limiter: once tripped, nothing
//! is admitted until the backoff interval elapses, after which a single probe is let through.
//! A successful outcome closes the limiter again and grows the budget by one.
//!
//! ```text
//!            in_flight < budget                 on_fail
//!   ┌──────┐ ───────────────────> ┌───────────┐ ─────────> ┌─────────┐
//!   │ Open │                      │ Saturated │            │ Tripped │ ──┐ on_fail
//!   └──────┘ <─────────────────── └───────────┘            └─────────┘ <─┘ (probe failed)
//!       ^        slot released                                  │
//!       └──────────────────── on_success (probe) ───────────────┘
//! ```
//!
//! The in-flight counter is a lone atomic so polling stays cheap; the budget, backoff and trip
//! state change together under one mutex.

mod registry;

pub use registry::{LimiterRef, LimiterRegistry};

use crate::config::LimiterConfig;
use crate::metrics::{
    FETCH_REJECTED_BY_LOGSTORE_LIMITER_TIMES_TOTAL, FETCH_REJECTED_BY_PROJECT_LIMITER_TIMES_TOTAL,
    FETCH_REJECTED_BY_REGION_LIMITER_TIMES_TOTAL,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Identifies one probe of a tripped limiter, so only that probe's report resolves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTicket(u64);

/// Result of polling a limiter for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// No slot available, or the limiter is backing off.
    Denied,
    /// A regular slot below the current budget.
    Granted,
    /// The single request let through a tripped limiter after its backoff elapsed.
    Probe(ProbeTicket),
}

impl AdmissionDecision {
    #[must_use]
    pub fn is_admitted(self) -> bool {
        !matches!(self, Self::Denied)
    }

    #[must_use]
    pub fn is_probe(self) -> bool {
        matches!(self, Self::Probe(_))
    }
}

#[derive(Debug)]
pub(crate) struct LimiterState {
    pub(crate) current_concurrency: u32,
    pub(crate) retry_interval_secs: u32,
    pub(crate) last_check_time: Instant,
    pub(crate) tripped: bool,
    /// Outstanding probe of the current trip, if any. Only set while tripped.
    pub(crate) probe: Option<ProbeTicket>,
    next_probe: u64,
}

/// Adaptive concurrency gate for one destination (region, project, logstore, ...).
///
/// Created once per destination and shared through an `Arc` by every worker sending to it.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    description: String,
    max_concurrency: u32,
    max_retry_interval_secs: u32,
    min_retry_interval_secs: u32,
    retry_interval_up_ratio: f64,
    concurrency_down_ratio: f64,

    pub(crate) in_sending_cnt: AtomicU32,
    // Mirrors `current_concurrency` while closed and drops to 0 while tripped, so the common
    // case is decided without taking the lock.
    pub(crate) admit_limit: AtomicU32,

    state: Mutex<LimiterState>,
}

impl ConcurrencyLimiter {
    /// Create a limiter with the default backoff settings.
    pub fn new(description: impl Into<String>, max_concurrency: u32) -> Self {
        Self::from_config(&LimiterConfig::new(description, max_concurrency))
    }

    /// Create a limiter from explicit settings.
    ///
    /// Out of range settings are clamped rather than rejected; run
    /// [`LimiterConfig::validate`] first to surface them as errors.
    pub fn from_config(config: &LimiterConfig) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        let min_retry_interval_secs = config.min_retry_interval_secs.max(1);
        let max_retry_interval_secs = config.max_retry_interval_secs.max(min_retry_interval_secs);
        Self {
            description: config.description.clone(),
            max_concurrency,
            max_retry_interval_secs,
            min_retry_interval_secs,
            retry_interval_up_ratio: config.retry_interval_up_ratio,
            concurrency_down_ratio: config.concurrency_down_ratio,
            in_sending_cnt: AtomicU32::new(0),
            admit_limit: AtomicU32::new(max_concurrency),
            state: Mutex::new(LimiterState {
                current_concurrency: max_concurrency,
                retry_interval_secs: min_retry_interval_secs,
                last_check_time: Instant::now(),
                tripped: false,
                probe: None,
                next_probe: 0,
            }),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency
    }

    /// Current concurrency budget; shrinks on overload and grows back one step per success.
    pub fn current_concurrency(&self) -> u32 {
        self.lock_state().current_concurrency
    }

    /// Number of admitted sends that have not reported [`Self::on_send_done`] yet.
    pub fn in_sending_count(&self) -> u32 {
        self.in_sending_cnt.load(Ordering::Acquire)
    }

    /// Non-blocking admission poll.
    ///
    /// Must be followed by [`Self::post_pop`] when it returns `true`.
    pub fn is_valid_to_pop(&self) -> bool {
        self.poll_admission().is_admitted()
    }

    /// Like [`Self::is_valid_to_pop`], but tells a probe apart from a regular slot.
    pub fn poll_admission(&self) -> AdmissionDecision {
        if self.in_sending_cnt.load(Ordering::Acquire) < self.admit_limit.load(Ordering::Acquire) {
            return AdmissionDecision::Granted;
        }

        let mut state = self.lock_state();
        if !state.tripped {
            return if self.in_sending_cnt.load(Ordering::Acquire) < state.current_concurrency {
                AdmissionDecision::Granted
            } else {
                AdmissionDecision::Denied
            };
        }
        if state.probe.is_some() {
            return AdmissionDecision::Denied;
        }

        let now = Instant::now();
        let backoff = Duration::from_secs(u64::from(state.retry_interval_secs));
        if now.duration_since(state.last_check_time) < backoff {
            return AdmissionDecision::Denied;
        }
        let ticket = ProbeTicket(state.next_probe);
        state.next_probe += 1;
        state.last_check_time = now;
        state.probe = Some(ticket);
        debug!(
            "LIMITER | {}: admitting probe after {}s backoff",
            self.description, state.retry_interval_secs
        );
        AdmissionDecision::Probe(ticket)
    }

    /// Mark an admitted send as in flight.
    pub fn post_pop(&self) {
        self.in_sending_cnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Release the slot of an admitted send. Call exactly once per [`Self::post_pop`].
    pub fn on_send_done(&self) {
        if self
            .in_sending_cnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cnt| cnt.checked_sub(1))
            .is_err()
        {
            warn!(
                "LIMITER | {}: send done reported with nothing in flight",
                self.description
            );
        }
    }

    /// The destination accepted a send: reset the backoff and grow the budget by one.
    ///
    /// Any success closes a tripped limiter, whoever reports it. A probe still outstanding at
    /// that point belongs to a finished trip and its later reports no longer resolve anything.
    pub fn on_success(&self) {
        let mut state = self.lock_state();
        state.retry_interval_secs = self.min_retry_interval_secs;
        if state.current_concurrency < self.max_concurrency {
            state.current_concurrency += 1;
        }
        if state.tripped {
            debug!(
                "LIMITER | {}: destination recovered, concurrency {}",
                self.description, state.current_concurrency
            );
        }
        state.tripped = false;
        state.probe = None;
        self.admit_limit.store(state.current_concurrency, Ordering::Release);
    }

    /// The destination signaled overload: shrink the budget, grow the backoff and trip.
    ///
    /// The report is taken to be the outstanding probe's, if there is one. Callers that kept the
    /// [`AdmissionDecision`] of the failed send should use [`Self::on_fail_from`] instead.
    pub fn on_fail(&self) {
        self.record_fail(true, None);
    }

    /// Like [`Self::on_fail`], for a send admitted with `decision`.
    ///
    /// Only the outstanding probe's own report releases it; an overload reported by a send
    /// admitted before the trip still shrinks the budget but keeps other callers waiting on
    /// that probe.
    pub fn on_fail_from(&self, decision: AdmissionDecision) {
        let ticket = match decision {
            AdmissionDecision::Probe(ticket) => Some(ticket),
            AdmissionDecision::Granted | AdmissionDecision::Denied => None,
        };
        self.record_fail(false, ticket);
    }

    fn record_fail(&self, resolves_any_probe: bool, ticket: Option<ProbeTicket>) {
        let mut state = self.lock_state();
        let shrunk = (f64::from(state.current_concurrency) * self.concurrency_down_ratio).floor();
        state.current_concurrency = (shrunk as u32).clamp(1, self.max_concurrency);
        let grown = (f64::from(state.retry_interval_secs) * self.retry_interval_up_ratio).floor();
        state.retry_interval_secs =
            (grown as u32).clamp(self.min_retry_interval_secs, self.max_retry_interval_secs);
        state.last_check_time = Instant::now();
        state.tripped = true;
        if resolves_any_probe || (ticket.is_some() && state.probe == ticket) {
            state.probe = None;
        }
        self.admit_limit.store(0, Ordering::Release);
        debug!(
            "LIMITER | {}: destination overloaded, concurrency {}, retry interval {}s",
            self.description, state.current_concurrency, state.retry_interval_secs
        );
    }

    /// Give back a probe whose send ended without an overload verdict either way.
    ///
    /// The limiter stays tripped and the next probe waits for another full backoff interval.
    /// A ticket from an earlier trip is ignored.
    pub fn abandon_probe(&self, ticket: ProbeTicket) {
        let mut state = self.lock_state();
        if state.probe == Some(ticket) {
            state.probe = None;
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, LimiterState> {
        // Every update leaves the state consistent, so a panic elsewhere cannot corrupt it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Metric recording how often the given limiter category rejected a fetch.
///
/// Categories other than `region`, `project` and `logstore` are returned unchanged.
pub fn limiter_metric_name(category: &str) -> &str {
    match category {
        "region" => FETCH_REJECTED_BY_REGION_LIMITER_TIMES_TOTAL,
        "project" => FETCH_REJECTED_BY_PROJECT_LIMITER_TIMES_TOTAL,
        "logstore" => FETCH_REJECTED_BY_LOGSTORE_LIMITER_TIMES_TOTAL,
        other => other,
    }
}
