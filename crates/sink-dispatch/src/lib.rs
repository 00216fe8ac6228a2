// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adaptive admission control and immediate-retry dispatch for telemetry sinks.
//!
//! Outbound batches are gated per destination by a [`ConcurrencyLimiter`], which grows its
//! budget slowly on success and shrinks it sharply when the destination signals overload.
//! The [`dispatch`] module drives a bounded immediate-retry loop over a [`TransportClient`]
//! and reports each terminal outcome back to the limiters that admitted the request.
//!
//! ```text
//!   submit ──> DispatchService ──> Admission (limiters) ──> execute ──> TransportClient
//!                  ^    │ denied                               │
//!                  └────┘ re-poll                              └─> on_success / on_fail
//! ```

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod config;
pub mod dispatch;
pub mod errors;
pub mod http;
pub mod limiter;
pub mod metrics;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use dispatch::{Admission, DispatchHandle, DispatchService, Executor};
pub use errors::DispatchError;
pub use http::{HttpRequest, HttpResponse, TransportClient};
pub use limiter::{
    limiter_metric_name, AdmissionDecision, ConcurrencyLimiter, LimiterRef, LimiterRegistry,
    ProbeTicket,
};
