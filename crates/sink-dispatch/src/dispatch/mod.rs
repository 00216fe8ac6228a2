// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Admission and immediate-retry execution of outbound sends.
//!
//! # Outcome classification
//!
//! | Attempt result                         | Error                        | Limiter       | Retried |
//! |----------------------------------------|------------------------------|---------------|---------|
//! | 2xx                                    | none                         | `on_success`  | -       |
//! | 408, 429, 5xx                          | [`DispatchError::Overload`]  | `on_fail`     | no      |
//! | any other status                       | [`DispatchError::Client`]    | untouched     | no      |
//! | connect / timeout / reset / body error | [`DispatchError::Transport`] | untouched     | yes     |
//! | transport handle could not be built    | [`DispatchError::Setup`]     | untouched     | no      |
//!
//! Immediate retries only cover transport faults. Back-pressure for an overloaded destination
//! comes from the limiter's backoff, never from looping here.

mod service;

pub use service::{DispatchCommand, DispatchHandle, DispatchService, SendItem};

use crate::errors::{DispatchError, TransportError};
use crate::http::{HttpRequest, HttpResponse, StatusCode, TransportClient};
use crate::limiter::{AdmissionDecision, LimiterRef};
use crate::metrics::SinkMetrics;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// In-flight slots held on every limiter that admitted a send.
///
/// Dropping the admission releases the slots, so a send that is cancelled mid-flight still
/// gives its budget back.
#[derive(Debug)]
pub struct Admission {
    held: Vec<(LimiterRef, AdmissionDecision)>,
    outcome_reported: bool,
}

impl Admission {
    /// Poll each limiter in order and take a slot on all of them, or on none.
    pub fn try_acquire(limiters: &[LimiterRef]) -> Result<Self, DispatchError> {
        let mut held = Vec::with_capacity(limiters.len());
        for limiter_ref in limiters {
            let decision = limiter_ref.limiter.poll_admission();
            if !decision.is_admitted() {
                for (granted, decision) in held {
                    release_probe(&granted, decision);
                }
                return Err(DispatchError::Rejected {
                    category: limiter_ref.category.clone(),
                });
            }
            held.push((limiter_ref.clone(), decision));
        }
        for (limiter_ref, _) in &held {
            limiter_ref.limiter.post_pop();
        }
        Ok(Self {
            held,
            outcome_reported: false,
        })
    }

    /// Whether this send is the probe of at least one tripped limiter.
    pub fn is_probe(&self) -> bool {
        self.held
            .iter()
            .any(|(_, decision)| decision.is_probe())
    }

    pub fn report_success(&mut self) {
        for (limiter_ref, _) in &self.held {
            limiter_ref.limiter.on_success();
        }
        self.outcome_reported = true;
    }

    /// Budget of the tightest limiter in the chain.
    pub fn concurrency(&self) -> u32 {
        self.held
            .iter()
            .map(|(limiter_ref, _)| limiter_ref.limiter.current_concurrency())
            .min()
            .unwrap_or_default()
    }

    /// Report overload to every held limiter. A limiter whose probe is someone else's keeps
    /// waiting for that probe.
    pub fn report_overload(&mut self) {
        for (limiter_ref, decision) in &self.held {
            limiter_ref.limiter.on_fail_from(*decision);
        }
        self.outcome_reported = true;
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        for (limiter_ref, decision) in &self.held {
            if !self.outcome_reported {
                release_probe(limiter_ref, *decision);
            }
            limiter_ref.limiter.on_send_done();
        }
    }
}

fn release_probe(limiter_ref: &LimiterRef, decision: AdmissionDecision) {
    if let AdmissionDecision::Probe(ticket) = decision {
        limiter_ref.limiter.abandon_probe(ticket);
    }
}

/// Map a response status to the outcome reported to limiters.
pub fn classify_status(status: StatusCode) -> Result<(), DispatchError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        return Err(DispatchError::Overload { status });
    }
    Err(DispatchError::Client { status })
}

/// Runs admitted sends against a transport.
#[derive(Clone)]
pub struct Executor {
    transport: Arc<dyn TransportClient>,
    metrics: Arc<SinkMetrics>,
}

impl Executor {
    pub fn new(transport: Arc<dyn TransportClient>, metrics: Arc<SinkMetrics>) -> Self {
        Self { transport, metrics }
    }

    /// Send `request`, retrying transport faults immediately up to `max_try_cnt` attempts, and
    /// report the outcome to the limiters behind `admission`.
    ///
    /// `request.try_cnt` is left at the attempt that produced the result, so a caller that
    /// re-queues the request can see how far it got.
    pub async fn execute(
        &self,
        request: &mut HttpRequest,
        mut admission: Admission,
    ) -> Result<HttpResponse, DispatchError> {
        let start = Instant::now();
        let result = loop {
            match self.transport.send(request).await {
                Ok(response) => {
                    break classify_status(response.status).map(|()| response);
                }
                Err(TransportError::Setup(message)) => break Err(DispatchError::Setup(message)),
                Err(TransportError::Io(message)) if request.try_cnt < request.max_try_cnt => {
                    warn!(
                        "DISPATCH | failed to send request to {}, retry immediately: try cnt {}, error {}",
                        request.host, request.try_cnt, message
                    );
                    request.try_cnt += 1;
                }
                Err(TransportError::Io(message)) => {
                    break Err(DispatchError::Transport {
                        attempts: request.try_cnt,
                        message,
                    });
                }
            }
        };
        let elapsed = start.elapsed();

        match &result {
            Ok(_) => {
                admission.report_success();
                self.metrics.record_success(elapsed);
                debug!(
                    "DISPATCH | sent request to {} in {} ms after {} attempts",
                    request.host,
                    elapsed.as_millis(),
                    request.try_cnt
                );
            }
            Err(err) => {
                if let DispatchError::Overload { .. } = err {
                    admission.report_overload();
                }
                self.metrics.record_failure(elapsed);
                error!(
                    "DISPATCH | failed to send request to {} after {} ms and {} attempts: {}",
                    request.host,
                    elapsed.as_millis(),
                    request.try_cnt,
                    err
                );
            }
        }
        self.metrics.set_send_concurrency(admission.concurrency());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use crate::limiter::ConcurrencyLimiter;
    use crate::metrics::{OUT_FAILED_ITEMS_TOTAL, OUT_SUCCESSFUL_ITEMS_TOTAL, SEND_CONCURRENCY};
    use crate::testing::{LimiterInspect, ScriptedTransport};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn limiter(category: &str, max_concurrency: u32) -> LimiterRef {
        LimiterRef::new(
            category,
            Arc::new(ConcurrencyLimiter::new(category, max_concurrency)),
        )
    }

    fn request(max_try_cnt: u32) -> HttpRequest {
        HttpRequest::new(
            Method::POST,
            true,
            "cn-hangzhou.log.example.com",
            443,
            "/logstores/app",
        )
        .with_max_try_cnt(max_try_cnt)
    }

    fn executor(transport: &Arc<ScriptedTransport>) -> (Executor, Arc<SinkMetrics>) {
        let metrics = Arc::new(SinkMetrics::new());
        (Executor::new(transport.clone(), metrics.clone()), metrics)
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK).is_ok());
        assert!(classify_status(StatusCode::NO_CONTENT).is_ok());
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(matches!(
                classify_status(status),
                Err(DispatchError::Overload { .. })
            ));
        }
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::PAYLOAD_TOO_LARGE,
            StatusCode::MOVED_PERMANENTLY,
        ] {
            assert!(matches!(
                classify_status(status),
                Err(DispatchError::Client { .. })
            ));
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_transport_faults_retried_then_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Io("connection reset".to_string())),
            Err(TransportError::Io("dns lookup failed".to_string())),
            Ok(StatusCode::OK),
        ]));
        let (executor, metrics) = executor(&transport);
        let region = limiter("region", 10);
        region.limiter.set_current_limit(3);

        let mut request = request(3);
        let admission = Admission::try_acquire(std::slice::from_ref(&region)).expect("admitted");
        let response = executor
            .execute(&mut request, admission)
            .await
            .expect("should succeed");

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(transport.calls(), 3);
        assert_eq!(request.try_cnt, 3);
        // One success report, not one per attempt.
        assert_eq!(region.limiter.current_limit(), 4);
        assert_eq!(region.limiter.in_sending_count(), 0);
        assert_eq!(metrics.get(OUT_SUCCESSFUL_ITEMS_TOTAL), 1);
        assert_eq!(metrics.get(SEND_CONCURRENCY), 4);
        assert!(logs_contain("retry immediately"));
    }

    #[tokio::test]
    async fn test_transport_faults_exhausted() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Io("timed out".to_string())),
            Err(TransportError::Io("timed out".to_string())),
            Err(TransportError::Io("timed out".to_string())),
            Ok(StatusCode::OK),
        ]));
        let (executor, metrics) = executor(&transport);
        let region = limiter("region", 10);

        let mut request = request(3);
        let admission = Admission::try_acquire(std::slice::from_ref(&region)).expect("admitted");
        let err = executor
            .execute(&mut request, admission)
            .await
            .expect_err("should fail");

        assert!(matches!(err, DispatchError::Transport { attempts: 3, .. }));
        assert_eq!(transport.calls(), 3);
        assert!(!region.limiter.is_tripped());
        assert_eq!(region.limiter.current_limit(), 10);
        assert_eq!(region.limiter.in_sending_count(), 0);
        assert_eq!(metrics.get(OUT_FAILED_ITEMS_TOTAL), 1);
    }

    #[tokio::test]
    async fn test_overload_trips_every_limiter_without_retry() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(
            StatusCode::SERVICE_UNAVAILABLE,
        )]));
        let (executor, metrics) = executor(&transport);
        let chain = vec![limiter("region", 10), limiter("project", 4)];

        let mut request = request(3);
        let admission = Admission::try_acquire(&chain).expect("admitted");
        let err = executor
            .execute(&mut request, admission)
            .await
            .expect_err("should fail");

        assert!(matches!(
            err,
            DispatchError::Overload {
                status: StatusCode::SERVICE_UNAVAILABLE
            }
        ));
        assert_eq!(transport.calls(), 1);
        assert!(chain[0].limiter.is_tripped());
        assert!(chain[1].limiter.is_tripped());
        assert_eq!(chain[0].limiter.current_limit(), 5);
        assert_eq!(chain[1].limiter.current_limit(), 2);
        assert_eq!(chain[0].limiter.current_interval(), 45);
        assert_eq!(chain[0].limiter.in_sending_count(), 0);
        assert_eq!(metrics.get(SEND_CONCURRENCY), 2);
    }

    #[tokio::test]
    async fn test_client_error_leaves_limiter_alone() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(StatusCode::BAD_REQUEST)]));
        let (executor, _) = executor(&transport);
        let region = limiter("region", 10);
        region.limiter.set_current_limit(6);

        let mut request = request(3);
        let admission = Admission::try_acquire(std::slice::from_ref(&region)).expect("admitted");
        let err = executor
            .execute(&mut request, admission)
            .await
            .expect_err("should fail");

        assert!(matches!(err, DispatchError::Client { .. }));
        assert_eq!(transport.calls(), 1);
        assert!(!region.limiter.is_tripped());
        assert_eq!(region.limiter.current_limit(), 6);
        assert_eq!(region.limiter.current_interval(), 30);
    }

    #[tokio::test]
    async fn test_setup_fault_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(TransportError::Setup(
            "invalid CA file".to_string(),
        ))]));
        let (executor, _) = executor(&transport);
        let region = limiter("region", 10);

        let mut request = request(5);
        let admission = Admission::try_acquire(std::slice::from_ref(&region)).expect("admitted");
        let err = executor
            .execute(&mut request, admission)
            .await
            .expect_err("should fail");

        assert!(matches!(err, DispatchError::Setup(_)));
        assert_eq!(transport.calls(), 1);
        assert!(!region.limiter.is_tripped());
    }

    #[test]
    fn test_admission_is_all_or_nothing() {
        let region = limiter("region", 10);
        let logstore = limiter("logstore", 1);
        logstore.limiter.post_pop();

        let err = Admission::try_acquire(&[region.clone(), logstore.clone()])
            .expect_err("logstore is saturated");
        assert!(matches!(err, DispatchError::Rejected { category } if category == "logstore"));
        assert_eq!(region.limiter.in_sending_count(), 0);
        assert_eq!(logstore.limiter.in_sending_count(), 1);
    }

    #[test]
    fn test_dropped_admission_releases_slots() {
        let chain = vec![limiter("region", 2), limiter("project", 2)];
        let first = Admission::try_acquire(&chain).expect("admitted");
        let second = Admission::try_acquire(&chain).expect("admitted");
        assert!(Admission::try_acquire(&chain).is_err());
        assert_eq!(chain[0].limiter.in_sending_count(), 2);

        drop(first);
        drop(second);
        assert_eq!(chain[0].limiter.in_sending_count(), 0);
        assert_eq!(chain[1].limiter.in_sending_count(), 0);
        assert!(Admission::try_acquire(&chain).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_chain_gives_probe_back() {
        let region = limiter("region", 10);
        let logstore = limiter("logstore", 1);
        region.limiter.on_fail();
        tokio::time::advance(Duration::from_secs(45)).await;
        logstore.limiter.post_pop();

        // Region grants its probe, logstore denies, so the probe must be returned.
        assert!(Admission::try_acquire(&[region.clone(), logstore.clone()]).is_err());
        tokio::time::advance(Duration::from_secs(45)).await;
        let probe = Admission::try_acquire(std::slice::from_ref(&region)).expect("probe");
        assert!(probe.is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overload_from_early_send_keeps_probe_exclusive() {
        let region = limiter("region", 10);
        let mut first = Admission::try_acquire(std::slice::from_ref(&region)).expect("admitted");
        let mut second = Admission::try_acquire(std::slice::from_ref(&region)).expect("admitted");
        first.report_overload();
        drop(first);

        tokio::time::advance(Duration::from_secs(45)).await;
        let probe = Admission::try_acquire(std::slice::from_ref(&region)).expect("probe");
        assert!(probe.is_probe());

        second.report_overload();
        drop(second);
        assert_eq!(region.limiter.current_interval(), 67);
        tokio::time::advance(Duration::from_secs(67)).await;
        assert!(Admission::try_acquire(std::slice::from_ref(&region)).is_err());
        assert_eq!(region.limiter.in_sending_count(), 1);

        // The probe ends without a verdict; the backoff has already run out since its admission.
        drop(probe);
        let next = Admission::try_acquire(std::slice::from_ref(&region)).expect("next probe");
        assert!(next.is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_probe_reopens_limiter() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(StatusCode::OK)]));
        let (executor, _) = executor(&transport);
        let region = limiter("region", 10);
        region.limiter.on_fail();
        assert!(Admission::try_acquire(std::slice::from_ref(&region)).is_err());

        tokio::time::advance(Duration::from_secs(45)).await;
        let probe = Admission::try_acquire(std::slice::from_ref(&region)).expect("probe");
        assert!(probe.is_probe());
        assert!(Admission::try_acquire(std::slice::from_ref(&region)).is_err());

        executor
            .execute(&mut request(3), probe)
            .await
            .expect("should succeed");
        assert!(!region.limiter.is_tripped());
        assert_eq!(region.limiter.current_limit(), 6);
        assert!(Admission::try_acquire(std::slice::from_ref(&region)).is_ok());
    }
}
