// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Admission, Executor};
use crate::config::DispatchConfig;
use crate::errors::DispatchError;
use crate::http::{HttpRequest, HttpResponse, TransportClient};
use crate::limiter::LimiterRef;
use crate::metrics::SinkMetrics;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A request waiting for admission, with the limiters that gate it.
#[derive(Debug)]
pub struct SendItem {
    request: HttpRequest,
    limiters: Vec<LimiterRef>,
    response_tx: oneshot::Sender<Result<HttpResponse, DispatchError>>,
}

#[derive(Debug)]
pub enum DispatchCommand {
    Submit(SendItem),
    Shutdown,
}

#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<DispatchCommand>,
}

impl DispatchHandle {
    /// Queue `request` behind `limiters` and wait for its terminal outcome.
    ///
    /// Requests the service cannot admit right away stay queued and are polled again, so a
    /// limiter rejection is never returned here. [`DispatchError::Shutdown`] means the service
    /// stopped before the request reached a terminal outcome.
    pub async fn submit(
        &self,
        request: HttpRequest,
        limiters: Vec<LimiterRef>,
    ) -> Result<HttpResponse, DispatchError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(DispatchCommand::Submit(SendItem {
                request,
                limiters,
                response_tx,
            }))
            .map_err(|_| DispatchError::Shutdown)?;

        response_rx.await.map_err(|_| DispatchError::Shutdown)?
    }

    /// Stop admitting, let in-flight sends finish and fail everything still queued.
    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<DispatchCommand>> {
        self.tx.send(DispatchCommand::Shutdown)
    }
}

/// Owns the queue of sends waiting for admission and the tasks of admitted ones.
pub struct DispatchService {
    executor: Executor,
    metrics: Arc<SinkMetrics>,
    rx: mpsc::UnboundedReceiver<DispatchCommand>,
    pending: VecDeque<SendItem>,
    in_flight: JoinSet<()>,
    admission_poll: Duration,
    cancel_token: CancellationToken,
}

impl DispatchService {
    pub fn new(
        transport: Arc<dyn TransportClient>,
        metrics: Arc<SinkMetrics>,
        config: &DispatchConfig,
        cancel_token: CancellationToken,
    ) -> (Self, DispatchHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        let service = Self {
            executor: Executor::new(transport, Arc::clone(&metrics)),
            metrics,
            rx,
            pending: VecDeque::new(),
            in_flight: JoinSet::new(),
            admission_poll: config.admission_poll,
            cancel_token,
        };

        (service, DispatchHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("DISPATCH | service started");
        let mut poll = tokio::time::interval(self.admission_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let graceful = loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break false,
                command = self.rx.recv() => match command {
                    Some(DispatchCommand::Submit(item)) => {
                        self.pending.push_back(item);
                        self.dispatch_pending();
                    }
                    Some(DispatchCommand::Shutdown) | None => break true,
                },
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("DISPATCH | send task failed: {e}");
                    }
                    self.dispatch_pending();
                }
                _ = poll.tick(), if !self.pending.is_empty() => self.dispatch_pending(),
            }
        };

        self.stop(graceful).await;
    }

    /// Admit every queued item the limiters allow, keeping the rest in order.
    fn dispatch_pending(&mut self) {
        let mut still_pending = VecDeque::with_capacity(self.pending.len());
        while let Some(item) = self.pending.pop_front() {
            if item.response_tx.is_closed() {
                debug!(
                    "DISPATCH | dropping request to {}: submitter gone",
                    item.request.host
                );
                continue;
            }
            match Admission::try_acquire(&item.limiters) {
                Ok(admission) => {
                    let executor = self.executor.clone();
                    let SendItem {
                        mut request,
                        response_tx,
                        ..
                    } = item;
                    let sending = self.metrics.track_sending();
                    self.in_flight.spawn(async move {
                        let result = executor.execute(&mut request, admission).await;
                        drop(sending);
                        if response_tx.send(result).is_err() {
                            debug!("DISPATCH | send result dropped: submitter gone");
                        }
                    });
                }
                Err(err) => {
                    if let DispatchError::Rejected { category } = &err {
                        self.metrics.record_rejection(category);
                    }
                    still_pending.push_back(item);
                }
            }
        }
        self.pending = still_pending;
    }

    async fn stop(mut self, graceful: bool) {
        debug!(
            "DISPATCH | service stopping with {} pending and {} in flight",
            self.pending.len(),
            self.in_flight.len()
        );
        for item in self.pending.drain(..) {
            let _ = item.response_tx.send(Err(DispatchError::Shutdown));
        }
        if !graceful {
            // Aborted tasks drop their admissions, which releases the limiter slots.
            self.in_flight.abort_all();
        }
        while let Some(joined) = self.in_flight.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    error!("DISPATCH | send task failed: {e}");
                }
            }
        }
        debug!("DISPATCH | service stopped");
    }
}
