// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for admission, dispatch and configuration.

use reqwest::StatusCode;

/// Terminal outcome of a dispatch that did not succeed.
///
/// Only [`DispatchError::Overload`] is evidence that the destination is over capacity and
/// therefore the only variant that adjusts limiter state.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Connection, DNS, timeout or body-level failure that survived every immediate attempt.
    #[error("transport failure after {attempts} attempts: {message}")]
    Transport { attempts: u32, message: String },

    /// The destination answered with a throttling or server error status.
    #[error("destination overloaded: {status}")]
    Overload { status: StatusCode },

    /// The destination rejected the request itself.
    #[error("request rejected by destination: {status}")]
    Client { status: StatusCode },

    /// The transport handle for this request could not be built.
    #[error("failed to set up request: {0}")]
    Setup(String),

    /// A limiter refused admission; the caller decides when to re-queue.
    #[error("rejected by {category} limiter")]
    Rejected { category: String },

    /// The dispatch service stopped before the request reached a terminal outcome.
    #[error("dispatch service shut down")]
    Shutdown,
}

impl DispatchError {
    /// Whether the request may be submitted again later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Overload { .. } | Self::Rejected { .. }
        )
    }
}

/// Failure reported by a [`crate::http::TransportClient`] for a single attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request could not be turned into a transport handle; retrying will not help.
    #[error("{0}")]
    Setup(String),

    /// The attempt failed on the wire and may succeed if tried again.
    #[error("{0}")]
    Io(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
