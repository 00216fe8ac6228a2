// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request/response records and the transport seam used by the dispatcher.

mod header;
mod transport;

pub use header::{parse_header_line, ResponseHeaders};
pub use transport::ReqwestTransport;

use crate::errors::TransportError;
use bytes::Bytes;
pub use reqwest::{Method, StatusCode};
use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_TRY_CNT: u32 = 3;

/// TLS material for a destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TlsConfig {
    /// PEM bundle of CAs trusted in addition to the built-in roots.
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate, used together with `key_file`.
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

/// One outbound send.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub https: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query_string: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub tls: Option<TlsConfig>,
    /// Local interface name or IP address to send from.
    pub bind_interface: Option<String>,
    /// Immediate attempts allowed before the send is reported as failed.
    pub max_try_cnt: u32,
    /// Attempt currently being made, starting at 1.
    pub try_cnt: u32,
}

impl HttpRequest {
    pub fn new(
        method: Method,
        https: bool,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Self {
        Self {
            method,
            https,
            host: host.into(),
            port,
            path: path.into(),
            query_string: String::new(),
            headers: BTreeMap::new(),
            body: Bytes::new(),
            timeout: DEFAULT_TIMEOUT,
            follow_redirects: false,
            tls: None,
            bind_interface: None,
            max_try_cnt: DEFAULT_MAX_TRY_CNT,
            try_cnt: 1,
        }
    }

    #[must_use]
    pub fn with_query_string(mut self, query_string: impl Into<String>) -> Self {
        self.query_string = query_string.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_follow_redirects(mut self, follow_redirects: bool) -> Self {
        self.follow_redirects = follow_redirects;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn with_bind_interface(mut self, bind_interface: impl Into<String>) -> Self {
        self.bind_interface = Some(bind_interface.into());
        self
    }

    #[must_use]
    pub fn with_max_try_cnt(mut self, max_try_cnt: u32) -> Self {
        self.max_try_cnt = max_try_cnt.max(1);
        self
    }

    pub fn url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        let separator = if self.path.starts_with('/') { "" } else { "/" };
        let mut url = if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("{scheme}://[{}]:{}{separator}{}", self.host, self.port, self.path)
        } else {
            format!("{scheme}://{}:{}{separator}{}", self.host, self.port, self.path)
        };
        if !self.query_string.is_empty() {
            url.push('?');
            url.push_str(&self.query_string);
        }
        url
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: ResponseHeaders,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: ResponseHeaders::new(),
            body: Bytes::new(),
        }
    }
}

/// Performs a single network attempt for a request.
///
/// Immediate retries and outcome classification are the caller's job; an implementation
/// reports every status it receives as `Ok`.
#[async_trait::async_trait]
pub trait TransportClient: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}
