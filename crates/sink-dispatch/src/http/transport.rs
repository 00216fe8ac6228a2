// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{
    parse_header_line, HttpRequest, HttpResponse, ResponseHeaders, TlsConfig, TransportClient,
};
use crate::errors::TransportError;
use reqwest::redirect::Policy;
use reqwest::{Certificate, ClientBuilder, Identity};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Client-level settings; requests that agree on these share a connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    follow_redirects: bool,
    tls: Option<TlsConfig>,
    bind_interface: Option<String>,
}

impl ClientKey {
    fn of(request: &HttpRequest) -> Self {
        Self {
            follow_redirects: request.follow_redirects,
            tls: request.tls.clone(),
            bind_interface: request.bind_interface.clone(),
        }
    }
}

/// [`TransportClient`] backed by `reqwest` with rustls.
#[derive(Debug, Default)]
pub struct ReqwestTransport {
    clients: Mutex<HashMap<ClientKey, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, request: &HttpRequest) -> Result<reqwest::Client, TransportError> {
        let key = ClientKey::of(request);
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(&key)?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

fn create_client_builder(key: &ClientKey) -> Result<ClientBuilder, TransportError> {
    let redirect = if key.follow_redirects {
        Policy::default()
    } else {
        Policy::none()
    };
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .redirect(redirect)
        .tcp_nodelay(true);

    if let Some(tls) = &key.tls {
        if let Some(ca_file) = &tls.ca_file {
            let pem = std::fs::read(ca_file).map_err(|e| {
                TransportError::Setup(format!("failed to read CA file {}: {e}", ca_file.display()))
            })?;
            let certificate = Certificate::from_pem(&pem)
                .map_err(|e| TransportError::Setup(format!("invalid CA file: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }
        match (&tls.cert_file, &tls.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let mut pem = std::fs::read(cert_file).map_err(|e| {
                    TransportError::Setup(format!(
                        "failed to read client certificate {}: {e}",
                        cert_file.display()
                    ))
                })?;
                let key_pem = std::fs::read(key_file).map_err(|e| {
                    TransportError::Setup(format!(
                        "failed to read client key {}: {e}",
                        key_file.display()
                    ))
                })?;
                pem.push(b'\n');
                pem.extend_from_slice(&key_pem);
                let identity = Identity::from_pem(&pem)
                    .map_err(|e| TransportError::Setup(format!("invalid client identity: {e}")))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => warn!("DISPATCH | client certificate and key must be set together, ignoring both"),
        }
        if tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
    }

    if let Some(interface) = &key.bind_interface {
        builder = bind(builder, interface);
    }
    Ok(builder)
}

fn bind(builder: ClientBuilder, interface: &str) -> ClientBuilder {
    if let Ok(address) = interface.parse::<IpAddr>() {
        return builder.local_address(address);
    }
    #[cfg(target_os = "linux")]
    {
        builder.interface(interface)
    }
    #[cfg(not(target_os = "linux"))]
    {
        warn!("DISPATCH | binding to interface {interface} by name is only supported on Linux");
        builder
    }
}

fn build_client(key: &ClientKey) -> Result<reqwest::Client, TransportError> {
    debug!("DISPATCH | building HTTP client {:?}", key);
    create_client_builder(key)?
        .build()
        .map_err(|e| TransportError::Setup(format!("failed to build HTTP client: {e}")))
}

fn classify_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_builder() {
        TransportError::Setup(error.to_string())
    } else {
        TransportError::Io(error.to_string())
    }
}

#[async_trait::async_trait]
impl TransportClient for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let client = self.client_for(request)?;
        let mut builder = client
            .request(request.method.clone(), request.url())
            .timeout(request.timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        let mut headers = ResponseHeaders::new();
        for (name, value) in response.headers() {
            let mut line = Vec::with_capacity(name.as_str().len() + value.len() + 4);
            line.extend_from_slice(name.as_str().as_bytes());
            line.extend_from_slice(b": ");
            line.extend_from_slice(value.as_bytes());
            line.extend_from_slice(b"\r\n");
            parse_header_line(&line, &mut headers);
        }
        let body = response.bytes().await.map_err(classify_reqwest_error)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
