// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Server};
use sink_dispatch::{
    config::DispatchConfig,
    http::{Method, ReqwestTransport, StatusCode},
    metrics::{SinkMetrics, OUT_FAILED_ITEMS_TOTAL, OUT_SUCCESSFUL_ITEMS_TOTAL},
    DispatchError, DispatchService, HttpRequest, LimiterRegistry, TransportClient,
};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn request_to(server: &Server, path: &str) -> HttpRequest {
    let address = server.socket_address();
    HttpRequest::new(
        Method::POST,
        false,
        address.ip().to_string(),
        address.port(),
        path,
    )
    .with_timeout(Duration::from_secs(5))
}

/// A local port with nothing listening on it.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("unable to bind");
    let port = listener.local_addr().expect("no local address").port();
    drop(listener);
    port
}

#[tokio::test]
async fn reqwest_transport_sends_request_and_collects_headers() {
    let mut mock_server = Server::new_async().await;
    let mock = mock_server
        .mock("POST", "/logstores/app/shards/lb")
        .match_query(Matcher::UrlEncoded("key".into(), "value".into()))
        .match_header("x-log-apiversion", "0.6.0")
        .match_body("payload")
        .with_status(200)
        .with_header("X-Log-Requestid", "5F3C1A")
        .with_body("ok")
        .create_async()
        .await;

    let transport = ReqwestTransport::new();
    let request = request_to(&mock_server, "/logstores/app/shards/lb")
        .with_query_string("key=value")
        .with_header("x-log-apiversion", "0.6.0")
        .with_body("payload");

    let response = transport.send(&request).await.expect("send failed");

    mock.assert_async().await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers.get("x-log-requestid"), Some("5F3C1A"));
    assert_eq!(response.headers.get("X-LOG-REQUESTID"), Some("5F3C1A"));
    assert_eq!(response.body.as_ref(), b"ok");
}

#[tokio::test]
async fn reqwest_transport_reports_error_statuses_as_responses() {
    let mut mock_server = Server::new_async().await;
    let _mock = mock_server
        .mock("POST", "/logstores/app")
        .with_status(503)
        .create_async()
        .await;

    let transport = ReqwestTransport::new();
    let response = transport
        .send(&request_to(&mock_server, "/logstores/app"))
        .await
        .expect("a 503 is still a response");
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn dispatch_service_ships_and_trips_on_overload() {
    let mut mock_server = Server::new_async().await;
    let accepted = mock_server
        .mock("POST", "/logstores/access-log/shards/lb")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let throttled = mock_server
        .mock("POST", "/logstores/error-log/shards/lb")
        .with_status(429)
        .expect(1)
        .create_async()
        .await;

    let config = DispatchConfig {
        admission_poll: Duration::from_millis(5),
        ..Default::default()
    };
    let registry = LimiterRegistry::new(config.clone());
    let metrics = Arc::new(SinkMetrics::new());
    let (service, handle) = DispatchService::new(
        Arc::new(ReqwestTransport::new()),
        Arc::clone(&metrics),
        &config,
        CancellationToken::new(),
    );
    let service_task = tokio::spawn(service.run());

    let response = handle
        .submit(
            request_to(&mock_server, "/logstores/access-log/shards/lb"),
            registry.limiters_for("local", "proj", "access-log"),
        )
        .await
        .expect("should be accepted");
    assert_eq!(response.status, StatusCode::OK);

    let error_chain = registry.limiters_for("local", "proj", "error-log");
    let err = handle
        .submit(
            request_to(&mock_server, "/logstores/error-log/shards/lb"),
            error_chain.clone(),
        )
        .await
        .expect_err("should be throttled");
    assert!(matches!(
        err,
        DispatchError::Overload {
            status: StatusCode::TOO_MANY_REQUESTS
        }
    ));

    // The throttled destination now backs off, and so do its shared region and project.
    for limiter_ref in &error_chain {
        assert!(!limiter_ref.limiter.is_valid_to_pop());
        assert_eq!(limiter_ref.limiter.in_sending_count(), 0);
    }

    accepted.assert_async().await;
    throttled.assert_async().await;
    assert_eq!(metrics.get(OUT_SUCCESSFUL_ITEMS_TOTAL), 1);
    assert_eq!(metrics.get(OUT_FAILED_ITEMS_TOTAL), 1);

    handle.shutdown().expect("failed to shutdown");
    service_task.await.expect("service task failed");
}

#[tokio::test]
async fn unreachable_destination_exhausts_immediate_retries() {
    let config = DispatchConfig {
        max_try_cnt: 2,
        admission_poll: Duration::from_millis(5),
        ..Default::default()
    };
    let registry = LimiterRegistry::new(config.clone());
    let (service, handle) = DispatchService::new(
        Arc::new(ReqwestTransport::new()),
        Arc::new(SinkMetrics::new()),
        &config,
        CancellationToken::new(),
    );
    let service_task = tokio::spawn(service.run());

    let request = config.new_request(Method::POST, false, "127.0.0.1", closed_port(), "/");
    let chain = registry.limiters_for("local", "proj", "app");
    let err = handle
        .submit(request, chain.clone())
        .await
        .expect_err("nothing is listening");

    assert!(matches!(err, DispatchError::Transport { attempts: 2, .. }));
    // Transport faults are not overload: the limiters keep admitting.
    for limiter_ref in &chain {
        assert!(limiter_ref.limiter.is_valid_to_pop());
        assert_eq!(limiter_ref.limiter.in_sending_count(), 0);
    }

    handle.shutdown().expect("failed to shutdown");
    service_task.await.expect("service task failed");
}
