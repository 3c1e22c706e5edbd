//! End-to-end scenarios over real mutual TLS on the loopback interface.

mod common;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::{
    add_request, anonymous_tls_client, client_identity, https_endpoint, init_tracing,
    server_identity, Calculator,
};
use mx_transport::{
    Config, RequestMessage, ServiceEndpoint, TransportError, TransportRuntime,
};

fn listener_runtime() -> TransportRuntime {
    TransportRuntime::new(server_identity(), Config::default()).expect("runtime builds")
}

fn caller_runtime() -> TransportRuntime {
    TransportRuntime::new(client_identity(), Config::default()).expect("runtime builds")
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_call_cold_then_warm_pool() {
    init_tracing();
    let server = listener_runtime();
    server.register_service("Calculator", Arc::new(Calculator));
    let caller = caller_runtime();
    server.trust_set().add(caller.thumbprint());

    let addr = server.listen(([127, 0, 0, 1], 0)).await.expect("listener binds");
    let endpoint = https_endpoint(addr, server.thumbprint());

    // Cold pool: the first call dials.
    let response = caller
        .send(add_request(endpoint.clone(), 2, 3))
        .await
        .expect("first call succeeds");
    assert_eq!(response.result, Some(Value::from(5)));
    assert_eq!(caller.dial_count(), 1);
    assert_eq!(caller.idle_connections(&endpoint), 1);

    // Warm pool: the second call reuses the stream without dialling.
    let response = caller
        .send(add_request(endpoint.clone(), 40, 2))
        .await
        .expect("second call succeeds");
    assert_eq!(response.result, Some(Value::from(42)));
    assert_eq!(caller.dial_count(), 1);
    assert_eq!(caller.idle_connections(&endpoint), 1);

    caller.dispose().await;
    server.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn service_failures_come_back_as_error_details() {
    init_tracing();
    let server = listener_runtime();
    server.register_service("Calculator", Arc::new(Calculator));
    let caller = caller_runtime();
    server.trust_set().add(caller.thumbprint());

    let addr = server.listen(([127, 0, 0, 1], 0)).await.expect("listener binds");
    let endpoint = https_endpoint(addr, server.thumbprint());

    let response = caller
        .send(RequestMessage::new(
            endpoint.clone(),
            "Calculator",
            "launch_missiles",
            vec![],
        ))
        .await
        .expect("transport itself succeeds");
    let error = response.error.expect("service reported an error");
    assert_eq!(error.kind, "NoSuchMethod");

    // The stream carried a clean burst despite the service error, so it
    // is still poolable.
    assert_eq!(caller.idle_connections(&endpoint), 1);

    caller.dispose().await;
    server.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn thumbprint_mismatch_is_fatal_and_nothing_is_pooled() {
    init_tracing();
    let server = listener_runtime();
    let caller = caller_runtime();
    server.trust_set().add(caller.thumbprint());

    let addr = server.listen(([127, 0, 0, 1], 0)).await.expect("listener binds");
    // Pin the wrong thumbprint: the caller's own, not the server's.
    let endpoint = https_endpoint(addr, caller.thumbprint());

    let error = caller
        .send(add_request(endpoint.clone(), 2, 3))
        .await
        .expect_err("pin mismatch must fail");
    assert!(matches!(
        error,
        TransportError::UnknownServerThumbprint { .. }
    ));
    assert_eq!(caller.idle_connections(&endpoint), 0);

    caller.dispose().await;
    server.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn untrusted_client_is_disconnected() {
    init_tracing();
    let server = listener_runtime();
    server.register_service("Calculator", Arc::new(Calculator));
    // Note: the caller's thumbprint is *not* added to the trust set.
    let caller = caller_runtime();

    let addr = server.listen(([127, 0, 0, 1], 0)).await.expect("listener binds");
    let endpoint = https_endpoint(addr, server.thumbprint());

    let error = caller
        .send(add_request(endpoint, 2, 3))
        .await
        .expect_err("untrusted client must be cut off");
    assert!(matches!(error, TransportError::Io(_)));

    caller.dispose().await;
    server.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn polling_round_trip_between_two_runtimes() {
    init_tracing();
    // A listens; B dials A and serves requests addressed to its subscription.
    let a = listener_runtime();
    let b = caller_runtime();
    b.register_service("Calculator", Arc::new(Calculator));
    a.trust_set().add(b.thumbprint());

    let addr = a.listen(([127, 0, 0, 1], 0)).await.expect("listener binds");
    let subscription: http::Uri = "poll://subscription-a/".parse().expect("subscription URI");
    b.poll(subscription.clone(), https_endpoint(addr, a.thumbprint()));

    // A third party on A's side sends to the polling destination.
    let destination = ServiceEndpoint::new(subscription.clone(), b.thumbprint());
    let response = a
        .send_with_deadline(add_request(destination, 19, 23), Duration::from_secs(10))
        .await
        .expect("polled call completes");
    assert_eq!(response.result, Some(Value::from(42)));

    b.dispose().await;
    a.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unclaimed_polling_request_times_out_and_leaves_the_queue_empty() {
    init_tracing();
    let a = listener_runtime();
    let subscription: http::Uri = "poll://nobody-listens/".parse().expect("subscription URI");
    let destination = ServiceEndpoint::new(subscription.clone(), a.thumbprint());

    let started = Instant::now();
    let error = a
        .send_with_deadline(add_request(destination, 2, 3), Duration::from_millis(200))
        .await
        .expect_err("no subscriber ever collects it");
    let elapsed = started.elapsed();

    assert!(matches!(error, TransportError::PollingTimeout));
    assert!(
        elapsed >= Duration::from_millis(150) && elapsed <= Duration::from_millis(500),
        "timed out after {:?}",
        elapsed
    );
    assert_eq!(a.pending_request_count(&subscription).await, 0);

    a.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn http_peer_gets_the_friendly_page() {
    init_tracing();
    let server = listener_runtime();
    let addr = server.listen(([127, 0, 0, 1], 0)).await.expect("listener binds");

    let mut stream = anonymous_tls_client(addr).await;
    stream
        .write_all(b"GET / HTTP/1.1\r\n\r\n")
        .await
        .expect("request writes");

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .expect("listener answers and closes");
    let response = String::from_utf8(response).expect("response is text");

    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(response.contains("Content-Type: text/html; charset=utf-8\r\n"));
    assert!(response.contains("not a web server"));

    server.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_scheme_is_rejected() {
    init_tracing();
    let a = caller_runtime();
    let destination =
        ServiceEndpoint::new("ftp://example.com/".parse().unwrap(), a.thumbprint());

    let error = a
        .send(add_request(destination, 1, 2))
        .await
        .expect_err("ftp is not a transport scheme");
    assert!(matches!(error, TransportError::UnknownScheme(_)));

    a.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn disposed_runtime_refuses_and_releases_callers() {
    init_tracing();
    let a = listener_runtime();
    let subscription: http::Uri = "poll://sleepy/".parse().expect("subscription URI");
    let destination = ServiceEndpoint::new(subscription, a.thumbprint());

    // A caller blocked on an uncollected polling request...
    let blocked = {
        let a = a.clone();
        let destination = destination.clone();
        tokio::spawn(async move {
            a.send_with_deadline(add_request(destination, 1, 2), Duration::from_secs(30))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // ...observes Shutdown when the runtime is disposed under it.
    a.dispose().await;
    assert!(matches!(
        blocked.await.expect("caller task joins"),
        Err(TransportError::Shutdown)
    ));

    // And new sends are refused outright.
    assert!(matches!(
        a.send(add_request(destination, 1, 2)).await,
        Err(TransportError::Shutdown)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn routed_destination_is_resolved_once() {
    init_tracing();
    let server = listener_runtime();
    server.register_service("Calculator", Arc::new(Calculator));
    let caller = caller_runtime();
    server.trust_set().add(caller.thumbprint());

    let addr = server.listen(([127, 0, 0, 1], 0)).await.expect("listener binds");
    let real = https_endpoint(addr, server.thumbprint());

    // A logical name that only exists in the route table.
    let logical = ServiceEndpoint::new(
        "https://calculator.internal/".parse().unwrap(),
        server.thumbprint(),
    );
    caller.route(logical.clone(), real.clone());

    let response = caller
        .send(add_request(logical, 20, 22))
        .await
        .expect("routed call succeeds");
    assert_eq!(response.result, Some(Value::from(42)));

    caller.dispose().await;
    server.dispose().await;
}
