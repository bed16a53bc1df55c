//! Blocking client tests.

use std::sync::Arc;

use http_integrator::{BlockingClient, CircuitState, Client, IntegratorError, RequestOptions};
use reqwest::StatusCode;
use test_utils::fixtures::{circuit_config, fast_retry_config};
use test_utils::{MockReply, MockTransport};

#[test]
fn test_blocking_client_retries() {
    let mock = Arc::new(MockTransport::with_replies([
        MockReply::status(503),
        MockReply::ok("done"),
    ]));
    let client = BlockingClient::from_builder(
        Client::builder()
            .config(fast_retry_config(3))
            .transport(mock.clone()),
    )
    .unwrap();

    let response = client.get("http://svc.local/items", RequestOptions::new()).unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text(), "done");
    assert_eq!(mock.call_count(), 2);
    assert_eq!(client.metrics().retries.get(), 1);
}

#[test]
fn test_blocking_client_shares_circuit_with_async_handle() {
    let mock = Arc::new(MockTransport::new());
    mock.set_fallback(MockReply::status(500));
    let client = BlockingClient::from_builder(
        Client::builder()
            .config(circuit_config(2))
            .transport(mock.clone()),
    )
    .unwrap();

    for _ in 0..2 {
        let response = client
            .post("http://svc.local/jobs", RequestOptions::new().body("run"))
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    let err = client
        .get("http://svc.local/jobs", RequestOptions::new())
        .unwrap_err();

    assert!(matches!(err, IntegratorError::CircuitOpen { .. }));
    assert_eq!(
        client.circuit_state("http://svc.local:80/jobs"),
        Some(CircuitState::Open)
    );
    assert_eq!(
        client.as_async().circuit_state("http://svc.local:80/jobs"),
        Some(CircuitState::Open)
    );
    assert_eq!(mock.call_count(), 2);
}

#[test]
fn test_blocking_client_rejects_bad_url() {
    let client = BlockingClient::from_builder(
        Client::builder().transport(Arc::new(MockTransport::new())),
    )
    .unwrap();

    let err = client.get("not a url", RequestOptions::new()).unwrap_err();

    assert!(matches!(err, IntegratorError::InvalidUrl { .. }));
}
