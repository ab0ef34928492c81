//! Integration tests for the circuit-breaker stage: tripping, fast-fail
//! bodies, the half-open probe and the timeout path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower::util::ServiceExt;

use pipegate::state::BreakerState;
use pipegate::{Gateway, GatewayConfig};

async fn spawn_upstream(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn configure(gateway: &Gateway, yaml: &str) {
    let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
    gateway.configure(config).await.unwrap();
}

async fn send(gateway: &Gateway, uri: &str) -> (StatusCode, String) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = gateway.router().await.oneshot(req).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&body).to_string())
}

/// Upstream that fails its first `failures` requests with 500, then
/// serves 200 after a short delay (long enough to observe probe gating)
fn flaky_upstream(failures: u32, hits: Arc<AtomicU32>) -> Router {
    Router::new().route(
        "/get",
        get(move || {
            let hits = hits.clone();
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    StatusCode::OK
                }
            }
        }),
    )
}

#[tokio::test]
async fn test_breaker_trips_after_max_failures_and_recovers_via_probe() {
    let hits = Arc::new(AtomicU32::new(0));
    let upstream = spawn_upstream(flaky_upstream(3, hits.clone())).await;

    let gateway = Gateway::with_defaults().unwrap();
    configure(
        &gateway,
        &format!(
            r#"
apis:
  - path: /flaky
    proxy:
      target: http://{upstream}
    circuitBreaker:
      - maxFailures: 3
        timeout: 1000
        resetTimeout: 300
"#
        ),
    )
    .await;

    // Three upstream failures pass through while the breaker is closed
    for _ in 0..3 {
        let (status, _) = send(&gateway, "/flaky/get").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    // Fourth request fast-fails without touching the upstream
    let (status, body) = send(&gateway, "/flaky/get").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "CircuitBreaker open");
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    // Wait out the reset window, then race two requests: exactly one is
    // the probe, the other is rejected while the probe is pending
    tokio::time::sleep(Duration::from_millis(450)).await;
    let (first, second) = tokio::join!(send(&gateway, "/flaky/get"), send(&gateway, "/flaky/get"));

    let mut statuses = [first.0, second.0];
    statuses.sort_by_key(|s| s.as_u16());
    assert_eq!(statuses, [StatusCode::OK, StatusCode::SERVICE_UNAVAILABLE]);
    assert_eq!(hits.load(Ordering::SeqCst), 4);

    // Probe success closed the breaker again
    assert_eq!(
        gateway.store().get_state("/flaky").await.unwrap().state,
        BreakerState::Closed
    );
    let (status, _) = send(&gateway, "/flaky/get").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_breaker_timeout_yields_504_and_counts_one_failure() {
    let upstream = spawn_upstream(Router::new().route(
        "/get",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            StatusCode::OK
        }),
    ))
    .await;

    let gateway = Gateway::with_defaults().unwrap();
    configure(
        &gateway,
        &format!(
            r#"
apis:
  - path: /slow
    proxy:
      target: http://{upstream}
    circuitBreaker:
      - maxFailures: 10
        timeout: 100
"#
        ),
    )
    .await;

    let (status, body) = send(&gateway, "/slow/get").await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body, "CircuitBreaker timeout");
    assert_eq!(gateway.store().get_state("/slow").await.unwrap().failures, 1);
    assert_eq!(
        gateway.store().get_state("/slow").await.unwrap().state,
        BreakerState::Closed
    );
}

#[tokio::test]
async fn test_probe_failure_reopens_the_breaker() {
    let hits = Arc::new(AtomicU32::new(0));
    // Every request fails, including the probe
    let upstream = spawn_upstream(flaky_upstream(u32::MAX, hits.clone())).await;

    let gateway = Gateway::with_defaults().unwrap();
    configure(
        &gateway,
        &format!(
            r#"
apis:
  - path: /flaky
    proxy:
      target: http://{upstream}
    circuitBreaker:
      - maxFailures: 2
        timeout: 1000
        resetTimeout: 200
"#
        ),
    )
    .await;

    for _ in 0..2 {
        send(&gateway, "/flaky/get").await;
    }
    assert_eq!(
        gateway.store().get_state("/flaky").await.unwrap().state,
        BreakerState::Open
    );

    tokio::time::sleep(Duration::from_millis(300)).await;

    // The probe fails with 500 and the breaker reopens immediately
    let (status, _) = send(&gateway, "/flaky/get").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        gateway.store().get_state("/flaky").await.unwrap().state,
        BreakerState::Open
    );

    let (status, body) = send(&gateway, "/flaky/get").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "CircuitBreaker open");
}

#[tokio::test]
async fn test_two_default_breaker_entries_install_no_breaker() {
    let hits = Arc::new(AtomicU32::new(0));
    let upstream = spawn_upstream(flaky_upstream(u32::MAX, hits.clone())).await;

    let gateway = Gateway::with_defaults().unwrap();
    configure(
        &gateway,
        &format!(
            r#"
apis:
  - path: /flaky
    proxy:
      target: http://{upstream}
    circuitBreaker:
      - maxFailures: 1
      - maxFailures: 2
"#
        ),
    )
    .await;

    // With the contradictory breaker config rejected, failures keep
    // passing through and nothing ever trips
    for _ in 0..4 {
        let (status, _) = send(&gateway, "/flaky/get").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 4);
    assert_eq!(gateway.store().get_state("/flaky").await.unwrap().failures, 0);
}

#[tokio::test]
async fn test_group_scoped_breaker_gates_only_matching_requests() {
    let hits = Arc::new(AtomicU32::new(0));
    let upstream = spawn_upstream({
        let hits = hits.clone();
        Router::new().route(
            "/*path",
            get(move |req: axum::extract::Request| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if req.uri().path().starts_with("/unstable") {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        )
    })
    .await;

    let gateway = Gateway::with_defaults().unwrap();
    configure(
        &gateway,
        &format!(
            r#"
apis:
  - path: /api
    proxy:
      target: http://{upstream}
    group:
      - name: unstable
        predicates:
          - url: "^/unstable"
    circuitBreaker:
      - maxFailures: 2
        group: [unstable]
"#
        ),
    )
    .await;

    for _ in 0..2 {
        send(&gateway, "/api/unstable/x").await;
    }

    // The scoped breaker tripped for matching requests...
    let (status, body) = send(&gateway, "/api/unstable/x").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "CircuitBreaker open");

    // ...while non-matching requests bypass it and still reach upstream
    let (status, _) = send(&gateway, "/api/stable/x").await;
    assert_eq!(status, StatusCode::OK);
}
