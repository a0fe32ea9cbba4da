//! End-to-end graceful shutdown of the provider server.
//!
//! A real listener serves a real HTTP client while the test raises SIGTERM
//! against its own process. The in-flight request must complete during the
//! drain window, the server task must stop well before the drain deadline,
//! and the listener must refuse new connections after the signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gatewarden_core::executor::core::CoreExecutor;
use gatewarden_core::executor::{Executor, GetExecutor};
use gatewarden_core::mocks::{test_digest, AnySuccessPolicy, MockStore, MockVerifier};
use gatewarden_daemon::server::{shutdown_signal, Server, ServerConfig};
use nix::sys::signal::{raise, Signal};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const ARTIFACT_TYPE: &str = "application/vnd.test.signature";
const IMAGE: &str = "localhost:5000/net-monitor:v1";

/// Executor whose verifier takes `delay` per subject, long enough to hold a
/// request in flight across the signal.
fn slow_executor(delay: Duration) -> GetExecutor {
    let store = MockStore::new("oras")
        .with_resolution("v1", test_digest())
        .with_referrer(ARTIFACT_TYPE, test_digest());
    let verifier = MockVerifier::new("notation", ARTIFACT_TYPE).with_delay(delay);
    let executor: Arc<dyn Executor> = Arc::new(
        CoreExecutor::builder()
            .store(Arc::new(store))
            .verifier(Arc::new(verifier))
            .policy(Arc::new(AnySuccessPolicy))
            .build(),
    );
    Arc::new(move || Arc::clone(&executor))
}

/// Sends one verify request over a raw socket and returns the full HTTP
/// response once the server closes the connection.
async fn send_verify(addr: SocketAddr, key: &str) -> String {
    let body = serde_json::json!({
        "apiVersion": "externaldata.gatekeeper.sh/v1alpha1",
        "kind": "ProviderRequest",
        "request": { "keys": [key] }
    })
    .to_string();
    let request = format!(
        "POST /ratify/gatekeeper/v1/verify HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        body.len(),
        body
    );

    let mut stream = TcpStream::connect(addr).await.expect("connect to server");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn sigterm_drains_in_flight_request_then_exits() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = ServerConfig::new(addr);
    config.cache_ttl = Duration::ZERO;
    let server = Server::new(config, slow_executor(Duration::from_millis(1500)));
    let server_task = tokio::spawn(server.serve_with_shutdown(listener, shutdown_signal()));

    // Let the accept loop and the signal handler come up.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let client = tokio::spawn(send_verify(addr, IMAGE));
    // The worker sleeps 1.5s, so the request is mid-flight when the signal
    // lands.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let signalled_at = Instant::now();
    raise(Signal::SIGTERM).expect("raise SIGTERM");

    let response = client.await.unwrap();
    assert!(
        response.starts_with("HTTP/1.1 200"),
        "in-flight request should complete, got: {response}"
    );
    assert!(response.contains(IMAGE));
    assert!(response.contains("isSuccess"));

    // The server stops on its own, well inside the 30s drain window.
    tokio::time::timeout(Duration::from_secs(10), server_task)
        .await
        .expect("server should stop before the drain deadline")
        .expect("server task should not panic")
        .expect("server should stop cleanly");
    assert!(signalled_at.elapsed() < Duration::from_secs(10));

    // The listener is gone: no new connections are accepted.
    assert!(
        TcpStream::connect(addr).await.is_err(),
        "listener should refuse connections after shutdown"
    );
}
