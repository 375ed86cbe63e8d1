//! Runtime behavior that does not need a reachable SSH server: parked
//! forwards, failure reporting, idempotent start/stop, shutdown cleanliness.

use std::time::Duration;

use portmux_core::{Config, Error, ForwardState, Runtime};
use tokio::net::TcpStream;
use tokio::time::sleep;

fn config_with_unknown_server() -> Config {
    Config::from_str(
        "[ghost]\nserver = nowhere\ndirection = local\nlocal_port = 0\nremote_port = 80\n",
    )
    .unwrap()
}

fn config_with_unreachable_server() -> Config {
    // Port 1 on loopback refuses connections immediately.
    Config::from_str(
        "[edge1]\nserver = 127.0.0.1\nport = 1\nuser = u\npassword = p\n\
         [proxy]\nserver = edge1\ndirection = socks5\nlocal_port = 0\n",
    )
    .unwrap()
}

async fn wait_for_state(runtime: &Runtime, forward: &str, state: ForwardState) -> bool {
    for _ in 0..100 {
        let snapshot = runtime.snapshot().await;
        if let Some(f) = snapshot.forwards.iter().find(|f| f.name == forward) {
            if f.status.state == state {
                return true;
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn forward_with_unknown_server_stays_idle() {
    let cfg = config_with_unknown_server();
    let port = cfg.forward("ghost").unwrap().local_port;
    let runtime = Runtime::new(cfg);

    runtime.start().await;
    sleep(Duration::from_millis(100)).await;

    let snapshot = runtime.snapshot().await;
    let ghost = &snapshot.forwards[0];
    assert_eq!(ghost.status.state, ForwardState::Idle);
    let err = ghost.status.last_error.as_deref().unwrap_or("");
    assert!(err.contains("nowhere"), "last_error should name the server: {err}");

    // No listener was ever opened for it.
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    assert!(!runtime.is_running().await);

    // Explicitly starting it is a config error.
    let err = runtime.start_forward("ghost").await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    runtime.stop().await;
}

#[tokio::test]
async fn unreachable_server_reports_failing_and_opens_no_listener() {
    let cfg = config_with_unreachable_server();
    let port = cfg.forward("proxy").unwrap().local_port;
    let runtime = Runtime::new(cfg);

    runtime.start().await;
    assert!(runtime.is_running().await);
    assert!(
        wait_for_state(&runtime, "proxy", ForwardState::Failing).await,
        "supervisor should reach failing after the dial is refused"
    );

    let snapshot = runtime.snapshot().await;
    let proxy = &snapshot.forwards[0];
    assert!(proxy.status.last_error.is_some());
    assert!(proxy.status.bound_port.is_none());

    // The dial failed before any listener bind.
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    // Session pool holds nothing for the dead server.
    assert_eq!(runtime.live_sessions().await, 0);
    let servers = runtime.list_servers().await;
    assert_eq!(servers.len(), 1);
    assert!(!servers[0].connected);

    runtime.stop().await;
    assert!(!runtime.is_running().await);
    assert_eq!(runtime.live_sessions().await, 0);

    let snapshot = runtime.snapshot().await;
    assert_eq!(snapshot.forwards[0].status.state, ForwardState::Stopped);
}

#[tokio::test]
async fn stop_is_idempotent_and_fast() {
    let runtime = Runtime::new(config_with_unreachable_server());
    runtime.start().await;
    assert!(wait_for_state(&runtime, "proxy", ForwardState::Failing).await);

    // The supervisor sits in its 30 s back-off here; stop must still drain
    // well inside the shutdown deadline.
    let started = std::time::Instant::now();
    runtime.stop().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    runtime.stop().await; // second stop is a no-op
    assert!(!runtime.is_running().await);
}

#[tokio::test]
async fn start_twice_does_not_duplicate_supervisors() {
    let runtime = Runtime::new(config_with_unreachable_server());
    runtime.start().await;
    runtime.start().await;

    let forwards = runtime.list_forwards().await;
    assert_eq!(forwards.len(), 1);
    assert!(runtime.is_running().await);
    runtime.stop().await;
}

#[tokio::test]
async fn per_forward_stop_and_restart() {
    let runtime = Runtime::new(config_with_unreachable_server());
    runtime.start_forward("proxy").await.unwrap();
    assert!(runtime.is_running().await);

    runtime.stop_forward("proxy").await.unwrap();
    assert!(!runtime.is_running().await);

    runtime.start_forward("proxy").await.unwrap();
    assert!(runtime.is_running().await);

    assert!(matches!(
        runtime.stop_forward("nope").await.unwrap_err(),
        Error::UnknownForward(_)
    ));

    runtime.stop().await;
}

#[tokio::test]
async fn snapshot_serializes() {
    let runtime = Runtime::new(config_with_unknown_server());
    let snapshot = runtime.snapshot().await;
    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(json.contains("\"state\":\"idle\""));
    assert!(json.contains("\"ghost\""));
}
