//! Forward supervisors: one task per configured forward, driving the state
//! machine `idle -> starting -> running -> failing -> starting ...` with a
//! fixed 30 s back-off, and `stopped` once cancelled.
//!
//! Per-connection errors never fail a supervisor; only listener-level and
//! session-level errors do. Leaving `running` cancels a per-run token that
//! every in-flight connection pair selects on, so no pair outlives its run.

use std::sync::Arc;
use std::time::Duration;

use portmux_socks::{negotiate, send_reply, ReplyCode};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Direction, ForwardConfig};
use crate::copy::splice;
use crate::error::{Error, Result};
use crate::session::{RemoteConn, SessionPool, SshSession};

const RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Dial timeout for the local exit of a reverse-socks5 CONNECT.
const REVERSE_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardState {
    Idle,
    Starting,
    Running,
    Failing,
    Stopped,
}

/// Live status of one forward, shared with the control interface.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardStatus {
    pub state: ForwardState,
    /// Actual client-side bound port, once listening. Reports the real port
    /// when the config asked for an ephemeral one.
    pub bound_port: Option<u16>,
    pub active_conns: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub last_error: Option<String>,
}

impl Default for ForwardStatus {
    fn default() -> Self {
        ForwardStatus {
            state: ForwardState::Idle,
            bound_port: None,
            active_conns: 0,
            bytes_in: 0,
            bytes_out: 0,
            last_error: None,
        }
    }
}

pub(crate) type SharedStatus = Arc<RwLock<ForwardStatus>>;

async fn set_state(status: &SharedStatus, state: ForwardState) {
    let mut s = status.write().await;
    s.state = state;
    if state == ForwardState::Running {
        s.last_error = None;
    }
}

async fn record_failure(status: &SharedStatus, error: &Error) {
    let mut s = status.write().await;
    s.state = ForwardState::Failing;
    s.bound_port = None;
    s.last_error = Some(error.to_string());
}

async fn conn_opened(status: &SharedStatus) {
    let mut s = status.write().await;
    s.active_conns = s.active_conns.saturating_add(1);
}

async fn conn_closed(status: &SharedStatus, bytes_in: u64, bytes_out: u64) {
    let mut s = status.write().await;
    s.active_conns = s.active_conns.saturating_sub(1);
    s.bytes_in = s.bytes_in.saturating_add(bytes_in);
    s.bytes_out = s.bytes_out.saturating_add(bytes_out);
}

/// Supervise loop for one forward. Runs until `cancel` fires.
pub(crate) async fn supervise(
    config: ForwardConfig,
    pool: SessionPool,
    status: SharedStatus,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        set_state(&status, ForwardState::Starting).await;

        let result = run_once(&config, &pool, &status, &cancel).await;
        match result {
            Ok(()) => break, // cancelled while running
            Err(e) => {
                warn!(
                    forward = %config.name,
                    server = %config.server_name,
                    error = %e,
                    "forward failed; retrying in {}s",
                    RETRY_BACKOFF.as_secs()
                );
                record_failure(&status, &e).await;
                // Poison the shared session so the next attempt re-dials.
                pool.remove(&config.server_name).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(RETRY_BACKOFF) => {}
                }
            }
        }
    }
    set_state(&status, ForwardState::Stopped).await;
    debug!(forward = %config.name, "supervisor exiting");
}

async fn run_once(
    config: &ForwardConfig,
    pool: &SessionPool,
    status: &SharedStatus,
    cancel: &CancellationToken,
) -> Result<()> {
    let session = pool.get(&config.server_name).await?;

    // Everything spawned during this run hangs off this token; the guard
    // cancels it on every exit path, force-closing in-flight pairs.
    let run_token = cancel.child_token();
    let _guard = run_token.clone().drop_guard();

    match config.direction {
        Direction::Local => run_local(config, &session, status, cancel, &run_token).await,
        Direction::Remote => run_remote(config, &session, status, cancel, &run_token).await,
        Direction::Socks5 => run_socks5(config, &session, status, cancel, &run_token).await,
        Direction::ReverseSocks5 => {
            run_reverse_socks5(config, &session, status, cancel, &run_token).await
        }
    }
}

async fn bind_listener(config: &ForwardConfig, status: &SharedStatus) -> Result<TcpListener> {
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Listener { addr, source: e })?;
    let bound_port = listener.local_addr().ok().map(|a| a.port());
    {
        let mut s = status.write().await;
        s.state = ForwardState::Running;
        s.bound_port = bound_port;
        s.last_error = None;
    }
    Ok(listener)
}

async fn run_local(
    config: &ForwardConfig,
    session: &Arc<SshSession>,
    status: &SharedStatus,
    cancel: &CancellationToken,
    run_token: &CancellationToken,
) -> Result<()> {
    let listener = bind_listener(config, status).await?;
    let session_closed = session.closed_token();
    info!(
        forward = %config.name,
        listen = %config.listen_addr(),
        target = %format!("{}:{}", config.remote_ip, config.remote_port),
        "local forward listening"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = session_closed.cancelled() => {
                return Err(Error::SessionClosed { server: config.server_name.clone() });
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.map_err(|e| Error::Listener {
                    addr: config.listen_addr(),
                    source: e,
                })?;
                debug!(forward = %config.name, %peer, "accepted connection");

                let session = session.clone();
                let status = status.clone();
                let token = run_token.clone();
                let name = config.name.clone();
                let remote_ip = config.remote_ip.clone();
                let remote_port = config.remote_port;
                tokio::spawn(async move {
                    conn_opened(&status).await;
                    let (bytes_in, bytes_out) =
                        match session.open_direct(&remote_ip, remote_port).await {
                            Ok(channel) => {
                                tokio::select! {
                                    _ = token.cancelled() => (0, 0),
                                    counts = splice(stream, channel) => counts,
                                }
                            }
                            Err(e) => {
                                debug!(forward = %name, error = %e, "channel open failed");
                                (0, 0)
                            }
                        };
                    conn_closed(&status, bytes_in, bytes_out).await;
                });
            }
        }
    }
}

async fn run_remote(
    config: &ForwardConfig,
    session: &Arc<SshSession>,
    status: &SharedStatus,
    cancel: &CancellationToken,
    run_token: &CancellationToken,
) -> Result<()> {
    let mut listener = session
        .remote_listen(&config.remote_ip, config.remote_port)
        .await?;
    set_state(status, ForwardState::Running).await;
    info!(
        forward = %config.name,
        listen = %format!("{}:{} (server side)", config.remote_ip, config.remote_port),
        target = %config.local_target(),
        "remote forward listening"
    );

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            conn = listener.accept() => {
                let Some(conn) = conn else {
                    break Err(Error::SessionClosed { server: config.server_name.clone() });
                };
                debug!(forward = %config.name, originator = %conn.originator, "remote connection delivered");

                let status = status.clone();
                let token = run_token.clone();
                let name = config.name.clone();
                let target = config.local_target();
                tokio::spawn(async move {
                    conn_opened(&status).await;
                    let channel = conn.channel.into_stream();
                    let (bytes_in, bytes_out) = match TcpStream::connect(&target).await {
                        Ok(local) => {
                            tokio::select! {
                                _ = token.cancelled() => (0, 0),
                                counts = splice(channel, local) => counts,
                            }
                        }
                        Err(e) => {
                            debug!(forward = %name, %target, error = %e, "local dial failed");
                            (0, 0)
                        }
                    };
                    conn_closed(&status, bytes_in, bytes_out).await;
                });
            }
        }
    };

    listener.close(session).await;
    result
}

async fn run_socks5(
    config: &ForwardConfig,
    session: &Arc<SshSession>,
    status: &SharedStatus,
    cancel: &CancellationToken,
    run_token: &CancellationToken,
) -> Result<()> {
    let listener = bind_listener(config, status).await?;
    let session_closed = session.closed_token();
    info!(
        forward = %config.name,
        listen = %config.listen_addr(),
        auth = config.socks5_credentials().is_some(),
        "socks5 proxy listening"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = session_closed.cancelled() => {
                return Err(Error::SessionClosed { server: config.server_name.clone() });
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.map_err(|e| Error::Listener {
                    addr: config.listen_addr(),
                    source: e,
                })?;
                debug!(forward = %config.name, %peer, "socks5 client accepted");

                let session = session.clone();
                let status = status.clone();
                let token = run_token.clone();
                let name = config.name.clone();
                let creds = config.socks5_credentials();
                tokio::spawn(async move {
                    conn_opened(&status).await;
                    let (bytes_in, bytes_out) =
                        serve_socks5_via_ssh(stream, &session, creds.as_ref(), &name, &token).await;
                    conn_closed(&status, bytes_in, bytes_out).await;
                });
            }
        }
    }
}

/// SOCKS5 handler whose CONNECTs exit through the SSH session.
async fn serve_socks5_via_ssh(
    mut stream: TcpStream,
    session: &Arc<SshSession>,
    creds: Option<&portmux_socks::Credentials>,
    forward: &str,
    token: &CancellationToken,
) -> (u64, u64) {
    let target = match negotiate(&mut stream, creds).await {
        Ok(target) => target,
        Err(e) => {
            debug!(forward = %forward, error = %e, "socks5 negotiation failed");
            return (0, 0);
        }
    };

    match session.open_direct(&target.host_str(), target.port).await {
        Ok(channel) => {
            if let Err(e) = send_reply(&mut stream, ReplyCode::Succeeded).await {
                debug!(forward = %forward, error = %e, "client gone before reply");
                return (0, 0);
            }
            debug!(forward = %forward, %target, "socks5 tunnel established");
            tokio::select! {
                _ = token.cancelled() => (0, 0),
                counts = splice(stream, channel) => counts,
            }
        }
        Err(e) => {
            debug!(forward = %forward, %target, error = %e, "upstream dial failed");
            let _ = send_reply(&mut stream, ReplyCode::ConnectionRefused).await;
            (0, 0)
        }
    }
}

async fn run_reverse_socks5(
    config: &ForwardConfig,
    session: &Arc<SshSession>,
    status: &SharedStatus,
    cancel: &CancellationToken,
    run_token: &CancellationToken,
) -> Result<()> {
    let mut listener = session
        .remote_listen(&config.remote_ip, config.remote_port)
        .await?;
    set_state(status, ForwardState::Running).await;
    info!(
        forward = %config.name,
        listen = %format!("{}:{} (server side)", config.remote_ip, config.remote_port),
        auth = config.socks5_credentials().is_some(),
        "reverse socks5 proxy listening"
    );

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            conn = listener.accept() => {
                let Some(conn) = conn else {
                    break Err(Error::SessionClosed { server: config.server_name.clone() });
                };
                debug!(forward = %config.name, originator = %conn.originator, "reverse socks5 client delivered");

                let status = status.clone();
                let token = run_token.clone();
                let name = config.name.clone();
                let creds = config.socks5_credentials();
                tokio::spawn(async move {
                    conn_opened(&status).await;
                    let (bytes_in, bytes_out) =
                        serve_socks5_via_local(conn, creds.as_ref(), &name, &token).await;
                    conn_closed(&status, bytes_in, bytes_out).await;
                });
            }
        }
    };

    listener.close(session).await;
    result
}

/// SOCKS5 handler whose CONNECTs exit through the local stack.
async fn serve_socks5_via_local(
    conn: RemoteConn,
    creds: Option<&portmux_socks::Credentials>,
    forward: &str,
    token: &CancellationToken,
) -> (u64, u64) {
    let mut stream = conn.channel.into_stream();

    let target = match negotiate(&mut stream, creds).await {
        Ok(target) => target,
        Err(e) => {
            debug!(forward = %forward, error = %e, "socks5 negotiation failed");
            return (0, 0);
        }
    };

    // Resolve up front so failures name the address, not just the domain.
    if target.is_domain() {
        match tokio::net::lookup_host((target.host_str(), target.port)).await {
            Ok(mut addrs) => {
                if let Some(first) = addrs.next() {
                    debug!(forward = %forward, %target, resolved = %first, "resolved target");
                }
            }
            Err(e) => debug!(forward = %forward, %target, error = %e, "resolution failed"),
        }
    }

    let dial = timeout(
        REVERSE_DIAL_TIMEOUT,
        TcpStream::connect((target.host_str(), target.port)),
    )
    .await;

    match dial {
        Ok(Ok(local)) => {
            if let Err(e) = send_reply(&mut stream, ReplyCode::Succeeded).await {
                debug!(forward = %forward, error = %e, "client gone before reply");
                return (0, 0);
            }
            debug!(forward = %forward, %target, "reverse socks5 tunnel established");
            tokio::select! {
                _ = token.cancelled() => (0, 0),
                counts = splice(stream, local) => counts,
            }
        }
        Ok(Err(e)) => {
            debug!(forward = %forward, %target, error = %e, "local dial failed");
            let _ = send_reply(&mut stream, ReplyCode::ConnectionRefused).await;
            (0, 0)
        }
        Err(_) => {
            debug!(forward = %forward, %target, "local dial timed out");
            let _ = send_reply(&mut stream, ReplyCode::ConnectionRefused).await;
            (0, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_defaults_to_idle() {
        let status = ForwardStatus::default();
        assert_eq!(status.state, ForwardState::Idle);
        assert!(status.bound_port.is_none());
        assert!(status.last_error.is_none());
        assert_eq!(status.active_conns, 0);
    }

    #[tokio::test]
    async fn counters_saturate_and_accumulate() {
        let status: SharedStatus = Arc::new(RwLock::new(ForwardStatus::default()));
        conn_opened(&status).await;
        conn_opened(&status).await;
        assert_eq!(status.read().await.active_conns, 2);

        conn_closed(&status, 10, 20).await;
        conn_closed(&status, 1, 2).await;
        conn_closed(&status, 0, 0).await; // extra close must not underflow
        let s = status.read().await;
        assert_eq!(s.active_conns, 0);
        assert_eq!(s.bytes_in, 11);
        assert_eq!(s.bytes_out, 22);
    }

    #[tokio::test]
    async fn failure_resets_bound_port_and_records_error() {
        let status: SharedStatus = Arc::new(RwLock::new(ForwardStatus::default()));
        {
            let mut s = status.write().await;
            s.state = ForwardState::Running;
            s.bound_port = Some(1080);
        }
        let err = Error::SessionClosed {
            server: "edge1".into(),
        };
        record_failure(&status, &err).await;
        let s = status.read().await;
        assert_eq!(s.state, ForwardState::Failing);
        assert!(s.bound_port.is_none());
        assert!(s.last_error.as_deref().unwrap_or("").contains("edge1"));
    }
}
