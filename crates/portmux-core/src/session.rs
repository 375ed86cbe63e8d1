//! SSH sessions and the pool that shares them between forwards.
//!
//! One authenticated session per server, created on first demand and shared
//! by every forward bound to that server. A keep-alive worker probes the
//! session every 30 seconds and evicts it from the pool when it goes dead;
//! forwards holding a stale `Arc` see their next operation fail and re-enter
//! `get` after their back-off.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelStream, Disconnect};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, SshAuth};
use crate::error::{Error, Result};

/// Connect + auth deadline. Short enough that a dead server does not stall
/// a whole supervisor cycle.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// A connection delivered by a server-side listener we requested with
/// `tcpip_forward`.
pub struct RemoteConn {
    pub originator: String,
    pub channel: Channel<Msg>,
}

type RemoteRoutes = Arc<RwLock<HashMap<u32, mpsc::UnboundedSender<RemoteConn>>>>;

struct ClientHandler {
    server: String,
    routes: RemoteRoutes,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Any host key is accepted; this is the single seam where strict
        // checking would land.
        // TODO: verify against a known_hosts file once a known_hosts_path
        // option exists in the server config.
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let route = self.routes.read().await.get(&connected_port).cloned();
        let conn = RemoteConn {
            originator: format!("{originator_address}:{originator_port}"),
            channel,
        };
        match route {
            Some(tx) => {
                debug!(
                    server = %self.server,
                    port = connected_port,
                    originator = %conn.originator,
                    "forwarded connection delivered"
                );
                if let Err(e) = tx.send(conn) {
                    // The forward went away between deregistration and the
                    // server noticing; drop the channel.
                    let conn = e.0;
                    tokio::spawn(async move {
                        let _ = conn.channel.close().await;
                    });
                }
            }
            None => {
                debug!(
                    server = %self.server,
                    address = connected_address,
                    port = connected_port,
                    "forwarded connection for unrouted port; closing"
                );
                tokio::spawn(async move {
                    let _ = conn.channel.close().await;
                });
            }
        }
        Ok(())
    }
}

/// A live authenticated session. Shared via `Arc`; owned by the pool.
pub struct SshSession {
    server: String,
    handle: Mutex<Handle<ClientHandler>>,
    routes: RemoteRoutes,
    closed: CancellationToken,
    last_ok_at: RwLock<Instant>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl SshSession {
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Cancelled once the session is evicted or closed. Forwards select on
    /// this to notice session loss while blocked elsewhere.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn last_ok_at(&self) -> Instant {
        *self.last_ok_at.read().await
    }

    async fn touch(&self) {
        *self.last_ok_at.write().await = Instant::now();
    }

    /// Open a direct-tcpip channel to `host:port` as seen from the server.
    pub async fn open_direct(&self, host: &str, port: u16) -> Result<ChannelStream<Msg>> {
        if self.is_closed() {
            return Err(Error::SessionClosed {
                server: self.server.clone(),
            });
        }
        let handle = self.handle.lock().await;
        let channel = timeout(
            CHANNEL_OPEN_TIMEOUT,
            handle.channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0),
        )
        .await
        .map_err(|_| Error::transport(&self.server, "channel open timed out"))?
        .map_err(|e| Error::transport(&self.server, e))?;
        drop(handle);
        self.touch().await;
        Ok(channel.into_stream())
    }

    /// Ask the server to listen on `addr:port` and route the delivered
    /// connections back to the returned listener.
    pub async fn remote_listen(&self, addr: &str, port: u16) -> Result<RemoteListener> {
        if self.is_closed() {
            return Err(Error::SessionClosed {
                server: self.server.clone(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.routes.write().await;
            if routes.contains_key(&(port as u32)) {
                return Err(Error::transport(
                    &self.server,
                    format!("remote port {port} is already forwarded on this session"),
                ));
            }
            routes.insert(port as u32, tx);
        }

        let result = {
            let mut handle = self.handle.lock().await;
            timeout(
                CHANNEL_OPEN_TIMEOUT,
                handle.tcpip_forward(addr.to_string(), port as u32),
            )
            .await
        };

        match result {
            Ok(Ok(_)) => {
                self.touch().await;
                info!(server = %self.server, %addr, port, "remote listener established");
                Ok(RemoteListener {
                    rx,
                    closed: self.closed.clone(),
                    addr: addr.to_string(),
                    port,
                })
            }
            Ok(Err(e)) => {
                self.routes.write().await.remove(&(port as u32));
                Err(match e {
                    russh::Error::RequestDenied => Error::transport(
                        &self.server,
                        format!("tcpip-forward for port {port} denied (in use or server policy)"),
                    ),
                    other => Error::transport(&self.server, other),
                })
            }
            Err(_) => {
                self.routes.write().await.remove(&(port as u32));
                Err(Error::transport(&self.server, "tcpip-forward timed out"))
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        self.routes.write().await.clear();
        let handle = self.handle.lock().await;
        let _ = handle
            .disconnect(Disconnect::ByApplication, "shutting down", "en")
            .await;
    }
}

/// Server-side listener handle. `accept` yields connections until the
/// forward is cancelled or the session dies; `close` deregisters the route
/// and cancels the server-side listener.
pub struct RemoteListener {
    rx: mpsc::UnboundedReceiver<RemoteConn>,
    closed: CancellationToken,
    addr: String,
    port: u16,
}

impl RemoteListener {
    /// Next delivered connection, or `None` once the session is gone.
    pub async fn accept(&mut self) -> Option<RemoteConn> {
        tokio::select! {
            conn = self.rx.recv() => conn,
            _ = self.closed.cancelled() => None,
        }
    }

    /// Deregister the route and withdraw the server-side listener. Called on
    /// every exit path of the owning forward run.
    pub async fn close(mut self, session: &SshSession) {
        self.rx.close();
        session.routes.write().await.remove(&(self.port as u32));
        if !session.is_closed() {
            let handle = session.handle.lock().await;
            let _ = handle
                .cancel_tcpip_forward(self.addr.clone(), self.port as u32)
                .await;
        }
    }
}

/// Shared pool of sessions keyed by server name. Cheap to clone; all clones
/// see the same sessions.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    servers: HashMap<String, ServerConfig>,
    sessions: RwLock<HashMap<String, Arc<SshSession>>>,
    // One dial at a time per server; callers for other servers are not held.
    dial_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionPool {
    pub fn new(servers: HashMap<String, ServerConfig>) -> Self {
        SessionPool {
            inner: Arc::new(PoolInner {
                servers,
                sessions: RwLock::new(HashMap::new()),
                dial_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// A live session for `server_name`, dialing one if needed. Concurrent
    /// callers for the same server wait on the first dial.
    pub async fn get(&self, server_name: &str) -> Result<Arc<SshSession>> {
        if let Some(session) = self.lookup_live(server_name).await {
            return Ok(session);
        }

        let dial_lock = {
            let mut locks = self.inner.dial_locks.lock().await;
            locks
                .entry(server_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = dial_lock.lock().await;

        // Someone else may have dialed while we waited.
        if let Some(session) = self.lookup_live(server_name).await {
            return Ok(session);
        }

        let config = self
            .inner
            .servers
            .get(server_name)
            .ok_or_else(|| Error::UnknownServer(server_name.to_string()))?;

        let session = dial(config).await?;
        self.inner
            .sessions
            .write()
            .await
            .insert(server_name.to_string(), session.clone());
        self.spawn_keepalive(session.clone());
        info!(server = server_name, addr = %config.addr(), "ssh session established");
        Ok(session)
    }

    async fn lookup_live(&self, server_name: &str) -> Option<Arc<SshSession>> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(server_name)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    /// Close and drop the session; the next `get` re-dials.
    pub async fn remove(&self, server_name: &str) {
        let session = self.inner.sessions.write().await.remove(server_name);
        if let Some(session) = session {
            info!(server = server_name, "evicting ssh session");
            session.close().await;
        }
    }

    /// Close every session. Idempotent.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.inner.sessions.write().await.drain().collect();
        for (name, session) in sessions {
            debug!(server = %name, "closing ssh session");
            session.close().await;
        }
    }

    pub async fn connected(&self, server_name: &str) -> bool {
        self.lookup_live(server_name).await.is_some()
    }

    pub async fn live_sessions(&self) -> usize {
        let sessions = self.inner.sessions.read().await;
        sessions.values().filter(|s| !s.is_closed()).count()
    }

    fn spawn_keepalive(&self, session: Arc<SshSession>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let server = session.server().to_string();
            loop {
                tokio::select! {
                    _ = session.closed.cancelled() => break,
                    _ = sleep(KEEPALIVE_INTERVAL) => {
                        let dead = {
                            let handle = session.handle.lock().await;
                            handle.is_closed()
                                || handle.send_keepalive(true).await.is_err()
                        };
                        if dead {
                            warn!(server = %server, "keep-alive failed; evicting session");
                            pool.remove(&server).await;
                            break;
                        }
                        session.touch().await;
                    }
                }
            }
            debug!(server = %server, "keep-alive worker exiting");
        });
    }
}

async fn dial(config: &ServerConfig) -> Result<Arc<SshSession>> {
    let server = config.name.clone();
    let routes: RemoteRoutes = Arc::new(RwLock::new(HashMap::new()));
    let handler = ClientHandler {
        server: server.clone(),
        routes: routes.clone(),
    };

    let ssh_config = Arc::new(client::Config {
        ..Default::default()
    });

    debug!(server = %server, addr = %config.addr(), "dialing ssh server");
    let mut handle = timeout(
        DIAL_TIMEOUT,
        client::connect(ssh_config, (config.host.as_str(), config.port), handler),
    )
    .await
    .map_err(|_| Error::transport(&server, "connect timed out"))?
    .map_err(|e| Error::transport(&server, e))?;

    let auth = match &config.auth {
        SshAuth::Password(password) => handle
            .authenticate_password(config.user.clone(), password.clone())
            .await
            .map_err(|e| Error::transport(&server, e))?,
        SshAuth::PrivateKey { path, passphrase } => {
            let key = load_secret_key(path, passphrase.as_deref()).map_err(|e| Error::Auth {
                server: server.clone(),
                reason: format!("cannot load private key {}: {e}", path.display()),
            })?;
            let rsa_hash = handle
                .best_supported_rsa_hash()
                .await
                .map_err(|e| Error::transport(&server, e))?
                .flatten();
            handle
                .authenticate_publickey(
                    config.user.clone(),
                    PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
                )
                .await
                .map_err(|e| Error::transport(&server, e))?
        }
    };

    if !matches!(auth, AuthResult::Success) {
        return Err(Error::Auth {
            server,
            reason: "authentication rejected".to_string(),
        });
    }

    Ok(Arc::new(SshSession {
        server,
        handle: Mutex::new(handle),
        routes,
        closed: CancellationToken::new(),
        last_ok_at: RwLock::new(Instant::now()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SshAuth;

    fn server_config(name: &str, port: u16) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port,
            user: "nobody".to_string(),
            auth: SshAuth::Password("x".to_string()),
        }
    }

    #[tokio::test]
    async fn get_unknown_server_fails() {
        let pool = SessionPool::new(HashMap::new());
        let err = pool.get("missing").await.unwrap_err();
        assert!(matches!(err, Error::UnknownServer(_)));
    }

    #[tokio::test]
    async fn dial_failure_is_a_transport_error_and_nothing_is_cached() {
        // Port 1 on loopback refuses immediately.
        let mut servers = HashMap::new();
        servers.insert("dead".to_string(), server_config("dead", 1));
        let pool = SessionPool::new(servers);

        let err = pool.get("dead").await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert_eq!(pool.live_sessions().await, 0);
        assert!(!pool.connected("dead").await);
    }

    #[tokio::test]
    async fn close_all_is_idempotent() {
        let pool = SessionPool::new(HashMap::new());
        pool.close_all().await;
        pool.close_all().await;
        assert_eq!(pool.live_sessions().await, 0);
    }
}
