//! TCP listener for wire protocol sessions.
//!
//! Accepts incoming connections and spawns one task per connection. The
//! accept loop never waits on session work; a failing session is logged and
//! dropped without touching the listener or other sessions.

use crate::error::{ServerError, SessionError};
use crate::handler::QueryHandler;
use crate::options::{ServerOption, Settings};
use crate::session::Session;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, debug_span, error, info, warn, Instrument};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Construction-time inputs that have no default.
pub struct ServerConfig {
    pub port: u16,
    pub query_handler: Option<Arc<dyn QueryHandler>>,
}

impl ServerConfig {
    pub fn new(port: u16, handler: impl QueryHandler) -> Self {
        Self {
            port,
            query_handler: Some(Arc::new(handler)),
        }
    }
}

/// Server instance
pub struct Server {
    settings: Settings,
    handler: Option<Arc<dyn QueryHandler>>,
}

impl Server {
    /// Create a server. `options` are applied in order over the defaults.
    pub fn new<I>(config: ServerConfig, options: I) -> Self
    where
        I: IntoIterator<Item = ServerOption>,
    {
        let settings = Settings {
            port: config.port,
            ..Settings::default()
        }
        .apply(options);

        Server {
            settings,
            handler: config.query_handler,
        }
    }

    /// Replace the query handler. Takes effect for the next `bind`.
    pub fn register_handler(&mut self, handler: impl QueryHandler) {
        self.handler = Some(Arc::new(handler));
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Bind the listening socket without accepting yet.
    pub async fn bind(self) -> Result<Acceptor, ServerError> {
        let handler = self.handler.ok_or(ServerError::HandlerNotRegistered)?;

        let ip: IpAddr = self
            .settings
            .host
            .parse()
            .map_err(|_| ServerError::InvalidAddress(self.settings.host.clone()))?;
        let addr = SocketAddr::new(ip, self.settings.port);

        let listener = create_listener(addr).map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        info!(address = %local_addr, "Server listening");

        // A custom option can set any value here.
        let max_connections = self.settings.max_connections.clamp(1, Semaphore::MAX_PERMITS);

        Ok(Acceptor {
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            settings: Arc::new(self.settings),
            handler,
            listener,
            local_addr,
            stats: Arc::new(ServerStats::default()),
        })
    }

    /// Bind and accept connections until the process ends.
    pub async fn run(self) -> Result<(), ServerError> {
        self.bind().await?.run().await
    }
}

/// Create a TCP listener with SO_REUSEADDR and hand it to tokio.
fn create_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if addr.is_ipv6() {
        // Accept IPv4 clients on `::` too.
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Connection counters, shared by the acceptor and its session tasks.
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    active: AtomicU64,
    framing_errors: AtomicU64,
    transport_errors: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time copy of `ServerStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub framing_errors: u64,
    pub transport_errors: u64,
    pub timeouts: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    fn record_error(&self, e: &SessionError) {
        let counter = match e {
            SessionError::Framing(_) => &self.framing_errors,
            SessionError::Transport(_) => &self.transport_errors,
            SessionError::Timeout(_) => &self.timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A bound listener ready to accept sessions.
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    settings: Arc<Settings>,
    handler: Arc<dyn QueryHandler>,
    connection_limit: Arc<Semaphore>,
    stats: Arc<ServerStats>,
}

impl Acceptor {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);

                    let settings = Arc::clone(&self.settings);
                    let handler = Arc::clone(&self.handler);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            stats.active.fetch_add(1, Ordering::Relaxed);
                            handle_connection(stream, addr, settings, handler, &stats).await;
                            stats.active.fetch_sub(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(debug_span!("session", peer = %addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!(address = %self.local_addr, "Server stopped accepting connections");
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    settings: Arc<Settings>,
    handler: Arc<dyn QueryHandler>,
    stats: &ServerStats,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let mut session = Session::new(stream, settings, handler);
    match session.run().await {
        Ok(()) => debug!(peer = %peer, "Connection closed"),
        Err(e) => {
            stats.record_error(&e);
            warn!(peer = %peer, kind = e.kind(), error = %e, "Session ended with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FixedReply, QueryResult};
    use crate::options::{with_host, with_max_connections, with_server_version, with_time_zone};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    const STARTUP: [u8; 8] = [0, 0, 0, 8, 0, 3, 0, 0];
    const SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];
    const READY: [u8; 6] = [0x5a, 0x00, 0x00, 0x00, 0x05, 0x49];

    async fn start_test_server(handler: impl QueryHandler) -> (SocketAddr, Arc<ServerStats>) {
        let server = Server::new(
            ServerConfig::new(0, handler),
            vec![
                with_host("127.0.0.1"),
                with_server_version("14.11"),
                with_time_zone("Asia/Tokyo"),
            ],
        );
        let acceptor = server.bind().await.unwrap();
        let addr = acceptor.local_addr();
        let stats = acceptor.stats();
        tokio::spawn(acceptor.run());
        (addr, stats)
    }

    /// Read until the stream ends with a ReadyForQuery frame.
    async fn read_until_ready(stream: &mut TcpStream) -> Vec<u8> {
        let mut all = Vec::new();
        let mut buf = [0u8; 4096];
        while !all.ends_with(&READY) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before ReadyForQuery");
            all.extend_from_slice(&buf[..n]);
        }
        all
    }

    async fn send_query(stream: &mut TcpStream, sql: &str) {
        let mut frame = vec![b'Q'];
        frame.extend_from_slice(&((sql.len() + 5) as u32).to_be_bytes());
        frame.extend_from_slice(sql.as_bytes());
        frame.push(0);
        stream.write_all(&frame).await.unwrap();
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 1s");
    }

    fn handshake_bytes(with_decline: bool) -> Vec<u8> {
        let mut bytes = Vec::new();
        if with_decline {
            bytes.push(b'N');
        }
        bytes.extend_from_slice(&[0x52, 0, 0, 0, 8, 0, 0, 0, 0]);
        bytes.extend_from_slice(b"S\x00\x00\x00\x18TimeZone\x00Asia/Tokyo\x00");
        bytes.extend_from_slice(b"S\x00\x00\x00\x19server_version\x0014.11\x00");
        bytes.extend_from_slice(&READY);
        bytes
    }

    #[tokio::test]
    async fn test_missing_handler_fails_to_start() {
        let server = Server::new(
            ServerConfig {
                port: 0,
                query_handler: None,
            },
            Vec::new(),
        );
        match server.run().await {
            Err(ServerError::HandlerNotRegistered) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_handler_before_bind() {
        let mut server = Server::new(
            ServerConfig {
                port: 0,
                query_handler: None,
            },
            vec![with_host("127.0.0.1")],
        );
        server.register_handler(FixedReply::default());
        assert!(server.bind().await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_host() {
        let server = Server::new(
            ServerConfig::new(0, FixedReply::default()),
            vec![with_host("not an address")],
        );
        match server.bind().await {
            Err(ServerError::InvalidAddress(host)) => assert_eq!(host, "not an address"),
            other => panic!("unexpected: {:?}", other.map(|a| a.local_addr())),
        }
    }

    #[tokio::test]
    async fn test_ipv6_host() {
        let server = Server::new(
            ServerConfig::new(0, FixedReply::default()),
            vec![with_host("::1")],
        );
        match server.bind().await {
            Ok(acceptor) => {
                let addr = acceptor.local_addr();
                assert!(addr.is_ipv6());
                tokio::spawn(acceptor.run());

                let mut stream = TcpStream::connect(addr).await.unwrap();
                stream.write_all(&STARTUP).await.unwrap();
                read_until_ready(&mut stream).await;
            }
            // Host without IPv6 loopback; the address itself was accepted.
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr, "[::1]:0"),
            Err(e) => panic!("unexpected: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_port_in_use_is_bind_error() {
        let first = Server::new(
            ServerConfig::new(0, FixedReply::default()),
            vec![with_host("127.0.0.1")],
        )
        .bind()
        .await
        .unwrap();
        let port = first.local_addr().port();

        let second = Server::new(
            ServerConfig::new(port, FixedReply::default()),
            vec![with_host("127.0.0.1")],
        );
        match second.bind().await {
            Err(ServerError::Bind { addr, .. }) => {
                assert_eq!(addr, format!("127.0.0.1:{}", port))
            }
            other => panic!("unexpected: {:?}", other.map(|a| a.local_addr())),
        }
    }

    #[tokio::test]
    async fn test_oversized_connection_limit_is_capped() {
        let raw: ServerOption = Box::new(|s: &mut Settings| s.max_connections = usize::MAX);
        let server = Server::new(
            ServerConfig::new(0, FixedReply::default()),
            vec![with_host("127.0.0.1"), raw],
        );
        let acceptor = server.bind().await.unwrap();
        assert_eq!(
            acceptor.connection_limit.available_permits(),
            Semaphore::MAX_PERMITS
        );

        let server = Server::new(
            ServerConfig::new(0, FixedReply::default()),
            vec![with_host("127.0.0.1"), with_max_connections(usize::MAX)],
        );
        assert_eq!(server.settings().max_connections, Semaphore::MAX_PERMITS);
        assert!(server.bind().await.is_ok());
    }

    #[tokio::test]
    async fn test_ssl_request_then_query_over_tcp() {
        let (addr, _) = start_test_server(FixedReply::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(&SSL_REQUEST).await.unwrap();
        stream.write_all(&STARTUP).await.unwrap();
        assert_eq!(read_until_ready(&mut stream).await, handshake_bytes(true));

        send_query(&mut stream, "SELECT 1").await;
        let mut expected = vec![0x43, 0x00, 0x00, 0x00, 0x07, 0x4f, 0x4b, 0x00];
        expected.extend_from_slice(&READY);
        assert_eq!(read_until_ready(&mut stream).await, expected);
    }

    #[tokio::test]
    async fn test_plain_startup_over_tcp() {
        let (addr, _) = start_test_server(FixedReply::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(&STARTUP).await.unwrap();
        assert_eq!(read_until_ready(&mut stream).await, handshake_bytes(false));
    }

    #[tokio::test]
    async fn test_terminate_closes_connection() {
        let (addr, _) = start_test_server(FixedReply::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&STARTUP).await.unwrap();
        read_until_ready(&mut stream).await;

        stream.write_all(&[b'X', 0, 0, 0, 4]).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_framing_error_isolated_to_one_session() {
        let (addr, stats) = start_test_server(FixedReply::default()).await;

        let mut healthy = TcpStream::connect(addr).await.unwrap();
        healthy.write_all(&STARTUP).await.unwrap();
        read_until_ready(&mut healthy).await;

        let mut broken = TcpStream::connect(addr).await.unwrap();
        broken.write_all(&STARTUP).await.unwrap();
        read_until_ready(&mut broken).await;
        broken.write_all(&[b'Q', 0, 0, 0, 3]).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(broken.read(&mut buf).await.unwrap(), 0);

        // Existing session still answers.
        send_query(&mut healthy, "SELECT 1").await;
        read_until_ready(&mut healthy).await;

        // Listener still accepts.
        let mut fresh = TcpStream::connect(addr).await.unwrap();
        fresh.write_all(&STARTUP).await.unwrap();
        read_until_ready(&mut fresh).await;

        // The broken session records its error after closing the socket.
        wait_for(|| stats.snapshot().framing_errors == 1).await;
        assert_eq!(stats.snapshot().framing_errors, 1);
        assert_eq!(stats.snapshot().accepted, 3);
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_other_sessions() {
        let handler = |query: &[u8]| -> QueryResult {
            if query == b"slow" {
                std::thread::sleep(Duration::from_millis(500));
            }
            Ok(None)
        };
        let (addr, _) = start_test_server(handler).await;

        let mut slow = TcpStream::connect(addr).await.unwrap();
        slow.write_all(&STARTUP).await.unwrap();
        read_until_ready(&mut slow).await;
        send_query(&mut slow, "slow").await;

        let mut fast = TcpStream::connect(addr).await.unwrap();
        fast.write_all(&STARTUP).await.unwrap();
        tokio::time::timeout(Duration::from_millis(250), read_until_ready(&mut fast))
            .await
            .expect("handshake stalled behind a slow handler");

        read_until_ready(&mut slow).await;
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let server = Server::new(
            ServerConfig::new(0, FixedReply::default()),
            vec![with_host("127.0.0.1")],
        );
        let acceptor = server.bind().await.unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(acceptor.run_until(async {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
