//! Embedded STUN/TURN relay.
//!
//! One UDP socket and one TCP listener share the configured address. UDP is
//! served by a single TURN server; every accepted TCP stream gets its own
//! server instance over a framed [`TcpTurnConn`]. All instances share one
//! [`TokenAuthHandler`], so a relay credential is only as good as the access
//! token it was derived from.

use std::any::Any;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use turn::auth::AuthHandler;
use turn::relay::relay_static::RelayAddressGeneratorStatic;
use turn::relay::RelayAddressGenerator;
use turn::server::config::{ConnConfig, ServerConfig};
use turn::server::Server;
use webrtc_util::vnet::net::Net;
use webrtc_util::Conn;

use crate::config::RelayConfig;
use crate::credentials::{self, CredentialIssuer};
use crate::db::TokenStore;
use crate::security::FixedWindowRateLimiter;

/// Upper bound on a single token-store lookup during relay authentication.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(2);

const AUTH_RATE_WINDOW: Duration = Duration::from_secs(60);
const AUTH_RATE_MAX_KEYS: usize = 50_000;

const STUN_HEADER_SIZE: usize = 20;
const CHANNEL_DATA_HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthRejection {
    #[error("too many authentication attempts from source")]
    RateLimited,
    #[error("realm mismatch")]
    RealmMismatch,
    #[error("username does not carry the relay prefix")]
    MissingPrefix,
    #[error("empty token")]
    EmptyToken,
    #[error("token lookup timed out")]
    Timeout,
    #[error("token store error: {0}")]
    Store(String),
    #[error("unknown token")]
    UnknownToken,
    #[error("token expired")]
    Expired,
}

/// Validates TURN long-term credentials against the access-token store.
pub struct TokenAuthHandler<S> {
    realm: String,
    username_prefix: String,
    store: Arc<S>,
    limiter: FixedWindowRateLimiter,
    lookup_timeout: Duration,
    runtime: Handle,
}

impl<S: TokenStore> TokenAuthHandler<S> {
    /// Must be called from within a Tokio runtime; lookups run on it.
    pub fn new(config: &RelayConfig, store: Arc<S>) -> Self {
        Self {
            realm: config.realm.clone(),
            username_prefix: config.username_prefix.clone(),
            store,
            limiter: FixedWindowRateLimiter::new(
                config.auth_rate_limit.max(1),
                AUTH_RATE_WINDOW,
                AUTH_RATE_MAX_KEYS,
            ),
            lookup_timeout: AUTH_TIMEOUT,
            runtime: Handle::current(),
        }
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Returns the long-term key for `username` or the reason it was refused.
    pub async fn authorize(
        &self,
        username: &str,
        realm: &str,
        src_addr: SocketAddr,
    ) -> Result<Vec<u8>, AuthRejection> {
        if !self.limiter.allow(&src_addr.ip().to_string()) {
            return Err(AuthRejection::RateLimited);
        }
        if realm != self.realm {
            return Err(AuthRejection::RealmMismatch);
        }
        let token = username
            .strip_prefix(self.username_prefix.as_str())
            .ok_or(AuthRejection::MissingPrefix)?;
        if token.is_empty() {
            return Err(AuthRejection::EmptyToken);
        }

        let record = match tokio::time::timeout(self.lookup_timeout, self.store.lookup(token)).await
        {
            Err(_) => return Err(AuthRejection::Timeout),
            Ok(Err(err)) => return Err(AuthRejection::Store(err.to_string())),
            Ok(Ok(None)) => return Err(AuthRejection::UnknownToken),
            Ok(Ok(Some(record))) => record,
        };
        if record.is_expired() {
            return Err(AuthRejection::Expired);
        }

        debug!(user_id = record.user_id, %src_addr, "relay credential accepted");
        Ok(credentials::derive_auth_key(username, realm, token))
    }
}

impl<S: TokenStore> AuthHandler for TokenAuthHandler<S> {
    fn auth_handle(
        &self,
        username: &str,
        realm: &str,
        src_addr: SocketAddr,
    ) -> Result<Vec<u8>, turn::Error> {
        // The TURN server calls this synchronously from its read loop.
        let outcome = tokio::task::block_in_place(|| {
            self.runtime
                .block_on(self.authorize(username, realm, src_addr))
        });
        outcome.map_err(|reason| {
            warn!(%src_addr, "relay authentication rejected: {}", reason);
            turn::Error::Other(reason.to_string())
        })
    }
}

/// Settings the relay actually runs with, after address resolution.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub realm: String,
    pub username_prefix: String,
    pub relay_ip: IpAddr,
    pub port: u16,
}

impl RelaySettings {
    pub fn issuer(&self) -> CredentialIssuer {
        CredentialIssuer::new(
            self.realm.clone(),
            self.username_prefix.clone(),
            Some(self.relay_ip),
            self.port,
        )
    }
}

struct TcpServeContext {
    realm: String,
    relay_ip: IpAddr,
    bind_address: String,
    auth: Arc<dyn AuthHandler + Send + Sync>,
}

impl TcpServeContext {
    fn server_config(&self, conn: Arc<dyn Conn + Send + Sync>) -> ServerConfig {
        server_config(
            conn,
            self.realm.clone(),
            self.relay_ip,
            self.bind_address.clone(),
            self.auth.clone(),
        )
    }
}

fn server_config(
    conn: Arc<dyn Conn + Send + Sync>,
    realm: String,
    relay_ip: IpAddr,
    bind_address: String,
    auth: Arc<dyn AuthHandler + Send + Sync>,
) -> ServerConfig {
    let relay_addr_generator: Box<dyn RelayAddressGenerator + Send + Sync> =
        Box::new(RelayAddressGeneratorStatic {
            relay_address: relay_ip,
            address: bind_address,
            net: Arc::new(Net::new(None)),
        });
    ServerConfig {
        conn_configs: vec![ConnConfig {
            conn,
            relay_addr_generator,
        }],
        realm,
        auth_handler: auth,
        channel_bind_timeout: Duration::from_secs(0),
        alloc_close_notify: None,
    }
}

/// Local address relayed allocations bind to. An unspecified listen address
/// follows the family of the advertised relay IP.
fn allocation_bind_address(listen_ip: IpAddr, relay_ip: IpAddr) -> String {
    let ip = if listen_ip.is_unspecified() {
        match relay_ip {
            IpAddr::V4(_) => IpAddr::from([0u8; 4]),
            IpAddr::V6(_) => IpAddr::from([0u16; 8]),
        }
    } else {
        listen_ip
    };
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

pub struct RelayServer {
    udp: Server,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    settings: RelaySettings,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RelayServer {
    pub async fn start<S: TokenStore>(config: &RelayConfig, store: Arc<S>) -> anyhow::Result<Self> {
        let relay_ip = credentials::resolve_relay_ip(config.relay_address)?;

        let udp = UdpSocket::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind relay UDP socket on {}", config.listen))?;
        let udp_addr = udp.local_addr()?;
        // Share the UDP port even when an ephemeral port was requested.
        let tcp_bind = SocketAddr::new(config.listen.ip(), udp_addr.port());
        let listener = TcpListener::bind(tcp_bind)
            .await
            .with_context(|| format!("failed to bind relay TCP listener on {}", tcp_bind))?;
        let tcp_addr = listener.local_addr()?;

        let auth: Arc<dyn AuthHandler + Send + Sync> =
            Arc::new(TokenAuthHandler::new(config, store));
        let bind_address = allocation_bind_address(config.listen.ip(), relay_ip);

        let udp_server = Server::new(server_config(
            Arc::new(udp),
            config.realm.clone(),
            relay_ip,
            bind_address.clone(),
            auth.clone(),
        ))
        .await
        .context("failed to start TURN server on UDP")?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(TcpServeContext {
            realm: config.realm.clone(),
            relay_ip,
            bind_address,
            auth,
        });
        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));

        let settings = RelaySettings {
            realm: config.realm.clone(),
            username_prefix: config.username_prefix.clone(),
            relay_ip,
            port: credentials::port_from_listen_address(udp_addr),
        };
        info!(
            "TURN relay listening on udp/tcp {} (relay address {}, realm {})",
            udp_addr, relay_ip, settings.realm
        );

        Ok(Self {
            udp: udp_server,
            udp_addr,
            tcp_addr,
            settings,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Stops accepting and closes every server instance. Safe to call twice.
    pub async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown.send(true);
        let task = match self.accept_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
        self.udp.close().await?;
        info!("TURN relay closed");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<TcpServeContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_tcp_stream(stream, peer, ctx.clone(), shutdown.clone()));
                }
                Err(err) => {
                    warn!("relay TCP accept failed: {}", err);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

async fn serve_tcp_stream(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<TcpServeContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn = match TcpTurnConn::new(stream) {
        Ok(conn) => Arc::new(conn),
        Err(err) => {
            warn!(%peer, "dropping relay TCP connection: {}", err);
            return;
        }
    };
    let mut closed = conn.closed_signal();

    let server = match Server::new(ctx.server_config(conn.clone())).await {
        Ok(server) => server,
        Err(err) => {
            warn!(%peer, "failed to start TURN server for TCP stream: {}", err);
            return;
        }
    };
    debug!(%peer, "relay TCP stream opened");

    tokio::select! {
        _ = closed.wait_for(|closed| *closed) => {}
        _ = shutdown.changed() => {}
    }

    if let Err(err) = server.close().await {
        debug!(%peer, "TURN server close: {}", err);
    }
    let _ = conn.close().await;
    debug!(%peer, "relay TCP stream closed");
}

/// Wire length and message length of the framed message starting with
/// `header` (RFC 5766 section 11.5).
fn tcp_frame_len(header: [u8; 4]) -> Result<(usize, usize), String> {
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    match header[0] >> 6 {
        0b00 => {
            let total = STUN_HEADER_SIZE + len;
            Ok((total, total))
        }
        0b01 => {
            let message = CHANNEL_DATA_HEADER_SIZE + len;
            Ok((message.next_multiple_of(4), message))
        }
        _ => Err(format!("unexpected leading byte 0x{:02x}", header[0])),
    }
}

/// Presents one TCP stream as a packet [`Conn`] for the TURN server.
pub struct TcpTurnConn {
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
    local: SocketAddr,
    peer: SocketAddr,
    closed: watch::Sender<bool>,
}

impl TcpTurnConn {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Ok(Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            local,
            peer,
            closed,
        })
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn mark_closed(&self, reason: impl std::fmt::Display) -> webrtc_util::Error {
        self.closed.send_replace(true);
        webrtc_util::Error::Other(reason.to_string())
    }

    async fn read_frame(&self, buf: &mut [u8]) -> webrtc_util::Result<usize> {
        let mut reader = self.reader.lock().await;
        let mut header = [0u8; 4];
        reader
            .read_exact(&mut header)
            .await
            .map_err(|err| self.mark_closed(err))?;

        let (wire_len, message_len) = tcp_frame_len(header).map_err(|err| self.mark_closed(err))?;
        if wire_len > buf.len() {
            return Err(self.mark_closed(format!(
                "frame of {} bytes exceeds buffer of {}",
                wire_len,
                buf.len()
            )));
        }
        buf[..4].copy_from_slice(&header);
        reader
            .read_exact(&mut buf[4..wire_len])
            .await
            .map_err(|err| self.mark_closed(err))?;
        Ok(message_len)
    }

    async fn write_frame(&self, buf: &[u8]) -> webrtc_util::Result<usize> {
        let mut writer = self.writer.lock().await;
        let result = if !buf.is_empty() && buf[0] >> 6 == 0b01 && buf.len() % 4 != 0 {
            let mut padded = buf.to_vec();
            padded.resize(buf.len().next_multiple_of(4), 0);
            writer.write_all(&padded).await
        } else {
            writer.write_all(buf).await
        };
        result.map_err(|err| self.mark_closed(err))?;
        Ok(buf.len())
    }
}

#[async_trait]
impl Conn for TcpTurnConn {
    async fn connect(&self, _addr: SocketAddr) -> webrtc_util::Result<()> {
        Err(webrtc_util::Error::Other("stream is already connected".into()))
    }

    async fn recv(&self, buf: &mut [u8]) -> webrtc_util::Result<usize> {
        self.read_frame(buf).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc_util::Result<(usize, SocketAddr)> {
        let n = self.read_frame(buf).await?;
        Ok((n, self.peer))
    }

    async fn send(&self, buf: &[u8]) -> webrtc_util::Result<usize> {
        self.write_frame(buf).await
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> webrtc_util::Result<usize> {
        self.write_frame(buf).await
    }

    fn local_addr(&self) -> webrtc_util::Result<SocketAddr> {
        Ok(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    async fn close(&self) -> webrtc_util::Result<()> {
        self.closed.send_replace(true);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
