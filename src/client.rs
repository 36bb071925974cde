//! The instrumented Bot API client.
//!
//! hyper's pooled client hides connection setup, so this client performs
//! the connection lifecycle itself (resolve, connect, optional proxy
//! tunnel, optional TLS) and hands the finished stream to a hyper HTTP/1
//! connection. Each stage is timed and reported to the [`LogSink`]; the
//! stages inside the exchange are reported by the [`WireTap`] wrapped
//! around the stream.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use hyper::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Body, Method, Request};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{self, Duration, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::cancel::CancelSignal;
use crate::clock::{fmt_duration, Stopwatch};
use crate::connection_pool::{ConnectionStats, ConnectionTracker, IdleSlot, PoolConfig, PooledConn};
use crate::errors::{status_reason, CallError, ConfigError, ControlError};
use crate::hub::LogSink;
use crate::proxy::{self, join_host_port, ProxyEndpoint};
use crate::trace::{Stage, StageTimings, TracedIo, WireTap};

/// Public Bot API root.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

const USER_AGENT_VALUE: &str = concat!("tg_wireprobe/", env!("CARGO_PKG_VERSION"));

/// Fixed per-stage budgets, independent of the per-call deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageBudgets {
    pub dial: Duration,
    pub tls_handshake: Duration,
    pub response_header: Duration,
}

impl Default for StageBudgets {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(30),
            tls_handshake: Duration::from_secs(15),
            response_header: Duration::from_secs(30),
        }
    }
}

/// Transport-level settings fixed for the lifetime of a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base: String,
    pub proxy: Option<ProxyEndpoint>,
    pub pool: PoolConfig,
    pub budgets: StageBudgets,
    /// Overall per-call timeout the client will be driven with. Only
    /// reported; the deadline itself arrives with each call.
    pub call_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            proxy: None,
            pool: PoolConfig::default(),
            budgets: StageBudgets::default(),
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-call parameters. Never mutated by the client.
#[derive(Clone, PartialEq, Eq)]
pub struct CallConfig {
    pub chat_id: String,
    pub bot_token: String,
    pub message_thread_id: Option<String>,
    pub text: String,
    pub timeout: Duration,
}

impl fmt::Debug for CallConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallConfig")
            .field("chat_id", &self.chat_id)
            .field("bot_token", &crate::utils::mask_secret(&self.bot_token))
            .field("message_thread_id", &self.message_thread_id)
            .field("text_len", &self.text.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CallConfig {
    /// The form-encoded request body.
    pub fn form_body(&self) -> String {
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        form.append_pair("chat_id", &self.chat_id);
        form.append_pair("text", &self.text);
        if let Some(thread) = self.message_thread_id.as_deref().filter(|t| !t.is_empty()) {
            form.append_pair("message_thread_id", thread);
        }
        form.append_pair("parse_mode", "MarkdownV2");
        form.append_pair("disable_web_page_preview", "True");
        form.finish()
    }
}

/// The cancellable deadline a call runs under.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Instant,
    timeout: Duration,
    cancel: CancelSignal,
}

impl CallContext {
    /// Deadline `timeout` from now.
    pub fn new(timeout: Duration, cancel: CancelSignal) -> Self {
        Self::with_deadline(Instant::now() + timeout, timeout, cancel)
    }

    pub fn with_deadline(deadline: Instant, timeout: Duration, cancel: CancelSignal) -> Self {
        Self {
            deadline,
            timeout,
            cancel,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Something that can deliver one message per call.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, call: &CallConfig, ctx: CallContext) -> Result<(), CallError>;

    /// Connection reuse counters, if the transport keeps any.
    fn connection_stats(&self) -> Option<ConnectionStats> {
        None
    }
}

/// Where calls go: scheme, host and the path prefix of the API root.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    tls: bool,
    host: String,
    port: u16,
    base_path: String,
}

impl Endpoint {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidEndpoint {
            url: raw.to_string(),
            message: message.to_string(),
        };
        let url = Url::parse(raw.trim()).map_err(|e| invalid(&e.to_string()))?;
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            _ => return Err(invalid("scheme must be http or https")),
        };
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;
        Ok(Self {
            tls,
            host,
            port,
            base_path: url.path().trim_end_matches('/').to_string(),
        })
    }

    fn authority(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port != default_port {
            self.authority()
        } else if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    fn send_message_path(&self, bot_token: &str) -> String {
        format!("{}/bot{}/sendMessage", self.base_path, bot_token)
    }
}

/// Either a plain TCP stream or one wrapped in TLS.
enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

struct TlsSetup {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Instrumented client for `sendMessage`.
pub struct TracingClient {
    endpoint: Endpoint,
    proxy: Option<ProxyEndpoint>,
    budgets: StageBudgets,
    tls: Option<TlsSetup>,
    pool: IdleSlot,
    tracker: ConnectionTracker,
    sink: LogSink,
}

impl TracingClient {
    /// Builds the client and logs the settings it will run with.
    pub fn new(config: ClientConfig, sink: LogSink) -> Result<Self, ControlError> {
        let endpoint = Endpoint::parse(&config.api_base)?;
        let tls = if endpoint.tls {
            Some(build_tls(&endpoint.host)?)
        } else {
            None
        };

        if !config.pool.keep_alive {
            sink.info("Keep-alive disabled: every request will use a new connection");
        }
        match &config.proxy {
            Some(proxy) => {
                sink.info(format!(
                    "Proxy configured: {} (scheme: {}, host: {})",
                    proxy,
                    proxy.scheme.as_str(),
                    proxy.authority()
                ));
                if let Some(creds) = &proxy.credentials {
                    sink.info(format!("Proxy authentication: user '{}'", creds.username));
                }
            }
            None => sink.info("No proxy in use (direct connection)"),
        }
        sink.info(format!(
            "HTTP client created. Timeout: {}, DialTimeout: {}, TLSHandshake: {}, ResponseHeader: {}",
            fmt_duration(config.call_timeout),
            fmt_duration(config.budgets.dial),
            fmt_duration(config.budgets.tls_handshake),
            fmt_duration(config.budgets.response_header)
        ));

        Ok(Self {
            endpoint,
            proxy: config.proxy,
            budgets: config.budgets,
            tls,
            pool: IdleSlot::new(config.pool),
            tracker: ConnectionTracker::new(),
            sink,
        })
    }

    fn via_proxy(&self) -> &'static str {
        if self.proxy.is_some() {
            " to proxy"
        } else {
            ""
        }
    }

    fn build_request(&self, call: &CallConfig) -> Result<Request<Body>, CallError> {
        self.sink
            .info(format!("Preparing request to {}", self.endpoint.host));
        let body = call.form_body();
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.send_message_path(&call.bot_token))
            .header(HOST, self.endpoint.host_header())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(CONTENT_LENGTH, body.len())
            .header(USER_AGENT, USER_AGENT_VALUE);
        if !self.pool.config().keep_alive {
            builder = builder.header(CONNECTION, "close");
        }
        builder.body(Body::from(body)).map_err(|e| {
            self.sink.error(format!("Failed to build request: {}", e));
            CallError::InvalidRequest(e.to_string())
        })
    }

    /// Runs one request. While the request is on the wire its tap is
    /// published in `active_tap`, so a caller that abandons this future
    /// can still collect the wire marks.
    async fn exchange(
        &self,
        request: Request<Body>,
        timings: &mut StageTimings,
        active_tap: &Mutex<Option<Arc<WireTap>>>,
    ) -> Result<(), CallError> {
        let mut conn = self.acquire(timings).await?;

        conn.tap.arm();
        *lock_tap(active_tap) = Some(conn.tap.clone());
        let sent = time::timeout(
            self.budgets.response_header,
            conn.sender.send_request(request),
        )
        .await;
        timings.absorb(conn.tap.disarm());
        lock_tap(active_tap).take();

        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(CallError::Transport {
                    stage: timings.stage_in_progress(),
                    message: error_chain(&e),
                })
            }
            Err(_) => {
                return Err(CallError::Transport {
                    stage: timings.stage_in_progress(),
                    message: format!(
                        "no response headers within {}",
                        fmt_duration(self.budgets.response_header)
                    ),
                })
            }
        };

        let status = response.status().as_u16();
        let header = |name: hyper::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        let (content_length, content_type) = (header(CONTENT_LENGTH), header(CONTENT_TYPE));
        let so_far = timings
            .get_conn_start
            .map(|t| t.elapsed())
            .unwrap_or_default();
        self.sink.info(format!(
            "Response received. Status: {}, Time: {}, ConnReused: {}",
            status,
            fmt_duration(so_far),
            timings.reused
        ));
        self.sink.info(format!(
            "Response headers: Content-Length={}, Content-Type={}",
            content_length, content_type
        ));

        let read = Stopwatch::start();
        let body = match hyper::body::to_bytes(response.into_body()).await {
            Ok(body) => body,
            Err(e) => {
                self.sink.error(format!(
                    "Failed to read response body after {}: {}",
                    fmt_duration(read.elapsed()),
                    e
                ));
                return Err(CallError::ResponseRead {
                    stage: Stage::BodyRead,
                    message: error_chain(&e),
                });
            }
        };
        timings.body_done = Some(Instant::now());
        self.sink.info(format!(
            "Response body read in {}, size: {} bytes",
            fmt_duration(read.elapsed()),
            body.len()
        ));

        self.pool.checkin(conn);

        if status != 200 {
            return Err(CallError::RemoteRejected {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(())
    }

    async fn acquire(&self, timings: &mut StageTimings) -> Result<PooledConn, CallError> {
        let target = self.endpoint.authority();
        if self.proxy.is_some() {
            self.sink
                .info(format!("GetConn: requesting connection for {} (via proxy)", target));
        } else {
            self.sink
                .info(format!("GetConn: requesting connection for {}", target));
        }

        if self.pool.is_empty() {
            debug!(authority = %target, "No idle connection to reuse");
        }
        if let Some((mut conn, idle)) = self.pool.checkout() {
            let ready = std::future::poll_fn(|cx| conn.sender.poll_ready(cx)).await;
            if ready.is_ok() {
                let now = Instant::now();
                timings.got_conn = Some(now);
                timings.reused = true;
                timings.idle = Some(idle);
                self.sink.info(format!(
                    "GotConn: reused connection to {} (local: {}, idle: {}, total: {})",
                    conn.remote_addr,
                    conn.local_addr,
                    fmt_duration(idle),
                    fmt_duration(timings.acquisition().unwrap_or_default())
                ));
                self.tracker.record(true);
                return Ok(conn);
            }
            debug!(remote = %conn.remote_addr, "Pooled connection closed, dialing a new one");
        }

        let conn = self.connect(timings).await?;
        timings.got_conn = Some(Instant::now());
        self.sink.info(format!(
            "GotConn: new connection to {} (total: {})",
            conn.remote_addr,
            fmt_duration(timings.acquisition().unwrap_or_default())
        ));
        self.tracker.record(false);
        Ok(conn)
    }

    async fn connect(&self, timings: &mut StageTimings) -> Result<PooledConn, CallError> {
        let (dial_host, dial_port) = match &self.proxy {
            Some(p) => (p.host.as_str(), p.port),
            None => (self.endpoint.host.as_str(), self.endpoint.port),
        };
        let dial_target = join_host_port(dial_host, dial_port);

        self.sink
            .info(format!("Dialer: connecting to {} (tcp)", dial_target));
        let dial_clock = Stopwatch::start();
        let dialed = time::timeout(self.budgets.dial, self.dial(dial_host, dial_port, timings)).await;
        let mut stream = match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.sink.error(format!(
                    "Dialer: failed to connect to {} after {}: {}",
                    dial_target,
                    fmt_duration(dial_clock.elapsed()),
                    e
                ));
                return Err(e);
            }
            Err(_) => {
                let e = CallError::Dial {
                    stage: Stage::Connect,
                    message: format!("dial timeout of {} exceeded", fmt_duration(self.budgets.dial)),
                };
                self.sink.error(format!(
                    "Dialer: failed to connect to {} after {}: {}",
                    dial_target,
                    fmt_duration(dial_clock.elapsed()),
                    e
                ));
                return Err(e);
            }
        };

        let local_addr = stream.local_addr().map_err(|e| CallError::Dial {
            stage: Stage::Connect,
            message: e.to_string(),
        })?;
        let remote_addr = stream.peer_addr().map_err(|e| CallError::Dial {
            stage: Stage::Connect,
            message: e.to_string(),
        })?;
        self.sink.info(format!(
            "Dialer: connected to {} in {} (local: {})",
            dial_target,
            fmt_duration(dial_clock.elapsed()),
            local_addr
        ));
        if let Err(e) = self.pool.config().apply_to_socket(&stream) {
            self.sink
                .warn(format!("Could not enable TCP keepalive: {}", e));
        }

        if let Some(proxy) = &self.proxy {
            self.open_tunnel(&mut stream, proxy, timings).await?;
        }

        let io = if self.endpoint.tls {
            MaybeTlsStream::Tls(Box::new(self.tls_handshake(stream, timings).await?))
        } else {
            MaybeTlsStream::Plain(stream)
        };

        let tap = WireTap::new(self.sink.clone());
        let (sender, connection) = hyper::client::conn::Builder::new()
            .handshake::<_, Body>(TracedIo::new(io, tap.clone()))
            .await
            .map_err(|e| CallError::Transport {
                stage: Stage::GotConn,
                message: error_chain(&e),
            })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Connection task ended with error");
            }
        });

        Ok(PooledConn {
            sender,
            remote_addr,
            local_addr,
            tap,
        })
    }

    async fn dial(
        &self,
        host: &str,
        port: u16,
        timings: &mut StageTimings,
    ) -> Result<TcpStream, CallError> {
        let via = self.via_proxy();
        let addrs: Vec<SocketAddr> = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, port)],
            Err(_) => {
                let started = Instant::now();
                timings.dns_start = Some(started);
                if self.proxy.is_some() {
                    self.sink
                        .info(format!("DNS lookup started for proxy: {}", host));
                } else {
                    self.sink.info(format!("DNS lookup started for: {}", host));
                }
                let resolved = lookup_host((host, port)).await;
                timings.dns_done = Some(Instant::now());
                let took = fmt_duration(timings.dns().unwrap_or_default());
                match resolved {
                    Ok(found) => {
                        let addrs: Vec<SocketAddr> = found.collect();
                        let ips: Vec<String> = addrs.iter().map(|a| a.ip().to_string()).collect();
                        self.sink.info(format!(
                            "DNS lookup completed in {}, resolved to [{}]",
                            took,
                            ips.join(", ")
                        ));
                        addrs
                    }
                    Err(e) => {
                        self.sink
                            .error(format!("DNS lookup failed after {}: {}", took, e));
                        return Err(CallError::Dial {
                            stage: Stage::Dns,
                            message: e.to_string(),
                        });
                    }
                }
            }
        };
        if addrs.is_empty() {
            return Err(CallError::Dial {
                stage: Stage::Dns,
                message: format!("no addresses found for {}", host),
            });
        }

        let mut last_error = None;
        for addr in addrs {
            timings.connect_start = Some(Instant::now());
            self.sink
                .info(format!("TCP connect{} started: tcp {}", via, addr));
            let attempt = TcpStream::connect(addr).await;
            timings.connect_done = Some(Instant::now());
            let took = fmt_duration(timings.connect().unwrap_or_default());
            match attempt {
                Ok(stream) => {
                    self.sink
                        .info(format!("TCP connection{} established in {}", via, took));
                    return Ok(stream);
                }
                Err(e) => {
                    self.sink.error(format!(
                        "TCP connection{} to {} failed after {}: {}",
                        via, addr, took, e
                    ));
                    last_error = Some(e);
                }
            }
        }
        Err(CallError::Dial {
            stage: Stage::Connect,
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no address could be reached".to_string()),
        })
    }

    async fn open_tunnel(
        &self,
        stream: &mut TcpStream,
        proxy: &ProxyEndpoint,
        timings: &mut StageTimings,
    ) -> Result<(), CallError> {
        self.sink.info(format!(
            "Proxy {}: requesting tunnel to {}",
            proxy.scheme.as_str(),
            self.endpoint.authority()
        ));
        timings.proxy_start = Some(Instant::now());
        let started = Stopwatch::start();
        let handshake = proxy::establish(stream, proxy, &self.endpoint.host, self.endpoint.port);
        let reply = match time::timeout(self.budgets.dial, handshake).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.sink.error(format!(
                    "Proxy handshake with {} failed after {}: {}",
                    proxy.authority(),
                    fmt_duration(started.elapsed()),
                    e
                ));
                return Err(CallError::ProxyTunnel(e.to_string()));
            }
            Err(_) => {
                let message = format!(
                    "proxy handshake timeout of {} exceeded",
                    fmt_duration(self.budgets.dial)
                );
                self.sink.error(format!(
                    "Proxy handshake with {} failed: {}",
                    proxy.authority(),
                    message
                ));
                return Err(CallError::ProxyTunnel(message));
            }
        };
        timings.proxy_connect_done = Some(Instant::now());
        timings.proxy_status = Some(reply.code());

        self.sink.info(format!(
            "Proxy CONNECT: response from proxy {} -> status {}",
            proxy.authority(),
            reply
        ));
        if !reply.is_established() {
            self.sink.error(format!(
                "Proxy CONNECT: tunnel not established, code {}",
                reply.code()
            ));
            return Err(CallError::ProxyTunnel(format!("proxy answered {}", reply)));
        }
        Ok(())
    }

    async fn tls_handshake(
        &self,
        stream: TcpStream,
        timings: &mut StageTimings,
    ) -> Result<TlsStream<TcpStream>, CallError> {
        let setup = self
            .tls
            .as_ref()
            .ok_or_else(|| CallError::Tls("TLS is not configured for this endpoint".to_string()))?;

        timings.tls_start = Some(Instant::now());
        if self.proxy.is_some() {
            self.sink.info(format!(
                "TLS handshake started (through proxy tunnel to {})",
                self.endpoint.host
            ));
        } else {
            self.sink.info("TLS handshake started");
        }

        let handshake = setup.connector.connect(setup.server_name.clone(), stream);
        let result = time::timeout(self.budgets.tls_handshake, handshake).await;
        timings.tls_done = Some(Instant::now());
        let took = fmt_duration(timings.tls().unwrap_or_default());

        match result {
            Ok(Ok(tls)) => {
                let (_, session) = tls.get_ref();
                let version = session
                    .protocol_version()
                    .map(tls_version_name)
                    .unwrap_or_else(|| "unknown".to_string());
                let cipher = session
                    .negotiated_cipher_suite()
                    .map(|s| format!("{:?}", s.suite()))
                    .unwrap_or_else(|| "unknown".to_string());
                self.sink.info(format!(
                    "TLS handshake completed in {}. Version: {}, Cipher: {}, ServerName: {}",
                    took, version, cipher, self.endpoint.host
                ));
                Ok(tls)
            }
            Ok(Err(e)) => {
                self.sink
                    .error(format!("TLS handshake failed after {}: {}", took, e));
                Err(CallError::Tls(error_chain(&e)))
            }
            Err(_) => {
                let message = format!(
                    "handshake timeout of {} exceeded",
                    fmt_duration(self.budgets.tls_handshake)
                );
                self.sink
                    .error(format!("TLS handshake failed after {}: {}", took, message));
                Err(CallError::Tls(message))
            }
        }
    }

    fn report_failure(&self, error: &CallError, total: Duration, stage: Stage) {
        match error {
            CallError::RemoteRejected { status, body } => {
                self.sink.error(format!(
                    "Telegram API error: status={} ({}), body={}",
                    status,
                    status_reason(*status),
                    body
                ));
            }
            other => {
                self.sink.error(format!(
                    "HTTP request failed after {}: {}",
                    fmt_duration(total),
                    other
                ));
                match other {
                    CallError::DeadlineExceeded(_) => {
                        self.sink.error("Cause: per-call deadline exceeded");
                        self.sink.error(format!(
                            "Deadline hit during stage: {} (after {})",
                            stage,
                            fmt_duration(total)
                        ));
                    }
                    CallError::Canceled => {
                        self.sink.error("Cause: call canceled");
                        self.sink.error(format!(
                            "Canceled during stage: {} (after {})",
                            stage,
                            fmt_duration(total)
                        ));
                    }
                    _ => self.sink.error(format!("Failure kind: {}", other.kind())),
                }
            }
        }
    }
}

#[async_trait]
impl MessageTransport for TracingClient {
    async fn send(&self, call: &CallConfig, ctx: CallContext) -> Result<(), CallError> {
        let CallContext {
            deadline,
            timeout,
            mut cancel,
        } = ctx;

        let request = self.build_request(call)?;
        self.sink.info("Executing HTTP request...");
        let started = Stopwatch::start();
        let mut timings = StageTimings::start();
        let active_tap = Mutex::new(None);

        let outcome = {
            let exchange = self.exchange(request, &mut timings, &active_tap);
            tokio::pin!(exchange);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(CallError::Canceled),
                _ = time::sleep_until(deadline) => Err(CallError::DeadlineExceeded(timeout)),
                result = &mut exchange => result,
            }
        };
        let total = started.elapsed();
        // An abandoned exchange never disarmed its tap.
        let abandoned = lock_tap(&active_tap).take();
        if let Some(tap) = abandoned {
            timings.absorb(tap.disarm());
        }

        match &outcome {
            Ok(()) => self.sink.info(format!(
                "Request succeeded. Total time: {}",
                fmt_duration(total)
            )),
            Err(e) => self.report_failure(e, total, timings.stage_in_progress()),
        }
        self.sink
            .info(format!("Stage breakdown: {}", timings.summary()));
        outcome
    }

    fn connection_stats(&self) -> Option<ConnectionStats> {
        Some(self.tracker.stats())
    }
}

fn lock_tap(
    slot: &Mutex<Option<Arc<WireTap>>>,
) -> std::sync::MutexGuard<'_, Option<Arc<WireTap>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn build_tls(host: &str) -> Result<TlsSetup, ControlError> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs()
        .map_err(|e| ControlError::ClientBuild(format!("failed to load native certificates: {}", e)))?;
    let (added, ignored) = roots.add_parsable_certificates(native);
    debug!(added, ignored, "Loaded native root certificates");
    if added == 0 {
        return Err(ControlError::ClientBuild(
            "no trusted root certificates found".to_string(),
        ));
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = ServerName::try_from(host)
        .map_err(|e| ControlError::ClientBuild(format!("invalid TLS server name '{}': {}", host, e)))?
        .to_owned();

    Ok(TlsSetup {
        connector: TlsConnector::from(Arc::new(config)),
        server_name,
    })
}

fn tls_version_name(version: rustls::ProtocolVersion) -> String {
    match version {
        rustls::ProtocolVersion::TLSv1_2 => "TLS 1.2".to_string(),
        rustls::ProtocolVersion::TLSv1_3 => "TLS 1.3".to_string(),
        other => format!("{:?}", other),
    }
}

/// Renders an error and its sources as `outer: inner: root`.
fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
