//! Per-call stage instrumentation.
//!
//! Connection setup stages (DNS, connect, proxy tunnel, TLS) are timed by
//! the client as it performs them. Stages that happen inside the HTTP
//! exchange (headers written, request written, first response byte) are not
//! visible from outside hyper, so the connection's IO is wrapped in a
//! [`TracedIo`] that reports them to a [`WireTap`].

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Duration, Instant};

use crate::clock::{fmt_duration, span};
use crate::hub::LogSink;

/// Named stages of one call's connection lifecycle, in the order a call
/// goes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    GetConn,
    Dns,
    Connect,
    ProxyHandshake,
    Tls,
    GotConn,
    WroteHeaders,
    WroteRequest,
    FirstByte,
    BodyRead,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::GetConn => "connection acquisition",
            Stage::Dns => "DNS lookup",
            Stage::Connect => "TCP connect",
            Stage::ProxyHandshake => "proxy tunnel handshake",
            Stage::Tls => "TLS handshake",
            Stage::GotConn => "HTTP connection setup",
            Stage::WroteHeaders => "writing request headers",
            Stage::WroteRequest => "writing request body",
            Stage::FirstByte => "waiting for first response byte",
            Stage::BodyRead => "reading response body",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stage marks of a single call. Lives only for the duration of the call.
#[derive(Debug, Clone, Default)]
pub(crate) struct StageTimings {
    pub get_conn_start: Option<Instant>,
    pub dns_start: Option<Instant>,
    pub dns_done: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_done: Option<Instant>,
    pub proxy_start: Option<Instant>,
    pub proxy_connect_done: Option<Instant>,
    pub proxy_status: Option<u16>,
    pub tls_start: Option<Instant>,
    pub tls_done: Option<Instant>,
    pub got_conn: Option<Instant>,
    pub reused: bool,
    pub idle: Option<Duration>,
    pub wrote_headers: Option<Instant>,
    pub wrote_request: Option<Instant>,
    pub first_byte: Option<Instant>,
    pub body_done: Option<Instant>,
}

impl StageTimings {
    pub fn start() -> Self {
        Self {
            get_conn_start: Some(Instant::now()),
            ..Self::default()
        }
    }

    /// The stage the call was in when it stopped: the one following the
    /// last recorded mark.
    pub fn stage_in_progress(&self) -> Stage {
        if self.first_byte.is_some() {
            return Stage::BodyRead;
        }
        if self.wrote_request.is_some() {
            return Stage::FirstByte;
        }
        if self.wrote_headers.is_some() {
            return Stage::WroteRequest;
        }
        if self.got_conn.is_some() {
            return Stage::WroteHeaders;
        }
        if self.tls_start.is_some() {
            return if self.tls_done.is_some() {
                Stage::GotConn
            } else {
                Stage::Tls
            };
        }
        if self.proxy_start.is_some() {
            return if self.proxy_connect_done.is_some() {
                Stage::GotConn
            } else {
                Stage::ProxyHandshake
            };
        }
        if let Some(started) = self.connect_start {
            // A failed attempt on one address leaves connect_done behind the
            // next attempt's start.
            return match self.connect_done {
                Some(done) if done >= started => Stage::GotConn,
                _ => Stage::Connect,
            };
        }
        if self.dns_start.is_some() {
            return if self.dns_done.is_some() {
                Stage::Connect
            } else {
                Stage::Dns
            };
        }
        Stage::GetConn
    }

    pub fn absorb(&mut self, wire: WireMarks) {
        self.wrote_headers = wire.wrote_headers.or(self.wrote_headers);
        self.wrote_request = wire.wrote_request.or(self.wrote_request);
        self.first_byte = wire.first_byte.or(self.first_byte);
    }

    pub fn dns(&self) -> Option<Duration> {
        span(self.dns_start, self.dns_done)
    }

    pub fn connect(&self) -> Option<Duration> {
        span(self.connect_start, self.connect_done)
    }

    pub fn tls(&self) -> Option<Duration> {
        span(self.tls_start, self.tls_done)
    }

    pub fn acquisition(&self) -> Option<Duration> {
        span(self.get_conn_start, self.got_conn)
    }

    pub fn ttfb(&self) -> Option<Duration> {
        span(self.wrote_request, self.first_byte)
    }

    /// One-line breakdown used in the call's final event.
    pub fn summary(&self) -> String {
        let part = |label: &str, d: Option<Duration>| {
            d.map(|d| format!("{}={}", label, fmt_duration(d)))
        };
        let proxy = span(self.proxy_start, self.proxy_connect_done).map(|d| {
            match self.proxy_status {
                Some(code) => format!("proxy={} ({})", fmt_duration(d), code),
                None => format!("proxy={}", fmt_duration(d)),
            }
        });
        let reuse = self.reused.then(|| match self.idle {
            Some(idle) => format!("reused(idle={})", fmt_duration(idle)),
            None => "reused".to_string(),
        });
        let parts: Vec<String> = [
            part("dns", self.dns()),
            part("connect", self.connect()),
            proxy,
            part("tls", self.tls()),
            part("conn", self.acquisition()),
            reuse,
            part("send", span(self.got_conn, self.wrote_request)),
            part("ttfb", self.ttfb()),
            part("body", span(self.first_byte, self.body_done)),
        ]
        .into_iter()
        .flatten()
        .collect();
        if parts.is_empty() {
            "no stages recorded".to_string()
        } else {
            parts.join(" ")
        }
    }
}

/// Wire-level marks collected by a [`WireTap`] for the current call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WireMarks {
    pub wrote_headers: Option<Instant>,
    pub wrote_request: Option<Instant>,
    pub first_byte: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Idle,
    AwaitHeaders,
    Writing,
    AwaitFirstByte,
    Reading,
}

#[derive(Debug, Default)]
struct TapState {
    phase: Phase,
    marks: WireMarks,
}

/// Observes one connection's reads and writes on behalf of the call
/// currently using it.
#[derive(Debug)]
pub(crate) struct WireTap {
    state: Mutex<TapState>,
    sink: LogSink,
}

impl WireTap {
    pub fn new(sink: LogSink) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TapState::default()),
            sink,
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts observing a new request on this connection.
    pub fn arm(&self) {
        let mut state = self.state();
        state.phase = Phase::AwaitHeaders;
        state.marks = WireMarks::default();
    }

    /// Stops observing and hands back what was seen.
    pub fn disarm(&self) -> WireMarks {
        let mut state = self.state();
        state.phase = Phase::Idle;
        state.marks
    }

    fn on_write(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut state = self.state();
        if state.phase == Phase::AwaitHeaders {
            state.phase = Phase::Writing;
            state.marks.wrote_headers = Some(Instant::now());
            self.sink.info("HTTP headers written");
        }
    }

    fn on_write_error(&self, err: &io::Error) {
        let mut state = self.state();
        if matches!(state.phase, Phase::AwaitHeaders | Phase::Writing) {
            state.phase = Phase::Idle;
            self.sink.error(format!("Request write failed: {}", err));
        }
    }

    fn on_flush(&self) {
        let mut state = self.state();
        if state.phase == Phase::Writing {
            self.request_written(&mut state);
        }
    }

    fn request_written(&self, state: &mut TapState) {
        state.phase = Phase::AwaitFirstByte;
        state.marks.wrote_request = Some(Instant::now());
        self.sink.info("Request fully written, waiting for response");
    }

    fn on_read(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut state = self.state();
        if state.phase == Phase::Writing {
            // Response started before a flush was observed.
            self.request_written(&mut state);
        }
        if state.phase == Phase::AwaitFirstByte {
            let now = Instant::now();
            state.phase = Phase::Reading;
            state.marks.first_byte = Some(now);
            let ttfb = span(state.marks.wrote_request, Some(now)).unwrap_or_default();
            self.sink.info(format!(
                "First response byte received after {} (TTFB)",
                fmt_duration(ttfb)
            ));
        }
    }
}

/// IO wrapper reporting request/response progress to a [`WireTap`].
#[derive(Debug)]
pub(crate) struct TracedIo<T> {
    inner: T,
    tap: Arc<WireTap>,
}

impl<T> TracedIo<T> {
    pub fn new(inner: T, tap: Arc<WireTap>) -> Self {
        Self { inner, tap }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for TracedIo<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            self.tap.on_read(buf.filled().len() - before);
        }
        res
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TracedIo<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        match &res {
            Poll::Ready(Ok(n)) => self.tap.on_write(*n),
            Poll::Ready(Err(e)) => self.tap.on_write_error(e),
            Poll::Pending => {}
        }
        res
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        match &res {
            Poll::Ready(Ok(n)) => self.tap.on_write(*n),
            Poll::Ready(Err(e)) => self.tap.on_write_error(e),
            Poll::Pending => {}
        }
        res
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let res = Pin::new(&mut self.inner).poll_flush(cx);
        match &res {
            Poll::Ready(Ok(())) => self.tap.on_flush(),
            Poll::Ready(Err(e)) => self.tap.on_write_error(e),
            Poll::Pending => {}
        }
        res
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::LogEvent;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::Receiver<LogEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev.message);
        }
        out
    }

    #[tokio::test]
    async fn reports_request_progress_in_order() {
        let (sink, mut rx) = LogSink::channel(32);
        let tap = WireTap::new(sink);
        let (client, mut server) = tokio::io::duplex(1024);
        let mut io = TracedIo::new(client, tap.clone());

        tap.arm();
        io.write_all(b"POST / HTTP/1.1\r\n\r\n").await.unwrap();
        io.flush().await.unwrap();

        server.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = io.read(&mut buf).await.unwrap();
        assert!(n > 0);

        let marks = tap.disarm();
        assert!(marks.wrote_headers.is_some());
        assert!(marks.wrote_request.is_some());
        assert!(marks.first_byte.is_some());

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 3, "got {:?}", messages);
        assert_eq!(messages[0], "HTTP headers written");
        assert!(messages[1].starts_with("Request fully written"));
        assert!(messages[2].contains("TTFB"));
    }

    #[tokio::test]
    async fn idle_connection_traffic_is_ignored() {
        let (sink, mut rx) = LogSink::channel(8);
        let tap = WireTap::new(sink);
        let (client, mut server) = tokio::io::duplex(64);
        let mut io = TracedIo::new(client, tap.clone());

        server.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(io.read(&mut buf).await.unwrap(), 1);

        assert!(drain(&mut rx).is_empty());
        assert_eq!(tap.disarm(), WireMarks::default());
    }

    #[tokio::test]
    async fn first_byte_without_flush_still_marks_request_written() {
        let (sink, mut rx) = LogSink::channel(8);
        let tap = WireTap::new(sink);
        let (client, mut server) = tokio::io::duplex(64);
        let mut io = TracedIo::new(client, tap.clone());

        tap.arm();
        io.write_all(b"GET").await.unwrap();
        server.write_all(b"H").await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(io.read(&mut buf).await.unwrap(), 1);

        let marks = tap.disarm();
        assert!(marks.wrote_request.is_some());
        assert!(marks.first_byte.is_some());
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[test]
    fn summary_lists_only_recorded_stages() {
        let mut t = StageTimings::default();
        assert_eq!(t.summary(), "no stages recorded");
        let now = Instant::now();
        t.dns_start = Some(now);
        t.dns_done = Some(now + Duration::from_millis(42));
        assert_eq!(t.summary(), "dns=42ms");
    }

    #[test]
    fn summary_includes_proxy_and_reuse() {
        let now = Instant::now();
        let t = StageTimings {
            proxy_start: Some(now),
            proxy_connect_done: Some(now + Duration::from_millis(12)),
            proxy_status: Some(200),
            reused: true,
            idle: Some(Duration::from_millis(250)),
            ..StageTimings::default()
        };
        assert_eq!(t.summary(), "proxy=12ms (200) reused(idle=250ms)");
    }

    #[test]
    fn stage_in_progress_follows_last_mark() {
        let now = Instant::now();
        let later = now + Duration::from_millis(5);
        let mut t = StageTimings::start();
        assert_eq!(t.stage_in_progress(), Stage::GetConn);

        t.dns_start = Some(now);
        assert_eq!(t.stage_in_progress(), Stage::Dns);
        t.dns_done = Some(now);
        assert_eq!(t.stage_in_progress(), Stage::Connect);

        t.connect_start = Some(now);
        t.connect_done = Some(now);
        assert_eq!(t.stage_in_progress(), Stage::GotConn);
        t.connect_start = Some(later);
        assert_eq!(t.stage_in_progress(), Stage::Connect);
        t.connect_done = Some(later);

        t.proxy_start = Some(later);
        assert_eq!(t.stage_in_progress(), Stage::ProxyHandshake);
        t.proxy_connect_done = Some(later);
        t.tls_start = Some(later);
        assert_eq!(t.stage_in_progress(), Stage::Tls);
        t.tls_done = Some(later);
        assert_eq!(t.stage_in_progress(), Stage::GotConn);

        t.got_conn = Some(later);
        assert_eq!(t.stage_in_progress(), Stage::WroteHeaders);
        t.wrote_headers = Some(later);
        assert_eq!(t.stage_in_progress(), Stage::WroteRequest);
        t.wrote_request = Some(later);
        assert_eq!(t.stage_in_progress(), Stage::FirstByte);
        assert_eq!(
            t.stage_in_progress().to_string(),
            "waiting for first response byte"
        );
        t.first_byte = Some(later);
        assert_eq!(t.stage_in_progress(), Stage::BodyRead);
    }

    #[test]
    fn absorb_keeps_existing_marks_when_wire_saw_nothing() {
        let mut t = StageTimings::default();
        let now = Instant::now();
        t.wrote_headers = Some(now);
        t.absorb(WireMarks::default());
        assert_eq!(t.wrote_headers, Some(now));
    }
}
