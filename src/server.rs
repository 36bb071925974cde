//! HTTP control API, live log stream and metrics endpoint.
//!
//! | Route                    | Method | Action                              |
//! |--------------------------|--------|-------------------------------------|
//! | `/api/config`            | GET    | current configuration               |
//! | `/api/config/update`     | POST   | replace configuration               |
//! | `/api/start`             | POST   | start sending (optional config body) |
//! | `/api/stop`              | POST   | stop sending                        |
//! | `/api/status`            | GET    | `{"running": bool}`                 |
//! | `/api/logs`              | GET    | Server-Sent Events log stream       |
//! | `/metrics`               | GET    | Prometheus text format              |

use std::convert::Infallible;
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use hyper::body::Bytes;
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION, CONTENT_TYPE,
};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::Registry;
use serde::Serialize;
use serde_json::json;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ProbeConfig;
use crate::errors::ControlError;
use crate::hub::{LogHub, Subscription};
use crate::metrics::{gather_metrics_string, metrics_content_type};
use crate::session::Session;

/// Keepalive frame sent to idle log streams.
pub const PING_FRAME: &str = "data: {\"type\":\"ping\"}\n\n";

/// Everything the handlers need.
pub struct AppState {
    pub session: Arc<Session>,
    pub hub: Arc<LogHub>,
    pub registry: Registry,
    pub heartbeat: Duration,
}

/// Serves the API on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: F,
) -> Result<(), hyper::Error>
where
    F: Future<Output = ()>,
{
    let addr = listener.local_addr().ok();
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(req, state).await) }
            }))
        }
    });

    let server = Server::from_tcp(listener)?.serve(make_svc);
    if let Some(addr) = addr {
        info!(addr = %addr, "Control API listening");
    }
    let result = server.with_graceful_shutdown(shutdown).await;
    if let Err(e) = &result {
        error!(error = %e, "Control API server error");
    }
    result
}

/// Binds `addr` and serves until `shutdown` resolves.
pub async fn bind_and_serve<F>(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()>,
{
    let listener = TcpListener::bind(addr)?;
    serve(listener, state, shutdown).await?;
    Ok(())
}

/// Routes one request.
pub async fn handle(req: Request<Body>, state: Arc<AppState>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "Control API request");

    match (path.as_str(), method) {
        ("/api/config", Method::GET) => json_response(StatusCode::OK, &*state.session.config()),
        ("/api/config/update", Method::POST) => update_config(req, &state).await,
        ("/api/start", Method::POST) => start(req, &state).await,
        ("/api/stop", Method::POST) => stop(&state),
        ("/api/status", Method::GET) => json_response(StatusCode::OK, &state.session.status()),
        ("/api/logs", Method::GET) => log_stream(state.hub.subscribe(), state.heartbeat),
        ("/metrics", Method::GET) => metrics(&state.registry),
        (
            "/api/config" | "/api/config/update" | "/api/start" | "/api/stop" | "/api/status"
            | "/api/logs" | "/metrics",
            _,
        ) => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn update_config(req: Request<Body>, state: &AppState) -> Response<Body> {
    let config = match read_config(req).await {
        Ok(Some(config)) => config,
        Ok(None) => return error_response(StatusCode::BAD_REQUEST, "request body is empty"),
        Err(response) => return response,
    };
    match state.session.update_config(config) {
        Ok(()) => json_response(StatusCode::OK, &json!({ "status": "ok" })),
        Err(e) => control_error(e),
    }
}

async fn start(req: Request<Body>, state: &AppState) -> Response<Body> {
    let config = match read_config(req).await {
        Ok(config) => config,
        Err(response) => return response,
    };
    match state.session.start(config) {
        Ok(()) => json_response(StatusCode::OK, &json!({ "status": "started" })),
        Err(e) => control_error(e),
    }
}

fn stop(state: &AppState) -> Response<Body> {
    match state.session.stop() {
        Ok(_) => json_response(StatusCode::OK, &json!({ "status": "stopped" })),
        Err(e) => control_error(e),
    }
}

/// Parses an optional JSON configuration body. Whitespace-only bodies are
/// treated as absent.
async fn read_config(req: Request<Body>) -> Result<Option<ProbeConfig>, Response<Body>> {
    let body = hyper::body::to_bytes(req.into_body()).await.map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            &format!("failed to read request body: {}", e),
        )
    })?;
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }
    serde_json::from_slice(&body).map(Some).map_err(|e| {
        error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e))
    })
}

fn log_stream(mut subscription: Subscription, heartbeat: Duration) -> Response<Body> {
    let (mut tx, body) = Body::channel();
    tokio::spawn(async move {
        let id = subscription.id();
        debug!(subscriber = %id, "Log stream opened");
        let mut ticker = time::interval_at(Instant::now() + heartbeat, heartbeat);
        loop {
            let frame = tokio::select! {
                event = subscription.recv() => match event {
                    Some(event) => match serde_json::to_string(&event) {
                        Ok(json) => format!("data: {}\n\n", json),
                        Err(e) => {
                            warn!(error = %e, "Failed to encode log event");
                            continue;
                        }
                    },
                    None => break,
                },
                _ = ticker.tick() => PING_FRAME.to_string(),
            };
            if tx.send_data(Bytes::from(frame)).await.is_err() {
                break;
            }
        }
        debug!(subscriber = %id, "Log stream closed");
    });

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

fn metrics(registry: &Registry) -> Response<Body> {
    let mut response = Response::new(Body::from(gather_metrics_string(registry)));
    if let Ok(value) = HeaderValue::from_str(&metrics_content_type()) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn control_error(error: ControlError) -> Response<Body> {
    let status = match error {
        ControlError::AlreadyRunning | ControlError::NotRunning => StatusCode::CONFLICT,
        ControlError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        ControlError::ClientBuild(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &error.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &json!({ "error": message }))
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Body> {
    let (status, body) = match serde_json::to_vec(value) {
        Ok(body) => (status, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{{\"error\":\"failed to encode response: {}\"}}", e).into_bytes(),
        ),
    };
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
