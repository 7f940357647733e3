pub mod error;
pub mod forward;
pub mod guard;
pub mod relay;
pub mod rewrite;
pub mod session;
pub mod target;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{stream, StreamExt};
use http::header::{
    HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, SET_COOKIE,
};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Body as HttpBody, Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use percent_encoding::percent_decode_str;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::ProxyError;
use crate::forward::Forwarder;
use crate::guard::AddressPolicy;
use crate::rewrite::ScriptPolicy;
use crate::session::SessionStore;
use crate::target::SchemeMode;

pub type BoxBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

fn boxed<B>(body: B) -> BoxBody
where
    B: HttpBody<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    body.map_err(Into::into).boxed()
}

pub(crate) fn empty_body() -> BoxBody {
    boxed(Empty::<Bytes>::new())
}

fn full_body(bytes: impl Into<Bytes>) -> BoxBody {
    boxed(Full::new(bytes.into()))
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    text_response(status, message.to_string())
}

fn text_response(status: StatusCode, body: String) -> Response<BoxBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Response headers that never reach the proxy client: security policies
/// tied to the upstream origin (which would break the rewritten page or
/// leak the real origin), upstream cookies (captured into the jar
/// instead), and hop-by-hop headers.
const STRIPPED_RESPONSE_HEADERS: [&str; 12] = [
    "content-security-policy",
    "content-security-policy-report-only",
    "x-frame-options",
    "cross-origin-opener-policy",
    "cross-origin-embedder-policy",
    "cross-origin-resource-policy",
    "strict-transport-security",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "trailers",
];

/// Bodies larger than this are streamed through without rewriting.
const MAX_REWRITE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    /// Shared secret required as `?key=` or `x-proxy-key`. `None` disables
    /// the check.
    pub access_key: Option<String>,
    /// If non-empty, requests must carry an `Origin` header matching one
    /// of these values.
    pub allowed_origins: Vec<String>,
    pub script_policy: ScriptPolicy,
    pub jar_capacity: usize,
    pub jar_ttl: Duration,
    pub upstream_timeout: Duration,
    pub conceal_origin: bool,
    pub address_policy: AddressPolicy,
}

impl ProxyConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            access_key: None,
            allowed_origins: Vec::new(),
            script_policy: ScriptPolicy::Strip,
            jar_capacity: 1024,
            jar_ttl: Duration::from_secs(30 * 60),
            upstream_timeout: Duration::from_secs(15),
            conceal_origin: true,
            address_policy: AddressPolicy::PublicOnly,
        }
    }
}

struct AppState {
    forwarder: Forwarder,
    sessions: Arc<SessionStore>,
    cfg: ProxyConfig,
}

/// Bind and start the proxy. The listener is bound before this returns,
/// so callers (tests included) get the actual address even when asking
/// for port 0.
pub async fn spawn_proxy<S>(
    cfg: ProxyConfig,
    shutdown: S,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)>
where
    S: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(&cfg.listen).await?;
    let local_addr = listener.local_addr()?;

    let sessions = Arc::new(SessionStore::new(cfg.jar_capacity, cfg.jar_ttl));
    let forwarder = Forwarder::new(
        sessions.clone(),
        cfg.address_policy.clone(),
        cfg.upstream_timeout,
        cfg.conceal_origin,
    );
    let state = Arc::new(AppState {
        forwarder,
        sessions,
        cfg,
    });

    let notify = Arc::new(Notify::new());
    let notify_clone = notify.clone();
    tokio::spawn(async move {
        shutdown.await;
        notify_clone.notify_waiters();
    });

    info!(listen = %local_addr, "proxy listening");

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = notify.notified() => {
                    info!("shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            let state = state.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = state.clone();
                                    async move { handle(state, remote_addr, req).await }
                                });
                                let builder = hyper_util::server::conn::auto::Builder::new(
                                    TokioExecutor::new(),
                                );
                                let conn = builder.serve_connection_with_upgrades(io, service);
                                if let Err(err) = conn.await {
                                    error!(%err, "connection error");
                                }
                            });
                        }
                        Err(err) => {
                            error!(%err, "accept error");
                        }
                    }
                }
            }
        }
    });

    Ok((local_addr, handle))
}

async fn handle(
    state: Arc<AppState>,
    _remote: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, std::convert::Infallible> {
    let path = req.uri().path().to_string();

    let response = match path.as_str() {
        "/" if req.method() == Method::GET => landing_page(),
        "/ws" => match access_check(&state, &req) {
            Ok(()) => {
                let raw = target_param(&req);
                let (sid, _) = state.sessions.session_id(req.headers());
                relay::handle_upgrade(
                    state.sessions.clone(),
                    state.cfg.address_policy.clone(),
                    raw,
                    sid,
                    req,
                )
            }
            Err(response) => response,
        },
        _ if path == "/proxy" || path.starts_with("/p/") => match access_check(&state, &req) {
            Ok(()) => handle_proxy(state, req).await,
            Err(response) => response,
        },
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

fn access_check(state: &AppState, req: &Request<Incoming>) -> Result<(), Response<BoxBody>> {
    if let Some(expected) = &state.cfg.access_key {
        let presented = query_param(req, "key").or_else(|| {
            req.headers()
                .get("x-proxy-key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });
        if presented.as_deref() != Some(expected.as_str()) {
            return Err(error_response(StatusCode::FORBIDDEN, "access denied"));
        }
    }
    if !state.cfg.allowed_origins.is_empty() {
        // No Origin at all is a failure too: when the allow-list is on,
        // the request must prove where it came from.
        let allowed = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .map(|origin| state.cfg.allowed_origins.iter().any(|o| o == origin))
            .unwrap_or(false);
        if !allowed {
            return Err(error_response(StatusCode::FORBIDDEN, "origin not allowed"));
        }
    }
    Ok(())
}

fn query_param(req: &Request<Incoming>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Extract the target URL from either `?url=` or the `/p/<encoded>`
/// path form.
fn target_param(req: &Request<Incoming>) -> Option<String> {
    if let Some(url) = query_param(req, "url") {
        return Some(url);
    }
    let path = req.uri().path();
    let encoded = path.strip_prefix("/p/")?;
    let mut decoded = percent_decode_str(encoded).decode_utf8_lossy().into_owned();
    if let Some(query) = req.uri().query() {
        // The original query string (minus proxy-internal params) belongs
        // to the target in the path form.
        let passthrough: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .filter(|(k, _)| k != "key")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if !passthrough.is_empty() {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (k, v) in &passthrough {
                serializer.append_pair(k, v);
            }
            decoded.push(if decoded.contains('?') { '&' } else { '?' });
            decoded.push_str(&serializer.finish());
        }
    }
    Some(decoded)
}

async fn handle_proxy(state: Arc<AppState>, req: Request<Incoming>) -> Response<BoxBody> {
    let (sid, minted) = state.sessions.session_id(req.headers());
    let raw = target_param(&req);

    let result = proxy_request(&state, raw, &sid, req).await;
    let mut response = match result {
        Ok(response) => response,
        Err(err) => {
            match &err {
                ProxyError::BlockedIp => warn!("blocked non-routable target"),
                ProxyError::UpstreamTimeout => warn!("upstream timed out"),
                other => warn!(err = %other, "proxy request failed"),
            }
            error_response(err.status(), err.client_message())
        }
    };

    if minted {
        if let Ok(value) = HeaderValue::from_str(&session::session_cookie_value(&sid)) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

async fn proxy_request(
    state: &AppState,
    raw: Option<String>,
    sid: &str,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, ProxyError> {
    let raw = raw.ok_or(ProxyError::MissingTarget)?;
    let target = target::validate(&raw, SchemeMode::Fetch, &state.cfg.address_policy).await?;

    let method = req.method().clone();
    let client_headers = req.headers().clone();
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|err| ProxyError::UpstreamUnreachable(err.to_string()))?
        .to_bytes();

    let forwarded = state
        .forwarder
        .forward(method, target, &client_headers, body, sid)
        .await?;

    build_client_response(state, forwarded).await
}

async fn build_client_response(
    state: &AppState,
    forwarded: forward::Forwarded,
) -> Result<Response<BoxBody>, ProxyError> {
    let (parts, body) = forwarded.response.into_parts();

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    let is_html = content_type.starts_with("text/html");
    let is_css = content_type.starts_with("text/css");
    let rewritable = is_html || is_css;

    let mut response = Response::builder().status(parts.status);
    if let Some(headers) = response.headers_mut() {
        for (name, value) in &parts.headers {
            if is_stripped_response_header(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
    }

    if !rewritable {
        return response
            .body(boxed(body))
            .map_err(|err| ProxyError::UpstreamUnreachable(err.to_string()));
    }

    // Chunked responses carry no length up front, so the cap has to be
    // enforced while buffering, not read off a size hint.
    let bytes = match collect_capped(body, MAX_REWRITE_BYTES).await? {
        CappedBody::Complete(bytes) => bytes,
        CappedBody::Oversized(passthrough) => {
            return response
                .body(passthrough)
                .map_err(|err| ProxyError::UpstreamUnreachable(err.to_string()));
        }
    };

    let encoding = parts
        .headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let decoded = match forward::decode_body(encoding.as_deref(), &bytes) {
        Some(Ok(plain)) => Some(plain),
        Some(Err(err)) => {
            // Corrupt encoding: hand the bytes through untouched rather
            // than serve nothing.
            warn!(%err, "failed to decode upstream body, passing through");
            None
        }
        None if encoding.is_none() => Some(bytes.to_vec()),
        None => None,
    };

    let rewritten: Option<Vec<u8>> = decoded.as_deref().and_then(|plain| {
        if is_html {
            rewrite::rewrite_html(plain, &forwarded.final_url, state.cfg.script_policy)
        } else {
            Some(
                rewrite::rewrite_css(&String::from_utf8_lossy(plain), &forwarded.final_url)
                    .into_bytes(),
            )
        }
    });

    let out = match rewritten {
        Some(out) => {
            // The body changed shape: its old encoding and length no
            // longer describe it.
            if let Some(headers) = response.headers_mut() {
                headers.remove(CONTENT_ENCODING);
                headers.remove(CONTENT_LENGTH);
            }
            out
        }
        None => bytes.to_vec(),
    };

    response
        .body(full_body(out))
        .map_err(|err| ProxyError::UpstreamUnreachable(err.to_string()))
}

enum CappedBody {
    Complete(Vec<u8>),
    Oversized(BoxBody),
}

/// Buffer a response body up to `cap` bytes. If the cap is hit, the
/// buffered frames are replayed ahead of the remaining stream so the
/// client still receives the full body, just unrewritten.
async fn collect_capped(mut body: Incoming, cap: usize) -> Result<CappedBody, ProxyError> {
    let mut frames: Vec<Frame<Bytes>> = Vec::new();
    let mut total = 0usize;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|err| ProxyError::UpstreamUnreachable(err.to_string()))?;
        let len = frame.data_ref().map(Bytes::len).unwrap_or(0);
        if total + len > cap {
            frames.push(frame);
            let head = stream::iter(
                frames
                    .into_iter()
                    .map(Ok::<_, Box<dyn std::error::Error + Send + Sync>>),
            );
            let tail = BodyStream::new(body).map(|res| {
                res.map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
            });
            return Ok(CappedBody::Oversized(boxed(StreamBody::new(
                head.chain(tail),
            ))));
        }
        total += len;
        frames.push(frame);
    }
    let mut bytes = Vec::with_capacity(total);
    for frame in frames {
        if let Some(data) = frame.data_ref() {
            bytes.extend_from_slice(data);
        }
    }
    Ok(CappedBody::Complete(bytes))
}

fn is_stripped_response_header(name: &HeaderName) -> bool {
    name == SET_COOKIE || STRIPPED_RESPONSE_HEADERS.contains(&name.as_str())
}

fn landing_page() -> Response<BoxBody> {
    let mut response = Response::new(full_body(INDEX_HTML));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>pagegate</title>
<style>
body { font-family: sans-serif; max-width: 40rem; margin: 4rem auto; }
input[type=url] { width: 100%; padding: .5rem; }
</style>
</head>
<body>
<h1>pagegate</h1>
<form action="/proxy" method="get">
<input type="url" name="url" placeholder="https://example.com/" required>
<button type="submit">Go</button>
</form>
</body>
</html>
"#;
