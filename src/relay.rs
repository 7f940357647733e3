use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderValue, ORIGIN};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, Role};
use tungstenite::Message;

use crate::error::ProxyError;
use crate::guard::{self, AddressPolicy};
use crate::session::SessionStore;
use crate::target::{parse_target, SchemeMode, Target};
use crate::{error_response, BoxBody};

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let has_upgrade = req
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let has_connection = req
        .headers()
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    has_upgrade && has_connection
}

/// Entry point for `GET /ws?url=...`. URL syntax and scheme are checked
/// before the handshake; the DNS/address trust decision runs inside the
/// upgraded session so a blocked target is answered with a proper
/// WebSocket close (1008) instead of a half-finished handshake.
pub fn handle_upgrade(
    sessions: Arc<SessionStore>,
    policy: AddressPolicy,
    raw_url: Option<String>,
    sid: String,
    mut req: Request<Incoming>,
) -> Response<BoxBody> {
    let target = match raw_url
        .ok_or(ProxyError::MissingTarget)
        .and_then(|raw| parse_target(&raw, SchemeMode::WebSocket))
    {
        Ok(target) => target,
        Err(err) => return error_response(err.status(), err.client_message()),
    };

    if !is_websocket_upgrade(&req) {
        return error_response(StatusCode::BAD_REQUEST, "websocket upgrade required");
    }

    let response = match build_upgrade_response(&req) {
        Ok(response) => response,
        Err(response) => return response,
    };

    let origin = req.headers().get(ORIGIN).cloned();
    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                if let Err(err) = run_session(sessions, policy, target, sid, origin, ws).await {
                    warn!(%err, "websocket session ended with error");
                }
            }
            Err(err) => {
                warn!(%err, "websocket upgrade error");
            }
        }
    });

    response
}

fn build_upgrade_response(req: &Request<Incoming>) -> Result<Response<BoxBody>, Response<BoxBody>> {
    let version_ok = req
        .headers()
        .get("sec-websocket-version")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "13")
        .unwrap_or(false);
    if !version_ok {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "unsupported websocket version",
        ));
    }

    let key = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "missing sec-websocket-key"))?;

    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID);
    let accept = BASE64.encode(sha1.finalize());

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header("upgrade", "websocket")
        .header("connection", "Upgrade")
        .header("sec-websocket-accept", accept)
        .body(crate::empty_body())
        .map_err(|_| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to build upgrade response",
            )
        })
}

async fn run_session<S>(
    sessions: Arc<SessionStore>,
    policy: AddressPolicy,
    target: Target,
    sid: String,
    origin: Option<HeaderValue>,
    mut client_ws: WebSocketStream<S>,
) -> Result<(), tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let upstream_ws = match connect_upstream(&sessions, &policy, &target, &sid, origin).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(%err, target = %target.url(), "websocket session refused");
            return close_with(&mut client_ws, close_code_for(&err), err.client_message()).await;
        }
    };

    info!(target = %target.url(), "websocket relay established");
    relay(client_ws, upstream_ws).await;
    Ok(())
}

/// Trust check plus upstream handshake. The guard runs before any socket
/// is opened, so a blocked target costs nothing but the inbound
/// handshake.
async fn connect_upstream(
    sessions: &SessionStore,
    policy: &AddressPolicy,
    target: &Target,
    sid: &str,
    origin: Option<HeaderValue>,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, ProxyError> {
    guard::ensure_routable(target.host(), target.port(), policy)
        .await
        .map_err(|_| ProxyError::WebSocketPolicyViolation)?;

    let mut upstream_req = target
        .url()
        .as_str()
        .into_client_request()
        .map_err(|err| ProxyError::UpstreamUnreachable(err.to_string()))?;
    if let Some(origin) = origin {
        upstream_req.headers_mut().insert(ORIGIN, origin);
    }
    let jar = sessions.jar(sid, target.host());
    if let Some(cookie_header) = jar.lock().await.header(target.url()) {
        if let Ok(value) = HeaderValue::from_str(&cookie_header) {
            upstream_req.headers_mut().insert("cookie", value);
        }
    }

    let (ws, _) = connect_async(upstream_req)
        .await
        .map_err(|err| ProxyError::UpstreamUnreachable(err.to_string()))?;
    Ok(ws)
}

fn close_code_for(err: &ProxyError) -> CloseCode {
    match err {
        ProxyError::WebSocketPolicyViolation => CloseCode::Policy,
        _ => CloseCode::Error,
    }
}

async fn close_with<S>(
    ws: &mut WebSocketStream<S>,
    code: CloseCode,
    reason: &'static str,
) -> Result<(), tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
    .await
}


/// Pipe frames both ways with no transformation. A close or error on
/// either side tears down the other; no half-open relays survive.
async fn relay<C, U>(client_ws: WebSocketStream<C>, upstream_ws: WebSocketStream<U>)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_sink, mut client_stream) = client_ws.split();
    let (mut upstream_sink, mut upstream_stream) = upstream_ws.split();

    loop {
        tokio::select! {
            msg = client_stream.next() => match msg {
                Some(Ok(msg)) => {
                    let closing = matches!(msg, Message::Close(_));
                    if upstream_sink.send(msg).await.is_err() || closing {
                        let _ = client_sink.close().await;
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!(%err, "client websocket error");
                    let _ = upstream_sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Error,
                            reason: "relay error".into(),
                        })))
                        .await;
                    break;
                }
                None => {
                    let _ = upstream_sink.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = upstream_stream.next() => match msg {
                Some(Ok(msg)) => {
                    let closing = matches!(msg, Message::Close(_));
                    if client_sink.send(msg).await.is_err() || closing {
                        let _ = upstream_sink.close().await;
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!(%err, "upstream websocket error");
                    let _ = client_sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Error,
                            reason: "relay error".into(),
                        })))
                        .await;
                    break;
                }
                None => {
                    let _ = client_sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}
