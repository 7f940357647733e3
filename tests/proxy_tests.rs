use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::header::{CONTENT_TYPE, LOCATION, SET_COOKIE};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use pagegate::guard::AddressPolicy;
use pagegate::{spawn_proxy, ProxyConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

async fn start_upstream<F, Fut>(handler: F) -> (SocketAddr, tokio::task::JoinHandle<()>)
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });
    (addr, handle)
}

async fn start_ws_echo() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                    while let Some(Ok(msg)) = ws.next().await {
                        if msg.is_close() {
                            break;
                        }
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });
    (addr, handle)
}

// Serves one fixed body per connection with chunked transfer encoding,
// so the proxy sees a response without a content-length.
async fn start_chunked_html_upstream(
    body: &'static str,
) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n{len:x}\r\n{body}\r\n0\r\n\r\n",
                    len = body.len(),
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (addr, handle)
}

async fn start_proxy(
    policy: AddressPolicy,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let mut cfg = ProxyConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
    cfg.address_policy = policy;
    start_proxy_with(cfg).await
}

async fn start_proxy_with(
    cfg: ProxyConfig,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (bound, handle) = spawn_proxy(cfg, async move {
        let _ = shutdown_rx.await;
    })
    .await
    .expect("spawn proxy");
    (bound, shutdown_tx, handle)
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

fn html(body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn text(body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .header(CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

async fn page_handler(req: Request<Incoming>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/" => html(
            r#"<html><body><script src="/app.js"></script><a href="/about">About</a></body></html>"#,
        ),
        "/about" => text("about page".to_string()),
        _ => text("not found".to_string()),
    }
}

async fn cookie_handler(req: Request<Incoming>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/set" => Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, "/home")
            .header(SET_COOKIE, "sid=abc; Path=/")
            .body(Full::new(Bytes::new()))
            .unwrap(),
        "/home" => {
            let cookie = req
                .headers()
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
                .to_string();
            text(format!("cookie: {cookie}"))
        }
        _ => text("not found".to_string()),
    }
}

async fn loop_handler(_req: Request<Incoming>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, "/loop")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn echo_handler(req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let body = req.into_body().collect().await.unwrap().to_bytes();
    text(format!(
        "{} {}",
        method,
        String::from_utf8_lossy(&body)
    ))
}

async fn locked_down_handler(_req: Request<Incoming>) -> Response<Full<Bytes>> {
    Response::builder()
        .header(CONTENT_TYPE, "text/plain")
        .header("content-security-policy", "default-src 'none'")
        .header("x-frame-options", "DENY")
        .header(SET_COOKIE, "secret=1")
        .body(Full::new(Bytes::from_static(b"locked")))
        .unwrap()
}

#[tokio::test]
async fn serves_landing_page() {
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(AddressPolicy::PublicOnly).await;

    let resp = http_client()
        .get(format!("http://{proxy_addr}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body = resp.text().await.unwrap();
    assert!(body.contains("<form"));

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
}

#[tokio::test]
async fn missing_target_is_bad_request() {
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(AddressPolicy::PublicOnly).await;

    let resp = http_client()
        .get(format!("http://{proxy_addr}/proxy"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
}

#[tokio::test]
async fn rejects_dangerous_schemes() {
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(AddressPolicy::PublicOnly).await;

    let client = http_client();
    for target in ["javascript:alert(1)", "data:text/html,<p>hi</p>", "file:///etc/passwd"] {
        let resp = client
            .get(format!("http://{proxy_addr}/proxy"))
            .query(&[("url", target)])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST, "{target}");
    }

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
}

#[tokio::test]
async fn loopback_target_is_indistinguishable_from_dead_upstream() {
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(AddressPolicy::PublicOnly).await;

    let client = http_client();
    let resp = client
        .get(format!("http://{proxy_addr}/proxy"))
        .query(&[("url", "http://127.0.0.1:9999/")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert_eq!(resp.text().await.unwrap(), "upstream fetch failed");

    let resp = client
        .get(format!("http://{proxy_addr}/proxy"))
        .query(&[("url", "http://169.254.169.254/latest/meta-data")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert_eq!(resp.text().await.unwrap(), "upstream fetch failed");

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
}

#[tokio::test]
async fn rewrites_html_links_and_strips_scripts() {
    let (upstream_addr, upstream_handle) = start_upstream(page_handler).await;
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(AddressPolicy::AllowPrivate).await;

    let client = http_client();
    let resp = client
        .get(format!("http://{proxy_addr}/proxy"))
        .query(&[("url", format!("http://{upstream_addr}/"))])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let set_cookie = resp
        .headers()
        .get(reqwest::header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    assert!(set_cookie.starts_with("proxy_sid="), "{set_cookie}");

    let body = resp.text().await.unwrap();
    let expected = format!(
        "/proxy?url=http%3A%2F%2F127.0.0.1%3A{}%2Fabout",
        upstream_addr.port()
    );
    assert!(body.contains(&expected), "{body}");
    assert!(!body.contains("<script"), "{body}");

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
    upstream_handle.abort();
}

#[tokio::test]
async fn rewrites_chunked_html_responses() {
    let (upstream_addr, upstream_handle) =
        start_chunked_html_upstream(r#"<a href="/about">About</a>"#).await;
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(AddressPolicy::AllowPrivate).await;

    let client = http_client();
    let resp = client
        .get(format!("http://{proxy_addr}/proxy"))
        .query(&[("url", format!("http://{upstream_addr}/"))])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let body = resp.text().await.unwrap();
    let expected = format!(
        "/proxy?url=http%3A%2F%2F127.0.0.1%3A{}%2Fabout",
        upstream_addr.port()
    );
    assert!(body.contains(&expected), "{body}");

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
    upstream_handle.abort();
}

#[tokio::test]
async fn redirects_to_blocked_addresses_fail_before_contact() {
    let hits = Arc::new(AtomicUsize::new(0));
    let handler_hits = hits.clone();
    let (upstream_addr, upstream_handle) = start_upstream(move |_req| {
        let hits = handler_hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            Response::builder()
                .status(StatusCode::FOUND)
                .header(LOCATION, "http://169.254.169.254/latest/meta-data")
                .body(Full::new(Bytes::new()))
                .unwrap()
        }
    })
    .await;

    // Only the first hop's host is trusted; the redirect target still
    // goes through the address check.
    let policy = AddressPolicy::TrustedHosts(HashSet::from(["127.0.0.1".to_string()]));
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(policy).await;

    let client = http_client();
    let resp = client
        .get(format!("http://{proxy_addr}/proxy"))
        .query(&[("url", format!("http://{upstream_addr}/escape"))])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert_eq!(resp.text().await.unwrap(), "upstream fetch failed");
    // The redirecting hop was contacted once; the metadata address never.
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
    upstream_handle.abort();
}

#[tokio::test]
async fn origin_allow_list_requires_a_matching_origin() {
    let mut cfg = ProxyConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
    cfg.allowed_origins = vec!["https://app.example".to_string()];
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy_with(cfg).await;

    let client = http_client();

    // Absent Origin is rejected, not just a mismatched one.
    let resp = client
        .get(format!("http://{proxy_addr}/proxy"))
        .query(&[("url", "https://example.com/")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);

    let resp = client
        .get(format!("http://{proxy_addr}/proxy"))
        .query(&[("url", "https://example.com/")])
        .header("origin", "https://evil.example")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);

    // A matching Origin clears the gate; this request then fails on the
    // missing target instead.
    let resp = client
        .get(format!("http://{proxy_addr}/proxy"))
        .header("origin", "https://app.example")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
}

#[tokio::test]
async fn follows_redirects_and_replays_upstream_cookies() {
    let (upstream_addr, upstream_handle) = start_upstream(cookie_handler).await;
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(AddressPolicy::AllowPrivate).await;

    // One request: the proxy follows /set -> /home itself, recording the
    // cookie on the redirect hop and replaying it on the next one.
    let client = http_client();
    let resp = client
        .get(format!("http://{proxy_addr}/proxy"))
        .query(&[("url", format!("http://{upstream_addr}/set"))])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let sid_cookie = resp
        .headers()
        .get(reqwest::header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").to_string())
        .unwrap_or_default();
    let body = resp.text().await.unwrap();
    assert_eq!(body, "cookie: sid=abc");

    // The upstream cookie never reaches the browser.
    assert!(!sid_cookie.contains("sid=abc"));
    assert!(sid_cookie.starts_with("proxy_sid="));

    // A later request in the same proxy session replays the jar.
    let resp = client
        .get(format!("http://{proxy_addr}/proxy"))
        .query(&[("url", format!("http://{upstream_addr}/home"))])
        .header("cookie", &sid_cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "cookie: sid=abc");

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
    upstream_handle.abort();
}

#[tokio::test]
async fn caps_redirect_chains() {
    let (upstream_addr, upstream_handle) = start_upstream(loop_handler).await;
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(AddressPolicy::AllowPrivate).await;

    let client = http_client();
    let resp = client
        .get(format!("http://{proxy_addr}/proxy"))
        .query(&[("url", format!("http://{upstream_addr}/loop"))])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert_eq!(resp.text().await.unwrap(), "upstream fetch failed");

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
    upstream_handle.abort();
}

#[tokio::test]
async fn forwards_post_bodies() {
    let (upstream_addr, upstream_handle) = start_upstream(echo_handler).await;
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(AddressPolicy::AllowPrivate).await;

    let client = http_client();
    let resp = client
        .post(format!("http://{proxy_addr}/proxy"))
        .query(&[("url", format!("http://{upstream_addr}/submit"))])
        .body("name=value")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "POST name=value");

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
    upstream_handle.abort();
}

#[tokio::test]
async fn strips_upstream_security_headers() {
    let (upstream_addr, upstream_handle) = start_upstream(locked_down_handler).await;
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(AddressPolicy::AllowPrivate).await;

    let client = http_client();
    let resp = client
        .get(format!("http://{proxy_addr}/proxy"))
        .query(&[("url", format!("http://{upstream_addr}/"))])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert!(resp.headers().get("content-security-policy").is_none());
    assert!(resp.headers().get("x-frame-options").is_none());
    // The only set-cookie toward the client is the proxy's own session.
    for value in resp.headers().get_all(reqwest::header::SET_COOKIE) {
        assert!(value.to_str().unwrap().starts_with("proxy_sid="));
    }
    assert_eq!(resp.text().await.unwrap(), "locked");

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
    upstream_handle.abort();
}

#[tokio::test]
async fn relays_websocket_frames() {
    let (echo_addr, echo_handle) = start_ws_echo().await;
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(AddressPolicy::AllowPrivate).await;

    let mut connect = url::Url::parse(&format!("ws://{proxy_addr}/ws")).unwrap();
    connect
        .query_pairs_mut()
        .append_pair("url", &format!("ws://{echo_addr}/"));
    let (mut ws, _) = tokio_tungstenite::connect_async(connect.as_str())
        .await
        .unwrap();

    ws.send(Message::Text("hello".to_string())).await.unwrap();
    let reply = ws.next().await.expect("message expected").expect("frame");
    assert_eq!(reply, Message::Text("hello".to_string()));

    ws.send(Message::Binary(b"\x00\x01\x02".to_vec())).await.unwrap();
    let reply = ws.next().await.expect("message expected").expect("frame");
    assert_eq!(reply.into_data(), b"\x00\x01\x02");

    ws.close(None).await.unwrap();

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
    echo_handle.abort();
}

#[tokio::test]
async fn closes_blocked_websocket_targets_with_policy_violation() {
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(AddressPolicy::PublicOnly).await;

    let mut connect = url::Url::parse(&format!("ws://{proxy_addr}/ws")).unwrap();
    connect
        .query_pairs_mut()
        .append_pair("url", "ws://127.0.0.1:6379/");
    let (mut ws, _) = tokio_tungstenite::connect_async(connect.as_str())
        .await
        .unwrap();

    match ws.next().await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(frame.code, CloseCode::Policy);
        }
        other => panic!("expected policy close, got {other:?}"),
    }

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
}

#[tokio::test]
async fn websocket_endpoint_rejects_http_schemes() {
    let (proxy_addr, shutdown_tx, proxy_handle) = start_proxy(AddressPolicy::PublicOnly).await;

    let mut connect = url::Url::parse(&format!("ws://{proxy_addr}/ws")).unwrap();
    connect
        .query_pairs_mut()
        .append_pair("url", "https://example.com/");
    // The handshake itself is refused with a 400.
    let err = tokio_tungstenite::connect_async(connect.as_str())
        .await
        .expect_err("handshake should fail");
    let msg = err.to_string();
    assert!(msg.contains("400"), "{msg}");

    shutdown_tx.send(()).ok();
    proxy_handle.await.expect("proxy join");
}
