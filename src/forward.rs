use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{
    HeaderName, ACCEPT_ENCODING, CONTENT_LENGTH, COOKIE, HOST, LOCATION, ORIGIN, REFERER,
    SET_COOKIE,
};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use crate::error::ProxyError;
use crate::guard::AddressPolicy;
use crate::session::SessionStore;
use crate::target::{self, SchemeMode, Target};

/// Redirect chains longer than this abort the whole request.
pub const MAX_REDIRECTS: usize = 5;

const HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

/// Terminal upstream response plus the URL that actually produced it
/// (the last hop of the redirect chain), which the rewriter needs as its
/// resolution base.
pub struct Forwarded {
    pub final_url: Url,
    pub response: Response<Incoming>,
}

/// Executes one logical proxied request: header hygiene, cookie attach,
/// manual redirect handling with per-hop re-validation, and jar updates.
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    sessions: Arc<SessionStore>,
    policy: AddressPolicy,
    upstream_timeout: Duration,
    conceal_origin: bool,
}

impl Forwarder {
    pub fn new(
        sessions: Arc<SessionStore>,
        policy: AddressPolicy,
        upstream_timeout: Duration,
        conceal_origin: bool,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(5)));
        connector.set_nodelay(true);
        connector.enforce_http(false);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build(https);

        Self {
            client,
            sessions,
            policy,
            upstream_timeout,
            conceal_origin,
        }
    }

    /// Forward one request. The whole operation, redirects included, runs
    /// under a single upper-bound timeout; expiry drops the in-flight
    /// upstream future.
    pub async fn forward(
        &self,
        method: Method,
        target: Target,
        client_headers: &HeaderMap,
        body: Bytes,
        sid: &str,
    ) -> Result<Forwarded, ProxyError> {
        match timeout(
            self.upstream_timeout,
            self.follow(method, target, client_headers, body, sid),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProxyError::UpstreamTimeout),
        }
    }

    async fn follow(
        &self,
        mut method: Method,
        mut target: Target,
        client_headers: &HeaderMap,
        mut body: Bytes,
        sid: &str,
    ) -> Result<Forwarded, ProxyError> {
        // Initial request plus up to MAX_REDIRECTS follow-ups.
        for hop in 0..=MAX_REDIRECTS {
            let jar = self.sessions.jar(sid, target.host());
            // Holding the jar lock across the hop serializes the
            // read-send-merge cycle for this (session, host) pair.
            let mut jar = jar.lock().await;

            let mut headers = self.upstream_headers(client_headers);
            if let Some(cookie_header) = jar.header(target.url()) {
                if let Ok(value) = HeaderValue::from_str(&cookie_header) {
                    headers.insert(COOKIE, value);
                }
            }

            let mut builder = Request::builder()
                .method(method.clone())
                .uri(target.url().as_str());
            if let Some(h) = builder.headers_mut() {
                *h = headers;
            }
            let request = builder
                .body(Full::new(body.clone()))
                .map_err(|err| ProxyError::UpstreamUnreachable(err.to_string()))?;

            debug!(hop, method = %method, url = %target.url(), "upstream request");

            let response = self.client.request(request).await.map_err(|err| {
                warn!(%err, url = %target.url(), "upstream request failed");
                ProxyError::UpstreamUnreachable(err.to_string())
            })?;

            let set_cookies: Vec<&str> = response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            if !set_cookies.is_empty() {
                jar.record(target.url(), set_cookies);
            }
            drop(jar);

            let status = response.status();
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            if let (true, Some(location)) = (status.is_redirection(), location) {
                let next = target
                    .url()
                    .join(&location)
                    .map_err(|_| ProxyError::InvalidUrl)?;
                // Every hop is re-validated: a public first hop must not
                // be able to redirect the proxy onto an internal address.
                target = target::validate_url(next, SchemeMode::Fetch, &self.policy).await?;
                let (next_method, keep_body) = redirect_semantics(status, &method);
                method = next_method;
                if !keep_body {
                    body = Bytes::new();
                }
                continue;
            }

            return Ok(Forwarded {
                final_url: target.url().clone(),
                response,
            });
        }
        Err(ProxyError::TooManyRedirects(MAX_REDIRECTS))
    }

    /// Client headers minus anything hop-specific, proxy-internal, or
    /// sensitive: `host`/`content-length` are recomputed, the client's
    /// cookies (including `proxy_sid`) never go upstream, and
    /// `accept-encoding` is pinned to the codings we can decode.
    fn upstream_headers(&self, client_headers: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in client_headers {
            if is_dropped_request_header(name, self.conceal_origin) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
        headers
    }
}

fn is_dropped_request_header(name: &HeaderName, conceal_origin: bool) -> bool {
    if name == HOST || name == CONTENT_LENGTH || name == COOKIE || name == ACCEPT_ENCODING {
        return true;
    }
    if conceal_origin && (name == REFERER || name == ORIGIN) {
        return true;
    }
    HOP_HEADERS.contains(&name.as_str())
}

/// Standard HTTP redirect method/body semantics: 303 always becomes a
/// bodyless GET, 301/302 downgrade POST the same way, 307/308 preserve
/// both method and body.
fn redirect_semantics(status: StatusCode, method: &Method) -> (Method, bool) {
    match status {
        StatusCode::SEE_OTHER => (Method::GET, false),
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND if *method == Method::POST => {
            (Method::GET, false)
        }
        _ => (method.clone(), true),
    }
}

/// Decode a response body according to its `content-encoding`, so the
/// rewriter sees plain text. Unknown codings return `None` and the body
/// passes through untouched.
pub fn decode_body(encoding: Option<&str>, bytes: &[u8]) -> Option<std::io::Result<Vec<u8>>> {
    let coding = encoding.unwrap_or("identity").trim().to_ascii_lowercase();
    let mut out = Vec::with_capacity(bytes.len() * 2);
    let result = match coding.as_str() {
        "" | "identity" => return None,
        "gzip" | "x-gzip" => flate2::read::MultiGzDecoder::new(bytes).read_to_end(&mut out),
        "deflate" => flate2::read::ZlibDecoder::new(bytes).read_to_end(&mut out),
        "br" => brotli::Decompressor::new(bytes, 4096).read_to_end(&mut out),
        _ => return None,
    };
    Some(result.map(|_| out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_semantics_follow_the_rfc() {
        let (m, keep) = redirect_semantics(StatusCode::SEE_OTHER, &Method::POST);
        assert_eq!(m, Method::GET);
        assert!(!keep);

        let (m, keep) = redirect_semantics(StatusCode::FOUND, &Method::POST);
        assert_eq!(m, Method::GET);
        assert!(!keep);

        let (m, keep) = redirect_semantics(StatusCode::FOUND, &Method::GET);
        assert_eq!(m, Method::GET);
        assert!(keep);

        let (m, keep) = redirect_semantics(StatusCode::TEMPORARY_REDIRECT, &Method::POST);
        assert_eq!(m, Method::POST);
        assert!(keep);

        let (m, keep) = redirect_semantics(StatusCode::PERMANENT_REDIRECT, &Method::PUT);
        assert_eq!(m, Method::PUT);
        assert!(keep);
    }

    #[test]
    fn drops_hop_and_sensitive_request_headers() {
        for name in [
            "host",
            "content-length",
            "cookie",
            "connection",
            "transfer-encoding",
            "proxy-connection",
            "accept-encoding",
        ] {
            let header: HeaderName = name.parse().unwrap();
            assert!(is_dropped_request_header(&header, false), "{name}");
        }
        let referer: HeaderName = "referer".parse().unwrap();
        assert!(is_dropped_request_header(&referer, true));
        assert!(!is_dropped_request_header(&referer, false));

        let accept: HeaderName = "accept".parse().unwrap();
        assert!(!is_dropped_request_header(&accept, true));
    }

    #[test]
    fn decodes_gzip_bodies() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"<html>hi</html>").unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode_body(Some("gzip"), &compressed).unwrap().unwrap();
        assert_eq!(decoded, b"<html>hi</html>");
    }

    #[test]
    fn identity_and_unknown_codings_pass_through() {
        assert!(decode_body(None, b"plain").is_none());
        assert!(decode_body(Some("identity"), b"plain").is_none());
        assert!(decode_body(Some("zstd"), b"??").is_none());
    }
}
