use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use http::header::COOKIE;
use http::HeaderMap;
use rand::RngCore;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

/// Name of the proxy's own session cookie. It is scoped to the proxy and
/// never forwarded to upstream targets.
pub const SESSION_COOKIE: &str = "proxy_sid";

const SID_LEN: usize = 32; // 16 random bytes, hex-encoded

/// One cookie as observed from a target host, with enough attributes to
/// replay it correctly on later requests to that host.
#[derive(Clone, Debug)]
struct StoredCookie {
    value: String,
    path: String,
    secure: bool,
    expires: Option<SystemTime>,
}

/// Cookies observed from a single target host on behalf of a single
/// session. Host scoping lives in the store key, so the jar itself only
/// tracks name/path/secure/expiry.
#[derive(Default, Debug)]
pub struct CookieJar {
    cookies: HashMap<(String, String), StoredCookie>,
}

impl CookieJar {
    /// Merge `Set-Cookie` values from a response issued to `url`. Cookies
    /// carrying a `Domain` attribute that does not cover the responding
    /// host are dropped: a response must not plant cookies for other hosts.
    pub fn record<'a, I>(&mut self, url: &Url, set_cookie_values: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let host = url.host_str().unwrap_or_default();
        for raw in set_cookie_values {
            let parsed = match cookie::Cookie::parse(raw) {
                Ok(c) => c,
                Err(err) => {
                    debug!(%err, "ignoring unparseable set-cookie");
                    continue;
                }
            };
            if let Some(domain) = parsed.domain() {
                if !domain_covers(domain, host) {
                    warn!(%domain, %host, "ignoring cross-host set-cookie");
                    continue;
                }
            }
            let path = parsed
                .path()
                .map(str::to_string)
                .unwrap_or_else(|| default_path(url));
            let key = (parsed.name().to_string(), path.clone());

            let expires = cookie_expiry(&parsed);
            if let Some(deadline) = expires {
                if deadline <= SystemTime::now() {
                    // Max-Age=0 / past Expires is a deletion.
                    self.cookies.remove(&key);
                    continue;
                }
            }
            self.cookies.insert(
                key,
                StoredCookie {
                    value: parsed.value().to_string(),
                    path,
                    secure: parsed.secure().unwrap_or(false),
                    expires,
                },
            );
        }
    }

    /// Build the `Cookie` header value for a request to `url`, pruning
    /// anything expired along the way.
    pub fn header(&mut self, url: &Url) -> Option<String> {
        let now = SystemTime::now();
        self.cookies
            .retain(|_, c| c.expires.map(|t| t > now).unwrap_or(true));

        let secure_transport = matches!(url.scheme(), "https" | "wss");
        let request_path = url.path();
        let mut pairs: Vec<(&str, &str)> = self
            .cookies
            .iter()
            .filter(|((_, _), c)| (!c.secure || secure_transport) && path_match(&c.path, request_path))
            .map(|((name, _), c)| (name.as_str(), c.value.as_str()))
            .collect();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort();
        Some(
            pairs
                .into_iter()
                .map(|(n, v)| format!("{n}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// RFC 6265 domain-match: the cookie domain must equal the host or be a
/// parent domain of it. IP-literal hosts only match exactly.
fn domain_covers(cookie_domain: &str, host: &str) -> bool {
    let domain = cookie_domain.trim_start_matches('.').to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    if host == domain {
        return true;
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return false;
    }
    host.ends_with(&format!(".{domain}"))
}

fn path_match(cookie_path: &str, request_path: &str) -> bool {
    cookie_path == request_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path[cookie_path.len()..].starts_with('/')))
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn cookie_expiry(c: &cookie::Cookie<'_>) -> Option<SystemTime> {
    if let Some(max_age) = c.max_age() {
        let secs = max_age.whole_seconds();
        return Some(if secs <= 0 {
            SystemTime::UNIX_EPOCH
        } else {
            SystemTime::now() + Duration::from_secs(secs as u64)
        });
    }
    match c.expires() {
        Some(cookie::Expiration::DateTime(dt)) => Some(SystemTime::from(dt)),
        _ => None,
    }
}

struct JarSlot {
    jar: Arc<Mutex<CookieJar>>,
    last_used: Instant,
}

/// Process-wide owner of every cookie jar, keyed by `(session, host)`.
/// Bounded by capacity with least-recently-used eviction, and jars idle
/// past the TTL are purged on access. Callers borrow a jar as an
/// `Arc<Mutex<_>>`; locking it serializes the read-send-merge cycle for
/// one `(session, host)` pair without contending across hosts.
pub struct SessionStore {
    jars: std::sync::Mutex<HashMap<(String, String), JarSlot>>,
    capacity: usize,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            jars: std::sync::Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Extract the session id from the request's `Cookie` header, or mint
    /// a fresh one. Returns `(sid, minted)`; when `minted` is true the
    /// caller must set the session cookie on its response.
    pub fn session_id(&self, headers: &HeaderMap) -> (String, bool) {
        for value in headers.get_all(COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            for pair in raw.split(';') {
                let Some((name, value)) = pair.trim().split_once('=') else {
                    continue;
                };
                if name == SESSION_COOKIE && is_valid_sid(value) {
                    return (value.to_string(), false);
                }
            }
        }
        (mint_sid(), true)
    }

    /// Get-or-create the jar for `(sid, host)`.
    pub fn jar(&self, sid: &str, host: &str) -> Arc<Mutex<CookieJar>> {
        let mut jars = self.jars.lock().expect("session store poisoned");
        let now = Instant::now();
        jars.retain(|_, slot| now.duration_since(slot.last_used) < self.ttl);

        let key = (sid.to_string(), host.to_ascii_lowercase());
        if let Some(slot) = jars.get_mut(&key) {
            slot.last_used = now;
            return slot.jar.clone();
        }

        if jars.len() >= self.capacity {
            if let Some(oldest) = jars
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| k.clone())
            {
                jars.remove(&oldest);
            }
        }

        let jar = Arc::new(Mutex::new(CookieJar::default()));
        jars.insert(
            key,
            JarSlot {
                jar: jar.clone(),
                last_used: now,
            },
        );
        jar
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.jars.lock().unwrap().len()
    }
}

fn is_valid_sid(value: &str) -> bool {
    value.len() == SID_LEN && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn mint_sid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(SID_LEN);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// `Set-Cookie` value for a freshly minted session id. HttpOnly and scoped
/// to the proxy's own path so it never leaks into page scripts or targets.
pub fn session_cookie_value(sid: &str) -> String {
    format!("{SESSION_COOKIE}={sid}; Path=/; HttpOnly; SameSite=Lax")
}
