use url::Url;

use crate::error::ProxyError;
use crate::guard::{self, AddressPolicy};

/// Which scheme set a raw URL is validated against.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchemeMode {
    /// `http` / `https` — the forwarding path.
    Fetch,
    /// `ws` / `wss` — the relay path.
    WebSocket,
}

/// A validated absolute target URL. Construction goes through
/// [`parse_target`] (syntax + scheme) and [`validate`] (plus the address
/// guard), so holding a `Target` means the scheme is in the allowed set.
#[derive(Clone, Debug)]
pub struct Target {
    url: Url,
}

impl Target {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or_else(|| match self.url.scheme() {
                "https" | "wss" => 443,
                _ => 80,
            })
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.url.scheme(), "https" | "wss")
    }
}

/// Parse and sanitize a user-supplied URL without consulting DNS.
pub fn parse_target(raw: &str, mode: SchemeMode) -> Result<Target, ProxyError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ProxyError::MissingTarget);
    }
    if trimmed.starts_with('#') {
        return Err(ProxyError::InvalidUrl);
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("javascript:") || lower.starts_with("data:") {
        return Err(ProxyError::BlockedScheme);
    }

    // Protocol-relative input inherits the secure scheme for the mode.
    let absolute = if trimmed.starts_with("//") {
        match mode {
            SchemeMode::Fetch => format!("https:{trimmed}"),
            SchemeMode::WebSocket => format!("wss:{trimmed}"),
        }
    } else {
        trimmed.to_string()
    };

    let url = Url::parse(&absolute).map_err(|_| ProxyError::InvalidUrl)?;
    let allowed = match mode {
        SchemeMode::Fetch => matches!(url.scheme(), "http" | "https"),
        SchemeMode::WebSocket => matches!(url.scheme(), "ws" | "wss"),
    };
    if !allowed {
        return Err(ProxyError::BlockedScheme);
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(ProxyError::InvalidUrl);
    }

    Ok(Target { url })
}

/// Full validation: syntax, scheme, then the address guard.
pub async fn validate(
    raw: &str,
    mode: SchemeMode,
    policy: &AddressPolicy,
) -> Result<Target, ProxyError> {
    let target = parse_target(raw, mode)?;
    guard::ensure_routable(target.host(), target.port(), policy).await?;
    Ok(target)
}

/// Re-validate an already-parsed URL, used on every redirect hop. The
/// scheme check runs again: a public page redirecting to `file:` or an
/// internal address must fail exactly like direct input would.
pub async fn validate_url(
    url: Url,
    mode: SchemeMode,
    policy: &AddressPolicy,
) -> Result<Target, ProxyError> {
    validate(url.as_str(), mode, policy).await
}
