use std::collections::HashSet;
use std::net::IpAddr;

use tokio::net::lookup_host;
use tracing::warn;

use crate::error::ProxyError;

/// Whether targets resolving to private/loopback space are allowed.
/// `AllowPrivate` exists for local development and the test suite; the
/// default everywhere else is `PublicOnly`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressPolicy {
    PublicOnly,
    AllowPrivate,
    /// Named hosts skip the address check; everything else is held to
    /// `PublicOnly`. Lets a deployment whitelist specific internal
    /// services without opening the whole private range.
    TrustedHosts(HashSet<String>),
}

#[derive(Debug)]
pub struct Classification {
    pub addresses: Vec<IpAddr>,
    pub all_blocked: bool,
}

/// True for any address the proxy must never fetch on a client's behalf:
/// loopback, RFC 1918 private space, link-local (the cloud metadata range
/// lives here), unspecified, broadcast, IPv6 unique-local, and IPv4-mapped
/// IPv6 addresses judged by their embedded v4.
pub fn is_blocked(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked(IpAddr::V4(mapped));
            }
            let seg = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 link-local
                || (seg[0] & 0xffc0) == 0xfe80
                // fc00::/7 unique-local
                || (seg[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Resolve `host` and classify every candidate address. IP literals are
/// classified without touching DNS. Resolution failures and empty result
/// sets fail closed: an address we cannot inspect is treated as blocked.
pub async fn classify(host: &str, port: u16) -> Result<Classification, ProxyError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(Classification {
            all_blocked: is_blocked(ip),
            addresses: vec![ip],
        });
    }

    let resolved = lookup_host((host, port)).await.map_err(|err| {
        warn!(%host, %err, "dns resolution failed");
        ProxyError::BlockedIp
    })?;

    let addresses: Vec<IpAddr> = resolved.map(|sa| sa.ip()).collect();
    if addresses.is_empty() {
        return Err(ProxyError::BlockedIp);
    }
    let all_blocked = addresses.iter().all(|ip| is_blocked(*ip));
    Ok(Classification {
        addresses,
        all_blocked,
    })
}

/// Trust decision for one hop. The resolved addresses are advisory only:
/// the outbound connection is still made by hostname so TLS SNI and
/// virtual hosting keep working.
pub async fn ensure_routable(
    host: &str,
    port: u16,
    policy: &AddressPolicy,
) -> Result<(), ProxyError> {
    match policy {
        AddressPolicy::AllowPrivate => return Ok(()),
        AddressPolicy::TrustedHosts(hosts) if hosts.contains(host) => return Ok(()),
        _ => {}
    }
    let classification = classify(host, port).await?;
    if classification.all_blocked {
        warn!(%host, addresses = ?classification.addresses, "all resolved addresses blocked");
        return Err(ProxyError::BlockedIp);
    }
    Ok(())
}
