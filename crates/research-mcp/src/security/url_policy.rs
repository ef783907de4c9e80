//! Outbound URL policy.
//!
//! Every tool-initiated fetch passes through here before a socket is opened.
//! Rules run in order; the first match rejects with the rule name so clients
//! can see exactly which policy fired.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::limits;

/// Cloud metadata endpoints that must never be fetched.
const METADATA_ADDRS: &[IpAddr] = &[
    IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254)),
    // Alibaba Cloud
    IpAddr::V4(Ipv4Addr::new(100, 100, 100, 200)),
    // AWS IMDSv6
    IpAddr::V6(Ipv6Addr::new(0xfd00, 0xec2, 0, 0, 0, 0, 0, 0x254)),
];

/// A rejected URL with the rule that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRejection {
    pub rule: &'static str,
    pub detail: String,
}

impl std::fmt::Display for UrlRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.rule, self.detail)
    }
}

fn reject(rule: &'static str, detail: impl Into<String>) -> UrlRejection {
    UrlRejection { rule, detail: detail.into() }
}

/// SSRF policy for outbound fetches.
#[derive(Debug, Clone)]
pub struct UrlPolicy {
    /// Permit private/loopback targets (dev only).
    allow_private: bool,
    /// Extra hosts blocked regardless of resolution.
    denied_hosts: HashSet<String>,
    /// Ports outbound connections may target.
    allowed_ports: Vec<u16>,
}

impl UrlPolicy {
    #[must_use]
    pub fn new(allow_private: bool, denied_hosts: impl IntoIterator<Item = String>) -> Self {
        Self {
            allow_private,
            denied_hosts: denied_hosts.into_iter().collect(),
            allowed_ports: limits::ALLOWED_PORTS.to_vec(),
        }
    }

    /// Override the port allowlist (tests and embedded setups).
    #[must_use]
    pub fn with_allowed_ports(mut self, ports: Vec<u16>) -> Self {
        self.allowed_ports = ports;
        self
    }

    /// Validate and resolve a URL. On success the parsed URL is returned.
    ///
    /// # Errors
    ///
    /// Returns the first matching policy rule.
    pub async fn validate(&self, raw: &str) -> Result<url::Url, UrlRejection> {
        if raw.len() > limits::MAX_URL_LENGTH {
            return Err(reject("url-too-long", format!("{} > {} chars", raw.len(), limits::MAX_URL_LENGTH)));
        }

        let parsed = url::Url::parse(raw).map_err(|e| reject("malformed", e.to_string()))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => return Err(reject("scheme", format!("'{other}' is not http or https"))),
        }

        let Some(host) = parsed.host_str() else {
            return Err(reject("no-host", "URL has no host"));
        };

        if self.denied_hosts.contains(&host.to_ascii_lowercase()) {
            return Err(reject("denylist", format!("host '{host}' is denied")));
        }

        let port = parsed.port_or_known_default().unwrap_or(443);
        if !self.allowed_ports.contains(&port) {
            return Err(reject("port", format!("port {port} not in allowlist")));
        }

        let addrs = self.resolve(&parsed, host, port).await?;
        if !self.allow_private {
            for addr in addrs {
                check_address(addr)?;
            }
        }

        Ok(parsed)
    }

    async fn resolve(
        &self,
        parsed: &url::Url,
        host: &str,
        port: u16,
    ) -> Result<Vec<IpAddr>, UrlRejection> {
        match parsed.host() {
            Some(url::Host::Ipv4(addr)) => Ok(vec![IpAddr::V4(addr)]),
            Some(url::Host::Ipv6(addr)) => Ok(vec![IpAddr::V6(addr)]),
            _ => {
                let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, port))
                    .await
                    .map_err(|e| reject("resolve", format!("'{host}' did not resolve: {e}")))?
                    .map(|sa| sa.ip())
                    .collect();
                if addrs.is_empty() {
                    return Err(reject("resolve", format!("'{host}' resolved to no addresses")));
                }
                Ok(addrs)
            }
        }
    }
}

/// Reject addresses a research tool has no business reaching.
fn check_address(addr: IpAddr) -> Result<(), UrlRejection> {
    let effective = match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        IpAddr::V4(_) => addr,
    };

    // Metadata endpoints before the generic link-local rule: 169.254.169.254
    // is link-local and must report the more specific rule. The check runs on
    // the unmapped form too so ::ffff: wrapping cannot slip past it.
    if METADATA_ADDRS.contains(&addr) || METADATA_ADDRS.contains(&effective) {
        return Err(reject("metadata-endpoint", format!("{addr} is a cloud metadata endpoint")));
    }

    match effective {
        IpAddr::V4(v4) => {
            if v4.is_loopback() || v4.is_unspecified() {
                return Err(reject("loopback", format!("{v4} is loopback")));
            }
            if v4.is_link_local() {
                return Err(reject("link-local", format!("{v4} is link-local")));
            }
            if v4.is_private() {
                return Err(reject("private-address", format!("{v4} is private (RFC1918)")));
            }
            if is_cgnat(v4) {
                return Err(reject("cgnat", format!("{v4} is carrier-grade NAT space")));
            }
            if v4.is_multicast() || v4.is_broadcast() {
                return Err(reject("multicast", format!("{v4} is multicast/broadcast")));
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return Err(reject("loopback", format!("{v6} is loopback")));
            }
            if is_v6_link_local(v6) {
                return Err(reject("link-local", format!("{v6} is link-local")));
            }
            if is_v6_unique_local(v6) {
                return Err(reject("private-address", format!("{v6} is unique-local")));
            }
            if v6.is_multicast() {
                return Err(reject("multicast", format!("{v6} is multicast")));
            }
        }
    }

    Ok(())
}

/// 100.64.0.0/10
fn is_cgnat(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 100 && (64..128).contains(&octets[1])
}

/// fe80::/10
fn is_v6_link_local(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// fc00::/7
fn is_v6_unique_local(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> UrlPolicy {
        UrlPolicy::new(false, Vec::new())
    }

    #[tokio::test]
    async fn test_scheme_enforced() {
        let err = policy().validate("ftp://example.com/file").await.unwrap_err();
        assert_eq!(err.rule, "scheme");

        let err = policy().validate("file:///etc/passwd").await.unwrap_err();
        // file URLs have no http scheme
        assert_eq!(err.rule, "scheme");
    }

    #[tokio::test]
    async fn test_metadata_endpoint_rule_wins() {
        let err = policy().validate("http://169.254.169.254/latest/meta-data/").await.unwrap_err();
        assert_eq!(err.rule, "metadata-endpoint");
    }

    #[tokio::test]
    async fn test_loopback_rejected() {
        let err = policy().validate("http://127.0.0.1/admin").await.unwrap_err();
        assert_eq!(err.rule, "loopback");

        let err = policy().validate("http://[::1]/admin").await.unwrap_err();
        assert_eq!(err.rule, "loopback");
    }

    #[tokio::test]
    async fn test_private_ranges_rejected() {
        for target in ["http://10.0.0.5/", "http://192.168.1.1/", "http://172.16.3.4/"] {
            let err = policy().validate(target).await.unwrap_err();
            assert_eq!(err.rule, "private-address", "for {target}");
        }
    }

    #[tokio::test]
    async fn test_link_local_and_cgnat_rejected() {
        let err = policy().validate("http://169.254.10.20/").await.unwrap_err();
        assert_eq!(err.rule, "link-local");

        let err = policy().validate("http://100.64.0.1/").await.unwrap_err();
        assert_eq!(err.rule, "cgnat");
    }

    #[tokio::test]
    async fn test_port_allowlist() {
        let err = policy().validate("http://93.184.216.34:22/").await.unwrap_err();
        assert_eq!(err.rule, "port");

        // 8443 is allowed; the public test IP passes address checks.
        assert!(policy().validate("https://93.184.216.34:8443/").await.is_ok());
    }

    #[tokio::test]
    async fn test_length_cap() {
        let long = format!("http://example.com/{}", "a".repeat(2100));
        let err = policy().validate(&long).await.unwrap_err();
        assert_eq!(err.rule, "url-too-long");

        // Exactly one over the limit.
        let base = "http://example.com/";
        let exact_over = format!("{base}{}", "a".repeat(2049 - base.len()));
        assert_eq!(exact_over.len(), 2049);
        let err = policy().validate(&exact_over).await.unwrap_err();
        assert_eq!(err.rule, "url-too-long");
    }

    #[tokio::test]
    async fn test_denylist() {
        let policy = UrlPolicy::new(false, vec!["internal.example.com".to_owned()]);
        let err = policy.validate("https://internal.example.com/").await.unwrap_err();
        assert_eq!(err.rule, "denylist");
    }

    #[tokio::test]
    async fn test_allow_private_override() {
        let policy = UrlPolicy::new(true, Vec::new());
        assert!(policy.validate("http://127.0.0.1:8080/dev").await.is_ok());
    }

    #[tokio::test]
    async fn test_public_address_passes() {
        assert!(policy().validate("https://93.184.216.34/page").await.is_ok());
    }
}
