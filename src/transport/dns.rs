//! XMPP server endpoint resolution.
//!
//! Turns the account domain (or an explicit `host:port` override) into
//! candidate endpoints in connection-attempt order: `_xmpps-client._tcp`
//! SRV records (direct TLS) first, then `_xmpp-client._tcp` (STARTTLS),
//! each sorted by priority ascending and weight descending per RFC 2782,
//! with a `domain:5222` STARTTLS fallback when no SRV records exist.

use crate::error::Error;
use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// How the TCP connection reaches an encrypted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeMode {
    /// Plain TCP, upgraded in-band via STARTTLS.
    StartTls,
    /// TLS from the first byte.
    DirectTls,
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub mode: UpgradeMode,
    /// XMPP domain for TLS SNI and the stream `to=` attribute. With SRV
    /// resolution the connect target differs from the domain the
    /// certificate must be valid for (RFC 6120 §13.7.2).
    pub domain: String,
}

impl Endpoint {
    /// Hostname used for SNI and certificate verification.
    pub fn tls_name(&self) -> &str {
        &self.domain
    }
}

/// Build the endpoint for an explicit `host[:port]` server override.
/// Port 5223 selects direct TLS by convention; anything else is STARTTLS.
pub fn explicit_endpoint(server: &str, domain: &str) -> Endpoint {
    let trimmed = server.trim();
    let (host, port) = match trimmed.rsplit_once(':') {
        Some((host, port_str)) => match port_str.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (trimmed.to_string(), 5222),
        },
        None => (trimmed.to_string(), 5222),
    };
    let mode = if port == 5223 {
        UpgradeMode::DirectTls
    } else {
        UpgradeMode::StartTls
    };
    Endpoint {
        host,
        port,
        mode,
        domain: domain.to_string(),
    }
}

async fn srv_records(
    resolver: &TokioAsyncResolver,
    service: &str,
    domain: &str,
    mode: UpgradeMode,
    out: &mut Vec<Endpoint>,
) {
    let srv_name = format!("{}.{}", service, domain);
    match resolver.srv_lookup(&srv_name).await {
        Ok(lookup) => {
            let mut records: Vec<_> = lookup.iter().collect();
            records.sort_by(|a, b| {
                a.priority()
                    .cmp(&b.priority())
                    .then(b.weight().cmp(&a.weight()))
            });
            for r in records {
                let target = r.target().to_string().trim_end_matches('.').to_string();
                // RFC 2782: a "." target means the service is explicitly
                // not offered.
                if target.is_empty() {
                    info!(domain, srv = %srv_name, "SRV '.' target, service not offered");
                    continue;
                }
                info!(domain, host = %target, port = r.port(),
                    priority = r.priority(), weight = r.weight(), mode = ?mode,
                    "SRV record");
                out.push(Endpoint {
                    host: target,
                    port: r.port(),
                    mode,
                    domain: domain.to_string(),
                });
            }
        }
        Err(e) => {
            info!(domain, srv = %srv_name, error = %e, "SRV lookup failed");
        }
    }
}

/// Resolve the account domain to candidate endpoints (RFC 6120).
pub async fn resolve(domain: &str) -> Result<Vec<Endpoint>, Error> {
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "system DNS config unavailable, using default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let mut endpoints = Vec::new();
    srv_records(
        &resolver,
        "_xmpps-client._tcp",
        domain,
        UpgradeMode::DirectTls,
        &mut endpoints,
    )
    .await;
    srv_records(
        &resolver,
        "_xmpp-client._tcp",
        domain,
        UpgradeMode::StartTls,
        &mut endpoints,
    )
    .await;

    if endpoints.is_empty() {
        warn!(domain, "no SRV records, falling back to {}:5222 (STARTTLS)", domain);
        endpoints.push(Endpoint {
            host: domain.to_string(),
            port: 5222,
            mode: UpgradeMode::StartTls,
            domain: domain.to_string(),
        });
    } else {
        info!(domain, count = endpoints.len(), "SRV resolution complete");
    }
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_endpoint_with_port() {
        let ep = explicit_endpoint("chat.example.com:5222", "example.com");
        assert_eq!(ep.host, "chat.example.com");
        assert_eq!(ep.port, 5222);
        assert_eq!(ep.mode, UpgradeMode::StartTls);
        assert_eq!(ep.tls_name(), "example.com");
    }

    #[test]
    fn test_explicit_endpoint_5223_is_direct_tls() {
        let ep = explicit_endpoint("chat.example.com:5223", "example.com");
        assert_eq!(ep.mode, UpgradeMode::DirectTls);
    }

    #[test]
    fn test_explicit_endpoint_without_port() {
        let ep = explicit_endpoint("chat.example.com", "example.com");
        assert_eq!(ep.port, 5222);
        assert_eq!(ep.mode, UpgradeMode::StartTls);
    }

    #[test]
    fn test_explicit_endpoint_trims_whitespace() {
        let ep = explicit_endpoint("  chat.example.com:5280 ", "example.com");
        assert_eq!(ep.host, "chat.example.com");
        assert_eq!(ep.port, 5280);
    }

    #[tokio::test]
    async fn test_resolve_nonexistent_domain_falls_back() {
        let endpoints = resolve("this-domain-does-not-exist-wisp-test.example")
            .await
            .unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].port, 5222);
        assert_eq!(endpoints[0].mode, UpgradeMode::StartTls);
        assert_eq!(
            endpoints[0].domain,
            "this-domain-does-not-exist-wisp-test.example"
        );
    }
}
