//! Connection string parsing and DNS-SRV expansion.

use std::net::IpAddr;

use hickory_resolver::TokioAsyncResolver;
use shoal_core::{Result, ShoalError};

/// Scheme prefix for plaintext connections.
const SCHEME: &str = "shoal";
/// Scheme prefix for TLS connections.
const SCHEME_TLS: &str = "shoals";

/// One bootstrap endpoint from the connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Hostname or IP literal.
    pub host: String,
    /// Explicit port, if one was given.
    pub port: Option<u16>,
}

/// A parsed connection string.
///
/// Accepted forms: `shoal://host1[,host2...][/bucket]` and
/// `shoals://...` for TLS. Hosts may carry an explicit port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    /// Whether the TLS scheme was used.
    pub tls: bool,
    /// Bootstrap endpoints in the order given.
    pub endpoints: Vec<Endpoint>,
    /// Optional default bucket from the path component.
    pub bucket: Option<String>,
}

impl ConnectionString {
    /// Parses a connection string.
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| ShoalError::Config(format!("missing scheme in '{raw}'")))?;

        let tls = match scheme {
            SCHEME => false,
            SCHEME_TLS => true,
            other => {
                return Err(ShoalError::Config(format!("unsupported scheme '{other}'")));
            }
        };

        let (hosts_part, bucket) = match rest.split_once('/') {
            Some((hosts, bucket)) if !bucket.is_empty() => (hosts, Some(bucket.to_string())),
            Some((hosts, _)) => (hosts, None),
            None => (rest, None),
        };

        if hosts_part.is_empty() {
            return Err(ShoalError::Config(format!("no hosts in '{raw}'")));
        }

        let mut endpoints = Vec::new();
        for host_entry in hosts_part.split(',') {
            let host_entry = host_entry.trim();
            if host_entry.is_empty() {
                continue;
            }

            // `url` handles the bracketed-IPv6-with-port and plain cases
            // uniformly once re-anchored to a dummy scheme.
            let parsed = url::Url::parse(&format!("probe://{host_entry}"))
                .map_err(|e| ShoalError::Config(format!("invalid host '{host_entry}': {e}")))?;
            let host = parsed
                .host_str()
                .ok_or_else(|| ShoalError::Config(format!("invalid host '{host_entry}'")))?
                .trim_matches(|c| c == '[' || c == ']')
                .to_string();

            endpoints.push(Endpoint { host, port: parsed.port() });
        }

        if endpoints.is_empty() {
            return Err(ShoalError::Config(format!("no hosts in '{raw}'")));
        }

        Ok(Self { tls, endpoints, bucket })
    }

    /// Returns `true` if this string qualifies for DNS-SRV expansion.
    ///
    /// SRV lookup applies only to a single non-numeric host with no
    /// explicit port.
    pub fn is_srv_eligible(&self) -> bool {
        match self.endpoints.as_slice() {
            [endpoint] => {
                endpoint.port.is_none() && endpoint.host.parse::<IpAddr>().is_err()
            }
            _ => false,
        }
    }

    /// Returns the SRV record name for this connection string.
    pub fn srv_name(&self) -> String {
        let service = if self.tls { SCHEME_TLS } else { SCHEME };
        format!("_{service}._tcp.{}", self.endpoints[0].host)
    }

    /// Expands the connection string via DNS-SRV when eligible.
    ///
    /// A failed or empty lookup leaves the original endpoints in place;
    /// SRV is an optimization, not a requirement.
    pub async fn resolve_srv(&mut self) -> Result<bool> {
        if !self.is_srv_eligible() {
            return Ok(false);
        }

        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| ShoalError::Config(format!("resolver init: {e}")))?;

        let name = self.srv_name();
        let lookup = match resolver.srv_lookup(&name).await {
            Ok(lookup) => lookup,
            Err(e) => {
                tracing::debug!(name = %name, error = %e, "SRV lookup failed, using host as-is");
                return Ok(false);
            }
        };

        let mut expanded: Vec<Endpoint> = lookup
            .iter()
            .map(|srv| Endpoint {
                host: srv.target().to_utf8().trim_end_matches('.').to_string(),
                port: Some(srv.port()),
            })
            .collect();

        if expanded.is_empty() {
            return Ok(false);
        }

        expanded.sort_by(|a, b| a.host.cmp(&b.host).then(a.port.cmp(&b.port)));
        tracing::info!(name = %name, count = expanded.len(), "expanded endpoints via DNS-SRV");
        self.endpoints = expanded;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_host() {
        let parsed = ConnectionString::parse("shoal://db1.example.com").unwrap();
        assert!(!parsed.tls);
        assert_eq!(parsed.endpoints.len(), 1);
        assert_eq!(parsed.endpoints[0].host, "db1.example.com");
        assert_eq!(parsed.endpoints[0].port, None);
        assert_eq!(parsed.bucket, None);
    }

    #[test]
    fn test_multiple_hosts_with_bucket() {
        let parsed = ConnectionString::parse("shoal://a,b:11211,c/orders").unwrap();
        assert_eq!(parsed.endpoints.len(), 3);
        assert_eq!(parsed.endpoints[1].host, "b");
        assert_eq!(parsed.endpoints[1].port, Some(11211));
        assert_eq!(parsed.bucket.as_deref(), Some("orders"));
    }

    #[test]
    fn test_tls_scheme() {
        let parsed = ConnectionString::parse("shoals://secure.example.com/data").unwrap();
        assert!(parsed.tls);
        assert_eq!(parsed.bucket.as_deref(), Some("data"));
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        assert!(ConnectionString::parse("http://x").is_err());
        assert!(ConnectionString::parse("no-scheme-here").is_err());
    }

    #[test]
    fn test_rejects_empty_hosts() {
        assert!(ConnectionString::parse("shoal://").is_err());
        assert!(ConnectionString::parse("shoal:///bucket").is_err());
    }

    #[test]
    fn test_trailing_slash_without_bucket() {
        let parsed = ConnectionString::parse("shoal://h/").unwrap();
        assert_eq!(parsed.bucket, None);
    }

    #[test]
    fn test_srv_eligibility() {
        assert!(ConnectionString::parse("shoal://cluster.example.com")
            .unwrap()
            .is_srv_eligible());
        assert!(!ConnectionString::parse("shoal://a,b").unwrap().is_srv_eligible());
        assert!(!ConnectionString::parse("shoal://h:11210").unwrap().is_srv_eligible());
        assert!(!ConnectionString::parse("shoal://10.0.0.1").unwrap().is_srv_eligible());
    }

    #[test]
    fn test_srv_name_reflects_scheme() {
        let plain = ConnectionString::parse("shoal://c.example.com").unwrap();
        assert_eq!(plain.srv_name(), "_shoal._tcp.c.example.com");

        let tls = ConnectionString::parse("shoals://c.example.com").unwrap();
        assert_eq!(tls.srv_name(), "_shoals._tcp.c.example.com");
    }

    #[test]
    fn test_ipv6_host() {
        let parsed = ConnectionString::parse("shoal://[::1]:11210/b").unwrap();
        assert_eq!(parsed.endpoints[0].host, "::1");
        assert_eq!(parsed.endpoints[0].port, Some(11210));
    }
}
