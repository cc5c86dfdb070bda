//! Client identity resolution.
//!
//! Derives a stable identity key from a request: the authenticated subject
//! id when one is present, otherwise a privacy-coarsened network address.
//! Identity issuance itself (JWT verification and the like) is the upstream
//! auth layer's job; this module only consumes its output.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::trace;

use crate::config::AddressConfig;

/// Identity key used when the client address cannot be resolved at all.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Role assumed for authenticated subjects without a role claim.
pub const DEFAULT_AUTHENTICATED_ROLE: &str = "User";

/// Role assumed for unauthenticated callers.
pub const ANONYMOUS_ROLE: &str = "Anonymous";

/// A verified subject, inserted into request extensions by the upstream
/// auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Stable subject identifier (e.g. the JWT `sub` claim)
    pub id: String,
    /// Role claim, if any
    pub role: Option<String>,
}

/// The resolved identity of a request, as seen by the admission tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Key the identity tier counts under: subject id when authenticated,
    /// coarsened address otherwise
    pub key: String,
    pub authenticated: bool,
    /// Effective role: the subject's claim, "User" for roleless subjects,
    /// "Anonymous" for everyone else
    pub role: String,
    /// Coarsened address; the address-tier key. Resolved for authenticated
    /// callers too, since the address tier applies to everyone.
    pub address: Option<String>,
    /// Uncoarsened address, kept only for whitelist comparison
    pub raw_address: Option<String>,
}

/// Resolves request identity from subject claims and network addresses.
pub struct ClientIdentifier {
    config: AddressConfig,
}

impl ClientIdentifier {
    pub fn new(config: AddressConfig) -> Self {
        Self { config }
    }

    /// Resolve the identity for a request. Never fails: an unresolvable
    /// address yields the `"unknown"` sentinel key.
    pub fn identify<B>(&self, request: &Request<B>) -> ClientIdentity {
        let raw_address = self.resolve_address(request);
        let address = raw_address.as_deref().map(coarsen_address);

        if let Some(subject) = request.extensions().get::<Subject>() {
            let role = subject
                .role
                .clone()
                .unwrap_or_else(|| DEFAULT_AUTHENTICATED_ROLE.to_string());
            trace!(subject = %subject.id, role = %role, "Resolved authenticated identity");
            return ClientIdentity {
                key: subject.id.clone(),
                authenticated: true,
                role,
                address,
                raw_address,
            };
        }

        let key = address
            .clone()
            .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string());
        trace!(key = %key, "Resolved anonymous identity");
        ClientIdentity {
            key,
            authenticated: false,
            role: ANONYMOUS_ROLE.to_string(),
            address,
            raw_address,
        }
    }

    /// Resolve the client address: trusted forwarded headers first (first
    /// header present wins, first value before any comma), then the
    /// transport-level peer address.
    fn resolve_address<B>(&self, request: &Request<B>) -> Option<String> {
        if self.config.use_forward_headers {
            for header in &self.config.trusted_forward_headers {
                let value = request
                    .headers()
                    .get(header.as_str())
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.split(',').next())
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty());
                if let Some(value) = value {
                    return Some(value.to_string());
                }
            }
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string())
    }
}

/// Coarsen an address for privacy before it is used as a rate-limit key:
/// the last octet of an IPv4 address (or the last two groups of an IPv6
/// address) is masked to zero. Distinct clients sharing a masked prefix
/// share one quota bucket.
pub fn coarsen_address(address: &str) -> String {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            Ipv4Addr::new(a, b, c, 0).to_string()
        }
        Ok(IpAddr::V6(v6)) => {
            let mut segments = v6.segments();
            segments[6] = 0;
            segments[7] = 0;
            Ipv6Addr::from(segments).to_string()
        }
        Err(_) => UNKNOWN_IDENTITY.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn identifier() -> ClientIdentifier {
        ClientIdentifier::new(AddressConfig::default())
    }

    fn request() -> Request<Body> {
        Request::builder().uri("/api/things").body(Body::empty()).unwrap()
    }

    #[test]
    fn test_coarsen_ipv4_masks_last_octet() {
        assert_eq!(coarsen_address("192.168.10.77"), "192.168.10.0");
    }

    #[test]
    fn test_coarsen_ipv6_masks_last_two_groups() {
        assert_eq!(
            coarsen_address("2001:db8:1:2:3:4:5:6"),
            "2001:db8:1:2:3:4::"
        );
    }

    #[test]
    fn test_coarsen_garbage_is_unknown() {
        assert_eq!(coarsen_address("not-an-address"), UNKNOWN_IDENTITY);
    }

    #[test]
    fn test_authenticated_subject_wins() {
        let mut req = request();
        req.extensions_mut().insert(Subject {
            id: "user-42".to_string(),
            role: Some("Admin".to_string()),
        });
        req.extensions_mut()
            .insert(ConnectInfo("10.1.2.3:9999".parse::<SocketAddr>().unwrap()));

        let identity = identifier().identify(&req);
        assert_eq!(identity.key, "user-42");
        assert!(identity.authenticated);
        assert_eq!(identity.role, "Admin");
        // Address still resolved: the address tier applies to everyone.
        assert_eq!(identity.address.as_deref(), Some("10.1.2.0"));
        assert_eq!(identity.raw_address.as_deref(), Some("10.1.2.3"));
    }

    #[test]
    fn test_roleless_subject_defaults_to_user() {
        let mut req = request();
        req.extensions_mut().insert(Subject {
            id: "user-7".to_string(),
            role: None,
        });

        let identity = identifier().identify(&req);
        assert_eq!(identity.role, "User");
    }

    #[test]
    fn test_forward_header_preferred_over_peer() {
        let mut req = request();
        req.headers_mut()
            .insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        req.extensions_mut()
            .insert(ConnectInfo("10.1.2.3:9999".parse::<SocketAddr>().unwrap()));

        let identity = identifier().identify(&req);
        assert!(!identity.authenticated);
        assert_eq!(identity.role, "Anonymous");
        assert_eq!(identity.key, "203.0.113.0");
        assert_eq!(identity.raw_address.as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn test_forward_header_order_respected() {
        let mut req = request();
        req.headers_mut()
            .insert("x-real-ip", "198.51.100.4".parse().unwrap());

        let identity = identifier().identify(&req);
        assert_eq!(identity.key, "198.51.100.0");
    }

    #[test]
    fn test_forward_headers_ignored_when_disabled() {
        let config = AddressConfig {
            use_forward_headers: false,
            ..AddressConfig::default()
        };
        let mut req = request();
        req.headers_mut()
            .insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        req.extensions_mut()
            .insert(ConnectInfo("10.1.2.3:9999".parse::<SocketAddr>().unwrap()));

        let identity = ClientIdentifier::new(config).identify(&req);
        assert_eq!(identity.key, "10.1.2.0");
    }

    #[test]
    fn test_unresolvable_address_is_unknown_sentinel() {
        let identity = identifier().identify(&request());
        assert_eq!(identity.key, UNKNOWN_IDENTITY);
        assert_eq!(identity.address, None);
        assert_eq!(identity.raw_address, None);
    }
}
