//! Caller identity extraction.

use std::net::SocketAddr;

use axum::http::HeaderMap;

const FORWARDED_FOR: &str = "x-forwarded-for";
const UNKNOWN: &str = "unknown";

/// Identify the caller: the first `X-Forwarded-For` hop if present, else the
/// peer IP of the connection.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty());

    match (forwarded, peer) {
        (Some(hop), _) => hop.to_string(),
        (None, Some(peer)) => peer.ip().to_string(),
        (None, None) => UNKNOWN.to_string(),
    }
}

/// Store key for an identity, e.g. `limit:10.0.0.1`.
pub fn rate_limit_key(prefix: &str, identity: &str) -> String {
    format!("{}{}", prefix, identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> Option<SocketAddr> {
        Some("192.168.1.20:51234".parse().unwrap())
    }

    #[test]
    fn test_peer_address_without_forwarding() {
        let headers = HeaderMap::new();
        assert_eq!(client_identity(&headers, peer()), "192.168.1.20");
    }

    #[test]
    fn test_first_forwarded_hop_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );
        assert_eq!(client_identity(&headers, peer()), "203.0.113.7");
    }

    #[test]
    fn test_blank_forwarded_header_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static(""));
        assert_eq!(client_identity(&headers, peer()), "192.168.1.20");
    }

    #[test]
    fn test_unknown_without_any_source() {
        assert_eq!(client_identity(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn test_rate_limit_key() {
        assert_eq!(rate_limit_key("limit:", "127.0.0.1"), "limit:127.0.0.1");
    }
}
