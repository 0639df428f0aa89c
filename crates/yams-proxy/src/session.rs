//! Session identifiers and client addressing.

use hyper::header::HeaderMap;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Session ids are opaque 24-byte alphanumeric tokens.
pub const SID_LENGTH: usize = 24;

pub const HEADER_SESSION_ID: &str = "x-yams-session-id";
pub const HEADER_ROUTE_ID: &str = "x-yams-route-id";
pub const HEADER_STATUS: &str = "x-yams-status";

pub const STATUS_INTERCEPTED: &str = "intercepted";
pub const STATUS_PROXY: &str = "proxy";
pub const STATUS_ERROR: &str = "error";

pub fn rand_string(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

/// Derive the per-client session id: client-supplied header value, trimmed
/// and truncated to 24 bytes, or a fresh random token when empty.
pub fn derive_sid(headers: &HeaderMap) -> String {
    let mut sid = headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default();
    if sid.len() > SID_LENGTH {
        sid.truncate(SID_LENGTH);
    }
    if sid.is_empty() {
        sid = rand_string(SID_LENGTH);
    }
    sid
}

/// Best client address guess: first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the socket peer host.
pub fn client_ip(headers: &HeaderMap, remote_addr: std::net::SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = xff.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real = real.trim();
        if !real.is_empty() {
            return real.to_string();
        }
    }
    remote_addr.ip().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn addr() -> std::net::SocketAddr {
        "192.0.2.7:4711".parse().unwrap()
    }

    #[test]
    fn rand_string_is_alphanumeric() {
        let s = rand_string(SID_LENGTH);
        assert_eq!(s.len(), SID_LENGTH);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn sid_generated_when_missing() {
        let headers = HeaderMap::new();
        let sid = derive_sid(&headers);
        assert_eq!(sid.len(), SID_LENGTH);
    }

    #[test]
    fn sid_trimmed_and_truncated() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_SESSION_ID,
            HeaderValue::from_static("  abcdefghijklmnopqrstuvwxyz0123  "),
        );
        let sid = derive_sid(&headers);
        assert_eq!(sid, "abcdefghijklmnopqrstuvwx");
        assert_eq!(sid.len(), SID_LENGTH);
    }

    #[test]
    fn sid_passthrough_when_short() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_SESSION_ID, HeaderValue::from_static("tok"));
        assert_eq!(derive_sid(&headers), "tok");
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_ip(&headers, addr()), "203.0.113.9");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_ip(&headers, addr()), "198.51.100.2");
        assert_eq!(client_ip(&HeaderMap::new(), addr()), "192.0.2.7");
    }
}
