use axum::http::{header, HeaderMap};

use crate::error::ApiError;

/// Pull the bearer token out of the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::MissingToken)?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(ApiError::MissingToken)
}

/// Host the client addressed, without the port. Falls back to the configured
/// server name when the header is absent or unreadable.
pub fn request_host(headers: &HeaderMap, fallback: &str) -> String {
    let Some(host) = headers.get(header::HOST).and_then(|value| value.to_str().ok()) else {
        return fallback.to_string();
    };

    strip_port(host).to_string()
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals keep their brackets.
    if let Some(end) = host.find(']') {
        return &host[..=end];
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123"),
        );
        assert_eq!(bearer_token(&headers).unwrap(), "abc123");
    }

    #[test]
    fn missing_or_malformed_authorization_is_rejected() {
        let headers = HeaderMap::new();
        assert!(matches!(
            bearer_token(&headers),
            Err(ApiError::MissingToken)
        ));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert!(matches!(
            bearer_token(&headers),
            Err(ApiError::MissingToken)
        ));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(matches!(
            bearer_token(&headers),
            Err(ApiError::MissingToken)
        ));
    }

    #[test]
    fn host_header_loses_its_port() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("chat.example.org:8008"));
        assert_eq!(request_host(&headers, "fallback"), "chat.example.org");

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("chat.example.org"));
        assert_eq!(request_host(&headers, "fallback"), "chat.example.org");
    }

    #[test]
    fn absent_host_uses_the_fallback() {
        let headers = HeaderMap::new();
        assert_eq!(request_host(&headers, "localhost"), "localhost");
    }

    #[test]
    fn ipv6_hosts_keep_their_brackets() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("[::1]:8008"));
        assert_eq!(request_host(&headers, "fallback"), "[::1]");
    }
}
