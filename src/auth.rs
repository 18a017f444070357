//! Bearer-token check for admin/write endpoints.
//!
//! Just the constant-time secret comparison; there is no dashboard, CLI
//! packaging, or session-cookie machinery here, so that's all this needs
//! to do.

use axum::http::HeaderMap;

/// Constant-time equality check, to avoid leaking the secret's length or
/// prefix through response-timing side channels.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Extracts the bearer token from `Authorization: Bearer <token>` and
/// compares it against `expected` in constant time. A `None` `expected`
/// disables the check (the endpoint is open).
pub fn check_bearer(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };

    let Some(header_value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(header_str) = header_value.to_str() else {
        return false;
    };
    let Some(token) = header_str.strip_prefix("Bearer ") else {
        return false;
    };

    constant_time_eq(token.as_bytes(), expected.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(value).unwrap(),
        );
        h
    }

    #[test]
    fn no_expected_secret_always_passes() {
        assert!(check_bearer(&HeaderMap::new(), None));
    }

    #[test]
    fn matching_bearer_token_passes() {
        let headers = headers_with("Bearer sekret");
        assert!(check_bearer(&headers, Some("sekret")));
    }

    #[test]
    fn mismatched_token_fails() {
        let headers = headers_with("Bearer wrong");
        assert!(!check_bearer(&headers, Some("sekret")));
    }

    #[test]
    fn missing_header_fails_when_secret_required() {
        assert!(!check_bearer(&HeaderMap::new(), Some("sekret")));
    }

    #[test]
    fn missing_bearer_prefix_fails() {
        let headers = headers_with("sekret");
        assert!(!check_bearer(&headers, Some("sekret")));
    }
}
