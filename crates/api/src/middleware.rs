use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

/// Authorization scheme executors use on queue routes.
pub const EXECUTOR_SCHEME: &str = "token-executor";
/// Authorization scheme operators use on admin routes.
pub const ADMIN_SCHEME: &str = "Bearer";

/// Expected token for one family of routes.
#[derive(Clone)]
pub struct TokenAuth {
    scheme: &'static str,
    token: Arc<str>,
}

impl TokenAuth {
    pub fn executor(secret: &str) -> Self {
        Self {
            scheme: EXECUTOR_SCHEME,
            token: Arc::from(secret),
        }
    }

    pub fn admin(token: &str) -> Self {
        Self {
            scheme: ADMIN_SCHEME,
            token: Arc::from(token),
        }
    }
}

/// Reject requests that do not carry `Authorization: <scheme> <token>`.
pub async fn token_auth(
    State(auth): State<TokenAuth>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = extract_token(req.headers(), auth.scheme)?;
    if !constant_time_eq(token.as_bytes(), auth.token.as_bytes()) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}

fn extract_token<'a>(headers: &'a HeaderMap, scheme: &str) -> Result<&'a str, StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let (given_scheme, token) = header.split_once(' ').ok_or(StatusCode::UNAUTHORIZED)?;
    if given_scheme != scheme {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn extracts_token_for_matching_scheme() {
        assert_eq!(extract_token(&headers("token-executor s3cret"), EXECUTOR_SCHEME), Ok("s3cret"));
        assert_eq!(extract_token(&headers("Bearer abc"), ADMIN_SCHEME), Ok("abc"));
    }

    #[test]
    fn rejects_wrong_scheme_or_empty_token() {
        assert_eq!(
            extract_token(&headers("Bearer s3cret"), EXECUTOR_SCHEME),
            Err(StatusCode::UNAUTHORIZED)
        );
        assert_eq!(extract_token(&headers("Bearer  "), ADMIN_SCHEME), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(extract_token(&HeaderMap::new(), ADMIN_SCHEME), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn compares_tokens() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
