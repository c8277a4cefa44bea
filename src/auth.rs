//! Bearer-token guard for the shard administration endpoints.

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

/// Tokens accepted by the admin guard. No tokens means the guard is off.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    tokens: HashSet<String>,
}

impl AuthConfig {
    pub fn from_tokens(tokens: Vec<String>) -> Result<Self, String> {
        let mut valid_tokens = HashSet::new();
        for token in tokens {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                return Err("Empty token value in configuration".to_string());
            }
            valid_tokens.insert(trimmed.to_string());
        }
        Ok(Self {
            tokens: valid_tokens,
        })
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}

/// Reject requests without a valid `Authorization: Bearer <token>` header.
pub async fn auth_middleware(
    State(auth_config): State<Arc<AuthConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let token = match extract_bearer_token(&request) {
        Ok(Some(token)) => token,
        Ok(None) => {
            warn!(path = %request.uri().path(), "Authentication failed: missing Authorization header");
            return unauthorized_response(
                "Missing Bearer token in Authorization header",
                "Include a valid token: 'Authorization: Bearer <token>'",
            );
        }
        Err(msg) => {
            warn!(path = %request.uri().path(), "Authentication failed: invalid header format");
            return unauthorized_response(
                msg,
                "Use the format: 'Authorization: Bearer <your-token>'",
            );
        }
    };

    if verify_token(&auth_config, token) {
        next.run(request).await
    } else {
        warn!(token_prefix = %mask_token(token), "Authentication failed: invalid token");
        unauthorized_response(
            "Invalid Bearer token",
            "Check that you are using a token configured on the server",
        )
    }
}

fn extract_bearer_token(request: &Request<Body>) -> Result<Option<&str>, &'static str> {
    let Some(auth_header) = request.headers().get(header::AUTHORIZATION) else {
        return Ok(None);
    };

    let auth_str = auth_header
        .to_str()
        .map_err(|_| "Authorization header contains invalid characters")?;

    let Some(token) = auth_str.strip_prefix("Bearer ") else {
        return Err("Invalid Authorization header format. Expected 'Bearer <token>'");
    };
    if token.is_empty() {
        return Err("Bearer token is empty");
    }

    Ok(Some(token))
}

/// Compare against every configured token so timing does not reveal which one matched.
fn verify_token(config: &AuthConfig, provided: &str) -> bool {
    let mut found = false;
    for expected in &config.tokens {
        if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
            found = true;
        }
    }
    found
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

fn mask_token(token: &str) -> String {
    match token.get(..3) {
        Some(prefix) if token.len() > 3 => format!("{}***", prefix),
        _ => "***".to_string(),
    }
}

fn unauthorized_response(message: impl Into<String>, suggestion: impl Into<String>) -> Response {
    #[derive(Serialize)]
    struct ErrorBody {
        success: bool,
        code: &'static str,
        message: String,
        suggestion: String,
    }

    let body = ErrorBody {
        success: false,
        code: "unauthorized",
        message: message.into(),
        suggestion: suggestion.into(),
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/api/shards");
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_from_tokens() {
        let config = AuthConfig::from_tokens(vec!["alpha".into(), " beta ".into()]).unwrap();
        assert!(config.is_enabled());
        assert_eq!(config.token_count(), 2);
        assert!(verify_token(&config, "beta"));
        assert!(!verify_token(&config, "gamma"));

        assert!(AuthConfig::from_tokens(vec!["  ".into()]).is_err());
        assert!(!AuthConfig::from_tokens(Vec::new()).unwrap().is_enabled());
        assert!(!AuthConfig::disabled().is_enabled());
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token(&request_with(None)), Ok(None));
        assert_eq!(
            extract_bearer_token(&request_with(Some("Bearer abc"))),
            Ok(Some("abc"))
        );
        assert!(extract_bearer_token(&request_with(Some("Basic abc"))).is_err());
        assert!(extract_bearer_token(&request_with(Some("Bearer "))).is_err());
    }

    #[test]
    fn test_constant_time_eq_lengths() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"token2"));
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("abc"), "***");
        assert_eq!(mask_token("secret-token"), "sec***");
    }
}
