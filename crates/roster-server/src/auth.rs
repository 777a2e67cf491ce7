//! Bearer-token middleware and standalone verifier.
//!
//! The server never stores the token itself, only its SHA-256 hex digest.

use axum::{
  extract::{Request, State},
  http::HeaderMap,
  middleware::Next,
  response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Credentials accepted as valid for this server instance.
#[derive(Debug, Clone)]
pub struct AuthConfig {
  /// Lowercase hex SHA-256 of the bearer token.
  pub token_sha256: String,
}

/// Lowercase hex SHA-256 of `token`, as stored in `api_token_sha256`.
pub fn hash_token(token: &str) -> String {
  hex::encode(Sha256::digest(token.as_bytes()))
}

/// Verify the `Authorization: Bearer` header against the configured digest.
pub fn verify_bearer(headers: &HeaderMap, config: &AuthConfig) -> Result<(), Error> {
  let token = headers
    .get(axum::http::header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Bearer "))
    .map(str::trim)
    .filter(|t| !t.is_empty())
    .ok_or(Error::Unauthorized)?;

  if !hash_token(token).eq_ignore_ascii_case(config.token_sha256.trim()) {
    return Err(Error::Unauthorized);
  }
  Ok(())
}

/// Middleware rejecting any request without a valid bearer token.
pub async fn require_bearer(
  State(config): State<AuthConfig>,
  req: Request,
  next: Next,
) -> Response {
  match verify_bearer(req.headers(), &config) {
    Ok(()) => next.run(req).await,
    Err(e) => {
      tracing::debug!(path = %req.uri().path(), "rejected unauthenticated request");
      e.into_response()
    }
  }
}

#[cfg(test)]
mod tests {
  use axum::http::{HeaderValue, header};

  use super::*;

  fn config() -> AuthConfig {
    AuthConfig { token_sha256: hash_token("s3cret") }
  }

  fn headers(value: &str) -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
    h
  }

  #[test]
  fn hash_is_lowercase_hex_sha256() {
    assert_eq!(
      hash_token("abc"),
      "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
  }

  #[test]
  fn accepts_matching_token() {
    assert!(verify_bearer(&headers("Bearer s3cret"), &config()).is_ok());
  }

  #[test]
  fn digest_comparison_ignores_case() {
    let upper = AuthConfig { token_sha256: hash_token("s3cret").to_uppercase() };
    assert!(verify_bearer(&headers("Bearer s3cret"), &upper).is_ok());
  }

  #[test]
  fn rejects_wrong_missing_or_malformed_tokens() {
    let cfg = config();
    assert!(matches!(
      verify_bearer(&headers("Bearer nope"), &cfg),
      Err(Error::Unauthorized)
    ));
    assert!(verify_bearer(&HeaderMap::new(), &cfg).is_err());
    assert!(verify_bearer(&headers("Basic czNjcmV0"), &cfg).is_err());
    assert!(verify_bearer(&headers("Bearer "), &cfg).is_err());
  }
}
