//! OAuth validator tests: bearer extraction, algorithm allowlist, and the
//! RFC 6750 failure surface. Signature verification against a live JWKS is
//! exercised by the claim/scope unit tests plus these decode-layer checks.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use research_mcp::config::OAuthConfig;
use research_mcp::security::{AuthFailure, OAuthValidator};

fn validator() -> Arc<OAuthValidator> {
    let config = OAuthConfig {
        issuer_url: "https://issuer.example.com".to_owned(),
        audience: "research-mcp".to_owned(),
        jwks_url: "https://issuer.example.com/.well-known/jwks.json".to_owned(),
        jwks_ttl: Duration::from_secs(3600),
        enforce_https: false,
    };
    Arc::new(OAuthValidator::new(config, reqwest::Client::new()))
}

/// A structurally valid JWT with the given header, no real signature.
fn fake_jwt(header: &serde_json::Value) -> String {
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(r#"{"sub":"alice"}"#),
        URL_SAFE_NO_PAD.encode("sig")
    )
}

#[tokio::test]
async fn test_missing_authorization_header() {
    let failure = validator().authorize_header(None).await.unwrap_err();
    assert_eq!(failure, AuthFailure::MissingToken);
    assert_eq!(failure.status(), 401);
    assert_eq!(failure.www_authenticate(), "Bearer");
}

#[tokio::test]
async fn test_non_bearer_scheme_rejected() {
    let failure = validator().authorize_header(Some("Basic dXNlcjpwYXNz")).await.unwrap_err();
    assert_eq!(failure, AuthFailure::MissingToken);
}

#[tokio::test]
async fn test_empty_bearer_rejected() {
    let failure = validator().authorize_header(Some("Bearer   ")).await.unwrap_err();
    assert_eq!(failure, AuthFailure::MissingToken);
}

#[tokio::test]
async fn test_garbage_token_is_invalid() {
    let failure = validator().authorize_header(Some("Bearer not-a-jwt")).await.unwrap_err();
    assert!(matches!(failure, AuthFailure::InvalidToken(_)));
    assert_eq!(failure.status(), 401);
    assert!(failure.www_authenticate().contains("invalid_token"));
}

#[tokio::test]
async fn test_symmetric_algorithm_refused_before_any_fetch() {
    // HS256 must be rejected outright: no JWKS fetch, no signature check.
    let token = fake_jwt(&serde_json::json!({"alg": "HS256", "typ": "JWT"}));
    let failure =
        validator().authorize_header(Some(&format!("Bearer {token}"))).await.unwrap_err();

    match failure {
        AuthFailure::InvalidToken(detail) => assert!(detail.contains("not allowed"), "{detail}"),
        other => panic!("expected InvalidToken, got {other:?}"),
    }
}

#[tokio::test]
async fn test_none_algorithm_refused() {
    let token = fake_jwt(&serde_json::json!({"alg": "none", "typ": "JWT"}));
    let failure =
        validator().authorize_header(Some(&format!("Bearer {token}"))).await.unwrap_err();
    assert!(matches!(failure, AuthFailure::InvalidToken(_)));
}

#[test]
fn test_insufficient_scope_surface() {
    let failure = AuthFailure::InsufficientScope {
        missing: vec!["mcp:tool:scrape_page:execute".to_owned()],
    };
    assert_eq!(failure.status(), 403);
    assert_eq!(failure.error_code(), "insufficient_scope");
    let header = failure.www_authenticate();
    assert!(header.contains(r#"scope="mcp:tool:scrape_page:execute""#));
}

#[test]
fn test_https_required_surface() {
    let failure = AuthFailure::HttpsRequired;
    assert_eq!(failure.status(), 403);
    assert_eq!(failure.error_code(), "https_required");
}
