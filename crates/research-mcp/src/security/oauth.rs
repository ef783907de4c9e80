//! OAuth 2.1 bearer-token validation for the HTTP transport.
//!
//! Tokens are verified against a cached JWKS fetched from the issuer. The
//! JWKS cache is a single cache with a single TTL; a stale key set stays
//! servable while one background refresh is in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use tokio::sync::{Mutex, RwLock};

use crate::config::OAuthConfig;

/// Asymmetric algorithms the server will verify. Symmetric algorithms are
/// rejected outright: a shared secret would let any resource server mint
/// tokens.
const ALLOWED_ALGS: &[Algorithm] =
    &[Algorithm::RS256, Algorithm::RS384, Algorithm::RS512, Algorithm::ES256, Algorithm::ES384];

/// An authorized request principal.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Token `sub` claim.
    pub subject: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
}

/// Token validation failure, mapped to RFC 6750 error responses.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    ExpiredToken,

    #[error("insufficient scope, missing: {missing:?}")]
    InsufficientScope { missing: Vec<String> },

    #[error("https required")]
    HttpsRequired,
}

impl AuthFailure {
    /// HTTP status for the failure.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::MissingToken | Self::InvalidToken(_) | Self::ExpiredToken => 401,
            Self::InsufficientScope { .. } | Self::HttpsRequired => 403,
        }
    }

    /// `WWW-Authenticate` header value per RFC 6750.
    #[must_use]
    pub fn www_authenticate(&self) -> String {
        match self {
            Self::MissingToken => "Bearer".to_owned(),
            Self::InvalidToken(detail) => {
                format!("Bearer error=\"invalid_token\", error_description=\"{detail}\"")
            }
            Self::ExpiredToken => {
                "Bearer error=\"invalid_token\", error_description=\"token expired\"".to_owned()
            }
            Self::InsufficientScope { missing } => format!(
                "Bearer error=\"insufficient_scope\", scope=\"{}\"",
                missing.join(" ")
            ),
            Self::HttpsRequired => {
                "Bearer error=\"invalid_request\", error_description=\"https required\"".to_owned()
            }
        }
    }

    /// Stable `error` value for JSON bodies.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::InvalidToken(_) => "invalid_token",
            Self::ExpiredToken => "expired_token",
            Self::InsufficientScope { .. } => "insufficient_scope",
            Self::HttpsRequired => "https_required",
        }
    }
}

/// Whether a single granted scope covers a required one, including the
/// composite forms: `mcp:admin` covers any `mcp:admin:*`, `mcp:tool` covers
/// any `mcp:tool:*:execute`.
#[must_use]
pub fn scope_covers(granted: &str, required: &str) -> bool {
    if granted == required {
        return true;
    }
    match granted {
        "mcp:admin" => required.starts_with("mcp:admin:"),
        "mcp:tool" => required.starts_with("mcp:tool:") && required.ends_with(":execute"),
        _ => false,
    }
}

/// Whether a scope set covers a required scope.
#[must_use]
pub fn scopes_cover(granted: &[String], required: &str) -> bool {
    granted.iter().any(|g| scope_covers(g, required))
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Validates bearer tokens for the HTTP transport.
pub struct OAuthValidator {
    config: OAuthConfig,
    http: reqwest::Client,
    jwks: RwLock<Option<Arc<CachedJwks>>>,
    refresh_guard: Mutex<()>,
}

impl OAuthValidator {
    #[must_use]
    pub fn new(config: OAuthConfig, http: reqwest::Client) -> Self {
        Self { config, http, jwks: RwLock::new(None), refresh_guard: Mutex::new(()) }
    }

    /// Issuer and audience, for the ops surface.
    #[must_use]
    pub fn describe(&self) -> (&str, &str) {
        (&self.config.issuer_url, &self.config.audience)
    }

    /// Whether HTTPS termination is required in front of the server.
    #[must_use]
    pub const fn enforce_https(&self) -> bool {
        self.config.enforce_https
    }

    /// Validate an `Authorization` header value into an [`AuthContext`].
    pub async fn authorize_header(
        self: &Arc<Self>,
        authorization: Option<&str>,
    ) -> Result<AuthContext, AuthFailure> {
        let header = authorization.ok_or(AuthFailure::MissingToken)?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or(AuthFailure::MissingToken)?
            .trim();
        if token.is_empty() {
            return Err(AuthFailure::MissingToken);
        }
        self.validate_token(token).await
    }

    /// Full token validation: header decode, key lookup, signature, claims,
    /// scope extraction.
    pub async fn validate_token(self: &Arc<Self>, token: &str) -> Result<AuthContext, AuthFailure> {
        let header =
            decode_header(token).map_err(|e| AuthFailure::InvalidToken(e.to_string()))?;

        if !ALLOWED_ALGS.contains(&header.alg) {
            return Err(AuthFailure::InvalidToken(format!(
                "algorithm {:?} not allowed",
                header.alg
            )));
        }

        let jwk = self.signing_key(header.kid.as_deref()).await?;
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| AuthFailure::InvalidToken(format!("unusable JWKS key: {e}")))?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.config.issuer_url.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);
        validation.validate_nbf = true;

        let data = decode::<serde_json::Value>(token, &key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthFailure::ExpiredToken,
                _ => AuthFailure::InvalidToken(e.to_string()),
            }
        })?;

        let claims = data.claims;
        let subject = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .unwrap_or("anonymous")
            .to_owned();

        Ok(AuthContext { subject, scopes: extract_scopes(&claims) })
    }

    /// Enforce that the context covers every required scope.
    pub fn require_scopes(ctx: &AuthContext, required: &[&str]) -> Result<(), AuthFailure> {
        let missing: Vec<String> = required
            .iter()
            .filter(|r| !scopes_cover(&ctx.scopes, r))
            .map(|r| (*r).to_owned())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AuthFailure::InsufficientScope { missing })
        }
    }

    /// Look up the signing key by kid, serving a stale key set while an
    /// async refresh is in flight.
    async fn signing_key(self: &Arc<Self>, kid: Option<&str>) -> Result<Jwk, AuthFailure> {
        let cached = self.jwks.read().await.clone();

        let keys = match cached {
            Some(cached) if cached.fetched_at.elapsed() < self.config.jwks_ttl => cached,
            Some(stale) => {
                self.spawn_refresh();
                stale
            }
            None => self.refresh_now().await?,
        };

        if let Some(jwk) = find_key(&keys.keys, kid) {
            return Ok(jwk);
        }

        // Unknown kid usually means key rotation: refresh once inline.
        let fresh = self.refresh_now().await?;
        find_key(&fresh.keys, kid)
            .ok_or_else(|| AuthFailure::InvalidToken(format!("no JWKS key for kid {kid:?}")))
    }

    fn spawn_refresh(self: &Arc<Self>) {
        let validator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = validator.refresh_now().await {
                tracing::warn!(error = %e, "Background JWKS refresh failed; serving stale keys");
            }
        });
    }

    async fn refresh_now(&self) -> Result<Arc<CachedJwks>, AuthFailure> {
        let _guard = self.refresh_guard.lock().await;

        // A concurrent refresh may have landed while waiting for the guard.
        if let Some(cached) = self.jwks.read().await.clone() {
            if cached.fetched_at.elapsed() < Duration::from_secs(1) {
                return Ok(cached);
            }
        }

        let response = self
            .http
            .get(&self.config.jwks_url)
            .send()
            .await
            .map_err(|e| AuthFailure::InvalidToken(format!("JWKS fetch failed: {e}")))?;
        let keys: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthFailure::InvalidToken(format!("JWKS parse failed: {e}")))?;

        let cached = Arc::new(CachedJwks { keys, fetched_at: Instant::now() });
        *self.jwks.write().await = Some(Arc::clone(&cached));
        tracing::debug!(url = %self.config.jwks_url, "JWKS refreshed");
        Ok(cached)
    }
}

impl std::fmt::Debug for OAuthValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthValidator").field("issuer", &self.config.issuer_url).finish()
    }
}

fn find_key(set: &JwkSet, kid: Option<&str>) -> Option<Jwk> {
    match kid {
        Some(kid) => set.keys.iter().find(|k| k.common.key_id.as_deref() == Some(kid)).cloned(),
        // Without a kid, accept a sole asymmetric key.
        None => {
            let asymmetric: Vec<&Jwk> = set
                .keys
                .iter()
                .filter(|k| {
                    matches!(
                        k.algorithm,
                        AlgorithmParameters::RSA(_) | AlgorithmParameters::EllipticCurve(_)
                    )
                })
                .collect();
            if asymmetric.len() == 1 { Some(asymmetric[0].clone()) } else { None }
        }
    }
}

/// Scopes come as a space-delimited `scope` string or a `scope`/`scopes`
/// array; accept all three shapes.
fn extract_scopes(claims: &serde_json::Value) -> Vec<String> {
    for field in ["scope", "scopes"] {
        match claims.get(field) {
            Some(serde_json::Value::String(s)) => {
                return s.split_whitespace().map(str::to_owned).collect();
            }
            Some(serde_json::Value::Array(items)) => {
                return items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect();
            }
            _ => {}
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_literal_match() {
        assert!(scope_covers("mcp:tool:google_search:execute", "mcp:tool:google_search:execute"));
        assert!(!scope_covers("mcp:tool:google_search:execute", "mcp:tool:scrape_page:execute"));
    }

    #[test]
    fn test_composite_admin_scope() {
        assert!(scope_covers("mcp:admin", "mcp:admin:cache:invalidate"));
        assert!(scope_covers("mcp:admin", "mcp:admin:events:read"));
        assert!(!scope_covers("mcp:admin", "mcp:tool:google_search:execute"));
    }

    #[test]
    fn test_composite_tool_scope() {
        assert!(scope_covers("mcp:tool", "mcp:tool:google_search:execute"));
        assert!(scope_covers("mcp:tool", "mcp:tool:scrape_page:execute"));
        assert!(!scope_covers("mcp:tool", "mcp:admin:cache:invalidate"));
        // Composite tool scope only grants execution.
        assert!(!scope_covers("mcp:tool", "mcp:tool:google_search:configure"));
    }

    #[test]
    fn test_scopes_cover_set() {
        let granted = vec!["mcp:tool:google_search:execute".to_owned(), "mcp:admin".to_owned()];
        assert!(scopes_cover(&granted, "mcp:admin:cache:persist"));
        assert!(scopes_cover(&granted, "mcp:tool:google_search:execute"));
        assert!(!scopes_cover(&granted, "mcp:tool:scrape_page:execute"));
    }

    #[test]
    fn test_extract_scopes_string_and_array() {
        let claims = serde_json::json!({"scope": "a b c"});
        assert_eq!(extract_scopes(&claims), vec!["a", "b", "c"]);

        let claims = serde_json::json!({"scopes": ["x", "y"]});
        assert_eq!(extract_scopes(&claims), vec!["x", "y"]);

        let claims = serde_json::json!({"sub": "u"});
        assert!(extract_scopes(&claims).is_empty());
    }

    #[test]
    fn test_failure_status_mapping() {
        assert_eq!(AuthFailure::MissingToken.status(), 401);
        assert_eq!(AuthFailure::ExpiredToken.status(), 401);
        assert_eq!(AuthFailure::InsufficientScope { missing: vec![] }.status(), 403);
        assert_eq!(AuthFailure::HttpsRequired.status(), 403);
    }

    #[test]
    fn test_www_authenticate_lists_missing_scope() {
        let failure = AuthFailure::InsufficientScope {
            missing: vec!["mcp:tool:scrape_page:execute".to_owned()],
        };
        let header = failure.www_authenticate();
        assert!(header.contains("insufficient_scope"));
        assert!(header.contains("mcp:tool:scrape_page:execute"));
    }
}
