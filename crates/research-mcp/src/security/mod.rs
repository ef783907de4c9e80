//! Admission control: SSRF policy, OAuth validation, rate limiting.

pub mod oauth;
pub mod rate_limit;
pub mod url_policy;

pub use oauth::{AuthContext, AuthFailure, OAuthValidator, scopes_cover};
pub use rate_limit::{RateDecision, RequestRateLimiter};
pub use url_policy::{UrlPolicy, UrlRejection};
