// Session types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque bearer credential attached to outbound requests
pub type AccessToken = String;

/// Access/refresh token pair issued by the backend
///
/// Both tokens are opaque; nothing in this crate looks inside them.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
    pub issued_at: DateTime<Utc>,
}

impl TokenPair {
    /// Create a pair issued now
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
            issued_at: Utc::now(),
        }
    }

    /// Build the pair that replaces `self` after a refresh
    /// A refresh response without a refresh token keeps the current one
    pub fn rotated(&self, access: String, refresh: Option<String>) -> Self {
        Self {
            access,
            refresh: refresh
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| self.refresh.clone()),
            issued_at: Utc::now(),
        }
    }

    /// Whether both tokens are present
    pub fn is_complete(&self) -> bool {
        !self.access.is_empty() && !self.refresh.is_empty()
    }
}

// Never print the bearer strings themselves
impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &token_prefix(&self.access))
            .field("refresh", &token_prefix(&self.refresh))
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Short, log-safe prefix of a token
pub fn token_prefix(token: &str) -> String {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    format!("{}...", &token[..end])
}

/// Kind of authenticated principal
/// Used for routing only, never consulted by the refresh protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// End client of the booking apps
    Client,

    /// Administrator of a business
    BusinessAdmin,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::Client => "client",
            PrincipalKind::BusinessAdmin => "business_admin",
        }
    }
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrincipalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "client" => Ok(PrincipalKind::Client),
            "business_admin" | "business-admin" => Ok(PrincipalKind::BusinessAdmin),
            other => Err(format!("unknown principal kind: {}", other)),
        }
    }
}

/// Why a session was invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationReason {
    /// The backend rejected the refresh token
    ExpiredRefresh,

    /// The refresh call did not finish in time
    Timeout,

    /// Local logout
    Logout,

    /// No refresh token was held, refresh was never attempted
    NoRefreshToken,
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvalidationReason::ExpiredRefresh => "expired_refresh",
            InvalidationReason::Timeout => "timeout",
            InvalidationReason::Logout => "logout",
            InvalidationReason::NoRefreshToken => "no_refresh_token",
        };
        f.write_str(s)
    }
}

/// Notification delivered to session observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session is gone; observers should route to a login screen
    Invalidated(InvalidationReason),
}

/// Token-free snapshot of the session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Anonymous,
    Authenticated(PrincipalKind),
    Refreshing(PrincipalKind),
}

impl SessionStatus {
    pub fn principal(&self) -> Option<PrincipalKind> {
        match self {
            SessionStatus::Anonymous => None,
            SessionStatus::Authenticated(kind) | SessionStatus::Refreshing(kind) => Some(*kind),
        }
    }
}

/// Refresh request body
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Refresh response body
/// `refresh_token` is optional: a response with only a new access token is valid
#[derive(Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

// Never print the bearer strings themselves
impl fmt::Debug for RefreshResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshResponse")
            .field("access_token", &token_prefix(&self.access_token))
            .field("refresh_token", &self.refresh_token.as_deref().map(token_prefix))
            .finish()
    }
}

/// Token response of the login, registration and OTP endpoints
#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[allow(dead_code)]
    pub token_type: Option<String>,
}

/// Email/password login body (clients and business admins)
#[derive(Serialize)]
pub struct PasswordLogin<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Client registration body
#[derive(Debug, Clone, Serialize)]
pub struct ClientRegistration {
    pub email: String,
    pub password: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// One-time code request body
#[derive(Serialize)]
pub struct OtpRequest<'a> {
    pub phone: &'a str,
}

/// One-time code verification body
#[derive(Serialize)]
pub struct OtpVerify<'a> {
    pub phone: &'a str,
    pub code: &'a str,
}

/// Backend acknowledgement of an OTP request
#[derive(Debug, Clone, Deserialize)]
pub struct OtpDispatch {
    pub success: bool,
    pub message: String,
    pub phone: String,
    /// Echoed only by development backends
    pub debug_code: Option<String>,
}

/// Error body returned by the backend
#[derive(Deserialize)]
pub struct ErrorDetail {
    pub detail: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotated_keeps_refresh_token_when_absent() {
        let pair = TokenPair::new("a1", "r1");
        let next = pair.rotated("a2".to_string(), None);
        assert_eq!(next.access, "a2");
        assert_eq!(next.refresh, "r1");

        let next = pair.rotated("a3".to_string(), Some(String::new()));
        assert_eq!(next.refresh, "r1");

        let next = pair.rotated("a4".to_string(), Some("r2".to_string()));
        assert_eq!(next.refresh, "r2");
    }

    #[test]
    fn test_is_complete() {
        assert!(TokenPair::new("a", "r").is_complete());
        assert!(!TokenPair::new("", "r").is_complete());
        assert!(!TokenPair::new("a", "").is_complete());
    }

    #[test]
    fn test_debug_hides_tokens() {
        let pair = TokenPair::new("access-token-secret-value", "refresh-token-secret-value");
        let printed = format!("{:?}", pair);
        assert!(!printed.contains("secret-value"));
        assert!(printed.contains("access-t..."));
    }

    #[test]
    fn test_token_prefix_short_and_multibyte() {
        assert_eq!(token_prefix("abc"), "abc...");
        assert_eq!(token_prefix("ééééééééééé"), "éééééééé...");
    }

    #[test]
    fn test_principal_kind_parse() {
        assert_eq!("client".parse::<PrincipalKind>(), Ok(PrincipalKind::Client));
        assert_eq!("business_admin".parse::<PrincipalKind>(), Ok(PrincipalKind::BusinessAdmin));
        assert_eq!("Business-Admin".parse::<PrincipalKind>(), Ok(PrincipalKind::BusinessAdmin));
        assert!("admin".parse::<PrincipalKind>().is_err());
        assert_eq!(PrincipalKind::BusinessAdmin.to_string(), "business_admin");
    }

    #[test]
    fn test_refresh_response_without_refresh_token() {
        let data: RefreshResponse = serde_json::from_str(r#"{"access_token":"a2"}"#).unwrap();
        assert_eq!(data.access_token, "a2");
        assert!(data.refresh_token.is_none());
    }

    #[test]
    fn test_status_principal() {
        assert_eq!(SessionStatus::Anonymous.principal(), None);
        assert_eq!(
            SessionStatus::Refreshing(PrincipalKind::Client).principal(),
            Some(PrincipalKind::Client)
        );
    }
}
