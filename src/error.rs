// Error handling module
// Defines the session, dispatcher and credential flow error types

use thiserror::Error;

use crate::auth::InvalidationReason;

/// Errors produced by the session manager
///
/// `Clone` so that a single refresh outcome can be fanned out to every
/// caller that was queued while the refresh was in flight.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No session was ever established (or it was torn down)
    #[error("No session: authentication required")]
    NoSession,

    /// A refresh is already in flight; wait on `current_token()` instead
    #[error("A token refresh is already in progress")]
    AlreadyRefreshing,

    /// The refresh was rejected, the session is gone
    #[error("Session expired: re-authentication required")]
    SessionExpired,

    /// The refresh call exceeded its time bound
    #[error("Token refresh timed out")]
    Timeout,

    /// No usable refresh token is held locally
    #[error("No refresh token available")]
    NoRefreshToken,
}

impl SessionError {
    /// Whether the error means the user has to go through a credential flow again
    pub fn requires_login(&self) -> bool {
        !matches!(self, SessionError::AlreadyRefreshing)
    }
}

impl From<InvalidationReason> for SessionError {
    fn from(reason: InvalidationReason) -> Self {
        match reason {
            InvalidationReason::Timeout => SessionError::Timeout,
            InvalidationReason::NoRefreshToken => SessionError::NoRefreshToken,
            InvalidationReason::ExpiredRefresh | InvalidationReason::Logout => {
                SessionError::SessionExpired
            }
        }
    }
}

/// Errors returned by the request dispatcher
#[derive(Error, Debug)]
pub enum ApiError {
    /// Session state prevented the request (or its retry) from being sent
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Backend answered with a non-success status
    #[error("Backend error: {status} - {message}")]
    Backend { status: u16, message: String },

    /// Network-level failure, surfaced unchanged
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// HTTP status of a backend failure, if there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Backend { status, .. } => Some(*status),
            ApiError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether the backend rejected the credentials attached to the request
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

/// Errors returned by the credential flows
#[derive(Error, Debug)]
pub enum CredentialError {
    /// Wrong email/password combination
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The one-time code did not match
    #[error("Invalid one-time code: {0}")]
    InvalidOtp(String),

    /// The one-time code expired or was never requested
    #[error("One-time code expired: {0}")]
    OtpExpired(String),

    /// Any other rejection from the backend
    #[error("Request rejected: {status} - {detail}")]
    Rejected { status: u16, detail: String },

    /// Network-level failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for dispatcher operations
pub type Result<T> = std::result::Result<T, ApiError>;
