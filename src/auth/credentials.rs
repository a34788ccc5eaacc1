// Credential flows
// The only producers of an initial authenticated session

use reqwest::{Client, Response, StatusCode};
use serde::Serialize;

use super::manager::SessionManager;
use super::types::{
    ClientRegistration, ErrorDetail, OtpDispatch, OtpRequest, OtpVerify, PasswordLogin,
    PrincipalKind, TokenPair, TokenResponse,
};
use crate::error::CredentialError;

/// Client for the login, registration and one-time code endpoints
///
/// A successful flow hands the issued pair to the session manager. A failed
/// flow never touches session state.
#[derive(Clone)]
pub struct AuthClient {
    client: Client,
    base_url: String,
    session: SessionManager,
}

impl AuthClient {
    pub fn new(client: Client, base_url: &str, session: SessionManager) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    /// Password login for end clients
    pub async fn login_client(&self, email: &str, password: &str) -> Result<(), CredentialError> {
        tracing::info!("Logging in client {}", email);
        let response = self
            .post("/auth/login/client", &PasswordLogin { email, password })
            .await?;
        self.establish_from(response, PrincipalKind::Client, login_error)
            .await
    }

    /// Password login for business administrators
    pub async fn login_business_admin(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(), CredentialError> {
        tracing::info!("Logging in business admin {}", email);
        let response = self
            .post("/auth/login/business", &PasswordLogin { email, password })
            .await?;
        self.establish_from(response, PrincipalKind::BusinessAdmin, login_error)
            .await
    }

    /// Ask the backend to deliver a one-time code to `phone`
    pub async fn request_otp(&self, phone: &str) -> Result<OtpDispatch, CredentialError> {
        let phone = phone.trim();
        tracing::info!("Requesting one-time code for {}", phone);

        let response = self.post("/auth/send-otp", &OtpRequest { phone }).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(rejected(status, response).await);
        }

        let dispatch: OtpDispatch = response.json().await?;
        if dispatch.debug_code.is_some() {
            tracing::warn!("Backend echoed the one-time code (development mode)");
        }
        Ok(dispatch)
    }

    /// Verify a one-time code; clients only
    pub async fn verify_otp(&self, phone: &str, code: &str) -> Result<(), CredentialError> {
        let phone = phone.trim();
        let code = code.trim();
        tracing::info!("Verifying one-time code for {}", phone);

        let response = self
            .post("/auth/verify-otp", &OtpVerify { phone, code })
            .await?;
        self.establish_from(response, PrincipalKind::Client, otp_error)
            .await
    }

    /// Register a new client account and sign it in
    pub async fn register_client(
        &self,
        registration: &ClientRegistration,
    ) -> Result<(), CredentialError> {
        tracing::info!("Registering client {}", registration.email);
        let response = self.post("/auth/register/client", registration).await?;
        self.establish_from(response, PrincipalKind::Client, |status, detail| {
            CredentialError::Rejected {
                status: status.as_u16(),
                detail,
            }
        })
        .await
    }

    /// Local logout; the backend keeps no session to revoke
    pub fn logout(&self) {
        self.session.logout();
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, CredentialError> {
        let url = format!("{}{}", self.base_url, path);
        Ok(self.client.post(&url).json(body).send().await?)
    }

    async fn establish_from(
        &self,
        response: Response,
        kind: PrincipalKind,
        on_error: impl FnOnce(StatusCode, String) -> CredentialError,
    ) -> Result<(), CredentialError> {
        let status = response.status();
        if !status.is_success() {
            let detail = error_detail(response).await;
            tracing::warn!(status = %status, detail = %detail, "Credential flow rejected");
            return Err(on_error(status, detail));
        }

        let tokens: TokenResponse = response.json().await?;
        let pair = TokenPair::new(tokens.access_token, tokens.refresh_token);
        if !pair.is_complete() {
            return Err(CredentialError::Rejected {
                status: status.as_u16(),
                detail: "Token response is missing a token".to_string(),
            });
        }

        self.session.establish(pair, kind);
        Ok(())
    }
}

fn login_error(status: StatusCode, detail: String) -> CredentialError {
    match status {
        StatusCode::UNAUTHORIZED => CredentialError::InvalidCredentials(detail),
        _ => CredentialError::Rejected {
            status: status.as_u16(),
            detail,
        },
    }
}

fn otp_error(status: StatusCode, detail: String) -> CredentialError {
    match status {
        StatusCode::BAD_REQUEST => CredentialError::OtpExpired(detail),
        StatusCode::UNAUTHORIZED => CredentialError::InvalidOtp(detail),
        _ => CredentialError::Rejected {
            status: status.as_u16(),
            detail,
        },
    }
}

async fn rejected(status: StatusCode, response: Response) -> CredentialError {
    CredentialError::Rejected {
        status: status.as_u16(),
        detail: error_detail(response).await,
    }
}

/// Extract the backend's `detail` message, falling back to the raw body
async fn error_detail(response: Response) -> String {
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorDetail>(&body) {
        Ok(ErrorDetail {
            detail: serde_json::Value::String(s),
        }) => s,
        Ok(ErrorDetail { detail }) => detail.to_string(),
        Err(_) => body,
    }
}
