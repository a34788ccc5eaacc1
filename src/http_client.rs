use anyhow::Context;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, Request, Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

use crate::auth::{
    refresh, token_prefix, InvalidationReason, RefreshStart, RefreshTicket, SessionManager,
};
use crate::error::{ApiError, Result, SessionError};

/// Connection settings for the dispatcher
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub base_url: String,
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Upper bound on the refresh call
    pub refresh_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api/v1".to_string(),
            max_connections: 20,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            refresh_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP client for the booking backend
///
/// Attaches the session's bearer token to every request and, on a 401,
/// drives the refresh-and-retry-once protocol through the session manager.
#[derive(Clone)]
pub struct SessionHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Session manager
    session: SessionManager,

    base_url: String,

    refresh_timeout: Duration,
}

impl SessionHttpClient {
    /// Create a new HTTP client
    pub fn new(session: SessionManager, settings: &HttpSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(settings.max_connections)
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(client, session, settings))
    }

    /// Create a dispatcher around an existing client
    pub fn with_client(client: Client, session: SessionManager, settings: &HttpSettings) -> Self {
        Self {
            client,
            session,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            refresh_timeout: settings.refresh_timeout,
        }
    }

    /// Absolute URL for an API path
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Start building a request; send it with [`SessionHttpClient::send`]
    pub fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client.request(method, self.url(path))
    }

    /// Authenticated GET
    pub async fn get(&self, path: &str) -> Result<Response> {
        let request = self.request(Method::GET, path).build()?;
        self.send(request).await
    }

    /// Authenticated POST with a JSON body
    pub async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response> {
        let request = self.request(Method::POST, path).json(body).build()?;
        self.send(request).await
    }

    /// Send a request with the session's bearer token
    ///
    /// - no session: fails with `NoSession` without contacting the backend
    /// - 401: refreshes (or joins the in-flight refresh) and resends exactly once
    /// - any other failure is returned as-is, nothing else is retried
    pub async fn send(&self, request: Request) -> Result<Response> {
        let method = request.method().clone();
        let url = request.url().clone();

        let mut token = self.session.current_token().await?;
        let mut retried = false;

        loop {
            let mut req = request.try_clone().ok_or_else(|| {
                ApiError::Internal(anyhow::anyhow!("Request body is not cloneable"))
            })?;
            attach_bearer(&mut req, &token)?;

            tracing::debug!(
                method = %method,
                url = %url,
                retried,
                "Sending HTTP request"
            );

            let response = self.client.execute(req).await.map_err(|e| {
                tracing::warn!(
                    error = %e,
                    url = %url,
                    timeout = e.is_timeout(),
                    connect = e.is_connect(),
                    "HTTP request error"
                );
                ApiError::Transport(e)
            })?;

            let status = response.status();
            if status.is_success() {
                tracing::debug!(status = %status, "Request successful");
                return Ok(response);
            }

            if status == StatusCode::UNAUTHORIZED && !retried {
                tracing::warn!(
                    url = %url,
                    token = %token_prefix(&token),
                    "Received 401, refreshing session and retrying once"
                );
                token = self.refresh_after_unauthorized(&token).await?;
                retried = true;
                continue;
            }

            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                url = %url,
                response_body = %error_text,
                retried,
                "HTTP request failed with error response"
            );
            return Err(ApiError::Backend {
                status: status.as_u16(),
                message: error_text,
            });
        }
    }

    /// Obtain the token to retry with after `rejected` got a 401
    async fn refresh_after_unauthorized(&self, rejected: &str) -> Result<String> {
        match self.session.begin_refresh_for(rejected) {
            Ok(RefreshStart::Superseded(token)) => Ok(token),
            Ok(RefreshStart::Started(ticket)) => {
                self.run_refresh(ticket).await?;
                Ok(self.session.current_token().await?)
            }
            Err(SessionError::AlreadyRefreshing) => {
                tracing::debug!("Refresh already in flight, waiting for it");
                Ok(self.session.current_token().await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Perform the refresh call and report its outcome to the session manager
    ///
    /// Runs as its own task so that a cancelled caller cannot leave the
    /// session stuck in `Refreshing`.
    async fn run_refresh(&self, ticket: RefreshTicket) -> std::result::Result<(), SessionError> {
        let client = self.client.clone();
        let url = self.url(refresh::REFRESH_PATH);
        let bound = self.refresh_timeout;

        let task = tokio::spawn(async move {
            let outcome = tokio::time::timeout(
                bound,
                refresh::refresh_tokens(&client, &url, ticket.refresh_token()),
            )
            .await;

            match outcome {
                Ok(Ok(data)) => {
                    let pair = ticket
                        .previous()
                        .rotated(data.access_token, data.refresh_token);
                    ticket.complete(pair);
                    Ok(())
                }
                Ok(Err(e)) => {
                    let reason = refresh::failure_reason(&e);
                    tracing::error!("Token refresh failed: {:#}", e);
                    ticket.fail(reason);
                    Err(SessionError::from(reason))
                }
                Err(_) => {
                    tracing::error!(bound_secs = bound.as_secs_f64(), "Token refresh timed out");
                    ticket.fail(InvalidationReason::Timeout);
                    Err(SessionError::Timeout)
                }
            }
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Token refresh task failed: {}", e);
                Err(SessionError::SessionExpired)
            }
        }
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Get the session manager
    pub fn session(&self) -> &SessionManager {
        &self.session
    }
}

/// Set `Authorization: Bearer <token>`, replacing anything the caller set
fn attach_bearer(request: &mut Request, token: &str) -> Result<()> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Invalid access token: {}", e)))?;
    value.set_sensitive(true);
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}
