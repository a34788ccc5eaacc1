// Token refresh call

use anyhow::{Context, Result};
use reqwest::Client;

use super::types::{InvalidationReason, RefreshRequest, RefreshResponse};

/// Refresh endpoint, relative to the API base URL
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Exchange a refresh token for a new access token
///
/// The response may omit `refresh_token`, in which case the caller keeps the
/// one it already has.
pub async fn refresh_tokens(
    client: &Client,
    url: &str,
    refresh_token: &str,
) -> Result<RefreshResponse> {
    tracing::info!("Refreshing access token...");

    let response = client
        .post(url)
        .json(&RefreshRequest { refresh_token })
        .send()
        .await
        .context("Failed to send refresh request")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!(
            status = %status,
            body = %error_text,
            "Token refresh rejected"
        );
        anyhow::bail!("Token refresh failed: {} - {}", status, error_text);
    }

    let data: RefreshResponse = response
        .json()
        .await
        .context("Failed to parse refresh response")?;

    if data.access_token.is_empty() {
        anyhow::bail!("Refresh response does not contain access_token");
    }

    tracing::info!(
        rotated = data.refresh_token.is_some(),
        "Access token refreshed"
    );

    Ok(data)
}

/// Map a refresh failure onto the reason reported to session observers
pub fn failure_reason(err: &anyhow::Error) -> InvalidationReason {
    let timed_out = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<reqwest::Error>())
        .any(|e| e.is_timeout());

    if timed_out {
        InvalidationReason::Timeout
    } else {
        InvalidationReason::ExpiredRefresh
    }
}
