//! API client for the BitDrop backend.
//!
//! The backend owns user profiles. The client never interprets a profile; it
//! only needs the endpoint to accept or reject the bearer token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::config::Config;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Profile record of the signed-in user, passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserProfile(serde_json::Value);

impl UserProfile {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_json(self) -> serde_json::Value {
        self.0
    }

    /// `userId` when the backend includes it
    pub fn user_id(&self) -> Option<&str> {
        self.0.get("userId").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct AvailabilityResponse {
    #[serde(default)]
    message: Option<String>,
}

/// Backend operations `SessionManager` depends on.
#[async_trait]
pub trait ProfileApi: Send + Sync {
    /// Fails with `ApiError::Unauthorized` when the token is invalid or expired
    async fn fetch_profile(&self, token: &str) -> Result<UserProfile, ApiError>;

    /// Fails with `ApiError::Conflict` when the username or email is taken
    async fn check_availability(&self, username: &str, email: &str) -> Result<(), ApiError>;
}

/// API client for the BitDrop backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    initial_backoff: Duration,
}

impl ApiClient {
    /// Create a new API client for `config.api_base`
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self::with_client(client, &config.api_base))
    }

    /// Share an existing connection pool
    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    /// Override the first rate-limit backoff delay
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Response bodies that are not JSON read as an empty object
    async fn parse_json<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, ApiError> {
        let text = response.text().await?;
        let text = if text.trim().is_empty() { "{}" } else { text.as_str() };
        serde_json::from_str(text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", url, e)))
    }

    async fn get<T: DeserializeOwned>(&self, url: &str, token: Option<&str>) -> Result<T, ApiError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let mut request = self.client.get(url);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            let response = request.send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Self::parse_json(response, url).await,
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}

#[async_trait]
impl ProfileApi for ApiClient {
    async fn fetch_profile(&self, token: &str) -> Result<UserProfile, ApiError> {
        let url = self.url("/profile");
        let profile: UserProfile = self.get(&url, Some(token)).await?;
        debug!(user_id = ?profile.user_id(), "Fetched profile");
        Ok(profile)
    }

    async fn check_availability(&self, username: &str, email: &str) -> Result<(), ApiError> {
        let mut url = reqwest::Url::parse(&self.url("/check-availability"))
            .map_err(|e| ApiError::InvalidResponse(format!("Invalid API base URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("username", username)
            .append_pair("email", email);

        let response: AvailabilityResponse = self.get(url.as_str(), None).await?;
        debug!(message = ?response.message, "Username and email are available");
        Ok(())
    }
}
