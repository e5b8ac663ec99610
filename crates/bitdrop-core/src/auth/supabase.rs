//! `AuthProvider` over the Supabase GoTrue REST API.
//!
//! Keeps the current session in memory and broadcasts a `SessionEvent` on
//! every change, the way the JavaScript client's `onAuthStateChange` does.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use super::error::{Field, ProviderError, ProviderErrorKind};
use super::provider::{AuthProvider, OAuthProvider, SessionEvent, SessionEventKind, SignUpDetails};
use super::session::Session;
use crate::config::Config;

/// Buffered session events per subscriber before it starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    user: Option<UserResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct UserResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// GoTrue has sent errors in a few shapes over time
#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct SignUpRequest<'a> {
    email: &'a str,
    password: &'a str,
    data: SignUpMetadata<'a>,
}

#[derive(Serialize)]
struct SignUpMetadata<'a> {
    username: &'a str,
}

fn expiry(expires_at: Option<i64>, expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    expires_at
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .or_else(|| expires_in.map(|secs| Utc::now() + chrono::Duration::seconds(secs)))
}

impl TokenResponse {
    /// None when no usable access token was issued
    fn into_session(self) -> Option<Session> {
        let access_token = self.access_token.filter(|t| !t.is_empty())?;
        let user = self.user.unwrap_or_default();
        Some(Session {
            access_token,
            refresh_token: self.refresh_token,
            expires_at: expiry(self.expires_at, self.expires_in),
            user_id: user.id,
            email: user.email,
        })
    }
}

impl ErrorResponse {
    fn message(self, fallback: String) -> String {
        self.msg
            .or(self.error_description)
            .or(self.message)
            .or(self.error)
            .unwrap_or(fallback)
    }
}

/// Map a GoTrue error body to a structured kind by its error code
fn map_error(status: reqwest::StatusCode, body: &str) -> ProviderError {
    let parsed: ErrorResponse = serde_json::from_str(body).unwrap_or_default();
    let code = parsed
        .error_code
        .clone()
        .or_else(|| parsed.error.clone())
        .unwrap_or_default();

    let kind = match code.as_str() {
        "invalid_credentials" | "invalid_grant" => ProviderErrorKind::InvalidCredentials,
        "user_already_exists" | "email_exists" => ProviderErrorKind::Conflict(Field::Email),
        "username_exists" => ProviderErrorKind::Conflict(Field::Username),
        _ => ProviderErrorKind::Other,
    };
    ProviderError::new(kind, parsed.message(format!("Auth provider returned {}", status)))
}

pub struct SupabaseAuth {
    client: Client,
    base_url: String,
    anon_key: String,
    redirect_to: Option<String>,
    current: RwLock<Option<Session>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SupabaseAuth {
    pub fn new(config: &Config) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self::with_client(client, &config.supabase_url, &config.supabase_anon_key))
    }

    pub fn with_client(client: Client, base_url: &str, anon_key: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            redirect_to: None,
            current: RwLock::new(None),
            events,
        }
    }

    /// Where the provider sends the browser after an OAuth sign-in
    pub fn with_redirect_to(mut self, redirect_to: impl Into<String>) -> Self {
        self.redirect_to = Some(redirect_to.into());
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1{}", self.base_url, path)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn set_current(&self, session: Option<Session>, kind: SessionEventKind) {
        *self.current.write().await = session.clone();
        self.emit(SessionEvent { kind, session });
    }

    async fn check_response(response: Response) -> Result<Response, ProviderError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(map_error(status, &body))
        }
    }

    async fn token_grant<B: Serialize + ?Sized>(
        &self,
        grant_type: &str,
        body: &B,
    ) -> Result<Option<Session>, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("/token"))
            .query(&[("grant_type", grant_type)])
            .header("apikey", &self.anon_key)
            .json(body)
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        let token: TokenResponse = response.json().await?;
        Ok(token.into_session())
    }

    /// Exchange the refresh token for a new session
    pub async fn refresh_session(&self) -> Result<Option<Session>, ProviderError> {
        let refresh_token = match self.current.read().await.as_ref() {
            Some(session) => session.refresh_token.clone(),
            None => return Ok(None),
        };
        let Some(refresh_token) = refresh_token else {
            return Ok(None);
        };

        let session = self
            .token_grant("refresh_token", &RefreshGrant { refresh_token: &refresh_token })
            .await?;
        if session.is_some() {
            debug!("Session refreshed");
            self.set_current(session.clone(), SessionEventKind::TokenRefreshed).await;
        }
        Ok(session)
    }

    /// Finish an OAuth sign-in from the URL the provider redirected to.
    /// The tokens travel in the fragment (implicit flow).
    pub async fn complete_oauth_redirect(&self, redirect_url: &str) -> Result<Session, ProviderError> {
        let url = Url::parse(redirect_url)
            .map_err(|e| ProviderError::other(format!("Invalid redirect URL: {}", e)))?;
        let params = url.fragment().or_else(|| url.query()).unwrap_or_default();

        let mut token = TokenResponse::default();
        let mut error = ErrorResponse::default();
        for (key, value) in url::form_urlencoded::parse(params.as_bytes()) {
            match key.as_ref() {
                "access_token" => token.access_token = Some(value.into_owned()),
                "refresh_token" => token.refresh_token = Some(value.into_owned()),
                "expires_in" => token.expires_in = value.parse().ok(),
                "expires_at" => token.expires_at = value.parse().ok(),
                "error" => error.error = Some(value.into_owned()),
                "error_code" => error.error_code = Some(value.into_owned()),
                "error_description" => error.error_description = Some(value.into_owned()),
                _ => {}
            }
        }

        if error.error.is_some() || error.error_code.is_some() {
            return Err(ProviderError::other(
                error.message("OAuth sign-in was not completed".to_string()),
            ));
        }

        let session = token
            .into_session()
            .ok_or_else(|| ProviderError::other("OAuth redirect carried no access token"))?;
        info!("OAuth sign-in completed");
        self.set_current(Some(session.clone()), SessionEventKind::SignedIn)
            .await;
        Ok(session)
    }
}

#[async_trait]
impl AuthProvider for SupabaseAuth {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<Session>, ProviderError> {
        let session = self
            .token_grant("password", &PasswordGrant { email, password })
            .await?;
        if session.is_some() {
            self.set_current(session.clone(), SessionEventKind::SignedIn).await;
        }
        Ok(session)
    }

    async fn sign_up(&self, details: &SignUpDetails) -> Result<(), ProviderError> {
        let body = SignUpRequest {
            email: &details.email,
            password: &details.password,
            data: SignUpMetadata {
                username: &details.username,
            },
        };
        let response = self
            .client
            .post(self.endpoint("/signup"))
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await?;
        Self::check_response(response).await?;
        debug!("Account created");
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, ProviderError> {
        let current = self.current.read().await.clone();
        let Some(session) = current else {
            return Ok(None);
        };
        if !session.needs_refresh() || session.refresh_token.is_none() {
            return Ok(Some(session));
        }

        match self.refresh_session().await {
            Ok(Some(refreshed)) => Ok(Some(refreshed)),
            Ok(None) => Ok(Some(session).filter(|s| !s.is_expired())),
            Err(e) if e.kind == ProviderErrorKind::Network && !session.is_expired() => {
                warn!(error = %e, "Session refresh failed, keeping current session");
                Ok(Some(session))
            }
            Err(e) => {
                warn!(error = %e, "Session refresh rejected, signing out");
                self.set_current(None, SessionEventKind::SignedOut).await;
                Ok(None)
            }
        }
    }

    async fn set_session(&self, session: Session) {
        debug!("Adopting restored session");
        *self.current.write().await = Some(session);
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        let previous = self.current.write().await.take();
        let result = match previous {
            Some(session) => {
                let response = self
                    .client
                    .post(self.endpoint("/logout"))
                    .header("apikey", &self.anon_key)
                    .bearer_auth(session.token())
                    .send()
                    .await;
                match response {
                    Ok(response) => Self::check_response(response).await.map(|_| ()),
                    Err(e) => Err(e.into()),
                }
            }
            None => Ok(()),
        };
        self.emit(SessionEvent::signed_out());
        result
    }

    fn on_session_change(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn authorize_url(&self, provider: OAuthProvider) -> Result<String, ProviderError> {
        let mut url = Url::parse(&self.endpoint("/authorize"))
            .map_err(|e| ProviderError::other(format!("Invalid auth provider URL: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("provider", provider.as_str());
            if let Some(ref redirect_to) = self.redirect_to {
                query.append_pair("redirect_to", redirect_to);
            }
        }
        Ok(url.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn auth_for(server: &MockServer) -> SupabaseAuth {
        SupabaseAuth::with_client(Client::new(), &server.uri(), "anon-key")
    }

    fn token_body(token: &str) -> serde_json::Value {
        serde_json::json!({
            "access_token": token,
            "refresh_token": "refresh-1",
            "expires_in": 3600,
            "user": {"id": "user-1", "email": "a@b.com"}
        })
    }

    #[test]
    fn test_map_error_codes() {
        let status = reqwest::StatusCode::BAD_REQUEST;
        let err = map_error(
            status,
            r#"{"code":400,"error_code":"invalid_credentials","msg":"Invalid login credentials"}"#,
        );
        assert_eq!(err.kind, ProviderErrorKind::InvalidCredentials);
        assert_eq!(err.message, "Invalid login credentials");

        let err = map_error(
            status,
            r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#,
        );
        assert_eq!(err.kind, ProviderErrorKind::InvalidCredentials);

        let err = map_error(reqwest::StatusCode::UNPROCESSABLE_ENTITY, r#"{"error_code":"user_already_exists"}"#);
        assert_eq!(err.kind, ProviderErrorKind::Conflict(Field::Email));

        let err = map_error(reqwest::StatusCode::UNPROCESSABLE_ENTITY, r#"{"error_code":"username_exists"}"#);
        assert_eq!(err.kind, ProviderErrorKind::Conflict(Field::Username));

        let err = map_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "oops");
        assert_eq!(err.kind, ProviderErrorKind::Other);
        assert!(err.message.contains("500"));
    }

    #[test]
    fn test_token_response_without_token_has_no_session() {
        let response: TokenResponse = serde_json::from_str(r#"{"access_token":""}"#).unwrap();
        assert!(response.into_session().is_none());
    }

    #[tokio::test]
    async fn test_sign_in_sets_session_and_emits_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .and(header("apikey", "anon-key"))
            .and(body_json(serde_json::json!({"email": "a@b.com", "password": "secret1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok123")))
            .mount(&server)
            .await;

        let auth = auth_for(&server);
        let mut events = auth.on_session_change();

        let session = auth
            .sign_in_with_password("a@b.com", "secret1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.token(), "tok123");
        assert_eq!(session.user_id.as_deref(), Some("user-1"));
        assert!(session.expires_at.is_some());

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, SessionEventKind::SignedIn);
        assert_eq!(event.session.as_ref().map(Session::token), Some("tok123"));

        let current = auth.get_session().await.unwrap().unwrap();
        assert_eq!(current.token(), "tok123");
    }

    #[tokio::test]
    async fn test_sign_in_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"error_code": "invalid_credentials", "msg": "Invalid login credentials"})),
            )
            .mount(&server)
            .await;

        let auth = auth_for(&server);
        let err = auth.sign_in_with_password("a@b.com", "wrongpw").await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::InvalidCredentials);
        assert!(auth.get_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sign_up_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_json(serde_json::json!({"error_code": "email_exists", "msg": "Email address already registered"})),
            )
            .mount(&server)
            .await;

        let details = SignUpDetails {
            username: "alice".into(),
            email: "a@b.com".into(),
            password: "pw123456".into(),
        };
        let err = auth_for(&server).sign_up(&details).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Conflict(Field::Email));
    }

    #[tokio::test]
    async fn test_sign_up_sends_username_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .and(body_json(serde_json::json!({
                "email": "a@b.com",
                "password": "pw123456",
                "data": {"username": "alice"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "user-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let auth = auth_for(&server);
        let details = SignUpDetails {
            username: "alice".into(),
            email: "a@b.com".into(),
            password: "pw123456".into(),
        };
        auth.sign_up(&details).await.unwrap();
        assert!(auth.get_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sign_out_clears_session_even_when_request_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok123")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .and(header("authorization", "Bearer tok123"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let auth = auth_for(&server);
        auth.sign_in_with_password("a@b.com", "secret1").await.unwrap();
        let mut events = auth.on_session_change();

        assert!(auth.sign_out().await.is_err());
        assert!(auth.get_session().await.unwrap().is_none());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::signed_out());
    }

    #[tokio::test]
    async fn test_sign_out_revokes_restored_session() {
        use crate::api::ApiClient;
        use crate::auth::manager::SessionManager;
        use crate::auth::session::AuthStatus;
        use crate::auth::storage::{MemoryTokenStore, TokenStore, TOKEN_KEY};
        use std::sync::Arc;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/profile"))
            .and(header("authorization", "Bearer tok123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"userId": "user-1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .and(header("authorization", "Bearer tok123"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let auth = Arc::new(auth_for(&server));
        let api = Arc::new(ApiClient::with_client(Client::new(), &format!("{}/api", server.uri())));
        let store = Arc::new(MemoryTokenStore::with_token("tok123"));
        let manager = SessionManager::new(auth.clone(), api, store.clone());

        assert_eq!(manager.start().await, AuthStatus::Authenticated);
        assert_eq!(
            auth.get_session().await.unwrap().as_ref().map(Session::token),
            Some("tok123")
        );

        manager.sign_out().await;
        assert_eq!(manager.status(), AuthStatus::Unauthenticated);
        assert_eq!(store.get(TOKEN_KEY).await.unwrap(), None);
        assert!(auth.get_session().await.unwrap().is_none());
    }

    #[test]
    fn test_authorize_url() {
        let auth = SupabaseAuth::with_client(Client::new(), "https://xyz.supabase.co/", "anon")
            .with_redirect_to("bitdrop://auth-callback");
        let url = auth.authorize_url(OAuthProvider::Google).unwrap();
        assert_eq!(
            url,
            "https://xyz.supabase.co/auth/v1/authorize?provider=google&redirect_to=bitdrop%3A%2F%2Fauth-callback"
        );
    }

    #[tokio::test]
    async fn test_complete_oauth_redirect() {
        let auth = SupabaseAuth::with_client(Client::new(), "https://xyz.supabase.co", "anon");
        let mut events = auth.on_session_change();

        let session = auth
            .complete_oauth_redirect(
                "bitdrop://auth-callback#access_token=oauth-tok&refresh_token=r1&expires_in=3600&token_type=bearer",
            )
            .await
            .unwrap();
        assert_eq!(session.token(), "oauth-tok");
        assert_eq!(session.refresh_token.as_deref(), Some("r1"));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, SessionEventKind::SignedIn);
        assert_eq!(auth.get_session().await.unwrap(), Some(session));
    }

    #[tokio::test]
    async fn test_complete_oauth_redirect_error() {
        let auth = SupabaseAuth::with_client(Client::new(), "https://xyz.supabase.co", "anon");
        let err = auth
            .complete_oauth_redirect("bitdrop://auth-callback#error=access_denied&error_description=User+cancelled")
            .await
            .unwrap_err();
        assert_eq!(err.message, "User cancelled");

        assert!(auth
            .complete_oauth_redirect("bitdrop://auth-callback#token_type=bearer")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_get_session_refreshes_near_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .and(body_json(serde_json::json!({"refresh_token": "r1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("fresh")))
            .expect(1)
            .mount(&server)
            .await;

        let auth = auth_for(&server);
        auth.complete_oauth_redirect("bitdrop://cb#access_token=stale&refresh_token=r1&expires_in=10")
            .await
            .unwrap();
        let mut events = auth.on_session_change();

        let session = auth.get_session().await.unwrap().unwrap();
        assert_eq!(session.token(), "fresh");
        assert_eq!(events.recv().await.unwrap().kind, SessionEventKind::TokenRefreshed);
    }
}
