//! The seam between `SessionManager` and the remote identity service.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::error::ProviderError;
use super::session::Session;

/// Why the provider's session changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// Pushed by the provider whenever its notion of the current session changes.
/// `session: None` means there is no active session anymore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session: Option<Session>,
}

impl SessionEvent {
    pub fn signed_in(session: Session) -> Self {
        Self {
            kind: SessionEventKind::SignedIn,
            session: Some(session),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            kind: SessionEventKind::SignedOut,
            session: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignUpDetails {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// External identity providers that complete through a browser redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthProvider {
    Google,
    Apple,
    Github,
}

impl OAuthProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::Apple => "apple",
            OAuthProvider::Github => "github",
        }
    }
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OAuthProvider {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(OAuthProvider::Google),
            "apple" => Ok(OAuthProvider::Apple),
            "github" => Ok(OAuthProvider::Github),
            other => Err(ProviderError::other(format!("unsupported OAuth provider: {}", other))),
        }
    }
}

/// Remote authentication service.
///
/// `sign_in_with_password` returns `Ok(None)` when the provider accepted the
/// credentials without issuing a session.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<Session>, ProviderError>;

    /// Create an account. Does not establish a session.
    async fn sign_up(&self, details: &SignUpDetails) -> Result<(), ProviderError>;

    async fn get_session(&self) -> Result<Option<Session>, ProviderError>;

    /// Adopt a session established outside the provider, such as one
    /// restored from a persisted token. Emits no event.
    async fn set_session(&self, session: Session);

    async fn sign_out(&self) -> Result<(), ProviderError>;

    /// Subscribe to session changes. Dropping the receiver unsubscribes.
    fn on_session_change(&self) -> broadcast::Receiver<SessionEvent>;

    /// URL the user must visit to sign in with an external identity.
    /// The resulting session arrives as a `SessionEvent`.
    fn authorize_url(&self, provider: OAuthProvider) -> Result<String, ProviderError>;
}
