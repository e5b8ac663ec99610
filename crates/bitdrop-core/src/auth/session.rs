use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Buffer before expiry at which a session should be refreshed (60 seconds)
const TOKEN_REFRESH_BUFFER_SECS: i64 = 60;

/// Credential bundle issued by the auth provider.
///
/// Only `access_token` is guaranteed. A session restored from storage
/// carries nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Session {
    /// Build a bare session around a persisted access token
    pub fn from_token(token: impl Into<String>) -> Self {
        Self {
            access_token: token.into(),
            refresh_token: None,
            expires_at: None,
            user_id: None,
            email: None,
        }
    }

    pub fn token(&self) -> &str {
        &self.access_token
    }

    /// A session without an expiry never expires locally; the profile API
    /// is the judge of those.
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() >= at).unwrap_or(false)
    }

    /// Check if the session will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        self.expires_at
            .map(|at| Utc::now() + Duration::seconds(TOKEN_REFRESH_BUFFER_SECS) >= at)
            .unwrap_or(false)
    }

    /// Usable means a non-empty token that has not expired
    pub fn is_usable(&self) -> bool {
        !self.access_token.is_empty() && !self.is_expired()
    }
}

/// Authentication phase gating which view hierarchy is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub enum AuthStatus {
    /// Before the first session check resolves
    #[default]
    Unknown,
    Authenticated,
    Unauthenticated,
}

/// Top-level view hierarchy a presentation layer renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub enum RootView {
    Loading,
    Main,
    AuthFlow,
}

impl AuthStatus {
    pub fn root_view(self) -> RootView {
        match self {
            AuthStatus::Unknown => RootView::Loading,
            AuthStatus::Authenticated => RootView::Main,
            AuthStatus::Unauthenticated => RootView::AuthFlow,
        }
    }

    pub fn is_authenticated(self) -> bool {
        self == AuthStatus::Authenticated
    }
}

/// What subscribers of a `SessionManager` observe.
///
/// `epoch` grows by one on every applied transition. A consumer that started
/// work against an older epoch should drop its result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthSnapshot {
    pub status: AuthStatus,
    pub session: Option<Session>,
    pub epoch: u64,
}

impl AuthSnapshot {
    pub fn token(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_view_follows_status() {
        assert_eq!(AuthStatus::Unknown.root_view(), RootView::Loading);
        assert_eq!(AuthStatus::Authenticated.root_view(), RootView::Main);
        assert_eq!(AuthStatus::Unauthenticated.root_view(), RootView::AuthFlow);
    }

    #[test]
    fn test_session_without_expiry_never_expires() {
        let session = Session::from_token("tok123");
        assert!(!session.is_expired());
        assert!(!session.needs_refresh());
        assert!(session.is_usable());
    }

    #[test]
    fn test_session_expiry() {
        let mut session = Session::from_token("tok");
        session.expires_at = Some(Utc::now() - Duration::minutes(1));
        assert!(session.is_expired());
        assert!(!session.is_usable());

        session.expires_at = Some(Utc::now() + Duration::seconds(30));
        assert!(!session.is_expired());
        assert!(session.needs_refresh());

        session.expires_at = Some(Utc::now() + Duration::hours(1));
        assert!(!session.needs_refresh());
    }

    #[test]
    fn test_empty_token_is_not_usable() {
        assert!(!Session::from_token("").is_usable());
    }

    #[test]
    fn test_session_json_skips_missing_fields() {
        let json = serde_json::to_string(&Session::from_token("abc")).unwrap();
        assert_eq!(json, r#"{"access_token":"abc"}"#);

        let parsed: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Session::from_token("abc"));
    }

    #[test]
    fn test_auth_status_serializes_camel_case() {
        let json = serde_json::to_string(&AuthStatus::Unauthenticated).unwrap();
        assert_eq!(json, r#""unauthenticated""#);
    }
}
