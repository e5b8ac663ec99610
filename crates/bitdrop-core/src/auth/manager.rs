//! Session lifecycle: the single owner of `AuthStatus` and the current
//! `Session`.
//!
//! Transitions come from two directions. Explicit operations (`sign_in`,
//! `sign_up`, `restore_session`, `sign_out`) do their own token bookkeeping,
//! and provider session-change events are applied by a background listener.
//! Whichever resolves last wins; every applied transition bumps the
//! snapshot epoch.

use std::sync::{Arc, OnceLock};

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::{AuthError, ProviderErrorKind};
use super::provider::{AuthProvider, OAuthProvider, SessionEvent, SessionEventKind, SignUpDetails};
use super::session::{AuthSnapshot, AuthStatus, Session};
use super::storage::{TokenStore, TOKEN_KEY};
use super::validation;
use crate::api::{ApiError, ProfileApi, UserProfile};

/// Result of a successful sign-in.
///
/// The session is valid even when `profile` holds an error; the profile fetch
/// is best-effort.
#[derive(Debug)]
pub struct SignedIn {
    pub session: Session,
    pub profile: Result<UserProfile, ApiError>,
}

impl SignedIn {
    /// Non-fatal problem the caller should still show
    pub fn warning(self) -> Option<AuthError> {
        self.profile.err().map(AuthError::ProfileFetchFailed)
    }
}

struct Inner {
    provider: Arc<dyn AuthProvider>,
    profiles: Arc<dyn ProfileApi>,
    store: Arc<dyn TokenStore>,
    state: watch::Sender<AuthSnapshot>,
    restore_lock: Mutex<()>,
}

impl Inner {
    /// Publish a transition unless it changes nothing observable
    fn transition(&self, status: AuthStatus, session: Option<Session>) -> bool {
        self.state.send_if_modified(|snapshot| {
            let same_token = snapshot.token() == session.as_ref().map(Session::token);
            if snapshot.status == status && same_token {
                return false;
            }
            debug!(from = ?snapshot.status, to = ?status, "Auth status transition");
            snapshot.status = status;
            snapshot.session = session;
            snapshot.epoch += 1;
            true
        })
    }

    fn current_token(&self) -> Option<String> {
        self.state.borrow().token().map(str::to_string)
    }

    async fn persist_token(&self, token: &str) {
        if let Err(e) = self.store.set(TOKEN_KEY, token).await {
            warn!(error = %e, "Failed to persist access token");
        }
    }

    async fn clear_token(&self) {
        if let Err(e) = self.store.remove(TOKEN_KEY).await {
            warn!(error = %e, "Failed to clear persisted access token");
        }
    }

    async fn apply_event(&self, event: SessionEvent) {
        debug!(kind = ?event.kind, has_session = event.session.is_some(), "Session event");

        match event.session.filter(Session::is_usable) {
            Some(session) => {
                if self.current_token().as_deref() != Some(session.token()) {
                    self.persist_token(session.token()).await;
                }
                if self.transition(AuthStatus::Authenticated, Some(session)) {
                    info!(kind = ?event.kind, "Session established by auth provider");
                }
            }
            None => {
                let status = self.state.borrow().status;
                // The startup check owns the first transition
                if status == AuthStatus::Unknown {
                    return;
                }
                if status == AuthStatus::Authenticated {
                    self.clear_token().await;
                }
                if self.transition(AuthStatus::Unauthenticated, None) {
                    info!(kind = ?event.kind, "Session ended by auth provider");
                }
            }
        }
    }

    async fn listen(self: Arc<Self>, mut events: broadcast::Receiver<SessionEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.apply_event(event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed session events, resynchronizing");
                    match self.provider.get_session().await {
                        Ok(session) => {
                            self.apply_event(SessionEvent {
                                kind: SessionEventKind::InitialSession,
                                session,
                            })
                            .await
                        }
                        Err(e) => warn!(error = %e, "Failed to resynchronize session"),
                    }
                }
                Err(RecvError::Closed) => {
                    debug!("Session event stream closed");
                    break;
                }
            }
        }
    }
}

/// Owns the authentication state of the application.
///
/// Share it behind an `Arc`. Hosts call `start()` once and render from
/// `subscribe()` or `status_changes()`.
pub struct SessionManager {
    inner: Arc<Inner>,
    listener: OnceLock<JoinHandle<()>>,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn AuthProvider>,
        profiles: Arc<dyn ProfileApi>,
        store: Arc<dyn TokenStore>,
    ) -> Self {
        let (state, _) = watch::channel(AuthSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                provider,
                profiles,
                store,
                state,
                restore_lock: Mutex::new(()),
            }),
            listener: OnceLock::new(),
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn status(&self) -> AuthStatus {
        self.inner.state.borrow().status
    }

    pub fn is_authenticated(&self) -> bool {
        self.status().is_authenticated()
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.state.borrow().session.clone()
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.inner.state.subscribe()
    }

    /// The current status, then every change of status
    pub fn status_changes(&self) -> impl Stream<Item = AuthStatus> + Send + 'static {
        let mut rx = self.subscribe();
        let current = rx.borrow_and_update().status;

        futures::stream::unfold(
            (rx, Some(current), current),
            |(mut rx, pending, last)| async move {
                if let Some(status) = pending {
                    return Some((status, (rx, None, last)));
                }
                loop {
                    if rx.changed().await.is_err() {
                        return None;
                    }
                    let status = rx.borrow_and_update().status;
                    if status != last {
                        return Some((status, (rx, None, status)));
                    }
                }
            },
        )
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Subscribe to provider events and resolve the initial status.
    /// Only the first call does anything.
    pub async fn start(&self) -> AuthStatus {
        let mut first = false;
        self.listener.get_or_init(|| {
            first = true;
            let events = self.inner.provider.on_session_change();
            tokio::spawn(Arc::clone(&self.inner).listen(events))
        });
        if !first {
            return self.status();
        }

        match self.inner.provider.get_session().await {
            Ok(Some(session)) if session.is_usable() => {
                info!("Existing session found");
                self.inner.transition(AuthStatus::Authenticated, Some(session));
            }
            Ok(_) => {
                debug!("No provider session, checking persisted token");
                self.restore_session().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to query auth provider session");
                self.restore_session().await;
            }
        }
        self.status()
    }

    /// Stop listening for provider events. Also happens on drop.
    pub fn shutdown(&self) {
        if let Some(handle) = self.listener.get() {
            handle.abort();
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignedIn, AuthError> {
        validation::validate_sign_in(email, password).into_result()?;

        let session = match self.inner.provider.sign_in_with_password(email, password).await {
            Ok(Some(session)) if !session.access_token.is_empty() => session,
            Ok(_) => {
                error!("Auth provider accepted credentials but issued no access token");
                return Err(AuthError::NoToken);
            }
            Err(e) => {
                warn!(error = %e, "Sign-in failed");
                return Err(match e.kind {
                    ProviderErrorKind::InvalidCredentials => AuthError::InvalidCredentials,
                    _ => AuthError::Provider(e.message),
                });
            }
        };

        self.inner.persist_token(session.token()).await;

        let profile = self.inner.profiles.fetch_profile(session.token()).await;
        if let Err(ref e) = profile {
            warn!(error = %e, "Signed in, but failed to fetch profile");
        }

        self.inner
            .transition(AuthStatus::Authenticated, Some(session.clone()));
        info!("Signed in");
        Ok(SignedIn { session, profile })
    }

    /// Create an account, then sign in with the same credentials.
    pub async fn sign_up(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<SignedIn, AuthError> {
        validation::validate_sign_up(username, email, password).into_result()?;

        let details = SignUpDetails {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        };
        if let Err(e) = self.inner.provider.sign_up(&details).await {
            warn!(error = %e, "Sign-up failed");
            return Err(match e.kind {
                ProviderErrorKind::Conflict(field) => AuthError::AccountExists { field },
                _ => AuthError::Provider(e.message),
            });
        }
        info!("Account created, signing in");

        self.sign_in(email, password).await.map_err(|e| {
            error!(partial_sign_up = true, error = %e, "Account created, but sign-in failed");
            AuthError::Provider(format!("Account created, but sign-in failed: {}", e))
        })
    }

    /// Ask the backend whether a username/email pair is still free
    pub async fn check_availability(&self, username: &str, email: &str) -> Result<(), AuthError> {
        validation::validate_identity(username, email).into_result()?;

        match self.inner.profiles.check_availability(username, email).await {
            Ok(()) => Ok(()),
            Err(ApiError::Conflict { field: Some(field), .. }) => {
                Err(AuthError::AccountExists { field })
            }
            Err(e) => {
                warn!(error = %e, "Availability check failed");
                Err(AuthError::Provider(e.to_string()))
            }
        }
    }

    /// Bring back the session of a previous process from the persisted token.
    ///
    /// Never fails: a rejected token is cleared and the status falls back to
    /// `Unauthenticated`.
    pub async fn restore_session(&self) -> Option<Session> {
        let _guard = self.inner.restore_lock.lock().await;

        let token = match self.inner.store.get(TOKEN_KEY).await {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to read persisted access token");
                None
            }
        };

        let Some(token) = token else {
            debug!("No persisted access token");
            if self.status() == AuthStatus::Unknown {
                self.inner.transition(AuthStatus::Unauthenticated, None);
            }
            return None;
        };

        let check = self.inner.profiles.fetch_profile(&token).await;
        match check {
            Ok(profile) => {
                let session = self
                    .session()
                    .filter(|s| s.token() == token)
                    .unwrap_or_else(|| Session::from_token(token));
                // Hand the session to the provider so sign-out can revoke it
                self.inner.provider.set_session(session.clone()).await;
                self.inner
                    .transition(AuthStatus::Authenticated, Some(session.clone()));
                info!(user_id = ?profile.user_id(), "Session restored");
                Some(session)
            }
            Err(e) => {
                info!(error = %e, "Persisted access token rejected, clearing it");
                self.inner.clear_token().await;
                self.inner.transition(AuthStatus::Unauthenticated, None);
                None
            }
        }
    }

    /// Best-effort remote, authoritative local: always ends `Unauthenticated`.
    pub async fn sign_out(&self) {
        if let Err(e) = self.inner.provider.sign_out().await {
            warn!(error = %e, "Remote sign-out failed, clearing local session anyway");
        }
        self.inner.clear_token().await;
        self.inner.transition(AuthStatus::Unauthenticated, None);
        info!("Signed out");
    }

    /// URL to open for an external sign-in. The session arrives later as a
    /// provider event.
    pub fn begin_oauth(&self, provider: OAuthProvider) -> Result<String, AuthError> {
        self.inner
            .provider
            .authorize_url(provider)
            .map_err(AuthError::from)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
