//! Authentication module for managing the user session.
//!
//! This module provides:
//! - `SessionManager`: the auth state machine (`Unknown`, `Authenticated`,
//!   `Unauthenticated`) and the sign-in, sign-up, restore and sign-out flows
//! - `AuthProvider`: the seam to the remote identity service, implemented
//!   over HTTP by `SupabaseAuth`
//! - `TokenStore`: persisted access token storage (keychain, file, memory)
//!
//! The access token is persisted under `TOKEN_KEY` and validated against the
//! profile API when a new process restores it.

pub mod error;
pub mod manager;
pub mod provider;
pub mod session;
pub mod storage;
pub mod supabase;
pub mod validation;

pub use error::{AuthError, Field, FieldErrors, ProviderError, ProviderErrorKind};
pub use manager::{SessionManager, SignedIn};
pub use provider::{AuthProvider, OAuthProvider, SessionEvent, SessionEventKind, SignUpDetails};
pub use session::{AuthSnapshot, AuthStatus, RootView, Session};
pub use storage::{FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenStore, TOKEN_KEY};
pub use supabase::SupabaseAuth;
