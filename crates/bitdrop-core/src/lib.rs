//! BitDrop core library.
//!
//! This crate owns the client-side session lifecycle of the BitDrop app:
//!
//! - `auth`: `SessionManager`, the auth provider seam and its Supabase
//!   implementation, token storage, validation and the error taxonomy
//! - `api`: `ApiClient` for the BitDrop backend (profile, availability)
//! - `config`: endpoint and storage configuration
//!
//! Presentation layers hold a `SessionManager`, call `start()` once, and
//! render whatever `AuthStatus::root_view()` says.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, ProfileApi, UserProfile};
pub use auth::{
    AuthError, AuthProvider, AuthSnapshot, AuthStatus, Field, FieldErrors, RootView, Session,
    SessionManager, SignedIn, TokenStore,
};
pub use config::Config;
