//! REST API client module for the BitDrop backend.
//!
//! This module provides the `ApiClient` for fetching the signed-in user's
//! profile and checking username/email availability during sign-up.
//!
//! Profile requests carry the auth provider's access token as a bearer token,
//! which also makes the profile endpoint a token-validity check.

pub mod client;
pub mod error;

pub use client::{ApiClient, ProfileApi, UserProfile};
pub use error::ApiError;
