use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ApiError;

/// Message shown when nothing more specific can be said
pub const GENERIC_ERROR_MESSAGE: &str = "Something went wrong. Please try again.";

/// Form field an error is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub enum Field {
    Username,
    Email,
    Password,
    ConfirmPassword,
    /// Not tied to an input; rendered above the form
    Form,
}

impl Field {
    pub fn label(self) -> &'static str {
        match self {
            Field::Username => "Username",
            Field::Email => "Email",
            Field::Password => "Password",
            Field::ConfirmPassword => "Confirm password",
            Field::Form => "Form",
        }
    }

    /// Parse a wire field name
    pub fn from_name(name: &str) -> Option<Field> {
        match name.trim().to_ascii_lowercase().as_str() {
            "username" => Some(Field::Username),
            "email" => Some(Field::Email),
            "password" => Some(Field::Password),
            _ => None,
        }
    }

    /// Find the field mentioned in a free-text server message.
    /// Only for backends that send no structured field.
    pub(crate) fn named_in(message: &str) -> Option<Field> {
        let lower = message.to_lowercase();
        if lower.contains("username") {
            Some(Field::Username)
        } else if lower.contains("email") {
            Some(Field::Email)
        } else {
            None
        }
    }
}

/// Field-level messages for a form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<Field, String>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: Field, message: impl Into<String>) {
        self.0.insert(field, message.into());
    }

    pub fn with(mut self, field: Field, message: impl Into<String>) -> Self {
        self.insert(field, message);
        self
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.0.get(&field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Field, &str)> {
        self.0.iter().map(|(field, msg)| (*field, msg.as_str()))
    }

    /// Ok when empty, otherwise a validation error
    pub fn into_result(self) -> Result<(), AuthError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(AuthError::Validation(self))
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, message) in self.iter() {
            // Blank messages only highlight the field
            if message.trim().is_empty() {
                continue;
            }
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", field.label(), message)?;
            first = false;
        }
        Ok(())
    }
}

/// Errors surfaced by `SessionManager` operations.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid input: {0}")]
    Validation(FieldErrors),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("{} is already taken", .field.label())]
    AccountExists { field: Field },

    #[error("Auth provider reported success but issued no access token")]
    NoToken,

    #[error("Signed in, but failed to fetch profile: {0}")]
    ProfileFetchFailed(#[source] ApiError),

    #[error("Auth provider error: {0}")]
    Provider(String),
}

impl AuthError {
    /// Translate into the messages a form shows next to its inputs
    pub fn field_errors(&self) -> FieldErrors {
        match self {
            AuthError::Validation(errors) => errors.clone(),
            AuthError::InvalidCredentials => FieldErrors::new()
                .with(Field::Email, " ")
                .with(Field::Password, "Invalid credentials"),
            AuthError::AccountExists { field: Field::Username } => {
                FieldErrors::new().with(Field::Username, "Username is already taken")
            }
            AuthError::AccountExists { field: Field::Email } => {
                FieldErrors::new().with(Field::Email, "Email is already in use")
            }
            AuthError::AccountExists { field } => {
                FieldErrors::new().with(*field, format!("{} is already taken", field.label()))
            }
            AuthError::NoToken => FieldErrors::new()
                .with(Field::Email, " ")
                .with(Field::Password, "Unexpected error. No token received."),
            AuthError::ProfileFetchFailed(_) => FieldErrors::new()
                .with(Field::Email, " ")
                .with(Field::Password, "Login succeeded, but failed to fetch profile"),
            AuthError::Provider(_) => FieldErrors::new().with(Field::Form, GENERIC_ERROR_MESSAGE),
        }
    }

    /// Whether the user can fix this by editing the form
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            AuthError::Validation(_) | AuthError::InvalidCredentials | AuthError::AccountExists { .. }
        )
    }
}

/// Structured failure reasons an auth provider reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The email/password pair was rejected
    InvalidCredentials,
    /// Registration clashed with an existing account on this field
    Conflict(Field),
    /// The provider could not be reached
    Network,
    Other,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Other, message)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_decode() {
            ProviderErrorKind::Other
        } else {
            ProviderErrorKind::Network
        };
        Self::new(kind, err.to_string())
    }
}

impl From<ProviderError> for AuthError {
    fn from(err: ProviderError) -> Self {
        match err.kind {
            ProviderErrorKind::InvalidCredentials => AuthError::InvalidCredentials,
            ProviderErrorKind::Conflict(field) => AuthError::AccountExists { field },
            ProviderErrorKind::Network | ProviderErrorKind::Other => AuthError::Provider(err.message),
        }
    }
}
