//! Client-side checks run before any request leaves the device.

use std::sync::OnceLock;

use regex::Regex;

use super::error::{Field, FieldErrors};

/// Minimum password length accepted on the sign-in form
pub const MIN_SIGN_IN_PASSWORD_LEN: usize = 6;

/// Minimum password length for new accounts
pub const MIN_SIGN_UP_PASSWORD_LEN: usize = 8;

/// Minimum username length for new accounts
pub const MIN_USERNAME_LEN: usize = 3;

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\S+@\S+\.\S+").expect("email pattern is valid"))
}

fn check_email(email: &str, errors: &mut FieldErrors) {
    if email.is_empty() {
        errors.insert(Field::Email, "Email is required");
    } else if !email_pattern().is_match(email) {
        errors.insert(Field::Email, "Email is invalid");
    }
}

fn check_password(password: &str, min_len: usize, errors: &mut FieldErrors) {
    if password.is_empty() {
        errors.insert(Field::Password, "Password is required");
    } else if password.chars().count() < min_len {
        errors.insert(
            Field::Password,
            format!("Password must be at least {} characters", min_len),
        );
    }
}

pub fn validate_sign_in(email: &str, password: &str) -> FieldErrors {
    let mut errors = FieldErrors::new();
    check_email(email, &mut errors);
    check_password(password, MIN_SIGN_IN_PASSWORD_LEN, &mut errors);
    errors
}

/// Username and email only; the first step of the sign-up form
pub fn validate_identity(username: &str, email: &str) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if username.is_empty() {
        errors.insert(Field::Username, "Username is required");
    } else if username.chars().count() < MIN_USERNAME_LEN {
        errors.insert(
            Field::Username,
            format!("Username must be at least {} characters", MIN_USERNAME_LEN),
        );
    }
    check_email(email, &mut errors);
    errors
}

pub fn validate_sign_up(username: &str, email: &str, password: &str) -> FieldErrors {
    let mut errors = validate_identity(username, email);
    check_password(password, MIN_SIGN_UP_PASSWORD_LEN, &mut errors);
    errors
}

pub fn validate_password_confirmation(password: &str, confirm: &str) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if confirm.is_empty() {
        errors.insert(Field::ConfirmPassword, "Confirm password is required");
    } else if password != confirm {
        errors.insert(Field::ConfirmPassword, "Passwords do not match");
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_in_accepts_valid_pair() {
        assert!(validate_sign_in("a@b.com", "wrongpw").is_empty());
    }

    #[test]
    fn test_sign_in_requires_fields() {
        let errors = validate_sign_in("", "");
        assert_eq!(errors.get(Field::Email), Some("Email is required"));
        assert_eq!(errors.get(Field::Password), Some("Password is required"));
    }

    #[test]
    fn test_sign_in_rejects_bad_email_and_short_password() {
        let errors = validate_sign_in("not-an-email", "12345");
        assert_eq!(errors.get(Field::Email), Some("Email is invalid"));
        assert_eq!(
            errors.get(Field::Password),
            Some("Password must be at least 6 characters")
        );
    }

    #[test]
    fn test_sign_up_thresholds() {
        assert!(validate_sign_up("alice", "a@b.com", "pw123456").is_empty());

        let errors = validate_sign_up("al", "a@b.com", "pw12345");
        assert_eq!(
            errors.get(Field::Username),
            Some("Username must be at least 3 characters")
        );
        assert_eq!(
            errors.get(Field::Password),
            Some("Password must be at least 8 characters")
        );
        assert_eq!(errors.get(Field::Email), None);
    }

    #[test]
    fn test_password_confirmation() {
        assert!(validate_password_confirmation("pw123456", "pw123456").is_empty());
        assert_eq!(
            validate_password_confirmation("pw123456", "pw1234567").get(Field::ConfirmPassword),
            Some("Passwords do not match")
        );
        assert_eq!(
            validate_password_confirmation("pw123456", "").get(Field::ConfirmPassword),
            Some("Confirm password is required")
        );
    }
}
