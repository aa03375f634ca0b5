use serde::Deserialize;

use crate::fields::{FieldErrors, looks_like_email};

const MIN_NAME_LEN: usize = 2;
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationForm {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    #[serde(default)]
    pub accepted_terms: bool,
}

impl RegistrationForm {
    pub fn validate(&self) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();

        if self.first_name.trim().chars().count() < MIN_NAME_LEN {
            errors.push("first_name", "first name must be at least 2 characters");
        }
        if self.last_name.trim().chars().count() < MIN_NAME_LEN {
            errors.push("last_name", "last name must be at least 2 characters");
        }
        if !looks_like_email(&self.email) {
            errors.push("email", "enter a valid email address");
        }

        validate_password(&self.password, &mut errors);

        if self.confirm_password != self.password {
            errors.push("confirm_password", "passwords do not match");
        }
        if !self.accepted_terms {
            errors.push("accepted_terms", "you must accept the terms of service");
        }

        errors.into_result()
    }
}

/// Shared with the reset-password flow, which re-checks the same strength
/// rules without the rest of the registration fields.
pub fn validate_password(password: &str, errors: &mut FieldErrors) {
    if password.chars().count() < MIN_PASSWORD_LEN {
        errors.push("password", "password must be at least 8 characters");
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        errors.push("password", "password must contain an uppercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        errors.push("password", "password must contain a lowercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        errors.push("password", "password must contain a digit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_form() -> RegistrationForm {
        RegistrationForm {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: "ada@example.com".to_string(),
            password: "S3curePass".to_string(),
            confirm_password: "S3curePass".to_string(),
            accepted_terms: true,
        }
    }

    #[test]
    fn accepts_a_complete_form() {
        assert!(valid_form().validate().is_ok());
    }

    #[test]
    fn mismatched_confirmation_blocks_submission() {
        let mut form = valid_form();
        form.confirm_password = "S3curePasz".to_string();
        let errors = form.validate().unwrap_err();
        assert!(errors.message_for("confirm_password").is_some());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn weak_passwords_block_submission() {
        for (password, why) in [
            ("S3cure", "too short"),
            ("s3curepass", "no uppercase"),
            ("S3CUREPASS", "no lowercase"),
            ("SecurePass", "no digit"),
        ] {
            let mut form = valid_form();
            form.password = password.to_string();
            form.confirm_password = password.to_string();
            let errors = form.validate().unwrap_err();
            assert!(errors.message_for("password").is_some(), "{why}");
        }
    }

    #[test]
    fn names_must_have_two_characters_after_trimming() {
        let mut form = valid_form();
        form.first_name = " A ".to_string();
        let errors = form.validate().unwrap_err();
        assert!(errors.message_for("first_name").is_some());
    }

    #[test]
    fn terms_must_be_accepted() {
        let mut form = valid_form();
        form.accepted_terms = false;
        assert!(
            form.validate()
                .unwrap_err()
                .message_for("accepted_terms")
                .is_some()
        );
    }

    #[test]
    fn every_failing_field_is_reported_at_once() {
        let form = RegistrationForm {
            first_name: "A".to_string(),
            last_name: String::new(),
            email: "not-an-email".to_string(),
            password: "short".to_string(),
            confirm_password: "different".to_string(),
            accepted_terms: false,
        };
        let errors = form.validate().unwrap_err();
        assert_eq!(errors.len(), 6);
    }
}
