use serde::Deserialize;

use crate::fields::FieldErrors;

/// Card capture for checkout. Validation is syntactic only: shape of the
/// number, expiry, and CVV. No checksum is computed here; the actual
/// charge (and any real validation) belongs to the payment gateway
/// collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentCardForm {
    pub card_number: String,
    pub holder_name: String,
    /// MM/YY
    pub expiry: String,
    pub cvv: String,
}

impl PaymentCardForm {
    pub fn validate(&self) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();

        let digits = normalized_card_number(&self.card_number);
        if digits.is_empty() {
            errors.push("card_number", "card number is required");
        } else if digits.len() < 12
            || digits.len() > 19
            || !digits.chars().all(|c| c.is_ascii_digit())
        {
            errors.push("card_number", "card number looks invalid");
        }

        if self.holder_name.trim().is_empty() {
            errors.push("holder_name", "card holder name is required");
        }

        if !is_valid_expiry(&self.expiry) {
            errors.push("expiry", "expiry must be in MM/YY format");
        }

        let cvv = self.cvv.trim();
        if cvv.len() < 3 || cvv.len() > 4 || !cvv.chars().all(|c| c.is_ascii_digit()) {
            errors.push("cvv", "CVV must be 3 or 4 digits");
        }

        errors.into_result()
    }

    /// The only part of the pan retained anywhere.
    pub fn last_four(&self) -> String {
        let digits = normalized_card_number(&self.card_number);
        let skip = digits.chars().count().saturating_sub(4);
        digits.chars().skip(skip).collect()
    }
}

fn normalized_card_number(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace() && *c != '-').collect()
}

fn is_valid_expiry(raw: &str) -> bool {
    let raw = raw.trim();
    let Some((month, year)) = raw.split_once('/') else {
        return false;
    };
    if month.len() != 2 || year.len() != 2 {
        return false;
    }
    if !month.chars().all(|c| c.is_ascii_digit()) || !year.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }

    matches!(month.parse::<u8>(), Ok(1..=12))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_card() -> PaymentCardForm {
        PaymentCardForm {
            card_number: "4242 4242 4242 4242".to_string(),
            holder_name: "Ada Lovelace".to_string(),
            expiry: "08/27".to_string(),
            cvv: "123".to_string(),
        }
    }

    #[test]
    fn accepts_a_plausible_card() {
        assert!(valid_card().validate().is_ok());
        assert_eq!(valid_card().last_four(), "4242");
    }

    #[test]
    fn rejects_malformed_expiry() {
        for expiry in ["0827", "8/27", "13/27", "00/27", "08/2027", "aa/bb"] {
            let mut card = valid_card();
            card.expiry = expiry.to_string();
            let errors = card.validate().unwrap_err();
            assert!(errors.message_for("expiry").is_some(), "{expiry}");
        }
    }

    #[test]
    fn rejects_bad_cvv() {
        for cvv in ["12", "12345", "12a"] {
            let mut card = valid_card();
            card.cvv = cvv.to_string();
            assert!(card.validate().unwrap_err().message_for("cvv").is_some());
        }
    }

    #[test]
    fn rejects_empty_number_and_holder() {
        let mut card = valid_card();
        card.card_number = "  ".to_string();
        card.holder_name = String::new();
        let errors = card.validate().unwrap_err();
        assert_eq!(
            errors.message_for("card_number"),
            Some("card number is required")
        );
        assert!(errors.message_for("holder_name").is_some());
    }

    #[test]
    fn no_checksum_is_applied() {
        // Any digit string of plausible length passes; the gateway decides.
        let mut card = valid_card();
        card.card_number = "1111 1111 1111 1111".to_string();
        assert!(card.validate().is_ok());
    }
}
