use rust_decimal::Decimal;
use serde::Deserialize;
use tripline_core::PayoutMethod;

use crate::fields::FieldErrors;

/// Payout request guard. `available_balance` must be fetched immediately
/// before validation; a stale cached balance defeats the whole check.
#[derive(Debug, Clone, Deserialize)]
pub struct PayoutRequestForm {
    pub amount: Decimal,
    pub method: String,
    pub available_balance: Decimal,
    pub minimum_payout: Decimal,
}

impl PayoutRequestForm {
    pub fn validate(&self) -> Result<PayoutMethod, FieldErrors> {
        let mut errors = FieldErrors::new();

        let method = PayoutMethod::parse(&self.method).ok();
        if method.is_none() {
            errors.push("method", "payout method must be paypal, bank_transfer, or card");
        }

        if self.amount <= Decimal::ZERO {
            errors.push("amount", "amount must be greater than zero");
        } else if self.amount > self.available_balance {
            errors.push("amount", "insufficient balance");
        } else if self.amount < self.minimum_payout {
            errors.push(
                "amount",
                format!("amount is below the minimum payout of {}", self.minimum_payout),
            );
        }

        match method {
            Some(method) if errors.is_empty() => Ok(method),
            _ => Err(errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(amount: &str) -> PayoutRequestForm {
        PayoutRequestForm {
            amount: amount.parse().unwrap(),
            method: "paypal".to_string(),
            available_balance: "120.00".parse().unwrap(),
            minimum_payout: "10.00".parse().unwrap(),
        }
    }

    #[test]
    fn amount_within_balance_passes() {
        assert_eq!(form("100.00").validate().unwrap(), PayoutMethod::Paypal);
        assert_eq!(form("120.00").validate().unwrap(), PayoutMethod::Paypal);
    }

    #[test]
    fn amount_over_balance_reports_insufficient_balance() {
        let errors = form("150.00").validate().unwrap_err();
        assert_eq!(errors.message_for("amount"), Some("insufficient balance"));
    }

    #[test]
    fn zero_and_negative_amounts_are_rejected() {
        for amount in ["0", "-5.00"] {
            let errors = form(amount).validate().unwrap_err();
            assert_eq!(
                errors.message_for("amount"),
                Some("amount must be greater than zero")
            );
        }
    }

    #[test]
    fn amount_below_program_minimum_is_rejected() {
        let errors = form("5.00").validate().unwrap_err();
        assert!(
            errors
                .message_for("amount")
                .unwrap()
                .contains("minimum payout")
        );
    }

    #[test]
    fn unknown_method_is_rejected() {
        let mut bad = form("50.00");
        bad.method = "cheque".to_string();
        assert!(bad.validate().unwrap_err().message_for("method").is_some());
    }
}
