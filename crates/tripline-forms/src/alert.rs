use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::fields::FieldErrors;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Hotel,
    Flight,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hotel => "hotel",
            Self::Flight => "flight",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hotel" => Some(Self::Hotel),
            "flight" => Some(Self::Flight),
            _ => None,
        }
    }
}

/// Hotel alerts need a stay window, flight alerts an outbound/return pair.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceAlertForm {
    pub alert_type: String,
    pub destination: String,
    pub target_price: Decimal,
    pub check_in: Option<NaiveDate>,
    pub check_out: Option<NaiveDate>,
    pub depart_on: Option<NaiveDate>,
    pub return_on: Option<NaiveDate>,
}

impl PriceAlertForm {
    pub fn validate(&self) -> Result<AlertType, FieldErrors> {
        let mut errors = FieldErrors::new();

        let alert_type = AlertType::parse(&self.alert_type);
        if alert_type.is_none() {
            errors.push("alert_type", "alert type must be hotel or flight");
        }

        if self.destination.trim().is_empty() {
            errors.push("destination", "destination is required");
        }
        if self.target_price <= Decimal::ZERO {
            errors.push("target_price", "target price must be greater than zero");
        }

        match alert_type {
            Some(AlertType::Hotel) => {
                if self.check_in.is_none() {
                    errors.push("check_in", "check-in date is required for hotel alerts");
                }
                if self.check_out.is_none() {
                    errors.push("check_out", "check-out date is required for hotel alerts");
                }
                if let (Some(check_in), Some(check_out)) = (self.check_in, self.check_out)
                    && check_out <= check_in
                {
                    errors.push("check_out", "check-out must be after check-in");
                }
            }
            Some(AlertType::Flight) => {
                if self.depart_on.is_none() {
                    errors.push("depart_on", "departure date is required for flight alerts");
                }
                if self.return_on.is_none() {
                    errors.push("return_on", "return date is required for flight alerts");
                }
                if let (Some(depart_on), Some(return_on)) = (self.depart_on, self.return_on)
                    && return_on < depart_on
                {
                    errors.push("return_on", "return date cannot precede departure");
                }
            }
            None => {}
        }

        match alert_type {
            Some(alert_type) if errors.is_empty() => Ok(alert_type),
            _ => Err(errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn hotel_alert() -> PriceAlertForm {
        PriceAlertForm {
            alert_type: "hotel".to_string(),
            destination: "Lisbon".to_string(),
            target_price: Decimal::new(12000, 2),
            check_in: Some(date(2026, 10, 1)),
            check_out: Some(date(2026, 10, 5)),
            depart_on: None,
            return_on: None,
        }
    }

    #[test]
    fn hotel_alert_requires_stay_dates() {
        let mut alert = hotel_alert();
        alert.check_out = None;
        let errors = alert.validate().unwrap_err();
        assert!(errors.message_for("check_out").is_some());
        assert!(errors.message_for("check_in").is_none());
    }

    #[test]
    fn flight_alert_requires_travel_dates() {
        let alert = PriceAlertForm {
            alert_type: "FLIGHT".to_string(),
            destination: "Tokyo".to_string(),
            target_price: Decimal::new(65000, 2),
            check_in: None,
            check_out: None,
            depart_on: None,
            return_on: None,
        };
        let errors = alert.validate().unwrap_err();
        assert!(errors.message_for("depart_on").is_some());
        assert!(errors.message_for("return_on").is_some());
    }

    #[test]
    fn target_price_must_be_positive() {
        let mut alert = hotel_alert();
        alert.target_price = Decimal::ZERO;
        assert!(
            alert
                .validate()
                .unwrap_err()
                .message_for("target_price")
                .is_some()
        );
    }

    #[test]
    fn destination_is_required() {
        let mut alert = hotel_alert();
        alert.destination = "  ".to_string();
        assert!(
            alert
                .validate()
                .unwrap_err()
                .message_for("destination")
                .is_some()
        );
    }

    #[test]
    fn valid_alerts_pass() {
        assert_eq!(hotel_alert().validate().unwrap(), AlertType::Hotel);
    }
}
