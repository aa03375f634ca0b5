use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::fields::FieldErrors;

/// The guest selector offers 1 through 4 and a single "5+" choice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GuestCount {
    One,
    Two,
    Three,
    Four,
    FivePlus,
}

impl GuestCount {
    pub fn from_selection(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            3 => Some(Self::Three),
            4 => Some(Self::Four),
            5 => Some(Self::FivePlus),
            _ => None,
        }
    }

    pub fn as_selection(&self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
            Self::Four => 4,
            Self::FivePlus => 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookingDatesForm {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guests: u8,
}

impl BookingDatesForm {
    pub fn validate(&self) -> Result<GuestCount, FieldErrors> {
        let mut errors = FieldErrors::new();

        if self.check_out <= self.check_in {
            errors.push("check_out", "check-out must be after check-in");
        }

        let guests = GuestCount::from_selection(self.guests);
        if guests.is_none() {
            errors.push("guests", "guest count must be between 1 and 5+");
        }

        match guests {
            Some(guests) if errors.is_empty() => Ok(guests),
            _ => Err(errors),
        }
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn checkout_must_be_strictly_after_checkin() {
        let form = BookingDatesForm {
            check_in: date(2026, 9, 10),
            check_out: date(2026, 9, 10),
            guests: 2,
        };
        let errors = form.validate().unwrap_err();
        assert!(errors.message_for("check_out").is_some());

        let form = BookingDatesForm {
            check_in: date(2026, 9, 10),
            check_out: date(2026, 9, 8),
            guests: 2,
        };
        assert!(form.validate().is_err());
    }

    #[test]
    fn valid_stay_reports_nights() {
        let form = BookingDatesForm {
            check_in: date(2026, 9, 10),
            check_out: date(2026, 9, 13),
            guests: 5,
        };
        assert_eq!(form.validate().unwrap(), GuestCount::FivePlus);
        assert_eq!(form.nights(), 3);
    }

    #[test]
    fn guest_count_is_bounded() {
        for guests in [0u8, 6, 12] {
            let form = BookingDatesForm {
                check_in: date(2026, 9, 10),
                check_out: date(2026, 9, 12),
                guests,
            };
            assert!(form.validate().unwrap_err().message_for("guests").is_some());
        }
    }
}
