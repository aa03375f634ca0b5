use rust_decimal::Decimal;

/// Commission-rate tier lookup. The level on an affiliate record selects
/// the rate applied to bookings referred through it; levels past
/// `max_depth` earn nothing.
pub trait CommissionSchedule {
    fn name(&self) -> &'static str;
    fn max_depth(&self) -> i32;
    fn rate_for_level(&self, level: i32) -> Decimal;
}

/// 5% / 2% / 1% over three tiers.
#[derive(Debug, Clone, Default)]
pub struct ThreeTierSchedule;

impl CommissionSchedule for ThreeTierSchedule {
    fn name(&self) -> &'static str {
        "three-tier"
    }

    fn max_depth(&self) -> i32 {
        3
    }

    fn rate_for_level(&self, level: i32) -> Decimal {
        match level {
            1 => Decimal::new(5, 2),
            2 => Decimal::new(2, 2),
            3 => Decimal::new(1, 2),
            _ => Decimal::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_decay_with_depth_and_stop_past_max() {
        let schedule = ThreeTierSchedule;
        assert_eq!(schedule.rate_for_level(1), Decimal::new(5, 2));
        assert_eq!(schedule.rate_for_level(2), Decimal::new(2, 2));
        assert_eq!(schedule.rate_for_level(3), Decimal::new(1, 2));
        assert_eq!(schedule.rate_for_level(4), Decimal::ZERO);
        assert_eq!(schedule.rate_for_level(0), Decimal::ZERO);
    }
}
