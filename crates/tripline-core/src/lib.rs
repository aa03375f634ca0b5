pub mod models;
pub mod schedule;
pub mod status;

pub use models::{Affiliate, Commission, Payout};
pub use schedule::{CommissionSchedule, ThreeTierSchedule};
pub use status::{
    AffiliateCommand, AffiliateStatus, CommissionStatus, PayoutMethod, PayoutStatus,
    TransitionError,
};
