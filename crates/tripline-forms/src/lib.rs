pub mod alert;
pub mod booking;
pub mod fields;
pub mod payment;
pub mod payout;
pub mod registration;

pub use alert::{AlertType, PriceAlertForm};
pub use booking::{BookingDatesForm, GuestCount};
pub use fields::FieldErrors;
pub use payment::PaymentCardForm;
pub use payout::PayoutRequestForm;
pub use registration::RegistrationForm;
