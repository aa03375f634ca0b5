pub mod config;
pub mod contracts;
pub mod db;
pub mod redis_bus;

pub use config::ServiceConfig;
pub use contracts::{
    ApiEnvelope, BookingCancelledEvent, BookingConfirmedEvent, CompletePayoutRequest,
    EmailNotification, Paginated, Pagination, PayoutCompletedEvent, RegisterAffiliateRequest,
    RegisterAffiliateResponse, RejectWithReasonRequest, RequestPayoutRequest,
    RequestPayoutResponse, UpdateAffiliateStatusRequest, VerifyAffiliateResponse,
};
pub use db::connect_database;
pub use redis_bus::{
    CHANNEL_BOOKINGS_CANCELLED, CHANNEL_BOOKINGS_CONFIRMED, CHANNEL_NOTIFICATIONS_EMAIL,
    CHANNEL_PAYOUTS_COMPLETED, RedisBus,
};
