use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::{AffiliateStatus, CommissionStatus, PayoutMethod, PayoutStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Affiliate {
    pub id: Uuid,
    pub user_id: Uuid,
    pub referral_code: String,
    pub level: i32,
    pub status: AffiliateStatus,
    pub verified: bool,
    pub total_earnings: Decimal,
    pub total_referrals: i64,
    pub total_clicks: i64,
    pub payout_method: PayoutMethod,
    pub payout_email: Option<String>,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commission {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub booking_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub level: i32,
    pub status: CommissionStatus,
    pub decision_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub method: PayoutMethod,
    pub status: PayoutStatus,
    pub transaction_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
}
