use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tripline_core::{AffiliateStatus, PayoutMethod, PayoutStatus};
use uuid::Uuid;

/// Every response body is `{ success, data?, message? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn ok_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
        }
    }
}

impl ApiEnvelope<serde_json::Value> {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn failure_with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: false,
            data: Some(data),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub pages: i64,
}

/// List payloads carry their page count alongside the items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

impl<T> Paginated<T> {
    pub fn new(items: Vec<T>, total: i64, per_page: i64) -> Self {
        let per_page = per_page.max(1);
        Self {
            items,
            pagination: Pagination {
                pages: (total + per_page - 1) / per_page,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAffiliateRequest {
    pub payout_method: Option<String>,
    pub payout_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAffiliateResponse {
    pub affiliate_id: Uuid,
    pub referral_code: String,
    pub status: AffiliateStatus,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyAffiliateResponse {
    pub affiliate_id: Uuid,
    pub status: AffiliateStatus,
    pub verified: bool,
    pub already_verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAffiliateStatusRequest {
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectWithReasonRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletePayoutRequest {
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayoutRequest {
    pub amount: Decimal,
    pub method: String,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayoutResponse {
    pub payout_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub method: PayoutMethod,
    pub status: PayoutStatus,
    pub requested_at: DateTime<Utc>,
    /// Balance left after earmarking this request.
    pub available_balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfirmedEvent {
    pub booking_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingCancelledEvent {
    pub booking_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutCompletedEvent {
    pub payout_id: Uuid,
    pub affiliate_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub transaction_id: Option<String>,
}

/// Outbound mail is handed to the notification relay over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailNotification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_rounds_page_count_up() {
        assert_eq!(Paginated::new(vec![1, 2, 3], 3, 20).pagination.pages, 1);
        assert_eq!(Paginated::new(vec![1], 41, 20).pagination.pages, 3);
        assert_eq!(Paginated::<i32>::new(vec![], 0, 20).pagination.pages, 0);
    }

    #[test]
    fn failure_envelope_carries_message_only() {
        let envelope = ApiEnvelope::failure("no permission");
        assert!(!envelope.success);
        assert!(envelope.data.is_none());
        assert_eq!(envelope.message.as_deref(), Some("no permission"));
    }
}
