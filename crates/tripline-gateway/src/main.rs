use std::{net::SocketAddr, sync::Arc};

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::{error, info};
use tripline_core::{
    Affiliate, AffiliateCommand, AffiliateStatus, Commission, CommissionSchedule,
    CommissionStatus, Payout, PayoutMethod, PayoutStatus, ThreeTierSchedule, TransitionError,
};
use tripline_forms::{
    BookingDatesForm, FieldErrors, PaymentCardForm, PayoutRequestForm, PriceAlertForm,
    RegistrationForm, registration::validate_password,
};
use tripline_platform::{
    ApiEnvelope, BookingCancelledEvent, BookingConfirmedEvent, CHANNEL_BOOKINGS_CANCELLED,
    CHANNEL_BOOKINGS_CONFIRMED, CHANNEL_NOTIFICATIONS_EMAIL, CHANNEL_PAYOUTS_COMPLETED,
    CompletePayoutRequest, EmailNotification, Paginated, PayoutCompletedEvent, RedisBus,
    RegisterAffiliateRequest, RegisterAffiliateResponse, RejectWithReasonRequest,
    RequestPayoutRequest, RequestPayoutResponse, ServiceConfig, UpdateAffiliateStatusRequest,
    VerifyAffiliateResponse, connect_database,
};
use tripline_session::{RedisSessionStore, Role, Session, SessionStore};
use uuid::Uuid;

const SESSION_COOKIE: &str = "tripline_session";
const DEFAULT_CURRENCY: &str = "USD";
const RESET_TOKEN_TTL_HOURS: i64 = 2;
const VERIFY_TOKEN_TTL_HOURS: i64 = 48;
const REFERRAL_CODE_ATTEMPTS: u32 = 4;
const RECENT_COMMISSIONS_LIMIT: i64 = 10;
const DEFAULT_MIN_PAYOUT_CENTS: i64 = 1000;

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    redis: RedisBus,
    sessions: Arc<dyn SessionStore>,
    public_base_url: String,
    session_ttl: Duration,
}

/// Failure responses render as `{ success: false, message, data? }` where
/// `data` carries field-scoped validation messages when present.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    fields: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope = match self.fields {
            Some(fields) => ApiEnvelope::failure_with_data(self.message, fields),
            None => ApiEnvelope::failure(self.message),
        };
        (self.status, Json(envelope)).into_response()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterUserRequest {
    first_name: String,
    last_name: String,
    email: String,
    password: String,
    confirm_password: String,
    #[serde(default)]
    accepted_terms: bool,
    referral_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct UserView {
    user_id: Uuid,
    email: String,
    first_name: String,
    last_name: String,
    email_verified: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ForgotPasswordRequest {
    email: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ResetPasswordRequest {
    token: String,
    password: String,
    confirm_password: String,
}

#[derive(Debug, Clone, Deserialize)]
struct VerifyEmailRequest {
    token: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateBookingRequest {
    kind: String,
    destination: String,
    check_in: NaiveDate,
    check_out: NaiveDate,
    guests: u8,
    /// Per-night price for hotels, per-seat fare for flights.
    unit_price: Decimal,
    currency: Option<String>,
    referral_code: Option<String>,
    card: PaymentCardForm,
}

#[derive(Debug, Clone, Serialize)]
struct BookingView {
    booking_id: Uuid,
    kind: String,
    destination: String,
    check_in: NaiveDate,
    check_out: NaiveDate,
    guests: i32,
    total_amount: Decimal,
    currency: String,
    status: String,
    card_holder: String,
    card_last_four: String,
    referral_code: Option<String>,
    created_at: DateTime<Utc>,
    cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
struct PriceAlertView {
    alert_id: Uuid,
    alert_type: String,
    destination: String,
    target_price: Decimal,
    check_in: Option<NaiveDate>,
    check_out: Option<NaiveDate>,
    depart_on: Option<NaiveDate>,
    return_on: Option<NaiveDate>,
    active: bool,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct ReferralClickResponse {
    landing_url: String,
}

#[derive(Debug, Clone, Serialize)]
struct ReferralLinkView {
    referral_code: String,
    share_url: String,
    total_clicks: i64,
    total_referrals: i64,
}

#[derive(Debug, Clone, Serialize)]
struct AffiliateDashboardView {
    referral_code: String,
    level: i32,
    status: AffiliateStatus,
    verified: bool,
    total_clicks: i64,
    total_referrals: i64,
    total_earnings: Decimal,
    pending_earnings: Decimal,
    approved_earnings: Decimal,
    available_balance: Decimal,
    recent_commissions: Vec<Commission>,
}

#[derive(Debug, Clone, Serialize)]
struct AffiliateSettingsView {
    payout_method: PayoutMethod,
    payout_email: Option<String>,
    minimum_payout: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateAffiliateSettingsRequest {
    payout_method: Option<String>,
    payout_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct AffiliateAdminView {
    affiliate_id: Uuid,
    user_id: Uuid,
    email: String,
    referral_code: String,
    level: i32,
    status: AffiliateStatus,
    verified: bool,
    total_earnings: Decimal,
    total_referrals: i64,
    total_clicks: i64,
    status_reason: Option<String>,
    created_at: DateTime<Utc>,
    activated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
struct ProgramSettingsView {
    require_verification: bool,
    minimum_payout: Decimal,
    max_tier_depth: i32,
    level_rates: Vec<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
struct PageQuery {
    page: Option<i64>,
    per_page: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct StatusPageQuery {
    status: Option<String>,
    page: Option<i64>,
    per_page: Option<i64>,
}

#[derive(Debug, Clone)]
struct ProgramSettings {
    require_verification: bool,
    minimum_payout: Decimal,
    max_tier_depth: i32,
    level_rates: Vec<Decimal>,
}

impl ProgramSettings {
    fn defaults() -> Self {
        let schedule = ThreeTierSchedule;
        Self {
            require_verification: true,
            minimum_payout: Decimal::new(DEFAULT_MIN_PAYOUT_CENTS, 2),
            max_tier_depth: schedule.max_depth(),
            level_rates: (1..=schedule.max_depth())
                .map(|level| schedule.rate_for_level(level))
                .collect(),
        }
    }
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tripline_gateway=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    let pool = connect_database(&config.database_url).await?;
    let redis = RedisBus::connect(&config.redis_url)?;
    let sessions: Arc<dyn SessionStore> =
        Arc::new(RedisSessionStore::new(redis.client().clone()));

    let state = AppState {
        pool,
        redis,
        sessions,
        public_base_url: config.public_base_url.clone(),
        session_ttl: Duration::seconds(config.session_ttl_secs),
    };

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/register", post(register_user))
        .route("/auth/login", post(login_user))
        .route("/auth/logout", post(logout_user))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
        .route("/auth/verify-email", post(verify_email))
        .route("/auth/verification-email", post(resend_verification_email))
        .route("/bookings", get(list_bookings).post(create_booking))
        .route(
            "/bookings/{booking_id}",
            get(get_booking).delete(cancel_booking),
        )
        .route(
            "/price-alerts",
            get(list_price_alerts).post(create_price_alert),
        )
        .route("/price-alerts/{alert_id}", delete(delete_price_alert))
        .route("/r/{code}", get(track_referral_click))
        .route("/affiliate/register", post(register_affiliate))
        .route("/affiliate/dashboard", get(affiliate_dashboard))
        .route("/affiliate/links", get(affiliate_links))
        .route(
            "/affiliate/settings",
            get(get_affiliate_settings).put(update_affiliate_settings),
        )
        .route("/affiliate/payouts", get(list_affiliate_payouts))
        .route("/affiliate/payouts/request", post(request_payout))
        .route("/admin/affiliates", get(list_admin_affiliates))
        .route("/admin/affiliates/{affiliate_id}", get(get_admin_affiliate))
        .route(
            "/admin/affiliates/{affiliate_id}/verify",
            patch(verify_affiliate),
        )
        .route(
            "/admin/affiliates/{affiliate_id}/status",
            patch(update_affiliate_status),
        )
        .route("/admin/commissions", get(list_admin_commissions))
        .route(
            "/admin/commissions/{commission_id}/approve",
            patch(approve_commission),
        )
        .route(
            "/admin/commissions/{commission_id}/reject",
            patch(reject_commission),
        )
        .route("/admin/payouts", get(list_admin_payouts))
        .route("/admin/payouts/{payout_id}/process", patch(process_payout))
        .route("/admin/payouts/{payout_id}/complete", patch(complete_payout))
        .route("/admin/payouts/{payout_id}/reject", patch(reject_payout))
        .route("/admin/settings", get(get_admin_settings))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn register_user(
    State(state): State<AppState>,
    Json(payload): Json<RegisterUserRequest>,
) -> Result<(HeaderMap, Json<ApiEnvelope<UserView>>), ApiError> {
    let form = RegistrationForm {
        first_name: payload.first_name.clone(),
        last_name: payload.last_name.clone(),
        email: payload.email.clone(),
        password: payload.password.clone(),
        confirm_password: payload.confirm_password.clone(),
        accepted_terms: payload.accepted_terms,
    };
    form.validate().map_err(validation_failed)?;

    let email = payload.email.trim().to_ascii_lowercase();
    let referrer = match referral_code_param(payload.referral_code.as_deref()) {
        Some(code) => {
            let referrer = lookup_active_affiliate(&state.pool, &code).await?;
            if referrer.is_none() {
                let mut errors = FieldErrors::new();
                errors.push("referral_code", "referral code is not valid");
                return Err(validation_failed(errors));
            }
            referrer
        }
        None => None,
    };

    let taken = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)",
    )
    .bind(&email)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;
    if taken {
        return Err(conflict("an account with this email already exists"));
    }

    let user_id = Uuid::new_v4();
    let salt = Uuid::new_v4().simple().to_string();
    let digest = password_digest(&salt, &payload.password);
    let now = Utc::now();

    let insert = sqlx::query(
        r#"
        INSERT INTO users (
            id, email, first_name, last_name, role, password_salt, password_digest,
            email_verified, referred_by_code, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, 'traveler', $5, $6, FALSE, $7, $8, $8)
        "#,
    )
    .bind(user_id)
    .bind(&email)
    .bind(payload.first_name.trim())
    .bind(payload.last_name.trim())
    .bind(&salt)
    .bind(&digest)
    .bind(referrer.as_ref().map(|r| r.referral_code.as_str()))
    .bind(now)
    .execute(&state.pool)
    .await;

    if let Err(err) = insert {
        if is_unique_violation(&err) {
            return Err(conflict("an account with this email already exists"));
        }
        return Err(internal_error(err));
    }

    if let Some(referrer) = &referrer {
        sqlx::query(
            "UPDATE affiliates SET total_referrals = total_referrals + 1, updated_at = $2 WHERE id = $1",
        )
        .bind(referrer.affiliate_id)
        .bind(now)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;
    }

    issue_email_verification(&state, user_id, &email).await?;

    let session = Session::issue(user_id, Role::Traveler, state.session_ttl);
    let cookie = session_cookie_headers(&session.token, state.session_ttl.num_seconds())?;
    state
        .sessions
        .create(session)
        .await
        .map_err(internal_error)?;

    Ok((
        cookie,
        Json(ApiEnvelope::ok_with_message(
            UserView {
                user_id,
                email,
                first_name: payload.first_name.trim().to_string(),
                last_name: payload.last_name.trim().to_string(),
                email_verified: false,
            },
            "account created; check your inbox to verify your email",
        )),
    ))
}

async fn login_user(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<(HeaderMap, Json<ApiEnvelope<UserView>>), ApiError> {
    let email = payload.email.trim().to_ascii_lowercase();
    let row = sqlx::query(
        r#"
        SELECT id, email, first_name, last_name, role, password_salt, password_digest, email_verified
        FROM users
        WHERE email = $1
        "#,
    )
    .bind(&email)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(invalid_credentials());
    };

    let salt: String = row.try_get("password_salt").map_err(internal_error)?;
    let stored: String = row.try_get("password_digest").map_err(internal_error)?;
    if password_digest(&salt, &payload.password) != stored {
        return Err(invalid_credentials());
    }

    let user_id: Uuid = row.try_get("id").map_err(internal_error)?;
    let role_raw: String = row.try_get("role").map_err(internal_error)?;
    let role = Role::parse(&role_raw).unwrap_or(Role::Traveler);

    let session = Session::issue(user_id, role, state.session_ttl);
    let cookie = session_cookie_headers(&session.token, state.session_ttl.num_seconds())?;
    state
        .sessions
        .create(session)
        .await
        .map_err(internal_error)?;

    Ok((
        cookie,
        Json(ApiEnvelope::ok(UserView {
            user_id,
            email: row.try_get("email").map_err(internal_error)?,
            first_name: row.try_get("first_name").map_err(internal_error)?,
            last_name: row.try_get("last_name").map_err(internal_error)?,
            email_verified: row.try_get("email_verified").map_err(internal_error)?,
        })),
    ))
}

async fn logout_user(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(HeaderMap, Json<ApiEnvelope<serde_json::Value>>), ApiError> {
    if let Some(token) = session_token_from_headers(&headers) {
        state
            .sessions
            .clear(&token)
            .await
            .map_err(internal_error)?;
    }

    let cookie = session_cookie_headers("", 0)?;
    Ok((
        cookie,
        Json(ApiEnvelope::ok_with_message(
            serde_json::json!({}),
            "signed out",
        )),
    ))
}

async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<Json<ApiEnvelope<serde_json::Value>>, ApiError> {
    let email = payload.email.trim().to_ascii_lowercase();

    let user_id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)?;

    // Whether or not the account exists, the caller sees the same message.
    if let Some(user_id) = user_id {
        let token = Uuid::new_v4().simple().to_string();
        sqlx::query(
            r#"
            INSERT INTO password_reset_tokens (id, user_id, token_digest, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(token_digest(&token))
        .bind(Utc::now() + Duration::hours(RESET_TOKEN_TTL_HOURS))
        .bind(Utc::now())
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;

        send_email(
            &state,
            &email,
            "Reset your Tripline password",
            format!(
                "Reset your password: {}/reset-password?token={}",
                state.public_base_url, token
            ),
        )
        .await;
    }

    Ok(Json(ApiEnvelope::ok_with_message(
        serde_json::json!({}),
        "if that email is registered, a reset link is on its way",
    )))
}

async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<ApiEnvelope<serde_json::Value>>, ApiError> {
    let mut errors = FieldErrors::new();
    validate_password(&payload.password, &mut errors);
    if payload.confirm_password != payload.password {
        errors.push("confirm_password", "passwords do not match");
    }
    errors.into_result().map_err(validation_failed)?;

    let now = Utc::now();
    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = sqlx::query(
        r#"
        SELECT id, user_id, expires_at, used_at
        FROM password_reset_tokens
        WHERE token_digest = $1
        FOR UPDATE
        "#,
    )
    .bind(token_digest(payload.token.trim()))
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(not_found("reset link is invalid or has expired"));
    };

    let token_id: Uuid = row.try_get("id").map_err(internal_error)?;
    let user_id: Uuid = row.try_get("user_id").map_err(internal_error)?;
    let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(internal_error)?;
    let used_at: Option<DateTime<Utc>> = row.try_get("used_at").map_err(internal_error)?;

    if used_at.is_some() || expires_at <= now {
        return Err(not_found("reset link is invalid or has expired"));
    }

    let salt = Uuid::new_v4().simple().to_string();
    sqlx::query(
        "UPDATE users SET password_salt = $2, password_digest = $3, updated_at = $4 WHERE id = $1",
    )
    .bind(user_id)
    .bind(&salt)
    .bind(password_digest(&salt, &payload.password))
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    sqlx::query("UPDATE password_reset_tokens SET used_at = $2 WHERE id = $1")
        .bind(token_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok_with_message(
        serde_json::json!({}),
        "password updated; log in with your new password",
    )))
}

async fn verify_email(
    State(state): State<AppState>,
    Json(payload): Json<VerifyEmailRequest>,
) -> Result<Json<ApiEnvelope<serde_json::Value>>, ApiError> {
    let now = Utc::now();
    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = sqlx::query(
        r#"
        SELECT id, user_id, expires_at, used_at
        FROM email_verification_tokens
        WHERE token_digest = $1
        FOR UPDATE
        "#,
    )
    .bind(token_digest(payload.token.trim()))
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(not_found("verification link is invalid or has expired"));
    };

    let token_id: Uuid = row.try_get("id").map_err(internal_error)?;
    let user_id: Uuid = row.try_get("user_id").map_err(internal_error)?;
    let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(internal_error)?;
    let used_at: Option<DateTime<Utc>> = row.try_get("used_at").map_err(internal_error)?;

    if used_at.is_some() || expires_at <= now {
        return Err(not_found("verification link is invalid or has expired"));
    }

    sqlx::query("UPDATE users SET email_verified = TRUE, updated_at = $2 WHERE id = $1")
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

    sqlx::query("UPDATE email_verification_tokens SET used_at = $2 WHERE id = $1")
        .bind(token_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok_with_message(
        serde_json::json!({}),
        "email verified",
    )))
}

async fn resend_verification_email(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<serde_json::Value>>, ApiError> {
    let session = require_session(&state, &headers).await?;

    let row = sqlx::query("SELECT email, email_verified FROM users WHERE id = $1")
        .bind(session.user_id)
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(not_found("account not found"));
    };

    let email: String = row.try_get("email").map_err(internal_error)?;
    let email_verified: bool = row.try_get("email_verified").map_err(internal_error)?;
    if email_verified {
        return Ok(Json(ApiEnvelope::ok_with_message(
            serde_json::json!({}),
            "email is already verified",
        )));
    }

    issue_email_verification(&state, session.user_id, &email).await?;

    Ok(Json(ApiEnvelope::ok_with_message(
        serde_json::json!({}),
        "verification email sent",
    )))
}

async fn create_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateBookingRequest>,
) -> Result<Json<ApiEnvelope<BookingView>>, ApiError> {
    let session = require_session(&state, &headers).await?;

    let kind = normalize_booking_kind(&payload.kind).map_err(invalid_request)?;

    let dates = BookingDatesForm {
        check_in: payload.check_in,
        check_out: payload.check_out,
        guests: payload.guests,
    };

    let mut errors = FieldErrors::new();
    let guests = match dates.validate() {
        Ok(guests) => Some(guests),
        Err(failed) => {
            errors.extend(failed);
            None
        }
    };
    if let Err(failed) = payload.card.validate() {
        errors.extend(failed);
    }
    if payload.destination.trim().is_empty() {
        errors.push("destination", "destination is required");
    }
    if payload.unit_price <= Decimal::ZERO {
        errors.push("unit_price", "price must be greater than zero");
    }
    errors.into_result().map_err(validation_failed)?;

    let guests = guests.ok_or_else(|| internal_error("guest count missing after validation"))?;
    let currency = payload
        .currency
        .as_deref()
        .map(normalize_currency)
        .transpose()
        .map_err(invalid_request)?
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    // Attribution is best-effort: an unknown or inactive code never blocks
    // the checkout, it just earns nobody a commission.
    let referral_code = match referral_code_param(payload.referral_code.as_deref()) {
        Some(code) => match lookup_active_affiliate(&state.pool, &code).await? {
            Some(affiliate) => Some(affiliate.referral_code),
            None => {
                info!("ignoring unknown referral code {code} on booking");
                None
            }
        },
        None => None,
    };

    let quantity = match kind.as_str() {
        "hotel" => Decimal::from(dates.nights()),
        _ => Decimal::from(guests.as_selection() as i64),
    };
    let total_amount = (payload.unit_price * quantity).round_dp(2);

    let booking_id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO bookings (
            id, user_id, kind, destination, check_in, check_out, guests, unit_price,
            total_amount, currency, card_holder, card_last_four, referral_code,
            status, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 'confirmed', $14, $14)
        "#,
    )
    .bind(booking_id)
    .bind(session.user_id)
    .bind(&kind)
    .bind(payload.destination.trim())
    .bind(payload.check_in)
    .bind(payload.check_out)
    .bind(guests.as_selection() as i32)
    .bind(payload.unit_price.round_dp(2))
    .bind(total_amount)
    .bind(&currency)
    .bind(payload.card.holder_name.trim())
    .bind(payload.card.last_four())
    .bind(referral_code.as_deref())
    .bind(now)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    let event = BookingConfirmedEvent { booking_id };
    if let Err(err) = state
        .redis
        .publish_json(CHANNEL_BOOKINGS_CONFIRMED, &event)
        .await
    {
        error!("failed to publish booking confirmation for {booking_id}: {err}");
    }

    Ok(Json(ApiEnvelope::ok(BookingView {
        booking_id,
        kind,
        destination: payload.destination.trim().to_string(),
        check_in: payload.check_in,
        check_out: payload.check_out,
        guests: guests.as_selection() as i32,
        total_amount,
        currency,
        status: "confirmed".to_string(),
        card_holder: payload.card.holder_name.trim().to_string(),
        card_last_four: payload.card.last_four(),
        referral_code,
        created_at: now,
        cancelled_at: None,
    })))
}

async fn list_bookings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<ApiEnvelope<Paginated<BookingView>>>, ApiError> {
    let session = require_session(&state, &headers).await?;
    let (per_page, offset) = pagination_params(query.page, query.per_page);

    let total =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM bookings WHERE user_id = $1")
            .bind(session.user_id)
            .fetch_one(&state.pool)
            .await
            .map_err(internal_error)?;

    let rows = sqlx::query(
        r#"
        SELECT id, kind, destination, check_in, check_out, guests, total_amount, currency,
               card_holder, card_last_four, referral_code, status, created_at, cancelled_at
        FROM bookings
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(session.user_id)
    .bind(per_page)
    .bind(offset)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(booking_view_from_row(&row)?);
    }

    Ok(Json(ApiEnvelope::ok(Paginated::new(items, total, per_page))))
}

async fn get_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<BookingView>>, ApiError> {
    let session = require_session(&state, &headers).await?;

    let row = sqlx::query(
        r#"
        SELECT id, user_id, kind, destination, check_in, check_out, guests, total_amount,
               currency, card_holder, card_last_four, referral_code, status, created_at,
               cancelled_at
        FROM bookings
        WHERE id = $1
        "#,
    )
    .bind(booking_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(not_found("booking not found"));
    };

    let owner: Uuid = row.try_get("user_id").map_err(internal_error)?;
    if owner != session.user_id && session.role != Role::Admin {
        return Err(forbidden());
    }

    Ok(Json(ApiEnvelope::ok(booking_view_from_row(&row)?)))
}

async fn cancel_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<BookingView>>, ApiError> {
    let session = require_session(&state, &headers).await?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let row = sqlx::query("SELECT user_id, status FROM bookings WHERE id = $1 FOR UPDATE")
        .bind(booking_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(not_found("booking not found"));
    };

    let owner: Uuid = row.try_get("user_id").map_err(internal_error)?;
    if owner != session.user_id {
        return Err(forbidden());
    }

    let status: String = row.try_get("status").map_err(internal_error)?;
    if status != "confirmed" {
        return Err(conflict("booking is already cancelled"));
    }

    let updated = sqlx::query(
        r#"
        UPDATE bookings
        SET status = 'cancelled', cancelled_at = $2, updated_at = $2
        WHERE id = $1
        RETURNING id, kind, destination, check_in, check_out, guests, total_amount, currency,
                  card_holder, card_last_four, referral_code, status, created_at, cancelled_at
        "#,
    )
    .bind(booking_id)
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    let event = BookingCancelledEvent { booking_id };
    if let Err(err) = state
        .redis
        .publish_json(CHANNEL_BOOKINGS_CANCELLED, &event)
        .await
    {
        error!("failed to publish booking cancellation for {booking_id}: {err}");
    }

    Ok(Json(ApiEnvelope::ok_with_message(
        booking_view_from_row(&updated)?,
        "booking cancelled",
    )))
}

async fn create_price_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<PriceAlertForm>,
) -> Result<Json<ApiEnvelope<PriceAlertView>>, ApiError> {
    let session = require_session(&state, &headers).await?;
    let alert_type = payload.validate().map_err(validation_failed)?;

    let alert_id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO price_alerts (
            id, user_id, alert_type, destination, target_price, check_in, check_out,
            depart_on, return_on, active, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, $10)
        "#,
    )
    .bind(alert_id)
    .bind(session.user_id)
    .bind(alert_type.as_str())
    .bind(payload.destination.trim())
    .bind(payload.target_price.round_dp(2))
    .bind(payload.check_in)
    .bind(payload.check_out)
    .bind(payload.depart_on)
    .bind(payload.return_on)
    .bind(now)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok(PriceAlertView {
        alert_id,
        alert_type: alert_type.as_str().to_string(),
        destination: payload.destination.trim().to_string(),
        target_price: payload.target_price.round_dp(2),
        check_in: payload.check_in,
        check_out: payload.check_out,
        depart_on: payload.depart_on,
        return_on: payload.return_on,
        active: true,
        created_at: now,
    })))
}

async fn list_price_alerts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<ApiEnvelope<Paginated<PriceAlertView>>>, ApiError> {
    let session = require_session(&state, &headers).await?;
    let (per_page, offset) = pagination_params(query.page, query.per_page);

    let total =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM price_alerts WHERE user_id = $1")
            .bind(session.user_id)
            .fetch_one(&state.pool)
            .await
            .map_err(internal_error)?;

    let rows = sqlx::query(
        r#"
        SELECT id, alert_type, destination, target_price, check_in, check_out, depart_on,
               return_on, active, created_at
        FROM price_alerts
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(session.user_id)
    .bind(per_page)
    .bind(offset)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(PriceAlertView {
            alert_id: row.try_get("id").map_err(internal_error)?,
            alert_type: row.try_get("alert_type").map_err(internal_error)?,
            destination: row.try_get("destination").map_err(internal_error)?,
            target_price: row.try_get("target_price").map_err(internal_error)?,
            check_in: row.try_get("check_in").map_err(internal_error)?,
            check_out: row.try_get("check_out").map_err(internal_error)?,
            depart_on: row.try_get("depart_on").map_err(internal_error)?,
            return_on: row.try_get("return_on").map_err(internal_error)?,
            active: row.try_get("active").map_err(internal_error)?,
            created_at: row.try_get("created_at").map_err(internal_error)?,
        });
    }

    Ok(Json(ApiEnvelope::ok(Paginated::new(items, total, per_page))))
}

async fn delete_price_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<serde_json::Value>>, ApiError> {
    let session = require_session(&state, &headers).await?;

    let deleted = sqlx::query_scalar::<_, Uuid>(
        "DELETE FROM price_alerts WHERE id = $1 AND user_id = $2 RETURNING id",
    )
    .bind(alert_id)
    .bind(session.user_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    if deleted.is_none() {
        return Err(not_found("price alert not found"));
    }

    Ok(Json(ApiEnvelope::ok_with_message(
        serde_json::json!({}),
        "price alert deleted",
    )))
}

async fn track_referral_click(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<ApiEnvelope<ReferralClickResponse>>, ApiError> {
    let code = code.trim().to_ascii_uppercase();

    let affiliate_id = sqlx::query_scalar::<_, Uuid>(
        r#"
        UPDATE affiliates
        SET total_clicks = total_clicks + 1, updated_at = $2
        WHERE referral_code = $1 AND status = 'active'
        RETURNING id
        "#,
    )
    .bind(&code)
    .bind(Utc::now())
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    let Some(affiliate_id) = affiliate_id else {
        return Err(not_found("referral link not found"));
    };

    sqlx::query("INSERT INTO referral_clicks (id, affiliate_id, clicked_at) VALUES ($1, $2, $3)")
        .bind(Uuid::new_v4())
        .bind(affiliate_id)
        .bind(Utc::now())
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok(ReferralClickResponse {
        landing_url: format!("{}/?ref={}", state.public_base_url, code),
    })))
}

async fn register_affiliate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterAffiliateRequest>,
) -> Result<Json<ApiEnvelope<RegisterAffiliateResponse>>, ApiError> {
    let session = require_session(&state, &headers).await?;

    let payout_method = payload
        .payout_method
        .as_deref()
        .map(|raw| PayoutMethod::parse(raw).map_err(invalid_status))
        .transpose()?
        .unwrap_or(PayoutMethod::Paypal);

    let payout_email = match payload.payout_email.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => Some(raw.to_string()),
        _ => None,
    };

    let enrolled = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM affiliates WHERE user_id = $1)",
    )
    .bind(session.user_id)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;
    if enrolled {
        return Err(conflict("you are already enrolled in the affiliate program"));
    }

    let settings = load_program_settings(&state.pool)
        .await
        .map_err(internal_error)?;

    // An affiliate referred into the program sits one tier below their
    // referrer; direct signups start at tier 1.
    let level = sqlx::query_scalar::<_, Option<i32>>(
        r#"
        SELECT a.level + 1
        FROM users u
        JOIN affiliates a ON a.referral_code = u.referred_by_code
        WHERE u.id = $1
        "#,
    )
    .bind(session.user_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .flatten()
    .unwrap_or(1);

    let (status, activated_at) = if settings.require_verification {
        (AffiliateStatus::Pending, None)
    } else {
        (AffiliateStatus::Active, Some(Utc::now()))
    };

    let affiliate_id = Uuid::new_v4();
    let now = Utc::now();
    let mut referral_code = generate_referral_code();
    let mut attempt = 0;
    loop {
        let insert = sqlx::query(
            r#"
            INSERT INTO affiliates (
                id, user_id, referral_code, level, status, verified, total_earnings,
                total_referrals, total_clicks, payout_method, payout_email,
                created_at, activated_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, FALSE, 0, 0, 0, $6, $7, $8, $9, $8)
            "#,
        )
        .bind(affiliate_id)
        .bind(session.user_id)
        .bind(&referral_code)
        .bind(level)
        .bind(status.as_str())
        .bind(payout_method.as_str())
        .bind(payout_email.as_deref())
        .bind(now)
        .bind(activated_at)
        .execute(&state.pool)
        .await;

        match insert {
            Ok(_) => break,
            Err(err) if is_unique_violation(&err) => {
                let constraint = err
                    .as_database_error()
                    .and_then(|db| db.constraint())
                    .unwrap_or_default();
                if constraint.contains("user_id") {
                    // Lost a race with a concurrent enrollment.
                    return Err(conflict("you are already enrolled in the affiliate program"));
                }
                if attempt >= REFERRAL_CODE_ATTEMPTS {
                    return Err(internal_error(err));
                }
                attempt += 1;
                referral_code = generate_referral_code();
            }
            Err(err) => return Err(internal_error(err)),
        }
    }

    Ok(Json(ApiEnvelope::ok(RegisterAffiliateResponse {
        affiliate_id,
        referral_code,
        status,
        verified: false,
        created_at: now,
    })))
}

async fn affiliate_dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<AffiliateDashboardView>>, ApiError> {
    let session = require_session(&state, &headers).await?;
    let affiliate = require_affiliate(&state, session.user_id).await?;

    let sums = sqlx::query(
        r#"
        SELECT
            COALESCE(SUM(amount) FILTER (WHERE status = 'pending'), 0) AS pending_amount,
            COALESCE(SUM(amount) FILTER (WHERE status = 'approved'), 0) AS approved_amount
        FROM commissions
        WHERE affiliate_id = $1
        "#,
    )
    .bind(affiliate.id)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let pending_earnings: Decimal = sums.try_get("pending_amount").map_err(internal_error)?;
    let approved_earnings: Decimal = sums.try_get("approved_amount").map_err(internal_error)?;
    let available = available_balance(&state.pool, affiliate.id)
        .await
        .map_err(internal_error)?;

    let rows = sqlx::query(
        r#"
        SELECT id, affiliate_id, booking_id, amount, currency, level, status,
               decision_reason, created_at, decided_at
        FROM commissions
        WHERE affiliate_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(affiliate.id)
    .bind(RECENT_COMMISSIONS_LIMIT)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut recent_commissions = Vec::with_capacity(rows.len());
    for row in rows {
        recent_commissions.push(commission_from_row(&row)?);
    }

    Ok(Json(ApiEnvelope::ok(AffiliateDashboardView {
        referral_code: affiliate.referral_code,
        level: affiliate.level,
        status: affiliate.status,
        verified: affiliate.verified,
        total_clicks: affiliate.total_clicks,
        total_referrals: affiliate.total_referrals,
        total_earnings: affiliate.total_earnings,
        pending_earnings: pending_earnings.round_dp(2),
        approved_earnings: approved_earnings.round_dp(2),
        available_balance: available,
        recent_commissions,
    })))
}

async fn affiliate_links(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<ReferralLinkView>>, ApiError> {
    let session = require_session(&state, &headers).await?;
    let affiliate = require_affiliate(&state, session.user_id).await?;

    Ok(Json(ApiEnvelope::ok(ReferralLinkView {
        share_url: format!(
            "{}/r/{}",
            state.public_base_url, affiliate.referral_code
        ),
        referral_code: affiliate.referral_code,
        total_clicks: affiliate.total_clicks,
        total_referrals: affiliate.total_referrals,
    })))
}

async fn get_affiliate_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<AffiliateSettingsView>>, ApiError> {
    let session = require_session(&state, &headers).await?;
    let affiliate = require_affiliate(&state, session.user_id).await?;
    let settings = load_program_settings(&state.pool)
        .await
        .map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok(AffiliateSettingsView {
        payout_method: affiliate.payout_method,
        payout_email: affiliate.payout_email,
        minimum_payout: settings.minimum_payout,
    })))
}

async fn update_affiliate_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UpdateAffiliateSettingsRequest>,
) -> Result<Json<ApiEnvelope<AffiliateSettingsView>>, ApiError> {
    let session = require_session(&state, &headers).await?;
    let affiliate = require_affiliate(&state, session.user_id).await?;

    let mut errors = FieldErrors::new();
    let payout_method = match payload.payout_method.as_deref() {
        Some(raw) => match PayoutMethod::parse(raw) {
            Ok(method) => method,
            Err(_) => {
                errors.push(
                    "payout_method",
                    "payout method must be paypal, bank_transfer, or card",
                );
                affiliate.payout_method
            }
        },
        None => affiliate.payout_method,
    };

    let payout_email = match payload.payout_email.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => {
            if !raw.contains('@') {
                errors.push("payout_email", "enter a valid payout email");
            }
            Some(raw.to_string())
        }
        Some(_) => None,
        None => affiliate.payout_email.clone(),
    };
    errors.into_result().map_err(validation_failed)?;

    sqlx::query(
        r#"
        UPDATE affiliates
        SET payout_method = $2, payout_email = $3, updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(affiliate.id)
    .bind(payout_method.as_str())
    .bind(payout_email.as_deref())
    .bind(Utc::now())
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    let settings = load_program_settings(&state.pool)
        .await
        .map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok(AffiliateSettingsView {
        payout_method,
        payout_email,
        minimum_payout: settings.minimum_payout,
    })))
}

async fn list_affiliate_payouts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<ApiEnvelope<Paginated<Payout>>>, ApiError> {
    let session = require_session(&state, &headers).await?;
    let affiliate = require_affiliate(&state, session.user_id).await?;
    let (per_page, offset) = pagination_params(query.page, query.per_page);

    let total =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM payouts WHERE affiliate_id = $1")
            .bind(affiliate.id)
            .fetch_one(&state.pool)
            .await
            .map_err(internal_error)?;

    let rows = sqlx::query(
        r#"
        SELECT id, affiliate_id, amount, currency, method, status, transaction_id,
               rejection_reason, requested_at, processed_at, completed_at, rejected_at
        FROM payouts
        WHERE affiliate_id = $1
        ORDER BY requested_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(affiliate.id)
    .bind(per_page)
    .bind(offset)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(payout_from_row(&row)?);
    }

    Ok(Json(ApiEnvelope::ok(Paginated::new(items, total, per_page))))
}

async fn request_payout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RequestPayoutRequest>,
) -> Result<Json<ApiEnvelope<RequestPayoutResponse>>, ApiError> {
    let session = require_session(&state, &headers).await?;
    let affiliate = require_affiliate(&state, session.user_id).await?;

    if affiliate.status != AffiliateStatus::Active {
        return Err(conflict("affiliate account is not active"));
    }

    let currency = payload
        .currency
        .as_deref()
        .map(normalize_currency)
        .transpose()
        .map_err(invalid_request)?
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let settings = load_program_settings(&state.pool)
        .await
        .map_err(internal_error)?;

    // The affiliate row lock serializes concurrent requests so two
    // submissions cannot both clear against the same balance.
    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    sqlx::query("SELECT id FROM affiliates WHERE id = $1 FOR UPDATE")
        .bind(affiliate.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(internal_error)?;

    let available = available_balance(&mut *tx, affiliate.id)
        .await
        .map_err(internal_error)?;

    let form = PayoutRequestForm {
        amount: payload.amount,
        method: payload.method.clone(),
        available_balance: available,
        minimum_payout: settings.minimum_payout,
    };
    let method = form.validate().map_err(validation_failed)?;

    let payout_id = Uuid::new_v4();
    let now = Utc::now();
    let amount = payload.amount.round_dp(2);
    sqlx::query(
        r#"
        INSERT INTO payouts (
            id, affiliate_id, amount, currency, method, status, requested_at
        )
        VALUES ($1, $2, $3, $4, $5, 'pending', $6)
        "#,
    )
    .bind(payout_id)
    .bind(affiliate.id)
    .bind(amount)
    .bind(&currency)
    .bind(method.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok(RequestPayoutResponse {
        payout_id,
        amount,
        currency,
        method,
        status: PayoutStatus::Pending,
        requested_at: now,
        available_balance: (available - amount).round_dp(2),
    })))
}

async fn list_admin_affiliates(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatusPageQuery>,
) -> Result<Json<ApiEnvelope<Paginated<AffiliateAdminView>>>, ApiError> {
    require_admin(&state, &headers).await?;

    let status_filter = query
        .status
        .as_deref()
        .map(|raw| AffiliateStatus::parse(raw).map_err(invalid_status))
        .transpose()?
        .map(|status| status.as_str().to_string());
    let (per_page, offset) = pagination_params(query.page, query.per_page);

    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM affiliates WHERE ($1::text IS NULL OR status = $1)",
    )
    .bind(status_filter.as_deref())
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let rows = sqlx::query(
        r#"
        SELECT a.id, a.user_id, u.email, a.referral_code, a.level, a.status, a.verified,
               a.total_earnings, a.total_referrals, a.total_clicks, a.status_reason,
               a.created_at, a.activated_at
        FROM affiliates a
        JOIN users u ON u.id = a.user_id
        WHERE ($1::text IS NULL OR a.status = $1)
        ORDER BY a.created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(status_filter.as_deref())
    .bind(per_page)
    .bind(offset)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(affiliate_admin_view_from_row(&row)?);
    }

    Ok(Json(ApiEnvelope::ok(Paginated::new(items, total, per_page))))
}

async fn get_admin_affiliate(
    State(state): State<AppState>,
    Path(affiliate_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<AffiliateAdminView>>, ApiError> {
    require_admin(&state, &headers).await?;

    let row = sqlx::query(
        r#"
        SELECT a.id, a.user_id, u.email, a.referral_code, a.level, a.status, a.verified,
               a.total_earnings, a.total_referrals, a.total_clicks, a.status_reason,
               a.created_at, a.activated_at
        FROM affiliates a
        JOIN users u ON u.id = a.user_id
        WHERE a.id = $1
        "#,
    )
    .bind(affiliate_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(not_found("affiliate not found"));
    };

    Ok(Json(ApiEnvelope::ok(affiliate_admin_view_from_row(&row)?)))
}

async fn verify_affiliate(
    State(state): State<AppState>,
    Path(affiliate_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<VerifyAffiliateResponse>>, ApiError> {
    require_admin(&state, &headers).await?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let row = sqlx::query("SELECT status, verified FROM affiliates WHERE id = $1 FOR UPDATE")
        .bind(affiliate_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(not_found("affiliate not found"));
    };

    let status_raw: String = row.try_get("status").map_err(internal_error)?;
    let status = AffiliateStatus::parse(&status_raw).map_err(internal_error)?;
    let verified: bool = row.try_get("verified").map_err(internal_error)?;

    // The flag is monotonic, so re-verifying is a no-op success.
    if verified {
        tx.commit().await.map_err(internal_error)?;
        return Ok(Json(ApiEnvelope::ok(VerifyAffiliateResponse {
            affiliate_id,
            status,
            verified: true,
            already_verified: true,
        })));
    }

    if !status.can_verify() {
        return Err(conflict(format!(
            "affiliate cannot be verified while {}",
            status.as_str()
        )));
    }

    sqlx::query("UPDATE affiliates SET verified = TRUE, updated_at = $2 WHERE id = $1")
        .bind(affiliate_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok(VerifyAffiliateResponse {
        affiliate_id,
        status,
        verified: true,
        already_verified: false,
    })))
}

async fn update_affiliate_status(
    State(state): State<AppState>,
    Path(affiliate_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<UpdateAffiliateStatusRequest>,
) -> Result<Json<ApiEnvelope<AffiliateAdminView>>, ApiError> {
    require_admin(&state, &headers).await?;

    let target = AffiliateStatus::parse(&payload.status).map_err(invalid_status)?;
    let command = match target {
        AffiliateStatus::Active => AffiliateCommand::Activate,
        AffiliateStatus::Suspended => AffiliateCommand::Suspend,
        AffiliateStatus::Banned => AffiliateCommand::Ban,
        AffiliateStatus::Pending => {
            return Err(invalid_request(anyhow::anyhow!(
                "an affiliate cannot be returned to pending"
            )));
        }
    };

    let reason = payload
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let now = Utc::now();
    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let row = sqlx::query("SELECT status FROM affiliates WHERE id = $1 FOR UPDATE")
        .bind(affiliate_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(not_found("affiliate not found"));
    };

    let current_raw: String = row.try_get("status").map_err(internal_error)?;
    let current = AffiliateStatus::parse(&current_raw).map_err(internal_error)?;
    let next = current.apply(command).map_err(transition_conflict)?;

    sqlx::query(
        r#"
        UPDATE affiliates
        SET status = $2,
            status_reason = $3,
            activated_at = CASE WHEN $2 = 'active' THEN COALESCE(activated_at, $4) ELSE activated_at END,
            updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(affiliate_id)
    .bind(next.as_str())
    .bind(reason.as_deref())
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    let updated = sqlx::query(
        r#"
        SELECT a.id, a.user_id, u.email, a.referral_code, a.level, a.status, a.verified,
               a.total_earnings, a.total_referrals, a.total_clicks, a.status_reason,
               a.created_at, a.activated_at
        FROM affiliates a
        JOIN users u ON u.id = a.user_id
        WHERE a.id = $1
        "#,
    )
    .bind(affiliate_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok(affiliate_admin_view_from_row(
        &updated,
    )?)))
}

async fn list_admin_commissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatusPageQuery>,
) -> Result<Json<ApiEnvelope<Paginated<Commission>>>, ApiError> {
    require_admin(&state, &headers).await?;

    let status_filter = query
        .status
        .as_deref()
        .map(|raw| CommissionStatus::parse(raw).map_err(invalid_status))
        .transpose()?
        .map(|status| status.as_str().to_string());
    let (per_page, offset) = pagination_params(query.page, query.per_page);

    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM commissions WHERE ($1::text IS NULL OR status = $1)",
    )
    .bind(status_filter.as_deref())
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let rows = sqlx::query(
        r#"
        SELECT id, affiliate_id, booking_id, amount, currency, level, status,
               decision_reason, created_at, decided_at
        FROM commissions
        WHERE ($1::text IS NULL OR status = $1)
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(status_filter.as_deref())
    .bind(per_page)
    .bind(offset)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(commission_from_row(&row)?);
    }

    Ok(Json(ApiEnvelope::ok(Paginated::new(items, total, per_page))))
}

async fn approve_commission(
    State(state): State<AppState>,
    Path(commission_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Commission>>, ApiError> {
    require_admin(&state, &headers).await?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let row = sqlx::query(
        "SELECT affiliate_id, amount, status FROM commissions WHERE id = $1 FOR UPDATE",
    )
    .bind(commission_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(not_found("commission not found"));
    };

    let affiliate_id: Uuid = row.try_get("affiliate_id").map_err(internal_error)?;
    let amount: Decimal = row.try_get("amount").map_err(internal_error)?;
    let status_raw: String = row.try_get("status").map_err(internal_error)?;
    let status = CommissionStatus::parse(&status_raw).map_err(internal_error)?;
    let next = status.approve().map_err(transition_conflict)?;

    let updated = sqlx::query(
        r#"
        UPDATE commissions
        SET status = $2, decided_at = $3
        WHERE id = $1
        RETURNING id, affiliate_id, booking_id, amount, currency, level, status,
                  decision_reason, created_at, decided_at
        "#,
    )
    .bind(commission_id)
    .bind(next.as_str())
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .map_err(internal_error)?;

    sqlx::query(
        "UPDATE affiliates SET total_earnings = total_earnings + $2, updated_at = $3 WHERE id = $1",
    )
    .bind(affiliate_id)
    .bind(amount)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok_with_message(
        commission_from_row(&updated)?,
        "commission approved",
    )))
}

async fn reject_commission(
    State(state): State<AppState>,
    Path(commission_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<RejectWithReasonRequest>,
) -> Result<Json<ApiEnvelope<Commission>>, ApiError> {
    require_admin(&state, &headers).await?;
    let reason = require_reason(&payload.reason)?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let row = sqlx::query("SELECT status FROM commissions WHERE id = $1 FOR UPDATE")
        .bind(commission_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(not_found("commission not found"));
    };

    let status_raw: String = row.try_get("status").map_err(internal_error)?;
    let status = CommissionStatus::parse(&status_raw).map_err(internal_error)?;
    let next = status.reject().map_err(transition_conflict)?;

    let updated = sqlx::query(
        r#"
        UPDATE commissions
        SET status = $2, decision_reason = $3, decided_at = $4
        WHERE id = $1
        RETURNING id, affiliate_id, booking_id, amount, currency, level, status,
                  decision_reason, created_at, decided_at
        "#,
    )
    .bind(commission_id)
    .bind(next.as_str())
    .bind(&reason)
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok_with_message(
        commission_from_row(&updated)?,
        "commission rejected",
    )))
}

async fn list_admin_payouts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatusPageQuery>,
) -> Result<Json<ApiEnvelope<Paginated<Payout>>>, ApiError> {
    require_admin(&state, &headers).await?;

    let status_filter = query
        .status
        .as_deref()
        .map(|raw| PayoutStatus::parse(raw).map_err(invalid_status))
        .transpose()?
        .map(|status| status.as_str().to_string());
    let (per_page, offset) = pagination_params(query.page, query.per_page);

    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM payouts WHERE ($1::text IS NULL OR status = $1)",
    )
    .bind(status_filter.as_deref())
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let rows = sqlx::query(
        r#"
        SELECT id, affiliate_id, amount, currency, method, status, transaction_id,
               rejection_reason, requested_at, processed_at, completed_at, rejected_at
        FROM payouts
        WHERE ($1::text IS NULL OR status = $1)
        ORDER BY requested_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(status_filter.as_deref())
    .bind(per_page)
    .bind(offset)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(payout_from_row(&row)?);
    }

    Ok(Json(ApiEnvelope::ok(Paginated::new(items, total, per_page))))
}

async fn process_payout(
    State(state): State<AppState>,
    Path(payout_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Payout>>, ApiError> {
    require_admin(&state, &headers).await?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let status = lock_payout_status(&mut tx, payout_id).await?;
    let next = status.process().map_err(transition_conflict)?;

    let updated = sqlx::query(
        r#"
        UPDATE payouts
        SET status = $2, processed_at = $3
        WHERE id = $1
        RETURNING id, affiliate_id, amount, currency, method, status, transaction_id,
                  rejection_reason, requested_at, processed_at, completed_at, rejected_at
        "#,
    )
    .bind(payout_id)
    .bind(next.as_str())
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok_with_message(
        payout_from_row(&updated)?,
        "payout moved to processing",
    )))
}

async fn complete_payout(
    State(state): State<AppState>,
    Path(payout_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<CompletePayoutRequest>,
) -> Result<Json<ApiEnvelope<Payout>>, ApiError> {
    require_admin(&state, &headers).await?;
    let now = Utc::now();

    let transaction_id = payload
        .transaction_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let status = lock_payout_status(&mut tx, payout_id).await?;
    let next = status.complete().map_err(transition_conflict)?;

    let updated = sqlx::query(
        r#"
        UPDATE payouts
        SET status = $2, completed_at = $3, transaction_id = $4
        WHERE id = $1
        RETURNING id, affiliate_id, amount, currency, method, status, transaction_id,
                  rejection_reason, requested_at, processed_at, completed_at, rejected_at
        "#,
    )
    .bind(payout_id)
    .bind(next.as_str())
    .bind(now)
    .bind(transaction_id.as_deref())
    .fetch_one(&mut *tx)
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    let view = payout_from_row(&updated)?;
    let event = PayoutCompletedEvent {
        payout_id,
        affiliate_id: view.affiliate_id,
        amount: view.amount,
        currency: view.currency.clone(),
        transaction_id: view.transaction_id.clone(),
    };
    if let Err(err) = state
        .redis
        .publish_json(CHANNEL_PAYOUTS_COMPLETED, &event)
        .await
    {
        error!("failed to publish payout completion for {payout_id}: {err}");
    }

    Ok(Json(ApiEnvelope::ok_with_message(
        view,
        "payout completed",
    )))
}

async fn reject_payout(
    State(state): State<AppState>,
    Path(payout_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<RejectWithReasonRequest>,
) -> Result<Json<ApiEnvelope<Payout>>, ApiError> {
    require_admin(&state, &headers).await?;
    let reason = require_reason(&payload.reason)?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let status = lock_payout_status(&mut tx, payout_id).await?;
    let next = status.reject().map_err(transition_conflict)?;

    let updated = sqlx::query(
        r#"
        UPDATE payouts
        SET status = $2, rejected_at = $3, rejection_reason = $4
        WHERE id = $1
        RETURNING id, affiliate_id, amount, currency, method, status, transaction_id,
                  rejection_reason, requested_at, processed_at, completed_at, rejected_at
        "#,
    )
    .bind(payout_id)
    .bind(next.as_str())
    .bind(now)
    .bind(&reason)
    .fetch_one(&mut *tx)
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok_with_message(
        payout_from_row(&updated)?,
        "payout rejected",
    )))
}

async fn get_admin_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<ProgramSettingsView>>, ApiError> {
    require_admin(&state, &headers).await?;

    let settings = load_program_settings(&state.pool)
        .await
        .map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok(ProgramSettingsView {
        require_verification: settings.require_verification,
        minimum_payout: settings.minimum_payout,
        max_tier_depth: settings.max_tier_depth,
        level_rates: settings.level_rates,
    })))
}

/// Sessions slide: every authenticated request pushes the expiry out by
/// the configured ttl.
async fn require_session(state: &AppState, headers: &HeaderMap) -> Result<Session, ApiError> {
    let Some(token) = session_token_from_headers(headers) else {
        return Err(unauthorized());
    };

    let session = state
        .sessions
        .refresh(&token, state.session_ttl)
        .await
        .map_err(internal_error)?
        .ok_or_else(unauthorized)?;

    Ok(session)
}

async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<Session, ApiError> {
    let session = require_session(state, headers).await?;
    if session.role != Role::Admin {
        return Err(forbidden());
    }
    Ok(session)
}

async fn require_affiliate(state: &AppState, user_id: Uuid) -> Result<Affiliate, ApiError> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, referral_code, level, status, verified, total_earnings,
               total_referrals, total_clicks, payout_method, payout_email, status_reason,
               created_at, activated_at, updated_at
        FROM affiliates
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(not_found("you are not enrolled in the affiliate program"));
    };

    let status_raw: String = row.try_get("status").map_err(internal_error)?;
    let method_raw: String = row.try_get("payout_method").map_err(internal_error)?;

    Ok(Affiliate {
        id: row.try_get("id").map_err(internal_error)?,
        user_id: row.try_get("user_id").map_err(internal_error)?,
        referral_code: row.try_get("referral_code").map_err(internal_error)?,
        level: row.try_get("level").map_err(internal_error)?,
        status: AffiliateStatus::parse(&status_raw).map_err(internal_error)?,
        verified: row.try_get("verified").map_err(internal_error)?,
        total_earnings: row.try_get("total_earnings").map_err(internal_error)?,
        total_referrals: row.try_get("total_referrals").map_err(internal_error)?,
        total_clicks: row.try_get("total_clicks").map_err(internal_error)?,
        payout_method: PayoutMethod::parse(&method_raw).map_err(internal_error)?,
        payout_email: row.try_get("payout_email").map_err(internal_error)?,
        status_reason: row.try_get("status_reason").map_err(internal_error)?,
        created_at: row.try_get("created_at").map_err(internal_error)?,
        activated_at: row.try_get("activated_at").map_err(internal_error)?,
        updated_at: row.try_get("updated_at").map_err(internal_error)?,
    })
}

#[derive(Debug, Clone)]
struct ReferrerRecord {
    affiliate_id: Uuid,
    referral_code: String,
}

async fn lookup_active_affiliate(
    pool: &PgPool,
    code: &str,
) -> Result<Option<ReferrerRecord>, ApiError> {
    let row = sqlx::query(
        "SELECT id, referral_code FROM affiliates WHERE referral_code = $1 AND status = 'active'",
    )
    .bind(code)
    .fetch_optional(pool)
    .await
    .map_err(internal_error)?;

    match row {
        Some(row) => Ok(Some(ReferrerRecord {
            affiliate_id: row.try_get("id").map_err(internal_error)?,
            referral_code: row.try_get("referral_code").map_err(internal_error)?,
        })),
        None => Ok(None),
    }
}

async fn lock_payout_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    payout_id: Uuid,
) -> Result<PayoutStatus, ApiError> {
    let row = sqlx::query("SELECT status FROM payouts WHERE id = $1 FOR UPDATE")
        .bind(payout_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(not_found("payout not found"));
    };

    let status_raw: String = row.try_get("status").map_err(internal_error)?;
    PayoutStatus::parse(&status_raw).map_err(internal_error)
}

async fn available_balance<'e, E>(executor: E, affiliate_id: Uuid) -> AnyResult<Decimal>
where
    E: sqlx::PgExecutor<'e>,
{
    let balance = sqlx::query_scalar::<_, Decimal>(
        r#"
        SELECT COALESCE((SELECT SUM(amount) FROM commissions
                         WHERE affiliate_id = $1 AND status = 'approved'), 0)
             - COALESCE((SELECT SUM(amount) FROM payouts
                         WHERE affiliate_id = $1 AND status <> 'rejected'), 0)
        "#,
    )
    .bind(affiliate_id)
    .fetch_one(executor)
    .await?;

    Ok(balance.round_dp(2))
}

async fn load_program_settings<'e, E>(executor: E) -> AnyResult<ProgramSettings>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query(
        "SELECT require_verification, min_payout, max_tier_depth, level_rates FROM program_settings WHERE id = 1",
    )
    .fetch_optional(executor)
    .await?;

    let Some(row) = row else {
        return Ok(ProgramSettings::defaults());
    };

    let level_rates: serde_json::Value = row.try_get("level_rates")?;
    let level_rates: Vec<Decimal> = serde_json::from_value(level_rates)?;

    Ok(ProgramSettings {
        require_verification: row.try_get("require_verification")?,
        minimum_payout: row.try_get("min_payout")?,
        max_tier_depth: row.try_get("max_tier_depth")?,
        level_rates,
    })
}

async fn issue_email_verification(
    state: &AppState,
    user_id: Uuid,
    email: &str,
) -> Result<(), ApiError> {
    let token = Uuid::new_v4().simple().to_string();
    sqlx::query(
        r#"
        INSERT INTO email_verification_tokens (id, user_id, token_digest, expires_at, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(token_digest(&token))
    .bind(Utc::now() + Duration::hours(VERIFY_TOKEN_TTL_HOURS))
    .bind(Utc::now())
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    send_email(
        state,
        email,
        "Verify your Tripline email",
        format!(
            "Confirm your email address: {}/verify-email?token={}",
            state.public_base_url, token
        ),
    )
    .await;

    Ok(())
}

async fn send_email(state: &AppState, to: &str, subject: &str, body: String) {
    let notification = EmailNotification {
        to: to.to_string(),
        subject: subject.to_string(),
        body,
    };
    if let Err(err) = state
        .redis
        .publish_json(CHANNEL_NOTIFICATIONS_EMAIL, &notification)
        .await
    {
        error!("failed to queue '{subject}' email: {err}");
    }
}

fn booking_view_from_row(row: &PgRow) -> Result<BookingView, ApiError> {
    Ok(BookingView {
        booking_id: row.try_get("id").map_err(internal_error)?,
        kind: row.try_get("kind").map_err(internal_error)?,
        destination: row.try_get("destination").map_err(internal_error)?,
        check_in: row.try_get("check_in").map_err(internal_error)?,
        check_out: row.try_get("check_out").map_err(internal_error)?,
        guests: row.try_get("guests").map_err(internal_error)?,
        total_amount: row.try_get("total_amount").map_err(internal_error)?,
        currency: row.try_get("currency").map_err(internal_error)?,
        status: row.try_get("status").map_err(internal_error)?,
        card_holder: row.try_get("card_holder").map_err(internal_error)?,
        card_last_four: row.try_get("card_last_four").map_err(internal_error)?,
        referral_code: row.try_get("referral_code").map_err(internal_error)?,
        created_at: row.try_get("created_at").map_err(internal_error)?,
        cancelled_at: row.try_get("cancelled_at").map_err(internal_error)?,
    })
}

fn commission_from_row(row: &PgRow) -> Result<Commission, ApiError> {
    let status_raw: String = row.try_get("status").map_err(internal_error)?;
    Ok(Commission {
        id: row.try_get("id").map_err(internal_error)?,
        affiliate_id: row.try_get("affiliate_id").map_err(internal_error)?,
        booking_id: row.try_get("booking_id").map_err(internal_error)?,
        amount: row.try_get("amount").map_err(internal_error)?,
        currency: row.try_get("currency").map_err(internal_error)?,
        level: row.try_get("level").map_err(internal_error)?,
        status: CommissionStatus::parse(&status_raw).map_err(internal_error)?,
        decision_reason: row.try_get("decision_reason").map_err(internal_error)?,
        created_at: row.try_get("created_at").map_err(internal_error)?,
        decided_at: row.try_get("decided_at").map_err(internal_error)?,
    })
}

fn payout_from_row(row: &PgRow) -> Result<Payout, ApiError> {
    let status_raw: String = row.try_get("status").map_err(internal_error)?;
    let method_raw: String = row.try_get("method").map_err(internal_error)?;
    Ok(Payout {
        id: row.try_get("id").map_err(internal_error)?,
        affiliate_id: row.try_get("affiliate_id").map_err(internal_error)?,
        amount: row.try_get("amount").map_err(internal_error)?,
        currency: row.try_get("currency").map_err(internal_error)?,
        method: PayoutMethod::parse(&method_raw).map_err(internal_error)?,
        status: PayoutStatus::parse(&status_raw).map_err(internal_error)?,
        transaction_id: row.try_get("transaction_id").map_err(internal_error)?,
        rejection_reason: row.try_get("rejection_reason").map_err(internal_error)?,
        requested_at: row.try_get("requested_at").map_err(internal_error)?,
        processed_at: row.try_get("processed_at").map_err(internal_error)?,
        completed_at: row.try_get("completed_at").map_err(internal_error)?,
        rejected_at: row.try_get("rejected_at").map_err(internal_error)?,
    })
}

fn affiliate_admin_view_from_row(row: &PgRow) -> Result<AffiliateAdminView, ApiError> {
    let status_raw: String = row.try_get("status").map_err(internal_error)?;
    Ok(AffiliateAdminView {
        affiliate_id: row.try_get("id").map_err(internal_error)?,
        user_id: row.try_get("user_id").map_err(internal_error)?,
        email: row.try_get("email").map_err(internal_error)?,
        referral_code: row.try_get("referral_code").map_err(internal_error)?,
        level: row.try_get("level").map_err(internal_error)?,
        status: AffiliateStatus::parse(&status_raw).map_err(internal_error)?,
        verified: row.try_get("verified").map_err(internal_error)?,
        total_earnings: row.try_get("total_earnings").map_err(internal_error)?,
        total_referrals: row.try_get("total_referrals").map_err(internal_error)?,
        total_clicks: row.try_get("total_clicks").map_err(internal_error)?,
        status_reason: row.try_get("status_reason").map_err(internal_error)?,
        created_at: row.try_get("created_at").map_err(internal_error)?,
        activated_at: row.try_get("activated_at").map_err(internal_error)?,
    })
}

fn session_token_from_headers(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn session_cookie_headers(token: &str, max_age_secs: i64) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    let value = format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}"
    );
    headers.insert(
        header::SET_COOKIE,
        value.parse().map_err(internal_error)?,
    );
    Ok(headers)
}

fn referral_code_param(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_ascii_uppercase)
}

fn generate_referral_code() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("TRIP-{}", id[..8].to_ascii_uppercase())
}

fn normalize_booking_kind(value: &str) -> AnyResult<String> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "hotel" | "flight" => Ok(normalized),
        _ => anyhow::bail!("kind must be hotel or flight"),
    }
}

fn normalize_currency(value: &str) -> AnyResult<String> {
    let normalized = value.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        anyhow::bail!("currency is required");
    }
    if normalized.len() != 3 || !normalized.chars().all(|c| c.is_ascii_uppercase()) {
        anyhow::bail!("currency must be a 3-letter code");
    }
    Ok(normalized)
}

fn pagination_params(page: Option<i64>, per_page: Option<i64>) -> (i64, i64) {
    let page = page.unwrap_or(1).max(1);
    let per_page = per_page.unwrap_or(20).clamp(1, 100);
    (per_page, (page - 1) * per_page)
}

fn password_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex_string(&hasher.finalize())
}

fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex_string(&hasher.finalize())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.kind() == sqlx::error::ErrorKind::UniqueViolation)
}

fn require_reason(raw: &str) -> Result<String, ApiError> {
    let reason = raw.trim();
    if reason.is_empty() {
        let mut errors = FieldErrors::new();
        errors.push("reason", "a reason is required");
        return Err(validation_failed(errors));
    }
    Ok(reason.to_string())
}

fn validation_failed(errors: FieldErrors) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        message: "validation failed".to_string(),
        fields: Some(errors.to_json()),
    }
}

/// For status/method strings arriving from the caller, an unknown value is
/// the caller's mistake, not a corrupt row.
fn invalid_status(err: TransitionError) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        message: err.to_string(),
        fields: None,
    }
}

fn transition_conflict(err: TransitionError) -> ApiError {
    match err {
        TransitionError::Unknown { .. } => internal_error(err),
        _ => ApiError {
            status: StatusCode::CONFLICT,
            message: err.to_string(),
            fields: None,
        },
    }
}

fn conflict(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::CONFLICT,
        message: message.into(),
        fields: None,
    }
}

fn not_found(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        message: message.into(),
        fields: None,
    }
}

fn unauthorized() -> ApiError {
    ApiError {
        status: StatusCode::UNAUTHORIZED,
        message: "please log in to continue".to_string(),
        fields: None,
    }
}

fn forbidden() -> ApiError {
    ApiError {
        status: StatusCode::FORBIDDEN,
        message: "you do not have permission to perform this action".to_string(),
        fields: None,
    }
}

fn invalid_credentials() -> ApiError {
    ApiError {
        status: StatusCode::UNAUTHORIZED,
        message: "invalid email or password".to_string(),
        fields: None,
    }
}

fn invalid_request(err: anyhow::Error) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        message: err.to_string(),
        fields: None,
    }
}

fn internal_error<E: std::fmt::Display>(err: E) -> ApiError {
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: err.to_string(),
        fields: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_is_extracted_from_the_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "theme=dark; tripline_session=abc123; lang=en".parse().unwrap(),
        );
        assert_eq!(
            session_token_from_headers(&headers),
            Some("abc123".to_string())
        );

        let mut empty = HeaderMap::new();
        empty.insert(header::COOKIE, "theme=dark".parse().unwrap());
        assert_eq!(session_token_from_headers(&empty), None);

        let mut blank = HeaderMap::new();
        blank.insert(header::COOKIE, "tripline_session=".parse().unwrap());
        assert_eq!(session_token_from_headers(&blank), None);
    }

    #[test]
    fn referral_codes_are_uppercase_and_prefixed() {
        let code = generate_referral_code();
        assert!(code.starts_with("TRIP-"));
        assert_eq!(code.len(), 13);
        assert!(
            code[5..]
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
        );
    }

    #[test]
    fn currency_normalization() {
        assert_eq!(normalize_currency(" usd ").unwrap(), "USD");
        assert!(normalize_currency("").is_err());
        assert!(normalize_currency("EURO").is_err());
        assert!(normalize_currency("E1").is_err());
    }

    #[test]
    fn booking_kind_normalization() {
        assert_eq!(normalize_booking_kind("Hotel").unwrap(), "hotel");
        assert_eq!(normalize_booking_kind("FLIGHT").unwrap(), "flight");
        assert!(normalize_booking_kind("cruise").is_err());
    }

    #[test]
    fn pagination_clamps_and_offsets() {
        assert_eq!(pagination_params(None, None), (20, 0));
        assert_eq!(pagination_params(Some(3), Some(10)), (10, 20));
        assert_eq!(pagination_params(Some(0), Some(1000)), (100, 0));
        assert_eq!(pagination_params(Some(-2), Some(-5)), (1, 0));
    }

    #[test]
    fn password_digests_are_stable_and_salted() {
        let a = password_digest("salt-one", "S3curePass");
        assert_eq!(a, password_digest("salt-one", "S3curePass"));
        assert_ne!(a, password_digest("salt-two", "S3curePass"));
        assert_ne!(a, password_digest("salt-one", "S3curePasz"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn terminal_transitions_map_to_conflict_responses() {
        let err = PayoutStatus::Completed.process().unwrap_err();
        assert_eq!(transition_conflict(err).status, StatusCode::CONFLICT);

        let err = CommissionStatus::Approved.reject().unwrap_err();
        assert_eq!(transition_conflict(err).status, StatusCode::CONFLICT);

        let err = TransitionError::Unknown {
            entity: "payout",
            value: "settled".to_string(),
        };
        assert_eq!(
            transition_conflict(err).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn empty_rejection_reasons_are_field_scoped_errors() {
        let err = require_reason("   ").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.fields.is_some());
        assert!(require_reason(" duplicate booking ").is_ok());
    }
}
