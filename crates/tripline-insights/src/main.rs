use std::net::SocketAddr;

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::info;
use tripline_platform::{ApiEnvelope, ServiceConfig, connect_database};
use uuid::Uuid;

// Read-side projections for the admin back office and the public
// leaderboard. Everything is recomputed from Postgres on each request;
// nothing here is cached or mutated.

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

#[derive(Debug, Clone, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ProgramAnalytics {
    generated_at: DateTime<Utc>,
    affiliates_total: i64,
    affiliates_pending: i64,
    affiliates_active: i64,
    affiliates_suspended: i64,
    affiliates_banned: i64,
    affiliates_verified: i64,
    commissions_pending_count: i64,
    commissions_pending_amount: Decimal,
    commissions_approved_count: i64,
    commissions_approved_amount: Decimal,
    commissions_rejected_count: i64,
    payouts_pending_count: i64,
    payouts_processing_count: i64,
    payouts_completed_count: i64,
    payouts_completed_amount: Decimal,
    payouts_rejected_count: i64,
    bookings_confirmed: i64,
    bookings_cancelled: i64,
    booking_revenue: Decimal,
    clicks_total: i64,
    referrals_total: i64,
}

#[derive(Debug, Serialize)]
struct TopPerformerRow {
    affiliate_id: Uuid,
    referral_code: String,
    level: i32,
    approved_earnings: Decimal,
    total_referrals: i64,
    total_clicks: i64,
    completed_payouts: Decimal,
}

#[derive(Debug, Serialize)]
struct TopPerformersResponse {
    generated_at: DateTime<Utc>,
    items: Vec<TopPerformerRow>,
}

#[derive(Debug, Serialize)]
struct LeaderboardRow {
    rank: i64,
    referral_code: String,
    level: i32,
    total_referrals: i64,
    total_earnings: Decimal,
}

#[derive(Debug, Serialize)]
struct LeaderboardResponse {
    generated_at: DateTime<Utc>,
    items: Vec<LeaderboardRow>,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tripline_insights=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8081")?;
    let pool = connect_database(&config.database_url).await?;

    let state = AppState { pool };
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/admin/analytics", get(program_analytics))
        .route("/admin/analytics/top-performers", get(top_performers))
        .route("/affiliate/leaderboard", get(leaderboard))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("insights listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn program_analytics(
    State(state): State<AppState>,
) -> Result<Json<ApiEnvelope<ProgramAnalytics>>, (StatusCode, String)> {
    let affiliates = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COUNT(*) FILTER (WHERE status = 'pending') AS pending,
            COUNT(*) FILTER (WHERE status = 'active') AS active,
            COUNT(*) FILTER (WHERE status = 'suspended') AS suspended,
            COUNT(*) FILTER (WHERE status = 'banned') AS banned,
            COUNT(*) FILTER (WHERE verified) AS verified,
            COALESCE(SUM(total_clicks), 0)::bigint AS clicks_total,
            COALESCE(SUM(total_referrals), 0)::bigint AS referrals_total
        FROM affiliates
        "#,
    )
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let commissions = sqlx::query(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE status = 'pending') AS pending_count,
            COALESCE(SUM(amount) FILTER (WHERE status = 'pending'), 0) AS pending_amount,
            COUNT(*) FILTER (WHERE status = 'approved') AS approved_count,
            COALESCE(SUM(amount) FILTER (WHERE status = 'approved'), 0) AS approved_amount,
            COUNT(*) FILTER (WHERE status = 'rejected') AS rejected_count
        FROM commissions
        "#,
    )
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let payouts = sqlx::query(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE status = 'pending') AS pending_count,
            COUNT(*) FILTER (WHERE status = 'processing') AS processing_count,
            COUNT(*) FILTER (WHERE status = 'completed') AS completed_count,
            COALESCE(SUM(amount) FILTER (WHERE status = 'completed'), 0) AS completed_amount,
            COUNT(*) FILTER (WHERE status = 'rejected') AS rejected_count
        FROM payouts
        "#,
    )
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let bookings = sqlx::query(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE status = 'confirmed') AS confirmed,
            COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
            COALESCE(SUM(total_amount) FILTER (WHERE status = 'confirmed'), 0) AS revenue
        FROM bookings
        "#,
    )
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let pending_amount: Decimal = commissions.try_get("pending_amount").map_err(internal_error)?;
    let approved_amount: Decimal = commissions
        .try_get("approved_amount")
        .map_err(internal_error)?;
    let completed_amount: Decimal = payouts.try_get("completed_amount").map_err(internal_error)?;
    let revenue: Decimal = bookings.try_get("revenue").map_err(internal_error)?;

    Ok(Json(ApiEnvelope::ok(ProgramAnalytics {
        generated_at: Utc::now(),
        affiliates_total: affiliates.try_get("total").map_err(internal_error)?,
        affiliates_pending: affiliates.try_get("pending").map_err(internal_error)?,
        affiliates_active: affiliates.try_get("active").map_err(internal_error)?,
        affiliates_suspended: affiliates.try_get("suspended").map_err(internal_error)?,
        affiliates_banned: affiliates.try_get("banned").map_err(internal_error)?,
        affiliates_verified: affiliates.try_get("verified").map_err(internal_error)?,
        commissions_pending_count: commissions
            .try_get("pending_count")
            .map_err(internal_error)?,
        commissions_pending_amount: pending_amount.round_dp(2),
        commissions_approved_count: commissions
            .try_get("approved_count")
            .map_err(internal_error)?,
        commissions_approved_amount: approved_amount.round_dp(2),
        commissions_rejected_count: commissions
            .try_get("rejected_count")
            .map_err(internal_error)?,
        payouts_pending_count: payouts.try_get("pending_count").map_err(internal_error)?,
        payouts_processing_count: payouts
            .try_get("processing_count")
            .map_err(internal_error)?,
        payouts_completed_count: payouts.try_get("completed_count").map_err(internal_error)?,
        payouts_completed_amount: completed_amount.round_dp(2),
        payouts_rejected_count: payouts.try_get("rejected_count").map_err(internal_error)?,
        bookings_confirmed: bookings.try_get("confirmed").map_err(internal_error)?,
        bookings_cancelled: bookings.try_get("cancelled").map_err(internal_error)?,
        booking_revenue: revenue.round_dp(2),
        clicks_total: affiliates.try_get("clicks_total").map_err(internal_error)?,
        referrals_total: affiliates
            .try_get("referrals_total")
            .map_err(internal_error)?,
    })))
}

async fn top_performers(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ApiEnvelope<TopPerformersResponse>>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(10).clamp(1, 100);

    let rows = sqlx::query(
        r#"
        SELECT
            a.id,
            a.referral_code,
            a.level,
            a.total_referrals,
            a.total_clicks,
            COALESCE((SELECT SUM(c.amount) FROM commissions c
                      WHERE c.affiliate_id = a.id AND c.status = 'approved'), 0) AS approved_earnings,
            COALESCE((SELECT SUM(p.amount) FROM payouts p
                      WHERE p.affiliate_id = a.id AND p.status = 'completed'), 0) AS completed_payouts
        FROM affiliates a
        WHERE a.status = 'active'
        ORDER BY approved_earnings DESC, a.total_referrals DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        let approved: Decimal = row.try_get("approved_earnings").map_err(internal_error)?;
        let paid: Decimal = row.try_get("completed_payouts").map_err(internal_error)?;
        items.push(TopPerformerRow {
            affiliate_id: row.try_get("id").map_err(internal_error)?,
            referral_code: row.try_get("referral_code").map_err(internal_error)?,
            level: row.try_get("level").map_err(internal_error)?,
            approved_earnings: approved.round_dp(2),
            total_referrals: row.try_get("total_referrals").map_err(internal_error)?,
            total_clicks: row.try_get("total_clicks").map_err(internal_error)?,
            completed_payouts: paid.round_dp(2),
        });
    }

    Ok(Json(ApiEnvelope::ok(TopPerformersResponse {
        generated_at: Utc::now(),
        items,
    })))
}

async fn leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ApiEnvelope<LeaderboardResponse>>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);

    let rows = sqlx::query(
        r#"
        SELECT referral_code, level, total_referrals, total_earnings
        FROM affiliates
        WHERE status = 'active'
        ORDER BY total_earnings DESC, total_referrals DESC, referral_code ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        let earnings: Decimal = row.try_get("total_earnings").map_err(internal_error)?;
        items.push(LeaderboardRow {
            rank: index as i64 + 1,
            referral_code: row.try_get("referral_code").map_err(internal_error)?,
            level: row.try_get("level").map_err(internal_error)?,
            total_referrals: row.try_get("total_referrals").map_err(internal_error)?,
            total_earnings: earnings.round_dp(2),
        });
    }

    Ok(Json(ApiEnvelope::ok(LeaderboardResponse {
        generated_at: Utc::now(),
        items,
    })))
}

fn internal_error<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
