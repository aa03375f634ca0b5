use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use redis::Msg;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use tracing::{error, info};
use tripline_core::{AffiliateStatus, CommissionSchedule, ThreeTierSchedule};
use tripline_platform::{
    BookingCancelledEvent, BookingConfirmedEvent, CHANNEL_BOOKINGS_CANCELLED,
    CHANNEL_BOOKINGS_CONFIRMED, RedisBus, ServiceConfig, connect_database,
};
use uuid::Uuid;

const CANCELLED_BOOKING_REASON: &str = "booking cancelled";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tripline_accrual=info".to_string()),
        )
        .init();

    let config = ServiceConfig::worker_from_env()?;
    let pool = connect_database(&config.database_url).await?;
    let redis = RedisBus::connect(&config.redis_url)?;

    let mut pubsub = redis.client().get_async_pubsub().await?;
    pubsub.subscribe(CHANNEL_BOOKINGS_CONFIRMED).await?;
    pubsub.subscribe(CHANNEL_BOOKINGS_CANCELLED).await?;
    let mut messages = pubsub.on_message();

    info!("accrual worker subscribed to booking events");

    loop {
        let msg = messages
            .next()
            .await
            .context("booking event stream ended unexpectedly")?;
        if let Err(err) = handle_message(&pool, msg).await {
            error!("failed to process message: {err:#}");
        }
    }
}

async fn handle_message(pool: &PgPool, msg: Msg) -> Result<()> {
    let channel = msg.get_channel_name().to_string();
    let payload: String = msg.get_payload()?;

    match channel.as_str() {
        CHANNEL_BOOKINGS_CONFIRMED => {
            let event: BookingConfirmedEvent = serde_json::from_str(&payload)?;
            let accrued = accrue_commissions(pool, event.booking_id).await?;
            if accrued > 0 {
                info!(
                    "accrued {accrued} commission(s) for booking {}",
                    event.booking_id
                );
            }
            Ok(())
        }
        CHANNEL_BOOKINGS_CANCELLED => {
            let event: BookingCancelledEvent = serde_json::from_str(&payload)?;
            let rejected = reject_pending_commissions(pool, event.booking_id).await?;
            if rejected > 0 {
                info!(
                    "auto-rejected {rejected} pending commission(s) for cancelled booking {}",
                    event.booking_id
                );
            }
            Ok(())
        }
        other => {
            anyhow::bail!("unexpected channel: {other}");
        }
    }
}

/// Walks the referrer chain starting from the booking's attribution code
/// and writes one pending ledger entry per earning tier. Delivery is
/// at-least-once, so a booking that already has entries is skipped whole.
async fn accrue_commissions(pool: &PgPool, booking_id: Uuid) -> Result<u32> {
    let mut tx = pool.begin().await?;

    let booking = sqlx::query(
        r#"
        SELECT user_id, total_amount, currency, status, referral_code
        FROM bookings
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(booking_id)
    .fetch_optional(&mut *tx)
    .await?
    .context("booking not found")?;

    let status: String = booking.try_get("status")?;
    if status != "confirmed" {
        info!("booking {booking_id} is {status}, skipping accrual");
        return Ok(0);
    }

    let already_accrued = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM commissions WHERE booking_id = $1)",
    )
    .bind(booking_id)
    .fetch_one(&mut *tx)
    .await?;
    if already_accrued {
        return Ok(0);
    }

    let buyer_id: Uuid = booking.try_get("user_id")?;
    let total_amount: Decimal = booking.try_get("total_amount")?;
    let currency: String = booking.try_get("currency")?;
    let booking_code: Option<String> = booking.try_get("referral_code")?;

    let attribution_code = match booking_code {
        Some(code) => Some(code),
        None => {
            sqlx::query_scalar::<_, Option<String>>(
                "SELECT referred_by_code FROM users WHERE id = $1",
            )
            .bind(buyer_id)
            .fetch_optional(&mut *tx)
            .await?
            .flatten()
        }
    };

    let Some(mut current_code) = attribution_code else {
        return Ok(0);
    };

    let settings = load_accrual_settings(&mut tx).await?;
    let now = Utc::now();
    let mut level: i32 = 1;
    let mut accrued: u32 = 0;

    while level <= settings.max_tier_depth {
        let affiliate = sqlx::query(
            r#"
            SELECT a.id, a.status, u.referred_by_code
            FROM affiliates a
            JOIN users u ON u.id = a.user_id
            WHERE a.referral_code = $1
            "#,
        )
        .bind(&current_code)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(affiliate) = affiliate else {
            break;
        };

        let affiliate_id: Uuid = affiliate.try_get("id")?;
        let status_raw: String = affiliate.try_get("status")?;
        let status = AffiliateStatus::parse(&status_raw)?;
        let amount = commission_amount(total_amount, rate_for_level(&settings, level));

        // A non-active tier earns nothing, but the chain above it still does.
        if status.earns() && amount > Decimal::ZERO {
            sqlx::query(
                r#"
                INSERT INTO commissions (
                    id, affiliate_id, booking_id, amount, currency, level, status, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(affiliate_id)
            .bind(booking_id)
            .bind(amount)
            .bind(&currency)
            .bind(level)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            accrued += 1;
        }

        let next_code: Option<String> = affiliate.try_get("referred_by_code")?;
        let Some(next_code) = next_code else {
            break;
        };
        current_code = next_code;
        level += 1;
    }

    tx.commit().await?;

    Ok(accrued)
}

/// Terminal entries are untouched: the status guard only catches entries
/// still pending, so an already-approved commission survives cancellation
/// and stays an admin concern.
async fn reject_pending_commissions(pool: &PgPool, booking_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE commissions
        SET status = 'rejected', decision_reason = $2, decided_at = $3
        WHERE booking_id = $1 AND status = 'pending'
        "#,
    )
    .bind(booking_id)
    .bind(CANCELLED_BOOKING_REASON)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

#[derive(Debug, Clone)]
struct AccrualSettings {
    max_tier_depth: i32,
    level_rates: Vec<Decimal>,
}

impl AccrualSettings {
    fn defaults() -> Self {
        let schedule = ThreeTierSchedule;
        Self {
            max_tier_depth: schedule.max_depth(),
            level_rates: (1..=schedule.max_depth())
                .map(|level| schedule.rate_for_level(level))
                .collect(),
        }
    }
}

async fn load_accrual_settings(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<AccrualSettings> {
    let row = sqlx::query(
        "SELECT max_tier_depth, level_rates FROM program_settings WHERE id = 1",
    )
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = row else {
        return Ok(AccrualSettings::defaults());
    };

    let level_rates: serde_json::Value = row.try_get("level_rates")?;
    let level_rates: Vec<Decimal> = serde_json::from_value(level_rates)?;

    Ok(AccrualSettings {
        max_tier_depth: row.try_get("max_tier_depth")?,
        level_rates,
    })
}

fn rate_for_level(settings: &AccrualSettings, level: i32) -> Decimal {
    if level < 1 {
        return Decimal::ZERO;
    }
    settings
        .level_rates
        .get((level - 1) as usize)
        .copied()
        .unwrap_or(Decimal::ZERO)
}

fn commission_amount(total: Decimal, rate: Decimal) -> Decimal {
    (total * rate).round_dp(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AccrualSettings {
        AccrualSettings::defaults()
    }

    #[test]
    fn rates_follow_the_tier_schedule() {
        assert_eq!(rate_for_level(&settings(), 1), Decimal::new(5, 2));
        assert_eq!(rate_for_level(&settings(), 2), Decimal::new(2, 2));
        assert_eq!(rate_for_level(&settings(), 3), Decimal::new(1, 2));
        assert_eq!(rate_for_level(&settings(), 4), Decimal::ZERO);
        assert_eq!(rate_for_level(&settings(), 0), Decimal::ZERO);
    }

    #[test]
    fn commission_amounts_round_to_cents() {
        let total = Decimal::new(20000, 2); // 200.00
        assert_eq!(
            commission_amount(total, Decimal::new(5, 2)),
            Decimal::new(1000, 2)
        );

        // Banker's rounding on the half-cent.
        let awkward = Decimal::new(250, 2); // 2.50
        assert_eq!(
            commission_amount(awkward, Decimal::new(5, 2)),
            Decimal::new(12, 2)
        );
    }

    #[test]
    fn truncated_rate_tables_earn_nothing_past_their_depth() {
        let short = AccrualSettings {
            max_tier_depth: 5,
            level_rates: vec![Decimal::new(10, 2)],
        };
        assert_eq!(rate_for_level(&short, 1), Decimal::new(10, 2));
        assert_eq!(rate_for_level(&short, 2), Decimal::ZERO);
    }
}
