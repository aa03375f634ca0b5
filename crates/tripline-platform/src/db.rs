use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

pub async fn connect_database(database_url: &str) -> Result<PgPool> {
    let max_connections = match std::env::var("DB_MAX_CONNECTIONS") {
        Ok(raw) => raw
            .trim()
            .parse()
            .context("DB_MAX_CONNECTIONS must be a positive integer")?,
        Err(_) => DEFAULT_MAX_CONNECTIONS,
    };

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    Ok(pool)
}
