use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: String,
    pub http_addr: String,
    /// Base URL referral links are built against.
    pub public_base_url: String,
    /// Session lifetime in seconds.
    pub session_ttl_secs: i64,
}

const DEFAULT_PUBLIC_BASE_URL: &str = "https://www.tripline.travel";
const DEFAULT_SESSION_TTL_SECS: i64 = 60 * 60 * 24;

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;
        let http_addr =
            std::env::var("HTTP_ADDR").unwrap_or_else(|_| default_http_addr.to_string());

        Ok(Self {
            database_url,
            redis_url,
            http_addr,
            public_base_url: public_base_url_from_env(),
            session_ttl_secs: session_ttl_from_env()?,
        })
    }

    pub fn worker_from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;

        Ok(Self {
            database_url,
            redis_url,
            http_addr: String::new(),
            public_base_url: public_base_url_from_env(),
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
        })
    }
}

fn public_base_url_from_env() -> String {
    std::env::var("PUBLIC_BASE_URL")
        .ok()
        .map(|value| value.trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string())
}

fn session_ttl_from_env() -> Result<i64> {
    match std::env::var("SESSION_TTL_SECS") {
        Ok(raw) => {
            let ttl: i64 = raw
                .trim()
                .parse()
                .context("SESSION_TTL_SECS must be an integer number of seconds")?;
            if ttl <= 0 {
                anyhow::bail!("SESSION_TTL_SECS must be positive");
            }
            Ok(ttl)
        }
        Err(_) => Ok(DEFAULT_SESSION_TTL_SECS),
    }
}
