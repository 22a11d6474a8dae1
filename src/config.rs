use std::env;
use std::time::Duration;

use anyhow::Context;

/// Runtime configuration, collected once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_address: String,

    /// Merchant account at the external gateway.
    pub gateway_merchant_id: String,
    /// Point-of-sale id at the external gateway.
    pub gateway_pos_id: String,
    /// Shared secret for webhook and verify-request signatures.
    pub gateway_secret: String,
    /// Base URL of the gateway REST API.
    pub gateway_api_url: String,
    /// Base URL customers are redirected to for gateway checkout.
    pub gateway_redirect_url: String,
    /// Timeout for the authoritative verify call.
    pub verify_timeout: Duration,

    /// How long a SUBMITTED order may stay unpaid before the sweeper
    /// cancels it and releases its seats.
    pub reservation_ttl: Duration,
    /// Sweeper wake-up interval.
    pub sweep_interval: Duration,
    /// Validity window for earned loyalty points.
    pub points_validity_days: i64,

    /// Bank account details quoted in manual-transfer instructions.
    pub bank_details: String,
}

fn duration_var(name: &str, default_secs: u64) -> Duration {
    let secs = env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(AppConfig {
            bind_address: env::var("BIND_ADDRESS").context("BIND_ADDRESS not set")?,
            gateway_merchant_id: env::var("GATEWAY_MERCHANT_ID").context("GATEWAY_MERCHANT_ID not set")?,
            gateway_pos_id: env::var("GATEWAY_POS_ID").context("GATEWAY_POS_ID not set")?,
            gateway_secret: env::var("GATEWAY_SECRET").context("GATEWAY_SECRET not set")?,
            gateway_api_url: env::var("GATEWAY_API_URL").context("GATEWAY_API_URL not set")?,
            gateway_redirect_url: env::var("GATEWAY_REDIRECT_URL").context("GATEWAY_REDIRECT_URL not set")?,
            verify_timeout: duration_var("GATEWAY_VERIFY_TIMEOUT_SECS", 10),
            reservation_ttl: duration_var("RESERVATION_TTL_SECS", 120 * 60),
            sweep_interval: duration_var("SWEEP_INTERVAL_SECS", 5 * 60),
            points_validity_days: env::var("POINTS_VALIDITY_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(365),
            bank_details: env::var("BANK_DETAILS").unwrap_or_default(),
        })
    }
}
