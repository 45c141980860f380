//! Application configuration, loaded from the environment.
//!
//! Mirrors the teacher's `models::Config::from_env()` shape: read
//! `std::env::var`, fall back to a sane default, `.parse().unwrap_or(default)`
//! for numeric fields. Every field enumerated in spec.md §6.5 is represented.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Local,
    Test,
    Staging,
    Production,
}

impl Mode {
    fn detect() -> Self {
        match std::env::var("APP_MODE").ok().as_deref() {
            Some("production") => Mode::Production,
            Some("staging") => Mode::Staging,
            Some("test") => Mode::Test,
            Some("local") => Mode::Local,
            _ => {
                if std::env::var("CI").is_ok() {
                    Mode::Test
                } else {
                    Mode::Local
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripeMode {
    Live,
    Test,
}

#[derive(Debug, Clone)]
pub struct CityRules {
    pub min_task_price_cents: i64,
    pub allowed_categories: Vec<String>,
    pub velocity_hourly_cap: u32,
    pub velocity_daily_cap: u32,
}

impl Default for CityRules {
    fn default() -> Self {
        Self {
            min_task_price_cents: 500,
            allowed_categories: vec![
                "cleaning".to_string(),
                "moving".to_string(),
                "yardwork".to_string(),
                "assembly".to_string(),
                "errands".to_string(),
                "tech_help".to_string(),
            ],
            velocity_hourly_cap: 5,
            velocity_daily_cap: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub stripe_mode: StripeMode,
    pub stripe_secret_key: String,
    pub payouts_enabled: bool,
    pub kill_switch_cache_url: Option<String>,
    pub db_path: String,
    pub jwt_secret: String,
    pub webhook_signing_secret: String,
    pub city_rules: HashMap<String, CityRules>,
    pub default_city_rules: CityRules,
    pub pending_reaper_timeout_minutes: i64,
    pub dlq_max_retries: u32,
    pub dlq_backoff_base_minutes: i64,
    pub webhook_timestamp_max_skew_ms: i64,
    pub webhook_late_arrival_warn_ms: i64,
    pub tpee_shadow_mode: bool,
    /// Platform take on `RELEASE_PAYOUT`/`RESOLVE_UPHOLD`, in basis points
    /// of `price_cents` (default 1000 = 10%, spec.md §8's worked scenario).
    pub platform_fee_bps: u32,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mode = Mode::detect();

        let stripe_mode = match std::env::var("STRIPE_MODE").ok().as_deref() {
            Some("live") => StripeMode::Live,
            _ => StripeMode::Test,
        };

        let stripe_secret_key =
            std::env::var("STRIPE_SECRET_KEY").unwrap_or_else(|_| "sk_test_placeholder".into());

        if mode == Mode::Production {
            anyhow::ensure!(
                stripe_mode == StripeMode::Live,
                "production mode requires STRIPE_MODE=live"
            );
            anyhow::ensure!(
                stripe_secret_key.starts_with("sk_live_"),
                "production mode requires a sk_live_ STRIPE_SECRET_KEY"
            );
        }
        if mode == Mode::Staging {
            anyhow::ensure!(
                stripe_mode == StripeMode::Test,
                "staging mode requires STRIPE_MODE=test"
            );
        }

        let payouts_enabled = mode == Mode::Production
            && std::env::var("PAYOUTS_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE"))
                .unwrap_or(true);

        let db_path =
            std::env::var("DB_PATH").unwrap_or_else(|_| "escrow_core.db".to_string());

        let jwt_secret = std::env::var("JWT_SECRET")
            .unwrap_or_else(|_| "dev-secret-change-in-production-minimum-32-characters".into());

        let webhook_signing_secret =
            std::env::var("WEBHOOK_SIGNING_SECRET").unwrap_or_else(|_| "whsec_dev".into());

        let pending_reaper_timeout_minutes = std::env::var("PENDING_REAPER_TIMEOUT_MINUTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let dlq_max_retries = std::env::var("DLQ_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let dlq_backoff_base_minutes = std::env::var("DLQ_BACKOFF_BASE_MINUTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let webhook_timestamp_max_skew_ms = std::env::var("WEBHOOK_TIMESTAMP_MAX_SKEW_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(120_000);

        let webhook_late_arrival_warn_ms = std::env::var("WEBHOOK_LATE_ARRIVAL_WARN_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(600_000);

        let tpee_shadow_mode = std::env::var("TPEE_SHADOW_MODE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE"))
            .unwrap_or(false);

        let platform_fee_bps = std::env::var("PLATFORM_FEE_BPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        Ok(Self {
            mode,
            stripe_mode,
            stripe_secret_key,
            payouts_enabled,
            kill_switch_cache_url: std::env::var("KILL_SWITCH_CACHE_URL").ok(),
            db_path,
            jwt_secret,
            webhook_signing_secret,
            city_rules: HashMap::new(),
            default_city_rules: CityRules::default(),
            pending_reaper_timeout_minutes,
            dlq_max_retries,
            dlq_backoff_base_minutes,
            webhook_timestamp_max_skew_ms,
            webhook_late_arrival_warn_ms,
            tpee_shadow_mode,
            platform_fee_bps,
            port,
        })
    }

    pub fn rules_for_city<'a>(&'a self, city: &str) -> &'a CityRules {
        self.city_rules.get(city).unwrap_or(&self.default_city_rules)
    }
}
