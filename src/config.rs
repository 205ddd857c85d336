use crate::money::Money;
use crate::policy::REFUND_WINDOW_DAYS;
use chrono::Duration;
use rust_decimal::Decimal;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use tracing::warn;

/// Engine settings. `Default` gives the documented defaults; `from_env`
/// overrides them from `PAYMENTS_*` variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub currency: String,
    pub refund_window_days: i64,
    /// Pending payments older than this are failed by the sweeper.
    pub pending_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub delete_retry_attempts: u32,
    pub delete_retry_delay_ms: u64,
    /// Number of transactions returned with a wallet summary.
    pub recent_transactions: usize,
    pub gateway_min_charge: Money,
}

const PENDING_TIMEOUT_SECS: u64 = 3600;

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            currency: "EGP".to_string(),
            refund_window_days: REFUND_WINDOW_DAYS,
            pending_timeout_secs: PENDING_TIMEOUT_SECS,
            sweep_interval_secs: 60,
            delete_retry_attempts: 5,
            delete_retry_delay_ms: 50,
            recent_transactions: 20,
            gateway_min_charge: Money::from_cents(50),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let gateway_min_charge = env_parse::<Decimal>("PAYMENTS_GATEWAY_MIN_CHARGE")
            .and_then(|amount| match Money::from_decimal(amount) {
                Ok(money) if money.is_positive() => Some(money),
                _ => {
                    warn!(%amount, "ignoring PAYMENTS_GATEWAY_MIN_CHARGE");
                    None
                }
            })
            .unwrap_or(defaults.gateway_min_charge);

        Self {
            currency: env::var("PAYMENTS_CURRENCY")
                .ok()
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
                .unwrap_or(defaults.currency),
            refund_window_days: env_span("PAYMENTS_REFUND_WINDOW_DAYS", window_span)
                .unwrap_or(defaults.refund_window_days),
            pending_timeout_secs: env_span("PAYMENTS_PENDING_TIMEOUT_SECS", timeout_span)
                .unwrap_or(defaults.pending_timeout_secs),
            sweep_interval_secs: env_parse("PAYMENTS_SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.sweep_interval_secs),
            delete_retry_attempts: env_parse("PAYMENTS_DELETE_RETRY_ATTEMPTS")
                .unwrap_or(defaults.delete_retry_attempts),
            delete_retry_delay_ms: env_parse("PAYMENTS_DELETE_RETRY_DELAY_MS")
                .unwrap_or(defaults.delete_retry_delay_ms),
            recent_transactions: env_parse("PAYMENTS_RECENT_TRANSACTIONS")
                .unwrap_or(defaults.recent_transactions),
            gateway_min_charge,
        }
    }

    /// Falls back to the default window when the configured one does not fit
    /// a `Duration`.
    pub fn refund_window(&self) -> Duration {
        window_span(self.refund_window_days)
            .unwrap_or_else(|| Duration::days(REFUND_WINDOW_DAYS))
    }

    pub fn pending_timeout(&self) -> Duration {
        timeout_span(self.pending_timeout_secs)
            .unwrap_or_else(|| Duration::seconds(PENDING_TIMEOUT_SECS as i64))
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn delete_retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.delete_retry_delay_ms)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "unparsable setting, using default");
            None
        }
    }
}

fn window_span(days: i64) -> Option<Duration> {
    if days < 0 {
        return None;
    }
    Duration::try_days(days)
}

fn timeout_span(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

/// Like `env_parse`, but also drops values `span` cannot turn into a duration.
fn env_span<T: FromStr + Display + Copy>(
    name: &str,
    span: impl Fn(T) -> Option<Duration>,
) -> Option<T> {
    let value = env_parse::<T>(name)?;
    if span(value).is_none() {
        warn!(variable = name, %value, "setting out of range, using default");
        return None;
    }
    Some(value)
}
