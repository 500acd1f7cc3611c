//! Engine configuration loaded from the environment

use std::str::FromStr;
use std::time::Duration;

use crate::plans::PlanCatalog;

/// Configuration error
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

/// Whether tenants hear about rejected offline payments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPolicy {
    Always,
    Never,
    /// Only when the reviewing admin asks for it
    OnRequest,
}

impl NotificationPolicy {
    pub fn should_notify(&self, requested: bool) -> bool {
        match self {
            NotificationPolicy::Always => true,
            NotificationPolicy::Never => false,
            NotificationPolicy::OnRequest => requested,
        }
    }
}

impl FromStr for NotificationPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            "on_request" => Ok(Self::OnRequest),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: usize,
    pub base_delay: Duration,
}

impl RetrySettings {
    /// Delays between attempts: base, 2x base, 4x base, ...
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let base = self.base_delay;
        (0..self.max_retries as u32).map(move |n| base.saturating_mul(2u32.saturating_pow(n)))
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub merchant_id: String,
    /// When set, callbacks must carry a valid HMAC-SHA256 signature
    pub callback_secret: Option<String>,
    pub country_code: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetrySettings,
}

/// Timing knobs for the scheduler sweeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleSettings {
    pub pending_payment_timeout: time::Duration,
    pub grace_period_days: i64,
    pub trial_reminder_days: i64,
    pub expiry_reminder_days: i64,
    pub auto_renew_lead_days: i64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            pending_payment_timeout: time::Duration::minutes(30),
            grace_period_days: 3,
            trial_reminder_days: 3,
            expiry_reminder_days: 7,
            auto_renew_lead_days: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub ttl: Duration,
    /// 0 disables the cache
    pub max_entries: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub gateway: GatewayConfig,
    pub lifecycle: LifecycleSettings,
    pub rejected_payment_notification: NotificationPolicy,
    pub cache: CacheSettings,
    pub plan_monthly_price: i64,
    pub plan_yearly_price: i64,
    pub plan_currency: String,
}

impl BillingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| lookup(key).ok_or(ConfigError::Missing(key));
        let parsed = |key: &'static str, default: &str| -> Result<u64, ConfigError> {
            lookup(key)
                .unwrap_or_else(|| default.to_string())
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(key))
        };
        let parsed_i64 = |key: &'static str, default: i64| -> Result<i64, ConfigError> {
            match lookup(key) {
                Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid(key)),
                None => Ok(default),
            }
        };

        let gateway = GatewayConfig {
            base_url: required("GATEWAY_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            api_key: required("GATEWAY_API_KEY")?,
            merchant_id: required("GATEWAY_MERCHANT_ID")?,
            callback_secret: lookup("GATEWAY_CALLBACK_SECRET").filter(|s| !s.is_empty()),
            country_code: lookup("GATEWAY_COUNTRY_CODE").unwrap_or_else(|| "255".to_string()),
            timeout: Duration::from_secs(parsed("GATEWAY_TIMEOUT_SECS", "30")?),
            connect_timeout: Duration::from_secs(parsed("GATEWAY_CONNECT_TIMEOUT_SECS", "10")?),
            retry: RetrySettings {
                max_retries: parsed("GATEWAY_MAX_RETRIES", "2")? as usize,
                base_delay: Duration::from_millis(parsed("GATEWAY_RETRY_BASE_MS", "1000")?),
            },
        };

        let lifecycle = LifecycleSettings {
            pending_payment_timeout: time::Duration::minutes(parsed_i64(
                "PENDING_PAYMENT_TIMEOUT_MINUTES",
                30,
            )?),
            grace_period_days: parsed_i64("GRACE_PERIOD_DAYS", 3)?,
            trial_reminder_days: parsed_i64("TRIAL_REMINDER_DAYS", 3)?,
            expiry_reminder_days: parsed_i64("EXPIRY_REMINDER_DAYS", 7)?,
            auto_renew_lead_days: parsed_i64("AUTO_RENEW_LEAD_DAYS", 1)?,
        };

        let rejected_payment_notification = match lookup("REJECTED_PAYMENT_NOTIFICATION") {
            Some(v) => v
                .parse()
                .map_err(|_| ConfigError::Invalid("REJECTED_PAYMENT_NOTIFICATION"))?,
            None => NotificationPolicy::Always,
        };

        let cache = CacheSettings {
            ttl: Duration::from_secs(parsed("TENANT_CACHE_TTL_SECS", "300")?),
            max_entries: parsed("TENANT_CACHE_MAX_ENTRIES", "10000")?,
        };

        Ok(Self {
            gateway,
            lifecycle,
            rejected_payment_notification,
            cache,
            plan_monthly_price: parsed_i64("PLAN_MONTHLY_PRICE", 25_000)?,
            plan_yearly_price: parsed_i64("PLAN_YEARLY_PRICE", 250_000)?,
            plan_currency: lookup("PLAN_CURRENCY").unwrap_or_else(|| "TZS".to_string()),
        })
    }

    pub fn plan_catalog(&self) -> PlanCatalog {
        PlanCatalog::with_prices(
            self.plan_monthly_price,
            self.plan_yearly_price,
            &self.plan_currency,
        )
    }

    /// Configuration pointing the gateway at `base_url`, defaults elsewhere
    pub fn for_gateway(base_url: &str) -> Self {
        Self {
            gateway: GatewayConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key: "test-key".to_string(),
                merchant_id: "test-merchant".to_string(),
                callback_secret: None,
                country_code: "255".to_string(),
                timeout: Duration::from_secs(30),
                connect_timeout: Duration::from_secs(10),
                retry: RetrySettings::default(),
            },
            lifecycle: LifecycleSettings::default(),
            rejected_payment_notification: NotificationPolicy::Always,
            cache: CacheSettings::default(),
            plan_monthly_price: 25_000,
            plan_yearly_price: 250_000,
            plan_currency: "TZS".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("GATEWAY_BASE_URL", "https://gateway.example.com/"),
        ("GATEWAY_API_KEY", "key"),
        ("GATEWAY_MERCHANT_ID", "merchant"),
    ];

    #[test]
    fn test_defaults() {
        let config = BillingConfig::from_lookup(lookup_from(REQUIRED)).unwrap();
        assert_eq!(config.gateway.base_url, "https://gateway.example.com");
        assert_eq!(config.gateway.retry.max_retries, 2);
        assert_eq!(config.gateway.timeout, Duration::from_secs(30));
        assert_eq!(config.lifecycle.grace_period_days, 3);
        assert_eq!(
            config.rejected_payment_notification,
            NotificationPolicy::Always
        );
        assert_eq!(config.plan_currency, "TZS");
        assert!(config.gateway.callback_secret.is_none());
    }

    #[test]
    fn test_missing_required() {
        let err = BillingConfig::from_lookup(lookup_from(&REQUIRED[1..])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("GATEWAY_BASE_URL"));
    }

    #[test]
    fn test_invalid_number() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("GATEWAY_MAX_RETRIES", "lots"));
        let err = BillingConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert_eq!(err, ConfigError::Invalid("GATEWAY_MAX_RETRIES"));
    }

    #[test]
    fn test_notification_policy() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("REJECTED_PAYMENT_NOTIFICATION", "on_request"));
        let config = BillingConfig::from_lookup(lookup_from(&pairs)).unwrap();
        let policy = config.rejected_payment_notification;
        assert!(!policy.should_notify(false));
        assert!(policy.should_notify(true));

        let mut bad = REQUIRED.to_vec();
        bad.push(("REJECTED_PAYMENT_NOTIFICATION", "sometimes"));
        assert!(BillingConfig::from_lookup(lookup_from(&bad)).is_err());
    }

    #[test]
    fn test_retry_delays_double() {
        let delays: Vec<Duration> = RetrySettings::default().delays().collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
    }
}
