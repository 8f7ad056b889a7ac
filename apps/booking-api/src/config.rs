use core_lib::CoreError;
use core_lib::adapters::retry::RetryPolicy;
use core_lib::adapters::smtp_email::SmtpConfig;
use core_lib::adapters::supabase_identity::SupabaseConfig;
use core_lib::adapters::twilio_sms::{TWILIO_API_BASE, TwilioConfig};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
const DEFAULT_SESSION_TTL_SECS: u64 = 3600;

/// Settings the request handlers read at runtime.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub session_ttl_secs: u64,
    pub expose_error_details: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            expose_error_details: false,
        }
    }
}

/// Process configuration. Unset optional groups fall back to the in-process
/// adapters; a partially set group is a configuration error.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub supabase: Option<SupabaseConfig>,
    pub smtp: Option<SmtpConfig>,
    pub twilio: Option<TwilioConfig>,
    pub upstream_timeout: Duration,
    pub retry: RetryPolicy,
    pub api: ApiSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr = parse_or(&get, "BIND_ADDR", DEFAULT_BIND_ADDR.parse().ok())?;
        let timeout_secs: u64 =
            parse_or(&get, "UPSTREAM_TIMEOUT_SECS", Some(DEFAULT_UPSTREAM_TIMEOUT_SECS))?;
        if timeout_secs == 0 {
            return Err(CoreError::Configuration(
                "UPSTREAM_TIMEOUT_SECS must be at least 1".into(),
            ));
        }
        let upstream_timeout = Duration::from_secs(timeout_secs);

        let attempts: u32 = parse_or(&get, "IDP_RETRY_MAX_ATTEMPTS", Some(DEFAULT_RETRY_ATTEMPTS))?;
        let base_delay_ms: u64 =
            parse_or(&get, "IDP_RETRY_BASE_DELAY_MS", Some(DEFAULT_RETRY_BASE_DELAY_MS))?;
        let retry = RetryPolicy::new(attempts, Duration::from_millis(base_delay_ms));

        let supabase = match (
            get("SUPABASE_URL"),
            get("SUPABASE_ANON_KEY"),
            get("SUPABASE_SERVICE_ROLE_KEY"),
        ) {
            (None, None, None) => None,
            (Some(url), Some(anon_key), Some(service_role_key)) => Some(SupabaseConfig {
                url,
                anon_key,
                service_role_key,
                timeout: upstream_timeout,
            }),
            _ => {
                return Err(CoreError::Configuration(
                    "SUPABASE_URL, SUPABASE_ANON_KEY and SUPABASE_SERVICE_ROLE_KEY must be set together"
                        .into(),
                ));
            }
        };

        let smtp = match get("SMTP_HOST") {
            None => None,
            Some(host) => {
                let username = get("SMTP_USERNAME").unwrap_or_default();
                let from = get("SMTP_FROM")
                    .or_else(|| (!username.is_empty()).then(|| username.clone()))
                    .ok_or_else(|| {
                        CoreError::Configuration("SMTP_FROM or SMTP_USERNAME is required".into())
                    })?;
                Some(SmtpConfig {
                    host,
                    port: parse_or(&get, "SMTP_PORT", Some(DEFAULT_SMTP_PORT))?,
                    username,
                    password: get("SMTP_PASSWORD").unwrap_or_default(),
                    from,
                    starttls: parse_bool(&get, "SMTP_STARTTLS", true)?,
                    timeout: upstream_timeout,
                })
            }
        };

        let twilio = match (
            get("TWILIO_ACCOUNT_SID"),
            get("TWILIO_AUTH_TOKEN"),
            get("TWILIO_FROM_NUMBER"),
        ) {
            (None, None, None) => None,
            (Some(account_sid), Some(auth_token), Some(from_number)) => Some(TwilioConfig {
                account_sid,
                auth_token,
                from_number,
                base_url: get("TWILIO_BASE_URL").unwrap_or_else(|| TWILIO_API_BASE.to_string()),
                timeout: upstream_timeout,
            }),
            _ => {
                return Err(CoreError::Configuration(
                    "TWILIO_ACCOUNT_SID, TWILIO_AUTH_TOKEN and TWILIO_FROM_NUMBER must be set together"
                        .into(),
                ));
            }
        };

        Ok(Self {
            bind_addr,
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            supabase,
            smtp,
            twilio,
            upstream_timeout,
            retry,
            api: ApiSettings {
                session_ttl_secs: parse_or(&get, "SESSION_TTL_SECS", Some(DEFAULT_SESSION_TTL_SECS))?,
                expose_error_details: parse_bool(&get, "EXPOSE_ERROR_DETAILS", false)?,
            },
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: Option<T>) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| CoreError::Configuration(format!("{key}={raw:?} is invalid: {e}"))),
        None => default.ok_or_else(|| CoreError::Configuration(format!("{key} is required"))),
    }
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool, CoreError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(CoreError::Configuration(format!("{key}={v:?} is not a boolean"))),
    }
}
