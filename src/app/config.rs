use crate::adapters::remote_session::{API_BACKOFF_BASE_MS, API_RETRY_COUNT, API_TIMEOUT_MS};
use crate::app::AppError;
use crate::app::runtime::{ERROR_DISPLAY_MS, POLL_INTERVAL_MS};
use crate::domain::debouncer::{DEFAULT_DEBOUNCE_MS, DEFAULT_LONG_PRESS_MS};
use crate::domain::energy::ENERGY_UPDATE_INTERVAL_MS;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    /// `None` when the diagnostics API is disabled.
    pub http_bind: Option<String>,
    pub button_input_path: Option<String>,
    pub button_active_low: bool,
    pub battery_adc_path: Option<String>,
    pub poll_interval_ms: u64,
    pub debounce_ms: u64,
    pub long_press_ms: u64,
    pub api_timeout_ms: u64,
    pub api_retry_count: u8,
    pub api_backoff_base_ms: u64,
    pub energy_update_interval_ms: u64,
    pub error_display_ms: u64,
    pub project_id: String,
    pub provisioning: ProvisioningOverrides,
}

/// Device fields supplied at provisioning time; each one replaces the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningOverrides {
    pub api_endpoint: Option<String>,
    pub api_token: Option<String>,
    pub work_hours: Option<u8>,
    pub led_brightness: Option<u8>,
}

impl ProvisioningOverrides {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded environment file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let http_bind = match lookup("HTTP_BIND") {
            Some(raw) => Some(raw.trim().to_string()).filter(|v| !v.is_empty()),
            None => Some("127.0.0.1:8080".to_string()),
        };

        let api_retry_count = parse_or_default(&lookup, "API_RETRY_COUNT", API_RETRY_COUNT)?;
        if api_retry_count == 0 {
            return Err(AppError::config("API_RETRY_COUNT must be at least 1"));
        }

        let work_hours = parse_optional::<u8, _>(&lookup, "WORK_HOURS")?;
        if let Some(hours) = work_hours
            && !(1..=24).contains(&hours)
        {
            return Err(AppError::config("WORK_HOURS must be between 1 and 24"));
        }

        Ok(Self {
            db_path: non_empty(&lookup, "DB_PATH")
                .unwrap_or_else(|| "/var/lib/wallclock/wallclock.db".to_string()),
            http_bind,
            button_input_path: non_empty(&lookup, "BUTTON_INPUT_PATH"),
            button_active_low: parse_flag(&lookup, "BUTTON_ACTIVE_LOW", true)?,
            battery_adc_path: non_empty(&lookup, "BATTERY_ADC_PATH"),
            poll_interval_ms: parse_or_default(&lookup, "POLL_INTERVAL_MS", POLL_INTERVAL_MS)?,
            debounce_ms: parse_or_default(&lookup, "DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)?,
            long_press_ms: parse_or_default(&lookup, "LONG_PRESS_MS", DEFAULT_LONG_PRESS_MS)?,
            api_timeout_ms: parse_or_default(&lookup, "API_TIMEOUT_MS", API_TIMEOUT_MS)?,
            api_retry_count,
            api_backoff_base_ms: parse_or_default(
                &lookup,
                "API_BACKOFF_BASE_MS",
                API_BACKOFF_BASE_MS,
            )?,
            energy_update_interval_ms: parse_or_default(
                &lookup,
                "ENERGY_UPDATE_INTERVAL_MS",
                ENERGY_UPDATE_INTERVAL_MS,
            )?,
            error_display_ms: parse_or_default(&lookup, "ERROR_DISPLAY_MS", ERROR_DISPLAY_MS)?,
            project_id: non_empty(&lookup, "PROJECT_ID")
                .unwrap_or_else(|| "office-time".to_string()),
            provisioning: ProvisioningOverrides {
                api_endpoint: non_empty(&lookup, "API_ENDPOINT"),
                api_token: non_empty(&lookup, "API_TOKEN"),
                work_hours,
                led_brightness: parse_optional(&lookup, "LED_BRIGHTNESS")?,
            },
        })
    }

    pub fn require_button_input(&self) -> Result<&str, AppError> {
        self.button_input_path
            .as_deref()
            .ok_or_else(|| AppError::config("BUTTON_INPUT_PATH is required"))
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_optional(lookup, key)?.unwrap_or(default))
}

fn parse_optional<T, F>(lookup: &F, key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(None),
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key).map(|v| v.to_ascii_lowercase()) {
        Some(raw) => match raw.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(AppError::config(format!("{key} must be true or false"))),
        },
        None => Ok(default),
    }
}
