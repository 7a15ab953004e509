use serde::Serialize;
use thiserror::Error;

use crate::domain::energy::EnergyTier;

pub const DEFAULT_WORK_HOURS: u8 = 8;
pub const DEFAULT_BRIGHTNESS: u8 = 128;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSession {
    pub session_id: String,
    pub start_time: i64,
    pub active: bool,
}

impl WorkSession {
    pub fn open(session_id: impl Into<String>, start_time: i64) -> Self {
        let session_id = session_id.into();
        let active = !session_id.is_empty();
        Self {
            session_id,
            start_time,
            active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active && !self.session_id.is_empty()
    }

    pub fn elapsed_seconds(&self, now_seconds: i64) -> u64 {
        if !self.is_active() {
            return 0;
        }
        u64::try_from(now_seconds - self.start_time).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub api_endpoint: String,
    pub api_token: String,
    pub work_hours: u8,
    pub brightness: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            api_endpoint: String::new(),
            api_token: String::new(),
            work_hours: DEFAULT_WORK_HOURS,
            brightness: DEFAULT_BRIGHTNESS,
        }
    }
}

impl DeviceConfig {
    pub fn work_day_seconds(&self) -> u64 {
        u64::from(self.work_hours) * 3600
    }

    pub fn is_remote_configured(&self) -> bool {
        !self.api_endpoint.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Startup,
    WifiConnecting,
    IdleClockedOut,
    ApiCalling,
    WorkingClockedIn,
    Error,
    ConfigMode,
}

/// Colour tags understood by the display; rendering them is the display's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusColor {
    Red,
    Green,
    Blue,
    Yellow,
    White,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterFrame {
    pub level: u8,
    pub resolution: u8,
    pub tier: EnergyTier,
}

/// What the indicator is currently showing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayFrame {
    pub status: StatusColor,
    pub brightness: u8,
    pub energy: Option<MeterFrame>,
    pub last_pulse: Option<StatusColor>,
    pub celebrations: u32,
}

impl Default for DisplayFrame {
    fn default() -> Self {
        Self {
            status: StatusColor::Off,
            brightness: DEFAULT_BRIGHTNESS,
            energy: None,
            last_pulse: None,
            celebrations: 0,
        }
    }
}

/// Read-only view published by the control loop for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub state: DeviceState,
    pub session: Option<WorkSession>,
    pub last_error: Option<String>,
    pub battery_percent: Option<u8>,
    pub remote_configured: bool,
    pub display: DisplayFrame,
    pub updated_at: Option<String>,
}

impl Default for DeviceSnapshot {
    fn default() -> Self {
        Self {
            state: DeviceState::Startup,
            session: None,
            last_error: None,
            battery_percent: None,
            remote_configured: false,
            display: DisplayFrame::default(),
            updated_at: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteCallError {
    #[error("remote endpoint is not configured")]
    NotConfigured,
    #[error("request failed: {0}")]
    Transport(String),
    #[error("server responded with HTTP {status}")]
    Protocol { status: u16 },
    #[error("invalid response body: {0}")]
    Parse(String),
}

/// Result of one remote operation after all of its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteCallOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub session_id: Option<String>,
    /// Server-reported session start, epoch seconds.
    pub started_at: Option<i64>,
    pub error: Option<RemoteCallError>,
    pub attempts: u8,
}

impl RemoteCallOutcome {
    pub fn failed(error: RemoteCallError, status_code: Option<u16>, attempts: u8) -> Self {
        Self {
            success: false,
            status_code,
            session_id: None,
            started_at: None,
            error: Some(error),
            attempts,
        }
    }

    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown error".to_string())
    }
}
