use serde::Serialize;

pub const METER_RESOLUTION: u8 = 7;
pub const ENERGY_UPDATE_INTERVAL_MS: u64 = 300_000;

const SECONDS_PER_HOUR: u64 = 3600;
const FULL_TIER_HOURS: u64 = 5;
const MEDIUM_TIER_HOURS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyTier {
    Full,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyReading {
    pub level: u8,
    pub resolution: u8,
    pub remaining_hours: u64,
    pub tier: EnergyTier,
}

/// Whole hours left in the work day, rounded up and clamped to the day length.
pub fn remaining_hours(elapsed_seconds: u64, work_day_seconds: u64) -> u64 {
    if work_day_seconds == 0 || elapsed_seconds >= work_day_seconds {
        return 0;
    }

    let work_day_hours = work_day_seconds.div_ceil(SECONDS_PER_HOUR);
    (work_day_seconds - elapsed_seconds)
        .div_ceil(SECONDS_PER_HOUR)
        .min(work_day_hours)
}

pub fn remaining_level(elapsed_seconds: u64, work_day_seconds: u64) -> u8 {
    remaining_level_with_resolution(elapsed_seconds, work_day_seconds, METER_RESOLUTION)
}

pub fn remaining_level_with_resolution(
    elapsed_seconds: u64,
    work_day_seconds: u64,
    resolution: u8,
) -> u8 {
    if work_day_seconds == 0 {
        return 0;
    }

    let hours = remaining_hours(elapsed_seconds, work_day_seconds) as f64;
    let work_day_hours = work_day_seconds as f64 / SECONDS_PER_HOUR as f64;
    let scaled = (hours * f64::from(resolution) / work_day_hours).round();

    scaled.clamp(0.0, f64::from(resolution)) as u8
}

pub fn classify(remaining_hours: u64) -> EnergyTier {
    if remaining_hours >= FULL_TIER_HOURS {
        EnergyTier::Full
    } else if remaining_hours >= MEDIUM_TIER_HOURS {
        EnergyTier::Medium
    } else {
        EnergyTier::Low
    }
}

pub fn reading(elapsed_seconds: u64, work_day_seconds: u64) -> EnergyReading {
    let remaining_hours = remaining_hours(elapsed_seconds, work_day_seconds);
    EnergyReading {
        level: remaining_level(elapsed_seconds, work_day_seconds),
        resolution: METER_RESOLUTION,
        remaining_hours,
        tier: classify(remaining_hours),
    }
}
