pub const ADC_MAX_RAW: u16 = 4095;
pub const ADC_REFERENCE_VOLTS: f32 = 3.3;
pub const DIVIDER_RATIO: f32 = 2.0;
pub const VOLTAGE_FULL: f32 = 4.2;
pub const VOLTAGE_EMPTY: f32 = 3.0;
pub const LOW_BATTERY_PERCENT: u8 = 10;

pub fn voltage_from_raw(raw: u16) -> f32 {
    let raw = raw.min(ADC_MAX_RAW);
    f32::from(raw) / f32::from(ADC_MAX_RAW) * ADC_REFERENCE_VOLTS * DIVIDER_RATIO
}

/// Linear LiPo estimate between the empty and full voltages.
pub fn percent_from_voltage(voltage: f32) -> u8 {
    let percent = (voltage - VOLTAGE_EMPTY) / (VOLTAGE_FULL - VOLTAGE_EMPTY) * 100.0;
    percent.clamp(0.0, 100.0) as u8
}

pub fn is_low(percent: u8) -> bool {
    percent < LOW_BATTERY_PERCENT
}
