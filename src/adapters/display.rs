use std::sync::{Arc, Mutex};

use crate::domain::energy::EnergyTier;
use crate::domain::models::{DeviceSnapshot, DisplayFrame, MeterFrame, StatusColor};

/// Indicator output. Implementations render; they never decide what to show.
pub trait Display {
    fn set_status(&mut self, color: StatusColor);
    fn set_energy_meter(&mut self, level: u8, resolution: u8, tier: EnergyTier);
    fn pulse(&mut self, color: StatusColor);
    fn celebrate(&mut self);
    fn clear(&mut self);
    fn set_brightness(&mut self, level: u8);
}

pub type SharedSnapshot = Arc<Mutex<DeviceSnapshot>>;

/// Display without hardware: traces every command and keeps the latest frame in the
/// published snapshot.
#[derive(Debug, Clone, Default)]
pub struct FrameDisplay {
    snapshot: SharedSnapshot,
}

impl FrameDisplay {
    pub fn new(snapshot: SharedSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn frame(&self) -> DisplayFrame {
        match self.snapshot.lock() {
            Ok(snapshot) => snapshot.display.clone(),
            Err(poisoned) => poisoned.into_inner().display.clone(),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut DisplayFrame)) {
        match self.snapshot.lock() {
            Ok(mut snapshot) => apply(&mut snapshot.display),
            Err(poisoned) => apply(&mut poisoned.into_inner().display),
        }
    }
}

impl Display for FrameDisplay {
    fn set_status(&mut self, color: StatusColor) {
        tracing::debug!(color = ?color, "display status");
        self.update(|frame| {
            frame.status = color;
            if color != StatusColor::Green {
                frame.energy = None;
            }
        });
    }

    fn set_energy_meter(&mut self, level: u8, resolution: u8, tier: EnergyTier) {
        tracing::debug!(level, resolution, tier = ?tier, "display energy meter");
        self.update(|frame| {
            frame.energy = Some(MeterFrame {
                level,
                resolution,
                tier,
            });
        });
    }

    fn pulse(&mut self, color: StatusColor) {
        tracing::debug!(color = ?color, "display pulse");
        self.update(|frame| frame.last_pulse = Some(color));
    }

    fn celebrate(&mut self) {
        tracing::info!("work day complete");
        self.update(|frame| frame.celebrations = frame.celebrations.saturating_add(1));
    }

    fn clear(&mut self) {
        tracing::debug!("display cleared");
        self.update(|frame| {
            frame.status = StatusColor::Off;
            frame.energy = None;
            frame.last_pulse = None;
        });
    }

    fn set_brightness(&mut self, level: u8) {
        tracing::debug!(level, "display brightness");
        self.update(|frame| frame.brightness = level);
    }
}
