use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::debouncer::RawLevel;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("unexpected value {value:?} in {path}")]
    InvalidValue { path: String, value: String },
}

/// Source of the raw (undebounced) button line.
pub trait ButtonInput {
    fn read_level(&mut self) -> Result<RawLevel, InputError>;
}

/// Source of a raw 12-bit battery ADC sample.
pub trait BatteryInput {
    fn read_raw(&mut self) -> Result<u16, InputError>;
}

/// GPIO value file as exported by sysfs: `0` or `1`, optionally newline terminated.
#[derive(Debug, Clone)]
pub struct SysfsButton {
    path: PathBuf,
}

impl SysfsButton {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ButtonInput for SysfsButton {
    fn read_level(&mut self) -> Result<RawLevel, InputError> {
        let raw = read_trimmed(&self.path)?;
        match raw.as_str() {
            "0" => Ok(RawLevel::Low),
            "1" => Ok(RawLevel::High),
            _ => Err(invalid(&self.path, raw)),
        }
    }
}

/// IIO `in_voltageN_raw` style file holding one integer sample.
#[derive(Debug, Clone)]
pub struct SysfsAdc {
    path: PathBuf,
}

impl SysfsAdc {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BatteryInput for SysfsAdc {
    fn read_raw(&mut self) -> Result<u16, InputError> {
        let raw = read_trimmed(&self.path)?;
        raw.parse::<u16>().map_err(|_| invalid(&self.path, raw))
    }
}

fn read_trimmed(path: &Path) -> Result<String, InputError> {
    fs::read_to_string(path)
        .map(|content| content.trim().to_string())
        .map_err(|source| InputError::Io {
            path: path.display().to_string(),
            source,
        })
}

fn invalid(path: &Path, value: String) -> InputError {
    InputError::InvalidValue {
        path: path.display().to_string(),
        value,
    }
}
