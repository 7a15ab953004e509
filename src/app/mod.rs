mod config;
mod error;
mod logging;
pub mod runtime;
pub mod services;

pub use config::{AppConfig, ProvisioningOverrides};
pub use error::AppError;

pub fn run_device() -> Result<(), AppError> {
    logging::init()?;

    let config = AppConfig::from_env()?;

    tracing::info!(
        db_path = %config.db_path,
        http_bind = ?config.http_bind,
        button_input_path = ?config.button_input_path,
        battery_adc_path = ?config.battery_adc_path,
        poll_interval_ms = config.poll_interval_ms,
        debounce_ms = config.debounce_ms,
        long_press_ms = config.long_press_ms,
        api_retry_count = config.api_retry_count,
        project_id = %config.project_id,
        "device bootstrap initialized"
    );

    runtime::run_device(config)
}

pub fn run_probe() -> Result<(), AppError> {
    logging::init()?;

    let config = AppConfig::from_env()?;

    tracing::info!(db_path = %config.db_path, "status probe starting");

    runtime::run_probe(config)
}
