use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::DbError;
use crate::domain::models::{DEFAULT_BRIGHTNESS, DEFAULT_WORK_HOURS, DeviceConfig, WorkSession};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
    #[error("stored value for {key} is invalid: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Durable key-value storage for the open session and the provisioned device fields.
pub trait SessionStore {
    fn save_session(&self, session: &WorkSession) -> Result<(), StoreError>;
    fn clear_session(&self) -> Result<(), StoreError>;
    fn load_session(&self) -> Result<Option<WorkSession>, StoreError>;
    fn save_config(&self, config: &DeviceConfig) -> Result<(), StoreError>;
    fn load_config(&self) -> Result<DeviceConfig, StoreError>;
}

pub trait StoreDiagnostics {
    fn get_schema_version(&self) -> Result<u32, StoreError>;
    fn count_preferences(&self) -> Result<i64, StoreError>;
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, DbError>,
    ) -> Result<T, StoreError> {
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| StoreError::DbLockPoisoned)?;
        op(&mut connection).map_err(StoreError::from)
    }
}

impl SessionStore for SqliteSessionStore {
    fn save_session(&self, session: &WorkSession) -> Result<(), StoreError> {
        self.with_connection(|connection| {
            db::save_session(connection, &session.session_id, session.start_time)
        })
    }

    fn clear_session(&self) -> Result<(), StoreError> {
        self.with_connection(db::clear_session)
    }

    fn load_session(&self) -> Result<Option<WorkSession>, StoreError> {
        let (session_id, clock_in) = self.with_connection(|connection| {
            Ok((
                db::get_preference(connection, db::KEY_SESSION_ID)?,
                db::get_preference(connection, db::KEY_CLOCK_IN)?,
            ))
        })?;

        let Some(session_id) = session_id.filter(|id| !id.is_empty()) else {
            return Ok(None);
        };

        // A session id without its start time cannot be timed, so it is not restored.
        let raw = clock_in.unwrap_or_default();
        let start_time = raw
            .trim()
            .parse::<i64>()
            .map_err(|_| StoreError::InvalidValue {
                key: db::KEY_CLOCK_IN,
                value: raw,
            })?;

        Ok(Some(WorkSession::open(session_id, start_time)))
    }

    fn save_config(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        self.with_connection(|connection| {
            db::put_preferences(
                connection,
                &[
                    (db::KEY_API_URL, config.api_endpoint.clone()),
                    (db::KEY_API_TOKEN, config.api_token.clone()),
                    (db::KEY_WORK_HOURS, config.work_hours.to_string()),
                    (db::KEY_LED_BRIGHTNESS, config.brightness.to_string()),
                ],
            )
        })
    }

    fn load_config(&self) -> Result<DeviceConfig, StoreError> {
        let (api_url, api_token, work_hours, brightness) = self.with_connection(|connection| {
            Ok((
                db::get_preference(connection, db::KEY_API_URL)?,
                db::get_preference(connection, db::KEY_API_TOKEN)?,
                db::get_preference(connection, db::KEY_WORK_HOURS)?,
                db::get_preference(connection, db::KEY_LED_BRIGHTNESS)?,
            ))
        })?;

        Ok(DeviceConfig {
            api_endpoint: api_url.unwrap_or_default(),
            api_token: api_token.unwrap_or_default(),
            work_hours: parse_stored(db::KEY_WORK_HOURS, work_hours, DEFAULT_WORK_HOURS)?,
            brightness: parse_stored(db::KEY_LED_BRIGHTNESS, brightness, DEFAULT_BRIGHTNESS)?,
        })
    }
}

impl StoreDiagnostics for SqliteSessionStore {
    fn get_schema_version(&self) -> Result<u32, StoreError> {
        self.with_connection(|connection| db::schema_version(connection))
    }

    fn count_preferences(&self) -> Result<i64, StoreError> {
        self.with_connection(|connection| db::count_preferences(connection))
    }
}

fn parse_stored(key: &'static str, raw: Option<String>, default: u8) -> Result<u8, StoreError> {
    match raw {
        Some(value) => value
            .trim()
            .parse::<u8>()
            .map_err(|_| StoreError::InvalidValue { key, value }),
        None => Ok(default),
    }
}
