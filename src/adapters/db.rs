use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

pub const LATEST_SCHEMA_VERSION: u32 = 1;

pub const KEY_SESSION_ID: &str = "session_id";
pub const KEY_CLOCK_IN: &str = "clock_in";
pub const KEY_API_URL: &str = "api_url";
pub const KEY_API_TOKEN: &str = "api_token";
pub const KEY_WORK_HOURS: &str = "work_hours";
pub const KEY_LED_BRIGHTNESS: &str = "led_bright";

const MIGRATIONS: &[(u32, &str)] = &[(
    1,
    r#"
CREATE TABLE IF NOT EXISTS preferences (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#,
)];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
}

pub fn open_connection(path: &str) -> Result<Connection, DbError> {
    Connection::open(path).map_err(DbError::from)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

pub fn get_preference(connection: &Connection, key: &str) -> Result<Option<String>, DbError> {
    let value = connection
        .query_row(
            "SELECT value FROM preferences WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn put_preference(connection: &Connection, key: &str, value: &str) -> Result<(), DbError> {
    connection.execute(
        "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now_rfc3339()],
    )?;
    Ok(())
}

pub fn remove_preference(connection: &Connection, key: &str) -> Result<bool, DbError> {
    let removed = connection.execute("DELETE FROM preferences WHERE key = ?1", params![key])?;
    Ok(removed > 0)
}

pub fn count_preferences(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row("SELECT COUNT(*) FROM preferences", [], |row| row.get(0))?;
    Ok(count)
}

pub fn put_preferences(
    connection: &mut Connection,
    entries: &[(&str, String)],
) -> Result<(), DbError> {
    let transaction = connection.transaction()?;
    for (key, value) in entries {
        put_preference(&transaction, key, value)?;
    }
    transaction.commit()?;
    Ok(())
}

/// Writes the session id and its start time together.
pub fn save_session(
    connection: &mut Connection,
    session_id: &str,
    start_time: i64,
) -> Result<(), DbError> {
    put_preferences(
        connection,
        &[
            (KEY_SESSION_ID, session_id.to_string()),
            (KEY_CLOCK_IN, start_time.to_string()),
        ],
    )
}

pub fn clear_session(connection: &mut Connection) -> Result<(), DbError> {
    let transaction = connection.transaction()?;
    remove_preference(&transaction, KEY_SESSION_ID)?;
    remove_preference(&transaction, KEY_CLOCK_IN)?;
    transaction.commit()?;
    Ok(())
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
