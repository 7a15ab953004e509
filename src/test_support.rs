use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::adapters::db::{self, open_connection, run_migrations};

static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    /// Migrated schema, no preferences.
    Empty,
    /// Endpoint, token and an open session `b0` already stored.
    Provisioned,
}

pub fn temp_db_from_template(kind: TemplateKind) -> PathBuf {
    let template = match kind {
        TemplateKind::Empty => ensure_template_db(),
        TemplateKind::Provisioned => ensure_provisioned_template_db(),
    };
    let test_db_path = unique_test_db_path(kind);

    if let Some(parent) = test_db_path.parent() {
        std::fs::create_dir_all(parent).expect("test db dir should be creatable");
    }

    std::fs::copy(&template, &test_db_path).expect("template db should be copied");
    test_db_path
}

fn ensure_template_db() -> PathBuf {
    static TEMPLATE_PATH: OnceLock<PathBuf> = OnceLock::new();

    TEMPLATE_PATH
        .get_or_init(|| {
            let template_path = std::env::var("TEST_DB_TEMPLATE_PATH")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| template_dir().join("wallclock_test.db"));

            build_template(&template_path, |_| {});
            template_path
        })
        .clone()
}

fn ensure_provisioned_template_db() -> PathBuf {
    static TEMPLATE_PATH: OnceLock<PathBuf> = OnceLock::new();

    TEMPLATE_PATH
        .get_or_init(|| {
            let template_path = template_dir().join("wallclock_provisioned_test.db");

            build_template(&template_path, |connection| {
                db::put_preferences(
                    connection,
                    &[
                        (db::KEY_API_URL, "https://time.example.test/api".to_string()),
                        (db::KEY_API_TOKEN, "template-token".to_string()),
                        (db::KEY_WORK_HOURS, "7".to_string()),
                        (db::KEY_LED_BRIGHTNESS, "64".to_string()),
                    ],
                )
                .expect("template preferences should be written");
                db::save_session(connection, "b0", 1_771_574_400)
                    .expect("template session should be written");
            });
            template_path
        })
        .clone()
}

fn build_template(path: &Path, seed: impl FnOnce(&mut rusqlite::Connection)) {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).expect("template parent dir should be creatable");
    }
    if path.exists() {
        std::fs::remove_file(path).expect("stale template should be removable");
    }

    let mut connection =
        open_connection(path.to_string_lossy().as_ref()).expect("template db opens");
    run_migrations(&mut connection).expect("template migrations should succeed");
    seed(&mut connection);
}

fn template_dir() -> PathBuf {
    Path::new("./target/testdb").join("templates")
}

fn unique_test_db_path(kind: TemplateKind) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    let label = match kind {
        TemplateKind::Empty => "empty",
        TemplateKind::Provisioned => "provisioned",
    };
    Path::new("./target/testdb").join(format!("{label}-{now}-{counter}.sqlite"))
}
