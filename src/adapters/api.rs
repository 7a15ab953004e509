use actix_cors::Cors;
use actix_web::{HttpResponse, Responder, get, web};
use serde::Serialize;

use crate::adapters::display::SharedSnapshot;
use crate::app::services::{SessionStore, SqliteSessionStore, StoreDiagnostics, StoreError};
use crate::domain::models::WorkSession;

#[derive(Clone)]
pub struct ApiState {
    pub snapshot: SharedSnapshot,
    pub store: SqliteSessionStore,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreDiagnosticsResponse {
    pub schema_version: u32,
    pub preferences_count: i64,
    pub remote_configured: bool,
    pub work_hours: u8,
    pub persisted_session: Option<WorkSession>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(get_device_endpoint)
        .service(get_store_diagnostics_endpoint);
}

/// Read-only API: any origin may GET.
pub fn cors() -> Cors {
    Cors::default()
        .allow_any_origin()
        .allowed_methods(vec!["GET"])
        .max_age(3600)
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[get("/device")]
async fn get_device_endpoint(state: web::Data<ApiState>) -> impl Responder {
    match state.snapshot.lock() {
        Ok(snapshot) => HttpResponse::Ok().json(&*snapshot),
        Err(_) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": "device snapshot lock poisoned"
        })),
    }
}

#[get("/diagnostics/store")]
async fn get_store_diagnostics_endpoint(state: web::Data<ApiState>) -> impl Responder {
    let schema_version = match state.store.get_schema_version() {
        Ok(value) => value,
        Err(error) => return store_error_response(error),
    };
    let preferences_count = match state.store.count_preferences() {
        Ok(value) => value,
        Err(error) => return store_error_response(error),
    };
    let config = match state.store.load_config() {
        Ok(value) => value,
        Err(error) => return store_error_response(error),
    };
    let persisted_session = match state.store.load_session() {
        Ok(value) => value,
        Err(error) => return store_error_response(error),
    };

    HttpResponse::Ok().json(StoreDiagnosticsResponse {
        schema_version,
        preferences_count,
        remote_configured: config.is_remote_configured(),
        work_hours: config.work_hours,
        persisted_session,
    })
}

fn store_error_response(error: StoreError) -> HttpResponse {
    match error {
        StoreError::DbLockPoisoned => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": "database lock poisoned"
        })),
        StoreError::Database(error) => {
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": format!("database query failed: {error}")
            }))
        }
        StoreError::InvalidValue { key, .. } => {
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": format!("stored value for {key} is invalid")
            }))
        }
    }
}
