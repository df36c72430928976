// Membership Ledger - Web Server
// Read-only REST API over the ledger database

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use membership_ledger::{
    action_log::entries_for_target, active_memberships, db, expiring_memberships,
    list_membership_types, list_memberships, ActionLogEntry, CurrentMembership, LedgerConfig,
    LedgerResult, MembershipType, Target,
};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    expiring_soon_days: i64,
}

impl AppState {
    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.db.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    fn failed(data: T, error: String) -> Self {
        Self {
            success: false,
            data,
            error: Some(error),
        }
    }
}

/// Current memberships of one user, split by whether they are still running
#[derive(Serialize)]
struct UserMembershipsResponse {
    username: String,
    active: Vec<CurrentMembership>,
    all: Vec<CurrentMembership>,
}

fn respond<T: Serialize>(what: &str, result: LedgerResult<T>, empty: T) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(data))).into_response(),
        Err(e) => {
            error!(error = %e, "Error getting {}", what);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::failed(empty, e.to_string())),
            )
                .into_response()
        }
    }
}

fn decode_username(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/membership-types - Enabled membership types in display order
async fn get_membership_types(State(state): State<AppState>) -> Response {
    let conn = state.conn();
    respond(
        "membership types",
        list_membership_types(&conn, false),
        Vec::<MembershipType>::new(),
    )
}

/// GET /api/users/:username/memberships - Current state for one user
async fn get_user_memberships(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Response {
    let conn = state.conn();
    let target = Target::user(&decode_username(&username));

    let result = active_memberships(&conn, &target, db::now()).and_then(|active| {
        Ok(UserMembershipsResponse {
            username: target.identifier().to_string(),
            active,
            all: list_memberships(&conn, &target)?,
        })
    });
    respond(
        "user memberships",
        result,
        UserMembershipsResponse {
            username: target.identifier().to_string(),
            active: Vec::new(),
            all: Vec::new(),
        },
    )
}

/// GET /api/users/:username/log - Action history for one user
async fn get_user_log(State(state): State<AppState>, Path(username): Path<String>) -> Response {
    let conn = state.conn();
    let target = Target::user(&decode_username(&username));
    respond(
        "user log",
        entries_for_target(&conn, &target),
        Vec::<ActionLogEntry>::new(),
    )
}

/// GET /api/memberships/expiring - Memberships running out soon
async fn get_expiring(State(state): State<AppState>) -> Response {
    let conn = state.conn();
    respond(
        "expiring memberships",
        expiring_memberships(&conn, db::now(), state.expiring_soon_days),
        Vec::<CurrentMembership>::new(),
    )
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var_os("MEMBERSHIP_LEDGER_CONFIG") {
        Some(path) => LedgerConfig::from_file(std::path::Path::new(&path))?,
        None => LedgerConfig::default(),
    };
    let db_path = std::env::var_os("MEMBERSHIP_LEDGER_DB")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| config.database_path.clone());

    if !db_path.exists() {
        anyhow::bail!(
            "Database not found at {:?}. Run `membership-ledger init` first.",
            db_path
        );
    }

    let conn = Connection::open(&db_path)
        .with_context(|| format!("Failed to open database {:?}", db_path))?;
    info!(path = ?db_path, "Database opened");

    // Create shared state
    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        expiring_soon_days: config.expiring_soon_days,
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/membership-types", get(get_membership_types))
        .route("/users/:username/memberships", get(get_user_memberships))
        .route("/users/:username/log", get(get_user_log))
        .route("/memberships/expiring", get(get_expiring))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    // Start server
    let addr = std::env::var("MEMBERSHIP_LEDGER_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "Server running");

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;
    Ok(())
}
