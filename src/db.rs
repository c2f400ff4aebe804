//! Local SQLite store for the Tably POS terminal.
//!
//! Uses rusqlite with WAL mode. The store is the single source of truth
//! while the device is offline: orders, line items, tables, menu items,
//! the outbound command queue, a settings store, and the audit log all
//! live here. Provides schema migrations and settings helpers; feature
//! modules own their row-level SQL.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::PosError;

/// Shared handle to the local store.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Acquire the connection. A poisoned lock means a writer panicked
    /// mid-transaction; treat the store as unavailable rather than risk
    /// partial state.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, PosError> {
        self.conn
            .lock()
            .map_err(|e| PosError::StorageUnavailable(format!("connection lock poisoned: {e}")))
    }

    /// Open an in-memory store with the full schema, for tests and
    /// ephemeral use.
    pub fn in_memory() -> Result<DbState, PosError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        run_migrations(&conn)?;
        Ok(DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/tably.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, PosError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| PosError::StorageUnavailable(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("tably.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path).map_err(|e| {
                PosError::StorageUnavailable(format!("open failed after retry: {e}"))
            })?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), PosError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: core tables for the offline store.
fn migrate_v1(conn: &Connection) -> Result<(), PosError> {
    conn.execute_batch(
        "
        -- orders
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            table_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'cooking', 'ready', 'completed', 'cancelled')),
            subtotal REAL NOT NULL DEFAULT 0,
            discount_amount REAL NOT NULL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            payment_method TEXT,
            staff_id TEXT,
            note TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (sync_status IN ('synced', 'pending', 'error'))
        );

        -- order_items (price/name snapshotted at add time)
        CREATE TABLE IF NOT EXISTS order_items (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            menu_item_id TEXT NOT NULL,
            name TEXT NOT NULL,
            price REAL NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity > 0),
            note TEXT,
            FOREIGN KEY(order_id) REFERENCES orders(id) ON DELETE CASCADE
        );

        -- tables (occupancy is derived from orders, never stored)
        CREATE TABLE IF NOT EXISTS tables (
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            pos_x REAL NOT NULL DEFAULT 0,
            pos_y REAL NOT NULL DEFAULT 0,
            width REAL NOT NULL DEFAULT 1,
            height REAL NOT NULL DEFAULT 1,
            is_takeaway INTEGER NOT NULL DEFAULT 0
        );

        -- menu_items
        CREATE TABLE IF NOT EXISTS menu_items (
            id TEXT PRIMARY KEY,
            uid TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            price REAL NOT NULL DEFAULT 0,
            category TEXT NOT NULL DEFAULT '',
            in_stock INTEGER NOT NULL DEFAULT 1
        );

        -- offline_queue (append-only; id defines replay order)
        CREATE TABLE IF NOT EXISTS offline_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );

        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_table_id ON orders(table_id);
        CREATE INDEX IF NOT EXISTS idx_orders_sync_status ON orders(sync_status);
        CREATE INDEX IF NOT EXISTS idx_order_items_order_id ON order_items(order_id);
        CREATE INDEX IF NOT EXISTS idx_offline_queue_action ON offline_queue(action);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key
            ON local_settings(setting_category, setting_key);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        PosError::Storage(e)
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: append-only audit log.
fn migrate_v2(conn: &Connection) -> Result<(), PosError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS audit_logs (
            id TEXT PRIMARY KEY,
            action TEXT NOT NULL,
            actor_role TEXT NOT NULL,
            created_at TEXT NOT NULL,
            synced_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_audit_logs_created_at ON audit_logs(created_at);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        PosError::Storage(e)
    })?;

    info!("Applied migration v2 (audit_logs table)");
    Ok(())
}

/// Migration v3: time-window index for the reconciler's pull queries and
/// a menu lookup index for identity promotion.
fn migrate_v3(conn: &Connection) -> Result<(), PosError> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_orders_updated_at ON orders(updated_at);
        CREATE INDEX IF NOT EXISTS idx_order_items_menu_item_id
            ON order_items(menu_item_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        PosError::Storage(e)
    })?;

    info!("Applied migration v3 (reconciler indexes)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), PosError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
