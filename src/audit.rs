//! Append-only audit trail for privileged actions.

use rusqlite::{params, Connection};
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::error::PosError;
use crate::events::{EventBus, StoreEvent};
use crate::models::{AuditLogEntry, QueueAction};
use crate::queue::{self, payloads};
use crate::session::Session;

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    Ok(AuditLogEntry {
        id: row.get(0)?,
        action: row.get(1)?,
        actor_role: row.get(2)?,
        created_at: row.get(3)?,
        synced_at: row.get(4)?,
    })
}

/// Record an action with the actor's role and queue it for upload.
pub fn append(
    db: &DbState,
    bus: &EventBus,
    session: &Session,
    action: &str,
) -> Result<AuditLogEntry, PosError> {
    if action.trim().is_empty() {
        return Err(PosError::invalid("audit action cannot be empty"));
    }

    let entry = AuditLogEntry {
        id: Uuid::new_v4().to_string(),
        action: action.to_string(),
        actor_role: session.role.as_str().to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
        synced_at: None,
    };

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO audit_logs (id, action, actor_role, created_at, synced_at)
         VALUES (?1, ?2, ?3, ?4, NULL)",
        params![entry.id, entry.action, entry.actor_role, entry.created_at],
    )?;
    queue::enqueue(&tx, QueueAction::AppendAuditLog, &payloads::audit_log(&entry))?;
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    info!(action = %entry.action, role = %entry.actor_role, "Audit entry recorded");
    bus.publish(StoreEvent::QueueChanged { pending });
    Ok(entry)
}

/// Stamp an entry as uploaded. Called by the sync engine after the remote
/// append succeeds.
pub(crate) fn mark_synced(conn: &Connection, id: &str) -> Result<(), PosError> {
    conn.execute(
        "UPDATE audit_logs SET synced_at = ?2 WHERE id = ?1",
        params![id, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Recent entries, newest first.
pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<AuditLogEntry>, PosError> {
    let mut stmt = conn.prepare(
        "SELECT id, action, actor_role, created_at, synced_at
         FROM audit_logs ORDER BY created_at DESC, id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], entry_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
