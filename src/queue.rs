//! Durable outbound command queue.
//!
//! Every local mutation that must reach the remote backend first lands
//! here, inside the same transaction as the store write that produced it.
//! The sync engine drains entries strictly in id order; entries disappear
//! on success or once their retry count exceeds the policy ceiling.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::PosError;
use crate::models::{QueueAction, QueueEntry};

/// Append an entry. Call inside the transaction of the local write it
/// mirrors so a crash never separates the two.
pub fn enqueue(conn: &Connection, action: QueueAction, payload: &Value) -> Result<i64, PosError> {
    conn.execute(
        "INSERT INTO offline_queue (action, payload) VALUES (?1, ?2)",
        params![action.as_str(), payload.to_string()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Read the oldest pending entries, bounded to one drain batch.
pub fn pending_batch(conn: &Connection, limit: usize) -> Result<Vec<QueueEntry>, PosError> {
    let mut stmt = conn.prepare(
        "SELECT id, action, payload, created_at, retry_count, last_error
         FROM offline_queue
         ORDER BY id ASC
         LIMIT ?1",
    )?;

    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut entries = Vec::new();
    let mut unreplayable = Vec::new();
    for row in rows {
        let (id, action_raw, payload_raw, created_at, retry_count, last_error) = row?;
        // An entry whose action this build does not know cannot be
        // replayed and would block the queue forever.
        let Some(action) = QueueAction::parse(&action_raw) else {
            tracing::warn!(id, action = %action_raw, "Dropping unreplayable queue entry");
            unreplayable.push(id);
            continue;
        };
        let payload = serde_json::from_str::<Value>(&payload_raw).unwrap_or(Value::Null);
        entries.push(QueueEntry {
            id,
            action,
            payload,
            created_at,
            retry_count,
            last_error,
        });
    }
    for id in unreplayable {
        delete_entry(conn, id)?;
    }
    Ok(entries)
}

/// Remove a successfully replayed (or permanently dropped) entry.
pub fn delete_entry(conn: &Connection, id: i64) -> Result<(), PosError> {
    conn.execute("DELETE FROM offline_queue WHERE id = ?1", params![id])?;
    Ok(())
}

/// Record a failed attempt. Returns the new retry count.
pub fn record_failure(conn: &Connection, id: i64, error: &str) -> Result<i64, PosError> {
    conn.execute(
        "UPDATE offline_queue SET retry_count = retry_count + 1, last_error = ?2 WHERE id = ?1",
        params![id, error],
    )?;
    let count = conn
        .query_row(
            "SELECT retry_count FROM offline_queue WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    Ok(count)
}

/// Record a transient failure without consuming a retry: ordering is
/// preserved and the entry is attempted again on the next trigger.
pub fn record_transient(conn: &Connection, id: i64, error: &str) -> Result<(), PosError> {
    conn.execute(
        "UPDATE offline_queue SET last_error = ?2 WHERE id = ?1",
        params![id, error],
    )?;
    Ok(())
}

/// Total entries awaiting replay.
pub fn pending_count(conn: &Connection) -> Result<i64, PosError> {
    let count = conn.query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))?;
    Ok(count)
}

/// Entries still referencing the given order. An order is only `synced`
/// once none remain.
pub fn pending_count_for_order(conn: &Connection, order_id: &str) -> Result<i64, PosError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM offline_queue
         WHERE action IN ('create-order', 'update-order', 'replace-order-items')
           AND json_extract(payload, '$.order_id') = ?1",
        params![order_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Rewrite the `menu_item_id` carried by item snapshots in queued
/// order-scoped payloads. Called inside the identity-promotion
/// transaction so later replays name the server-assigned id.
pub fn repoint_order_item_payloads(
    conn: &Connection,
    old_id: &str,
    new_id: &str,
) -> Result<(), PosError> {
    let mut stmt = conn.prepare(
        "SELECT id, payload FROM offline_queue
         WHERE action IN ('create-order', 'replace-order-items')",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (id, raw) in rows {
        let mut payload: Value = serde_json::from_str(&raw)?;
        let Some(items) = payload.get_mut("items").and_then(Value::as_array_mut) else {
            continue;
        };
        let mut changed = false;
        for item in items {
            if item.get("menu_item_id").and_then(Value::as_str) == Some(old_id) {
                item["menu_item_id"] = Value::String(new_id.to_string());
                changed = true;
            }
        }
        if changed {
            conn.execute(
                "UPDATE offline_queue SET payload = ?2 WHERE id = ?1",
                params![id, payload.to_string()],
            )?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Payload builders
// ---------------------------------------------------------------------------

/// Queue payload constructors. Order-scoped payloads carry a top-level
/// `order_id` so sync-status bookkeeping can find them without parsing
/// the nested record.
pub mod payloads {
    use serde_json::{json, Value};

    use crate::models::{AuditLogEntry, MenuItem, Order, OrderItem, Table};

    pub fn create_order(order: &Order, items: &[OrderItem]) -> Value {
        json!({ "order_id": order.id, "order": order, "items": items })
    }

    pub fn update_order(order: &Order) -> Value {
        json!({ "order_id": order.id, "order": order })
    }

    pub fn replace_order_items(order_id: &str, items: &[OrderItem]) -> Value {
        json!({ "order_id": order_id, "items": items })
    }

    pub fn menu_item(item: &MenuItem) -> Value {
        json!({ "item": item })
    }

    pub fn delete_menu_item(id: &str) -> Value {
        json!({ "id": id })
    }

    pub fn audit_log(entry: &AuditLogEntry) -> Value {
        json!({ "entry": entry })
    }

    pub fn table_layout(tables: &[Table]) -> Value {
        json!({ "tables": tables })
    }

    pub fn delete_table(id: &str) -> Value {
        json!({ "id": id })
    }
}
