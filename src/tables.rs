//! Floor-plan tables and the derived occupancy view.
//!
//! Occupancy is never persisted; it is recomputed from operational orders
//! on every read, so a stale flag cannot survive a crash or a reconcile.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::db::DbState;
use crate::error::PosError;
use crate::events::{EventBus, StoreEvent};
use crate::models::{QueueAction, Table, TableWithOccupancy};
use crate::queue::{self, payloads};

fn table_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Table> {
    Ok(Table {
        id: row.get(0)?,
        label: row.get(1)?,
        pos_x: row.get(2)?,
        pos_y: row.get(3)?,
        width: row.get(4)?,
        height: row.get(5)?,
        is_takeaway: row.get::<_, i64>(6)? != 0,
    })
}

pub fn get_table(conn: &Connection, id: &str) -> Result<Table, PosError> {
    conn.query_row(
        "SELECT id, label, pos_x, pos_y, width, height, is_takeaway
         FROM tables WHERE id = ?1",
        params![id],
        table_from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found(format!("table {id}")))
}

pub fn list_tables(conn: &Connection) -> Result<Vec<Table>, PosError> {
    let mut stmt = conn.prepare(
        "SELECT id, label, pos_x, pos_y, width, height, is_takeaway
         FROM tables ORDER BY label ASC",
    )?;
    let rows = stmt.query_map([], table_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Tables joined against their operational order, if any. Takeaway tables
/// report the newest open order but are never blocked by it.
pub fn tables_with_occupancy(conn: &Connection) -> Result<Vec<TableWithOccupancy>, PosError> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.label, t.pos_x, t.pos_y, t.width, t.height, t.is_takeaway,
                (SELECT o.id FROM orders o
                 WHERE o.table_id = t.id
                   AND o.status IN ('pending', 'cooking', 'ready')
                 ORDER BY o.updated_at DESC LIMIT 1) AS order_id
         FROM tables t ORDER BY t.label ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let table = table_from_row(row)?;
        let order_id: Option<String> = row.get(7)?;
        Ok(TableWithOccupancy {
            occupied: order_id.is_some(),
            order_id,
            table,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Replace the whole floor plan in one transaction and queue the new
/// layout for the remote backend.
pub fn replace_layout(
    db: &DbState,
    bus: &EventBus,
    layout: Vec<Table>,
) -> Result<(), PosError> {
    for table in &layout {
        if table.label.trim().is_empty() {
            return Err(PosError::invalid("table label cannot be empty"));
        }
    }

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    tx.execute("DELETE FROM tables", [])?;
    for table in &layout {
        tx.execute(
            "INSERT INTO tables (id, label, pos_x, pos_y, width, height, is_takeaway)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                table.id,
                table.label,
                table.pos_x,
                table.pos_y,
                table.width,
                table.height,
                table.is_takeaway as i64,
            ],
        )?;
    }
    queue::enqueue(
        &tx,
        QueueAction::ReplaceTableLayout,
        &payloads::table_layout(&layout),
    )?;
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    info!(tables = layout.len(), "Table layout replaced");
    bus.publish(StoreEvent::TablesChanged);
    bus.publish(StoreEvent::QueueChanged { pending });
    Ok(())
}

/// Remove one table. Refused while an operational order still points at it.
pub fn delete_table(db: &DbState, bus: &EventBus, id: &str) -> Result<(), PosError> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    get_table(&tx, id)?;
    if crate::orders::operational_order_for_table(&tx, id)?.is_some() {
        return Err(PosError::invalid(format!(
            "table {id} still has an open order"
        )));
    }
    tx.execute("DELETE FROM tables WHERE id = ?1", params![id])?;
    queue::enqueue(&tx, QueueAction::DeleteTable, &payloads::delete_table(id))?;
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    bus.publish(StoreEvent::TablesChanged);
    bus.publish(StoreEvent::QueueChanged { pending });
    Ok(())
}
