//! Local menu catalog.
//!
//! Items created while offline receive a `local-` prefixed placeholder id
//! plus a stable `uid`; the sync engine swaps the placeholder for the
//! server-assigned id once the upsert lands (identity promotion).

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::error::PosError;
use crate::events::{EventBus, StoreEvent};
use crate::models::{MenuItem, QueueAction, LOCAL_ID_PREFIX};
use crate::queue::{self, payloads};

fn menu_item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MenuItem> {
    Ok(MenuItem {
        id: row.get(0)?,
        uid: row.get(1)?,
        name: row.get(2)?,
        price: row.get(3)?,
        category: row.get(4)?,
        in_stock: row.get::<_, i64>(5)? != 0,
    })
}

pub fn get_item(conn: &Connection, id: &str) -> Result<MenuItem, PosError> {
    conn.query_row(
        "SELECT id, uid, name, price, category, in_stock FROM menu_items WHERE id = ?1",
        params![id],
        menu_item_from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found(format!("menu item {id}")))
}

pub fn list_items(conn: &Connection) -> Result<Vec<MenuItem>, PosError> {
    let mut stmt = conn.prepare(
        "SELECT id, uid, name, price, category, in_stock
         FROM menu_items ORDER BY category ASC, name ASC",
    )?;
    let rows = stmt.query_map([], menu_item_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub(crate) fn upsert_item_row(conn: &Connection, item: &MenuItem) -> Result<(), PosError> {
    conn.execute(
        "INSERT INTO menu_items (id, uid, name, price, category, in_stock)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            price = excluded.price,
            category = excluded.category,
            in_stock = excluded.in_stock",
        params![
            item.id,
            item.uid,
            item.name,
            item.price,
            item.category,
            item.in_stock as i64,
        ],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMenuItem {
    pub name: String,
    pub price: f64,
    pub category: String,
    pub in_stock: bool,
}

fn validate(name: &str, price: f64) -> Result<(), PosError> {
    if name.trim().is_empty() {
        return Err(PosError::invalid("menu item name cannot be empty"));
    }
    if price < 0.0 {
        return Err(PosError::invalid("menu item price cannot be negative"));
    }
    Ok(())
}

/// Create an item with a placeholder id and queue the upsert.
pub fn create_item(db: &DbState, bus: &EventBus, req: NewMenuItem) -> Result<MenuItem, PosError> {
    validate(&req.name, req.price)?;

    let uid = Uuid::new_v4().to_string();
    let item = MenuItem {
        id: format!("{LOCAL_ID_PREFIX}{uid}"),
        uid,
        name: req.name,
        price: req.price,
        category: req.category,
        in_stock: req.in_stock,
    };

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    upsert_item_row(&tx, &item)?;
    queue::enqueue(&tx, QueueAction::UpsertMenuItem, &payloads::menu_item(&item))?;
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    info!(id = %item.id, name = %item.name, "Menu item created locally");
    bus.publish(StoreEvent::MenuChanged);
    bus.publish(StoreEvent::QueueChanged { pending });
    Ok(item)
}

/// Edit an existing item. Items still carrying a placeholder id re-queue
/// as upserts so the server sees one create with the final field values.
pub fn update_item(
    db: &DbState,
    bus: &EventBus,
    id: &str,
    req: NewMenuItem,
) -> Result<MenuItem, PosError> {
    validate(&req.name, req.price)?;

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    let mut item = get_item(&tx, id)?;
    item.name = req.name;
    item.price = req.price;
    item.category = req.category;
    item.in_stock = req.in_stock;

    upsert_item_row(&tx, &item)?;
    let action = if item.has_local_id() {
        QueueAction::UpsertMenuItem
    } else {
        QueueAction::UpdateMenuItem
    };
    queue::enqueue(&tx, action, &payloads::menu_item(&item))?;
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    bus.publish(StoreEvent::MenuChanged);
    bus.publish(StoreEvent::QueueChanged { pending });
    Ok(item)
}

/// Delete an item locally and queue the remote delete. Order item lines
/// keep their name and price snapshots, so history is unaffected.
pub fn delete_item(db: &DbState, bus: &EventBus, id: &str) -> Result<(), PosError> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    let item = get_item(&tx, id)?;
    tx.execute("DELETE FROM menu_items WHERE id = ?1", params![id])?;
    if item.has_local_id() {
        // The server never saw this item. Retract its queued writes
        // instead of sending a create followed by a delete.
        tx.execute(
            "DELETE FROM offline_queue
             WHERE action IN ('upsert-menu-item', 'update-menu-item')
               AND json_extract(payload, '$.item.uid') = ?1",
            params![item.uid],
        )?;
    } else {
        queue::enqueue(
            &tx,
            QueueAction::DeleteMenuItem,
            &payloads::delete_menu_item(id),
        )?;
    }
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    info!(id, "Menu item deleted locally");
    bus.publish(StoreEvent::MenuChanged);
    bus.publish(StoreEvent::QueueChanged { pending });
    Ok(())
}
