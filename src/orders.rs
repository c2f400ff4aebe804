//! Order lifecycle operations.
//!
//! Every operation is local-first: the store write and the matching
//! command queue entries commit in one SQLite transaction, so a crash can
//! never leave a local mutation without its outbound mirror. Events are
//! published only after the transaction commits.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::error::PosError;
use crate::events::{EventBus, StoreEvent};
use crate::models::{
    normalize_note, NewOrderItem, Order, OrderItem, OrderStatus, SyncStatus, Table,
};
use crate::queue::{self, payloads};
use crate::tables;

const ORDER_COLUMNS: &str = "id, table_id, status, subtotal, discount_amount, total, \
     payment_method, staff_id, note, created_at, updated_at, version, sync_status";

// ---------------------------------------------------------------------------
// Row access
// ---------------------------------------------------------------------------

fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn order_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    let status_raw: String = row.get(2)?;
    let sync_raw: String = row.get(12)?;
    Ok(Order {
        id: row.get(0)?,
        table_id: row.get(1)?,
        status: OrderStatus::parse(&status_raw)
            .ok_or_else(|| bad_column(2, format!("unknown order status {status_raw}")))?,
        subtotal: row.get(3)?,
        discount_amount: row.get(4)?,
        total: row.get(5)?,
        payment_method: row.get(6)?,
        staff_id: row.get(7)?,
        note: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        version: row.get(11)?,
        sync_status: SyncStatus::parse(&sync_raw)
            .ok_or_else(|| bad_column(12, format!("unknown sync status {sync_raw}")))?,
    })
}

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderItem> {
    Ok(OrderItem {
        id: row.get(0)?,
        order_id: row.get(1)?,
        menu_item_id: row.get(2)?,
        name: row.get(3)?,
        price: row.get(4)?,
        quantity: row.get(5)?,
        note: row.get(6)?,
    })
}

/// Fetch an order, or `None` if the id is unknown.
pub fn try_get_order(conn: &Connection, id: &str) -> Result<Option<Order>, PosError> {
    let order = conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
            params![id],
            order_from_row,
        )
        .optional()?;
    Ok(order)
}

/// Fetch an order or fail with `NotFound`.
pub fn get_order(conn: &Connection, id: &str) -> Result<Order, PosError> {
    try_get_order(conn, id)?.ok_or_else(|| PosError::not_found(format!("order {id}")))
}

/// All orders, most recent first.
pub fn list_orders(conn: &Connection) -> Result<Vec<Order>, PosError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at DESC, id DESC"
    ))?;
    let rows = stmt.query_map([], order_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Item lines for an order, in insertion order.
pub fn items_for_order(conn: &Connection, order_id: &str) -> Result<Vec<OrderItem>, PosError> {
    let mut stmt = conn.prepare(
        "SELECT id, order_id, menu_item_id, name, price, quantity, note
         FROM order_items WHERE order_id = ?1 ORDER BY rowid ASC",
    )?;
    let rows = stmt.query_map(params![order_id], item_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Fetch an order together with its items.
pub fn get_order_with_items(
    conn: &Connection,
    id: &str,
) -> Result<(Order, Vec<OrderItem>), PosError> {
    let order = get_order(conn, id)?;
    let items = items_for_order(conn, id)?;
    Ok((order, items))
}

/// The operational order occupying a table, if any.
pub fn operational_order_for_table(
    conn: &Connection,
    table_id: &str,
) -> Result<Option<Order>, PosError> {
    let order = conn
        .query_row(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE table_id = ?1 AND status IN ('pending', 'cooking', 'ready')
                 ORDER BY updated_at DESC LIMIT 1"
            ),
            params![table_id],
            order_from_row,
        )
        .optional()?;
    Ok(order)
}

/// Insert or fully overwrite an order row.
pub(crate) fn upsert_order_row(conn: &Connection, order: &Order) -> Result<(), PosError> {
    conn.execute(
        "INSERT INTO orders (id, table_id, status, subtotal, discount_amount, total,
                             payment_method, staff_id, note, created_at, updated_at,
                             version, sync_status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(id) DO UPDATE SET
            table_id = excluded.table_id,
            status = excluded.status,
            subtotal = excluded.subtotal,
            discount_amount = excluded.discount_amount,
            total = excluded.total,
            payment_method = excluded.payment_method,
            staff_id = excluded.staff_id,
            note = excluded.note,
            updated_at = excluded.updated_at,
            version = excluded.version,
            sync_status = excluded.sync_status",
        params![
            order.id,
            order.table_id,
            order.status.as_str(),
            order.subtotal,
            order.discount_amount,
            order.total,
            order.payment_method,
            order.staff_id,
            order.note,
            order.created_at,
            order.updated_at,
            order.version,
            order.sync_status.as_str(),
        ],
    )?;
    Ok(())
}

/// Wholesale item replacement: delete-then-insert inside the caller's
/// transaction.
pub(crate) fn replace_items_rows(
    conn: &Connection,
    order_id: &str,
    items: &[OrderItem],
) -> Result<(), PosError> {
    conn.execute(
        "DELETE FROM order_items WHERE order_id = ?1",
        params![order_id],
    )?;
    for item in items {
        conn.execute(
            "INSERT INTO order_items (id, order_id, menu_item_id, name, price, quantity, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                item.id,
                order_id,
                item.menu_item_id,
                item.name,
                item.price,
                item.quantity,
                item.note
            ],
        )?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Totals and line merging
// ---------------------------------------------------------------------------

/// Round to cents; all money flows through this before persisting.
pub(crate) fn round_money(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

fn subtotal_of(items: &[OrderItem]) -> f64 {
    round_money(items.iter().map(|i| i.price * i.quantity as f64).sum())
}

fn recompute_totals(order: &mut Order, items: &[OrderItem]) {
    order.subtotal = subtotal_of(items);
    order.total = round_money(order.subtotal - order.discount_amount);
}

/// Mark an order as locally mutated: bump version, stamp updated_at,
/// flag for sync.
fn touch(order: &mut Order) {
    order.version += 1;
    order.updated_at = now();
    order.sync_status = SyncStatus::Pending;
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Merge new lines into existing ones by the (menu item, normalized note)
/// key, summing quantities. New keys append in input order.
fn merge_lines(order_id: &str, existing: &mut Vec<OrderItem>, incoming: &[NewOrderItem]) {
    for line in incoming {
        let key = (line.menu_item_id.clone(), normalize_note(line.note.as_deref()));
        if let Some(target) = existing.iter_mut().find(|i| i.merge_key() == key) {
            target.quantity += line.quantity;
        } else {
            existing.push(OrderItem {
                id: Uuid::new_v4().to_string(),
                order_id: order_id.to_string(),
                menu_item_id: line.menu_item_id.clone(),
                name: line.name.clone(),
                price: line.price,
                quantity: line.quantity,
                note: line.note.clone(),
            });
        }
    }
}

fn validate_lines(lines: &[NewOrderItem]) -> Result<(), PosError> {
    if lines.is_empty() {
        return Err(PosError::invalid("order requires at least one item"));
    }
    for line in lines {
        if line.quantity <= 0 {
            return Err(PosError::invalid(format!(
                "quantity must be positive for {}",
                line.name
            )));
        }
    }
    Ok(())
}

/// Reject when the destination table is held by a different operational
/// order. Takeaway tables are exempt from the one-order invariant.
fn ensure_table_free(
    conn: &Connection,
    table: &Table,
    ignoring_order: Option<&str>,
) -> Result<(), PosError> {
    if table.is_takeaway {
        return Ok(());
    }
    if let Some(existing) = operational_order_for_table(conn, &table.id)? {
        if Some(existing.id.as_str()) != ignoring_order {
            return Err(PosError::invalid(format!(
                "table {} already has an open order",
                table.label
            )));
        }
    }
    Ok(())
}

fn publish_order_events(bus: &EventBus, pending: i64) {
    bus.publish(StoreEvent::OrdersChanged);
    bus.publish(StoreEvent::QueueChanged { pending });
}

// ---------------------------------------------------------------------------
// Lifecycle operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub table_id: Option<String>,
    pub staff_id: Option<String>,
    pub note: Option<String>,
    pub items: Vec<NewOrderItem>,
}

/// Create an order: write order + merged items and enqueue the remote
/// mirror, all in one transaction.
pub fn create_order(
    db: &DbState,
    bus: &EventBus,
    req: CreateOrderRequest,
) -> Result<Order, PosError> {
    validate_lines(&req.items)?;

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    if let Some(table_id) = &req.table_id {
        let table = tables::get_table(&tx, table_id)?;
        ensure_table_free(&tx, &table, None)?;
    }

    let order_id = Uuid::new_v4().to_string();
    let mut items = Vec::new();
    merge_lines(&order_id, &mut items, &req.items);

    let created_at = now();
    let mut order = Order {
        id: order_id,
        table_id: req.table_id,
        status: OrderStatus::Pending,
        subtotal: 0.0,
        discount_amount: 0.0,
        total: 0.0,
        payment_method: None,
        staff_id: req.staff_id,
        note: req.note,
        created_at: created_at.clone(),
        updated_at: created_at,
        version: 1,
        sync_status: SyncStatus::Pending,
    };
    recompute_totals(&mut order, &items);

    upsert_order_row(&tx, &order)?;
    replace_items_rows(&tx, &order.id, &items)?;
    queue::enqueue(
        &tx,
        crate::models::QueueAction::CreateOrder,
        &payloads::create_order(&order, &items),
    )?;
    queue::enqueue(
        &tx,
        crate::models::QueueAction::ReplaceOrderItems,
        &payloads::replace_order_items(&order.id, &items),
    )?;
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    info!(order_id = %order.id, total = order.total, "Order created and queued for sync");
    publish_order_events(bus, pending);
    Ok(order)
}

/// Merge new lines into an existing operational order.
pub fn add_items(
    db: &DbState,
    bus: &EventBus,
    order_id: &str,
    lines: Vec<NewOrderItem>,
) -> Result<Order, PosError> {
    validate_lines(&lines)?;

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    let mut order = get_order(&tx, order_id)?;
    if !order.status.is_operational() {
        return Err(PosError::invalid(format!(
            "cannot add items to a {} order",
            order.status.as_str()
        )));
    }

    let mut items = items_for_order(&tx, order_id)?;
    merge_lines(order_id, &mut items, &lines);
    recompute_totals(&mut order, &items);
    touch(&mut order);

    upsert_order_row(&tx, &order)?;
    replace_items_rows(&tx, order_id, &items)?;
    queue::enqueue(
        &tx,
        crate::models::QueueAction::UpdateOrder,
        &payloads::update_order(&order),
    )?;
    queue::enqueue(
        &tx,
        crate::models::QueueAction::ReplaceOrderItems,
        &payloads::replace_order_items(order_id, &items),
    )?;
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    publish_order_events(bus, pending);
    Ok(order)
}

/// Advance the kitchen state machine one step (or cancel).
pub fn update_status(
    db: &DbState,
    bus: &EventBus,
    order_id: &str,
    next: OrderStatus,
) -> Result<Order, PosError> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    let mut order = get_order(&tx, order_id)?;
    if !order.status.can_transition_to(next) {
        return Err(PosError::invalid(format!(
            "cannot transition order from {} to {}",
            order.status.as_str(),
            next.as_str()
        )));
    }
    order.status = next;
    touch(&mut order);

    upsert_order_row(&tx, &order)?;
    queue::enqueue(
        &tx,
        crate::models::QueueAction::UpdateOrder,
        &payloads::update_order(&order),
    )?;
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    publish_order_events(bus, pending);
    Ok(order)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutRequest {
    /// Flat discount applied to the subtotal.
    pub discount_amount: Option<f64>,
    /// Explicit charge overriding the computed total.
    pub amount_override: Option<f64>,
    pub payment_method: String,
}

/// Complete an order: apply discount or explicit amount, stamp the
/// payment method, set status `completed`.
pub fn checkout(
    db: &DbState,
    bus: &EventBus,
    order_id: &str,
    req: CheckoutRequest,
) -> Result<Order, PosError> {
    if req.payment_method.trim().is_empty() {
        return Err(PosError::invalid("payment method is required"));
    }
    if let Some(discount) = req.discount_amount {
        if discount < 0.0 {
            return Err(PosError::invalid("discount cannot be negative"));
        }
    }

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    let mut order = get_order(&tx, order_id)?;
    if !order.status.is_operational() {
        return Err(PosError::invalid(format!(
            "cannot check out a {} order",
            order.status.as_str()
        )));
    }

    if let Some(discount) = req.discount_amount {
        if discount > order.subtotal {
            return Err(PosError::invalid("discount exceeds subtotal"));
        }
        order.discount_amount = round_money(discount);
    }
    order.total = match req.amount_override {
        Some(amount) if amount >= 0.0 => round_money(amount),
        Some(_) => return Err(PosError::invalid("payment amount cannot be negative")),
        None => round_money(order.subtotal - order.discount_amount),
    };
    order.payment_method = Some(req.payment_method);
    order.status = OrderStatus::Completed;
    touch(&mut order);

    upsert_order_row(&tx, &order)?;
    queue::enqueue(
        &tx,
        crate::models::QueueAction::UpdateOrder,
        &payloads::update_order(&order),
    )?;
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    info!(order_id = %order.id, total = order.total, "Order checked out");
    publish_order_events(bus, pending);
    Ok(order)
}

/// Cancel an order with a caller-supplied note. The "reset after the last
/// item was removed" path is this same operation with a different note.
pub fn cancel_order(
    db: &DbState,
    bus: &EventBus,
    order_id: &str,
    note: &str,
) -> Result<Order, PosError> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    let mut order = get_order(&tx, order_id)?;
    if order.status.is_terminal() {
        return Err(PosError::invalid(format!(
            "cannot cancel a {} order",
            order.status.as_str()
        )));
    }
    order.status = OrderStatus::Cancelled;
    order.note = Some(note.to_string());
    touch(&mut order);

    upsert_order_row(&tx, &order)?;
    queue::enqueue(
        &tx,
        crate::models::QueueAction::UpdateOrder,
        &payloads::update_order(&order),
    )?;
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    info!(order_id = %order.id, note, "Order cancelled");
    publish_order_events(bus, pending);
    Ok(order)
}

/// Re-point an order to another table. Fails if the destination already
/// has an operational order.
pub fn move_order(
    db: &DbState,
    bus: &EventBus,
    order_id: &str,
    dest_table_id: &str,
) -> Result<Order, PosError> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    let mut order = get_order(&tx, order_id)?;
    if !order.status.is_operational() {
        return Err(PosError::invalid(format!(
            "cannot move a {} order",
            order.status.as_str()
        )));
    }
    let dest = tables::get_table(&tx, dest_table_id)?;
    ensure_table_free(&tx, &dest, Some(order_id))?;

    order.table_id = Some(dest.id);
    touch(&mut order);

    upsert_order_row(&tx, &order)?;
    queue::enqueue(
        &tx,
        crate::models::QueueAction::UpdateOrder,
        &payloads::update_order(&order),
    )?;
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    publish_order_events(bus, pending);
    Ok(order)
}

/// Outcome of a merge: the cancelled source and the enlarged target.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub source: Order,
    pub target: Order,
}

/// Relocate every item from `source_id` onto `target_id`, cancel the
/// source, and recompute the target's totals.
pub fn merge_orders(
    db: &DbState,
    bus: &EventBus,
    source_id: &str,
    target_id: &str,
) -> Result<MergeOutcome, PosError> {
    if source_id == target_id {
        return Err(PosError::invalid("cannot merge an order into itself"));
    }

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    let mut source = get_order(&tx, source_id)?;
    let mut target = get_order(&tx, target_id)?;
    for (label, order) in [("source", &source), ("target", &target)] {
        if !order.status.is_operational() {
            return Err(PosError::invalid(format!(
                "{label} order is {}",
                order.status.as_str()
            )));
        }
    }

    let source_items = items_for_order(&tx, source_id)?;
    let mut target_items = items_for_order(&tx, target_id)?;
    let moved: Vec<NewOrderItem> = source_items
        .iter()
        .map(|i| NewOrderItem {
            menu_item_id: i.menu_item_id.clone(),
            name: i.name.clone(),
            price: i.price,
            quantity: i.quantity,
            note: i.note.clone(),
        })
        .collect();
    merge_lines(target_id, &mut target_items, &moved);

    recompute_totals(&mut target, &target_items);
    touch(&mut target);

    source.status = OrderStatus::Cancelled;
    source.note = Some(format!("merged into order {target_id}"));
    touch(&mut source);

    upsert_order_row(&tx, &target)?;
    replace_items_rows(&tx, target_id, &target_items)?;
    upsert_order_row(&tx, &source)?;
    replace_items_rows(&tx, source_id, &[])?;

    queue::enqueue(
        &tx,
        crate::models::QueueAction::UpdateOrder,
        &payloads::update_order(&target),
    )?;
    queue::enqueue(
        &tx,
        crate::models::QueueAction::ReplaceOrderItems,
        &payloads::replace_order_items(target_id, &target_items),
    )?;
    queue::enqueue(
        &tx,
        crate::models::QueueAction::UpdateOrder,
        &payloads::update_order(&source),
    )?;
    queue::enqueue(
        &tx,
        crate::models::QueueAction::ReplaceOrderItems,
        &payloads::replace_order_items(source_id, &[]),
    )?;
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    info!(source = %source_id, target = %target_id, "Orders merged");
    publish_order_events(bus, pending);
    Ok(MergeOutcome { source, target })
}

/// One line of a split request: how much of an existing order item moves
/// to the destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitLine {
    pub item_id: String,
    pub quantity: i64,
}

/// Outcome of a split: the reduced source and the destination order.
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub source: Order,
    pub destination: Order,
}

/// Partition a subset of item quantities from `source_id` onto an order
/// for `dest_table_id`. Partial-line splits leave a residual line on the
/// source; whole-line splits move the line. Per-menu-item quantity is
/// conserved.
pub fn split_order(
    db: &DbState,
    bus: &EventBus,
    source_id: &str,
    dest_table_id: &str,
    lines: Vec<SplitLine>,
) -> Result<SplitOutcome, PosError> {
    if lines.is_empty() {
        return Err(PosError::invalid("split requires at least one line"));
    }
    for line in &lines {
        if line.quantity <= 0 {
            return Err(PosError::invalid("split quantity must be positive"));
        }
    }

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    let mut source = get_order(&tx, source_id)?;
    if !source.status.is_operational() {
        return Err(PosError::invalid(format!(
            "cannot split a {} order",
            source.status.as_str()
        )));
    }
    if source.table_id.as_deref() == Some(dest_table_id) {
        return Err(PosError::invalid(
            "split destination must be a different table",
        ));
    }
    let dest_table = tables::get_table(&tx, dest_table_id)?;

    let mut source_items = items_for_order(&tx, source_id)?;

    // Work out the moved lines first, validating against the source.
    let mut moved: Vec<NewOrderItem> = Vec::new();
    for line in &lines {
        let Some(item) = source_items.iter_mut().find(|i| i.id == line.item_id) else {
            return Err(PosError::not_found(format!(
                "order item {} on order {source_id}",
                line.item_id
            )));
        };
        if line.quantity > item.quantity {
            return Err(PosError::invalid(format!(
                "split quantity {} exceeds line quantity {} for {}",
                line.quantity, item.quantity, item.name
            )));
        }
        moved.push(NewOrderItem {
            menu_item_id: item.menu_item_id.clone(),
            name: item.name.clone(),
            price: item.price,
            quantity: line.quantity,
            note: item.note.clone(),
        });
        item.quantity -= line.quantity;
    }
    source_items.retain(|i| i.quantity > 0);
    if source_items.is_empty() {
        return Err(PosError::invalid(
            "split would empty the source order; use move instead",
        ));
    }

    // Destination: an existing operational order on the table, or a new one.
    let existing_dest = operational_order_for_table(&tx, dest_table_id)?;
    let created_dest = existing_dest.is_none();
    let mut destination = match existing_dest {
        Some(order) => order,
        None => {
            let created_at = now();
            Order {
                id: Uuid::new_v4().to_string(),
                table_id: Some(dest_table.id.clone()),
                status: OrderStatus::Pending,
                subtotal: 0.0,
                discount_amount: 0.0,
                total: 0.0,
                payment_method: None,
                staff_id: source.staff_id.clone(),
                note: None,
                created_at: created_at.clone(),
                updated_at: created_at,
                version: 0,
                sync_status: SyncStatus::Pending,
            }
        }
    };
    let mut dest_items = if created_dest {
        Vec::new()
    } else {
        items_for_order(&tx, &destination.id)?
    };
    merge_lines(&destination.id, &mut dest_items, &moved);

    recompute_totals(&mut source, &source_items);
    touch(&mut source);
    recompute_totals(&mut destination, &dest_items);
    touch(&mut destination);

    upsert_order_row(&tx, &source)?;
    replace_items_rows(&tx, source_id, &source_items)?;
    upsert_order_row(&tx, &destination)?;
    replace_items_rows(&tx, &destination.id, &dest_items)?;

    if created_dest {
        queue::enqueue(
            &tx,
            crate::models::QueueAction::CreateOrder,
            &payloads::create_order(&destination, &dest_items),
        )?;
    } else {
        queue::enqueue(
            &tx,
            crate::models::QueueAction::UpdateOrder,
            &payloads::update_order(&destination),
        )?;
    }
    queue::enqueue(
        &tx,
        crate::models::QueueAction::ReplaceOrderItems,
        &payloads::replace_order_items(&destination.id, &dest_items),
    )?;
    queue::enqueue(
        &tx,
        crate::models::QueueAction::UpdateOrder,
        &payloads::update_order(&source),
    )?;
    queue::enqueue(
        &tx,
        crate::models::QueueAction::ReplaceOrderItems,
        &payloads::replace_order_items(source_id, &source_items),
    )?;
    let pending = queue::pending_count(&tx)?;
    tx.commit()?;
    drop(conn);

    info!(
        source = %source_id,
        destination = %destination.id,
        moved = lines.len(),
        "Order split"
    );
    publish_order_events(bus, pending);
    Ok(SplitOutcome {
        source,
        destination,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    pub(crate) fn test_db() -> DbState {
        DbState::in_memory().expect("in-memory db")
    }

    pub(crate) fn seed_table(db: &DbState, id: &str, takeaway: bool) {
        let conn = db.lock().expect("lock");
        conn.execute(
            "INSERT INTO tables (id, label, is_takeaway) VALUES (?1, ?2, ?3)",
            params![id, format!("Table {id}"), takeaway as i64],
        )
        .expect("seed table");
    }

    pub(crate) fn line(menu_item_id: &str, name: &str, price: f64, qty: i64) -> NewOrderItem {
        NewOrderItem {
            menu_item_id: menu_item_id.to_string(),
            name: name.to_string(),
            price,
            quantity: qty,
            note: None,
        }
    }

    fn quantities_by_menu_item(items: &[OrderItem]) -> HashMap<String, i64> {
        let mut map = HashMap::new();
        for item in items {
            *map.entry(item.menu_item_id.clone()).or_insert(0) += item.quantity;
        }
        map
    }

    #[test]
    fn test_create_order_computes_total_and_enqueues() {
        let db = test_db();
        let bus = EventBus::new();
        seed_table(&db, "t5", false);

        let order = create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: Some("t5".to_string()),
                staff_id: Some("u-1".to_string()),
                note: None,
                items: vec![line("A", "Item A", 10.0, 2)],
            },
        )
        .expect("create");

        assert_eq!(order.total, 20.0);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.sync_status, SyncStatus::Pending);

        let conn = db.lock().expect("lock");
        let batch = queue::pending_batch(&conn, 50).expect("batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].action, crate::models::QueueAction::CreateOrder);
        assert_eq!(
            batch[1].action,
            crate::models::QueueAction::ReplaceOrderItems
        );
    }

    #[test]
    fn test_create_rejects_occupied_table() {
        let db = test_db();
        let bus = EventBus::new();
        seed_table(&db, "t1", false);

        let req = CreateOrderRequest {
            table_id: Some("t1".to_string()),
            staff_id: None,
            note: None,
            items: vec![line("A", "Item A", 5.0, 1)],
        };
        create_order(&db, &bus, req.clone()).expect("first order");
        let err = create_order(&db, &bus, req).expect_err("second order must fail");
        assert!(matches!(err, PosError::InvalidOperation(_)));
    }

    #[test]
    fn test_create_allows_stacked_takeaway_orders() {
        let db = test_db();
        let bus = EventBus::new();
        seed_table(&db, "tw", true);

        let req = CreateOrderRequest {
            table_id: Some("tw".to_string()),
            staff_id: None,
            note: None,
            items: vec![line("A", "Item A", 5.0, 1)],
        };
        create_order(&db, &bus, req.clone()).expect("first takeaway");
        create_order(&db, &bus, req).expect("second takeaway is fine");
    }

    #[test]
    fn test_add_items_merges_by_menu_item_and_note() {
        let db = test_db();
        let bus = EventBus::new();
        seed_table(&db, "t5", false);

        let order = create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: Some("t5".to_string()),
                staff_id: None,
                note: None,
                items: vec![line("A", "Item A", 10.0, 2)],
            },
        )
        .expect("create");

        let updated = add_items(&db, &bus, &order.id, vec![line("A", "Item A", 10.0, 1)])
            .expect("add items");
        assert_eq!(updated.total, 30.0);
        assert_eq!(updated.version, 2);

        let conn = db.lock().expect("lock");
        let items = items_for_order(&conn, &order.id).expect("items");
        assert_eq!(items.len(), 1, "same key must merge into one line");
        assert_eq!(items[0].quantity, 3);
    }

    #[test]
    fn test_add_items_distinct_notes_stay_separate() {
        let db = test_db();
        let bus = EventBus::new();
        let order = create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: None,
                staff_id: None,
                note: None,
                items: vec![line("A", "Item A", 10.0, 1)],
            },
        )
        .expect("create");

        let mut spicy = line("A", "Item A", 10.0, 1);
        spicy.note = Some("extra spicy".to_string());
        add_items(&db, &bus, &order.id, vec![spicy]).expect("add");

        let conn = db.lock().expect("lock");
        let items = items_for_order(&conn, &order.id).expect("items");
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_checkout_applies_discount_and_completes() {
        let db = test_db();
        let bus = EventBus::new();
        let order = create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: None,
                staff_id: None,
                note: None,
                items: vec![line("A", "Item A", 10.0, 3)],
            },
        )
        .expect("create");

        let done = checkout(
            &db,
            &bus,
            &order.id,
            CheckoutRequest {
                discount_amount: Some(5.0),
                amount_override: None,
                payment_method: "cash".to_string(),
            },
        )
        .expect("checkout");

        assert_eq!(done.status, OrderStatus::Completed);
        assert_eq!(done.total, 25.0);
        assert_eq!(done.payment_method.as_deref(), Some("cash"));

        // Terminal states never regress.
        let err = update_status(&db, &bus, &order.id, OrderStatus::Cooking)
            .expect_err("completed order must not transition");
        assert!(matches!(err, PosError::InvalidOperation(_)));
    }

    #[test]
    fn test_checkout_rejects_excess_discount() {
        let db = test_db();
        let bus = EventBus::new();
        let order = create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: None,
                staff_id: None,
                note: None,
                items: vec![line("A", "Item A", 10.0, 1)],
            },
        )
        .expect("create");

        let err = checkout(
            &db,
            &bus,
            &order.id,
            CheckoutRequest {
                discount_amount: Some(50.0),
                amount_override: None,
                payment_method: "cash".to_string(),
            },
        )
        .expect_err("discount above subtotal");
        assert!(matches!(err, PosError::InvalidOperation(_)));
    }

    #[test]
    fn test_move_to_occupied_table_rejected() {
        let db = test_db();
        let bus = EventBus::new();
        seed_table(&db, "t1", false);
        seed_table(&db, "t2", false);

        let a = create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: Some("t1".to_string()),
                staff_id: None,
                note: None,
                items: vec![line("A", "Item A", 5.0, 1)],
            },
        )
        .expect("order a");
        create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: Some("t2".to_string()),
                staff_id: None,
                note: None,
                items: vec![line("B", "Item B", 5.0, 1)],
            },
        )
        .expect("order b");

        let err = move_order(&db, &bus, &a.id, "t2").expect_err("destination occupied");
        assert!(matches!(err, PosError::InvalidOperation(_)));

        // Moving to a free table works.
        seed_table(&db, "t3", false);
        let moved = move_order(&db, &bus, &a.id, "t3").expect("move");
        assert_eq!(moved.table_id.as_deref(), Some("t3"));
    }

    #[test]
    fn test_merge_invariant_holds() {
        let db = test_db();
        let bus = EventBus::new();
        seed_table(&db, "t1", false);
        seed_table(&db, "t2", false);

        let a = create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: Some("t1".to_string()),
                staff_id: None,
                note: None,
                items: vec![line("A", "Item A", 10.0, 2), line("B", "Item B", 4.0, 1)],
            },
        )
        .expect("order a");
        let b = create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: Some("t2".to_string()),
                staff_id: None,
                note: None,
                items: vec![line("A", "Item A", 10.0, 1)],
            },
        )
        .expect("order b");

        let outcome = merge_orders(&db, &bus, &a.id, &b.id).expect("merge");
        assert_eq!(outcome.source.status, OrderStatus::Cancelled);
        assert!(outcome
            .source
            .note
            .as_deref()
            .expect("merge note")
            .contains(&b.id));

        let conn = db.lock().expect("lock");
        let source_items = items_for_order(&conn, &a.id).expect("source items");
        assert!(source_items.is_empty(), "no item row remains under source");

        let target_items = items_for_order(&conn, &b.id).expect("target items");
        let total: f64 = target_items
            .iter()
            .map(|i| i.price * i.quantity as f64)
            .sum();
        assert_eq!(outcome.target.total, round_money(total));
        // 1 + 2 Item A merged into one line, plus Item B.
        assert_eq!(target_items.len(), 2);
        assert_eq!(quantities_by_menu_item(&target_items)["A"], 3);
    }

    #[test]
    fn test_split_conserves_quantities() {
        let db = test_db();
        let bus = EventBus::new();
        seed_table(&db, "t1", false);
        seed_table(&db, "takeaway", true);

        let order = create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: Some("t1".to_string()),
                staff_id: None,
                note: None,
                items: vec![line("A", "Item A", 10.0, 3), line("B", "Item B", 6.0, 2)],
            },
        )
        .expect("create");

        let before = {
            let conn = db.lock().expect("lock");
            quantities_by_menu_item(&items_for_order(&conn, &order.id).expect("items"))
        };

        let (item_a, item_b) = {
            let conn = db.lock().expect("lock");
            let items = items_for_order(&conn, &order.id).expect("items");
            (
                items.iter().find(|i| i.menu_item_id == "A").unwrap().id.clone(),
                items.iter().find(|i| i.menu_item_id == "B").unwrap().id.clone(),
            )
        };

        // Partial split of A, whole-line move of B.
        let outcome = split_order(
            &db,
            &bus,
            &order.id,
            "takeaway",
            vec![
                SplitLine {
                    item_id: item_a,
                    quantity: 1,
                },
                SplitLine {
                    item_id: item_b,
                    quantity: 2,
                },
            ],
        )
        .expect("split");

        let conn = db.lock().expect("lock");
        let source_items = items_for_order(&conn, &order.id).expect("source items");
        let dest_items = items_for_order(&conn, &outcome.destination.id).expect("dest items");

        let mut after = quantities_by_menu_item(&source_items);
        for (k, v) in quantities_by_menu_item(&dest_items) {
            *after.entry(k).or_insert(0) += v;
        }
        assert_eq!(before, after, "split must conserve per-item quantity");

        assert_eq!(quantities_by_menu_item(&source_items)["A"], 2);
        assert!(!quantities_by_menu_item(&source_items).contains_key("B"));
        assert_eq!(outcome.source.total, 20.0);
        assert_eq!(outcome.destination.total, 22.0);
    }

    #[test]
    fn test_split_into_existing_destination_merges_lines() {
        let db = test_db();
        let bus = EventBus::new();
        seed_table(&db, "t1", false);
        seed_table(&db, "t2", false);

        let source = create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: Some("t1".to_string()),
                staff_id: None,
                note: None,
                items: vec![line("A", "Item A", 10.0, 3), line("B", "Item B", 5.0, 1)],
            },
        )
        .expect("source");
        let dest = create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: Some("t2".to_string()),
                staff_id: None,
                note: None,
                items: vec![line("A", "Item A", 10.0, 1)],
            },
        )
        .expect("dest");

        let item_a = {
            let conn = db.lock().expect("lock");
            items_for_order(&conn, &source.id).expect("items")[0].id.clone()
        };

        let outcome = split_order(
            &db,
            &bus,
            &source.id,
            "t2",
            vec![SplitLine {
                item_id: item_a,
                quantity: 2,
            }],
        )
        .expect("split");

        assert_eq!(outcome.destination.id, dest.id, "reuses the open order");
        let conn = db.lock().expect("lock");
        let dest_items = items_for_order(&conn, &dest.id).expect("dest items");
        assert_eq!(dest_items.len(), 1);
        assert_eq!(dest_items[0].quantity, 3);
        assert_eq!(outcome.destination.total, 30.0);
    }

    #[test]
    fn test_split_validation() {
        let db = test_db();
        let bus = EventBus::new();
        seed_table(&db, "t1", false);
        seed_table(&db, "t2", false);

        let order = create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: Some("t1".to_string()),
                staff_id: None,
                note: None,
                items: vec![line("A", "Item A", 10.0, 2)],
            },
        )
        .expect("create");
        let item_id = {
            let conn = db.lock().expect("lock");
            items_for_order(&conn, &order.id).expect("items")[0].id.clone()
        };

        // Zero quantity
        let err = split_order(
            &db,
            &bus,
            &order.id,
            "t2",
            vec![SplitLine {
                item_id: item_id.clone(),
                quantity: 0,
            }],
        )
        .expect_err("zero quantity");
        assert!(matches!(err, PosError::InvalidOperation(_)));

        // More than the line holds
        let err = split_order(
            &db,
            &bus,
            &order.id,
            "t2",
            vec![SplitLine {
                item_id: item_id.clone(),
                quantity: 5,
            }],
        )
        .expect_err("excess quantity");
        assert!(matches!(err, PosError::InvalidOperation(_)));

        // Same table as the source
        let err = split_order(
            &db,
            &bus,
            &order.id,
            "t1",
            vec![SplitLine {
                item_id,
                quantity: 1,
            }],
        )
        .expect_err("same table");
        assert!(matches!(err, PosError::InvalidOperation(_)));
    }

    #[test]
    fn test_worked_example_create_add_split() {
        // create 2 x ItemA($10) -> total 20; add 1 x ItemA -> 3 x, total 30;
        // split 1 x to takeaway -> source 2 x (20), takeaway 1 x (10).
        let db = test_db();
        let bus = EventBus::new();
        seed_table(&db, "t5", false);
        seed_table(&db, "takeaway", true);

        let order = create_order(
            &db,
            &bus,
            CreateOrderRequest {
                table_id: Some("t5".to_string()),
                staff_id: None,
                note: None,
                items: vec![line("A", "Item A", 10.0, 2)],
            },
        )
        .expect("create");
        assert_eq!(order.total, 20.0);

        let order = add_items(&db, &bus, &order.id, vec![line("A", "Item A", 10.0, 1)])
            .expect("add");
        assert_eq!(order.total, 30.0);

        let item_id = {
            let conn = db.lock().expect("lock");
            items_for_order(&conn, &order.id).expect("items")[0].id.clone()
        };
        let outcome = split_order(
            &db,
            &bus,
            &order.id,
            "takeaway",
            vec![SplitLine {
                item_id,
                quantity: 1,
            }],
        )
        .expect("split");

        assert_eq!(outcome.source.total, 20.0);
        assert_eq!(outcome.destination.total, 10.0);

        let conn = db.lock().expect("lock");
        let src = items_for_order(&conn, &order.id).expect("src");
        let dst = items_for_order(&conn, &outcome.destination.id).expect("dst");
        assert_eq!(src[0].quantity, 2);
        assert_eq!(dst[0].quantity, 1);
    }
}
