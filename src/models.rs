//! Domain records persisted in the local store and mirrored to the remote
//! backend. Field names follow the remote wire format, so the same structs
//! serve both as row types and as sync payloads.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Order status
// ---------------------------------------------------------------------------

/// Order lifecycle status. `Pending -> Cooking -> Ready -> Completed`, with
/// `Cancelled` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Cooking,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Cooking => "cooking",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(OrderStatus::Pending),
            "cooking" => Some(OrderStatus::Cooking),
            "ready" => Some(OrderStatus::Ready),
            "completed" => Some(OrderStatus::Completed),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Still being worked by staff; occupies its table.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Cooking | OrderStatus::Ready
        )
    }

    /// Completed or cancelled orders never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// Forward-only transitions plus cancellation from any non-terminal state.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            OrderStatus::Cancelled => true,
            OrderStatus::Cooking => *self == OrderStatus::Pending,
            OrderStatus::Ready => *self == OrderStatus::Cooking,
            OrderStatus::Completed => *self == OrderStatus::Ready,
            OrderStatus::Pending => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync status
// ---------------------------------------------------------------------------

/// Whether the local copy of a record matches the last known remote copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "synced" => Some(SyncStatus::Synced),
            "pending" => Some(SyncStatus::Pending),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub table_id: Option<String>,
    pub status: OrderStatus,
    pub subtotal: f64,
    pub discount_amount: f64,
    pub total: f64,
    pub payment_method: Option<String>,
    pub staff_id: Option<String>,
    pub note: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub version: i64,
    pub sync_status: SyncStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub menu_item_id: String,
    /// Name snapshot taken at add time, resilient to later menu edits.
    pub name: String,
    /// Unit price snapshot taken at add time.
    pub price: f64,
    pub quantity: i64,
    pub note: Option<String>,
}

impl OrderItem {
    /// De-duplication key: lines sharing the same menu item and normalized
    /// note merge by summing quantity.
    pub fn merge_key(&self) -> (String, String) {
        (
            self.menu_item_id.clone(),
            normalize_note(self.note.as_deref()),
        )
    }
}

/// Normalize a free-text item note for merge-key comparison.
pub fn normalize_note(note: Option<&str>) -> String {
    note.map(|n| n.trim().to_lowercase()).unwrap_or_default()
}

/// Input line for create / add-items operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub menu_item_id: String,
    pub name: String,
    pub price: f64,
    pub quantity: i64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub id: String,
    pub label: String,
    pub pos_x: f64,
    pub pos_y: f64,
    pub width: f64,
    pub height: f64,
    pub is_takeaway: bool,
}

/// Derived view: a table plus whether an operational order references it.
/// Occupancy is never stored; it is recomputed from the orders table.
#[derive(Debug, Clone, Serialize)]
pub struct TableWithOccupancy {
    #[serde(flatten)]
    pub table: Table,
    pub occupied: bool,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuItem {
    /// Server-assigned id, or a `local-` prefixed placeholder until the
    /// sync engine promotes it.
    pub id: String,
    /// Stable correlation key tying local and server copies together
    /// across identity promotion.
    pub uid: String,
    pub name: String,
    pub price: f64,
    pub category: String,
    pub in_stock: bool,
}

/// Prefix for menu item ids created while offline, pending server assignment.
pub const LOCAL_ID_PREFIX: &str = "local-";

impl MenuItem {
    pub fn has_local_id(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub action: String,
    pub actor_role: String,
    pub created_at: String,
    pub synced_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Command queue
// ---------------------------------------------------------------------------

/// Closed set of outbound mutations the sync engine knows how to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueAction {
    CreateOrder,
    UpdateOrder,
    ReplaceOrderItems,
    UpsertMenuItem,
    UpdateMenuItem,
    DeleteMenuItem,
    AppendAuditLog,
    ReplaceTableLayout,
    DeleteTable,
}

impl QueueAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueAction::CreateOrder => "create-order",
            QueueAction::UpdateOrder => "update-order",
            QueueAction::ReplaceOrderItems => "replace-order-items",
            QueueAction::UpsertMenuItem => "upsert-menu-item",
            QueueAction::UpdateMenuItem => "update-menu-item",
            QueueAction::DeleteMenuItem => "delete-menu-item",
            QueueAction::AppendAuditLog => "append-audit-log",
            QueueAction::ReplaceTableLayout => "replace-table-layout",
            QueueAction::DeleteTable => "delete-table",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create-order" => Some(QueueAction::CreateOrder),
            "update-order" => Some(QueueAction::UpdateOrder),
            "replace-order-items" => Some(QueueAction::ReplaceOrderItems),
            "upsert-menu-item" => Some(QueueAction::UpsertMenuItem),
            "update-menu-item" => Some(QueueAction::UpdateMenuItem),
            "delete-menu-item" => Some(QueueAction::DeleteMenuItem),
            "append-audit-log" => Some(QueueAction::AppendAuditLog),
            "replace-table-layout" => Some(QueueAction::ReplaceTableLayout),
            "delete-table" => Some(QueueAction::DeleteTable),
            _ => None,
        }
    }

    /// Actions whose payload carries a top-level `order_id` and whose
    /// completion feeds the order's `sync_status`.
    pub fn touches_order(&self) -> bool {
        matches!(
            self,
            QueueAction::CreateOrder | QueueAction::UpdateOrder | QueueAction::ReplaceOrderItems
        )
    }
}

/// One durable outbound mutation awaiting remote replay.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// AUTOINCREMENT id; defines strict replay order.
    pub id: i64,
    pub action: QueueAction,
    pub payload: serde_json::Value,
    pub created_at: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
}
