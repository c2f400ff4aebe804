//! Inbound reconciliation.
//!
//! Pulls orders changed on the backend since the stored cursor and folds
//! them into the local store. Conflict resolution is deterministic and
//! biased toward the terminal in active service:
//!
//! 1. a terminal remote copy always wins over an operational local one
//! 2. a terminal local copy never regresses to an operational remote one
//! 3. with no unsynced local edits, the newer copy applies
//! 4. unsynced local edits hold unless the remote copy is newer by more
//!    than the grace window
//!
//! When the remote copy wins, its item lines replace the local ones
//! wholesale in the same transaction; no per-line merging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{self, DbState};
use crate::error::PosError;
use crate::events::{EventBus, StoreEvent};
use crate::models::{Order, OrderStatus, SyncStatus};
use crate::orders;
use crate::policy::SyncPolicy;
use crate::remote::{OrderPullQuery, RemoteBackend, RemoteError};
use crate::session::Session;
use crate::tables;

const SETTINGS_CATEGORY: &str = "sync";
const KEY_ORDERS_SINCE: &str = "orders_since";

/// Fallback window when no cursor has been stored yet.
const INITIAL_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

fn parse_ts(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).ok()
}

/// Decide which copy of an order survives. Pure so the policy is
/// testable without a store or a backend.
pub fn resolve_conflict(local: &Order, remote: &Order, grace: std::time::Duration) -> Winner {
    if remote.status.is_terminal() && !local.status.is_terminal() {
        return Winner::Remote;
    }
    if local.status.is_terminal() && !remote.status.is_terminal() {
        return Winner::Local;
    }

    let (Some(local_ts), Some(remote_ts)) =
        (parse_ts(&local.updated_at), parse_ts(&remote.updated_at))
    else {
        // Unparseable timestamps keep the copy we can still trust.
        return Winner::Local;
    };

    if local.sync_status == SyncStatus::Synced {
        // Nothing local is waiting to upload; a newer remote copy is
        // simply the current truth.
        return if remote_ts > local_ts {
            Winner::Remote
        } else {
            Winner::Local
        };
    }

    let grace = chrono::Duration::from_std(grace).unwrap_or_default();
    if remote_ts > local_ts + grace {
        Winner::Remote
    } else {
        Winner::Local
    }
}

/// Keep at most one operational order per non-takeaway table after
/// folding in a remote copy: the most recently updated order keeps the
/// table, any older one is detached (not cancelled, so no work is lost).
fn resolve_duplicate_occupancy(
    tx: &rusqlite::Connection,
    incoming: &Order,
) -> Result<(), PosError> {
    if !incoming.status.is_operational() {
        return Ok(());
    }
    let Some(table_id) = &incoming.table_id else {
        return Ok(());
    };
    let table = match tables::get_table(tx, table_id) {
        Ok(table) => table,
        // A table this terminal has never seen; nothing to enforce yet.
        Err(PosError::NotFound(_)) => return Ok(()),
        Err(err) => return Err(err),
    };
    if table.is_takeaway {
        return Ok(());
    }

    let detached = tx.execute(
        "UPDATE orders SET table_id = NULL
         WHERE table_id = ?1 AND status IN ('pending', 'cooking', 'ready')
           AND id NOT IN (
               SELECT id FROM orders
               WHERE table_id = ?1 AND status IN ('pending', 'cooking', 'ready')
               ORDER BY updated_at DESC, id DESC LIMIT 1)",
        rusqlite::params![table_id],
    )?;
    if detached > 0 {
        warn!(
            table_id,
            detached, "detached older operational orders from a double-booked table"
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub pulled: usize,
    pub added: usize,
    pub updated: usize,
}

pub struct Reconciler {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteBackend>,
    bus: EventBus,
    policy: SyncPolicy,
    in_flight: AtomicBool,
}

impl Reconciler {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteBackend>,
        bus: EventBus,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            db,
            remote,
            bus,
            policy,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Pull the window since the stored cursor and reconcile, advancing
    /// the cursor on success.
    pub async fn refresh(&self, session: &Session) -> Result<ReconcileSummary, PosError> {
        let to = Utc::now().to_rfc3339();
        let from = {
            let conn = self.db.lock()?;
            db::get_setting(&conn, SETTINGS_CATEGORY, KEY_ORDERS_SINCE).unwrap_or_else(|| {
                (Utc::now() - chrono::Duration::hours(INITIAL_WINDOW_HOURS)).to_rfc3339()
            })
        };
        self.refresh_window(
            session,
            &from,
            &to,
            vec![
                OrderStatus::Pending,
                OrderStatus::Cooking,
                OrderStatus::Ready,
                OrderStatus::Completed,
                OrderStatus::Cancelled,
            ],
            true,
        )
        .await
    }

    /// Pull an explicit window with a status filter. `advance_cursor`
    /// controls whether the stored cursor moves to the window's end.
    /// Single flight; a refresh finding another in progress is a no-op.
    pub async fn refresh_window(
        &self,
        session: &Session,
        from: &str,
        to: &str,
        statuses: Vec<OrderStatus>,
        advance_cursor: bool,
    ) -> Result<ReconcileSummary, PosError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("refresh already in flight, skipping");
            return Ok(ReconcileSummary::default());
        }
        let result = self
            .refresh_inner(session, from, to, statuses, advance_cursor)
            .await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn refresh_inner(
        &self,
        session: &Session,
        from: &str,
        to: &str,
        statuses: Vec<OrderStatus>,
        advance_cursor: bool,
    ) -> Result<ReconcileSummary, PosError> {
        let query = OrderPullQuery::for_session(session, from, to, statuses);

        let pulled = match self.remote.fetch_orders(&query).await {
            Ok(pulled) => pulled,
            Err(RemoteError::Auth(detail)) => {
                self.bus.publish(StoreEvent::ReauthRequired);
                warn!(detail, "order pull rejected, re-login required");
                return Err(PosError::AuthenticationExpired);
            }
            Err(RemoteError::Transient(detail)) => {
                return Err(PosError::TransientNetwork(detail));
            }
            Err(err) => return Err(PosError::RemoteRejected(err.to_string())),
        };

        let mut summary = ReconcileSummary {
            pulled: pulled.len(),
            ..Default::default()
        };

        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        for pulled_order in &pulled {
            let mut incoming = pulled_order.order.clone();
            incoming.sync_status = SyncStatus::Synced;

            match orders::try_get_order(&tx, &incoming.id)? {
                None => {
                    orders::upsert_order_row(&tx, &incoming)?;
                    orders::replace_items_rows(&tx, &incoming.id, &pulled_order.items)?;
                    resolve_duplicate_occupancy(&tx, &incoming)?;
                    summary.added += 1;
                }
                Some(local) => {
                    match resolve_conflict(&local, &incoming, self.policy.remote_grace) {
                        Winner::Local => {
                            debug!(order_id = %local.id, "local copy wins, remote ignored");
                        }
                        Winner::Remote => {
                            orders::upsert_order_row(&tx, &incoming)?;
                            orders::replace_items_rows(&tx, &incoming.id, &pulled_order.items)?;
                            resolve_duplicate_occupancy(&tx, &incoming)?;
                            summary.updated += 1;
                        }
                    }
                }
            }
        }
        if advance_cursor {
            db::set_setting(&tx, SETTINGS_CATEGORY, KEY_ORDERS_SINCE, to)?;
        }
        tx.commit()?;
        drop(conn);

        if summary.added + summary.updated > 0 {
            self.bus.publish(StoreEvent::OrdersChanged);
            self.bus.publish(StoreEvent::TablesChanged);
        }
        info!(
            pulled = summary.pulled,
            added = summary.added,
            updated = summary.updated,
            "reconcile complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::models::{NewOrderItem, OrderItem};
    use crate::orders::CreateOrderRequest;
    use crate::remote::mock::MockBackend;
    use crate::remote::PulledOrder;
    use crate::session::Role;

    fn order(id: &str, status: OrderStatus, updated_at: &str, sync: SyncStatus) -> Order {
        Order {
            id: id.to_string(),
            table_id: None,
            status,
            subtotal: 10.0,
            discount_amount: 0.0,
            total: 10.0,
            payment_method: None,
            staff_id: None,
            note: None,
            created_at: "2026-08-24T10:00:00+00:00".to_string(),
            updated_at: updated_at.to_string(),
            version: 1,
            sync_status: sync,
        }
    }

    const GRACE: Duration = Duration::from_secs(300);

    #[test]
    fn test_remote_terminal_beats_local_operational() {
        let local = order(
            "o1",
            OrderStatus::Cooking,
            "2026-08-24T12:00:00+00:00",
            SyncStatus::Pending,
        );
        let remote = order(
            "o1",
            OrderStatus::Completed,
            "2026-08-24T11:00:00+00:00",
            SyncStatus::Synced,
        );
        assert_eq!(resolve_conflict(&local, &remote, GRACE), Winner::Remote);
    }

    #[test]
    fn test_local_terminal_never_regresses() {
        let local = order(
            "o1",
            OrderStatus::Completed,
            "2026-08-24T11:00:00+00:00",
            SyncStatus::Synced,
        );
        let remote = order(
            "o1",
            OrderStatus::Cooking,
            "2026-08-24T13:00:00+00:00",
            SyncStatus::Synced,
        );
        assert_eq!(resolve_conflict(&local, &remote, GRACE), Winner::Local);
    }

    #[test]
    fn test_unsynced_local_edit_holds_within_grace() {
        // Remote is two minutes newer but the local copy has edits still
        // waiting to upload.
        let local = order(
            "o1",
            OrderStatus::Cooking,
            "2026-08-24T12:00:00+00:00",
            SyncStatus::Pending,
        );
        let remote = order(
            "o1",
            OrderStatus::Ready,
            "2026-08-24T12:02:00+00:00",
            SyncStatus::Synced,
        );
        assert_eq!(resolve_conflict(&local, &remote, GRACE), Winner::Local);
    }

    #[test]
    fn test_unsynced_local_edit_yields_past_grace() {
        let local = order(
            "o1",
            OrderStatus::Cooking,
            "2026-08-24T12:00:00+00:00",
            SyncStatus::Pending,
        );
        let remote = order(
            "o1",
            OrderStatus::Ready,
            "2026-08-24T12:10:00+00:00",
            SyncStatus::Synced,
        );
        assert_eq!(resolve_conflict(&local, &remote, GRACE), Winner::Remote);
    }

    #[test]
    fn test_synced_local_takes_any_newer_remote() {
        let local = order(
            "o1",
            OrderStatus::Cooking,
            "2026-08-24T12:00:00+00:00",
            SyncStatus::Synced,
        );
        let remote = order(
            "o1",
            OrderStatus::Ready,
            "2026-08-24T12:00:01+00:00",
            SyncStatus::Synced,
        );
        assert_eq!(resolve_conflict(&local, &remote, GRACE), Winner::Remote);
    }

    // -- refresh -----------------------------------------------------------

    struct Harness {
        db: Arc<DbState>,
        bus: EventBus,
        remote: Arc<MockBackend>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let db = Arc::new(DbState::in_memory().expect("db"));
        let bus = EventBus::new();
        let remote = Arc::new(MockBackend::new());
        let reconciler = Reconciler::new(
            db.clone(),
            remote.clone(),
            bus.clone(),
            SyncPolicy::default(),
        );
        Harness {
            db,
            bus,
            remote,
            reconciler,
        }
    }

    fn pulled(order: Order, items: Vec<OrderItem>) -> PulledOrder {
        PulledOrder { order, items }
    }

    fn item(order_id: &str, menu_item_id: &str, qty: i64) -> OrderItem {
        OrderItem {
            id: format!("{order_id}-{menu_item_id}"),
            order_id: order_id.to_string(),
            menu_item_id: menu_item_id.to_string(),
            name: format!("Item {menu_item_id}"),
            price: 10.0,
            quantity: qty,
            note: None,
        }
    }

    #[tokio::test]
    async fn test_refresh_materializes_missing_orders_as_synced() {
        let h = harness();
        let session = Session::new("u-1", Role::Manager);
        h.remote.set_pull_result(vec![pulled(
            order(
                "r1",
                OrderStatus::Completed,
                "2026-08-24T12:00:00+00:00",
                SyncStatus::Pending,
            ),
            vec![item("r1", "A", 2)],
        )]);

        let summary = h.reconciler.refresh(&session).await.expect("refresh");
        assert_eq!(summary.added, 1);
        assert_eq!(summary.updated, 0);

        let conn = h.db.lock().expect("lock");
        let stored = orders::get_order(&conn, "r1").expect("order");
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(orders::items_for_order(&conn, "r1").expect("items").len(), 1);

        // Cursor advanced; next pull uses a fresh window.
        assert!(db::get_setting(&conn, "sync", "orders_since").is_some());
    }

    #[tokio::test]
    async fn test_refresh_keeps_local_winner_untouched() {
        let h = harness();
        let session = Session::new("u-1", Role::Manager);

        let local = crate::orders::create_order(
            &h.db,
            &h.bus,
            CreateOrderRequest {
                table_id: None,
                staff_id: None,
                note: None,
                items: vec![NewOrderItem {
                    menu_item_id: "A".to_string(),
                    name: "Item A".to_string(),
                    price: 10.0,
                    quantity: 2,
                    note: None,
                }],
            },
        )
        .expect("local order");

        // Remote copy is barely newer and the local one has pending edits.
        let remote_ts = Utc::now().to_rfc3339();
        h.remote.set_pull_result(vec![pulled(
            {
                let mut o = order(
                    &local.id,
                    OrderStatus::Ready,
                    &remote_ts,
                    SyncStatus::Synced,
                );
                o.total = 999.0;
                o
            },
            vec![],
        )]);

        let summary = h.reconciler.refresh(&session).await.expect("refresh");
        assert_eq!(summary.updated, 0);

        let conn = h.db.lock().expect("lock");
        let stored = orders::get_order(&conn, &local.id).expect("order");
        assert_eq!(stored.status, OrderStatus::Pending, "local copy untouched");
        assert_eq!(stored.total, 20.0);
        assert_eq!(
            orders::items_for_order(&conn, &local.id).expect("items").len(),
            1,
            "items untouched when local wins"
        );
    }

    #[tokio::test]
    async fn test_refresh_remote_win_replaces_items_wholesale() {
        let h = harness();
        let session = Session::new("u-1", Role::Manager);

        let local = crate::orders::create_order(
            &h.db,
            &h.bus,
            CreateOrderRequest {
                table_id: None,
                staff_id: None,
                note: None,
                items: vec![NewOrderItem {
                    menu_item_id: "A".to_string(),
                    name: "Item A".to_string(),
                    price: 10.0,
                    quantity: 2,
                    note: None,
                }],
            },
        )
        .expect("local order");

        // Terminal remote copy wins outright.
        h.remote.set_pull_result(vec![pulled(
            order(
                &local.id,
                OrderStatus::Completed,
                "2026-08-24T12:00:00+00:00",
                SyncStatus::Synced,
            ),
            vec![item(&local.id, "B", 1)],
        )]);

        let summary = h.reconciler.refresh(&session).await.expect("refresh");
        assert_eq!(summary.updated, 1);

        let conn = h.db.lock().expect("lock");
        let stored = orders::get_order(&conn, &local.id).expect("order");
        assert_eq!(stored.status, OrderStatus::Completed);
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        let items = orders::items_for_order(&conn, &local.id).expect("items");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].menu_item_id, "B", "remote lines replace local ones");
    }

    #[tokio::test]
    async fn test_refresh_detaches_older_order_on_double_booked_table() {
        let h = harness();
        let session = Session::new("u-1", Role::Manager);
        crate::tables::replace_layout(
            &h.db,
            &h.bus,
            vec![crate::models::Table {
                id: "t1".to_string(),
                label: "Table 1".to_string(),
                pos_x: 0.0,
                pos_y: 0.0,
                width: 1.0,
                height: 1.0,
                is_takeaway: false,
            }],
        )
        .expect("layout");

        let local = crate::orders::create_order(
            &h.db,
            &h.bus,
            CreateOrderRequest {
                table_id: Some("t1".to_string()),
                staff_id: None,
                note: None,
                items: vec![NewOrderItem {
                    menu_item_id: "A".to_string(),
                    name: "Item A".to_string(),
                    price: 10.0,
                    quantity: 1,
                    note: None,
                }],
            },
        )
        .expect("local order");

        // A different operational order claims the same table, updated
        // after the local one.
        let remote_ts = (Utc::now() + chrono::Duration::seconds(30)).to_rfc3339();
        let mut remote_order = order(
            "r9",
            OrderStatus::Cooking,
            &remote_ts,
            SyncStatus::Synced,
        );
        remote_order.table_id = Some("t1".to_string());
        h.remote
            .set_pull_result(vec![pulled(remote_order, vec![item("r9", "B", 1)])]);

        h.reconciler.refresh(&session).await.expect("refresh");

        let conn = h.db.lock().expect("lock");
        let holder = orders::operational_order_for_table(&conn, "t1")
            .expect("holder")
            .expect("one order keeps the table");
        assert_eq!(holder.id, "r9", "newest copy keeps the table");
        let detached = orders::get_order(&conn, &local.id).expect("local order");
        assert_eq!(detached.table_id, None, "older order is detached, not lost");
        assert_eq!(detached.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_refresh_auth_failure_requests_reauth() {
        let h = harness();
        let session = Session::new("u-2", Role::Staff);
        h.remote
            .script_error("fetch_orders", RemoteError::Auth("revoked".to_string()));
        let mut events = h.bus.subscribe();

        let err = h.reconciler.refresh(&session).await.expect_err("auth");
        assert!(matches!(err, PosError::AuthenticationExpired));
        assert_eq!(
            events.try_recv().expect("event"),
            StoreEvent::ReauthRequired
        );
    }

    #[tokio::test]
    async fn test_refresh_scopes_staff_pull() {
        let h = harness();
        let session = Session::new("u-2", Role::Staff);
        h.reconciler.refresh(&session).await.expect("refresh");

        // The window was requested; scoping itself is covered by the
        // OrderPullQuery tests.
        assert!(h.remote.call_log()[0].starts_with("fetch_orders:"));
    }
}
