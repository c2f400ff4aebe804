//! Outbound sync engine.
//!
//! Drains the command queue against the remote backend, strictly in queue
//! order, one single-flight cycle at a time. Failure handling keys off the
//! classified `RemoteError`:
//!
//! - `Auth` halts the cycle and asks the application to re-login.
//! - `Transient` halts the cycle in place without consuming a retry, so
//!   ordering is preserved and the entry leads the next cycle.
//! - `DuplicateKey` on a create means an earlier attempt landed; the entry
//!   is completed as a success.
//! - `Rejected` consumes a retry and halts; once the ceiling is reached
//!   the entry is dropped and the affected order is flagged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::audit;
use crate::connectivity::ConnectivityState;
use crate::db::{self, DbState};
use crate::error::PosError;
use crate::events::{EventBus, StoreEvent};
use crate::models::{
    AuditLogEntry, MenuItem, Order, OrderItem, QueueAction, QueueEntry, SyncStatus, Table,
};
use crate::policy::SyncPolicy;
use crate::queue;
use crate::remote::{RemoteBackend, RemoteError};

const SETTINGS_CATEGORY: &str = "sync";
const KEY_LAST_ERROR: &str = "last_error";
const KEY_LAST_SYNC_AT: &str = "last_sync_at";

/// Point-in-time view of the engine for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusSnapshot {
    pub pending: i64,
    pub in_flight: bool,
    pub last_error: Option<String>,
    pub last_sync_at: Option<String>,
}

/// Follow-up work applied locally after a successful remote replay.
enum Followup {
    None,
    /// Swap a `local-` placeholder id for the server-assigned one.
    PromoteMenuItem {
        uid: String,
        local_id: String,
        server_id: String,
    },
    MarkAuditSynced(String),
}

/// How the cycle proceeds after a failed replay.
enum FailureOutcome {
    /// The entry was dropped; the queue is unblocked and the cycle
    /// continues.
    Dropped,
    /// The entry was retained; stop so replay order is preserved.
    HaltCycle,
    /// Credentials were rejected; stop and request re-login.
    HaltAuth(String),
}

pub struct SyncEngine {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteBackend>,
    bus: EventBus,
    policy: SyncPolicy,
    in_flight: AtomicBool,
    drain_requested: Notify,
}

impl SyncEngine {
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
            drain_requested: Notify::new(),
        }
    }

    /// Ask the background loop to drain soon. Cheap; callers fire this
    /// after local writes instead of awaiting a cycle.
    pub fn request_drain(&self) {
        self.drain_requested.notify_one();
    }

    pub fn status(&self) -> Result<SyncStatusSnapshot, PosError> {
        let conn = self.db.lock()?;
        Ok(SyncStatusSnapshot {
            pending: queue::pending_count(&conn)?,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            last_error: db::get_setting(&conn, SETTINGS_CATEGORY, KEY_LAST_ERROR),
            last_sync_at: db::get_setting(&conn, SETTINGS_CATEGORY, KEY_LAST_SYNC_AT),
        })
    }

    /// Run one drain cycle. Returns the number of entries replayed; a
    /// cycle that finds another already in flight is a no-op returning 0.
    pub async fn run_cycle(&self) -> Result<u64, PosError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already in flight, skipping");
            return Ok(0);
        }
        let result = self.drain().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn drain(&self) -> Result<u64, PosError> {
        let mut replayed = 0u64;
        let mut halted = false;

        // One batch per cycle; a deep queue drains across cycles.
        let batch = {
            let conn = self.db.lock()?;
            queue::pending_batch(&conn, self.policy.batch_size)?
        };
        let full_batch = batch.len() == self.policy.batch_size;

        for entry in batch {
            let Some(payload) = self.decode(&entry)? else {
                continue;
            };
            match self.replay(&entry, &payload).await {
                Ok(followup) => {
                    self.complete_entry(&entry, &payload, followup)?;
                    replayed += 1;
                }
                Err(err) => match self.handle_failure(&entry, &payload, err)? {
                    FailureOutcome::Dropped => {}
                    FailureOutcome::HaltCycle => {
                        halted = true;
                        break;
                    }
                    FailureOutcome::HaltAuth(detail) => {
                        warn!(detail, "authentication rejected, halting sync");
                        self.bus.publish(StoreEvent::ReauthRequired);
                        halted = true;
                        break;
                    }
                },
            }
        }

        {
            let conn = self.db.lock()?;
            if !halted {
                db::set_setting(
                    &conn,
                    SETTINGS_CATEGORY,
                    KEY_LAST_SYNC_AT,
                    &chrono::Utc::now().to_rfc3339(),
                )?;
                if replayed > 0 {
                    db::set_setting(&conn, SETTINGS_CATEGORY, KEY_LAST_ERROR, "")?;
                }
            }
            let pending = queue::pending_count(&conn)?;
            drop(conn);
            self.bus.publish(StoreEvent::QueueChanged { pending });
        }

        // A full batch means more entries may be waiting; hand them to
        // the next cycle instead of growing this one.
        if full_batch && !halted {
            self.drain_requested.notify_one();
        }

        if replayed > 0 {
            info!(replayed, "drain cycle complete");
        }
        Ok(replayed)
    }

    /// Parse the entry payload into the typed form its action expects.
    /// Undecodable entries are dropped: they can never replay.
    fn decode(&self, entry: &QueueEntry) -> Result<Option<Value>, PosError> {
        if entry.payload.is_object() {
            return Ok(Some(entry.payload.clone()));
        }
        error!(id = entry.id, action = ?entry.action, "Dropping queue entry with malformed payload");
        let conn = self.db.lock()?;
        queue::delete_entry(&conn, entry.id)?;
        Ok(None)
    }

    /// Replay one entry against the remote backend. No locks are held
    /// across the call.
    async fn replay(&self, entry: &QueueEntry, payload: &Value) -> Result<Followup, RemoteError> {
        fn field<T: serde::de::DeserializeOwned>(
            payload: &Value,
            name: &str,
        ) -> Result<T, RemoteError> {
            payload
                .get(name)
                .cloned()
                .ok_or_else(|| RemoteError::Rejected(format!("payload missing `{name}`")))
                .and_then(|v| {
                    serde_json::from_value(v)
                        .map_err(|e| RemoteError::Rejected(format!("payload field `{name}`: {e}")))
                })
        }

        match entry.action {
            QueueAction::CreateOrder => {
                let order: Order = field(payload, "order")?;
                let items: Vec<OrderItem> = field(payload, "items")?;
                match self.remote.insert_order(&order, &items).await {
                    Ok(()) => Ok(Followup::None),
                    // An earlier attempt landed before the ack was lost.
                    Err(RemoteError::DuplicateKey(detail)) => {
                        debug!(order_id = %order.id, detail, "create already applied remotely");
                        Ok(Followup::None)
                    }
                    Err(err) => Err(err),
                }
            }
            QueueAction::UpdateOrder => {
                let order: Order = field(payload, "order")?;
                self.remote.update_order(&order).await?;
                Ok(Followup::None)
            }
            QueueAction::ReplaceOrderItems => {
                let order_id: String = field(payload, "order_id")?;
                let items: Vec<OrderItem> = field(payload, "items")?;
                self.remote.replace_order_items(&order_id, &items).await?;
                Ok(Followup::None)
            }
            QueueAction::UpsertMenuItem => {
                let item: MenuItem = field(payload, "item")?;
                let server_id = self.remote.upsert_menu_item(&item).await?;
                if item.has_local_id() && server_id != item.id {
                    Ok(Followup::PromoteMenuItem {
                        uid: item.uid,
                        local_id: item.id,
                        server_id,
                    })
                } else {
                    Ok(Followup::None)
                }
            }
            QueueAction::UpdateMenuItem => {
                let item: MenuItem = field(payload, "item")?;
                self.remote.update_menu_item(&item).await?;
                Ok(Followup::None)
            }
            QueueAction::DeleteMenuItem => {
                let id: String = field(payload, "id")?;
                self.remote.delete_menu_item(&id).await?;
                Ok(Followup::None)
            }
            QueueAction::AppendAuditLog => {
                let log: AuditLogEntry = field(payload, "entry")?;
                self.remote.append_audit_logs(std::slice::from_ref(&log)).await?;
                Ok(Followup::MarkAuditSynced(log.id))
            }
            QueueAction::ReplaceTableLayout => {
                let tables: Vec<Table> = field(payload, "tables")?;
                self.remote.replace_table_layout(&tables).await?;
                Ok(Followup::None)
            }
            QueueAction::DeleteTable => {
                let id: String = field(payload, "id")?;
                self.remote.delete_table(&id).await?;
                Ok(Followup::None)
            }
        }
    }

    /// Commit the local consequences of a successful replay in one
    /// transaction: remove the entry, apply the follow-up, and flip the
    /// order to `synced` once nothing else references it.
    fn complete_entry(
        &self,
        entry: &QueueEntry,
        payload: &Value,
        followup: Followup,
    ) -> Result<(), PosError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;

        queue::delete_entry(&tx, entry.id)?;

        match followup {
            Followup::None => {}
            Followup::PromoteMenuItem {
                uid,
                local_id,
                server_id,
            } => {
                info!(%local_id, %server_id, "promoting menu item identity");
                tx.execute(
                    "UPDATE menu_items SET id = ?2 WHERE uid = ?1",
                    rusqlite::params![uid, server_id],
                )?;
                tx.execute(
                    "UPDATE order_items SET menu_item_id = ?2 WHERE menu_item_id = ?1",
                    rusqlite::params![local_id, server_id],
                )?;
                // Later queue entries still naming the placeholder must
                // replay under the promoted id.
                tx.execute(
                    "UPDATE offline_queue
                     SET payload = json_set(payload, '$.item.id', ?2)
                     WHERE action IN ('upsert-menu-item', 'update-menu-item')
                       AND json_extract(payload, '$.item.uid') = ?1",
                    rusqlite::params![uid, server_id],
                )?;
                tx.execute(
                    "UPDATE offline_queue
                     SET payload = json_set(payload, '$.id', ?2)
                     WHERE action = 'delete-menu-item'
                       AND json_extract(payload, '$.id') = ?1",
                    rusqlite::params![local_id, server_id],
                )?;
                // Item snapshots inside queued order payloads name the
                // placeholder too.
                queue::repoint_order_item_payloads(&tx, &local_id, &server_id)?;
            }
            Followup::MarkAuditSynced(id) => audit::mark_synced(&tx, &id)?,
        }

        let mut orders_changed = false;
        let mut menu_changed = false;
        if entry.action.touches_order() {
            if let Some(order_id) = payload.get("order_id").and_then(Value::as_str) {
                if queue::pending_count_for_order(&tx, order_id)? == 0 {
                    tx.execute(
                        "UPDATE orders SET sync_status = ?2 WHERE id = ?1 AND sync_status = ?3",
                        rusqlite::params![
                            order_id,
                            SyncStatus::Synced.as_str(),
                            SyncStatus::Pending.as_str()
                        ],
                    )?;
                    orders_changed = true;
                }
            }
        }
        if matches!(
            entry.action,
            QueueAction::UpsertMenuItem | QueueAction::UpdateMenuItem | QueueAction::DeleteMenuItem
        ) {
            menu_changed = true;
        }

        tx.commit()?;
        drop(conn);

        if orders_changed {
            self.bus.publish(StoreEvent::OrdersChanged);
        }
        if menu_changed {
            self.bus.publish(StoreEvent::MenuChanged);
        }
        Ok(())
    }

    /// Apply the retry policy to a failed replay and decide how the cycle
    /// proceeds.
    fn handle_failure(
        &self,
        entry: &QueueEntry,
        payload: &Value,
        err: RemoteError,
    ) -> Result<FailureOutcome, PosError> {
        let conn = self.db.lock()?;
        let detail = err.to_string();

        match err {
            RemoteError::Auth(auth_detail) => {
                db::set_setting(&conn, SETTINGS_CATEGORY, KEY_LAST_ERROR, &detail)?;
                Ok(FailureOutcome::HaltAuth(auth_detail))
            }
            RemoteError::Transient(_) => {
                debug!(id = entry.id, detail, "transient failure, will retry in place");
                queue::record_transient(&conn, entry.id, &detail)?;
                db::set_setting(&conn, SETTINGS_CATEGORY, KEY_LAST_ERROR, &detail)?;
                Ok(FailureOutcome::HaltCycle)
            }
            // Duplicate-key outside order creation is a structural
            // conflict this terminal cannot resolve by retrying.
            RemoteError::DuplicateKey(_) | RemoteError::Rejected(_) => {
                let count = queue::record_failure(&conn, entry.id, &detail)?;
                db::set_setting(&conn, SETTINGS_CATEGORY, KEY_LAST_ERROR, &detail)?;
                if count < self.policy.retry_ceiling {
                    warn!(
                        id = entry.id,
                        retry = count,
                        detail,
                        "replay rejected, retrying next cycle"
                    );
                    return Ok(FailureOutcome::HaltCycle);
                }
                error!(
                    id = entry.id,
                    action = ?entry.action,
                    detail,
                    "retry ceiling reached, dropping queue entry"
                );
                queue::delete_entry(&conn, entry.id)?;
                if entry.action.touches_order() {
                    if let Some(order_id) = payload.get("order_id").and_then(Value::as_str) {
                        conn.execute(
                            "UPDATE orders SET sync_status = ?2 WHERE id = ?1",
                            rusqlite::params![order_id, SyncStatus::Error.as_str()],
                        )?;
                        drop(conn);
                        self.bus.publish(StoreEvent::OrdersChanged);
                    }
                }
                Ok(FailureOutcome::Dropped)
            }
        }
    }

    /// Background loop: drain when asked, on the policy interval, and on
    /// every transition to `Online`. Runs until the engine is dropped.
    pub fn spawn(self: Arc<Self>, mut connectivity: watch::Receiver<ConnectivityState>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.policy.drain_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = self.drain_requested.notified() => {}
                    _ = ticker.tick() => {}
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *connectivity.borrow() != ConnectivityState::Online {
                            continue;
                        }
                        debug!("connectivity restored, draining");
                    }
                }
                if *connectivity.borrow() != ConnectivityState::Online {
                    continue;
                }
                if let Err(err) = self.run_cycle().await {
                    error!(%err, "drain cycle failed");
                }
            }
        });
    }
}
