//! In-process event bus and live query views.
//!
//! Cross-component signals travel over an explicit broadcast channel scoped
//! to the engine's lifetime instead of ambient global state. Every lifecycle
//! operation publishes after its transaction commits; live views re-query
//! the store whenever an event touching their range arrives.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::db::DbState;
use crate::error::PosError;
use crate::models::{Order, TableWithOccupancy};
use crate::{orders, tables};

/// Events published after committed writes to the local store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    OrdersChanged,
    TablesChanged,
    MenuChanged,
    /// Queue depth after an enqueue or a drain step.
    QueueChanged {
        pending: i64,
    },
    /// Credentials were rejected by the remote backend; the application
    /// must prompt for re-login before sync can resume.
    ReauthRequired,
}

/// Cheap-to-clone handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        // Slow subscribers drop old events and re-query on the next one,
        // so a modest buffer is enough.
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; a bus with no subscribers is not an error.
    pub fn publish(&self, event: StoreEvent) {
        debug!(?event, "store event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Live views
// ---------------------------------------------------------------------------

fn affects_tables(event: &StoreEvent) -> bool {
    matches!(
        event,
        StoreEvent::OrdersChanged | StoreEvent::TablesChanged
    )
}

fn affects_orders(event: &StoreEvent) -> bool {
    matches!(event, StoreEvent::OrdersChanged)
}

/// Subscribe to the tables-with-occupancy view. Yields the current snapshot
/// immediately, then again after every committed write touching orders or
/// tables. The forwarding task exits when the receiver is dropped.
pub fn watch_tables(
    db: Arc<DbState>,
    bus: &EventBus,
) -> Result<mpsc::UnboundedReceiver<Vec<TableWithOccupancy>>, PosError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let initial = {
        let conn = db.lock()?;
        tables::tables_with_occupancy(&conn)?
    };
    let _ = tx.send(initial);

    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if affects_tables(&event) => {
                    let snapshot = {
                        let Ok(conn) = db.lock() else { break };
                        match tables::tables_with_occupancy(&conn) {
                            Ok(s) => s,
                            Err(_) => continue,
                        }
                    };
                    if tx.send(snapshot).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                // Lagged: the next matching event triggers a fresh query.
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    Ok(rx)
}

/// Subscribe to the orders view, most recent first.
pub fn watch_orders(
    db: Arc<DbState>,
    bus: &EventBus,
) -> Result<mpsc::UnboundedReceiver<Vec<Order>>, PosError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let initial = {
        let conn = db.lock()?;
        orders::list_orders(&conn)?
    };
    let _ = tx.send(initial);

    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if affects_orders(&event) => {
                    let snapshot = {
                        let Ok(conn) = db.lock() else { break };
                        match orders::list_orders(&conn) {
                            Ok(s) => s,
                            Err(_) => continue,
                        }
                    };
                    if tx.send(snapshot).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    Ok(rx)
}
