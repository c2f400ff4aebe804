//! tably-pos: offline-first sync engine for a restaurant point of sale.
//!
//! The terminal works against a local SQLite store; every mutation also
//! lands in a durable command queue that the sync engine replays against
//! the hosted backend whenever connectivity allows. The reconciler pulls
//! remote changes back in, resolving conflicts deterministically.

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod audit;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod events;
pub mod menu;
pub mod models;
pub mod orders;
pub mod policy;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod session;
pub mod sync;
pub mod tables;

pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use db::DbState;
pub use error::PosError;
pub use events::{EventBus, StoreEvent};
pub use policy::SyncPolicy;
pub use reconcile::Reconciler;
pub use session::{Role, Session};
pub use sync::SyncEngine;

/// Initialize structured logging (console + daily rolling file).
///
/// Call once at startup. The returned guard must stay alive for the
/// process lifetime; dropping it flushes and stops the file writer.
pub fn init_tracing(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tably_pos=debug"));

    std::fs::create_dir_all(log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(log_dir, "pos");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

/// Fully wired engine: store, event bus, connectivity monitor, outbound
/// sync, and inbound reconciler sharing one policy.
pub struct PosEngine {
    pub db: Arc<DbState>,
    pub bus: EventBus,
    pub remote: Arc<dyn remote::RemoteBackend>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub sync: Arc<SyncEngine>,
    pub reconciler: Arc<Reconciler>,
    pub policy: SyncPolicy,
}

impl PosEngine {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn remote::RemoteBackend>,
        policy: SyncPolicy,
    ) -> Self {
        let bus = EventBus::new();
        let connectivity = Arc::new(ConnectivityMonitor::new(remote.clone()));
        let sync = Arc::new(SyncEngine::new(
            db.clone(),
            remote.clone(),
            bus.clone(),
            policy.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            db.clone(),
            remote.clone(),
            bus.clone(),
            policy.clone(),
        ));
        Self {
            db,
            bus,
            remote,
            connectivity,
            sync,
            reconciler,
            policy,
        }
    }

    /// Start the background probe and drain loops. Must run inside a
    /// tokio runtime.
    pub fn start(&self) {
        self.connectivity.clone().spawn(&self.policy);
        self.sync.clone().spawn(self.connectivity.subscribe());
    }
}
