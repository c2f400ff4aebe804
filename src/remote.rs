//! Remote backend port and its HTTP implementation.
//!
//! The sync engine and the reconciler talk to the hosted backend through
//! the `RemoteBackend` trait so tests can substitute a scripted mock. The
//! production implementation targets the backend's REST surface with
//! api-key auth over reqwest.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::models::{AuditLogEntry, MenuItem, Order, OrderItem, OrderStatus, Table};
use crate::policy::SyncPolicy;
use crate::session::Session;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classified remote failure. The sync engine's retry policy keys off the
/// variant, so implementations must map transport and HTTP conditions
/// accurately; in particular a duplicate-key rejection must be
/// distinguishable for idempotent replay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Credentials expired or revoked. Halts the drain cycle.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network-level or server-side failure expected to clear on its own.
    #[error("transient: {0}")]
    Transient(String),

    /// The record already exists remotely. For create operations this is
    /// success under retry.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Structural/validation rejection; retried up to the ceiling.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// One remote order together with its item lines, as returned by the
/// windowed pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulledOrder {
    #[serde(flatten)]
    pub order: Order,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

/// Window and scope for the reconciler's inbound pull. `staff_id` is set
/// for non-privileged sessions; the backend applies row-level security on
/// top of it.
#[derive(Debug, Clone)]
pub struct OrderPullQuery {
    pub from: String,
    pub to: String,
    pub statuses: Vec<OrderStatus>,
    pub staff_id: Option<String>,
}

impl OrderPullQuery {
    pub fn for_session(
        session: &Session,
        from: impl Into<String>,
        to: impl Into<String>,
        statuses: Vec<OrderStatus>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            statuses,
            staff_id: if session.role.is_privileged() {
                None
            } else {
                Some(session.user_id.clone())
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn insert_order(&self, order: &Order, items: &[OrderItem]) -> Result<(), RemoteError>;
    async fn update_order(&self, order: &Order) -> Result<(), RemoteError>;
    async fn replace_order_items(
        &self,
        order_id: &str,
        items: &[OrderItem],
    ) -> Result<(), RemoteError>;

    /// Upsert a menu item. Returns the server-assigned id, which differs
    /// from `item.id` when the local copy still carries a `local-` id.
    async fn upsert_menu_item(&self, item: &MenuItem) -> Result<String, RemoteError>;
    async fn update_menu_item(&self, item: &MenuItem) -> Result<(), RemoteError>;
    async fn delete_menu_item(&self, id: &str) -> Result<(), RemoteError>;

    async fn append_audit_logs(&self, entries: &[AuditLogEntry]) -> Result<(), RemoteError>;

    async fn replace_table_layout(&self, tables: &[Table]) -> Result<(), RemoteError>;
    async fn delete_table(&self, id: &str) -> Result<(), RemoteError>;

    /// Pull orders updated within the window, filtered by status and scope.
    async fn fetch_orders(&self, query: &OrderPullQuery) -> Result<Vec<PulledOrder>, RemoteError>;

    /// Lightweight reachability probe for the connectivity monitor.
    async fn health_check(&self) -> Result<(), RemoteError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Normalise the backend base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Convert a `reqwest::Error` into a classified transient failure.
fn transport_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_connect() {
        return RemoteError::Transient(format!("cannot reach backend at {url}"));
    }
    if err.is_timeout() {
        return RemoteError::Transient(format!("connection to {url} timed out"));
    }
    RemoteError::Transient(format!("network error communicating with {url}: {err}"))
}

/// Classify a non-success HTTP response.
fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let detail = if let Ok(json) = serde_json::from_str::<Value>(body) {
        json.get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
    } else if !body.trim().is_empty() {
        format!("HTTP {}: {}", status.as_u16(), body.trim())
    } else {
        format!("HTTP {}", status.as_u16())
    };

    match status.as_u16() {
        401 | 403 => RemoteError::Auth(detail),
        409 => RemoteError::DuplicateKey(detail),
        408 | 429 => RemoteError::Transient(detail),
        s if s >= 500 => RemoteError::Transient(detail),
        _ => RemoteError::Rejected(detail),
    }
}

/// reqwest-backed implementation talking to the hosted backend.
pub struct HttpBackend {
    base_url: String,
    api_key: String,
    client: Client,
    probe_client: Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: &str, policy: &SyncPolicy) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(policy.request_timeout)
            .build()
            .map_err(|e| RemoteError::Rejected(format!("failed to create HTTP client: {e}")))?;
        let probe_client = Client::builder()
            .timeout(policy.probe_timeout)
            .build()
            .map_err(|e| RemoteError::Rejected(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
            client,
            probe_client,
        })
    }

    /// Perform an authenticated request. `path` includes the leading slash.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, RemoteError> {
        let full_url = format!("{}{path}", self.base_url);

        let mut req = self
            .client
            .request(method, &full_url)
            .header("X-POS-API-Key", &self.api_key)
            .header("Content-Type", "application/json");
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(classify_status(status, &body_text));
        }

        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| RemoteError::Rejected(format!("invalid JSON from backend: {e}")))
    }

    fn to_value<T: Serialize>(value: &T) -> Result<Value, RemoteError> {
        serde_json::to_value(value)
            .map_err(|e| RemoteError::Rejected(format!("serialize payload: {e}")))
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn insert_order(&self, order: &Order, items: &[OrderItem]) -> Result<(), RemoteError> {
        let body = serde_json::json!({
            "order": Self::to_value(order)?,
            "items": Self::to_value(&items)?,
        });
        self.request(Method::POST, "/api/pos/orders", Some(body))
            .await?;
        Ok(())
    }

    async fn update_order(&self, order: &Order) -> Result<(), RemoteError> {
        let path = format!("/api/pos/orders/{}", order.id);
        self.request(Method::PATCH, &path, Some(Self::to_value(order)?))
            .await?;
        Ok(())
    }

    async fn replace_order_items(
        &self,
        order_id: &str,
        items: &[OrderItem],
    ) -> Result<(), RemoteError> {
        let path = format!("/api/pos/orders/{order_id}/items");
        self.request(Method::PUT, &path, Some(Self::to_value(&items)?))
            .await?;
        Ok(())
    }

    async fn upsert_menu_item(&self, item: &MenuItem) -> Result<String, RemoteError> {
        let resp = self
            .request(
                Method::POST,
                "/api/pos/menu/items",
                Some(Self::to_value(item)?),
            )
            .await?;
        resp.get("id")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| RemoteError::Rejected("menu upsert response missing id".to_string()))
    }

    async fn update_menu_item(&self, item: &MenuItem) -> Result<(), RemoteError> {
        let path = format!("/api/pos/menu/items/{}", item.id);
        self.request(Method::PATCH, &path, Some(Self::to_value(item)?))
            .await?;
        Ok(())
    }

    async fn delete_menu_item(&self, id: &str) -> Result<(), RemoteError> {
        let path = format!("/api/pos/menu/items/{id}");
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn append_audit_logs(&self, entries: &[AuditLogEntry]) -> Result<(), RemoteError> {
        self.request(
            Method::POST,
            "/api/pos/audit-logs",
            Some(Self::to_value(&entries)?),
        )
        .await?;
        Ok(())
    }

    async fn replace_table_layout(&self, tables: &[Table]) -> Result<(), RemoteError> {
        self.request(
            Method::PUT,
            "/api/pos/tables",
            Some(Self::to_value(&tables)?),
        )
        .await?;
        Ok(())
    }

    async fn delete_table(&self, id: &str) -> Result<(), RemoteError> {
        let path = format!("/api/pos/tables/{id}");
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn fetch_orders(&self, query: &OrderPullQuery) -> Result<Vec<PulledOrder>, RemoteError> {
        let statuses = query
            .statuses
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let mut path = format!(
            "/api/pos/orders/sync?from={}&to={}&statuses={statuses}",
            query.from, query.to
        );
        if let Some(staff_id) = &query.staff_id {
            path.push_str("&staff_id=");
            path.push_str(staff_id);
        }

        let resp = self.request(Method::GET, &path, None).await?;
        let orders = resp
            .get("orders")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(orders)
            .map_err(|e| RemoteError::Rejected(format!("invalid order pull payload: {e}")))
    }

    async fn health_check(&self) -> Result<(), RemoteError> {
        let url = format!("{}/api/health", self.base_url);
        let resp = self
            .probe_client
            .get(&url)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        let status = resp.status();
        if status.is_success() {
            info!("health probe passed");
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    /// Scripted in-memory backend. Records calls in order, simulates
    /// duplicate-key on repeated order inserts, and pops pre-programmed
    /// failures per method name.
    #[derive(Default)]
    pub struct MockBackend {
        pub calls: Mutex<Vec<String>>,
        scripted: Mutex<HashMap<&'static str, VecDeque<RemoteError>>>,
        inserted_orders: Mutex<HashSet<String>>,
        pub pull_result: Mutex<Vec<PulledOrder>>,
        next_menu_id: AtomicI64,
        pub healthy: Mutex<bool>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self {
                next_menu_id: AtomicI64::new(1000),
                healthy: Mutex::new(true),
                ..Default::default()
            }
        }

        /// Queue an error for the next call to `method`.
        pub fn script_error(&self, method: &'static str, err: RemoteError) {
            self.scripted
                .lock()
                .unwrap()
                .entry(method)
                .or_default()
                .push_back(err);
        }

        pub fn set_pull_result(&self, orders: Vec<PulledOrder>) {
            *self.pull_result.lock().unwrap() = orders;
        }

        pub fn call_log(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn pop_scripted(&self, method: &'static str) -> Option<RemoteError> {
            self.scripted
                .lock()
                .unwrap()
                .get_mut(method)
                .and_then(|q| q.pop_front())
        }
    }

    #[async_trait]
    impl RemoteBackend for MockBackend {
        async fn insert_order(
            &self,
            order: &Order,
            _items: &[OrderItem],
        ) -> Result<(), RemoteError> {
            self.record(format!("insert_order:{}", order.id));
            if let Some(err) = self.pop_scripted("insert_order") {
                return Err(err);
            }
            let mut inserted = self.inserted_orders.lock().unwrap();
            if !inserted.insert(order.id.clone()) {
                return Err(RemoteError::DuplicateKey(format!(
                    "order {} already exists",
                    order.id
                )));
            }
            Ok(())
        }

        async fn update_order(&self, order: &Order) -> Result<(), RemoteError> {
            self.record(format!("update_order:{}", order.id));
            match self.pop_scripted("update_order") {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn replace_order_items(
            &self,
            order_id: &str,
            items: &[OrderItem],
        ) -> Result<(), RemoteError> {
            self.record(format!("replace_order_items:{order_id}:{}", items.len()));
            match self.pop_scripted("replace_order_items") {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn upsert_menu_item(&self, item: &MenuItem) -> Result<String, RemoteError> {
            self.record(format!("upsert_menu_item:{}", item.uid));
            if let Some(err) = self.pop_scripted("upsert_menu_item") {
                return Err(err);
            }
            if item.has_local_id() {
                Ok(self.next_menu_id.fetch_add(1, Ordering::SeqCst).to_string())
            } else {
                Ok(item.id.clone())
            }
        }

        async fn update_menu_item(&self, item: &MenuItem) -> Result<(), RemoteError> {
            self.record(format!("update_menu_item:{}", item.id));
            match self.pop_scripted("update_menu_item") {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn delete_menu_item(&self, id: &str) -> Result<(), RemoteError> {
            self.record(format!("delete_menu_item:{id}"));
            match self.pop_scripted("delete_menu_item") {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn append_audit_logs(&self, entries: &[AuditLogEntry]) -> Result<(), RemoteError> {
            self.record(format!("append_audit_logs:{}", entries.len()));
            match self.pop_scripted("append_audit_logs") {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn replace_table_layout(&self, tables: &[Table]) -> Result<(), RemoteError> {
            self.record(format!("replace_table_layout:{}", tables.len()));
            match self.pop_scripted("replace_table_layout") {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn delete_table(&self, id: &str) -> Result<(), RemoteError> {
            self.record(format!("delete_table:{id}"));
            match self.pop_scripted("delete_table") {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn fetch_orders(
            &self,
            query: &OrderPullQuery,
        ) -> Result<Vec<PulledOrder>, RemoteError> {
            self.record(format!("fetch_orders:{}..{}", query.from, query.to));
            if let Some(err) = self.pop_scripted("fetch_orders") {
                return Err(err);
            }
            Ok(self.pull_result.lock().unwrap().clone())
        }

        async fn health_check(&self) -> Result<(), RemoteError> {
            self.record("health_check".to_string());
            if let Some(err) = self.pop_scripted("health_check") {
                return Err(err);
            }
            if *self.healthy.lock().unwrap() {
                Ok(())
            } else {
                Err(RemoteError::Transient("probe failed".to_string()))
            }
        }
    }
}
