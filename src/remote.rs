//! Remote transactional store interface.
//!
//! The engine talks to the remote relational service only through the
//! [`RemoteStore`] trait: table-like operations over orders, lines,
//! customers, riders, inventory, ledgers, payments and history. The
//! production implementation speaks authenticated JSON over HTTPS; tests
//! swap in an in-memory mock.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::config::TerminalConfig;
use crate::models::{
    CatalogProduct, HistoryItemDiff, InventoryItem, Order, OrderCustomer, OrderHistoryEntry,
    OrderLine, PaymentMethod, PaymentTransaction, PendingStatusUpdate, StockLedgerEntry,
};

/// Default timeout for remote requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used for the lightweight health check.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// A debit row in the customer account ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountDebit {
    pub id: String,
    pub remote_order_id: String,
    pub customer_id: Option<String>,
    pub amount: f64,
}

/// Table-like operations exposed by the remote transactional store.
///
/// Every method is one remote round trip; callers own ordering and retry.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn health_check(&self) -> Result<(), String>;

    // Orders -----------------------------------------------------------------
    async fn find_order_id_by_number(&self, order_number: &str)
        -> Result<Option<String>, String>;
    async fn order_exists(&self, remote_id: &str) -> Result<bool, String>;
    /// Insert an order header; returns the server-assigned identifier.
    async fn insert_order(&self, order: &Order) -> Result<String, String>;
    async fn update_order(&self, remote_id: &str, order: &Order) -> Result<(), String>;
    async fn update_order_status(
        &self,
        remote_id: &str,
        update: &PendingStatusUpdate,
    ) -> Result<(), String>;
    /// Replace an order's line set: delete all current lines, reinsert.
    async fn replace_order_lines(
        &self,
        remote_id: &str,
        lines: &[OrderLine],
    ) -> Result<(), String>;
    /// Display numbers of recently created orders, oldest first.
    async fn fetch_recent_order_numbers(&self) -> Result<Vec<String>, String>;

    // Customers & riders -----------------------------------------------------
    async fn find_customer_id_by_phone(&self, phone: &str) -> Result<Option<String>, String>;
    async fn create_customer(&self, customer: &OrderCustomer) -> Result<String, String>;
    async fn rider_exists(&self, rider_id: &str) -> Result<bool, String>;

    // History ----------------------------------------------------------------
    async fn insert_history_entry(
        &self,
        remote_order_id: &str,
        entry: &OrderHistoryEntry,
    ) -> Result<String, String>;
    async fn insert_history_item_diffs(
        &self,
        remote_history_id: &str,
        diffs: &[HistoryItemDiff],
    ) -> Result<(), String>;

    // Payments ---------------------------------------------------------------
    async fn payment_exists(
        &self,
        remote_order_id: &str,
        method: PaymentMethod,
    ) -> Result<bool, String>;
    async fn insert_payment(
        &self,
        remote_order_id: &str,
        payment: &PaymentTransaction,
    ) -> Result<(), String>;

    // Loyalty & account ledger -----------------------------------------------
    /// Debit redeemed points from a loyalty balance and write the audit row.
    async fn debit_loyalty_points(
        &self,
        customer_id: &str,
        points: f64,
        remote_order_id: &str,
    ) -> Result<(), String>;
    async fn find_account_debit(
        &self,
        remote_order_id: &str,
    ) -> Result<Option<AccountDebit>, String>;
    async fn insert_account_debit(&self, debit: &AccountDebit) -> Result<(), String>;
    async fn update_account_debit(&self, debit_id: &str, amount: f64) -> Result<(), String>;

    // Inventory --------------------------------------------------------------
    async fn fetch_inventory_item(&self, id: &str) -> Result<Option<InventoryItem>, String>;
    async fn update_inventory_stock(&self, id: &str, new_stock: f64) -> Result<(), String>;
    async fn insert_stock_ledger(&self, entry: &StockLedgerEntry) -> Result<(), String>;
    async fn fetch_inventory(&self) -> Result<Vec<InventoryItem>, String>;
    async fn fetch_catalog(&self) -> Result<Vec<CatalogProduct>, String>;
}

// ---------------------------------------------------------------------------
// URL and error helpers
// ---------------------------------------------------------------------------

/// Normalise the remote base URL:
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

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach remote store at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid remote store URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Remote store endpoint not found".to_string(),
        409 => "Remote store rejected a conflicting write (HTTP 409)".to_string(),
        s if s >= 500 => format!("Remote store server error (HTTP {s})"),
        s => format!("Unexpected response from remote store (HTTP {s})"),
    }
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// JSON-over-HTTPS client for the remote transactional store.
pub struct HttpRemoteStore {
    base_url: String,
    api_key: String,
    terminal_id: String,
    client: Client,
}

impl HttpRemoteStore {
    pub fn new(config: &TerminalConfig) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;

        Ok(Self {
            base_url: normalize_base_url(&config.remote_url),
            api_key: config.api_key.clone(),
            terminal_id: config.terminal_id.clone(),
            client,
        })
    }

    /// Perform an authenticated request. `path` includes the leading slash.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, String> {
        match self.request_inner(method, path, body).await? {
            Some(value) => Ok(value),
            None => Err(status_error(StatusCode::NOT_FOUND)),
        }
    }

    /// Like [`Self::request`], but a 404 becomes `Ok(None)` so existence
    /// lookups do not have to parse error strings.
    async fn request_optional(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>, String> {
        self.request_inner(method, path, body).await
    }

    async fn request_inner(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>, String> {
        let full_url = format!("{}{}", self.base_url, path);

        let mut req = self
            .client
            .request(method, &full_url)
            .header("X-POS-API-Key", &self.api_key)
            .header("x-terminal-id", &self.terminal_id)
            .header("Content-Type", "application/json");

        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            let detail = if let Ok(json) = serde_json::from_str::<Value>(&body_text) {
                let message = json
                    .get("error")
                    .or_else(|| json.get("message"))
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| status_error(status));
                format!("{message} (HTTP {})", status.as_u16())
            } else if !body_text.trim().is_empty() {
                format!(
                    "{} (HTTP {}): {}",
                    status_error(status),
                    status.as_u16(),
                    body_text.trim()
                )
            } else {
                format!("{} (HTTP {})", status_error(status), status.as_u16())
            };
            return Err(detail);
        }

        let body_text = resp.text().await.unwrap_or_default();
        if body_text.is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_str(&body_text)
            .map(Some)
            .map_err(|e| format!("Invalid JSON from remote store: {e}"))
    }
}

fn order_header_payload(order: &Order) -> Value {
    serde_json::json!({
        "order_number": order.order_number,
        "order_type": order.order_type,
        "status": order.status,
        "subtotal": order.subtotal,
        "discount_amount": order.discount_amount,
        "delivery_fee": order.delivery_fee,
        "total_amount": order.total_amount,
        "payment_method": order.payment_method,
        "payment_status": order.payment_status,
        "customer_id": order.customer.as_ref().and_then(|c| c.remote_id.clone()),
        "rider_id": order.rider_id,
        "loyalty_points_redeemed": order.loyalty_points_redeemed,
        "cancellation_reason": order.cancellation_reason,
        "staff_id": order.staff_id,
        "created_at": order.created_at,
        "updated_at": order.updated_at,
    })
}

fn extract_id(resp: &Value) -> Result<String, String> {
    resp.get("id")
        .or_else(|| resp.get("data").and_then(|d| d.get("id")))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| "Remote response missing id".to_string())
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn health_check(&self) -> Result<(), String> {
        let url = format!("{}/api/pos/health", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(status_error(resp.status()))
        }
    }

    async fn find_order_id_by_number(
        &self,
        order_number: &str,
    ) -> Result<Option<String>, String> {
        let path = format!(
            "/api/pos/orders?order_number={}",
            percent_encode(order_number)
        );
        let resp = self.request(Method::GET, &path, None).await?;
        let id = resp
            .get("orders")
            .and_then(Value::as_array)
            .and_then(|orders| orders.first())
            .and_then(|o| o.get("id"))
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        Ok(id)
    }

    async fn order_exists(&self, remote_id: &str) -> Result<bool, String> {
        let path = format!("/api/pos/orders/{}", percent_encode(remote_id));
        Ok(self
            .request_optional(Method::GET, &path, None)
            .await?
            .is_some())
    }

    async fn insert_order(&self, order: &Order) -> Result<String, String> {
        let resp = self
            .request(
                Method::POST,
                "/api/pos/orders",
                Some(order_header_payload(order)),
            )
            .await?;
        extract_id(&resp)
    }

    async fn update_order(&self, remote_id: &str, order: &Order) -> Result<(), String> {
        let path = format!("/api/pos/orders/{}", percent_encode(remote_id));
        self.request(Method::PATCH, &path, Some(order_header_payload(order)))
            .await?;
        Ok(())
    }

    async fn update_order_status(
        &self,
        remote_id: &str,
        update: &PendingStatusUpdate,
    ) -> Result<(), String> {
        let path = format!("/api/pos/orders/{}/status", percent_encode(remote_id));
        let body = serde_json::json!({
            "status": update.status,
            "cancellation_reason": update.cancellation_reason,
            "estimated_minutes": update.estimated_minutes,
        });
        self.request(Method::PATCH, &path, Some(body)).await?;
        Ok(())
    }

    async fn replace_order_lines(
        &self,
        remote_id: &str,
        lines: &[OrderLine],
    ) -> Result<(), String> {
        // Delete-and-reinsert: the simplest way to guarantee the remote line
        // set matches current local state.
        let path = format!("/api/pos/orders/{}/lines", percent_encode(remote_id));
        self.request(Method::DELETE, &path, None).await?;
        let body = serde_json::json!({ "lines": lines });
        self.request(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    async fn fetch_recent_order_numbers(&self) -> Result<Vec<String>, String> {
        let resp = self
            .request(Method::GET, "/api/pos/orders/recent", None)
            .await?;
        let numbers = resp
            .get("orders")
            .and_then(Value::as_array)
            .map(|orders| {
                orders
                    .iter()
                    .filter_map(|o| o.get("order_number").and_then(Value::as_str))
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(numbers)
    }

    async fn find_customer_id_by_phone(&self, phone: &str) -> Result<Option<String>, String> {
        let path = format!("/api/pos/customers?phone={}", percent_encode(phone));
        let resp = match self.request_optional(Method::GET, &path, None).await? {
            Some(resp) => resp,
            None => return Ok(None),
        };
        Ok(resp
            .get("customers")
            .and_then(Value::as_array)
            .and_then(|customers| customers.first())
            .and_then(|c| c.get("id"))
            .and_then(Value::as_str)
            .map(|s| s.to_string()))
    }

    async fn create_customer(&self, customer: &OrderCustomer) -> Result<String, String> {
        let body = serde_json::json!({
            "name": customer.name,
            "phone": customer.phone,
        });
        let resp = self
            .request(Method::POST, "/api/pos/customers", Some(body))
            .await?;
        extract_id(&resp)
    }

    async fn rider_exists(&self, rider_id: &str) -> Result<bool, String> {
        let path = format!("/api/pos/riders/{}", percent_encode(rider_id));
        Ok(self
            .request_optional(Method::GET, &path, None)
            .await?
            .is_some())
    }

    async fn insert_history_entry(
        &self,
        remote_order_id: &str,
        entry: &OrderHistoryEntry,
    ) -> Result<String, String> {
        let path = format!("/api/pos/orders/{}/history", percent_encode(remote_order_id));
        let body = serde_json::json!({
            "action": entry.action,
            "actor": entry.actor,
            "total_before": entry.total_before,
            "total_after": entry.total_after,
            "created_at": entry.created_at,
        });
        let resp = self.request(Method::POST, &path, Some(body)).await?;
        extract_id(&resp)
    }

    async fn insert_history_item_diffs(
        &self,
        remote_history_id: &str,
        diffs: &[HistoryItemDiff],
    ) -> Result<(), String> {
        let path = format!(
            "/api/pos/history/{}/item-diffs",
            percent_encode(remote_history_id)
        );
        let body = serde_json::json!({ "diffs": diffs });
        self.request(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    async fn payment_exists(
        &self,
        remote_order_id: &str,
        method: PaymentMethod,
    ) -> Result<bool, String> {
        let path = format!(
            "/api/pos/orders/{}/payments",
            percent_encode(remote_order_id)
        );
        let resp = match self.request_optional(Method::GET, &path, None).await? {
            Some(resp) => resp,
            None => return Ok(false),
        };
        let exists = resp
            .get("payments")
            .and_then(Value::as_array)
            .map(|payments| {
                payments.iter().any(|p| {
                    p.get("method").and_then(Value::as_str) == Some(method.as_str())
                })
            })
            .unwrap_or(false);
        Ok(exists)
    }

    async fn insert_payment(
        &self,
        remote_order_id: &str,
        payment: &PaymentTransaction,
    ) -> Result<(), String> {
        let path = format!(
            "/api/pos/orders/{}/payments",
            percent_encode(remote_order_id)
        );
        let body = serde_json::json!({
            "method": payment.method,
            "amount": payment.amount,
            "created_at": payment.created_at,
        });
        self.request(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    async fn debit_loyalty_points(
        &self,
        customer_id: &str,
        points: f64,
        remote_order_id: &str,
    ) -> Result<(), String> {
        let body = serde_json::json!({
            "customer_id": customer_id,
            "points": points,
            "order_id": remote_order_id,
        });
        self.request(Method::POST, "/api/pos/loyalty/redemptions", Some(body))
            .await?;
        Ok(())
    }

    async fn find_account_debit(
        &self,
        remote_order_id: &str,
    ) -> Result<Option<AccountDebit>, String> {
        let path = format!(
            "/api/pos/account-ledger?order_id={}",
            percent_encode(remote_order_id)
        );
        let resp = match self.request_optional(Method::GET, &path, None).await? {
            Some(resp) => resp,
            None => return Ok(None),
        };
        let debit = resp
            .get("entries")
            .and_then(Value::as_array)
            .and_then(|entries| entries.first())
            .and_then(|e| {
                Some(AccountDebit {
                    id: e.get("id")?.as_str()?.to_string(),
                    remote_order_id: remote_order_id.to_string(),
                    customer_id: e
                        .get("customer_id")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string()),
                    amount: e.get("amount")?.as_f64()?,
                })
            });
        Ok(debit)
    }

    async fn insert_account_debit(&self, debit: &AccountDebit) -> Result<(), String> {
        let body = serde_json::json!({
            "order_id": debit.remote_order_id,
            "customer_id": debit.customer_id,
            "amount": debit.amount,
        });
        self.request(Method::POST, "/api/pos/account-ledger", Some(body))
            .await?;
        Ok(())
    }

    async fn update_account_debit(&self, debit_id: &str, amount: f64) -> Result<(), String> {
        let path = format!("/api/pos/account-ledger/{}", percent_encode(debit_id));
        let body = serde_json::json!({ "amount": amount });
        self.request(Method::PATCH, &path, Some(body)).await?;
        Ok(())
    }

    async fn fetch_inventory_item(&self, id: &str) -> Result<Option<InventoryItem>, String> {
        let path = format!("/api/pos/inventory/{}", percent_encode(id));
        let resp = match self.request_optional(Method::GET, &path, None).await? {
            Some(resp) => resp,
            None => return Ok(None),
        };
        serde_json::from_value(resp)
            .map(Some)
            .map_err(|e| format!("Invalid inventory item from remote store: {e}"))
    }

    async fn update_inventory_stock(&self, id: &str, new_stock: f64) -> Result<(), String> {
        let path = format!("/api/pos/inventory/{}", percent_encode(id));
        let body = serde_json::json!({ "current_stock": new_stock });
        self.request(Method::PATCH, &path, Some(body)).await?;
        Ok(())
    }

    async fn insert_stock_ledger(&self, entry: &StockLedgerEntry) -> Result<(), String> {
        let body = serde_json::to_value(entry).map_err(|e| e.to_string())?;
        self.request(Method::POST, "/api/pos/stock-ledger", Some(body))
            .await?;
        Ok(())
    }

    async fn fetch_inventory(&self) -> Result<Vec<InventoryItem>, String> {
        let resp = self.request(Method::GET, "/api/pos/inventory", None).await?;
        let items = resp
            .get("items")
            .cloned()
            .unwrap_or_else(|| Value::Array(vec![]));
        serde_json::from_value(items)
            .map_err(|e| format!("Invalid inventory list from remote store: {e}"))
    }

    async fn fetch_catalog(&self) -> Result<Vec<CatalogProduct>, String> {
        let resp = self.request(Method::GET, "/api/pos/catalog", None).await?;
        let products = resp
            .get("products")
            .cloned()
            .unwrap_or_else(|| Value::Array(vec![]));
        serde_json::from_value(products).map_err(|e| {
            warn!(error = %e, "Catalog payload failed to parse");
            format!("Invalid catalog from remote store: {e}")
        })
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("pos.example.com"),
            "https://pos.example.com"
        );
        assert_eq!(
            normalize_base_url("https://pos.example.com/api/"),
            "https://pos.example.com"
        );
        assert_eq!(
            normalize_base_url("localhost:3000/"),
            "http://localhost:3000"
        );
    }

    #[test]
    fn test_status_error_mapping() {
        assert_eq!(
            status_error(StatusCode::UNAUTHORIZED),
            "API key is invalid or expired"
        );
        assert_eq!(status_error(StatusCode::FORBIDDEN), "Terminal not authorized");
        assert!(status_error(StatusCode::BAD_GATEWAY).contains("HTTP 502"));
    }

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("ORD-06082026-00001"), "ORD-06082026-00001");
        assert_eq!(percent_encode("a b/c"), "a%20b%2Fc");
    }
}
