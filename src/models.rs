//! Typed domain entities for the offline cache.
//!
//! Everything the Local Store holds is a plain serde struct so cache slots
//! can be serialized wholesale and restored without re-interpreting dynamic
//! JSON. Bundle ("deal") components are a tagged struct parsed once at the
//! boundary instead of an embedded blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Order channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OrderType {
    #[default]
    WalkIn,
    Takeaway,
    Delivery,
}

/// Order lifecycle status. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    #[default]
    Pending,
    Preparing,
    Ready,
    Dispatched,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Draft => "draft",
            OrderStatus::Pending => "pending",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Dispatched => "dispatched",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

/// How an order is (to be) paid. `Split` orders carry one
/// [`PaymentTransaction`] per tender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Split,
    CustomerAccount,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Split => "split",
            PaymentMethod::CustomerAccount => "customer_account",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
}

/// Reconciliation state of a locally held order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Unsynced,
    Syncing,
    Synced,
    SyncFailed,
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// One component of a bundled deal line, matched against the product catalog
/// by name (and variant name) when resolving recipes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealComponent {
    pub name: String,
    pub variant: Option<String>,
    pub quantity: f64,
}

/// Embedded component list for a deal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealBundle {
    pub components: Vec<DealComponent>,
}

/// A single order line. Either a catalog product (with optional variant) or,
/// when `bundle` is set, a deal sold as one priced unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: Option<String>,
    pub variant_id: Option<String>,
    pub name: String,
    pub quantity: f64,
    /// Price per unit in currency units.
    pub unit_price: f64,
    pub total_price: f64,
    #[serde(default)]
    pub bundle: Option<DealBundle>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Customer reference carried on an order. `remote_id` is absent until the
/// customer has been resolved (or created) in the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OrderCustomer {
    pub remote_id: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// An order as held by the Local Store.
///
/// `local_id` is minted on-device and never changes. `remote_id` is assigned
/// exactly once by the remote store; after assignment all child records
/// (payments, history) are re-keyed to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub local_id: String,
    pub remote_id: Option<String>,
    /// Human-facing display number, e.g. `ORD-06082026-00014`.
    pub order_number: String,
    /// Per-day UI counter assigned by the daily sequence allocator. Not part
    /// of the durable remote record.
    #[serde(default)]
    pub daily_number: Option<u32>,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub subtotal: f64,
    pub discount_amount: f64,
    pub delivery_fee: f64,
    pub total_amount: f64,
    pub payment_method: Option<PaymentMethod>,
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub customer: Option<OrderCustomer>,
    #[serde(default)]
    pub rider_id: Option<String>,
    #[serde(default)]
    pub loyalty_points_redeemed: f64,
    /// Set once the loyalty debit has been replayed remotely.
    #[serde(default)]
    pub loyalty_synced: bool,
    /// Total last written to the customer account ledger, if any. A replay
    /// updates rather than duplicates when this no longer matches.
    #[serde(default)]
    pub account_synced_total: Option<f64>,
    /// Set once the inventory engine has deducted stock for this order.
    #[serde(default)]
    pub stock_deducted: bool,
    pub lines: Vec<OrderLine>,
    pub sync_state: SyncState,
    #[serde(default)]
    pub last_sync_error: Option<String>,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
    pub staff_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Identifier child records should currently be keyed by: the remote id
    /// once assigned, the local id before that.
    pub fn sync_key(&self) -> &str {
        self.remote_id.as_deref().unwrap_or(&self.local_id)
    }

    pub fn needs_sync(&self) -> bool {
        matches!(self.sync_state, SyncState::Unsynced | SyncState::SyncFailed)
    }
}

// ---------------------------------------------------------------------------
// Queued mutations
// ---------------------------------------------------------------------------

/// A queued status transition. At most one is retained per order; a newer
/// update supersedes an older one (last-write-wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingStatusUpdate {
    /// Primary key: the order's local identifier (or remote identifier for
    /// orders that were never cached locally).
    pub order_key: String,
    /// Secondary lookup key, survives identifier reassignment.
    pub order_number: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
    #[serde(default)]
    pub estimated_minutes: Option<i64>,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Modified,
    StatusChanged,
    Cancelled,
    PaymentRecorded,
}

/// Item-level difference captured when an order is modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItemDiff {
    pub name: String,
    pub variant: Option<String>,
    pub quantity_before: f64,
    pub quantity_after: f64,
}

/// Append-only audit record attached to an order. Created both online and
/// offline; always drained through the sync queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderHistoryEntry {
    pub id: String,
    /// Order key at creation time; rewritten local -> remote on
    /// reconciliation.
    pub order_key: String,
    pub order_number: String,
    pub action: HistoryAction,
    pub actor: String,
    pub total_before: f64,
    pub total_after: f64,
    #[serde(default)]
    pub item_diffs: Vec<HistoryItemDiff>,
    #[serde(default)]
    pub synced: bool,
    /// Done-but-skipped marker for orphaned entries whose order can no
    /// longer be resolved.
    #[serde(default)]
    pub skipped: bool,
    pub created_at: DateTime<Utc>,
}

/// One tender of a (possibly split) payment, keyed by the order like history
/// entries and migrated with it on reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: String,
    pub order_key: String,
    pub order_number: String,
    pub method: PaymentMethod,
    pub amount: f64,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub skipped: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Inventory & catalog
// ---------------------------------------------------------------------------

/// A stock-keeping unit. `current_stock` is kept in the item's canonical
/// base unit and may go negative (logged, never rejected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: String,
    pub name: String,
    /// Canonical base unit symbol ("kg", "l", "pcs", ...).
    pub unit: String,
    pub current_stock: f64,
    pub avg_unit_cost: f64,
    pub updated_at: DateTime<Utc>,
}

/// Append-only stock movement row mirrored to the remote ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockLedgerEntry {
    pub id: String,
    pub inventory_item_id: String,
    pub order_number: Option<String>,
    pub delta: f64,
    pub stock_before: f64,
    pub stock_after: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// One ingredient requirement of a recipe, in the recipe's own unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeLine {
    pub inventory_item_id: String,
    pub quantity: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductVariant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub recipe: Vec<RecipeLine>,
}

/// Catalog product with its base recipe and per-variant recipes. Read-only
/// input to the inventory deduction engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub recipe: Vec<RecipeLine>,
    #[serde(default)]
    pub variants: Vec<ProductVariant>,
}
