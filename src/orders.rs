//! Order lifecycle management.
//!
//! Entry point for the order-entry and status-board surfaces: creates and
//! modifies orders, transitions status, and decides synchronously whether a
//! mutation goes straight to the remote store or is queued for the sync
//! engine. Every failure short of a missing operator session degrades to
//! offline queuing — the caller sees success and the work is saved locally.

use chrono::Utc;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SessionContext;
use crate::db::SlotDb;
use crate::inventory;
use crate::models::{
    HistoryAction, HistoryItemDiff, Order, OrderCustomer, OrderHistoryEntry, OrderLine,
    OrderStatus, OrderType, PaymentMethod, PaymentStatus, PaymentTransaction,
    PendingStatusUpdate, SyncState,
};
use crate::CacheContext;

// ---------------------------------------------------------------------------
// Order number generation
// ---------------------------------------------------------------------------

/// Generate a sequential order number in format ORD-DDMMYYYY-NNNNN.
///
/// Uses `local_settings` (category='orders') as a persistent counter that
/// resets when the local calendar date changes. Distinct from the daily
/// sequence allocator: this mints the durable display number, the allocator
/// only maps display numbers to UI counters.
pub(crate) fn next_order_number(db: &SlotDb) -> String {
    let date_display = chrono::Local::now().format("%d%m%Y").to_string();

    let same_day = db
        .setting_get("orders", "order_counter_date")
        .map(|stored| stored == date_display)
        .unwrap_or(false);
    let current: i64 = if same_day {
        db.setting_get("orders", "order_counter")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    } else {
        0
    };

    let next = current + 1;
    let _ = db.setting_set("orders", "order_counter", &next.to_string());
    let _ = db.setting_set("orders", "order_counter_date", &date_display);

    format!("ORD-{date_display}-{next:05}")
}

// ---------------------------------------------------------------------------
// Order creation
// ---------------------------------------------------------------------------

/// Input to [`create_order`].
#[derive(Debug, Clone)]
pub struct NewOrderData {
    pub order_type: OrderType,
    /// Initial status; defaults to `Pending`. A kiosk flow may create
    /// directly as `Completed`.
    pub status: Option<OrderStatus>,
    pub lines: Vec<OrderLine>,
    pub subtotal: f64,
    pub discount_amount: f64,
    pub delivery_fee: f64,
    pub total_amount: f64,
    pub payment_method: Option<PaymentMethod>,
    pub payment_status: PaymentStatus,
    pub customer: Option<OrderCustomer>,
    pub rider_id: Option<String>,
    pub loyalty_points_redeemed: f64,
    /// When set, the request modifies the existing order matched by display
    /// number (falling back to local identifier) instead of creating one.
    pub modifies: Option<String>,
}

impl Default for NewOrderData {
    fn default() -> Self {
        Self {
            order_type: OrderType::WalkIn,
            status: None,
            lines: Vec::new(),
            subtotal: 0.0,
            discount_amount: 0.0,
            delivery_fee: 0.0,
            total_amount: 0.0,
            payment_method: None,
            payment_status: PaymentStatus::Pending,
            customer: None,
            rider_id: None,
            loyalty_points_redeemed: 0.0,
            modifies: None,
        }
    }
}

/// Create an order (or re-route a modification of an existing one).
///
/// Reachable: attempts an immediate remote write and marks the order
/// `Synced`. Unreachable, or on any remote failure: the order is stored
/// locally and picked up by the sync engine. The only fatal error is a
/// missing operator session.
pub async fn create_order(ctx: &CacheContext, data: NewOrderData) -> Result<Order, String> {
    let session = ctx
        .session()
        .ok_or("No operator session bound; cannot create order")?;

    if let Some(target) = data.modifies.clone() {
        let existing = ctx
            .store
            .find_order_by_number(&target)
            .or_else(|| ctx.store.get_order(&target));
        if let Some(existing) = existing {
            return modify_order(ctx, &session, existing, data).await;
        }
        warn!(target = %target, "Modification target not found locally; creating a new order");
    }

    let now = Utc::now();
    let order_number = next_order_number(&ctx.db);
    let daily_number = {
        let mut sequence = ctx.sequence.lock().unwrap_or_else(|e| e.into_inner());
        sequence.assign(&order_number)
    };

    let order = Order {
        local_id: Uuid::new_v4().to_string(),
        remote_id: None,
        order_number,
        daily_number: Some(daily_number),
        order_type: data.order_type,
        status: data.status.unwrap_or(OrderStatus::Pending),
        subtotal: data.subtotal,
        discount_amount: data.discount_amount,
        delivery_fee: data.delivery_fee,
        total_amount: data.total_amount,
        payment_method: data.payment_method,
        payment_status: data.payment_status,
        customer: data.customer,
        rider_id: data.rider_id,
        loyalty_points_redeemed: data.loyalty_points_redeemed,
        loyalty_synced: false,
        account_synced_total: None,
        stock_deducted: false,
        lines: data.lines,
        sync_state: SyncState::Unsynced,
        last_sync_error: None,
        cancellation_reason: None,
        staff_id: session.staff_id.clone(),
        created_at: now,
        updated_at: now,
    };

    let history = history_entry(
        &order,
        HistoryAction::Created,
        &session.staff_id,
        0.0,
        order.total_amount,
        Vec::new(),
    );

    dispatch_order(ctx, order, history).await
}

/// Replace an existing order's mutable fields and line list in place, then
/// route it through the same online/offline decision as a new order.
async fn modify_order(
    ctx: &CacheContext,
    session: &SessionContext,
    existing: Order,
    data: NewOrderData,
) -> Result<Order, String> {
    let diffs = compute_item_diffs(&existing.lines, &data.lines);
    let total_before = existing.total_amount;

    let mut order = existing;
    order.order_type = data.order_type;
    if let Some(status) = data.status {
        order.status = status;
    }
    order.subtotal = data.subtotal;
    order.discount_amount = data.discount_amount;
    order.delivery_fee = data.delivery_fee;
    order.total_amount = data.total_amount;
    order.payment_method = data.payment_method;
    order.payment_status = data.payment_status;
    if data.customer.is_some() {
        order.customer = data.customer;
    }
    order.rider_id = data.rider_id;
    order.loyalty_points_redeemed = data.loyalty_points_redeemed;
    order.lines = data.lines;
    order.sync_state = SyncState::Unsynced;
    order.last_sync_error = None;
    order.updated_at = Utc::now();

    info!(
        order_number = %order.order_number,
        "Order modified; replacing lines and re-syncing"
    );

    let history = history_entry(
        &order,
        HistoryAction::Modified,
        &session.staff_id,
        total_before,
        order.total_amount,
        diffs,
    );

    dispatch_order(ctx, order, history).await
}

/// Store the order, queue its history entry, and take the fast path when
/// the network allows it. Remote failures degrade to offline queuing.
async fn dispatch_order(
    ctx: &CacheContext,
    order: Order,
    history: OrderHistoryEntry,
) -> Result<Order, String> {
    ctx.store.upsert_order(order.clone());
    ctx.store.append_history(history);

    if ctx.reachability.is_online() {
        match push_order_direct(ctx, &order).await {
            Ok(remote_id) => {
                ctx.store.mark_order_synced(&order.local_id, &remote_id);
                // An order written remotely by insert while already completed
                // never passes the remote completion trigger; deduct here.
                if order.status == OrderStatus::Completed && order.remote_id.is_none() {
                    if let Some(synced) = ctx.store.get_order(&order.local_id) {
                        if let Err(e) = inventory::deduct_for_order(ctx, &synced).await {
                            warn!(
                                order_number = %order.order_number,
                                error = %e,
                                "Inventory deduction after direct insert failed"
                            );
                        }
                    }
                }
                return ctx
                    .store
                    .get_order(&order.local_id)
                    .ok_or_else(|| "Order vanished from store after sync".to_string());
            }
            Err(e) => {
                warn!(
                    order_number = %order.order_number,
                    error = %e,
                    "Direct order write failed; queuing for background sync"
                );
                ctx.store
                    .set_order_sync_state(&order.local_id, SyncState::SyncFailed, Some(e));
            }
        }
    }

    ctx.store
        .get_order(&order.local_id)
        .ok_or_else(|| "Order vanished from store".to_string())
}

/// Write the order header and replace its lines remotely. Inserts when no
/// remote identifier is assigned yet, updates otherwise.
async fn push_order_direct(ctx: &CacheContext, order: &Order) -> Result<String, String> {
    let remote_id = match order.remote_id.as_deref() {
        Some(id) => {
            ctx.remote.update_order(id, order).await?;
            id.to_string()
        }
        None => ctx.remote.insert_order(order).await?,
    };
    ctx.remote
        .replace_order_lines(&remote_id, &order.lines)
        .await?;
    Ok(remote_id)
}

// ---------------------------------------------------------------------------
// Status transitions
// ---------------------------------------------------------------------------

/// Side-data accompanying a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusExtra {
    pub cancellation_reason: Option<String>,
    pub estimated_minutes: Option<i64>,
}

/// Transition an order's status.
///
/// The Local Store is updated immediately and unconditionally; a direct
/// remote update is attempted only when the device is reachable and the
/// order carries a reconciled remote identifier. Otherwise the transition is
/// queued last-write-wins.
pub async fn update_status(
    ctx: &CacheContext,
    order_ref: &str,
    status: OrderStatus,
    extra: StatusExtra,
) -> Result<(), String> {
    let actor = ctx
        .session()
        .map(|s| s.staff_id)
        .unwrap_or_else(|| "system".to_string());

    let Some(mut order) = ctx
        .store
        .find_order_by_key(order_ref)
        .or_else(|| ctx.store.find_order_by_number(order_ref))
    else {
        // Not cached locally (fast-path order known only by its remote id).
        let update = PendingStatusUpdate {
            order_key: order_ref.to_string(),
            order_number: order_ref.to_string(),
            status,
            cancellation_reason: extra.cancellation_reason,
            estimated_minutes: extra.estimated_minutes,
            queued_at: Utc::now(),
        };
        if ctx.reachability.is_online() {
            match ctx.remote.update_order_status(order_ref, &update).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(
                    order_ref,
                    error = %e,
                    "Direct status update failed; queuing"
                ),
            }
        }
        ctx.store.queue_status_update(update);
        return Ok(());
    };

    let total = order.total_amount;
    let previous = order.status;
    order.status = status;
    if extra.cancellation_reason.is_some() {
        order.cancellation_reason = extra.cancellation_reason.clone();
    }
    order.updated_at = Utc::now();
    ctx.store.upsert_order(order.clone());

    let action = if status == OrderStatus::Cancelled {
        HistoryAction::Cancelled
    } else {
        HistoryAction::StatusChanged
    };
    ctx.store.append_history(history_entry(
        &order,
        action,
        &actor,
        total,
        total,
        Vec::new(),
    ));

    if previous == status {
        // Still replayed remotely so side-data (ETA, reason) lands there.
        info!(
            order_number = %order.order_number,
            status = status.as_str(),
            "Status unchanged; forwarding side-data only"
        );
    }

    let update = PendingStatusUpdate {
        order_key: order.local_id.clone(),
        order_number: order.order_number.clone(),
        status,
        cancellation_reason: extra.cancellation_reason,
        estimated_minutes: extra.estimated_minutes,
        queued_at: Utc::now(),
    };

    if ctx.reachability.is_online() {
        if let Some(remote_id) = order.remote_id.clone() {
            match ctx.remote.update_order_status(&remote_id, &update).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(
                    order_number = %order.order_number,
                    error = %e,
                    "Direct status update failed; queuing"
                ),
            }
        }
    }

    ctx.store.queue_status_update(update);
    Ok(())
}

// ---------------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------------

/// Cache one payment transaction per tender of a split payment. Replayed by
/// the sync engine under the reconciled identifier (existence-checked to
/// avoid duplicates).
pub fn record_payment_split(
    ctx: &CacheContext,
    order_ref: &str,
    tenders: &[(PaymentMethod, f64)],
) -> Result<(), String> {
    let order = ctx
        .store
        .find_order_by_key(order_ref)
        .or_else(|| ctx.store.find_order_by_number(order_ref))
        .ok_or_else(|| format!("Order not found: {order_ref}"))?;

    let actor = ctx
        .session()
        .map(|s| s.staff_id)
        .unwrap_or_else(|| "system".to_string());

    for (method, amount) in tenders {
        ctx.store.append_payment(PaymentTransaction {
            id: Uuid::new_v4().to_string(),
            order_key: order.sync_key().to_string(),
            order_number: order.order_number.clone(),
            method: *method,
            amount: *amount,
            synced: false,
            skipped: false,
            created_at: Utc::now(),
        });
    }

    ctx.store.append_history(history_entry(
        &order,
        HistoryAction::PaymentRecorded,
        &actor,
        order.total_amount,
        order.total_amount,
        Vec::new(),
    ));

    Ok(())
}

// ---------------------------------------------------------------------------
// Queries & maintenance
// ---------------------------------------------------------------------------

/// Orders still queued/offline/failed — the backlog a cashier can inspect.
pub fn offline_orders(ctx: &CacheContext) -> Vec<Order> {
    ctx.store.offline_orders()
}

/// Explicit user-initiated purge of fully-synced records older than
/// `older_than_days`.
pub fn purge_synced_orders(ctx: &CacheContext, older_than_days: i64) -> usize {
    let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
    ctx.store.purge_synced_orders(cutoff)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn history_entry(
    order: &Order,
    action: HistoryAction,
    actor: &str,
    total_before: f64,
    total_after: f64,
    item_diffs: Vec<HistoryItemDiff>,
) -> OrderHistoryEntry {
    OrderHistoryEntry {
        id: Uuid::new_v4().to_string(),
        order_key: order.sync_key().to_string(),
        order_number: order.order_number.clone(),
        action,
        actor: actor.to_string(),
        total_before,
        total_after,
        item_diffs,
        synced: false,
        skipped: false,
        created_at: Utc::now(),
    }
}

/// Item-level diff between two line sets, keyed by line name + variant.
fn compute_item_diffs(before: &[OrderLine], after: &[OrderLine]) -> Vec<HistoryItemDiff> {
    let mut quantities: HashMap<(String, Option<String>), (f64, f64)> = HashMap::new();

    for line in before {
        let entry = quantities
            .entry((line.name.clone(), line.variant_id.clone()))
            .or_insert((0.0, 0.0));
        entry.0 += line.quantity;
    }
    for line in after {
        let entry = quantities
            .entry((line.name.clone(), line.variant_id.clone()))
            .or_insert((0.0, 0.0));
        entry.1 += line.quantity;
    }

    let mut diffs: Vec<HistoryItemDiff> = quantities
        .into_iter()
        .filter(|(_, (b, a))| (b - a).abs() > f64::EPSILON)
        .map(|((name, variant), (quantity_before, quantity_after))| HistoryItemDiff {
            name,
            variant,
            quantity_before,
            quantity_after,
        })
        .collect();
    diffs.sort_by(|a, b| a.name.cmp(&b.name));
    diffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncState;
    use crate::testutil::test_context;

    fn line(name: &str, quantity: f64, unit_price: f64) -> OrderLine {
        OrderLine {
            product_id: Some(format!("prod-{name}")),
            variant_id: None,
            name: name.to_string(),
            quantity,
            unit_price,
            total_price: quantity * unit_price,
            bundle: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_create_order_requires_session() {
        let (ctx, _remote) = test_context(false);
        ctx.clear_session();
        let err = create_order(&ctx, NewOrderData::default())
            .await
            .unwrap_err();
        assert!(err.contains("session"));
    }

    #[tokio::test]
    async fn test_create_order_offline_queues_exactly_one_record() {
        let (ctx, remote) = test_context(false);

        let order = create_order(
            &ctx,
            NewOrderData {
                lines: vec![line("Burger", 2.0, 5.0)],
                subtotal: 10.0,
                total_amount: 10.0,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(order.sync_state, SyncState::Unsynced);
        assert!(order.remote_id.is_none());
        assert_eq!(order.daily_number, Some(1));
        assert_eq!(offline_orders(&ctx).len(), 1);
        assert_eq!(remote.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_create_order_online_takes_fast_path() {
        let (ctx, remote) = test_context(true);

        let order = create_order(
            &ctx,
            NewOrderData {
                lines: vec![line("Burger", 1.0, 5.0)],
                subtotal: 5.0,
                total_amount: 5.0,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(order.sync_state, SyncState::Synced);
        assert!(order.remote_id.is_some());
        // Fast-path orders are not part of the offline backlog.
        assert!(offline_orders(&ctx).is_empty());
        // Header insert + line replace.
        assert_eq!(remote.write_calls(), 2);
    }

    #[tokio::test]
    async fn test_create_order_online_failure_degrades_to_offline() {
        let (ctx, remote) = test_context(true);
        remote.set_fail_all(true);

        let order = create_order(&ctx, NewOrderData::default()).await.unwrap();
        assert_eq!(order.sync_state, SyncState::SyncFailed);
        assert!(order.last_sync_error.is_some());
        assert_eq!(offline_orders(&ctx).len(), 1);
    }

    #[tokio::test]
    async fn test_modification_replaces_lines_and_diffs_history() {
        let (ctx, _remote) = test_context(false);

        let original = create_order(
            &ctx,
            NewOrderData {
                lines: vec![line("Burger", 2.0, 5.0)],
                subtotal: 10.0,
                total_amount: 10.0,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let modified = create_order(
            &ctx,
            NewOrderData {
                lines: vec![line("Burger", 1.0, 5.0), line("Fries", 1.0, 3.0)],
                subtotal: 8.0,
                total_amount: 8.0,
                modifies: Some(original.order_number.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Same identity: replacement, not a second order.
        assert_eq!(modified.local_id, original.local_id);
        assert_eq!(modified.lines.len(), 2);
        assert!(modified.updated_at >= original.updated_at);
        assert_eq!(offline_orders(&ctx).len(), 1);

        let history = ctx.store.history_for_order(&original.local_id);
        let modified_entry = history
            .iter()
            .find(|h| h.action == HistoryAction::Modified)
            .expect("modified history entry");
        assert_eq!(modified_entry.total_before, 10.0);
        assert_eq!(modified_entry.total_after, 8.0);
        let burger_diff = modified_entry
            .item_diffs
            .iter()
            .find(|d| d.name == "Burger")
            .unwrap();
        assert_eq!(burger_diff.quantity_before, 2.0);
        assert_eq!(burger_diff.quantity_after, 1.0);
    }

    #[tokio::test]
    async fn test_update_status_on_unreconciled_order_queues_lww() {
        let (ctx, remote) = test_context(false);
        let order = create_order(&ctx, NewOrderData::default()).await.unwrap();

        update_status(
            &ctx,
            &order.local_id,
            OrderStatus::Preparing,
            StatusExtra::default(),
        )
        .await
        .unwrap();
        update_status(
            &ctx,
            &order.local_id,
            OrderStatus::Ready,
            StatusExtra::default(),
        )
        .await
        .unwrap();

        let pending = ctx.store.pending_status_updates();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, OrderStatus::Ready);
        assert_eq!(remote.write_calls(), 0);

        // Local copy is optimistically updated.
        let local = ctx.store.get_order(&order.local_id).unwrap();
        assert_eq!(local.status, OrderStatus::Ready);
    }

    #[tokio::test]
    async fn test_update_status_online_with_remote_id_applies_directly() {
        let (ctx, remote) = test_context(true);
        let order = create_order(&ctx, NewOrderData::default()).await.unwrap();
        let writes_after_create = remote.write_calls();

        update_status(
            &ctx,
            &order.local_id,
            OrderStatus::Preparing,
            StatusExtra::default(),
        )
        .await
        .unwrap();

        assert!(ctx.store.pending_status_updates().is_empty());
        assert_eq!(remote.write_calls(), writes_after_create + 1);
        let remote_id = order.remote_id.or_else(|| {
            ctx.store
                .get_order(&order.local_id)
                .and_then(|o| o.remote_id)
        });
        let state = remote.state.lock().unwrap();
        let record = state.orders.get(remote_id.as_deref().unwrap()).unwrap();
        assert_eq!(record.status, OrderStatus::Preparing);
    }

    #[tokio::test]
    async fn test_record_payment_split_caches_transactions() {
        let (ctx, _remote) = test_context(false);
        let order = create_order(
            &ctx,
            NewOrderData {
                total_amount: 20.0,
                payment_method: Some(PaymentMethod::Split),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        record_payment_split(
            &ctx,
            &order.order_number,
            &[(PaymentMethod::Cash, 12.0), (PaymentMethod::Card, 8.0)],
        )
        .unwrap();

        let payments = ctx.store.payments_for_order(&order.local_id);
        assert_eq!(payments.len(), 2);
        assert!(payments.iter().all(|p| !p.synced));
    }

    #[test]
    fn test_next_order_number_increments_and_formats() {
        let db = crate::db::open_in_memory().unwrap();
        let date_display = chrono::Local::now().format("%d%m%Y").to_string();

        let first = next_order_number(&db);
        let second = next_order_number(&db);
        assert_eq!(first, format!("ORD-{date_display}-00001"));
        assert_eq!(second, format!("ORD-{date_display}-00002"));
    }

    #[test]
    fn test_next_order_number_resets_on_date_change() {
        let db = crate::db::open_in_memory().unwrap();
        next_order_number(&db);
        next_order_number(&db);
        // Pretend the counter was last bumped yesterday.
        db.setting_set("orders", "order_counter_date", "01011999")
            .unwrap();

        let date_display = chrono::Local::now().format("%d%m%Y").to_string();
        assert_eq!(next_order_number(&db), format!("ORD-{date_display}-00001"));
    }

    #[test]
    fn test_compute_item_diffs_tracks_added_removed_changed() {
        let before = vec![line("Burger", 2.0, 5.0), line("Cola", 1.0, 2.0)];
        let after = vec![line("Burger", 1.0, 5.0), line("Fries", 1.0, 3.0)];

        let diffs = compute_item_diffs(&before, &after);
        assert_eq!(diffs.len(), 3);
        let by_name = |n: &str| diffs.iter().find(|d| d.name == n).unwrap();
        assert_eq!(by_name("Burger").quantity_after, 1.0);
        assert_eq!(by_name("Cola").quantity_after, 0.0);
        assert_eq!(by_name("Fries").quantity_before, 0.0);
    }
}
