//! Background synchronization engine.
//!
//! Drains queued local mutations (orders, status updates, history entries,
//! payment splits, loyalty redemptions, account debits) against the remote
//! store. Runs on three triggers — a fixed interval, a reachability-regained
//! edge, and an explicit request — behind a single in-flight guard: a second
//! trigger while a cycle is running is a no-op, not a queue.
//!
//! Cycle phases run strictly in order because later phases depend on the
//! identifier reconciliation performed earlier: orders first, then the
//! status-update queue, then history, then dependent side-effects. Each
//! order/entry syncs independently; one failure never blocks the rest.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::inventory;
use crate::models::{Order, OrderStatus, PaymentMethod, SyncState};
use crate::remote::AccountDebit;
use crate::CacheContext;

// ---------------------------------------------------------------------------
// Order resolution
// ---------------------------------------------------------------------------

/// Where a queued record's order currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderResolution {
    /// Reconciled: the remote identifier to write under.
    Remote(String),
    /// The order is cached locally but has not been reconciled yet; keep the
    /// record queued for a later cycle.
    AwaitingSync,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("order not resolvable by identifier or display number")]
    NotFound,
    #[error("remote lookup failed: {0}")]
    Lookup(String),
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

/// Counters for one sync cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub orders_synced: usize,
    pub status_updates_applied: usize,
    pub history_synced: usize,
    pub side_effects_applied: usize,
    pub failures: usize,
    pub orphaned: usize,
}

impl CycleStats {
    pub fn total_progress(&self) -> usize {
        self.orders_synced
            + self.status_updates_applied
            + self.history_synced
            + self.side_effects_applied
    }
}

pub struct SyncEngine {
    ctx: Arc<CacheContext>,
    in_flight: AtomicBool,
    last_sync: Mutex<Option<String>>,
    notify: Notify,
}

impl SyncEngine {
    pub fn new(ctx: Arc<CacheContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            in_flight: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    /// RFC 3339 timestamp of the last completed cycle.
    pub fn last_sync(&self) -> Option<String> {
        self.last_sync.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Request an immediate sync. No-op if a cycle is already running.
    pub fn request_sync(&self) {
        self.notify.notify_one();
    }

    /// Start the background loop. Runs until `shutdown` is cancelled.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_secs(engine.ctx.config.sync_interval_secs.max(1));
            let mut reachability = engine.ctx.reachability.subscribe();
            info!(interval_secs = interval.as_secs(), "Sync loop started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Sync loop stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                    changed = reachability.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !*reachability.borrow_and_update() {
                            continue;
                        }
                        // Coming back online: rebuild UI numbering from the
                        // remote order list before draining the queue.
                        if let Err(e) = engine.reconcile_display_numbers().await {
                            debug!(error = %e, "Display number reconciliation failed");
                        }
                    }
                    _ = engine.notify.notified() => {
                        debug!("Manual sync requested");
                    }
                }

                if !engine.ctx.reachability.is_online() {
                    // A host that never feeds connectivity events still
                    // recovers: probe the remote on the timer.
                    if !engine.ctx.reachability.probe(&engine.ctx.remote).await {
                        continue;
                    }
                }

                match engine.try_run_cycle().await {
                    Ok(Some(stats)) => {
                        if stats.total_progress() > 0 {
                            info!(
                                orders = stats.orders_synced,
                                status_updates = stats.status_updates_applied,
                                history = stats.history_synced,
                                side_effects = stats.side_effects_applied,
                                failures = stats.failures,
                                "Sync cycle complete"
                            );
                        }
                    }
                    Ok(None) => debug!("Sync already in flight; trigger ignored"),
                    Err(e) => warn!("Sync cycle failed: {e}"),
                }
            }
        });
    }

    /// Run one cycle unless another is already in flight (`Ok(None)`).
    pub async fn try_run_cycle(&self) -> Result<Option<CycleStats>, String> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }

        let result = self.run_cycle().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn run_cycle(&self) -> Result<CycleStats, String> {
        let mut stats = CycleStats::default();

        self.sync_orders(&mut stats).await;
        self.sync_status_updates(&mut stats).await;
        self.sync_history(&mut stats).await;
        self.sync_side_effects(&mut stats).await;

        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
        Ok(stats)
    }

    /// Feed the remote's recent order list (chronological) through the daily
    /// sequence allocator so local UI numbering matches what the day has
    /// already seen.
    pub async fn reconcile_display_numbers(&self) -> Result<usize, String> {
        let numbers = self.ctx.remote.fetch_recent_order_numbers().await?;
        if numbers.is_empty() {
            return Ok(0);
        }
        let mut sequence = self
            .ctx
            .sequence
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let assigned = sequence.batch_assign(&numbers);
        Ok(assigned.len())
    }

    // -----------------------------------------------------------------------
    // Phase 1: orders
    // -----------------------------------------------------------------------

    async fn sync_orders(&self, stats: &mut CycleStats) {
        let pending = self.ctx.store.orders_pending_sync();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "Syncing offline orders");

        for order in pending {
            self.ctx
                .store
                .set_order_sync_state(&order.local_id, SyncState::Syncing, None);

            match self.sync_one_order(order.clone()).await {
                Ok((remote_id, inserted)) => {
                    self.ctx.store.mark_order_synced(&order.local_id, &remote_id);
                    stats.orders_synced += 1;
                    debug!(
                        order_number = %order.order_number,
                        remote_id = %remote_id,
                        inserted,
                        "Order reconciled"
                    );

                    // An order inserted remotely already completed never hits
                    // the remote completion trigger; deduct stock here.
                    if inserted
                        && order.status == OrderStatus::Completed
                        && !order.stock_deducted
                    {
                        if let Some(synced) = self.ctx.store.get_order(&order.local_id) {
                            if let Err(e) = inventory::deduct_for_order(&self.ctx, &synced).await
                            {
                                warn!(
                                    order_number = %order.order_number,
                                    error = %e,
                                    "Fallback inventory deduction failed"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        order_number = %order.order_number,
                        error = %e,
                        "Order sync failed; leaving queued"
                    );
                    self.ctx.store.set_order_sync_state(
                        &order.local_id,
                        SyncState::SyncFailed,
                        Some(e),
                    );
                    stats.failures += 1;
                }
            }
        }
    }

    /// Drive one order through customer resolution, reference validation,
    /// the double-submission guard, header write and line replacement.
    /// Returns the remote identifier and whether the header was inserted
    /// (as opposed to updated).
    async fn sync_one_order(&self, mut order: Order) -> Result<(String, bool), String> {
        order.sync_state = SyncState::Syncing;

        // Resolve a temporary customer reference to a real remote customer,
        // creating one if needed.
        if let Some(customer) = order.customer.clone() {
            if customer.remote_id.is_none() {
                let found = match customer.phone.as_deref().filter(|p| !p.is_empty()) {
                    Some(phone) => self
                        .ctx
                        .remote
                        .find_customer_id_by_phone(phone)
                        .await
                        .map_err(|e| format!("customer lookup: {e}"))?,
                    None => None,
                };
                let remote_customer_id = match found {
                    Some(id) => id,
                    None => self
                        .ctx
                        .remote
                        .create_customer(&customer)
                        .await
                        .map_err(|e| format!("customer create: {e}"))?,
                };
                if let Some(c) = order.customer.as_mut() {
                    c.remote_id = Some(remote_customer_id);
                }
                self.ctx.store.upsert_order(order.clone());
            }
        }

        // A vanished rider must not fail the whole order; clear the
        // reference instead.
        if let Some(rider_id) = order.rider_id.clone() {
            match self.ctx.remote.rider_exists(&rider_id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        rider_id = %rider_id,
                        order_number = %order.order_number,
                        "Assigned rider no longer exists remotely; clearing reference"
                    );
                    order.rider_id = None;
                    self.ctx.store.upsert_order(order.clone());
                }
                Err(e) => return Err(format!("rider validation: {e}")),
            }
        }

        // Insert-vs-update: an order with this display number may already
        // exist remotely after a prior partial sync.
        let existing = self
            .ctx
            .remote
            .find_order_id_by_number(&order.order_number)
            .await
            .map_err(|e| format!("order lookup: {e}"))?;

        let (remote_id, inserted) = match existing.or_else(|| order.remote_id.clone()) {
            Some(id) => {
                self.ctx.remote.update_order(&id, &order).await?;
                (id, false)
            }
            None => (self.ctx.remote.insert_order(&order).await?, true),
        };

        // Delete-and-reinsert guarantees the remote line set matches local
        // state.
        self.ctx
            .remote
            .replace_order_lines(&remote_id, &order.lines)
            .await?;

        Ok((remote_id, inserted))
    }

    // -----------------------------------------------------------------------
    // Phase 2: queued status updates
    // -----------------------------------------------------------------------

    async fn sync_status_updates(&self, stats: &mut CycleStats) {
        for update in self.ctx.store.pending_status_updates() {
            match self
                .resolve_order(&update.order_key, &update.order_number)
                .await
            {
                Ok(OrderResolution::Remote(remote_id)) => {
                    match self
                        .ctx
                        .remote
                        .update_order_status(&remote_id, &update)
                        .await
                    {
                        Ok(()) => {
                            self.ctx.store.remove_status_update(&update.order_key);
                            stats.status_updates_applied += 1;
                        }
                        Err(e) => {
                            warn!(
                                order_number = %update.order_number,
                                error = %e,
                                "Status update replay failed; will retry"
                            );
                            stats.failures += 1;
                        }
                    }
                }
                Ok(OrderResolution::AwaitingSync) => {
                    debug!(
                        order_number = %update.order_number,
                        "Order not reconciled yet; status update stays queued"
                    );
                }
                Err(ResolveError::NotFound) => {
                    warn!(
                        order_number = %update.order_number,
                        "Orphaned status update discarded"
                    );
                    self.ctx.store.remove_status_update(&update.order_key);
                    stats.orphaned += 1;
                }
                Err(ResolveError::Lookup(e)) => {
                    warn!(
                        order_number = %update.order_number,
                        error = %e,
                        "Status update resolution failed; will retry"
                    );
                    stats.failures += 1;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 3: history
    // -----------------------------------------------------------------------

    async fn sync_history(&self, stats: &mut CycleStats) {
        for entry in self.ctx.store.unsynced_history() {
            match self.resolve_order(&entry.order_key, &entry.order_number).await {
                Ok(OrderResolution::Remote(remote_id)) => {
                    let remote_history_id = match self
                        .ctx
                        .remote
                        .insert_history_entry(&remote_id, &entry)
                        .await
                    {
                        Ok(id) => id,
                        Err(e) => {
                            warn!(
                                order_number = %entry.order_number,
                                error = %e,
                                "History replay failed; will retry"
                            );
                            stats.failures += 1;
                            continue;
                        }
                    };

                    if !entry.item_diffs.is_empty() {
                        if let Err(e) = self
                            .ctx
                            .remote
                            .insert_history_item_diffs(&remote_history_id, &entry.item_diffs)
                            .await
                        {
                            // Whole entry is the unit of retry.
                            warn!(
                                order_number = %entry.order_number,
                                error = %e,
                                "History item diffs failed; entry will be retried"
                            );
                            stats.failures += 1;
                            continue;
                        }
                    }

                    self.ctx.store.mark_history_synced(&entry.id);
                    stats.history_synced += 1;
                }
                Ok(OrderResolution::AwaitingSync) => {}
                Err(ResolveError::NotFound) => {
                    warn!(
                        order_number = %entry.order_number,
                        "Orphaned history entry marked done-but-skipped"
                    );
                    self.ctx.store.mark_history_skipped(&entry.id);
                    stats.orphaned += 1;
                }
                Err(ResolveError::Lookup(e)) => {
                    warn!(
                        order_number = %entry.order_number,
                        error = %e,
                        "History resolution failed; will retry"
                    );
                    stats.failures += 1;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 4: dependent side-effects
    // -----------------------------------------------------------------------

    async fn sync_side_effects(&self, stats: &mut CycleStats) {
        // Split-payment transactions, guarded by a remote existence check.
        for payment in self.ctx.store.unsynced_payments() {
            match self
                .resolve_order(&payment.order_key, &payment.order_number)
                .await
            {
                Ok(OrderResolution::Remote(remote_id)) => {
                    let exists = match self
                        .ctx
                        .remote
                        .payment_exists(&remote_id, payment.method)
                        .await
                    {
                        Ok(exists) => exists,
                        Err(e) => {
                            warn!(
                                order_number = %payment.order_number,
                                error = %e,
                                "Payment existence check failed; will retry"
                            );
                            stats.failures += 1;
                            continue;
                        }
                    };

                    if exists {
                        debug!(
                            order_number = %payment.order_number,
                            method = payment.method.as_str(),
                            "Payment already present remotely; marking synced"
                        );
                        self.ctx.store.mark_payment_synced(&payment.id);
                        continue;
                    }

                    match self.ctx.remote.insert_payment(&remote_id, &payment).await {
                        Ok(()) => {
                            self.ctx.store.mark_payment_synced(&payment.id);
                            stats.side_effects_applied += 1;
                        }
                        Err(e) => {
                            warn!(
                                order_number = %payment.order_number,
                                error = %e,
                                "Payment replay failed; will retry"
                            );
                            stats.failures += 1;
                        }
                    }
                }
                Ok(OrderResolution::AwaitingSync) => {}
                Err(ResolveError::NotFound) => {
                    warn!(
                        order_number = %payment.order_number,
                        "Orphaned payment transaction marked done-but-skipped"
                    );
                    self.ctx.store.mark_payment_skipped(&payment.id);
                    stats.orphaned += 1;
                }
                Err(ResolveError::Lookup(e)) => {
                    warn!(
                        order_number = %payment.order_number,
                        error = %e,
                        "Payment resolution failed; will retry"
                    );
                    stats.failures += 1;
                }
            }
        }

        // Loyalty redemptions and customer account debits for reconciled
        // orders.
        for order in self.ctx.store.synced_orders() {
            let Some(remote_id) = order.remote_id.clone() else {
                continue;
            };

            if order.loyalty_points_redeemed > 0.0 && !order.loyalty_synced {
                match order.customer.as_ref().and_then(|c| c.remote_id.clone()) {
                    Some(customer_id) => {
                        match self
                            .ctx
                            .remote
                            .debit_loyalty_points(
                                &customer_id,
                                order.loyalty_points_redeemed,
                                &remote_id,
                            )
                            .await
                        {
                            Ok(()) => {
                                self.ctx.store.set_loyalty_synced(&order.local_id);
                                stats.side_effects_applied += 1;
                            }
                            Err(e) => {
                                warn!(
                                    order_number = %order.order_number,
                                    error = %e,
                                    "Loyalty debit replay failed; will retry"
                                );
                                stats.failures += 1;
                            }
                        }
                    }
                    None => {
                        // Recoverable inconsistency: redemption without a
                        // resolvable customer. Bound the retry.
                        warn!(
                            order_number = %order.order_number,
                            "Loyalty redemption without resolved customer; skipping"
                        );
                        self.ctx.store.set_loyalty_synced(&order.local_id);
                        stats.orphaned += 1;
                    }
                }
            }

            if order.payment_method == Some(PaymentMethod::CustomerAccount)
                && order.account_synced_total != Some(order.total_amount)
            {
                if let Err(e) = self.replay_account_debit(&order, &remote_id).await {
                    warn!(
                        order_number = %order.order_number,
                        error = %e,
                        "Account ledger replay failed; will retry"
                    );
                    stats.failures += 1;
                } else {
                    stats.side_effects_applied += 1;
                }
            }
        }
    }

    /// Replay or correct the customer-account debit for an order: update the
    /// existing ledger row when the order was modified since the last
    /// replay, insert otherwise.
    async fn replay_account_debit(&self, order: &Order, remote_id: &str) -> Result<(), String> {
        match self.ctx.remote.find_account_debit(remote_id).await? {
            Some(debit) => {
                if (debit.amount - order.total_amount).abs() > f64::EPSILON {
                    self.ctx
                        .remote
                        .update_account_debit(&debit.id, order.total_amount)
                        .await?;
                    info!(
                        order_number = %order.order_number,
                        amount = order.total_amount,
                        "Corrected account ledger debit"
                    );
                }
            }
            None => {
                self.ctx
                    .remote
                    .insert_account_debit(&AccountDebit {
                        id: String::new(),
                        remote_order_id: remote_id.to_string(),
                        customer_id: order.customer.as_ref().and_then(|c| c.remote_id.clone()),
                        amount: order.total_amount,
                    })
                    .await?;
            }
        }
        self.ctx
            .store
            .set_account_synced_total(&order.local_id, order.total_amount);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Two-stage resolver
    // -----------------------------------------------------------------------

    /// Resolve the order a queued record belongs to.
    ///
    /// Stage one is the Local Store (by identifier, then display number);
    /// stage two asks the remote store by display number and finally treats
    /// the key itself as a candidate remote identifier. A typed `NotFound`
    /// is the signal to orphan the record instead of retrying forever.
    async fn resolve_order(
        &self,
        order_key: &str,
        order_number: &str,
    ) -> Result<OrderResolution, ResolveError> {
        let local = self
            .ctx
            .store
            .find_order_by_key(order_key)
            .or_else(|| self.ctx.store.find_order_by_number(order_number));
        if let Some(order) = local {
            return match order.remote_id {
                Some(remote_id) => Ok(OrderResolution::Remote(remote_id)),
                None => Ok(OrderResolution::AwaitingSync),
            };
        }

        if let Some(remote_id) = self
            .ctx
            .remote
            .find_order_id_by_number(order_number)
            .await
            .map_err(ResolveError::Lookup)?
        {
            return Ok(OrderResolution::Remote(remote_id));
        }

        if self
            .ctx
            .remote
            .order_exists(order_key)
            .await
            .map_err(ResolveError::Lookup)?
        {
            return Ok(OrderResolution::Remote(order_key.to_string()));
        }

        Err(ResolveError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        OrderCustomer, OrderLine, PaymentStatus, PendingStatusUpdate,
    };
    use crate::orders::{create_order, record_payment_split, update_status, NewOrderData, StatusExtra};
    use crate::testutil::test_context;

    fn line(name: &str, quantity: f64) -> OrderLine {
        OrderLine {
            product_id: Some(format!("prod-{name}")),
            variant_id: None,
            name: name.to_string(),
            quantity,
            unit_price: 4.0,
            total_price: 4.0 * quantity,
            bundle: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_offline_order_syncs_on_reconnect_and_is_idempotent() {
        let (ctx, remote) = test_context(false);
        let engine = SyncEngine::new(Arc::clone(&ctx));

        let order = create_order(
            &ctx,
            NewOrderData {
                lines: vec![line("Burger", 1.0), line("Fries", 2.0)],
                subtotal: 12.0,
                total_amount: 12.0,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(ctx.store.orders_pending_sync().len(), 1);

        // Reconnect and run a cycle.
        ctx.reachability.set_online(true);
        let stats = engine.try_run_cycle().await.unwrap().unwrap();
        assert_eq!(stats.orders_synced, 1);
        assert_eq!(stats.failures, 0);

        let synced = ctx.store.get_order(&order.local_id).unwrap();
        assert_eq!(synced.sync_state, SyncState::Synced);
        let remote_id = synced.remote_id.clone().expect("remote id assigned");
        {
            let state = remote.state.lock().unwrap();
            assert!(state.orders.contains_key(&remote_id));
            assert_eq!(state.order_lines[&remote_id].len(), 2);
        }

        // A second cycle performs zero additional remote writes.
        let writes_after_first = remote.write_calls();
        let stats = engine.try_run_cycle().await.unwrap().unwrap();
        assert_eq!(stats.total_progress(), 0);
        assert_eq!(remote.write_calls(), writes_after_first);
        // Still exactly one local record for the order.
        assert_eq!(
            ctx.store
                .offline_orders()
                .iter()
                .filter(|o| o.local_id == order.local_id)
                .count(),
            0
        );
        assert!(ctx.store.get_order(&order.local_id).is_some());
    }

    #[tokio::test]
    async fn test_double_submission_guard_updates_instead_of_inserting() {
        let (ctx, remote) = test_context(false);
        let engine = SyncEngine::new(Arc::clone(&ctx));

        let order = create_order(&ctx, NewOrderData::default()).await.unwrap();

        // Simulate a prior partial sync: the order header already landed
        // remotely but the local store never heard back.
        {
            let mut state = remote.state.lock().unwrap();
            state.orders.insert(
                "remote-preexisting".into(),
                crate::remote::mock::RemoteOrderRecord {
                    order_number: order.order_number.clone(),
                    status: order.status,
                    rider_id: None,
                    customer_id: None,
                },
            );
        }

        ctx.reachability.set_online(true);
        engine.try_run_cycle().await.unwrap().unwrap();

        let synced = ctx.store.get_order(&order.local_id).unwrap();
        assert_eq!(synced.remote_id.as_deref(), Some("remote-preexisting"));
        // No duplicate row was created.
        assert_eq!(remote.state.lock().unwrap().orders.len(), 1);
    }

    #[tokio::test]
    async fn test_last_write_wins_status_replay() {
        let (ctx, remote) = test_context(false);
        let engine = SyncEngine::new(Arc::clone(&ctx));

        let order = create_order(&ctx, NewOrderData::default()).await.unwrap();
        update_status(&ctx, &order.local_id, OrderStatus::Preparing, StatusExtra::default())
            .await
            .unwrap();
        update_status(&ctx, &order.local_id, OrderStatus::Ready, StatusExtra::default())
            .await
            .unwrap();

        ctx.reachability.set_online(true);
        engine.try_run_cycle().await.unwrap().unwrap();

        let state = remote.state.lock().unwrap();
        let applied: Vec<OrderStatus> = state
            .applied_status_updates
            .iter()
            .map(|(_, status)| *status)
            .collect();
        // Preparing was superseded before replay; only Ready is ever applied.
        assert_eq!(applied, vec![OrderStatus::Ready]);
        assert!(ctx.store.pending_status_updates().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_rider_is_nulled_not_failed() {
        let (ctx, remote) = test_context(false);
        let engine = SyncEngine::new(Arc::clone(&ctx));

        let order = create_order(
            &ctx,
            NewOrderData {
                rider_id: Some("rider-deleted".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        ctx.reachability.set_online(true);
        let stats = engine.try_run_cycle().await.unwrap().unwrap();
        assert_eq!(stats.orders_synced, 1);
        assert_eq!(stats.failures, 0);

        let synced = ctx.store.get_order(&order.local_id).unwrap();
        assert_eq!(synced.sync_state, SyncState::Synced);
        let state = remote.state.lock().unwrap();
        let record = &state.orders[synced.remote_id.as_deref().unwrap()];
        assert!(record.rider_id.is_none());
    }

    #[tokio::test]
    async fn test_temporary_customer_is_resolved_or_created() {
        let (ctx, remote) = test_context(false);
        let engine = SyncEngine::new(Arc::clone(&ctx));

        create_order(
            &ctx,
            NewOrderData {
                customer: Some(OrderCustomer {
                    remote_id: None,
                    name: Some("Ada".into()),
                    phone: Some("+4912345".into()),
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        ctx.reachability.set_online(true);
        engine.try_run_cycle().await.unwrap().unwrap();

        let state = remote.state.lock().unwrap();
        assert_eq!(state.customers.len(), 1);
        let record = state.orders.values().next().unwrap();
        assert!(record.customer_id.is_some());
    }

    #[tokio::test]
    async fn test_payment_transactions_replay_under_remote_identifier() {
        let (ctx, remote) = test_context(false);
        let engine = SyncEngine::new(Arc::clone(&ctx));

        let order = create_order(
            &ctx,
            NewOrderData {
                total_amount: 20.0,
                payment_method: Some(PaymentMethod::Split),
                payment_status: PaymentStatus::Paid,
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

        ctx.reachability.set_online(true);
        engine.try_run_cycle().await.unwrap().unwrap();

        let synced = ctx.store.get_order(&order.local_id).unwrap();
        let remote_id = synced.remote_id.clone().unwrap();

        // Reconciliation re-keyed the cached transactions; none were lost.
        let migrated = ctx.store.payments_for_order(&remote_id);
        assert_eq!(migrated.len(), 2);
        assert!(migrated.iter().all(|p| p.synced));
        assert!(ctx.store.payments_for_order(&order.local_id).is_empty());

        {
            let state = remote.state.lock().unwrap();
            assert_eq!(state.payments[&remote_id].len(), 2);
        }

        // Replaying a second cycle does not duplicate remote rows.
        engine.try_run_cycle().await.unwrap().unwrap();
        let state = remote.state.lock().unwrap();
        assert_eq!(state.payments[&remote_id].len(), 2);
    }

    #[tokio::test]
    async fn test_history_replays_with_item_diffs_and_orphans_are_skipped() {
        let (ctx, remote) = test_context(false);
        let engine = SyncEngine::new(Arc::clone(&ctx));

        let order = create_order(
            &ctx,
            NewOrderData {
                lines: vec![line("Burger", 2.0)],
                total_amount: 8.0,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        // Modify to generate an entry with item diffs.
        create_order(
            &ctx,
            NewOrderData {
                lines: vec![line("Burger", 1.0)],
                total_amount: 4.0,
                modifies: Some(order.order_number.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // An orphan entry pointing at an order nobody knows.
        ctx.store.append_history(crate::models::OrderHistoryEntry {
            id: "orphan-1".into(),
            order_key: "ghost-key".into(),
            order_number: "ORD-GHOST".into(),
            action: crate::models::HistoryAction::StatusChanged,
            actor: "staff-1".into(),
            total_before: 0.0,
            total_after: 0.0,
            item_diffs: vec![],
            synced: false,
            skipped: false,
            created_at: Utc::now(),
        });

        ctx.reachability.set_online(true);
        let stats = engine.try_run_cycle().await.unwrap().unwrap();
        assert_eq!(stats.history_synced, 2);
        assert_eq!(stats.orphaned, 1);

        {
            let state = remote.state.lock().unwrap();
            assert_eq!(state.history.len(), 2);
            // The Modified entry carried its item-level diff sub-records.
            assert_eq!(state.item_diffs.len(), 1);
        }

        // The orphan is done-but-skipped, not retried.
        assert!(ctx.store.unsynced_history().is_empty());
        let orphan = ctx
            .store
            .history_for_order("ghost-key")
            .into_iter()
            .next()
            .unwrap();
        assert!(orphan.skipped && !orphan.synced);
    }

    #[tokio::test]
    async fn test_orphaned_status_update_is_discarded() {
        let (ctx, _remote) = test_context(true);
        let engine = SyncEngine::new(Arc::clone(&ctx));

        ctx.store.queue_status_update(PendingStatusUpdate {
            order_key: "ghost-key".into(),
            order_number: "ORD-GHOST".into(),
            status: OrderStatus::Ready,
            cancellation_reason: None,
            estimated_minutes: None,
            queued_at: Utc::now(),
        });

        let stats = engine.try_run_cycle().await.unwrap().unwrap();
        assert_eq!(stats.orphaned, 1);
        assert!(ctx.store.pending_status_updates().is_empty());
    }

    #[tokio::test]
    async fn test_status_update_for_unreconciled_order_stays_queued() {
        let (ctx, remote) = test_context(false);
        let engine = SyncEngine::new(Arc::clone(&ctx));

        let order = create_order(&ctx, NewOrderData::default()).await.unwrap();
        update_status(&ctx, &order.local_id, OrderStatus::Preparing, StatusExtra::default())
            .await
            .unwrap();

        // Make phase 1 fail so the order never reconciles this cycle.
        remote.set_fail_all(true);
        ctx.reachability.set_online(true);
        let stats = engine.try_run_cycle().await.unwrap().unwrap();
        assert!(stats.failures > 0);

        // The update is neither applied nor orphaned.
        assert_eq!(ctx.store.pending_status_updates().len(), 1);
    }

    #[tokio::test]
    async fn test_loyalty_and_account_side_effects_replay_once() {
        let (ctx, remote) = test_context(false);
        let engine = SyncEngine::new(Arc::clone(&ctx));

        let order = create_order(
            &ctx,
            NewOrderData {
                total_amount: 30.0,
                payment_method: Some(PaymentMethod::CustomerAccount),
                loyalty_points_redeemed: 50.0,
                customer: Some(OrderCustomer {
                    remote_id: None,
                    name: Some("Ada".into()),
                    phone: Some("+4912345".into()),
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        ctx.reachability.set_online(true);
        engine.try_run_cycle().await.unwrap().unwrap();

        {
            let state = remote.state.lock().unwrap();
            assert_eq!(state.loyalty_debits.len(), 1);
            assert_eq!(state.account_debits.len(), 1);
            assert!((state.account_debits[0].amount - 30.0).abs() < 1e-9);
        }

        // Second cycle: nothing new.
        engine.try_run_cycle().await.unwrap().unwrap();
        {
            let state = remote.state.lock().unwrap();
            assert_eq!(state.loyalty_debits.len(), 1);
            assert_eq!(state.account_debits.len(), 1);
        }

        // A modification changes the total; the debit is corrected, not
        // duplicated.
        create_order(
            &ctx,
            NewOrderData {
                total_amount: 25.0,
                payment_method: Some(PaymentMethod::CustomerAccount),
                modifies: Some(order.order_number.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        engine.try_run_cycle().await.unwrap().unwrap();

        let state = remote.state.lock().unwrap();
        assert_eq!(state.account_debits.len(), 1);
        assert!((state.account_debits[0].amount - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_offline_completed_order_gets_fallback_deduction() {
        let (ctx, remote) = test_context(false);
        let engine = SyncEngine::new(Arc::clone(&ctx));

        ctx.store.replace_catalog(vec![crate::models::CatalogProduct {
            id: "prod-Burger".into(),
            name: "Burger".into(),
            recipe: vec![crate::models::RecipeLine {
                inventory_item_id: "inv-patty".into(),
                quantity: 150.0,
                unit: "g".into(),
            }],
            variants: vec![],
        }]);
        ctx.store.replace_inventory(vec![crate::models::InventoryItem {
            id: "inv-patty".into(),
            name: "Patty".into(),
            unit: "kg".into(),
            current_stock: 1.0,
            avg_unit_cost: 2.0,
            updated_at: Utc::now(),
        }]);
        {
            let mut state = remote.state.lock().unwrap();
            state.inventory.insert(
                "inv-patty".into(),
                crate::models::InventoryItem {
                    id: "inv-patty".into(),
                    name: "Patty".into(),
                    unit: "kg".into(),
                    current_stock: 1.0,
                    avg_unit_cost: 2.0,
                    updated_at: Utc::now(),
                },
            );
        }

        // Created offline, completed offline, synced post-completion.
        let order = create_order(
            &ctx,
            NewOrderData {
                lines: vec![line("Burger", 2.0)],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        update_status(&ctx, &order.local_id, OrderStatus::Completed, StatusExtra::default())
            .await
            .unwrap();

        ctx.reachability.set_online(true);
        engine.try_run_cycle().await.unwrap().unwrap();

        let synced = ctx.store.get_order(&order.local_id).unwrap();
        assert!(synced.stock_deducted);
        let state = remote.state.lock().unwrap();
        assert!((state.inventory["inv-patty"].current_stock - 0.7).abs() < 1e-9);
        assert_eq!(state.stock_ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_guard_makes_second_trigger_a_noop() {
        let (ctx, _remote) = test_context(true);
        let engine = SyncEngine::new(Arc::clone(&ctx));

        engine.in_flight.store(true, Ordering::SeqCst);
        assert!(engine.try_run_cycle().await.unwrap().is_none());

        engine.in_flight.store(false, Ordering::SeqCst);
        assert!(engine.try_run_cycle().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reconcile_display_numbers_replays_remote_day() {
        let (ctx, remote) = test_context(true);
        let engine = SyncEngine::new(Arc::clone(&ctx));

        {
            let mut state = remote.state.lock().unwrap();
            state.recent_order_numbers =
                vec!["ORD-A".to_string(), "ORD-B".to_string(), "ORD-C".to_string()];
        }

        assert_eq!(engine.reconcile_display_numbers().await.unwrap(), 3);
        let sequence = ctx.sequence.lock().unwrap();
        assert_eq!(sequence.get("ORD-A"), Some(1));
        assert_eq!(sequence.get("ORD-C"), Some(3));
    }
}
