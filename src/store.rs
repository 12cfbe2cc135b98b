//! Local Store: the in-process snapshot of all domain entities.
//!
//! Mutations are synchronous in-memory, then a best-effort flush of the
//! affected slot is scheduled on a background task. The in-memory copy stays
//! authoritative for the process lifetime, so a failed flush is logged and
//! never propagated. After each durable flush a [`StoreEvent`] is emitted;
//! the backup task consumes it and mirrors the slot blob into a secondary
//! database so a fresh install (or a storage-location migration) can recover
//! the cache.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::db::SlotDb;
use crate::models::{
    CatalogProduct, InventoryItem, Order, OrderHistoryEntry, PaymentTransaction,
    PendingStatusUpdate, SyncState,
};

/// Compression level for slot blobs.
const SLOT_COMPRESSION_LEVEL: i32 = 3;

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// Logical caches, each persisted as one serialized blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Orders,
    StatusUpdates,
    History,
    Payments,
    Inventory,
    Catalog,
}

impl Slot {
    pub const ALL: [Slot; 6] = [
        Slot::Orders,
        Slot::StatusUpdates,
        Slot::History,
        Slot::Payments,
        Slot::Inventory,
        Slot::Catalog,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Slot::Orders => "orders",
            Slot::StatusUpdates => "status_updates",
            Slot::History => "order_history",
            Slot::Payments => "payment_transactions",
            Slot::Inventory => "inventory_items",
            Slot::Catalog => "catalog",
        }
    }
}

/// Notification emitted after a successful durable flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    SlotFlushed(Slot),
}

// ---------------------------------------------------------------------------
// Store state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    orders: HashMap<String, Order>,
    status_updates: HashMap<String, PendingStatusUpdate>,
    history: Vec<OrderHistoryEntry>,
    payments: Vec<PaymentTransaction>,
    inventory: HashMap<String, InventoryItem>,
    catalog: Vec<CatalogProduct>,
}

pub struct LocalStore {
    inner: Mutex<StoreInner>,
    db: Arc<SlotDb>,
    backup: Option<Arc<SlotDb>>,
    flush_tx: mpsc::UnboundedSender<Slot>,
    flush_rx: Mutex<Option<mpsc::UnboundedReceiver<Slot>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl LocalStore {
    /// Load the store from durable storage.
    ///
    /// Each slot is restored from the primary database; a slot missing there
    /// but present in the backup database is recovered once (copied back to
    /// the primary) before loading.
    pub fn open(db: Arc<SlotDb>, backup: Option<Arc<SlotDb>>) -> Result<Arc<Self>, String> {
        let mut inner = StoreInner::default();

        for slot in Slot::ALL {
            let mut blob = db.read_slot(slot.key())?;
            if blob.is_none() {
                if let Some(backup_db) = backup.as_deref() {
                    if let Some(recovered) = backup_db.read_slot(slot.key())? {
                        info!(slot = slot.key(), "Recovering cache slot from backup");
                        db.write_slot(slot.key(), &recovered)?;
                        blob = Some(recovered);
                    }
                }
            }
            if let Some(bytes) = blob {
                if let Err(e) = restore_slot(&mut inner, slot, &bytes) {
                    // A damaged slot must not take the whole cache down.
                    warn!(slot = slot.key(), error = %e, "Discarding unreadable cache slot");
                }
            }
        }

        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);

        Ok(Arc::new(Self {
            inner: Mutex::new(inner),
            db,
            backup,
            flush_tx,
            flush_rx: Mutex::new(Some(flush_rx)),
            events,
        }))
    }

    /// Spawn the flusher and backup tasks. Must run inside a tokio runtime;
    /// callers that only want synchronous flushing (tests) can skip this and
    /// call [`LocalStore::flush_slot`] directly.
    pub fn start_persistence(self: &Arc<Self>) {
        let rx = self
            .flush_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut rx) = rx else {
            warn!("Store persistence already started");
            return;
        };

        let store = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(slot) = rx.recv().await {
                if let Err(e) = store.flush_slot(slot) {
                    warn!(slot = slot.key(), error = %e, "Cache slot flush failed; in-memory copy remains authoritative");
                }
            }
        });

        if let Some(backup_db) = self.backup.clone() {
            let store = Arc::clone(self);
            let mut events = self.events.subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(StoreEvent::SlotFlushed(slot)) => {
                            let blob = match store.db.read_slot(slot.key()) {
                                Ok(Some(bytes)) => bytes,
                                Ok(None) => continue,
                                Err(e) => {
                                    warn!(slot = slot.key(), error = %e, "Backup read failed");
                                    continue;
                                }
                            };
                            if let Err(e) = backup_db.write_slot(slot.key(), &blob) {
                                warn!(slot = slot.key(), error = %e, "Backup write failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(missed, "Backup task lagged behind flush events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
    }

    /// Subscribe to flush notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an asynchronous best-effort flush for `slot`.
    fn schedule_flush(&self, slot: Slot) {
        let _ = self.flush_tx.send(slot);
    }

    /// Serialize and durably write one slot, then notify listeners.
    pub fn flush_slot(&self, slot: Slot) -> Result<(), String> {
        let bytes = self.serialize_slot(slot)?;
        self.db.write_slot(slot.key(), &bytes)?;
        let _ = self.events.send(StoreEvent::SlotFlushed(slot));
        Ok(())
    }

    /// Flush every slot. Used on shutdown and by the purge operation.
    pub fn flush_all(&self) -> Result<(), String> {
        for slot in Slot::ALL {
            self.flush_slot(slot)?;
        }
        Ok(())
    }

    fn serialize_slot(&self, slot: Slot) -> Result<Vec<u8>, String> {
        let inner = self.lock();
        let json = match slot {
            Slot::Orders => serde_json::to_vec(&inner.orders),
            Slot::StatusUpdates => serde_json::to_vec(&inner.status_updates),
            Slot::History => serde_json::to_vec(&inner.history),
            Slot::Payments => serde_json::to_vec(&inner.payments),
            Slot::Inventory => serde_json::to_vec(&inner.inventory),
            Slot::Catalog => serde_json::to_vec(&inner.catalog),
        }
        .map_err(|e| format!("serialize slot {}: {e}", slot.key()))?;
        drop(inner);

        zstd::encode_all(json.as_slice(), SLOT_COMPRESSION_LEVEL)
            .map_err(|e| format!("compress slot {}: {e}", slot.key()))
    }

    // -----------------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------------

    pub fn upsert_order(&self, order: Order) {
        self.lock().orders.insert(order.local_id.clone(), order);
        self.schedule_flush(Slot::Orders);
    }

    pub fn get_order(&self, local_id: &str) -> Option<Order> {
        self.lock().orders.get(local_id).cloned()
    }

    /// Look an order up by local identifier or remote identifier.
    pub fn find_order_by_key(&self, key: &str) -> Option<Order> {
        let inner = self.lock();
        if let Some(order) = inner.orders.get(key) {
            return Some(order.clone());
        }
        inner
            .orders
            .values()
            .find(|o| o.remote_id.as_deref() == Some(key))
            .cloned()
    }

    pub fn find_order_by_number(&self, order_number: &str) -> Option<Order> {
        self.lock()
            .orders
            .values()
            .find(|o| o.order_number == order_number)
            .cloned()
    }

    /// Orders waiting for reconciliation, oldest first.
    pub fn orders_pending_sync(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .lock()
            .orders
            .values()
            .filter(|o| o.needs_sync())
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        orders
    }

    /// Everything not yet fully reconciled — the user-visible backlog.
    pub fn offline_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .lock()
            .orders
            .values()
            .filter(|o| o.sync_state != SyncState::Synced)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        orders
    }

    /// Reconciled orders still held locally, oldest first. Source for the
    /// dependent-side-effect replay phase.
    pub fn synced_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .lock()
            .orders
            .values()
            .filter(|o| o.sync_state == SyncState::Synced)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        orders
    }

    pub fn set_order_sync_state(&self, local_id: &str, state: SyncState, error: Option<String>) {
        {
            let mut inner = self.lock();
            if let Some(order) = inner.orders.get_mut(local_id) {
                order.sync_state = state;
                order.last_sync_error = error;
            }
        }
        self.schedule_flush(Slot::Orders);
    }

    /// Record a successful reconciliation: assign the remote identifier
    /// (at most once), mark the order synced, and re-key all dependent
    /// payment and history records from the local to the remote identifier.
    pub fn mark_order_synced(&self, local_id: &str, remote_id: &str) {
        {
            let mut inner = self.lock();
            let Some(order) = inner.orders.get_mut(local_id) else {
                warn!(local_id, "mark_order_synced: order vanished from store");
                return;
            };
            match order.remote_id.as_deref() {
                None => order.remote_id = Some(remote_id.to_string()),
                Some(existing) if existing != remote_id => {
                    warn!(
                        local_id,
                        existing, remote_id, "Refusing to reassign remote identifier"
                    );
                }
                _ => {}
            }
            order.sync_state = SyncState::Synced;
            order.last_sync_error = None;

            let new_key = order.remote_id.clone().unwrap_or_else(|| remote_id.to_string());
            for payment in inner.payments.iter_mut() {
                if payment.order_key == local_id {
                    payment.order_key = new_key.clone();
                }
            }
            for entry in inner.history.iter_mut() {
                if entry.order_key == local_id {
                    entry.order_key = new_key.clone();
                }
            }
        }
        self.schedule_flush(Slot::Orders);
        self.schedule_flush(Slot::Payments);
        self.schedule_flush(Slot::History);
    }

    pub fn set_stock_deducted(&self, local_id: &str) {
        {
            let mut inner = self.lock();
            if let Some(order) = inner.orders.get_mut(local_id) {
                order.stock_deducted = true;
            }
        }
        self.schedule_flush(Slot::Orders);
    }

    pub fn set_loyalty_synced(&self, local_id: &str) {
        {
            let mut inner = self.lock();
            if let Some(order) = inner.orders.get_mut(local_id) {
                order.loyalty_synced = true;
            }
        }
        self.schedule_flush(Slot::Orders);
    }

    pub fn set_account_synced_total(&self, local_id: &str, total: f64) {
        {
            let mut inner = self.lock();
            if let Some(order) = inner.orders.get_mut(local_id) {
                order.account_synced_total = Some(total);
            }
        }
        self.schedule_flush(Slot::Orders);
    }

    // -----------------------------------------------------------------------
    // Pending status updates
    // -----------------------------------------------------------------------

    /// Queue a status transition. A newer update for the same order replaces
    /// the older one (last-write-wins).
    pub fn queue_status_update(&self, update: PendingStatusUpdate) {
        {
            let mut inner = self.lock();
            if let Some(previous) = inner
                .status_updates
                .insert(update.order_key.clone(), update)
            {
                debug!(
                    order_key = %previous.order_key,
                    superseded = previous.status.as_str(),
                    "Pending status update superseded"
                );
            }
        }
        self.schedule_flush(Slot::StatusUpdates);
    }

    /// Queued updates in the order they were queued.
    pub fn pending_status_updates(&self) -> Vec<PendingStatusUpdate> {
        let mut updates: Vec<PendingStatusUpdate> =
            self.lock().status_updates.values().cloned().collect();
        updates.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        updates
    }

    pub fn remove_status_update(&self, order_key: &str) {
        self.lock().status_updates.remove(order_key);
        self.schedule_flush(Slot::StatusUpdates);
    }

    // -----------------------------------------------------------------------
    // Order history
    // -----------------------------------------------------------------------

    pub fn append_history(&self, entry: OrderHistoryEntry) {
        self.lock().history.push(entry);
        self.schedule_flush(Slot::History);
    }

    pub fn unsynced_history(&self) -> Vec<OrderHistoryEntry> {
        let mut entries: Vec<OrderHistoryEntry> = self
            .lock()
            .history
            .iter()
            .filter(|e| !e.synced && !e.skipped)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }

    pub fn history_for_order(&self, order_key: &str) -> Vec<OrderHistoryEntry> {
        self.lock()
            .history
            .iter()
            .filter(|e| e.order_key == order_key)
            .cloned()
            .collect()
    }

    pub fn mark_history_synced(&self, id: &str) {
        {
            let mut inner = self.lock();
            if let Some(entry) = inner.history.iter_mut().find(|e| e.id == id) {
                entry.synced = true;
            }
        }
        self.schedule_flush(Slot::History);
    }

    /// Done-but-skipped: the entry's order is unresolvable and the entry
    /// will not be retried.
    pub fn mark_history_skipped(&self, id: &str) {
        {
            let mut inner = self.lock();
            if let Some(entry) = inner.history.iter_mut().find(|e| e.id == id) {
                entry.skipped = true;
            }
        }
        self.schedule_flush(Slot::History);
    }

    // -----------------------------------------------------------------------
    // Payment transactions
    // -----------------------------------------------------------------------

    pub fn append_payment(&self, payment: PaymentTransaction) {
        self.lock().payments.push(payment);
        self.schedule_flush(Slot::Payments);
    }

    pub fn unsynced_payments(&self) -> Vec<PaymentTransaction> {
        let mut payments: Vec<PaymentTransaction> = self
            .lock()
            .payments
            .iter()
            .filter(|p| !p.synced && !p.skipped)
            .cloned()
            .collect();
        payments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        payments
    }

    pub fn payments_for_order(&self, order_key: &str) -> Vec<PaymentTransaction> {
        self.lock()
            .payments
            .iter()
            .filter(|p| p.order_key == order_key)
            .cloned()
            .collect()
    }

    pub fn mark_payment_synced(&self, id: &str) {
        {
            let mut inner = self.lock();
            if let Some(payment) = inner.payments.iter_mut().find(|p| p.id == id) {
                payment.synced = true;
            }
        }
        self.schedule_flush(Slot::Payments);
    }

    pub fn mark_payment_skipped(&self, id: &str) {
        {
            let mut inner = self.lock();
            if let Some(payment) = inner.payments.iter_mut().find(|p| p.id == id) {
                payment.skipped = true;
            }
        }
        self.schedule_flush(Slot::Payments);
    }

    // -----------------------------------------------------------------------
    // Inventory & catalog caches
    // -----------------------------------------------------------------------

    pub fn replace_inventory(&self, items: Vec<InventoryItem>) {
        {
            let mut inner = self.lock();
            inner.inventory = items.into_iter().map(|i| (i.id.clone(), i)).collect();
        }
        self.schedule_flush(Slot::Inventory);
    }

    pub fn get_inventory_item(&self, id: &str) -> Option<InventoryItem> {
        self.lock().inventory.get(id).cloned()
    }

    pub fn upsert_inventory_item(&self, item: InventoryItem) {
        self.lock().inventory.insert(item.id.clone(), item);
        self.schedule_flush(Slot::Inventory);
    }

    pub fn replace_catalog(&self, products: Vec<CatalogProduct>) {
        self.lock().catalog = products;
        self.schedule_flush(Slot::Catalog);
    }

    pub fn catalog(&self) -> Vec<CatalogProduct> {
        self.lock().catalog.clone()
    }

    // -----------------------------------------------------------------------
    // Purge
    // -----------------------------------------------------------------------

    /// Explicit user-initiated purge of fully-synced records older than the
    /// cutoff, together with their synced child records and any skipped
    /// orphan entries past the cutoff. The only destruction path.
    pub fn purge_synced_orders(&self, cutoff: DateTime<Utc>) -> usize {
        let removed = {
            let mut inner = self.lock();
            let purgeable: Vec<String> = inner
                .orders
                .values()
                .filter(|o| o.sync_state == SyncState::Synced && o.updated_at < cutoff)
                .map(|o| o.local_id.clone())
                .collect();

            let mut purged_keys: Vec<String> = Vec::new();
            for local_id in &purgeable {
                if let Some(order) = inner.orders.remove(local_id) {
                    purged_keys.push(order.local_id.clone());
                    if let Some(remote_id) = order.remote_id {
                        purged_keys.push(remote_id);
                    }
                    inner.status_updates.remove(local_id);
                }
            }

            inner.history.retain(|e| {
                let settled = e.synced || e.skipped;
                let belongs_to_purged = purged_keys.iter().any(|k| *k == e.order_key);
                let stale_orphan = e.skipped && e.created_at < cutoff;
                !((settled && belongs_to_purged) || stale_orphan)
            });
            inner.payments.retain(|p| {
                let settled = p.synced || p.skipped;
                let belongs_to_purged = purged_keys.iter().any(|k| *k == p.order_key);
                let stale_orphan = p.skipped && p.created_at < cutoff;
                !((settled && belongs_to_purged) || stale_orphan)
            });

            purgeable.len()
        };

        if removed > 0 {
            info!(removed, "Purged fully-synced orders from local cache");
            self.schedule_flush(Slot::Orders);
            self.schedule_flush(Slot::StatusUpdates);
            self.schedule_flush(Slot::History);
            self.schedule_flush(Slot::Payments);
        }
        removed
    }
}

fn restore_slot(inner: &mut StoreInner, slot: Slot, bytes: &[u8]) -> Result<(), String> {
    let json =
        zstd::decode_all(bytes).map_err(|e| format!("decompress slot {}: {e}", slot.key()))?;
    match slot {
        Slot::Orders => inner.orders = serde_json::from_slice(&json).map_err(|e| e.to_string())?,
        Slot::StatusUpdates => {
            inner.status_updates = serde_json::from_slice(&json).map_err(|e| e.to_string())?
        }
        Slot::History => {
            inner.history = serde_json::from_slice(&json).map_err(|e| e.to_string())?
        }
        Slot::Payments => {
            inner.payments = serde_json::from_slice(&json).map_err(|e| e.to_string())?
        }
        Slot::Inventory => {
            inner.inventory = serde_json::from_slice(&json).map_err(|e| e.to_string())?
        }
        Slot::Catalog => {
            inner.catalog = serde_json::from_slice(&json).map_err(|e| e.to_string())?
        }
    }
    Ok(())
}
