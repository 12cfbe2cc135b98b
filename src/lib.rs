//! Tillsync — offline-first order cache and sync engine for POS terminals.
//!
//! Keeps a cashier terminal taking orders, changing status and recording
//! payments while the network is down, then reconciles every locally-created
//! record with the remote transactional store once connectivity returns:
//! local identifiers are rewritten to server-assigned ones, dependent writes
//! are replayed in dependency order, and inventory is deducted exactly once.
//!
//! Everything hangs off one [`CacheContext`] constructed at process start and
//! passed by reference — there is no global cache singleton.

use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;
pub mod db;
pub mod inventory;
pub mod models;
pub mod orders;
pub mod reachability;
pub mod remote;
pub mod sequence;
pub mod store;
pub mod sync;
pub mod units;

pub use config::{SessionContext, TerminalConfig};
pub use reachability::Reachability;
pub use remote::{HttpRemoteStore, RemoteStore};
pub use store::LocalStore;
pub use sync::SyncEngine;

use db::SlotDb;
use sequence::DailySequence;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// The per-terminal composition root: configuration, local store, remote
/// store client, reachability flag, daily sequence allocator and the bound
/// operator session. One instance per running terminal, injected into every
/// component.
pub struct CacheContext {
    pub config: TerminalConfig,
    pub db: Arc<SlotDb>,
    pub store: Arc<LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub reachability: Reachability,
    pub sequence: Mutex<DailySequence>,
    session: Mutex<Option<SessionContext>>,
}

impl CacheContext {
    pub fn new(
        config: TerminalConfig,
        db: Arc<SlotDb>,
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            store,
            remote,
            reachability: Reachability::new(false),
            sequence: Mutex::new(DailySequence::new()),
            session: Mutex::new(None),
        })
    }

    /// Open the durable databases, restore the local store (recovering from
    /// the backup database if the primary is empty) and wire up the HTTP
    /// remote client.
    pub fn bootstrap(config: TerminalConfig) -> Result<Arc<Self>, String> {
        let db = Arc::new(db::open(&config.data_dir, &config.cache_file)?);
        let backup = match db::open(&config.data_dir, &config.backup_file) {
            Ok(backup) => Some(Arc::new(backup)),
            Err(e) => {
                warn!(error = %e, "Backup database unavailable; continuing without backup");
                None
            }
        };
        let store = LocalStore::open(Arc::clone(&db), backup)?;
        let remote: Arc<dyn RemoteStore> = Arc::new(HttpRemoteStore::new(&config)?);

        info!(
            terminal_id = %config.terminal_id,
            branch_id = %config.branch_id,
            "Cache context ready"
        );
        Ok(Self::new(config, db, store, remote))
    }

    /// Bind the operator session for the current shift.
    pub fn bind_session(&self, session: SessionContext) {
        info!(staff_id = %session.staff_id, "Operator session bound");
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
    }

    pub fn clear_session(&self) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn session(&self) -> Option<SessionContext> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Initialize structured logging (console + non-blocking daily-rolling file).
///
/// Call once at process start; subsequent calls would panic on re-init.
pub fn init_logging(log_dir: &Path) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tillsync=debug"));

    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "tillsync");
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

    // Keep the guard alive for the lifetime of the process — dropping it
    // flushes and closes the file writer.
    std::mem::forget(guard);

    info!("Tillsync v{} logging initialized", env!("CARGO_PKG_VERSION"));
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------
