//! Connection Manager (spec.md §4.10) — the single event loop that drives
//! the IDL: registers the schema's tables at start, commits pending
//! transactions every tick, and fans `changes`/`established` callbacks out
//! once the replica advances.
//!
//! Grounded on `crates/client-api/src/routes/subscribe.rs` for the
//! `tokio::spawn`-a-background-loop shape, and on `src/idl.rs`'s own
//! `CommitResult`/`Transaction` design (this is the IDL's only driver).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::idl::{CommitResult, MemoryIdl, Transaction};
use crate::schema::Schema;

type ChangesCallback = Box<dyn Fn(&Schema, &MemoryIdl) + Send + Sync>;
type EstablishedCallback = Box<dyn Fn() + Send + Sync>;

/// Tuning knobs for the tick/retry cadence. Real deployments would read
/// these from `Config`; tests construct a `ConnectionManager` directly with
/// whatever cadence suits them.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionManagerConfig {
    pub tick_interval: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            reconnect_backoff: Duration::from_secs(3),
        }
    }
}

pub struct ConnectionManager {
    schema: Arc<Schema>,
    idl: Arc<MemoryIdl>,
    config: ConnectionManagerConfig,
    pending: RwLock<Vec<Arc<Transaction>>>,
    changes_callbacks: RwLock<Vec<ChangesCallback>>,
    established_callbacks: RwLock<Vec<EstablishedCallback>>,
    established: AtomicBool,
    curr_seqno: AtomicU64,
}

impl ConnectionManager {
    pub fn new(schema: Arc<Schema>, idl: Arc<MemoryIdl>, config: ConnectionManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            schema,
            idl,
            config,
            pending: RwLock::new(Vec::new()),
            changes_callbacks: RwLock::new(Vec::new()),
            established_callbacks: RwLock::new(Vec::new()),
            established: AtomicBool::new(false),
            curr_seqno: AtomicU64::new(0),
        })
    }

    /// Build the IDL with every table in the schema registered, including
    /// the two procedural notification tables. On-demand tables declare
    /// their readonly columns on the `Table` itself (`readonly_columns()`);
    /// the in-memory adapter consults that at fetch time rather than
    /// needing a separate registration call.
    pub fn register_schema_tables(&self) {
        for table in self.schema.tables.values() {
            self.idl.register_table(&table.name);
            if !table.readonly_columns().is_empty() {
                debug!(table = %table.name, columns = ?table.readonly_columns(), "on-demand table registered");
            }
        }
    }

    pub fn on_changes(&self, cb: ChangesCallback) {
        self.changes_callbacks.write().push(cb);
    }

    pub fn on_established(&self, cb: EstablishedCallback) {
        self.established_callbacks.write().push(cb);
    }

    /// Hand a freshly opened transaction to the manager; it is committed
    /// (and retried on INCOMPLETE) on the next tick, per spec.md §4.10.
    pub fn track(&self, txn: Arc<Transaction>) {
        self.pending.write().push(txn);
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn idl(&self) -> &Arc<MemoryIdl> {
        &self.idl
    }

    /// Run the event loop forever. Wraps the tick loop in an outer
    /// reconnect loop: a socket-level error closes the inner loop and
    /// retries after a fixed backoff, indefinitely (spec.md §4.10). The
    /// in-memory adapter never actually errors, but the shape is kept so a
    /// real OVSDB-backed `Idl` slots in without restructuring this loop.
    pub async fn run(self: Arc<Self>) {
        self.register_schema_tables();
        loop {
            match self.clone().tick_loop().await {
                Ok(()) => break,
                Err(err) => {
                    error!(%err, "connection manager socket error, reconnecting");
                    tokio::time::sleep(self.config.reconnect_backoff).await;
                }
            }
        }
    }

    async fn tick_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            interval.tick().await;
            self.drive_one_tick();
        }
    }

    /// One pass: commit every pending transaction, then — if the replica
    /// advanced — run the `changes` callbacks and, on the very first
    /// advance, the `established` callbacks.
    fn drive_one_tick(&self) {
        let mut retained = Vec::new();
        for txn in self.pending.write().drain(..) {
            match self.idl.commit(&txn) {
                CommitResult::Incomplete => retained.push(txn),
                CommitResult::Success => {}
                CommitResult::Aborted | CommitResult::Error => {
                    warn!(txn_id = txn.id, "transaction ended in non-success terminal state");
                }
            }
        }
        *self.pending.write() = retained;

        let now = self.idl.current_seqno();
        let before = self.curr_seqno.swap(now, SeqCst);
        if now == before {
            return;
        }

        for cb in self.changes_callbacks.read().iter() {
            cb(&self.schema, &self.idl);
        }

        if !self.established.swap(true, SeqCst) {
            info!("connection manager established");
            for cb in self.established_callbacks.read().iter() {
                cb();
            }
        }
    }
}
