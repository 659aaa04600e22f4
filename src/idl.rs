//! DB Adapter (spec.md §4.2) — a thin façade over the IDL.
//!
//! `Idl` is the external-collaborator boundary: a real deployment would wire
//! this to an OVSDB-style wire protocol. `MemoryIdl` is the one
//! implementation this crate ships, sufficient to drive every other
//! component and its tests deterministically.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::{futures::Notified, Notify};
use uuid::Uuid;

use crate::value::Value;

/// A one-shot completion signal that stays "fired" forever once notified,
/// so callers that subscribe after the fact still observe completion
/// immediately instead of hanging. Grounded on the teacher's
/// `crates/core/src/util/notify_once.rs`.
pub struct NotifyOnce {
    notify: Notify,
    flag: AtomicBool,
}

impl NotifyOnce {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
            flag: AtomicBool::new(false),
        }
    }

    /// Returns true the first time it's called.
    pub fn notify(&self) -> bool {
        let prev = self.flag.swap(true, SeqCst);
        self.notify.notify_waiters();
        !prev
    }

    pub fn notified(&self) -> NotifiedOnce<'_> {
        NotifiedOnce {
            notified: self.notify.notified(),
            flag: &self.flag,
        }
    }

    pub fn is_done(&self) -> bool {
        self.flag.load(SeqCst)
    }
}

impl Default for NotifyOnce {
    fn default() -> Self {
        Self::new()
    }
}

pin_project_lite::pin_project! {
    pub struct NotifiedOnce<'a> {
        #[pin]
        notified: Notified<'a>,
        flag: &'a AtomicBool,
    }
}

impl Future for NotifiedOnce<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut me = self.project();
        while !me.flag.load(SeqCst) {
            ready!(me.notified.as_mut().poll(cx))
        }
        Poll::Ready(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    Success,
    Incomplete,
    Aborted,
    Error,
}

#[derive(Debug, Clone)]
pub struct RowTracking {
    pub create_seqno: u64,
    pub update_seqno: u64,
    pub delete_seqno: u64,
    pub columns_changed: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Row {
    pub uuid: Uuid,
    pub values: IndexMap<String, Value>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<Value> {
        self.values.get(column).cloned()
    }

    pub fn set(&mut self, column: &str, value: Value) {
        self.values.insert(column.to_owned(), value);
    }
}

pub struct Transaction {
    pub id: u64,
    event: NotifyOnce,
    result: RwLock<Option<CommitResult>>,
    /// pending writes, applied atomically on SUCCESS
    pub(crate) pending_inserts: RwLock<Vec<(String, Row)>>,
    pub(crate) pending_updates: RwLock<Vec<(String, Uuid, IndexMap<String, Value>)>>,
    pub(crate) pending_deletes: RwLock<Vec<(String, Uuid)>>,
    pub(crate) pending_fetches: RwLock<Vec<(String, Option<Uuid>, String)>>,
}

impl Transaction {
    fn new(id: u64) -> Self {
        Self {
            id,
            event: NotifyOnce::new(),
            result: RwLock::new(None),
            pending_inserts: RwLock::new(Vec::new()),
            pending_updates: RwLock::new(Vec::new()),
            pending_deletes: RwLock::new(Vec::new()),
            pending_fetches: RwLock::new(Vec::new()),
        }
    }

    pub fn insert(&self, table: &str, row: Row) {
        self.pending_inserts.write().push((table.to_owned(), row));
    }

    pub fn update(&self, table: &str, row: Uuid, columns: IndexMap<String, Value>) {
        self.pending_updates.write().push((table.to_owned(), row, columns));
    }

    pub fn delete(&self, table: &str, row: Uuid) {
        self.pending_deletes.write().push((table.to_owned(), row));
    }

    pub fn fetch_column(&self, table: &str, row: Option<Uuid>, column: &str) {
        self.pending_fetches
            .write()
            .push((table.to_owned(), row, column.to_owned()));
    }

    /// Wait for the transaction to reach a terminal (non-INCOMPLETE) state.
    /// This is the suspension point named in spec.md §5.
    pub async fn wait(&self) -> CommitResult {
        self.event.notified().await;
        self.result.read().expect("result set before notify")
    }
}

struct TableState {
    rows: HashMap<Uuid, Row>,
    tracking: HashMap<Uuid, RowTracking>,
    fetched_columns: HashMap<Uuid, std::collections::HashSet<String>>,
}

impl TableState {
    fn new() -> Self {
        Self {
            rows: HashMap::new(),
            tracking: HashMap::new(),
            fetched_columns: HashMap::new(),
        }
    }
}

/// In-process fake of an OVSDB-style IDL. Deterministic by construction: a
/// transaction completes SUCCESS on its first `commit()` call unless the
/// test harness has asked it to return INCOMPLETE `n` times first.
pub struct MemoryIdl {
    tables: RwLock<HashMap<String, TableState>>,
    seqno: AtomicU64,
    next_txn_id: AtomicU64,
    transactions: RwLock<HashMap<u64, Arc<Transaction>>>,
    /// table -> remaining INCOMPLETE responses to synthesize, for CM retry tests
    incomplete_budget: RwLock<HashMap<u64, u32>>,
}

impl Default for MemoryIdl {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdl {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            seqno: AtomicU64::new(1),
            next_txn_id: AtomicU64::new(1),
            transactions: RwLock::new(HashMap::new()),
            incomplete_budget: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_table(&self, table: &str) {
        self.tables.write().entry(table.to_owned()).or_insert_with(TableState::new);
    }

    pub fn open_transaction(&self) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, SeqCst);
        let txn = Arc::new(Transaction::new(id));
        self.transactions.write().insert(id, txn.clone());
        txn
    }

    /// Arrange for the next `budget` commits of `txn_id` to report INCOMPLETE.
    pub fn arm_incomplete(&self, txn_id: u64, budget: u32) {
        self.incomplete_budget.write().insert(txn_id, budget);
    }

    /// Commit a transaction's pending operations. Returns the terminal
    /// state once decided; the Connection Manager is the only caller that
    /// should retry on INCOMPLETE (spec.md §4.2).
    pub fn commit(&self, txn: &Transaction) -> CommitResult {
        if let Some(budget) = self.incomplete_budget.write().get_mut(&txn.id) {
            if *budget > 0 {
                *budget -= 1;
                return CommitResult::Incomplete;
            }
        }

        let seq = self.seqno.fetch_add(1, SeqCst);
        let mut tables = self.tables.write();

        for (table, row) in txn.pending_inserts.write().drain(..) {
            let state = tables.entry(table).or_insert_with(TableState::new);
            let uuid = row.uuid;
            state.rows.insert(uuid, row);
            state.tracking.insert(
                uuid,
                RowTracking {
                    create_seqno: seq,
                    update_seqno: 0,
                    delete_seqno: 0,
                    columns_changed: Vec::new(),
                },
            );
        }

        for (table, uuid, columns) in txn.pending_updates.write().drain(..) {
            let state = tables.entry(table).or_insert_with(TableState::new);
            if let Some(row) = state.rows.get_mut(&uuid) {
                let changed: Vec<String> = columns.keys().cloned().collect();
                for (k, v) in columns {
                    row.values.insert(k, v);
                }
                let entry = state.tracking.entry(uuid).or_insert(RowTracking {
                    create_seqno: 0,
                    update_seqno: 0,
                    delete_seqno: 0,
                    columns_changed: Vec::new(),
                });
                entry.update_seqno = seq;
                entry.columns_changed = changed;
            }
        }

        for (table, uuid) in txn.pending_deletes.write().drain(..) {
            let state = tables.entry(table).or_insert_with(TableState::new);
            state.rows.remove(&uuid);
            let entry = state.tracking.entry(uuid).or_insert(RowTracking {
                create_seqno: 0,
                update_seqno: 0,
                delete_seqno: 0,
                columns_changed: Vec::new(),
            });
            entry.delete_seqno = seq;
        }

        for (table, row, column) in txn.pending_fetches.write().drain(..) {
            let state = tables.entry(table).or_insert_with(TableState::new);
            match row {
                Some(uuid) => {
                    state.fetched_columns.entry(uuid).or_default().insert(column);
                }
                None => {
                    let uuids: Vec<Uuid> = state.rows.keys().copied().collect();
                    for uuid in uuids {
                        state.fetched_columns.entry(uuid).or_default().insert(column.clone());
                    }
                }
            }
        }

        drop(tables);
        *txn.result.write() = Some(CommitResult::Success);
        txn.event.notify();
        CommitResult::Success
    }

    pub fn current_seqno(&self) -> u64 {
        self.seqno.load(SeqCst)
    }

    pub fn row(&self, table: &str, uuid: Uuid) -> Option<Row> {
        self.tables.read().get(table)?.rows.get(&uuid).cloned()
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|s| s.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_fetched(&self, table: &str, uuid: Uuid, column: &str) -> bool {
        self.tables
            .read()
            .get(table)
            .and_then(|s| s.fetched_columns.get(&uuid))
            .map(|cols| cols.contains(column))
            .unwrap_or(false)
    }

    /// Resolve a URI-index tuple to a row. `columns` and `values` are
    /// positionally paired, per the table's ordered `index_columns`.
    pub fn index_to_row(&self, table: &str, columns: &[String], values: &[String]) -> Option<Row> {
        self.tables.read().get(table).and_then(|s| {
            s.rows
                .values()
                .find(|r| row_matches_index(r, columns, values))
                .cloned()
        })
    }

    /// Rows changed since `since_seqno`, with their tracking record.
    /// Returns (table, row, tracking) triples for the Connection Manager's
    /// change-tick scan.
    pub fn changes_since(&self, since_seqno: u64) -> Vec<(String, Uuid, RowTracking)> {
        let tables = self.tables.read();
        let mut out = Vec::new();
        for (table, state) in tables.iter() {
            for (uuid, tracking) in &state.tracking {
                if tracking.create_seqno > since_seqno
                    || tracking.update_seqno > since_seqno
                    || tracking.delete_seqno > since_seqno
                {
                    out.push((table.clone(), *uuid, tracking.clone()));
                }
            }
        }
        out
    }

    /// Clear per-row tracking after a tick has consumed it (but keep deleted
    /// rows' tombstone tracking out of the live table).
    pub fn clear_tracking_below(&self, seqno: u64) {
        let mut tables = self.tables.write();
        for state in tables.values_mut() {
            state.tracking.retain(|uuid, t| {
                if t.delete_seqno != 0 && t.delete_seqno <= seqno {
                    return false;
                }
                t.create_seqno = 0;
                t.update_seqno = 0;
                t.columns_changed.clear();
                state.rows.contains_key(uuid) || t.delete_seqno > seqno
            });
        }
    }
}

fn row_matches_index(row: &Row, columns: &[String], values: &[String]) -> bool {
    if columns.len() != values.len() {
        return false;
    }
    columns.iter().zip(values).all(|(col, expected)| {
        row.values
            .get(col)
            .map(|v| v.as_str() == Some(expected.as_str()) || v.sort_key() == expected.to_lowercase())
            .unwrap_or(false)
    })
}
