//! Notification Engine (spec.md §4.7).
//!
//! Runs once per Connection Manager change tick. Grounded on
//! `original_source/opsrest/notifications/handler.py` for the
//! subscription-table-first ordering and initial-membership algorithm, and
//! on the teacher's `crates/core/src/json/client_api.rs` for the
//! one-envelope-per-subscriber-per-tick batching pattern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value as Json};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::idl::{MemoryIdl, Row, RowTracking};
use crate::schema::Schema;
use crate::uri::{Resource, ResourceRelation};
use crate::value::Value;

#[derive(Debug, Clone)]
enum SubscriptionKind {
    Row { table: String, uuid: Uuid },
    Collection { table: String, members: HashMap<Uuid, String> },
}

struct SubscriptionState {
    subscriber: Uuid,
    resource_uri: String,
    kind: SubscriptionKind,
}

#[derive(Default)]
struct Outbound {
    added: Vec<Json>,
    modified: Vec<Json>,
    deleted: Vec<Json>,
}

pub struct NotificationEngine {
    schema: Arc<Schema>,
    idl: Arc<MemoryIdl>,
    subscriptions: RwLock<HashMap<Uuid, SubscriptionState>>,
    senders: RwLock<HashMap<Uuid, UnboundedSender<Json>>>,
    last_seqno: AtomicU64,
}

fn simple_uri(schema: &Schema, table: &str, uuid: Uuid) -> String {
    let plural = schema.table(table).map(|t| t.plural_name.clone()).unwrap_or_else(|| table.to_owned());
    format!("/rest/v1/system/{plural}/{uuid}")
}

fn flat_row_values(schema: &Schema, idl: &MemoryIdl, table_name: &str, uuid: Uuid) -> Option<Json> {
    let table = schema.table(table_name)?;
    let row = idl.row(table_name, uuid)?;
    let mut out = Map::new();
    for name in table.columns.keys() {
        out.insert(name.clone(), row.get(name).unwrap_or(Value::Null).to_json());
    }
    for (name, reference) in &table.references {
        let value = row.get(name).unwrap_or(Value::Null);
        let json = match &value {
            Value::List(items) => Json::Array(
                items
                    .iter()
                    .filter_map(|v| v.as_uuid())
                    .map(|u| Json::String(simple_uri(schema, &reference.ref_table, u)))
                    .collect(),
            ),
            Value::Map(map) => {
                let mut obj = Map::new();
                for (k, v) in map {
                    if let Some(u) = v.as_uuid() {
                        obj.insert(k.clone(), Json::String(simple_uri(schema, &reference.ref_table, u)));
                    }
                }
                Json::Object(obj)
            }
            other => other.as_uuid().map(|u| Json::String(simple_uri(schema, &reference.ref_table, u))).unwrap_or(Json::Null),
        };
        out.insert(name.clone(), json);
    }
    Some(Json::Object(out))
}

fn parent_of_terminal(resource: &Resource) -> Option<(&str, Uuid)> {
    let mut cursor = resource;
    let mut parent = None;
    while let Some(next) = &cursor.next {
        parent = Some((cursor.table.as_str(), cursor.row?));
        cursor = next;
    }
    parent
}

fn collection_members(idl: &MemoryIdl, parent: Option<(&str, Uuid)>, node: &Resource) -> Vec<Uuid> {
    match node.relation {
        ResourceRelation::TopLevel => idl.rows(&node.table).into_iter().map(|r| r.uuid).collect(),
        ResourceRelation::BackReference => {
            let Some((_, parent_row)) = parent else { return Vec::new() };
            let Some(col) = node.column.as_deref() else { return Vec::new() };
            idl.rows(&node.table)
                .into_iter()
                .filter(|r| r.get(col).and_then(|v| v.as_uuid()) == Some(parent_row))
                .map(|r| r.uuid)
                .collect()
        }
        ResourceRelation::Child => {
            let (Some((parent_table, parent_row)), Some(col)) = (parent, node.column.as_deref()) else {
                return Vec::new();
            };
            let Some(row) = idl.row(parent_table, parent_row) else { return Vec::new() };
            match row.get(col) {
                Some(Value::List(items)) => items.iter().filter_map(|v| v.as_uuid()).collect(),
                Some(Value::Map(map)) => map.values().filter_map(|v| v.as_uuid()).collect(),
                Some(v) => v.as_uuid().into_iter().collect(),
                None => Vec::new(),
            }
        }
        ResourceRelation::Root => Vec::new(),
    }
}

fn push_added(out: &mut HashMap<Uuid, Outbound>, subscriber: Uuid, subscription_uri: &str, resource_uri: &str, values: Json) {
    out.entry(subscriber).or_default().added.push(serde_json::json!({
        "subscription": subscription_uri,
        "resource": resource_uri,
        "values": values,
    }));
}

fn push_modified(out: &mut HashMap<Uuid, Outbound>, subscriber: Uuid, subscription_uri: &str, resource_uri: &str, new_values: Json) {
    out.entry(subscriber).or_default().modified.push(serde_json::json!({
        "subscription": subscription_uri,
        "resource": resource_uri,
        "new_values": new_values,
    }));
}

fn push_deleted(out: &mut HashMap<Uuid, Outbound>, subscriber: Uuid, subscription_uri: &str, resource_uri: &str) {
    out.entry(subscriber).or_default().deleted.push(serde_json::json!({
        "subscription": subscription_uri,
        "resource": resource_uri,
    }));
}

impl NotificationEngine {
    pub fn new(schema: Arc<Schema>, idl: Arc<MemoryIdl>) -> Self {
        idl.register_table("Subscriber");
        idl.register_table("Subscription");
        Self {
            schema,
            idl,
            subscriptions: RwLock::new(HashMap::new()),
            senders: RwLock::new(HashMap::new()),
            last_seqno: AtomicU64::new(0),
        }
    }

    pub fn register_sender(&self, subscriber: Uuid, sender: UnboundedSender<Json>) {
        self.senders.write().insert(subscriber, sender);
    }

    pub fn unregister_sender(&self, subscriber: Uuid) {
        self.senders.write().remove(&subscriber);
        self.subscriptions.write().retain(|_, state| state.subscriber != subscriber);
    }

    /// Run one change-tick scan (spec.md §4.7). Called by the Connection
    /// Manager after every successful IDL advance.
    pub fn tick(&self) {
        let since = self.last_seqno.load(SeqCst);
        let changes = self.idl.changes_since(since);
        let now = self.idl.current_seqno();
        let mut outbound: HashMap<Uuid, Outbound> = HashMap::new();

        for (table, uuid, tracking) in &changes {
            if table != "Subscription" {
                continue;
            }
            if tracking.delete_seqno > since {
                self.subscriptions.write().remove(uuid);
                continue;
            }
            if tracking.create_seqno > since {
                if let Some(row) = self.idl.row("Subscription", *uuid) {
                    self.register_subscription(*uuid, &row, &mut outbound);
                }
            }
        }

        for (table, uuid, tracking) in &changes {
            if table == "Subscription" {
                continue;
            }
            if tracking.create_seqno > since {
                self.handle_created(table, *uuid, &mut outbound);
            }
            if tracking.update_seqno > since {
                self.handle_updated(table, *uuid, tracking, &mut outbound);
            }
            if tracking.delete_seqno > since {
                self.handle_deleted(table, *uuid, &mut outbound);
            }
        }

        self.dispatch(outbound);
        self.idl.clear_tracking_below(now);
        self.last_seqno.store(now, SeqCst);
    }

    fn register_subscription(&self, sub_uuid: Uuid, sub_row: &Row, outbound: &mut HashMap<Uuid, Outbound>) {
        let Some(subscriber) = sub_row.get("subscriber").and_then(|v| v.as_uuid()) else {
            return;
        };
        let Some(resource_uri) = sub_row.get("resource").and_then(|v| v.as_str().map(str::to_owned)) else {
            return;
        };
        let Ok(resource) = crate::uri::resolve(&resource_uri, &self.schema, &self.idl) else {
            return;
        };
        let terminal = resource.terminal();
        let subscription_uri = format!("/rest/v1/system/subscribers/{subscriber}/subscriptions/{sub_uuid}");

        if terminal.is_collection() {
            let parent = parent_of_terminal(&resource);
            let members = collection_members(&self.idl, parent, terminal);
            let mut member_uris = HashMap::new();
            for uuid in members {
                let uri = simple_uri(&self.schema, &terminal.table, uuid);
                if let Some(values) = flat_row_values(&self.schema, &self.idl, &terminal.table, uuid) {
                    push_added(outbound, subscriber, &subscription_uri, &uri, values);
                }
                member_uris.insert(uuid, uri);
            }
            self.subscriptions.write().insert(
                sub_uuid,
                SubscriptionState {
                    subscriber,
                    resource_uri,
                    kind: SubscriptionKind::Collection {
                        table: terminal.table.clone(),
                        members: member_uris,
                    },
                },
            );
        } else if let Some(uuid) = terminal.row {
            let uri = simple_uri(&self.schema, &terminal.table, uuid);
            if let Some(values) = flat_row_values(&self.schema, &self.idl, &terminal.table, uuid) {
                push_added(outbound, subscriber, &subscription_uri, &uri, values);
            }
            self.subscriptions.write().insert(
                sub_uuid,
                SubscriptionState {
                    subscriber,
                    resource_uri,
                    kind: SubscriptionKind::Row {
                        table: terminal.table.clone(),
                        uuid,
                    },
                },
            );
        }
    }

    fn handle_created(&self, table: &str, uuid: Uuid, outbound: &mut HashMap<Uuid, Outbound>) {
        let mut subs = self.subscriptions.write();
        for (sub_id, state) in subs.iter_mut() {
            let SubscriptionKind::Collection { table: sub_table, members } = &mut state.kind else {
                continue;
            };
            if sub_table.as_str() != table || members.contains_key(&uuid) {
                continue;
            }
            let Ok(resource) = crate::uri::resolve(&state.resource_uri, &self.schema, &self.idl) else {
                continue;
            };
            let terminal = resource.terminal();
            let parent = parent_of_terminal(&resource);
            if !collection_members(&self.idl, parent, terminal).contains(&uuid) {
                continue;
            }
            let uri = simple_uri(&self.schema, table, uuid);
            if let Some(values) = flat_row_values(&self.schema, &self.idl, table, uuid) {
                let subscription_uri = format!("/rest/v1/system/subscribers/{}/subscriptions/{sub_id}", state.subscriber);
                push_added(outbound, state.subscriber, &subscription_uri, &uri, values);
            }
            members.insert(uuid, uri);
        }
    }

    fn handle_updated(&self, table: &str, uuid: Uuid, tracking: &RowTracking, outbound: &mut HashMap<Uuid, Outbound>) {
        let subs = self.subscriptions.read();
        for (sub_id, state) in subs.iter() {
            let matches = match &state.kind {
                SubscriptionKind::Row { table: t, uuid: u } => t.as_str() == table && *u == uuid,
                SubscriptionKind::Collection { table: t, members } => t.as_str() == table && members.contains_key(&uuid),
            };
            if !matches {
                continue;
            }
            let Some(row) = self.idl.row(table, uuid) else { continue };
            let mut new_values = Map::new();
            for col in &tracking.columns_changed {
                new_values.insert(col.clone(), row.get(col).unwrap_or(Value::Null).to_json());
            }
            let uri = simple_uri(&self.schema, table, uuid);
            let subscription_uri = format!("/rest/v1/system/subscribers/{}/subscriptions/{sub_id}", state.subscriber);
            push_modified(outbound, state.subscriber, &subscription_uri, &uri, Json::Object(new_values));
        }
    }

    fn handle_deleted(&self, table: &str, uuid: Uuid, outbound: &mut HashMap<Uuid, Outbound>) {
        let mut subs = self.subscriptions.write();
        for (sub_id, state) in subs.iter_mut() {
            let hit = match &mut state.kind {
                SubscriptionKind::Row { table: t, uuid: u } => t.as_str() == table && *u == uuid,
                SubscriptionKind::Collection { table: t, members } => t.as_str() == table && members.remove(&uuid).is_some(),
            };
            if !hit {
                continue;
            }
            let uri = simple_uri(&self.schema, table, uuid);
            let subscription_uri = format!("/rest/v1/system/subscribers/{}/subscriptions/{sub_id}", state.subscriber);
            push_deleted(outbound, state.subscriber, &subscription_uri, &uri);
        }
    }

    fn dispatch(&self, outbound: HashMap<Uuid, Outbound>) {
        let senders = self.senders.read();
        for (subscriber, batch) in outbound {
            if batch.added.is_empty() && batch.modified.is_empty() && batch.deleted.is_empty() {
                continue;
            }
            let Some(sender) = senders.get(&subscriber) else { continue };
            let message = serde_json::json!({
                "notifications": {
                    "added": batch.added,
                    "modified": batch.modified,
                    "deleted": batch.deleted,
                }
            });
            let _ = sender.send(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use indexmap::IndexMap;
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::testutil;

    fn counts(message: &Json) -> (usize, usize, usize) {
        let n = &message["notifications"];
        (n["added"].as_array().unwrap().len(), n["modified"].as_array().unwrap().len(), n["deleted"].as_array().unwrap().len())
    }

    #[test]
    fn subscribing_to_a_row_sends_an_initial_added_snapshot() {
        let schema = Arc::new(testutil::schema());
        let idl = Arc::new(MemoryIdl::new());
        testutil::seed_system(&idl);
        let vrf = testutil::insert_vrf(&idl, "vrf_default");

        let engine = NotificationEngine::new(schema.clone(), idl.clone());
        let (tx, mut rx) = unbounded_channel();
        let subscriber = testutil::insert_subscriber(&idl);
        engine.register_sender(subscriber, tx);
        testutil::insert_subscription(&idl, subscriber, "/rest/v1/system/vrfs/vrf_default");

        engine.tick();

        let message = rx.try_recv().expect("initial snapshot not sent");
        let (added, modified, deleted) = counts(&message);
        assert_eq!((added, modified, deleted), (1, 0, 0));
        assert_eq!(message["notifications"]["added"][0]["resource"], format!("/rest/v1/system/vrfs/{vrf}"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn a_later_update_is_observed_as_modified_after_the_initial_snapshot() {
        let schema = Arc::new(testutil::schema());
        let idl = Arc::new(MemoryIdl::new());
        testutil::seed_system(&idl);
        let vrf = testutil::insert_vrf(&idl, "vrf_default");
        let router = testutil::insert_bgp_router(&idl, vrf, 6004, "10.10.0.4");

        let engine = NotificationEngine::new(schema.clone(), idl.clone());
        let (tx, mut rx) = unbounded_channel();
        let subscriber = testutil::insert_subscriber(&idl);
        engine.register_sender(subscriber, tx);
        testutil::insert_subscription(&idl, subscriber, "/rest/v1/system/vrfs/vrf_default/bgp_routers/6004");
        engine.tick();
        let initial = rx.try_recv().unwrap();
        assert_eq!(counts(&initial), (1, 0, 0));

        let txn = idl.open_transaction();
        let mut cols = IndexMap::new();
        cols.insert("router_id".to_owned(), Value::String("10.10.1.4".to_owned()));
        txn.update("BgpRouter", router, cols);
        idl.commit(&txn);
        engine.tick();

        let update = rx.try_recv().expect("update not observed");
        let (added, modified, deleted) = counts(&update);
        assert_eq!((added, modified, deleted), (0, 1, 0));
        assert_eq!(update["notifications"]["modified"][0]["new_values"]["router_id"], "10.10.1.4");
    }

    #[test]
    fn deleting_a_subscribed_row_is_observed_as_deleted() {
        let schema = Arc::new(testutil::schema());
        let idl = Arc::new(MemoryIdl::new());
        testutil::seed_system(&idl);
        let vrf = testutil::insert_vrf(&idl, "vrf_default");
        let router = testutil::insert_bgp_router(&idl, vrf, 6004, "10.10.0.4");

        let engine = NotificationEngine::new(schema.clone(), idl.clone());
        let (tx, mut rx) = unbounded_channel();
        let subscriber = testutil::insert_subscriber(&idl);
        engine.register_sender(subscriber, tx);
        testutil::insert_subscription(&idl, subscriber, "/rest/v1/system/vrfs/vrf_default/bgp_routers/6004");
        engine.tick();
        rx.try_recv().unwrap();

        let txn = idl.open_transaction();
        txn.delete("BgpRouter", router);
        idl.commit(&txn);
        engine.tick();

        let deleted = rx.try_recv().expect("delete not observed");
        assert_eq!(counts(&deleted), (0, 0, 1));
    }

    #[test]
    fn a_collection_subscription_reports_new_members_as_added() {
        let schema = Arc::new(testutil::schema());
        let idl = Arc::new(MemoryIdl::new());
        testutil::seed_system(&idl);
        let vrf = testutil::insert_vrf(&idl, "vrf_default");
        testutil::insert_bgp_router(&idl, vrf, 6004, "10.10.0.4");

        let engine = NotificationEngine::new(schema.clone(), idl.clone());
        let (tx, mut rx) = unbounded_channel();
        let subscriber = testutil::insert_subscriber(&idl);
        engine.register_sender(subscriber, tx);
        testutil::insert_subscription(&idl, subscriber, "/rest/v1/system/vrfs/vrf_default/bgp_routers");
        engine.tick();

        let initial = rx.try_recv().expect("initial membership not sent");
        assert_eq!(counts(&initial), (1, 0, 0));

        testutil::insert_bgp_router(&idl, vrf, 6005, "10.10.0.5");
        engine.tick();

        let grown = rx.try_recv().expect("new member not observed");
        assert_eq!(counts(&grown), (1, 0, 0));
    }

    #[test]
    fn unregistering_a_sender_drops_its_subscriptions() {
        let schema = Arc::new(testutil::schema());
        let idl = Arc::new(MemoryIdl::new());
        testutil::seed_system(&idl);
        let vrf = testutil::insert_vrf(&idl, "vrf_default");

        let engine = NotificationEngine::new(schema.clone(), idl.clone());
        let (tx, rx) = unbounded_channel();
        let subscriber = testutil::insert_subscriber(&idl);
        engine.register_sender(subscriber, tx);
        testutil::insert_subscription(&idl, subscriber, "/rest/v1/system/vrfs/vrf_default");
        engine.tick();
        drop(rx);

        engine.unregister_sender(subscriber);
        assert!(engine.subscriptions.read().is_empty());
    }
}
