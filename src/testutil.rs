//! Shared fixture schema + row builders for component unit tests.
//!
//! Models a small slice of a switch: System → Vrf → BgpRouter →
//! BgpNeighbor, Vrf → Route (dynamic category, immutable), and System →
//! Interface (status-only). Used by `uri.rs`, `write_engine.rs`,
//! `validator.rs` and `notify.rs`'s test modules so each exercises the same
//! table shapes spec.md's scenarios describe.
#![cfg(test)]

use indexmap::IndexMap;
use uuid::Uuid;

use crate::idl::{MemoryIdl, Row};
use crate::schema::{RawSchema, Schema};
use crate::value::Value;

pub fn schema() -> Schema {
    let raw: RawSchema = serde_json::from_value(serde_json::json!({
        "tables": [
            {
                "name": "System",
                "is_root": true,
                "columns": [
                    {"name": "hostname", "category": "configuration", "type": "string", "mutable": true}
                ]
            },
            {
                "name": "Vrf",
                "plural_name": "vrfs",
                "index_columns": ["name"],
                "columns": [
                    {"name": "name", "category": "configuration", "type": "string"}
                ]
            },
            {
                "name": "BgpRouter",
                "plural_name": "bgp_routers",
                "index_columns": ["asn"],
                "columns": [
                    {"name": "asn", "category": "configuration", "type": "int"},
                    {"name": "router_id", "category": "configuration", "type": "string", "mutable": true},
                    {"name": "deterministic_med", "category": "configuration", "type": "bool", "mutable": true}
                ],
                "references": [
                    {"name": "vrf", "category": "configuration", "type": "uuid", "ref_table": "Vrf", "relation": "parent", "n_min": 1, "n_max": 1}
                ]
            },
            {
                "name": "BgpNeighbor",
                "plural_name": "bgp_neighbors",
                "index_columns": ["ip_or_group_name"],
                "columns": [
                    {"name": "ip_or_group_name", "category": "configuration", "type": "string"},
                    {"name": "remote_as", "category": "configuration", "type": "int", "mutable": true},
                    {"name": "local_as", "category": "configuration", "type": "int", "mutable": true}
                ],
                "references": [
                    {"name": "bgp_router", "category": "configuration", "type": "uuid", "ref_table": "BgpRouter", "relation": "parent", "n_min": 1, "n_max": 1}
                ]
            },
            {
                "name": "Route",
                "plural_name": "routes",
                "index_columns": ["from", "prefix"],
                "columns": [
                    {"name": "from", "category": "status", "type": "string"},
                    {"name": "prefix", "category": "status", "type": "string"},
                    {"name": "metric", "category": {"per_value": {"connected": "status", "static": "configuration"}}, "type": "int", "mutable": true}
                ],
                "references": [
                    {"name": "vrf", "category": "reference", "type": "uuid", "ref_table": "Vrf", "relation": "parent", "n_min": 1, "n_max": 1}
                ]
            },
            {
                "name": "Interface",
                "plural_name": "interfaces",
                "index_columns": ["name"],
                "columns": [
                    {"name": "name", "category": "configuration", "type": "string"},
                    {"name": "admin_state", "category": "status", "type": "string", "mutable": true}
                ]
            }
        ]
    }))
    .unwrap();
    Schema::load(raw).unwrap()
}

fn insert(idl: &MemoryIdl, table: &str, values: IndexMap<String, Value>) -> Uuid {
    let uuid = Uuid::new_v4();
    let txn = idl.open_transaction();
    txn.insert(table, Row { uuid, values });
    idl.commit(&txn);
    uuid
}

pub fn seed_system(idl: &MemoryIdl) -> Uuid {
    let mut values = IndexMap::new();
    values.insert("hostname".to_owned(), Value::String("switch1".to_owned()));
    insert(idl, "System", values)
}

pub fn insert_vrf(idl: &MemoryIdl, name: &str) -> Uuid {
    let mut values = IndexMap::new();
    values.insert("name".to_owned(), Value::String(name.to_owned()));
    insert(idl, "Vrf", values)
}

pub fn insert_bgp_router(idl: &MemoryIdl, vrf: Uuid, asn: i64, router_id: &str) -> Uuid {
    let mut values = IndexMap::new();
    values.insert("asn".to_owned(), Value::Int(asn));
    values.insert("router_id".to_owned(), Value::String(router_id.to_owned()));
    values.insert("deterministic_med".to_owned(), Value::Bool(false));
    values.insert("vrf".to_owned(), Value::Uuid(vrf));
    insert(idl, "BgpRouter", values)
}

pub fn insert_bgp_neighbor(idl: &MemoryIdl, router: Uuid, ip_or_group_name: &str, remote_as: i64) -> Uuid {
    let mut values = IndexMap::new();
    values.insert("ip_or_group_name".to_owned(), Value::String(ip_or_group_name.to_owned()));
    values.insert("remote_as".to_owned(), Value::Int(remote_as));
    values.insert("local_as".to_owned(), Value::Int(0));
    values.insert("bgp_router".to_owned(), Value::Uuid(router));
    insert(idl, "BgpNeighbor", values)
}

pub fn insert_route(idl: &MemoryIdl, vrf: Uuid, from: &str, prefix: &str, metric: i64) -> Uuid {
    let mut values = IndexMap::new();
    values.insert("from".to_owned(), Value::String(from.to_owned()));
    values.insert("prefix".to_owned(), Value::String(prefix.to_owned()));
    values.insert("metric".to_owned(), Value::Int(metric));
    values.insert("vrf".to_owned(), Value::Uuid(vrf));
    insert(idl, "Route", values)
}

pub fn insert_interface(idl: &MemoryIdl, name: &str, admin_state: &str) -> Uuid {
    let mut values = IndexMap::new();
    values.insert("name".to_owned(), Value::String(name.to_owned()));
    values.insert("admin_state".to_owned(), Value::String(admin_state.to_owned()));
    insert(idl, "Interface", values)
}

pub fn insert_subscriber(idl: &MemoryIdl) -> Uuid {
    insert(idl, "Subscriber", IndexMap::new())
}

pub fn insert_subscription(idl: &MemoryIdl, subscriber: Uuid, resource: &str) -> Uuid {
    let mut values = IndexMap::new();
    values.insert("subscriber".to_owned(), Value::Uuid(subscriber));
    values.insert("resource".to_owned(), Value::String(resource.to_owned()));
    insert(idl, "Subscription", values)
}

/// A fully wired `AppState` over the fixture schema, with the Connection
/// Manager's tick loop already spawned at a short interval — for tests
/// that need `txn.wait()` to actually resolve (`ws.rs`, `routes::rest`).
pub fn app_state() -> std::sync::Arc<crate::routes::AppState> {
    use crate::auth::{AllowAll, PermissionCheck, SessionKeys};
    use crate::cm::{ConnectionManager, ConnectionManagerConfig};
    use crate::config::Config;
    use crate::notify::NotificationEngine;
    use crate::routes::account::AccountStore;
    use crate::routes::AppState;

    let schema = std::sync::Arc::new(schema());
    let idl = std::sync::Arc::new(MemoryIdl::new());
    seed_system(&idl);

    let cm_config = ConnectionManagerConfig {
        tick_interval: std::time::Duration::from_millis(5),
        ..ConnectionManagerConfig::default()
    };
    let cm = ConnectionManager::new(schema.clone(), idl.clone(), cm_config);

    let notify = std::sync::Arc::new(NotificationEngine::new(schema.clone(), idl.clone()));
    {
        let notify = notify.clone();
        cm.on_changes(Box::new(move |_schema: &Schema, _idl: &MemoryIdl| notify.tick()));
    }
    tokio::spawn(cm.clone().run());

    let validators = std::sync::Arc::new(crate::validator::default_registry());
    let session_keys = std::sync::Arc::new(SessionKeys::generate());
    let permissions: std::sync::Arc<dyn PermissionCheck> = std::sync::Arc::new(AllowAll);
    let account = std::sync::Arc::new(AccountStore::new(serde_json::json!({}), serde_json::json!({})));
    let config = Config { force_https: false, ..Config::default() };

    AppState::new(cm, notify, validators, session_keys, permissions, account, &config)
}
