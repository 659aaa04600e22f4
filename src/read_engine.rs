//! Read Engine (spec.md §4.4) — recursive resource serializer.
//!
//! Recursion is modeled as an explicit work-list keyed on `(table, row,
//! depth)` rather than native call recursion, per spec.md §9, bounding
//! stack growth and letting us memoize already-serialized rows within one
//! request.

use std::collections::HashMap;

use serde_json::{Map, Value as Json};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::idl::{MemoryIdl, Row};
use crate::schema::{effective_category, Category, Relation, Schema, Table};
use crate::uri::{Resource, ResourceRelation};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selector {
    #[default]
    All,
    Configuration,
    Status,
    Statistics,
}

impl Selector {
    pub fn parse(s: Option<&str>) -> Result<Self> {
        match s {
            None => Ok(Selector::All),
            Some("configuration") => Ok(Selector::Configuration),
            Some("status") => Ok(Selector::Status),
            Some("statistics") => Ok(Selector::Statistics),
            Some(other) => Err(Error::ParameterNotAllowed(format!("unknown selector `{other}`"))),
        }
    }

    fn includes(self, cat: Category) -> bool {
        match self {
            Selector::All => true,
            Selector::Configuration => cat == Category::Configuration,
            Selector::Status => cat == Category::Status,
            Selector::Statistics => cat == Category::Statistics,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Default, Clone)]
pub struct QueryParams {
    pub depth: u32,
    pub selector: Selector,
    pub sort: Vec<SortKey>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub keys: Option<Vec<String>>,
    pub filters: Vec<(String, String)>,
}

/// Project a serialized row down to `keys` (spec.md §4.4 "project only
/// listed columns"). Applied only to the resource the caller directly
/// asked for — never inside `serialize_reference`'s recursive calls, so
/// nested referenced documents are always returned whole.
fn apply_keys(json: Json, selector: Selector, keys: &[String]) -> Json {
    let project = |map: Map<String, Json>| -> Map<String, Json> { map.into_iter().filter(|(k, _)| keys.iter().any(|w| w == k)).collect() };
    match (selector, json) {
        (Selector::All, Json::Object(mut obj)) => {
            for bucket in ["configuration", "status", "statistics"] {
                if let Some(Json::Object(inner)) = obj.remove(bucket) {
                    obj.insert(bucket.to_owned(), Json::Object(project(inner)));
                }
            }
            Json::Object(obj)
        }
        (_, Json::Object(obj)) => Json::Object(project(obj)),
        (_, other) => other,
    }
}

pub fn parse_sort(raw: &str) -> Vec<SortKey> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix('-') {
            Some(rest) => SortKey {
                column: rest.to_owned(),
                descending: true,
            },
            None => SortKey {
                column: s.to_owned(),
                descending: false,
            },
        })
        .collect()
}

/// Fetch every on-demand readonly column for a table once, ahead of a
/// depth>0 collection traversal, so per-row fetches below become cache hits.
fn prefetch_table(idl: &MemoryIdl, table: &Table) {
    if table.readonly_columns().is_empty() {
        return;
    }
    let txn = idl.open_transaction();
    for col in table.readonly_columns() {
        txn.fetch_column(&table.name, None, col);
    }
    idl.commit(&txn);
}

fn prefetch_row(idl: &MemoryIdl, table: &Table, row: Uuid) {
    let missing: Vec<&str> = table
        .readonly_columns()
        .into_iter()
        .filter(|c| !idl.is_fetched(&table.name, row, c))
        .collect();
    if missing.is_empty() {
        return;
    }
    let txn = idl.open_transaction();
    for col in &missing {
        txn.fetch_column(&table.name, Some(row), col);
    }
    idl.commit(&txn);
}

pub struct ReadEngine<'a> {
    pub schema: &'a Schema,
    pub idl: &'a MemoryIdl,
    cache: HashMap<(String, Uuid, u32), Json>,
}

type ParentRef<'a> = Option<(&'a str, Uuid)>;

impl<'a> ReadEngine<'a> {
    pub fn new(schema: &'a Schema, idl: &'a MemoryIdl) -> Self {
        Self {
            schema,
            idl,
            cache: HashMap::new(),
        }
    }

    pub fn serialize(&mut self, resource: &Resource, params: &QueryParams) -> Result<Json> {
        self.serialize_node(None, resource, params)
    }

    fn serialize_node(&mut self, parent: ParentRef<'_>, node: &Resource, params: &QueryParams) -> Result<Json> {
        match &node.next {
            Some(next) => {
                let row = node.row.ok_or(Error::ResourceNotFound)?;
                self.serialize_node(Some((node.table.as_str(), row)), next, params)
            }
            None if node.is_collection() => self.serialize_collection(parent, node, params),
            None => {
                let uuid = node.row.expect("non-collection resource carries a row");
                let json = self.serialize_row(&node.table, uuid, params.depth, params.selector)?;
                Ok(match &params.keys {
                    Some(keys) => apply_keys(json, params.selector, keys),
                    None => json,
                })
            }
        }
    }

    fn collection_rows(&self, parent: ParentRef<'_>, table: &Table, node: &Resource) -> Result<Vec<Uuid>> {
        match node.relation {
            ResourceRelation::TopLevel => Ok(self.idl.rows(&table.name).into_iter().map(|r| r.uuid).collect()),
            ResourceRelation::BackReference => {
                let (_, parent_row) = parent.ok_or(Error::ResourceNotFound)?;
                let col = node.column.as_deref().ok_or(Error::ResourceNotFound)?;
                Ok(self
                    .idl
                    .rows(&table.name)
                    .into_iter()
                    .filter(|r| r.get(col).and_then(|v| v.as_uuid()) == Some(parent_row))
                    .map(|r| r.uuid)
                    .collect())
            }
            ResourceRelation::Child => {
                let (parent_table, parent_row) = parent.ok_or(Error::ResourceNotFound)?;
                let col = node.column.as_deref().ok_or(Error::ResourceNotFound)?;
                let row = self.idl.row(parent_table, parent_row).ok_or(Error::ResourceNotFound)?;
                match row.get(col) {
                    Some(Value::List(items)) => Ok(items.iter().filter_map(|v| v.as_uuid()).collect()),
                    Some(Value::Map(map)) => Ok(map.values().filter_map(|v| v.as_uuid()).collect()),
                    Some(v) => Ok(v.as_uuid().into_iter().collect()),
                    None => Ok(Vec::new()),
                }
            }
            ResourceRelation::Root => Ok(Vec::new()),
        }
    }

    fn serialize_collection(&mut self, parent: ParentRef<'_>, node: &Resource, params: &QueryParams) -> Result<Json> {
        let table = self.schema.table(&node.table).ok_or(Error::ResourceNotFound)?;

        if params.depth > 0 {
            prefetch_table(self.idl, table);
        }

        let mut rows = self.collection_rows(parent, table, node)?;

        if !params.filters.is_empty() {
            rows.retain(|uuid| {
                let Some(row) = self.idl.row(&table.name, *uuid) else {
                    return false;
                };
                params
                    .filters
                    .iter()
                    .all(|(col, expected)| row.get(col).map(|v| v.sort_key() == expected.to_lowercase()).unwrap_or(false))
            });
        }

        if !params.sort.is_empty() {
            if params.depth == 0 {
                return Err(Error::ParameterNotAllowed("sort requires depth>0".into()));
            }
            let mut keyed: Vec<(Uuid, Vec<String>)> = rows
                .iter()
                .map(|uuid| {
                    let row = self.idl.row(&table.name, *uuid);
                    let keys = params
                        .sort
                        .iter()
                        .map(|k| row.as_ref().and_then(|r| r.get(&k.column)).map(|v| v.sort_key()).unwrap_or_default())
                        .collect();
                    (*uuid, keys)
                })
                .collect();
            keyed.sort_by(|a, b| {
                for (i, sort_key) in params.sort.iter().enumerate() {
                    let ord = a.1[i].cmp(&b.1[i]);
                    let ord = if sort_key.descending { ord.reverse() } else { ord };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
            rows = keyed.into_iter().map(|(u, _)| u).collect();
        }

        if let Some(offset) = params.offset {
            rows = rows.into_iter().skip(offset).collect();
        }
        if let Some(limit) = params.limit {
            rows.truncate(limit);
        }

        if params.depth == 0 {
            let uris: Vec<Json> = rows
                .into_iter()
                .map(|uuid| Json::String(self.uri_for_row(&table.name, uuid)))
                .collect();
            return Ok(Json::Array(uris));
        }

        let mut out = Vec::with_capacity(rows.len());
        for uuid in rows {
            let json = self.serialize_row(&table.name, uuid, params.depth, params.selector)?;
            out.push(match &params.keys {
                Some(keys) => apply_keys(json, params.selector, keys),
                None => json,
            });
        }
        Ok(Json::Array(out))
    }

    fn uri_for_row(&self, table: &str, uuid: Uuid) -> String {
        let plural = self
            .schema
            .table(table)
            .map(|t| t.plural_name.clone())
            .unwrap_or_else(|| table.to_owned());
        format!("/rest/v1/system/{plural}/{uuid}")
    }

    fn serialize_row(&mut self, table_name: &str, uuid: Uuid, depth: u32, selector: Selector) -> Result<Json> {
        let cache_key = (table_name.to_owned(), uuid, depth);
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached.clone());
        }

        let table = self.schema.table(table_name).ok_or(Error::ResourceNotFound)?;
        prefetch_row(self.idl, table, uuid);
        let row = self.idl.row(table_name, uuid).ok_or(Error::ResourceNotFound)?;

        let mut configuration = Map::new();
        let mut status = Map::new();
        let mut statistics = Map::new();

        for (name, column) in &table.columns {
            let cat = effective_category(table, name, &|col| row.get(col));
            if !selector.includes(cat) {
                continue;
            }
            let value = row.get(name).unwrap_or(Value::Null);
            if value.is_empty_value() && column.empty_value.is_some() {
                continue;
            }
            let bucket = match cat {
                Category::Configuration => &mut configuration,
                Category::Status => &mut status,
                Category::Statistics => &mut statistics,
                Category::Reference => unreachable!("column categories never resolve to Reference"),
            };
            bucket.insert(name.clone(), value.to_json());
        }

        for (name, reference) in &table.references {
            if reference.relation == Relation::Parent {
                // never recurse back toward the parent; avoids cycles.
                continue;
            }
            let cat = effective_category(table, name, &|col| row.get(col));
            if !selector.includes(cat) {
                continue;
            }
            let json = self.serialize_reference(table, &row, name, depth)?;
            let bucket = match cat {
                Category::Configuration | Category::Reference => &mut configuration,
                Category::Status => &mut status,
                Category::Statistics => &mut statistics,
            };
            bucket.insert(name.clone(), json);
        }

        let result = match selector {
            Selector::All => {
                let mut obj = Map::new();
                obj.insert("configuration".into(), Json::Object(configuration));
                obj.insert("status".into(), Json::Object(status));
                obj.insert("statistics".into(), Json::Object(statistics));
                Json::Object(obj)
            }
            Selector::Configuration => Json::Object(configuration),
            Selector::Status => Json::Object(status),
            Selector::Statistics => Json::Object(statistics),
        };

        self.cache.insert(cache_key, result.clone());
        Ok(result)
    }

    fn serialize_reference(&mut self, table: &Table, row: &Row, column: &str, depth: u32) -> Result<Json> {
        let reference = table.references.get(column).ok_or(Error::ResourceNotFound)?;
        let value = row.get(column).unwrap_or(Value::Null);

        if depth == 0 {
            return Ok(self.reference_as_uris(&reference.ref_table, &value, reference.kv_type));
        }

        match value {
            Value::List(items) => {
                let mut out = Vec::new();
                for item in items {
                    if let Some(uuid) = item.as_uuid() {
                        out.push(self.serialize_row(&reference.ref_table, uuid, depth - 1, Selector::All)?);
                    }
                }
                Ok(Json::Array(out))
            }
            Value::Map(map) => {
                let mut obj = Map::new();
                for (k, v) in map {
                    if let Some(uuid) = v.as_uuid() {
                        obj.insert(k, self.serialize_row(&reference.ref_table, uuid, depth - 1, Selector::All)?);
                    }
                }
                Ok(Json::Object(obj))
            }
            other => match other.as_uuid() {
                Some(uuid) => self.serialize_row(&reference.ref_table, uuid, depth - 1, Selector::All),
                None => Ok(Json::Null),
            },
        }
    }

    fn reference_as_uris(&self, ref_table: &str, value: &Value, kv: bool) -> Json {
        let uri = |uuid: Uuid| Json::String(self.uri_for_row(ref_table, uuid));
        match value {
            Value::List(items) => Json::Array(items.iter().filter_map(|v| v.as_uuid()).map(uri).collect()),
            Value::Map(map) if kv => {
                let mut obj = Map::new();
                for (k, v) in map {
                    if let Some(uuid) = v.as_uuid() {
                        obj.insert(k.clone(), uri(uuid));
                    }
                }
                Json::Object(obj)
            }
            Value::Map(map) => Json::Array(map.values().filter_map(|v| v.as_uuid()).map(uri).collect()),
            other => other.as_uuid().map(uri).unwrap_or(Json::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use crate::uri;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_descending_sort_keys() {
        let keys = parse_sort("name,-priority");
        assert_eq!(keys[0].column, "name");
        assert!(!keys[0].descending);
        assert_eq!(keys[1].column, "priority");
        assert!(keys[1].descending);
    }

    #[test]
    fn selector_rejects_unknown_value() {
        assert!(Selector::parse(Some("bogus")).is_err());
        assert_eq!(Selector::parse(Some("status")).unwrap(), Selector::Status);
    }

    #[test]
    fn serialize_row_buckets_columns_by_category() {
        let schema = testutil::schema();
        let idl = MemoryIdl::new();
        testutil::insert_interface(&idl, "eth0", "up");
        let iface = idl.rows("Interface").into_iter().next().unwrap().uuid;

        let mut engine = ReadEngine::new(&schema, &idl);
        let json = engine.serialize_row("Interface", iface, 0, Selector::All).unwrap();
        assert_eq!(json["configuration"]["name"], serde_json::json!("eth0"));
        assert_eq!(json["status"]["admin_state"], serde_json::json!("up"));
        assert!(json["configuration"].get("admin_state").is_none());
    }

    /// S3: `Route.metric`'s category is `per_value` on `from` — the same
    /// column lands in a different bucket depending on the row's own data.
    #[test]
    fn dynamic_category_follows_the_discriminant_column() {
        let schema = testutil::schema();
        let idl = MemoryIdl::new();
        testutil::seed_system(&idl);
        let vrf = testutil::insert_vrf(&idl, "vrf_default");
        let connected = testutil::insert_route(&idl, vrf, "connected", "10.0.0.0", 5);
        let static_route = testutil::insert_route(&idl, vrf, "static", "10.0.1.0", 5);

        let mut engine = ReadEngine::new(&schema, &idl);
        let connected_json = engine.serialize_row("Route", connected, 0, Selector::All).unwrap();
        assert_eq!(connected_json["status"]["metric"], serde_json::json!(5));
        assert!(connected_json["configuration"].get("metric").is_none());

        let static_json = engine.serialize_row("Route", static_route, 0, Selector::All).unwrap();
        assert_eq!(static_json["configuration"]["metric"], serde_json::json!(5));
        assert!(static_json["status"].get("metric").is_none());
    }

    /// S5: a collection's shape follows `depth` (URI list vs full rows)
    /// and `selector` (flat bucket vs the full configuration/status/
    /// statistics object).
    #[test]
    fn collection_depth_and_selector_shape_the_response() {
        let schema = testutil::schema();
        let idl = MemoryIdl::new();
        testutil::seed_system(&idl);
        let vrf = testutil::insert_vrf(&idl, "vrf_default");
        testutil::insert_bgp_router(&idl, vrf, 6004, "10.10.0.4");
        testutil::insert_bgp_router(&idl, vrf, 6005, "10.10.0.5");

        let collection = uri::resolve("/rest/v1/system/vrfs/vrf_default/bgp_routers", &schema, &idl).unwrap();

        let mut engine = ReadEngine::new(&schema, &idl);
        let uris = engine.serialize(&collection, &QueryParams::default()).unwrap();
        let uris = uris.as_array().unwrap();
        assert_eq!(uris.len(), 2);
        assert!(uris[0].as_str().unwrap().starts_with("/rest/v1/system/bgp_routers/"));

        let params = QueryParams {
            depth: 1,
            selector: Selector::Configuration,
            ..Default::default()
        };
        let mut engine = ReadEngine::new(&schema, &idl);
        let full = engine.serialize(&collection, &params).unwrap();
        let rows = full.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].get("asn").is_some());
        assert!(rows[0].get("configuration").is_none());
    }

    /// S5: `selector=status` on a collection returns only status-category
    /// columns per row.
    #[test]
    fn selector_status_returns_status_only_columns() {
        let schema = testutil::schema();
        let idl = MemoryIdl::new();
        testutil::insert_interface(&idl, "eth0", "up");
        testutil::insert_interface(&idl, "eth1", "down");

        let collection = uri::resolve("/rest/v1/system/interfaces", &schema, &idl).unwrap();
        let params = QueryParams {
            depth: 1,
            selector: Selector::Status,
            ..Default::default()
        };
        let mut engine = ReadEngine::new(&schema, &idl);
        let json = engine.serialize(&collection, &params).unwrap();
        let rows = json.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        for row in rows {
            assert!(row.get("admin_state").is_some());
            assert!(row.get("name").is_none());
        }
    }

    #[test]
    fn keys_projects_only_the_requested_top_level_columns() {
        let schema = testutil::schema();
        let idl = MemoryIdl::new();
        testutil::seed_system(&idl);
        let vrf = testutil::insert_vrf(&idl, "vrf_default");
        testutil::insert_bgp_router(&idl, vrf, 6004, "10.10.0.4");

        let instance = uri::resolve("/rest/v1/system/vrfs/vrf_default/bgp_routers/6004", &schema, &idl).unwrap();
        let params = QueryParams {
            keys: Some(vec!["router_id".to_owned()]),
            ..Default::default()
        };
        let mut engine = ReadEngine::new(&schema, &idl);
        let json = engine.serialize(&instance, &params).unwrap();
        let config = json.get("configuration").unwrap().as_object().unwrap();
        assert_eq!(config.len(), 1);
        assert!(config.contains_key("router_id"));
        assert!(!config.contains_key("asn"));
    }
}
