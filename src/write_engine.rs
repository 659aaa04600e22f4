//! Write Engine (spec.md §4.5).
//!
//! Every entry point stages its mutations on an already-open `Transaction`
//! and returns the `PendingChange` ledger the Validator Adapter runs over;
//! nothing here commits. Grounded on `original_source/opsrest/post.py`,
//! `put.py`, `patch.py` and `delete.py`.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value as Json};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::idl::{MemoryIdl, Row, Transaction};
use crate::schema::{effective_category, Category, CategoryRule, Column, Reference, Relation, Schema, Table};
use crate::uri::{self, Resource, ResourceRelation};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

/// One staged mutation, recorded for the Validator Adapter (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub op: WriteOp,
    pub table: String,
    pub row: Uuid,
    pub parent_table: Option<String>,
    pub parent_row: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    #[serde(default)]
    pub value: Json,
    #[serde(default)]
    pub from: String,
}

/// Walk back from a resource chain's terminal to its immediate parent
/// `(table, row)`, if any. The chain always starts at the System row.
fn parent_context(resource: &Resource) -> Option<(&str, Uuid)> {
    let mut cursor = resource;
    let mut parent = None;
    while let Some(next) = &cursor.next {
        parent = Some((cursor.table.as_str(), cursor.row?));
        cursor = next;
    }
    parent
}

/// Whether the table's own link to its parent is currently configuration
/// category. `own_row` is `None` at POST time, before the row exists, so
/// only a statically-declared category can be trusted.
fn parent_ref_category(table: &Table, own_row: Option<&Row>) -> Category {
    let Some(reference) = table.references.values().find(|r| r.relation == Relation::Parent) else {
        return Category::Configuration;
    };
    match own_row {
        Some(row) => effective_category(table, &reference.column.name, &|c| row.get(c)),
        None => match &reference.column.category {
            CategoryRule::Static(cat) => *cat,
            _ => Category::Configuration,
        },
    }
}

fn uri_for_row(schema: &Schema, table: &str, uuid: Uuid) -> String {
    let plural = schema.table(table).map(|t| t.plural_name.clone()).unwrap_or_else(|| table.to_owned());
    format!("/rest/v1/system/{plural}/{uuid}")
}

fn json_to_value(column: &Column, json: &Json) -> Result<Value> {
    use crate::schema::ColumnType;

    let value = match (column.ty, json) {
        (_, Json::Null) => Value::Null,
        (ColumnType::Int, Json::Number(n)) => Value::Int(
            n.as_i64()
                .ok_or_else(|| Error::DataValidationFailed(format!("column `{}` expects an integer", column.name)))?,
        ),
        (ColumnType::Real, Json::Number(n)) => Value::Real(
            n.as_f64()
                .ok_or_else(|| Error::DataValidationFailed(format!("column `{}` expects a number", column.name)))?,
        ),
        (ColumnType::Bool, Json::Bool(b)) => Value::Bool(*b),
        (ColumnType::String, Json::String(s)) => Value::String(s.clone()),
        (ColumnType::Uuid, Json::String(s)) => Value::Uuid(
            Uuid::parse_str(s).map_err(|_| Error::DataValidationFailed(format!("column `{}` expects a uuid", column.name)))?,
        ),
        _ => return Err(Error::DataValidationFailed(format!("column `{}` has the wrong type", column.name))),
    };

    if let (Some((min, max)), Value::Int(_) | Value::Real(_)) = (column.range, &value) {
        let n = match value {
            Value::Int(i) => i as f64,
            Value::Real(r) => r,
            _ => unreachable!(),
        };
        if n < min || n > max {
            return Err(Error::DataValidationFailed(format!(
                "column `{}` out of range [{min}, {max}]",
                column.name
            )));
        }
    }
    if let (Some(allowed), Value::String(s)) = (&column.enum_values, &value) {
        if !allowed.contains(s) {
            return Err(Error::DataValidationFailed(format!(
                "column `{}` must be one of {allowed:?}",
                column.name
            )));
        }
    }
    Ok(value)
}

fn resolve_uri_to_uuid(schema: &Schema, idl: &MemoryIdl, raw_uri: &str, expected_table: &str) -> Result<Uuid> {
    let resource =
        uri::resolve(raw_uri, schema, idl).map_err(|_| Error::DataValidationFailed(format!("unresolvable reference URI `{raw_uri}`")))?;
    let terminal = resource.terminal();
    let Some(row) = terminal.row else {
        return Err(Error::DataValidationFailed(format!("reference URI `{raw_uri}` is not a single resource")));
    };
    if terminal.table != expected_table {
        return Err(Error::DataValidationFailed(format!(
            "reference URI `{raw_uri}` resolves to `{}`, expected `{expected_table}`",
            terminal.table
        )));
    }
    Ok(row)
}

/// Resolve a reference column's incoming JSON (URIs) into internal `Value`s,
/// per the cardinality rules of spec.md §4.5.
fn resolve_ref_value(schema: &Schema, idl: &MemoryIdl, reference: &Reference, json: &Json) -> Result<Value> {
    if reference.n_max == 1 {
        return match json {
            Json::Null => Ok(Value::Null),
            Json::String(uri) => Ok(Value::Uuid(resolve_uri_to_uuid(schema, idl, uri, &reference.ref_table)?)),
            _ => Err(Error::DataValidationFailed(format!(
                "column `{}` expects a single reference URI",
                reference.column.name
            ))),
        };
    }
    if reference.kv_type {
        let Json::Object(map) = json else {
            return Err(Error::DataValidationFailed(format!("column `{}` expects a key/value map", reference.column.name)));
        };
        let mut out = IndexMap::new();
        for (key, uri_json) in map {
            let Json::String(uri) = uri_json else {
                return Err(Error::DataValidationFailed(format!("column `{}` values must be URIs", reference.column.name)));
            };
            out.insert(key.clone(), Value::Uuid(resolve_uri_to_uuid(schema, idl, uri, &reference.ref_table)?));
        }
        return Ok(Value::Map(out));
    }
    let Json::Array(items) = json else {
        return Err(Error::DataValidationFailed(format!("column `{}` expects a list of URIs", reference.column.name)));
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Json::String(uri) = item else {
            return Err(Error::DataValidationFailed(format!("column `{}` items must be URIs", reference.column.name)));
        };
        out.push(Value::Uuid(resolve_uri_to_uuid(schema, idl, uri, &reference.ref_table)?));
    }
    Ok(Value::List(out))
}

fn reference_to_uri_json(schema: &Schema, reference: &Reference, value: &Value) -> Json {
    let to_uri = |uuid: Uuid| Json::String(uri_for_row(schema, &reference.ref_table, uuid));
    match value {
        Value::List(items) => Json::Array(items.iter().filter_map(|v| v.as_uuid()).map(to_uri).collect()),
        Value::Map(map) if reference.kv_type => {
            let mut obj = Map::new();
            for (k, v) in map {
                if let Some(u) = v.as_uuid() {
                    obj.insert(k.clone(), to_uri(u));
                }
            }
            Json::Object(obj)
        }
        Value::Map(map) => Json::Array(map.values().filter_map(|v| v.as_uuid()).map(to_uri).collect()),
        other => other.as_uuid().map(to_uri).unwrap_or(Json::Null),
    }
}

fn empty_reference_value(reference: &Reference) -> Value {
    if reference.n_max == 1 {
        Value::Null
    } else if reference.kv_type {
        Value::Map(IndexMap::new())
    } else {
        Value::List(Vec::new())
    }
}

fn add_to_reference(idl: &MemoryIdl, txn: &Transaction, table: &str, row: Uuid, column: &str, target: Uuid) {
    let current = idl.row(table, row).and_then(|r| r.get(column)).unwrap_or_else(|| Value::List(Vec::new()));
    let updated = match current {
        Value::List(mut items) => {
            items.push(Value::Uuid(target));
            Value::List(items)
        }
        Value::Map(map) => Value::Map(map),
        _ => Value::Uuid(target),
    };
    let mut cols = IndexMap::new();
    cols.insert(column.to_owned(), updated);
    txn.update(table, row, cols);
}

fn remove_from_reference(idl: &MemoryIdl, txn: &Transaction, table: &str, row: Uuid, column: &str, target: Uuid) {
    let Some(current) = idl.row(table, row).and_then(|r| r.get(column)) else {
        return;
    };
    let updated = match current {
        Value::List(items) => Value::List(items.into_iter().filter(|v| v.as_uuid() != Some(target)).collect()),
        Value::Map(map) => Value::Map(map.into_iter().filter(|(_, v)| v.as_uuid() != Some(target)).collect()),
        Value::Uuid(u) if u == target => Value::Null,
        other => other,
    };
    let mut cols = IndexMap::new();
    cols.insert(column.to_owned(), updated);
    txn.update(table, row, cols);
}

/// POST a new row under a collection resource.
pub fn create(schema: &Schema, idl: &MemoryIdl, txn: &Transaction, resource: &Resource, body: &Json) -> Result<(Uuid, Vec<PendingChange>)> {
    let target = resource.terminal();
    if !target.is_collection() {
        return Err(Error::MethodNotAllowed);
    }
    let table = schema.table(&target.table).ok_or(Error::ResourceNotFound)?;

    let cat = parent_ref_category(table, None);
    if table.is_immutable(cat == Category::Configuration) {
        return Err(Error::MethodNotAllowed);
    }

    let obj = body.as_object().ok_or_else(|| Error::DataValidationFailed("expected a JSON object".into()))?;
    let configuration = obj
        .get("configuration")
        .and_then(Json::as_object)
        .ok_or_else(|| Error::DataValidationFailed("missing `configuration`".into()))?;

    let mut values = IndexMap::new();
    for (name, column) in &table.columns {
        let value = match configuration.get(name) {
            Some(json) => json_to_value(column, json)?,
            None => column.empty_value.clone().unwrap_or(Value::Null),
        };
        values.insert(name.clone(), value);
    }
    for (name, reference) in &table.references {
        if reference.relation == Relation::Parent {
            continue;
        }
        if let Some(json) = configuration.get(name) {
            values.insert(name.clone(), resolve_ref_value(schema, idl, reference, json)?);
        }
    }

    let parent = parent_context(resource);
    if target.relation == ResourceRelation::BackReference {
        if let Some((parent_table, parent_uuid)) = parent {
            if let Some((col_name, _)) = table.references.iter().find(|(_, r)| r.relation == Relation::Parent && r.ref_table == parent_table) {
                values.insert(col_name.clone(), Value::Uuid(parent_uuid));
            }
        }
    }

    let uuid = Uuid::new_v4();
    txn.insert(&table.name, Row { uuid, values });

    let mut changes = vec![PendingChange {
        op: WriteOp::Create,
        table: table.name.clone(),
        row: uuid,
        parent_table: parent.map(|p| p.0.to_owned()),
        parent_row: parent.map(|p| p.1),
    }];

    if target.relation == ResourceRelation::Child {
        if let (Some((parent_table, parent_uuid)), Some(col)) = (parent, target.column.as_deref()) {
            add_to_reference(idl, txn, parent_table, parent_uuid, col, uuid);
            changes.push(PendingChange {
                op: WriteOp::Update,
                table: parent_table.to_owned(),
                row: parent_uuid,
                parent_table: None,
                parent_row: None,
            });
        }
    }

    if let Some(referenced_by) = obj.get("referenced_by").and_then(Json::as_array) {
        for entry in referenced_by {
            let uri = entry
                .get("uri")
                .and_then(Json::as_str)
                .ok_or_else(|| Error::DataValidationFailed("referenced_by entry missing `uri`".into()))?;
            let target_resource =
                uri::resolve(uri, schema, idl).map_err(|_| Error::DataValidationFailed(format!("unresolvable referenced_by URI `{uri}`")))?;
            let terminal = target_resource.terminal();
            let target_row = terminal
                .row
                .ok_or_else(|| Error::DataValidationFailed("referenced_by URI must reference a row".into()))?;
            let target_table = schema.table(&terminal.table).ok_or(Error::ResourceNotFound)?;
            let ref_col = target_table
                .references
                .iter()
                .find(|(_, r)| r.ref_table == table.name && r.relation != Relation::Parent)
                .map(|(n, _)| n.clone())
                .ok_or_else(|| Error::DataValidationFailed("referenced_by target has no matching reference column".into()))?;
            add_to_reference(idl, txn, &terminal.table, target_row, &ref_col, uuid);
            changes.push(PendingChange {
                op: WriteOp::Update,
                table: terminal.table.clone(),
                row: target_row,
                parent_table: None,
                parent_row: None,
            });
        }
    }

    Ok((uuid, changes))
}

/// PUT: full replace of the configuration-category view.
pub fn replace(schema: &Schema, idl: &MemoryIdl, txn: &Transaction, resource: &Resource, body: &Json) -> Result<Vec<PendingChange>> {
    let target = resource.terminal();
    if target.is_collection() {
        return Err(Error::MethodNotAllowed);
    }
    let table = schema.table(&target.table).ok_or(Error::ResourceNotFound)?;
    let uuid = target.row.ok_or(Error::ResourceNotFound)?;
    let row = idl.row(&table.name, uuid).ok_or(Error::ResourceNotFound)?;

    let cat = parent_ref_category(table, Some(&row));
    if table.is_immutable(cat == Category::Configuration) {
        return Err(Error::MethodNotAllowed);
    }

    let obj = body
        .get("configuration")
        .and_then(Json::as_object)
        .ok_or_else(|| Error::DataValidationFailed("missing `configuration`".into()))?;

    let known: HashSet<&str> = table
        .columns
        .keys()
        .map(String::as_str)
        .chain(
            table
                .references
                .iter()
                .filter(|(_, r)| r.relation != Relation::Parent)
                .map(|(n, _)| n.as_str()),
        )
        .collect();
    for key in obj.keys() {
        if !known.contains(key.as_str()) {
            return Err(Error::DataValidationFailed(format!("unknown key `{key}`")));
        }
    }

    let mut changed = IndexMap::new();
    for (name, column) in &table.columns {
        if effective_category(table, name, &|c| row.get(c)) != Category::Configuration {
            continue;
        }
        match obj.get(name) {
            Some(json) if column.mutable => {
                changed.insert(name.clone(), json_to_value(column, json)?);
            }
            Some(json) => {
                let incoming = json_to_value(column, json)?;
                if incoming != row.get(name).unwrap_or(Value::Null) {
                    return Err(Error::DataValidationFailed(format!("column `{name}` is immutable")));
                }
            }
            None if column.mutable => {
                changed.insert(name.clone(), column.empty_value.clone().unwrap_or(Value::Null));
            }
            None => {}
        }
    }
    for (name, reference) in &table.references {
        if reference.relation == Relation::Parent {
            continue;
        }
        if effective_category(table, name, &|c| row.get(c)) != Category::Configuration {
            continue;
        }
        match obj.get(name) {
            Some(json) => {
                changed.insert(name.clone(), resolve_ref_value(schema, idl, reference, json)?);
            }
            None => {
                changed.insert(name.clone(), empty_reference_value(reference));
            }
        }
    }

    txn.update(&table.name, uuid, changed);
    let parent = parent_context(resource);
    Ok(vec![PendingChange {
        op: WriteOp::Update,
        table: table.name.clone(),
        row: uuid,
        parent_table: parent.map(|p| p.0.to_owned()),
        parent_row: parent.map(|p| p.1),
    }])
}

/// PATCH: RFC 6902 ops applied to the configuration view, then folded
/// through the same read-modify-write path as PUT.
pub fn patch(schema: &Schema, idl: &MemoryIdl, txn: &Transaction, resource: &Resource, ops: &[PatchOp]) -> Result<Vec<PendingChange>> {
    let target = resource.terminal();
    let table = schema.table(&target.table).ok_or(Error::ResourceNotFound)?;
    let uuid = target.row.ok_or(Error::ResourceNotFound)?;
    let row = idl.row(&table.name, uuid).ok_or(Error::ResourceNotFound)?;

    let mut config = Map::new();
    for (name, _column) in &table.columns {
        if effective_category(table, name, &|c| row.get(c)) == Category::Configuration {
            config.insert(name.clone(), row.get(name).unwrap_or(Value::Null).to_json());
        }
    }
    for (name, reference) in &table.references {
        if reference.relation == Relation::Parent {
            continue;
        }
        if effective_category(table, name, &|c| row.get(c)) == Category::Configuration {
            let value = row.get(name).unwrap_or(Value::Null);
            config.insert(name.clone(), reference_to_uri_json(schema, reference, &value));
        }
    }

    let mut document = Json::Object(config);
    for op in ops {
        apply_patch_op(&mut document, op)?;
    }

    let body = serde_json::json!({ "configuration": document });
    replace(schema, idl, txn, resource, &body)
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn pointer_tokens(path: &str) -> Vec<String> {
    path.split('/').skip(1).map(unescape_token).collect()
}

fn pointer_get<'a>(doc: &'a Json, path: &str) -> Result<&'a Json> {
    let mut cursor = doc;
    for token in pointer_tokens(path) {
        cursor = descend(cursor, &token, path)?;
    }
    Ok(cursor)
}

fn descend<'a>(node: &'a Json, token: &str, path: &str) -> Result<&'a Json> {
    match node {
        Json::Object(map) => map.get(token).ok_or_else(|| Error::DataValidationFailed(format!("no such path `{path}`"))),
        Json::Array(arr) => {
            let idx: usize = token.parse().map_err(|_| Error::DataValidationFailed(format!("bad array index in `{path}`")))?;
            arr.get(idx).ok_or_else(|| Error::DataValidationFailed(format!("index out of range in `{path}`")))
        }
        _ => Err(Error::DataValidationFailed(format!("cannot descend into a scalar at `{path}`"))),
    }
}

fn pointer_parent_mut<'a>(doc: &'a mut Json, path: &str) -> Result<(&'a mut Json, String)> {
    let tokens = pointer_tokens(path);
    let (last, prefix) = tokens
        .split_last()
        .ok_or_else(|| Error::DataValidationFailed("cannot operate on the document root".into()))?;
    let mut cursor = doc;
    for token in prefix {
        cursor = match cursor {
            Json::Object(map) => map.get_mut(token).ok_or_else(|| Error::DataValidationFailed(format!("no such path `{path}`")))?,
            Json::Array(arr) => {
                let idx: usize = token.parse().map_err(|_| Error::DataValidationFailed(format!("bad array index in `{path}`")))?;
                arr.get_mut(idx).ok_or_else(|| Error::DataValidationFailed(format!("index out of range in `{path}`")))?
            }
            _ => return Err(Error::DataValidationFailed(format!("cannot descend into a scalar at `{path}`"))),
        };
    }
    Ok((cursor, last.clone()))
}

fn apply_patch_op(doc: &mut Json, op: &PatchOp) -> Result<()> {
    match op.op.as_str() {
        "add" => pointer_add(doc, &op.path, op.value.clone()),
        "remove" => pointer_remove(doc, &op.path).map(|_| ()),
        "replace" => pointer_replace(doc, &op.path, op.value.clone()),
        "test" => {
            if pointer_get(doc, &op.path)? != &op.value {
                return Err(Error::DataValidationFailed(format!("patch test failed at `{}`", op.path)));
            }
            Ok(())
        }
        "move" => {
            let value = pointer_remove(doc, &op.from)?;
            pointer_add(doc, &op.path, value)
        }
        "copy" => {
            let value = pointer_get(doc, &op.from)?.clone();
            pointer_add(doc, &op.path, value)
        }
        other => Err(Error::DataValidationFailed(format!("unknown patch op `{other}`"))),
    }
}

fn pointer_add(doc: &mut Json, path: &str, value: Json) -> Result<()> {
    let (parent, key) = pointer_parent_mut(doc, path)?;
    match parent {
        Json::Object(map) => {
            map.insert(key, value);
            Ok(())
        }
        Json::Array(arr) => {
            if key == "-" {
                arr.push(value);
                return Ok(());
            }
            let idx: usize = key.parse().map_err(|_| Error::DataValidationFailed(format!("bad array index in `{path}`")))?;
            if idx > arr.len() {
                return Err(Error::DataValidationFailed(format!("index out of range in `{path}`")));
            }
            arr.insert(idx, value);
            Ok(())
        }
        _ => Err(Error::DataValidationFailed(format!("cannot add into a scalar at `{path}`"))),
    }
}

fn pointer_replace(doc: &mut Json, path: &str, value: Json) -> Result<()> {
    let (parent, key) = pointer_parent_mut(doc, path)?;
    match parent {
        Json::Object(map) => {
            if !map.contains_key(&key) {
                return Err(Error::DataValidationFailed(format!("no such path `{path}`")));
            }
            map.insert(key, value);
            Ok(())
        }
        Json::Array(arr) => {
            let idx: usize = key.parse().map_err(|_| Error::DataValidationFailed(format!("bad array index in `{path}`")))?;
            if idx >= arr.len() {
                return Err(Error::DataValidationFailed(format!("index out of range in `{path}`")));
            }
            arr[idx] = value;
            Ok(())
        }
        _ => Err(Error::DataValidationFailed(format!("cannot replace a scalar at `{path}`"))),
    }
}

fn pointer_remove(doc: &mut Json, path: &str) -> Result<Json> {
    let (parent, key) = pointer_parent_mut(doc, path)?;
    match parent {
        Json::Object(map) => map.remove(&key).ok_or_else(|| Error::DataValidationFailed(format!("no such path `{path}`"))),
        Json::Array(arr) => {
            let idx: usize = key.parse().map_err(|_| Error::DataValidationFailed(format!("bad array index in `{path}`")))?;
            if idx >= arr.len() {
                return Err(Error::DataValidationFailed(format!("index out of range in `{path}`")));
            }
            Ok(arr.remove(idx))
        }
        _ => Err(Error::DataValidationFailed(format!("cannot remove from a scalar at `{path}`"))),
    }
}

/// DELETE: recursive removal following child and back-reference edges.
pub fn delete(schema: &Schema, idl: &MemoryIdl, txn: &Transaction, resource: &Resource) -> Result<Vec<PendingChange>> {
    let target = resource.terminal();
    let table = schema.table(&target.table).ok_or(Error::ResourceNotFound)?;
    let uuid = target.row.ok_or(Error::ResourceNotFound)?;
    let row = idl.row(&table.name, uuid).ok_or(Error::ResourceNotFound)?;

    let cat = parent_ref_category(table, Some(&row));
    if table.is_immutable(cat == Category::Configuration) {
        return Err(Error::MethodNotAllowed);
    }

    let parent = parent_context(resource);
    let mut changes = Vec::new();
    let deleted = delete_recursive(schema, idl, txn, &table.name, uuid, parent, &mut changes)?;
    if !deleted {
        return Err(Error::DataValidationFailed("a required child resource could not be removed".into()));
    }
    Ok(changes)
}

fn delete_recursive(
    schema: &Schema,
    idl: &MemoryIdl,
    txn: &Transaction,
    table_name: &str,
    uuid: Uuid,
    parent: Option<(&str, Uuid)>,
    changes: &mut Vec<PendingChange>,
) -> Result<bool> {
    let table = schema.table(table_name).ok_or(Error::ResourceNotFound)?;
    let row = idl.row(table_name, uuid).ok_or(Error::ResourceNotFound)?;

    for (col_name, child_table_name) in &table.children {
        if effective_category(table, col_name, &|c| row.get(c)) != Category::Configuration {
            continue;
        }
        let Some(child_table) = schema.table(child_table_name) else { continue };
        if child_table.is_immutable(true) {
            continue;
        }
        let candidates: Vec<Uuid> = match row.get(col_name) {
            Some(Value::List(items)) => items.iter().filter_map(|v| v.as_uuid()).collect(),
            Some(Value::Map(map)) => map.values().filter_map(|v| v.as_uuid()).collect(),
            Some(v) => v.as_uuid().into_iter().collect(),
            None => Vec::new(),
        };
        let mut all_deleted = true;
        for child_uuid in candidates {
            all_deleted &= delete_recursive(schema, idl, txn, child_table_name, child_uuid, Some((table_name, uuid)), changes)?;
        }
        if !all_deleted {
            return Ok(false);
        }
    }

    if let Some(back_refs) = schema.reference_map.get(table_name).cloned() {
        for (child_table_name, col_name) in &back_refs {
            let Some(child_table) = schema.table(child_table_name) else { continue };
            let Some(reference) = child_table.references.get(col_name) else { continue };
            if reference.relation != Relation::Parent {
                continue;
            }
            if child_table.is_immutable(true) {
                continue;
            }
            let mut all_deleted = true;
            for child_row in idl.rows(child_table_name) {
                if child_row.get(col_name).and_then(|v| v.as_uuid()) != Some(uuid) {
                    continue;
                }
                if effective_category(child_table, col_name, &|c| child_row.get(c)) != Category::Configuration {
                    continue;
                }
                all_deleted &= delete_recursive(schema, idl, txn, child_table_name, child_row.uuid, Some((table_name, uuid)), changes)?;
            }
            if !all_deleted {
                return Ok(false);
            }
        }
    }

    if table.parent.is_none() {
        if let Some(referencers) = schema.reference_map.get(table_name).cloned() {
            for (ref_table_name, col_name) in &referencers {
                let Some(ref_table) = schema.table(ref_table_name) else { continue };
                let Some(reference) = ref_table.references.get(col_name) else { continue };
                if reference.relation == Relation::Parent {
                    continue;
                }
                for r in idl.rows(ref_table_name) {
                    remove_from_reference(idl, txn, ref_table_name, r.uuid, col_name, uuid);
                }
            }
        }
    }

    txn.delete(table_name, uuid);
    changes.push(PendingChange {
        op: WriteOp::Delete,
        table: table_name.to_owned(),
        row: uuid,
        parent_table: parent.map(|p| p.0.to_owned()),
        parent_row: parent.map(|p| p.1),
    });
    Ok(true)
}

fn find_existing_by_key(idl: &MemoryIdl, table: &Table, key: &str) -> Option<Uuid> {
    if table.index_columns.is_empty() {
        return None;
    }
    let parts: Vec<String> = key.split('/').map(str::to_owned).collect();
    idl.index_to_row(&table.name, &table.index_columns, &parts).map(|r| r.uuid)
}

/// Declarative full-config replace (spec.md §4.5): two passes over every
/// non-root table, breaking the bootstrap cycle between row creation and
/// reference wiring.
pub fn full_configuration(schema: &Schema, idl: &MemoryIdl, txn: &Transaction, body: &Json) -> Result<Vec<PendingChange>> {
    let root = body
        .as_object()
        .ok_or_else(|| Error::DataValidationFailed("full-configuration body must be an object".into()))?;
    let mut changes = Vec::new();
    let mut created: HashMap<(String, String), Uuid> = HashMap::new();

    for (table_name, table) in &schema.tables {
        if table.is_root {
            continue;
        }
        let Some(rows_in_body) = root.get(&table.plural_name).and_then(Json::as_object) else {
            if table.parent.is_none() {
                for row in idl.rows(table_name) {
                    txn.delete(table_name, row.uuid);
                    changes.push(PendingChange {
                        op: WriteOp::Delete,
                        table: table_name.clone(),
                        row: row.uuid,
                        parent_table: None,
                        parent_row: None,
                    });
                }
            }
            continue;
        };

        for (key, row_body) in rows_in_body {
            let Some(configuration) = row_body.get("configuration").and_then(Json::as_object) else {
                continue;
            };
            let existing = find_existing_by_key(idl, table, key);
            let uuid = match existing {
                Some(uuid) => {
                    let row = idl.row(table_name, uuid).ok_or(Error::ResourceNotFound)?;
                    let cat = parent_ref_category(table, Some(&row));
                    if table.is_immutable(cat == Category::Configuration) {
                        continue;
                    }
                    let mut cols = IndexMap::new();
                    for (name, column) in &table.columns {
                        if let Some(json) = configuration.get(name) {
                            cols.insert(name.clone(), json_to_value(column, json)?);
                        }
                    }
                    txn.update(table_name, uuid, cols);
                    changes.push(PendingChange {
                        op: WriteOp::Update,
                        table: table_name.clone(),
                        row: uuid,
                        parent_table: None,
                        parent_row: None,
                    });
                    uuid
                }
                None => {
                    let mut values = IndexMap::new();
                    for (name, column) in &table.columns {
                        let value = match configuration.get(name) {
                            Some(json) => json_to_value(column, json)?,
                            None => column.empty_value.clone().unwrap_or(Value::Null),
                        };
                        values.insert(name.clone(), value);
                    }
                    let uuid = Uuid::new_v4();
                    let probe = Row { uuid, values: values.clone() };
                    let cat = parent_ref_category(table, Some(&probe));
                    if table.is_immutable(cat == Category::Configuration) {
                        // Pass 1 has no reference wiring yet to know this for
                        // certain until the row exists; insert then roll it
                        // straight back out rather than leave it wired in
                        // pass 2 (spec.md §4.5 invariant 3).
                        txn.insert(table_name, Row { uuid, values });
                        txn.delete(table_name, uuid);
                        continue;
                    }
                    txn.insert(table_name, Row { uuid, values });
                    changes.push(PendingChange {
                        op: WriteOp::Create,
                        table: table_name.clone(),
                        row: uuid,
                        parent_table: None,
                        parent_row: None,
                    });
                    uuid
                }
            };
            created.insert((table_name.clone(), key.clone()), uuid);
        }
    }

    for (table_name, table) in &schema.tables {
        if table.is_root {
            continue;
        }
        let Some(rows_in_body) = root.get(&table.plural_name).and_then(Json::as_object) else {
            continue;
        };
        for (key, row_body) in rows_in_body {
            let Some(&uuid) = created.get(&(table_name.clone(), key.clone())) else {
                continue;
            };
            let Some(configuration) = row_body.get("configuration").and_then(Json::as_object) else {
                continue;
            };
            let mut cols = IndexMap::new();
            for (name, reference) in &table.references {
                if reference.relation == Relation::Parent {
                    continue;
                }
                if let Some(json) = configuration.get(name) {
                    cols.insert(name.clone(), resolve_ref_value(schema, idl, reference, json)?);
                }
            }
            if !cols.is_empty() {
                txn.update(table_name, uuid, cols);
            }
        }
    }

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idl::MemoryIdl;
    use crate::testutil;
    use crate::uri;
    use pretty_assertions::assert_eq;

    fn setup() -> (Schema, MemoryIdl, Uuid) {
        let schema = testutil::schema();
        let idl = MemoryIdl::new();
        testutil::seed_system(&idl);
        let vrf = testutil::insert_vrf(&idl, "vrf_default");
        (schema, idl, vrf)
    }

    #[test]
    fn creates_replaces_and_deletes_a_bgp_router() {
        let (schema, idl, _vrf) = setup();
        let collection = uri::resolve("/rest/v1/system/vrfs/vrf_default/bgp_routers", &schema, &idl).unwrap();

        let txn = idl.open_transaction();
        let body = serde_json::json!({"configuration": {"asn": 6004, "router_id": "10.10.0.4", "deterministic_med": false}});
        let (row, changes) = create(&schema, &idl, &txn, &collection, &body).unwrap();
        assert_eq!(changes.len(), 1);
        idl.commit(&txn);

        let fetched = idl.row("BgpRouter", row).unwrap();
        assert_eq!(fetched.get("router_id"), Some(Value::String("10.10.0.4".to_owned())));

        let instance = uri::resolve("/rest/v1/system/vrfs/vrf_default/bgp_routers/6004", &schema, &idl).unwrap();
        let replace_body = serde_json::json!({"configuration": {"asn": 6004, "router_id": "10.10.1.4", "deterministic_med": true}});
        let txn2 = idl.open_transaction();
        replace(&schema, &idl, &txn2, &instance, &replace_body).unwrap();
        idl.commit(&txn2);
        let updated = idl.row("BgpRouter", row).unwrap();
        assert_eq!(updated.get("router_id"), Some(Value::String("10.10.1.4".to_owned())));

        // PUT idempotence (spec.md §8 invariant 4): re-applying the same body leaves the row unchanged.
        let txn3 = idl.open_transaction();
        replace(&schema, &idl, &txn3, &instance, &replace_body).unwrap();
        idl.commit(&txn3);
        let unchanged = idl.row("BgpRouter", row).unwrap();
        assert_eq!(unchanged.get("router_id"), updated.get("router_id"));
        assert_eq!(unchanged.get("deterministic_med"), updated.get("deterministic_med"));

        let txn4 = idl.open_transaction();
        delete(&schema, &idl, &txn4, &instance).unwrap();
        idl.commit(&txn4);
        assert!(idl.row("BgpRouter", row).is_none());
    }

    #[test]
    fn post_on_an_immutable_table_is_refused() {
        let (schema, idl, vrf) = setup();
        testutil::insert_route(&idl, vrf, "connected", "192.168.2.0/16", 0);

        let collection = uri::resolve("/rest/v1/system/vrfs/vrf_default/routes", &schema, &idl).unwrap();
        let txn = idl.open_transaction();
        let body = serde_json::json!({"configuration": {"from": "static", "prefix": "10.0.0.0/8"}});
        let err = create(&schema, &idl, &txn, &collection, &body).unwrap_err();
        assert!(matches!(err, Error::MethodNotAllowed));
    }

    #[test]
    fn delete_on_an_immutable_table_is_refused() {
        let (schema, idl, vrf) = setup();
        let route = testutil::insert_route(&idl, vrf, "connected", "192.168.2.0/16", 0);
        let instance = uri::resolve("/rest/v1/system/vrfs/vrf_default/routes/connected/192.168.2.0%2F16", &schema, &idl).unwrap();

        let txn = idl.open_transaction();
        let err = delete(&schema, &idl, &txn, &instance).unwrap_err();
        assert!(matches!(err, Error::MethodNotAllowed));
        assert!(idl.row("Route", route).is_some());
    }

    #[test]
    fn delete_cascades_to_bgp_neighbors() {
        let (schema, idl, vrf) = setup();
        let router = testutil::insert_bgp_router(&idl, vrf, 6004, "10.10.0.4");
        let neighbor = testutil::insert_bgp_neighbor(&idl, router, "172.17.0.3", 6008);

        let instance = uri::resolve("/rest/v1/system/vrfs/vrf_default/bgp_routers/6004", &schema, &idl).unwrap();
        let txn = idl.open_transaction();
        delete(&schema, &idl, &txn, &instance).unwrap();
        idl.commit(&txn);

        assert!(idl.row("BgpRouter", router).is_none());
        assert!(idl.row("BgpNeighbor", neighbor).is_none());
    }

    #[test]
    fn full_configuration_creates_and_updates_mutable_rows() {
        let (schema, idl, _vrf) = setup();
        let body = serde_json::json!({
            "bgp_routers": {
                "6004": {"configuration": {"asn": 6004, "router_id": "10.10.0.4", "deterministic_med": false}}
            }
        });
        let txn = idl.open_transaction();
        let changes = full_configuration(&schema, &idl, &txn, &body).unwrap();
        assert_eq!(changes.len(), 1);
        idl.commit(&txn);
        let router = idl.rows("BgpRouter").into_iter().next().unwrap();
        assert_eq!(router.get("router_id"), Some(Value::String("10.10.0.4".to_owned())));

        let body2 = serde_json::json!({
            "bgp_routers": {
                "6004": {"configuration": {"asn": 6004, "router_id": "10.10.1.4", "deterministic_med": true}}
            }
        });
        let txn2 = idl.open_transaction();
        let changes2 = full_configuration(&schema, &idl, &txn2, &body2).unwrap();
        assert_eq!(changes2.len(), 1);
        idl.commit(&txn2);
        let updated = idl.row("BgpRouter", router.uuid).unwrap();
        assert_eq!(updated.get("router_id"), Some(Value::String("10.10.1.4".to_owned())));
    }

    /// A child whose table is immutable (spec.md §4.5 invariant 3) is
    /// inserted and rolled straight back out during pass 1, rather than
    /// surviving into pass 2's reference wiring.
    #[test]
    fn full_configuration_rolls_back_an_immutable_table_row() {
        let (schema, idl, _vrf) = setup();
        let body = serde_json::json!({
            "routes": {
                "connected/10": {"configuration": {"from": "connected", "prefix": "10", "metric": 0}}
            }
        });
        let txn = idl.open_transaction();
        let changes = full_configuration(&schema, &idl, &txn, &body).unwrap();
        assert!(changes.is_empty());
        idl.commit(&txn);
        assert!(idl.rows("Route").is_empty());
    }

    #[test]
    fn full_configuration_skips_updating_an_existing_immutable_row() {
        let (schema, idl, vrf) = setup();
        let route = testutil::insert_route(&idl, vrf, "connected", "192", 0);

        let body = serde_json::json!({
            "routes": {
                "connected/192": {"configuration": {"from": "connected", "prefix": "192", "metric": 5}}
            }
        });
        let txn = idl.open_transaction();
        let changes = full_configuration(&schema, &idl, &txn, &body).unwrap();
        assert!(changes.is_empty());
        idl.commit(&txn);
        let unchanged = idl.row("Route", route).unwrap();
        assert_eq!(unchanged.get("metric"), Some(Value::Int(0)));
    }
}
