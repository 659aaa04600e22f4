//! URI Resolver (spec.md §4.3) — translates a REST path into a linked chain
//! of `Resource` nodes, each traversing the Schema Model + DB Adapter.
//!
//! Grounded on `original_source/opsrest/parse.py` and `resource.py`.

use percent_encoding::percent_decode_str;
use uuid::Uuid;

use crate::idl::{MemoryIdl, Row};
use crate::schema::{Relation, Schema, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRelation {
    /// Root of the chain: the singleton System table.
    Root,
    /// A forward-reference column in the parent table points at this node.
    Child,
    /// The child table points back at the parent via a back-reference column.
    BackReference,
    /// Reached directly from System, with no parent reference column.
    TopLevel,
}

/// One step of a parsed URI: a table, optionally a concrete row, and the
/// relation that connects it to the next node in the chain.
#[derive(Debug, Clone)]
pub struct Resource {
    pub table: String,
    pub row: Option<Uuid>,
    /// For a collection node reached via a key/value or scalar-list forward
    /// reference, the index under the parent's column.
    pub index: Option<String>,
    pub column: Option<String>,
    pub relation: ResourceRelation,
    pub next: Option<Box<Resource>>,
}

impl Resource {
    fn leaf(table: &str, relation: ResourceRelation) -> Self {
        Resource {
            table: table.to_owned(),
            row: None,
            index: None,
            column: None,
            relation,
            next: None,
        }
    }

    pub fn is_collection(&self) -> bool {
        self.row.is_none()
    }

    /// Walk to the terminal node of the chain.
    pub fn terminal(&self) -> &Resource {
        match &self.next {
            Some(n) => n.terminal(),
            None => self,
        }
    }

    pub fn terminal_mut(&mut self) -> &mut Resource {
        if self.next.is_some() {
            self.next.as_mut().unwrap().terminal_mut()
        } else {
            self
        }
    }
}

pub const SYSTEM_TABLE: &str = "System";

#[derive(Debug, thiserror::Error)]
pub enum UriError {
    #[error("not found")]
    NotFound,
}

/// Parse an absolute path of the form `/rest/v1/system[/...]`.
pub fn resolve(path: &str, schema: &Schema, idl: &MemoryIdl) -> Result<Resource, UriError> {
    let path = path.strip_prefix("/rest/v1").ok_or(UriError::NotFound)?;
    let segments = split_path(path);
    if segments.is_empty() || segments[0] != "system" {
        return Err(UriError::NotFound);
    }

    let system_rows = idl.rows(SYSTEM_TABLE);
    let system_row = system_rows.first().ok_or(UriError::NotFound)?;
    let mut root = Resource::leaf(SYSTEM_TABLE, ResourceRelation::Root);
    root.row = Some(system_row.uuid);

    let rest = &segments[1..];
    if rest.is_empty() {
        return Ok(root);
    }

    let mut cursor = &mut root;
    let mut remaining = rest;
    loop {
        let table = schema.table(&cursor.table).ok_or(UriError::NotFound)?;
        let segment = &remaining[0];

        if let Some((col_name, reference)) = table
            .references
            .iter()
            .find(|(name, r)| *name == segment && r.relation == Relation::Child)
        {
            let child_table = schema.table(&reference.ref_table).ok_or(UriError::NotFound)?;
            remaining = &remaining[1..];

            let mut child = Resource::leaf(&reference.ref_table, ResourceRelation::Child);
            child.column = Some(col_name.clone());

            if reference.n_max == 1 {
                let parent_row = cursor.row.and_then(|u| idl.row(&cursor.table, u));
                let linked = parent_row.and_then(|r| r.get(col_name));
                let child_uuid = linked.as_ref().and_then(|v| v.as_uuid());
                match child_uuid {
                    Some(u) => child.row = Some(u),
                    None => {
                        if !remaining.is_empty() {
                            return Err(UriError::NotFound);
                        }
                    }
                }
            } else if child_table.indexes.first().map(|i| i.as_slice()) == Some(&["uuid".to_owned()]) {
                if let Some(seg) = remaining.first() {
                    let key = percent_decode_str(seg).decode_utf8_lossy().into_owned();
                    remaining = &remaining[1..];
                    if reference.kv_type {
                        let parent_row = cursor.row.and_then(|u| idl.row(&cursor.table, u));
                        let map = parent_row.and_then(|r| r.get(col_name));
                        let uuid = map
                            .as_ref()
                            .and_then(|v| match v {
                                crate::value::Value::Map(m) => m.get(&key).and_then(|v| v.as_uuid()),
                                _ => None,
                            })
                            .ok_or(UriError::NotFound)?;
                        child.row = Some(uuid);
                        child.index = Some(key);
                    } else {
                        let idx: usize = key.parse().map_err(|_| UriError::NotFound)?;
                        let parent_row = cursor.row.and_then(|u| idl.row(&cursor.table, u));
                        let list = parent_row.and_then(|r| r.get(col_name));
                        let uuid = list
                            .as_ref()
                            .and_then(|v| v.as_list())
                            .and_then(|l| l.get(idx))
                            .and_then(|v| v.as_uuid())
                            .ok_or(UriError::NotFound)?;
                        child.row = Some(uuid);
                        child.index = Some(key);
                    }
                }
            } else {
                let n = child_table.indexes.first().map(|i| i.len()).unwrap_or(1);
                if remaining.len() < n {
                    return Err(UriError::NotFound);
                }
                let key_parts: Vec<String> = remaining[..n]
                    .iter()
                    .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
                    .collect();
                remaining = &remaining[n..];
                let cols = child_table.index_columns.clone();
                let row = idl
                    .index_to_row(&reference.ref_table, &cols, &key_parts)
                    .ok_or(UriError::NotFound)?;
                child.row = Some(row.uuid);
                child.index = Some(key_parts.join("/"));
            }

            cursor.next = Some(Box::new(child));
            cursor = cursor.next.as_mut().unwrap();
        } else if let Some(child_table) = schema.table_by_plural(segment) {
            let relation = classify_relation(table, child_table);
            remaining = &remaining[1..];
            let mut child = Resource::leaf(&child_table.name, relation);

            if relation == ResourceRelation::BackReference {
                child.column = back_reference_column(schema, &child_table.name, &cursor.table);
            }

            if !child_table.index_columns.is_empty() {
                let n = child_table.index_columns.len();
                if !remaining.is_empty() {
                    if remaining.len() < n {
                        return Err(UriError::NotFound);
                    }
                    let key_parts: Vec<String> = remaining[..n]
                        .iter()
                        .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
                        .collect();
                    remaining = &remaining[n..];
                    let row = idl
                        .index_to_row(&child_table.name, &child_table.index_columns, &key_parts)
                        .ok_or(UriError::NotFound)?;
                    child.row = Some(row.uuid);
                    child.index = Some(key_parts.join("/"));
                }
            } else if let Some(seg) = remaining.first() {
                // only-child under a parent: indexed by UUID
                let uuid = Uuid::parse_str(&percent_decode_str(seg).decode_utf8_lossy())
                    .map_err(|_| UriError::NotFound)?;
                remaining = &remaining[1..];
                if idl.row(&child_table.name, uuid).is_none() {
                    return Err(UriError::NotFound);
                }
                child.row = Some(uuid);
            }

            cursor.next = Some(Box::new(child));
            cursor = cursor.next.as_mut().unwrap();
        } else {
            return Err(UriError::NotFound);
        }

        if remaining.is_empty() {
            break;
        }
    }

    Ok(root)
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/').filter(|s| !s.is_empty()).map(str::to_owned).collect()
}

fn classify_relation(current: &Table, target: &Table) -> ResourceRelation {
    if current.name == SYSTEM_TABLE && target.parent.is_none() {
        ResourceRelation::TopLevel
    } else {
        ResourceRelation::BackReference
    }
}

fn back_reference_column(schema: &Schema, child_table: &str, parent_table: &str) -> Option<String> {
    schema.table(child_table).and_then(|t| {
        t.references
            .iter()
            .find(|(_, r)| r.ref_table == parent_table && r.relation == Relation::Parent)
            .map(|(name, _)| name.clone())
    })
}

/// Resolve a resource's row back to a canonical URI string. Used by the read
/// engine (to emit collection-at-depth-0 URIs) and the notification engine
/// (to compute a row's current URI on each tick).
pub fn uri_of(resource_chain: &[(&Table, &Row, ResourceRelation, Option<String>)]) -> String {
    let mut parts = vec!["rest".to_owned(), "v1".to_owned(), "system".to_owned()];
    for (table, _row, relation, index) in resource_chain {
        if *relation == ResourceRelation::Root {
            continue;
        }
        parts.push(table.plural_name.clone());
        if let Some(idx) = index {
            for part in idx.split('/') {
                parts.push(percent_encoding::utf8_percent_encode(part, percent_encoding::NON_ALPHANUMERIC).to_string());
            }
        }
    }
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idl::MemoryIdl;
    use crate::testutil;

    #[test]
    fn resolves_nested_collection_and_instance_uris() {
        let schema = testutil::schema();
        let idl = MemoryIdl::new();
        testutil::seed_system(&idl);
        let vrf = testutil::insert_vrf(&idl, "vrf_default");
        let router = testutil::insert_bgp_router(&idl, vrf, 6004, "10.10.0.4");

        let resolved = resolve("/rest/v1/system/vrfs/vrf_default/bgp_routers/6004", &schema, &idl).unwrap();
        let terminal = resolved.terminal();
        assert_eq!(terminal.table, "BgpRouter");
        assert_eq!(terminal.row, Some(router));

        let collection = resolve("/rest/v1/system/vrfs/vrf_default/bgp_routers", &schema, &idl).unwrap();
        assert!(collection.terminal().is_collection());
        assert_eq!(collection.terminal().table, "BgpRouter");
    }

    #[test]
    fn uri_of_round_trips_through_resolve() {
        let schema = testutil::schema();
        let idl = MemoryIdl::new();
        testutil::seed_system(&idl);
        let vrf = testutil::insert_vrf(&idl, "vrf_default");

        let vrf_table = schema.table("Vrf").unwrap();
        let vrf_row = idl.row("Vrf", vrf).unwrap();
        let uri = uri_of(&[(vrf_table, &vrf_row, ResourceRelation::TopLevel, Some("vrf_default".to_owned()))]);
        assert_eq!(uri, "/rest/v1/system/vrfs/vrf_default");

        let resolved = resolve(&uri, &schema, &idl).unwrap();
        assert_eq!(resolved.terminal().row, Some(vrf));
        assert_eq!(resolved.terminal().table, "Vrf");
    }

    #[test]
    fn composite_index_segments_round_trip_percent_encoding() {
        let schema = testutil::schema();
        let idl = MemoryIdl::new();
        testutil::seed_system(&idl);
        let vrf = testutil::insert_vrf(&idl, "vrf_default");
        let route = testutil::insert_route(&idl, vrf, "connected", "192.168.2.0/16", 0);

        let resolved = resolve("/rest/v1/system/vrfs/vrf_default/routes/connected/192.168.2.0%2F16", &schema, &idl).unwrap();
        assert_eq!(resolved.terminal().row, Some(route));
    }

    #[test]
    fn unknown_segment_is_not_found() {
        let schema = testutil::schema();
        let idl = MemoryIdl::new();
        testutil::seed_system(&idl);
        assert!(matches!(resolve("/rest/v1/system/bogus", &schema, &idl), Err(UriError::NotFound)));
    }
}
