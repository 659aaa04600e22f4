//! Extended schema model (spec.md §3, §4.1).
//!
//! The schema is a JSON document loaded once at startup and never mutated
//! afterward; all "dynamic" behavior (dynamic categories, on-demand
//! classification) is computed on demand from this immutable structure, not
//! by mutating it.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Configuration,
    Status,
    Statistics,
    Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Real,
    Bool,
    String,
    Uuid,
}

/// A column's category may be declared outright, or computed per row.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CategoryRule {
    Static(Category),
    Dynamic(DynamicCategory),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DynamicCategory {
    /// `category = per_value[row.get(this_column)]`, default `configuration`.
    PerValue { per_value: HashMap<String, Category> },
    /// `category` follows the *current* category of another column on the
    /// same row (itself possibly dynamic).
    Follows { follows: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawColumn {
    pub name: String,
    pub category: CategoryRule,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub mutable: bool,
    #[serde(default)]
    pub range: Option<(f64, f64)>,
    #[serde(default, rename = "enum")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub empty_value: Option<crate::value::Value>,
    #[serde(default)]
    pub value_type: Option<ColumnType>,
    #[serde(default)]
    pub keyname: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Child,
    Parent,
    Reference,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawReference {
    #[serde(flatten)]
    pub column: RawColumn,
    pub ref_table: String,
    pub relation: Relation,
    #[serde(default)]
    pub n_min: u32,
    #[serde(default = "one")]
    pub n_max: u32,
    #[serde(default)]
    pub kv_type: bool,
    #[serde(default)]
    pub kv_key_type: Option<ColumnType>,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTable {
    pub name: String,
    pub plural_name: Option<String>,
    #[serde(default)]
    pub is_root: bool,
    #[serde(default)]
    pub is_many: bool,
    #[serde(default)]
    pub index_columns: Vec<String>,
    #[serde(default)]
    pub indexes: Vec<Vec<String>>,
    #[serde(default = "always_true")]
    pub mutable: bool,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub columns: Vec<RawColumn>,
    #[serde(default)]
    pub references: Vec<RawReference>,
}

fn always_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSchema {
    pub tables: Vec<RawTable>,
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown category `{0}`")]
    UnknownCategory(String),
    #[error("table `{table}` column `{column}` follows unknown column `{target}`")]
    UnresolvedFollows {
        table: String,
        column: String,
        target: String,
    },
    #[error("table `{table}` reference `{column}` has n_min {n_min} > n_max {n_max}")]
    ImpossibleCardinality {
        table: String,
        column: String,
        n_min: u32,
        n_max: u32,
    },
    #[error("duplicate table name `{0}`")]
    DuplicateTableName(String),
    #[error("table `{table}` references unknown table `{target}`")]
    UnknownTable { table: String, target: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDemandFetchKind {
    None,
    Partial,
    Full,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub category: CategoryRule,
    pub ty: ColumnType,
    pub optional: bool,
    pub mutable: bool,
    pub range: Option<(f64, f64)>,
    pub enum_values: Option<Vec<String>>,
    pub empty_value: Option<crate::value::Value>,
    pub value_type: Option<ColumnType>,
    pub keyname: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Reference {
    pub column: Column,
    pub ref_table: String,
    pub relation: Relation,
    pub n_min: u32,
    pub n_max: u32,
    pub kv_type: bool,
    pub kv_key_type: Option<ColumnType>,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub plural_name: String,
    pub is_root: bool,
    pub is_many: bool,
    pub index_columns: Vec<String>,
    pub indexes: Vec<Vec<String>>,
    pub mutable: bool,
    pub dynamic: bool,
    pub columns: IndexMap<String, Column>,
    pub references: IndexMap<String, Reference>,
    pub on_demand_fetch_kind: OnDemandFetchKind,
    /// Back-filled after parse: forward-reference column name -> child table.
    pub children: Vec<(String, String)>,
    pub parent: Option<String>,
}

impl Table {
    /// A table is immutable via REST if it has no configuration index column
    /// and either it is a root system table or its parent link isn't
    /// configuration-category.
    pub fn is_immutable(&self, parent_ref_is_configuration: bool) -> bool {
        let has_config_index = self.index_columns.iter().any(|c| {
            self.columns
                .get(c)
                .map(|col| matches!(col.category, CategoryRule::Static(Category::Configuration)))
                .unwrap_or(false)
        });
        if has_config_index {
            return false;
        }
        self.is_root || !parent_ref_is_configuration
    }

    /// Columns that must always be replicated for an on-demand table
    /// (index columns under `partial`), vs `readonly` (fetched on demand).
    pub fn readonly_columns(&self) -> Vec<&str> {
        match self.on_demand_fetch_kind {
            OnDemandFetchKind::None => Vec::new(),
            OnDemandFetchKind::Full => self.columns.keys().map(String::as_str).collect(),
            OnDemandFetchKind::Partial => self
                .columns
                .values()
                .filter(|c| {
                    !self.index_columns.contains(&c.name)
                        && !matches!(c.category, CategoryRule::Static(Category::Configuration))
                })
                .map(|c| c.name.as_str())
                .chain(self.references.keys().map(String::as_str))
                .collect(),
        }
    }
}

/// Static classification of which on-demand tables fetch `partial`ly.
/// See spec.md §4.1.
const PARTIAL_ON_DEMAND_TABLES: &[&str] = &["BGP_Route", "BGP_Nexthop", "Route", "Nexthop"];

#[derive(Debug)]
pub struct Schema {
    pub tables: IndexMap<String, Table>,
    /// For every table T, the set of (table, column) pairs that reference T.
    pub reference_map: HashMap<String, HashSet<(String, String)>>,
}

impl Schema {
    pub fn load(raw: RawSchema) -> Result<Self, SchemaError> {
        let mut tables = IndexMap::new();
        for rt in raw.tables {
            if tables.contains_key(&rt.name) {
                return Err(SchemaError::DuplicateTableName(rt.name));
            }
            let plural_name = rt
                .plural_name
                .clone()
                .unwrap_or_else(|| pluralize(&rt.name));

            let on_demand_fetch_kind = if PARTIAL_ON_DEMAND_TABLES.contains(&rt.name.as_str()) {
                OnDemandFetchKind::Partial
            } else {
                OnDemandFetchKind::None
            };

            let mut columns = IndexMap::new();
            for c in &rt.columns {
                validate_category_rule(&rt.name, &c.name, &c.category, &rt.columns)?;
                columns.insert(c.name.clone(), to_column(c));
            }
            let mut references = IndexMap::new();
            for r in &rt.references {
                if r.n_min > r.n_max {
                    return Err(SchemaError::ImpossibleCardinality {
                        table: rt.name.clone(),
                        column: r.column.name.clone(),
                        n_min: r.n_min,
                        n_max: r.n_max,
                    });
                }
                validate_category_rule(&rt.name, &r.column.name, &r.column.category, &rt.columns)?;
                references.insert(
                    r.column.name.clone(),
                    Reference {
                        column: to_column(&r.column),
                        ref_table: r.ref_table.clone(),
                        relation: r.relation,
                        n_min: r.n_min,
                        n_max: r.n_max,
                        kv_type: r.kv_type,
                        kv_key_type: r.kv_key_type,
                    },
                );
            }

            tables.insert(
                rt.name.clone(),
                Table {
                    name: rt.name.clone(),
                    plural_name,
                    is_root: rt.is_root,
                    is_many: rt.is_many,
                    index_columns: rt.index_columns.clone(),
                    indexes: rt.indexes.clone(),
                    mutable: rt.mutable,
                    dynamic: rt.dynamic,
                    columns,
                    references,
                    on_demand_fetch_kind,
                    children: Vec::new(),
                    parent: None,
                },
            );
        }

        // Validate every reference points at a known table before linking.
        let table_names: HashSet<String> = tables.keys().cloned().collect();
        for table in tables.values() {
            for reference in table.references.values() {
                if !table_names.contains(&reference.ref_table) {
                    return Err(SchemaError::UnknownTable {
                        table: table.name.clone(),
                        target: reference.ref_table.clone(),
                    });
                }
            }
        }

        let mut schema = Schema {
            tables,
            reference_map: HashMap::new(),
        };
        schema.link();
        Ok(schema)
    }

    /// Back-fill parent/children and build the reverse reference map.
    fn link(&mut self) {
        let snapshot: Vec<(String, Vec<(String, Relation, String)>)> = self
            .tables
            .values()
            .map(|t| {
                (
                    t.name.clone(),
                    t.references
                        .values()
                        .map(|r| (r.column.name.clone(), r.relation, r.ref_table.clone()))
                        .collect(),
                )
            })
            .collect();

        for (table_name, refs) in &snapshot {
            for (column, relation, ref_table) in refs {
                self.reference_map
                    .entry(ref_table.clone())
                    .or_default()
                    .insert((table_name.clone(), column.clone()));

                if *relation == Relation::Child {
                    if let Some(t) = self.tables.get_mut(table_name) {
                        t.children.push((column.clone(), ref_table.clone()));
                    }
                    if let Some(child) = self.tables.get_mut(ref_table) {
                        child.parent = Some(table_name.clone());
                    }
                }
            }
        }
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn table_by_plural(&self, plural: &str) -> Option<&Table> {
        self.tables.values().find(|t| t.plural_name == plural)
    }
}

fn to_column(c: &RawColumn) -> Column {
    Column {
        name: c.name.clone(),
        category: c.category.clone(),
        ty: c.ty,
        optional: c.optional,
        mutable: c.mutable,
        range: c.range,
        enum_values: c.enum_values.clone(),
        empty_value: c.empty_value.clone(),
        value_type: c.value_type,
        keyname: c.keyname.clone(),
    }
}

fn validate_category_rule(
    table: &str,
    column: &str,
    rule: &CategoryRule,
    siblings: &[RawColumn],
) -> Result<(), SchemaError> {
    if let CategoryRule::Dynamic(DynamicCategory::Follows { follows }) = rule {
        if !siblings.iter().any(|c| &c.name == follows) && follows != column {
            return Err(SchemaError::UnresolvedFollows {
                table: table.to_owned(),
                column: column.to_owned(),
                target: follows.clone(),
            });
        }
    }
    Ok(())
}

/// Compute the effective category of a column for a given row, applying
/// `follows`/`per-value` dynamic rules. Recomputed on every read/write,
/// never cached on the schema itself.
pub fn effective_category(
    table: &Table,
    column_name: &str,
    row: &dyn Fn(&str) -> Option<crate::value::Value>,
) -> Category {
    let rule = table
        .columns
        .get(column_name)
        .map(|c| &c.category)
        .or_else(|| table.references.get(column_name).map(|r| &r.column.category));
    let Some(rule) = rule else {
        return Category::Configuration;
    };
    resolve_category(table, column_name, rule, row, 0)
}

fn resolve_category(
    table: &Table,
    column_name: &str,
    rule: &CategoryRule,
    row: &dyn Fn(&str) -> Option<crate::value::Value>,
    depth: u32,
) -> Category {
    // Guard against pathological `follows` cycles; default to configuration.
    if depth > 8 {
        return Category::Configuration;
    }
    match rule {
        CategoryRule::Static(cat) => *cat,
        CategoryRule::Dynamic(DynamicCategory::PerValue { per_value }) => row(column_name)
            .and_then(|v| v.as_str().and_then(|s| per_value.get(s).copied()))
            .unwrap_or(Category::Configuration),
        CategoryRule::Dynamic(DynamicCategory::Follows { follows }) => table
            .columns
            .get(follows)
            .map(|c| &c.category)
            .or_else(|| table.references.get(follows).map(|r| &r.column.category))
            .map(|r| resolve_category(table, follows, r, row, depth + 1))
            .unwrap_or(Category::Configuration),
    }
}

/// English singular -> plural transform on the last underscore-segmented
/// word, per spec.md §4.1. Mirrors `opslib/restparser.py`'s pluralizer.
pub fn pluralize(name: &str) -> String {
    let (prefix, last) = match name.rsplit_once('_') {
        Some((p, l)) => (format!("{p}_"), l),
        None => (String::new(), name),
    };
    let plural = if let Some(stem) = last.strip_suffix('y') {
        if !stem.ends_with(|c: char| "aeiou".contains(c)) {
            format!("{stem}ies")
        } else {
            format!("{last}s")
        }
    } else if last.ends_with('s')
        || last.ends_with('x')
        || last.ends_with('z')
        || last.ends_with("ch")
        || last.ends_with("sh")
    {
        format!("{last}es")
    } else {
        format!("{last}s")
    };
    format!("{prefix}{plural}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pluralizes_last_segment_only() {
        assert_eq!(pluralize("bgp_router"), "bgp_routers");
        assert_eq!(pluralize("vrf"), "vrfs");
        assert_eq!(pluralize("bgp_neighbor"), "bgp_neighbors");
        assert_eq!(pluralize("switch"), "switches");
        assert_eq!(pluralize("bgp_policy"), "bgp_policies");
        assert_eq!(pluralize("fan"), "fans");
    }

    #[test]
    fn detects_unresolved_follows() {
        let raw: RawSchema = serde_json::from_value(serde_json::json!({
            "tables": [{
                "name": "route",
                "index_columns": [],
                "columns": [{
                    "name": "metric",
                    "category": {"follows": "nonexistent"},
                    "type": "int"
                }]
            }]
        }))
        .unwrap();
        let err = Schema::load(raw).unwrap_err();
        assert!(matches!(err, SchemaError::UnresolvedFollows { .. }));
    }

    #[test]
    fn detects_impossible_cardinality() {
        let raw: RawSchema = serde_json::from_value(serde_json::json!({
            "tables": [
                {"name": "vrf", "index_columns": ["name"], "columns": [
                    {"name": "name", "category": "configuration", "type": "string"}
                ]},
                {"name": "route", "index_columns": [], "references": [{
                    "name": "vrf", "category": "reference", "type": "uuid",
                    "ref_table": "vrf", "relation": "parent", "n_min": 2, "n_max": 1
                }]}
            ]
        }))
        .unwrap();
        let err = Schema::load(raw).unwrap_err();
        assert!(matches!(err, SchemaError::ImpossibleCardinality { .. }));
    }

    #[test]
    fn on_demand_partial_classification() {
        let raw: RawSchema = serde_json::from_value(serde_json::json!({
            "tables": [{
                "name": "Route",
                "index_columns": ["prefix"],
                "columns": [
                    {"name": "prefix", "category": "configuration", "type": "string"},
                    {"name": "metric", "category": "status", "type": "int"}
                ]
            }]
        }))
        .unwrap();
        let schema = Schema::load(raw).unwrap();
        let table = schema.table("Route").unwrap();
        assert_eq!(table.on_demand_fetch_kind, OnDemandFetchKind::Partial);
        assert!(table.readonly_columns().contains(&"metric"));
        assert!(!table.readonly_columns().contains(&"prefix"));
    }
}
