//! Schema mapping between the change stream and the MySQL source.
//!
//! Each replicated table has a source definition (the MySQL table that is
//! written) and a target definition (the table whose changes are streamed).
//! Columns on both sides are keyed by a stable [`ColumnId`], so renames on
//! either side do not break the mapping. A column that exists on only one side
//! is ignored during translation.
//!
//! The catalog is read-only while events are processed. Refreshes build a new
//! [`SchemaCatalog`] and swap it into a [`CatalogHandle`]; translations that
//! already hold a snapshot finish against the version they started with.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::identifier::validate_identifier;
use crate::error::{ReplicateError, Result};
use crate::typemap::{SourceTypeClass, TargetType};

/// Stable column identifier shared by the source and target definitions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnId(String);

impl ColumnId {
    pub fn new(id: impl Into<String>) -> Self {
        ColumnId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ColumnId {
    fn from(s: &str) -> Self {
        ColumnId(s.to_string())
    }
}

/// A column of the MySQL table being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceColumnDef {
    pub id: ColumnId,
    pub name: String,
    /// Lowercase MySQL type name, e.g. `varchar` or `datetime`.
    pub source_type: String,
    pub is_array: bool,
}

impl SourceColumnDef {
    pub fn new(id: impl Into<ColumnId>, name: impl Into<String>, source_type: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source_type: source_type.to_ascii_lowercase(),
            is_array: false,
        }
    }

    pub fn type_class(&self) -> SourceTypeClass {
        SourceTypeClass::classify(&self.source_type)
    }
}

/// A column of the change stream table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetColumnDef {
    pub id: ColumnId,
    pub name: String,
    pub target_type: TargetType,
    pub is_array: bool,
}

impl TargetColumnDef {
    pub fn new(id: impl Into<ColumnId>, name: impl Into<String>, target_type: TargetType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            target_type,
            is_array: false,
        }
    }

    /// Mark the column as an array of `target_type`.
    pub fn array(mut self) -> Self {
        self.is_array = true;
        self
    }
}

impl From<String> for ColumnId {
    fn from(s: String) -> Self {
        ColumnId(s)
    }
}

/// Mapping for one replicated table.
#[derive(Debug, Clone)]
pub struct TableMapping {
    id: String,
    source_table: String,
    target_table: String,
    source_columns: BTreeMap<ColumnId, SourceColumnDef>,
    target_columns: BTreeMap<ColumnId, TargetColumnDef>,
    primary_keys: Vec<ColumnId>,
}

impl TableMapping {
    /// Build a validated table mapping.
    ///
    /// Rejects invalid source identifiers, duplicate column ids and primary key
    /// ids that are not source columns. An empty primary key is accepted; such
    /// tables are skipped during translation.
    pub fn new(
        id: impl Into<String>,
        source_table: impl Into<String>,
        target_table: impl Into<String>,
        source_columns: Vec<SourceColumnDef>,
        target_columns: Vec<TargetColumnDef>,
        primary_keys: Vec<ColumnId>,
    ) -> Result<Self> {
        let id = id.into();
        let source_table = source_table.into();
        let target_table = target_table.into();

        validate_identifier(&source_table)
            .map_err(|e| ReplicateError::catalog(format!("table {}: {}", id, e)))?;
        if target_table.is_empty() {
            return Err(ReplicateError::catalog(format!(
                "table {}: target table name cannot be empty",
                id
            )));
        }

        let mut sources = BTreeMap::new();
        for col in source_columns {
            validate_identifier(&col.name).map_err(|e| {
                ReplicateError::catalog(format!("table {} column {}: {}", id, col.id, e))
            })?;
            let col_id = col.id.clone();
            if sources.insert(col_id.clone(), col).is_some() {
                return Err(ReplicateError::catalog(format!(
                    "table {}: duplicate source column id {}",
                    id, col_id
                )));
            }
        }

        let mut targets = BTreeMap::new();
        for col in target_columns {
            let col_id = col.id.clone();
            if targets.insert(col_id.clone(), col).is_some() {
                return Err(ReplicateError::catalog(format!(
                    "table {}: duplicate target column id {}",
                    id, col_id
                )));
            }
        }

        for (i, pk) in primary_keys.iter().enumerate() {
            if !sources.contains_key(pk) {
                return Err(ReplicateError::catalog(format!(
                    "table {}: primary key column id {} is not a source column",
                    id, pk
                )));
            }
            if primary_keys[..i].contains(pk) {
                return Err(ReplicateError::catalog(format!(
                    "table {}: primary key column id {} listed twice",
                    id, pk
                )));
            }
        }

        Ok(Self {
            id,
            source_table,
            target_table,
            source_columns: sources,
            target_columns: targets,
            primary_keys,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// MySQL table that receives writes.
    pub fn source_table(&self) -> &str {
        &self.source_table
    }

    /// Change stream table name, as found in `ChangeEvent::table_name`.
    pub fn target_table(&self) -> &str {
        &self.target_table
    }

    /// Primary key column ids in declared order.
    pub fn primary_keys(&self) -> &[ColumnId] {
        &self.primary_keys
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_keys.is_empty()
    }

    pub fn is_primary_key(&self, id: &ColumnId) -> bool {
        self.primary_keys.contains(id)
    }

    pub fn source_column(&self, id: &ColumnId) -> Option<&SourceColumnDef> {
        self.source_columns.get(id)
    }

    pub fn target_column(&self, id: &ColumnId) -> Option<&TargetColumnDef> {
        self.target_columns.get(id)
    }

    /// Both sides of a column, or `None` when the column is one-sided.
    pub fn resolve_column(&self, id: &ColumnId) -> Option<(&SourceColumnDef, &TargetColumnDef)> {
        Some((self.source_columns.get(id)?, self.target_columns.get(id)?))
    }

    /// Non-key columns present on both sides, in ascending column id order.
    pub fn non_key_columns(&self) -> impl Iterator<Item = (&SourceColumnDef, &TargetColumnDef)> {
        self.source_columns
            .iter()
            .filter(|(id, _)| !self.is_primary_key(id))
            .filter_map(|(id, src)| self.target_columns.get(id).map(|tgt| (src, tgt)))
    }

    pub fn source_columns(&self) -> impl Iterator<Item = &SourceColumnDef> {
        self.source_columns.values()
    }

    pub fn target_columns(&self) -> impl Iterator<Item = &TargetColumnDef> {
        self.target_columns.values()
    }
}

/// All table mappings, keyed by change stream table name.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    tables: HashMap<String, Arc<TableMapping>>,
}

impl SchemaCatalog {
    /// Build a catalog, rejecting two mappings for the same change stream table.
    pub fn new(mappings: Vec<TableMapping>) -> Result<Self> {
        let mut tables = HashMap::with_capacity(mappings.len());
        for mapping in mappings {
            let name = mapping.target_table().to_string();
            if tables.insert(name.clone(), Arc::new(mapping)).is_some() {
                return Err(ReplicateError::catalog(format!(
                    "change stream table {} is mapped more than once",
                    name
                )));
            }
        }
        Ok(Self { tables })
    }

    /// Load a catalog file. `.json` files are parsed as JSON, everything else
    /// as YAML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let catalog = if is_json {
            Self::from_json(&content)?
        } else {
            Self::from_yaml(&content)?
        };
        info!(
            "Loaded schema catalog from {} ({} tables)",
            path.display(),
            catalog.len()
        );
        Ok(catalog)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml)
            .map_err(|e| ReplicateError::catalog(format!("invalid catalog YAML: {}", e)))?;
        file.into_catalog()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json)
            .map_err(|e| ReplicateError::catalog(format!("invalid catalog JSON: {}", e)))?;
        file.into_catalog()
    }

    /// Mapping for a change stream table.
    pub fn resolve_table(&self, target_table: &str) -> Option<Arc<TableMapping>> {
        self.tables.get(target_table).cloned()
    }

    /// Both sides of a column of `table`.
    pub fn resolve_column<'a>(
        &self,
        table: &'a TableMapping,
        id: &ColumnId,
    ) -> Option<(&'a SourceColumnDef, &'a TargetColumnDef)> {
        table.resolve_column(id)
    }

    /// Mappings sorted by change stream table name.
    pub fn tables(&self) -> Vec<Arc<TableMapping>> {
        let mut tables: Vec<_> = self.tables.values().cloned().collect();
        tables.sort_by(|a, b| a.target_table().cmp(b.target_table()));
        tables
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Shared, replaceable reference to the current catalog.
#[derive(Debug, Clone)]
pub struct CatalogHandle {
    current: Arc<RwLock<Arc<SchemaCatalog>>>,
}

impl CatalogHandle {
    pub fn new(catalog: SchemaCatalog) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    /// The catalog in effect right now.
    pub fn snapshot(&self) -> Arc<SchemaCatalog> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Install a new catalog. Existing snapshots are unaffected.
    pub fn replace(&self, catalog: SchemaCatalog) {
        let tables = catalog.len();
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(catalog);
        info!("Schema catalog replaced ({} tables)", tables);
    }
}

// On-disk format.

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    tables: BTreeMap<String, TableFile>,
}

#[derive(Deserialize)]
struct TableFile {
    source: SourceTableFile,
    target: TargetTableFile,
}

#[derive(Deserialize)]
struct SourceTableFile {
    name: String,
    #[serde(default)]
    primary_keys: Vec<ColumnId>,
    #[serde(default)]
    columns: BTreeMap<ColumnId, SourceColumnFile>,
}

#[derive(Deserialize)]
struct SourceColumnFile {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
    #[serde(default)]
    is_array: bool,
}

#[derive(Deserialize)]
struct TargetTableFile {
    name: String,
    #[serde(default)]
    columns: BTreeMap<ColumnId, TargetColumnFile>,
}

#[derive(Deserialize)]
struct TargetColumnFile {
    name: String,
    #[serde(rename = "type")]
    column_type: TargetType,
    #[serde(default)]
    is_array: bool,
}

impl CatalogFile {
    fn into_catalog(self) -> Result<SchemaCatalog> {
        let mut mappings = Vec::with_capacity(self.tables.len());
        for (id, table) in self.tables {
            let sources = table
                .source
                .columns
                .into_iter()
                .map(|(col_id, c)| SourceColumnDef {
                    id: col_id,
                    name: c.name,
                    source_type: c.column_type.to_ascii_lowercase(),
                    is_array: c.is_array,
                })
                .collect();
            let targets = table
                .target
                .columns
                .into_iter()
                .map(|(col_id, c)| TargetColumnDef {
                    id: col_id,
                    name: c.name,
                    target_type: c.column_type,
                    is_array: c.is_array,
                })
                .collect();
            mappings.push(TableMapping::new(
                id,
                table.source.name,
                table.target.name,
                sources,
                targets,
                table.source.primary_keys,
            )?);
        }
        SchemaCatalog::new(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG_YAML: &str = r#"
tables:
  t1:
    source:
      name: human1
      primary_keys: [c1]
      columns:
        c1: { name: id, type: int }
        c2: { name: name1, type: varchar }
        c3: { name: legacy, type: varchar }
    target:
      name: person1
      columns:
        c1: { name: id, type: INT64 }
        c2: { name: name, type: STRING }
        c4: { name: nickname, type: STRING }
"#;

    #[test]
    fn test_load_yaml() {
        let catalog = SchemaCatalog::from_yaml(CATALOG_YAML).unwrap();
        assert_eq!(catalog.len(), 1);

        let table = catalog.resolve_table("person1").unwrap();
        assert_eq!(table.source_table(), "human1");
        assert_eq!(table.primary_keys(), &[ColumnId::from("c1")]);
        assert!(catalog.resolve_table("human1").is_none());
    }

    #[test]
    fn test_one_sided_columns_do_not_resolve() {
        let catalog = SchemaCatalog::from_yaml(CATALOG_YAML).unwrap();
        let table = catalog.resolve_table("person1").unwrap();

        let (src, tgt) = catalog.resolve_column(&table, &"c2".into()).unwrap();
        assert_eq!(src.name, "name1");
        assert_eq!(tgt.name, "name");
        assert_eq!(tgt.target_type, TargetType::String);

        assert!(catalog.resolve_column(&table, &"c3".into()).is_none());
        assert!(catalog.resolve_column(&table, &"c4".into()).is_none());

        let non_key: Vec<_> = table.non_key_columns().map(|(s, _)| s.name.as_str()).collect();
        assert_eq!(non_key, vec!["name1"]);
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let json = serde_json::json!({
            "tables": {
                "t1": {
                    "source": {
                        "name": "orders",
                        "primary_keys": ["k"],
                        "columns": { "k": { "name": "order_id", "type": "BIGINT" } }
                    },
                    "target": {
                        "name": "Orders",
                        "columns": { "k": { "name": "OrderId", "type": "INT64" } }
                    }
                }
            }
        });
        std::fs::write(&path, json.to_string()).unwrap();

        let catalog = SchemaCatalog::load(&path).unwrap();
        let table = catalog.resolve_table("Orders").unwrap();
        assert_eq!(
            table.source_column(&"k".into()).unwrap().source_type,
            "bigint"
        );
    }

    #[test]
    fn test_primary_key_must_be_source_column() {
        let err = TableMapping::new(
            "t",
            "human1",
            "person1",
            vec![SourceColumnDef::new("c1", "id", "int")],
            vec![TargetColumnDef::new("c1", "id", TargetType::Int64)],
            vec!["c9".into()],
        )
        .unwrap_err();
        assert!(err.to_string().contains("c9"));
    }

    #[test]
    fn test_undeclared_primary_key_is_allowed() {
        let mapping = TableMapping::new(
            "t",
            "logs",
            "Logs",
            vec![SourceColumnDef::new("c1", "msg", "text")],
            vec![TargetColumnDef::new("c1", "Msg", TargetType::String)],
            vec![],
        )
        .unwrap();
        assert!(!mapping.has_primary_key());
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let err = TableMapping::new(
            "t",
            "human1",
            "person1",
            vec![SourceColumnDef::new("c1", "bad\0name", "int")],
            vec![],
            vec![],
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_CATALOG_ERROR);
    }

    #[test]
    fn test_duplicate_target_table_rejected() {
        let mapping = |id: &str, source: &str| {
            TableMapping::new(id, source, "person1", vec![], vec![], vec![]).unwrap()
        };
        let result = SchemaCatalog::new(vec![mapping("a", "h1"), mapping("b", "h2")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_target_type_rejected() {
        let yaml = CATALOG_YAML.replace("type: STRING }", "type: TEXT }");
        assert!(SchemaCatalog::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_handle_snapshot_survives_replace() {
        let handle = CatalogHandle::new(SchemaCatalog::from_yaml(CATALOG_YAML).unwrap());
        let before = handle.snapshot();

        handle.replace(SchemaCatalog::default());

        assert!(before.resolve_table("person1").is_some());
        assert!(handle.snapshot().resolve_table("person1").is_none());
    }
}
