//! # Schema Model
//!
//! In-memory description of the finance database: tables, views and their
//! ordered, typed columns. The model grounds both prompt construction and
//! query validation, so every lookup follows SQLite identifier rules
//! (ASCII case-insensitive).
//!
//! ## Snapshot layouts
//!
//! The canonical snapshot is an ordered list of tables:
//!
//! ```json
//! {"tables": [
//!   {"name": "expenses", "is_view": false,
//!    "columns": [{"name": "date", "type": "DATE", "nullable": false}],
//!    "samples": [{"date": "2024-05-01"}]}
//! ]}
//! ```
//!
//! The legacy map layout (`{"expenses": {"columns": [...], "samples": [...]}}`)
//! is accepted as well; its tables are ordered by name.

mod introspect;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Schema loading / introspection errors
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Snapshot file could not be read
    #[error("Failed to read schema snapshot '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot document is not valid JSON in either accepted layout
    #[error("Malformed schema snapshot: {0}")]
    Malformed(String),

    /// Snapshot describes no tables
    #[error("Schema snapshot contains no tables")]
    Empty,

    /// Live database introspection failed
    #[error("Schema introspection failed: {0}")]
    Introspection(#[from] rusqlite::Error),
}

/// A single column of a table or view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Declared SQL type, as written in the DDL (may be empty for views)
    #[serde(rename = "type", default)]
    pub declared_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>, nullable: bool) -> Self {
        ColumnDescriptor {
            name: name.into(),
            declared_type: declared_type.into(),
            nullable,
        }
    }
}

/// A table or view with its ordered columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    pub is_view: bool,
    /// A handful of example rows, shown to the generator only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<serde_json::Value>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDescriptor>) -> Self {
        TableDescriptor {
            name: name.into(),
            columns,
            is_view: false,
            samples: Vec::new(),
        }
    }

    /// Mark this descriptor as a view
    pub fn view(mut self) -> Self {
        self.is_view = true;
        self
    }

    /// Attach sample rows
    pub fn with_samples(mut self, samples: Vec<serde_json::Value>) -> Self {
        self.samples = samples;
        self
    }

    /// Case-insensitive column lookup
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Ordered description of every table and view the generator may use
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaModel {
    tables: Vec<TableDescriptor>,
}

#[derive(Deserialize)]
struct CanonicalSnapshot {
    tables: Vec<TableDescriptor>,
}

#[derive(Deserialize)]
struct LegacyTable {
    columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    is_view: bool,
    #[serde(default)]
    samples: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotDocument {
    Canonical(CanonicalSnapshot),
    Legacy(BTreeMap<String, LegacyTable>),
}

impl SchemaModel {
    /// Build a model from already-constructed descriptors
    pub fn new(tables: Vec<TableDescriptor>) -> Self {
        SchemaModel { tables }
    }

    /// Load a snapshot document from disk
    pub fn from_snapshot_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parse a snapshot document in either accepted layout
    pub fn from_json(text: &str) -> Result<Self, SchemaError> {
        let document: SnapshotDocument =
            serde_json::from_str(text).map_err(|e| SchemaError::Malformed(e.to_string()))?;

        let tables = match document {
            SnapshotDocument::Canonical(snapshot) => snapshot.tables,
            SnapshotDocument::Legacy(map) => map
                .into_iter()
                .map(|(name, table)| TableDescriptor {
                    name,
                    columns: table.columns,
                    is_view: table.is_view,
                    samples: table.samples,
                })
                .collect(),
        };

        if tables.is_empty() {
            return Err(SchemaError::Empty);
        }
        Ok(SchemaModel { tables })
    }

    /// Serialize to the canonical snapshot layout
    pub fn to_snapshot_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&serde_json::json!({ "tables": self.tables }))
    }

    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Case-insensitive table lookup
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table).is_some_and(|t| t.has_column(column))
    }
}

impl fmt::Display for SchemaModel {
    /// Compact, line-per-table rendering used inside prompts
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for table in &self.tables {
            let kind = if table.is_view { "VIEW" } else { "TABLE" };
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| {
                    let null = if c.nullable { "" } else { " NOT NULL" };
                    if c.declared_type.is_empty() {
                        format!("{}{null}", c.name)
                    } else {
                        format!("{} {}{null}", c.name, c.declared_type)
                    }
                })
                .collect();
            writeln!(f, "{kind} {}({})", table.name, columns.join(", "))?;
        }
        Ok(())
    }
}
