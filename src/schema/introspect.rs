//! Build a [`SchemaModel`] from a live SQLite database.
//!
//! Only the CLI `snapshot` command uses this; a request always works from a
//! snapshot loaded up front.

use super::{ColumnDescriptor, SchemaError, SchemaModel, TableDescriptor};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;

impl SchemaModel {
    /// Introspect every user table and view, with up to `sample_rows` example rows each
    pub fn introspect(conn: &Connection, sample_rows: usize) -> Result<Self, SchemaError> {
        let mut stmt = conn.prepare(
            "SELECT name, type FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY rowid",
        )?;
        let objects = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = Vec::with_capacity(objects.len());
        for (name, kind) in objects {
            let columns = table_columns(conn, &name)?;
            let samples = sample(conn, &name, sample_rows)?;
            let mut table = TableDescriptor::new(name, columns).with_samples(samples);
            table.is_view = kind == "view";
            tables.push(table);
        }

        if tables.is_empty() {
            return Err(SchemaError::Empty);
        }
        Ok(SchemaModel::new(tables))
    }
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnDescriptor>, SchemaError> {
    let mut stmt =
        conn.prepare("SELECT name, type, \"notnull\" FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns = stmt
        .query_map([table], |row| {
            Ok(ColumnDescriptor::new(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? == 0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn sample(
    conn: &Connection,
    table: &str,
    limit: usize,
) -> Result<Vec<serde_json::Value>, SchemaError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let quoted = format!("\"{}\"", table.replace('"', "\"\""));
    let mut stmt = conn.prepare(&format!("SELECT * FROM {quoted} LIMIT ?1"))?;
    let names: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
    let rows = stmt
        .query_map([limit as i64], |row| {
            let mut record = serde_json::Map::new();
            for (idx, name) in names.iter().enumerate() {
                let value = match row.get::<_, SqlValue>(idx)? {
                    SqlValue::Null => serde_json::Value::Null,
                    SqlValue::Integer(i) => serde_json::json!(i),
                    SqlValue::Real(r) => serde_json::json!(r),
                    SqlValue::Text(t) => serde_json::json!(t),
                    SqlValue::Blob(b) => serde_json::json!(format!("<{} bytes>", b.len())),
                };
                record.insert(name.clone(), value);
            }
            Ok(serde_json::Value::Object(record))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
