//! DuckDB query engine

use std::path::Path;

use chrono::DateTime;
use duckdb::Connection;
use duckdb::types::Value;
use tracing::debug;

use super::{ExecutionResult, QueryEngine};
use crate::error::EngineError;
use crate::schema::{Column, ColumnType, Schema};

/// [`QueryEngine`] backed by a DuckDB connection
pub struct DuckDbEngine {
    conn: Connection,
}

impl DuckDbEngine {
    /// Open or create a database file
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let conn = Connection::open(path).map_err(EngineError::with_source)?;
        debug!(path = %path.display(), "Opened DuckDB database");
        Ok(Self { conn })
    }

    /// In-memory database
    pub fn memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().map_err(EngineError::with_source)?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl QueryEngine for DuckDbEngine {
    fn query(&self, sql: &str) -> Result<ExecutionResult, EngineError> {
        let mut stmt = self.conn.prepare(sql).map_err(EngineError::with_source)?;
        let mut rows = stmt.query([]).map_err(EngineError::with_source)?;

        let column_count = rows.as_ref().map(|r| r.column_count()).unwrap_or(0);
        let names: Vec<String> = (0..column_count)
            .map(|i| {
                rows.as_ref()
                    .and_then(|r| r.column_name(i).ok())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("col{}", i))
            })
            .collect();

        let mut types = vec![ColumnType::Unknown; column_count];
        let mut data = Vec::new();
        while let Some(row) = rows.next().map_err(EngineError::with_source)? {
            let mut values = Vec::with_capacity(column_count);
            for (i, ty) in types.iter_mut().enumerate() {
                let value: Value = row.get(i).map_err(EngineError::with_source)?;
                let (json, inferred) = to_json(value);
                if *ty == ColumnType::Unknown {
                    if let Some(inferred) = inferred {
                        *ty = inferred;
                    }
                }
                values.push(json);
            }
            data.push(values);
        }

        let columns: Vec<Column> = names
            .into_iter()
            .zip(types)
            .map(|(name, ty)| Column::new(name, ty))
            .collect();
        // rows keep one value per engine column, so the schema must too
        let schema = Schema::try_from(columns).map_err(EngineError::new)?;

        Ok(ExecutionResult::new(schema, data))
    }

    fn execute(&self, sql: &str) -> Result<(), EngineError> {
        self.conn.execute_batch(sql).map_err(EngineError::with_source)
    }
}

/// Convert a DuckDB value, reporting the column type it implies
fn to_json(value: Value) -> (serde_json::Value, Option<ColumnType>) {
    let numeric = Some(ColumnType::Numeric);
    match value {
        Value::Null => (serde_json::Value::Null, None),
        Value::Boolean(b) => (serde_json::Value::Bool(b), None),
        Value::TinyInt(n) => (n.into(), numeric),
        Value::SmallInt(n) => (n.into(), numeric),
        Value::Int(n) => (n.into(), numeric),
        Value::BigInt(n) => (n.into(), numeric),
        Value::UTinyInt(n) => (n.into(), numeric),
        Value::USmallInt(n) => (n.into(), numeric),
        Value::UInt(n) => (n.into(), numeric),
        Value::UBigInt(n) => (n.into(), numeric),
        Value::HugeInt(n) => (
            i64::try_from(n)
                .map(serde_json::Value::from)
                .unwrap_or_else(|_| serde_json::Value::String(n.to_string())),
            numeric,
        ),
        Value::Float(f) => (float(f as f64), numeric),
        Value::Double(f) => (float(f), numeric),
        Value::Decimal(d) => (
            d.to_string()
                .parse::<f64>()
                .map(float)
                .unwrap_or_else(|_| serde_json::Value::String(d.to_string())),
            numeric,
        ),
        Value::Text(s) => (serde_json::Value::String(s), Some(ColumnType::String)),
        Value::Enum(s) => (serde_json::Value::String(s), Some(ColumnType::String)),
        Value::List(items) | Value::Array(items) => (
            serde_json::Value::Array(items.into_iter().map(|v| to_json(v).0).collect()),
            None,
        ),
        Value::Date32(days) => (
            DateTime::from_timestamp(i64::from(days) * 86_400, 0)
                .map(|d| serde_json::Value::String(d.date_naive().to_string()))
                .unwrap_or(serde_json::Value::Null),
            None,
        ),
        other => (serde_json::Value::String(format!("{:?}", other)), None),
    }
}

fn float(f: f64) -> serde_json::Value {
    serde_json::Number::from_f64(f)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lists_become_arrays() {
        let (value, ty) = to_json(Value::List(vec![
            Value::Text("12".to_string()),
            Value::Null,
            Value::Text("high".to_string()),
        ]));
        assert_eq!(value, json!(["12", null, "high"]));
        assert_eq!(ty, None);

        let (nested, _) = to_json(Value::List(vec![Value::List(vec![Value::Int(1)])]));
        assert_eq!(nested, json!([[1]]));
    }

    #[test]
    fn test_dates_become_iso_strings() {
        // 2024-05-01 is 19844 days after the epoch
        assert_eq!(to_json(Value::Date32(19_844)).0, json!("2024-05-01"));
        assert_eq!(to_json(Value::Int(7)), (json!(7), Some(ColumnType::Numeric)));
    }
}
