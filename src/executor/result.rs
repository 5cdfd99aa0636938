//! Relations returned by a query engine

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::Schema;

/// Rows returned by an engine, with the columns the engine reported
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub schema: Schema,
    pub rows: Vec<Vec<Value>>,
}

impl ExecutionResult {
    pub fn new(schema: Schema, rows: Vec<Vec<Value>>) -> Self {
        Self { schema, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one column, top to bottom
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.schema.columns().iter().position(|c| c.name == name)?;
        Some(self.rows.iter().filter_map(|row| row.get(idx)).collect())
    }

    /// Rows as JSON objects keyed by column name
    pub fn records(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.schema
                    .columns()
                    .iter()
                    .zip(row)
                    .map(|(c, v)| (c.name.clone(), v.clone()))
                    .collect()
            })
            .collect()
    }

    /// Plain-text table of the first `max_rows` rows
    pub fn preview(&self, max_rows: usize) -> String {
        let header: Vec<String> = self.schema.names().iter().map(|n| n.to_string()).collect();
        let body: Vec<Vec<String>> = self
            .rows
            .iter()
            .take(max_rows)
            .map(|row| row.iter().map(cell).collect())
            .collect();

        let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
        for row in &body {
            for (i, value) in row.iter().enumerate() {
                if let Some(w) = widths.get_mut(i) {
                    *w = (*w).max(value.chars().count());
                }
            }
        }

        let line = |cells: &[String]| {
            cells
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:<width$}", c, width = *w))
                .collect::<Vec<_>>()
                .join(" | ")
                .trim_end()
                .to_string()
        };

        let mut out = vec![
            line(header.as_slice()),
            widths
                .iter()
                .map(|w| "-".repeat(*w))
                .collect::<Vec<_>>()
                .join("-+-"),
        ];
        out.extend(body.iter().map(|row| line(row.as_slice())));

        let hidden = self.rows.len().saturating_sub(max_rows);
        if hidden > 0 {
            out.push(format!("... {} more row(s)", hidden));
        }
        out.join("\n")
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
