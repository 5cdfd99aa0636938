//! Compiled query artifacts

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::schema::Schema;

static LINE_LOCATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLINE (\d+):").unwrap());

/// Per-step metadata inside a compiled query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledStep {
    /// 1-based position in the pipeline
    pub index: usize,
    pub name: String,
    /// Virtual tables of the step's fragments, in order
    pub tables: Vec<String>,
    /// Table downstream steps read from
    pub output: String,
    /// First and last line (1-based, inclusive) of the step's CTEs
    pub lines: (usize, usize),
}

/// A single composed SQL query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub(crate) sql: String,
    pub(crate) terminal: String,
    pub(crate) input: String,
    pub(crate) schema: Schema,
    pub(crate) steps: Vec<CompiledStep>,
}

impl CompiledQuery {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn into_sql(self) -> String {
        self.sql
    }

    /// Virtual table the final `SELECT` reads from
    pub fn terminal(&self) -> &str {
        &self.terminal
    }

    /// Table the query's first step reads from
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Schema of the query result
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn steps(&self) -> &[CompiledStep] {
        &self.steps
    }

    /// Number of wrapped fragments in the `WITH` clause
    pub fn fragment_count(&self) -> usize {
        self.steps.iter().map(|s| s.tables.len()).sum()
    }

    /// SHA-256 of the SQL text, hex encoded
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.sql)
    }

    /// Best-effort attribution of an engine error message to a step
    ///
    /// Tries a `LINE n:` location first, then any generated table name
    /// mentioned in the message.
    pub fn locate(&self, message: &str) -> Option<&CompiledStep> {
        self.locate_at(message, 0)
    }

    /// Like [`locate`](Self::locate) for a statement that carries
    /// `line_offset` extra lines before the query text
    pub fn locate_at(&self, message: &str, line_offset: usize) -> Option<&CompiledStep> {
        if let Some(line) = LINE_LOCATION
            .captures(message)
            .and_then(|c| c[1].parse::<usize>().ok())
            .and_then(|l| l.checked_sub(line_offset))
        {
            if let Some(step) = self
                .steps
                .iter()
                .find(|s| s.lines.0 <= line && line <= s.lines.1)
            {
                return Some(step);
            }
        }

        self.steps
            .iter()
            .flat_map(|s| s.tables.iter().map(move |t| (t, s)))
            .filter(|(table, _)| message.contains(table.as_str()))
            .max_by_key(|(table, _)| table.len())
            .map(|(_, step)| step)
    }
}

/// One unit of work for the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySegment {
    pub query: CompiledQuery,
    /// Temporary table to materialise the result into; `None` for the final segment
    pub materialise_as: Option<String>,
}

impl QuerySegment {
    /// Statement the executor submits for this segment
    pub fn statement(&self) -> String {
        match &self.materialise_as {
            Some(table) => create_temp_table(table, self.query.sql()),
            None => self.query.sql().to_string(),
        }
    }

    /// Lines the statement carries before the query text
    pub fn line_offset(&self) -> usize {
        usize::from(self.materialise_as.is_some())
    }
}

/// One fragment materialised on its own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Materialisation {
    pub index: usize,
    pub step: String,
    pub table: String,
    pub sql: String,
}

impl Materialisation {
    pub fn statement(&self) -> String {
        create_temp_table(&self.table, &self.sql)
    }
}

pub(crate) fn create_temp_table(table: &str, sql: &str) -> String {
    format!("CREATE OR REPLACE TEMP TABLE {} AS\n{}", table, sql)
}

pub(crate) fn fingerprint(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A CTE ready to be wrapped
pub(crate) struct Cte<'a> {
    pub table: &'a str,
    pub sql: &'a str,
}

/// Compose `WITH a AS (...), b AS (...) SELECT ... FROM terminal`
///
/// Returns the SQL and the line span of each CTE. Fragment text is copied
/// verbatim.
pub(crate) fn compose(
    ctes: &[Cte<'_>],
    terminal: &str,
    projection: &[String],
) -> (String, Vec<(usize, usize)>) {
    let select_list = if projection.is_empty() {
        "*".to_string()
    } else {
        projection.join(", ")
    };
    let select = format!("SELECT {} FROM {}", select_list, terminal);

    if ctes.is_empty() {
        return (select, Vec::new());
    }

    let mut sql = String::from("WITH\n");
    let mut spans = Vec::with_capacity(ctes.len());
    for (i, cte) in ctes.iter().enumerate() {
        if i > 0 {
            sql.push_str(",\n\n");
        }
        let wrapped = format!("{} AS (\n{}\n)", cte.table, cte.sql);
        let start = sql.matches('\n').count() + 1;
        let end = start + wrapped.matches('\n').count();
        spans.push((start, end));
        sql.push_str(&wrapped);
    }
    sql.push_str("\n\n");
    sql.push_str(&select);

    (sql, spans)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_empty() {
        let (sql, spans) = compose(&[], "raw", &[]);
        assert_eq!(sql, "SELECT * FROM raw");
        assert!(spans.is_empty());
    }

    #[test]
    fn test_compose_layout_and_spans() {
        let ctes = [
            Cte {
                table: "s1_a__main",
                sql: "SELECT * FROM raw",
            },
            Cte {
                table: "s2_b__main",
                sql: "SELECT *\nFROM s1_a__main",
            },
        ];
        let (sql, spans) = compose(&ctes, "s2_b__main", &["x".to_string(), "y".to_string()]);
        assert_eq!(
            sql,
            "WITH\ns1_a__main AS (\nSELECT * FROM raw\n),\n\ns2_b__main AS (\nSELECT *\nFROM s1_a__main\n)\n\nSELECT x, y FROM s2_b__main"
        );
        // line 1 is WITH; second CTE starts after the blank separator line
        assert_eq!(spans, vec![(2, 4), (6, 9)]);
        let lines: Vec<&str> = sql.lines().collect();
        assert_eq!(lines[5], "s2_b__main AS (");
        assert_eq!(lines[8], ")");
    }

    #[test]
    fn test_locate_prefers_line_then_name() {
        let query = CompiledQuery {
            sql: String::new(),
            terminal: "s2_b__main".to_string(),
            input: "raw".to_string(),
            schema: Schema::new(),
            steps: vec![
                CompiledStep {
                    index: 1,
                    name: "a".to_string(),
                    tables: vec!["s1_a__main".to_string()],
                    output: "s1_a__main".to_string(),
                    lines: (2, 4),
                },
                CompiledStep {
                    index: 2,
                    name: "b".to_string(),
                    tables: vec!["s2_b__x".to_string(), "s2_b__xy".to_string()],
                    output: "s2_b__xy".to_string(),
                    lines: (6, 12),
                },
            ],
        };

        assert_eq!(query.locate("Binder Error: ...\nLINE 3: SELECT").unwrap().index, 1);
        assert_eq!(query.locate("Table s2_b__xy does not exist").unwrap().index, 2);
        assert_eq!(query.locate("line 7: bad").unwrap().name, "b");
        // one extra header line shifts line 5 back into the first step
        assert_eq!(query.locate_at("LINE 5: x", 1).unwrap().index, 1);
        assert!(query.locate("Out of memory").is_none());
        assert_eq!(query.fragment_count(), 3);
    }

    #[test]
    fn test_segment_statement() {
        let query = CompiledQuery {
            sql: "SELECT 1".to_string(),
            terminal: "t".to_string(),
            input: "t".to_string(),
            schema: Schema::new(),
            steps: Vec::new(),
        };
        let segment = QuerySegment {
            query: query.clone(),
            materialise_as: Some("s1_a__main".to_string()),
        };
        assert_eq!(
            segment.statement(),
            "CREATE OR REPLACE TEMP TABLE s1_a__main AS\nSELECT 1"
        );
        assert_eq!(segment.line_offset(), 1);
        let last = QuerySegment {
            query,
            materialise_as: None,
        };
        assert_eq!(last.statement(), "SELECT 1");
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint("SELECT 1"), fingerprint("SELECT 1"));
        assert_ne!(fingerprint("SELECT 1"), fingerprint("SELECT 2"));
        assert_eq!(fingerprint("").len(), 64);
    }
}
