//! Fragment syntax check using sqlparser

use sqlparser::ast::Statement;
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;

/// Check that `sql` parses as exactly one query statement
pub fn check_fragment(sql: &str) -> Result<(), String> {
    let dialect = DuckDbDialect {};
    let statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| format!("SQL validation failed: {}", e))?;

    match statements.as_slice() {
        [Statement::Query(_)] => Ok(()),
        [] => Err("fragment is empty".to_string()),
        [_] => Err("fragment is not a SELECT-shaped query".to_string()),
        _ => Err(format!(
            "fragment contains {} statements, expected one query",
            statements.len()
        )),
    }
}
