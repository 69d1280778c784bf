//! Custom SQL functions registered on every connection.

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::sync::Arc;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Register custom SQL functions on a connection.
///
/// - `regexp(pattern, text)`: backs the `text REGEXP pattern` operator. NULL or
///   non-text values never match. The compiled pattern is cached per statement.
pub fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let pattern: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> Result<_, BoxError> {
                Ok(Regex::new(vr.as_str()?)?)
            })?;
            let is_match = match ctx.get_raw(1) {
                ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                    .map(|text| pattern.is_match(text))
                    .unwrap_or(false),
                _ => false,
            };
            Ok(is_match)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regexp_operator() {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn).unwrap();

        let matched: bool = conn
            .query_row("SELECT 'SMTP timeout' REGEXP '(?i)smtp'", [], |row| row.get(0))
            .unwrap();
        assert!(matched);

        let matched: bool = conn
            .query_row("SELECT 'connection refused' REGEXP '^timeout'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert!(!matched);
    }

    #[test]
    fn test_regexp_null_never_matches() {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn).unwrap();

        let matched: bool = conn
            .query_row("SELECT NULL REGEXP '.*'", [], |row| row.get(0))
            .unwrap();
        assert!(!matched);
    }
}
