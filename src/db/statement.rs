//! SQL statement classification.
//!
//! Adapters need to know whether a statement produces rows (fetch) or only
//! an affected-row count (execute), and whether it inserts (so the engine's
//! last insert id is meaningful). Statements are parsed with
//! [sqlparser](https://docs.rs/sqlparser/) using the engine's dialect; when
//! the parser rejects engine-specific syntax a leading-keyword check is used
//! instead.

use crate::models::DriverKind;
use sqlparser::ast::Statement;
use sqlparser::dialect::{
    Dialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect,
};
use sqlparser::parser::Parser;

/// Coarse kind of one SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// SELECT, SHOW, EXPLAIN, PRAGMA and other row-returning statements
    Query,
    Insert,
    /// UPDATE, DELETE, MERGE
    Modify,
    /// CREATE, ALTER, DROP, TRUNCATE
    Definition,
    /// BEGIN, COMMIT, ROLLBACK, USE, SET
    Session,
    Other,
}

/// Classification of a (possibly multi-statement) SQL string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementInfo {
    pub kinds: Vec<StatementKind>,
    /// Contains a `RETURNING` or `OUTPUT` clause.
    pub returning: bool,
}

impl StatementInfo {
    /// True when executing the SQL yields a result set.
    pub fn returns_rows(&self) -> bool {
        self.kinds.iter().any(|k| match k {
            StatementKind::Query => true,
            StatementKind::Insert | StatementKind::Modify => self.returning,
            _ => false,
        })
    }

    pub fn is_insert(&self) -> bool {
        self.kinds.contains(&StatementKind::Insert)
    }

    pub fn is_batch(&self) -> bool {
        self.kinds.len() > 1
    }

    /// True when every statement only changes session state.
    pub fn is_session_control(&self) -> bool {
        !self.kinds.is_empty() && self.kinds.iter().all(|k| *k == StatementKind::Session)
    }
}

fn get_dialect(driver: DriverKind) -> Box<dyn Dialect> {
    match driver {
        DriverKind::Postgres => Box::new(PostgreSqlDialect {}),
        DriverKind::MySql => Box::new(MySqlDialect {}),
        DriverKind::Sqlite => Box::new(SQLiteDialect {}),
        DriverKind::MsSql => Box::new(MsSqlDialect {}),
    }
}

/// Classify `sql` for `driver`.
pub fn analyze(sql: &str, driver: DriverKind) -> StatementInfo {
    let dialect = get_dialect(driver);

    match Parser::parse_sql(dialect.as_ref(), sql) {
        Ok(statements) if !statements.is_empty() => StatementInfo {
            kinds: statements.iter().map(classify_statement).collect(),
            returning: statements.iter().any(has_returning_clause),
        },
        _ => StatementInfo {
            kinds: split_statements(sql)
                .iter()
                .map(|s| classify_keyword(s))
                .collect(),
            returning: has_keyword(sql, "RETURNING") || has_keyword(sql, "OUTPUT"),
        },
    }
}

fn has_returning_clause(stmt: &Statement) -> bool {
    match stmt {
        Statement::Insert(insert) => insert.returning.is_some(),
        Statement::Update(update) => update.returning.is_some(),
        Statement::Delete(delete) => delete.returning.is_some(),
        Statement::Merge { output, .. } => output.is_some(),
        _ => false,
    }
}

fn classify_statement(stmt: &Statement) -> StatementKind {
    match stmt {
        Statement::Query(_) => StatementKind::Query,
        Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. }
        | Statement::ExplainTable { .. }
        | Statement::Explain { .. }
        | Statement::Pragma { .. } => StatementKind::Query,

        Statement::Insert(_) => StatementKind::Insert,
        Statement::Update { .. } | Statement::Delete(_) | Statement::Merge { .. } => {
            StatementKind::Modify
        }

        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex(_)
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateSequence { .. }
        | Statement::CreateType { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateProcedure { .. }
        | Statement::CreateTrigger { .. }
        | Statement::AlterTable { .. }
        | Statement::AlterView { .. }
        | Statement::AlterIndex { .. }
        | Statement::Drop { .. }
        | Statement::DropFunction { .. }
        | Statement::DropProcedure { .. }
        | Statement::DropTrigger { .. }
        | Statement::Truncate { .. }
        | Statement::Comment { .. } => StatementKind::Definition,

        Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. }
        | Statement::Savepoint { .. }
        | Statement::ReleaseSavepoint { .. }
        | Statement::Set(_)
        | Statement::Use(_) => StatementKind::Session,

        _ => StatementKind::Other,
    }
}

/// Leading-keyword classification for SQL the parser cannot handle.
fn classify_keyword(sql: &str) -> StatementKind {
    let first = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_start_matches('(')
        .to_uppercase();
    match first.as_str() {
        "SELECT" | "WITH" | "SHOW" | "PRAGMA" | "EXPLAIN" | "VALUES" | "DESCRIBE" | "DESC" => {
            StatementKind::Query
        }
        "INSERT" | "REPLACE" => StatementKind::Insert,
        "UPDATE" | "DELETE" | "MERGE" | "UPSERT" => StatementKind::Modify,
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME" | "COMMENT" => {
            StatementKind::Definition
        }
        "BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" | "USE" | "SET" => {
            StatementKind::Session
        }
        _ => StatementKind::Other,
    }
}

/// Split on `;` outside quotes, dropping empty pieces.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match (quote, c) {
            (None, '\'' | '"' | '`') => {
                quote = Some(c);
                current.push(c);
            }
            (Some(q), _) if c == q => {
                quote = None;
                current.push(c);
            }
            (None, ';') => {
                if !current.trim().is_empty() {
                    statements.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }
    statements
}

/// Whole-word, case-insensitive keyword search outside string literals and
/// quoted identifiers (`"..."`, `` `...` ``, `[...]`).
fn has_keyword(sql: &str, keyword: &str) -> bool {
    let mut closing: Option<char> = None;
    let mut word = String::new();
    for c in sql.chars().chain(std::iter::once(' ')) {
        if let Some(end) = closing {
            if c == end {
                closing = None;
            }
            continue;
        }
        let end = match c {
            '\'' | '"' | '`' => Some(c),
            '[' => Some(']'),
            _ => None,
        };
        if end.is_some() {
            closing = end;
            word.clear();
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            word.push(c);
        } else {
            if word.eq_ignore_ascii_case(keyword) {
                return true;
            }
            word.clear();
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_returns_rows() {
        let info = analyze("SELECT 1", DriverKind::Sqlite);
        assert!(info.returns_rows());
        assert!(!info.is_insert());
    }

    #[test]
    fn test_insert_is_not_row_returning() {
        let info = analyze("INSERT INTO todos (title) VALUES (?)", DriverKind::MySql);
        assert!(!info.returns_rows());
        assert!(info.is_insert());
    }

    #[test]
    fn test_insert_returning() {
        let info = analyze(
            "INSERT INTO todos (title) VALUES ($1) RETURNING id",
            DriverKind::Postgres,
        );
        assert!(info.returns_rows());
    }

    #[test]
    fn test_keyword_inside_string_is_ignored() {
        let info = analyze(
            "UPDATE todos SET title = 'returning soon' WHERE id = ?",
            DriverKind::MySql,
        );
        assert!(!info.returning);
        assert!(!info.returns_rows());
    }

    #[test]
    fn test_column_named_like_clause_is_not_returning() {
        for driver in [DriverKind::Sqlite, DriverKind::MySql, DriverKind::Postgres] {
            let info = analyze("INSERT INTO jobs (output) VALUES (?)", driver);
            assert!(!info.returning, "{:?}", driver);
            assert!(!info.returns_rows());
            assert!(info.is_insert());
        }
    }

    #[test]
    fn test_keyword_fallback_skips_quoted_identifiers() {
        assert!(!has_keyword("INSERT INTO jobs ([output]) VALUES (1)", "OUTPUT"));
        assert!(!has_keyword("INSERT INTO jobs (\"returning\") VALUES (1)", "RETURNING"));
        assert!(!has_keyword("INSERT INTO jobs (`output`) VALUES (1)", "OUTPUT"));
        assert!(has_keyword(
            "INSERT INTO jobs (label) OUTPUT inserted.id VALUES (N'x')",
            "OUTPUT"
        ));
    }

    #[test]
    fn test_batch() {
        let info = analyze(
            "CREATE TABLE a (id INT); INSERT INTO a VALUES (1)",
            DriverKind::Sqlite,
        );
        assert!(info.is_batch());
        assert_eq!(
            info.kinds,
            vec![StatementKind::Definition, StatementKind::Insert]
        );
    }

    #[test]
    fn test_session_control() {
        assert!(analyze("BEGIN", DriverKind::Postgres).is_session_control());
        assert!(analyze("USE [tenant_a]", DriverKind::MsSql).is_session_control());
        assert!(!analyze("SELECT 1", DriverKind::MsSql).is_session_control());
    }

    #[test]
    fn test_keyword_fallback() {
        assert_eq!(classify_keyword("with x as (select 1) select * from x"), StatementKind::Query);
        assert_eq!(classify_keyword("REPLACE INTO t VALUES (1)"), StatementKind::Insert);
        assert_eq!(classify_keyword("vacuum"), StatementKind::Other);
    }

    #[test]
    fn test_split_statements_respects_quotes() {
        let parts = split_statements("INSERT INTO t VALUES ('a;b'); SELECT 1;");
        assert_eq!(parts, vec!["INSERT INTO t VALUES ('a;b')", "SELECT 1"]);
    }
}
