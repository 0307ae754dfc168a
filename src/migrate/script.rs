//! SQL script files.
//!
//! A script is named `NNN_description.sql`; the numeric prefix orders it.
//! Its body holds an up section and a down section:
//!
//! ```sql
//! -- migrate:up
//! CREATE TABLE todos (...);
//!
//! -- migrate:down
//! DROP TABLE todos;
//! ```
//!
//! A section marker may name drivers (`-- migrate:up postgres sqlite`); such
//! a section replaces the generic one for those drivers. A statement ends at
//! a line whose last non-blank character is `;`.

use crate::error::{DbError, DbResult};
use crate::models::DriverKind;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

const UP_MARKER: &str = "-- migrate:up";
const DOWN_MARKER: &str = "-- migrate:down";

/// Parsed up and down statements of one script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlScript {
    up: Section,
    down: Section,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Section {
    generic: Vec<String>,
    by_driver: HashMap<DriverKind, Vec<String>>,
}

impl Section {
    fn for_driver(&self, driver: DriverKind) -> &[String] {
        self.by_driver
            .get(&driver)
            .map(Vec::as_slice)
            .unwrap_or(&self.generic)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl SqlScript {
    /// Parse a script body. `name` is only used in error messages.
    pub fn parse(name: &str, body: &str) -> DbResult<Self> {
        let mut script = SqlScript::default();
        let mut target: Option<(Direction, Vec<DriverKind>)> = None;
        let mut statement = String::new();

        for line in body.lines() {
            let trimmed = line.trim();
            if let Some((direction, drivers)) = parse_marker(name, trimmed)? {
                if !statement.trim().is_empty() {
                    script.push(&target, std::mem::take(&mut statement));
                }
                statement.clear();
                target = Some((direction, drivers));
                continue;
            }
            if target.is_none() {
                if trimmed.is_empty() || trimmed.starts_with("--") {
                    continue;
                }
                return Err(DbError::migration(
                    name,
                    format!("statement before '{}' marker", UP_MARKER),
                ));
            }
            if statement.is_empty() && (trimmed.is_empty() || trimmed.starts_with("--")) {
                continue;
            }
            statement.push_str(line);
            statement.push('\n');
            if trimmed.ends_with(';') {
                script.push(&target, std::mem::take(&mut statement));
            }
        }
        if !statement.trim().is_empty() {
            script.push(&target, statement);
        }

        if script.up.generic.is_empty() && script.up.by_driver.is_empty() {
            return Err(DbError::migration(
                name,
                format!("no '{}' section", UP_MARKER),
            ));
        }
        Ok(script)
    }

    fn push(&mut self, target: &Option<(Direction, Vec<DriverKind>)>, statement: String) {
        let Some((direction, drivers)) = target else {
            return;
        };
        let statement = statement.trim().trim_end_matches(';').trim().to_string();
        if statement.is_empty() {
            return;
        }
        let section = match direction {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
        };
        if drivers.is_empty() {
            section.generic.push(statement);
        } else {
            for driver in drivers {
                section
                    .by_driver
                    .entry(*driver)
                    .or_default()
                    .push(statement.clone());
            }
        }
    }

    pub fn up(&self, driver: DriverKind) -> &[String] {
        self.up.for_driver(driver)
    }

    pub fn down(&self, driver: DriverKind) -> &[String] {
        self.down.for_driver(driver)
    }
}

fn parse_marker(name: &str, line: &str) -> DbResult<Option<(Direction, Vec<DriverKind>)>> {
    let (direction, rest) = if let Some(rest) = line.strip_prefix(UP_MARKER) {
        (Direction::Up, rest)
    } else if let Some(rest) = line.strip_prefix(DOWN_MARKER) {
        (Direction::Down, rest)
    } else {
        return Ok(None);
    };
    let drivers = rest
        .split_whitespace()
        .map(|d| {
            d.parse::<DriverKind>()
                .map_err(|e| DbError::migration(name, e.to_string()))
        })
        .collect::<DbResult<Vec<_>>>()?;
    Ok(Some((direction, drivers)))
}

/// Order and name from a `NNN_description.sql` file name.
pub fn parse_file_name(file_name: &str) -> Option<(u64, String)> {
    let stem = file_name.strip_suffix(".sql")?;
    let (prefix, description) = stem.split_once('_')?;
    if prefix.is_empty() || description.is_empty() || !prefix.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    Some((prefix.parse().ok()?, stem.to_string()))
}

/// A script file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    pub order: u64,
    /// File name without the `.sql` extension; recorded in tracking tables.
    pub name: String,
    pub script: SqlScript,
}

/// Load every script in `dir`, ordered by numeric prefix.
///
/// A missing directory holds no scripts. Files that do not match the naming
/// pattern are skipped; two files with the same prefix are an error.
pub async fn load_dir(dir: &Path) -> DbResult<Vec<ScriptFile>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "Script directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(DbError::migration(
                dir.display().to_string(),
                format!("cannot read directory: {}", e),
            ));
        }
    };

    let mut scripts: Vec<ScriptFile> = Vec::new();
    let mut seen: HashMap<u64, String> = HashMap::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| DbError::migration(dir.display().to_string(), e.to_string()))?
    {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some((order, name)) = parse_file_name(&file_name) else {
            debug!(file = %file_name, "Skipping file without NNN_name.sql pattern");
            continue;
        };
        if let Some(existing) = seen.insert(order, name.clone()) {
            return Err(DbError::migration(
                name,
                format!("duplicate order prefix {} (also used by {})", order, existing),
            ));
        }
        let body = tokio::fs::read_to_string(entry.path())
            .await
            .map_err(|e| DbError::migration(name.as_str(), format!("cannot read file: {}", e)))?;
        let script = SqlScript::parse(&name, &body)?;
        scripts.push(ScriptFile {
            order,
            name,
            script,
        });
    }
    scripts.sort_by_key(|s| s.order);
    Ok(scripts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TODOS: &str = "\
-- create the todos table
-- migrate:up
CREATE TABLE todos (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL
);
CREATE INDEX idx_todos_title ON todos (title);

-- migrate:down
DROP TABLE todos;
";

    #[test]
    fn test_parse_sections() {
        let script = SqlScript::parse("001_todos", TODOS).unwrap();
        let up = script.up(DriverKind::Sqlite);
        assert_eq!(up.len(), 2);
        assert!(up[0].starts_with("CREATE TABLE todos ("));
        assert!(up[0].ends_with(')'));
        assert_eq!(up[1], "CREATE INDEX idx_todos_title ON todos (title)");
        assert_eq!(script.down(DriverKind::Sqlite), ["DROP TABLE todos"]);
    }

    #[test]
    fn test_driver_override() {
        let body = "\
-- migrate:up
CREATE TABLE t (id INT);
-- migrate:up postgres
CREATE TABLE t (id SERIAL);
-- migrate:down
DROP TABLE t;
";
        let script = SqlScript::parse("002_t", body).unwrap();
        assert_eq!(script.up(DriverKind::MySql), ["CREATE TABLE t (id INT)"]);
        assert_eq!(script.up(DriverKind::Postgres), ["CREATE TABLE t (id SERIAL)"]);
        assert_eq!(script.down(DriverKind::Postgres), ["DROP TABLE t"]);
    }

    #[test]
    fn test_missing_up_section() {
        let err = SqlScript::parse("003_empty", "-- migrate:down\nDROP TABLE t;").unwrap_err();
        assert!(matches!(err, DbError::Migration { .. }));
    }

    #[test]
    fn test_unknown_driver_in_marker() {
        assert!(SqlScript::parse("004_x", "-- migrate:up oracle\nSELECT 1;").is_err());
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            parse_file_name("001_create_todos.sql"),
            Some((1, "001_create_todos".to_string()))
        );
        assert_eq!(parse_file_name("10_x.sql"), Some((10, "10_x".to_string())));
        assert_eq!(parse_file_name("README.md"), None);
        assert_eq!(parse_file_name("abc_x.sql"), None);
        assert_eq!(parse_file_name("001.sql"), None);
    }

    #[tokio::test]
    async fn test_load_dir_orders_numerically() {
        let dir = TempDir::new().unwrap();
        for name in ["10_ten.sql", "9_nine.sql", "001_one.sql"] {
            std::fs::write(dir.path().join(name), "-- migrate:up\nSELECT 1;\n").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let scripts = load_dir(dir.path()).await.unwrap();
        let names: Vec<_> = scripts.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["001_one", "9_nine", "10_ten"]);
    }

    #[tokio::test]
    async fn test_load_dir_rejects_duplicate_prefix() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("001_a.sql"), "-- migrate:up\nSELECT 1;\n").unwrap();
        std::fs::write(dir.path().join("1_b.sql"), "-- migrate:up\nSELECT 1;\n").unwrap();
        let err = load_dir(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("duplicate order prefix 1"));
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let scripts = load_dir(&dir.path().join("absent")).await.unwrap();
        assert!(scripts.is_empty());
    }
}
