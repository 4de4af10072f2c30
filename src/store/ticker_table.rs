use rusqlite::Connection;

use crate::model::{self, IngestError};

/// A table symbols may be enumerated from. Only registered tables ever reach SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTable {
    pub name: String,
    pub column: String,
    pub active_only: bool,
}

impl SourceTable {
    pub fn new(name: &str, column: &str, active_only: bool) -> model::Result<SourceTable> {
        for ident in [name, column] {
            if !is_identifier(ident) {
                return Err(IngestError::Config(format!("invalid identifier: {ident}")));
            }
        }
        Ok(SourceTable {
            name: name.to_string(),
            column: column.to_string(),
            active_only,
        })
    }

    /// Parses `name[:column[:active]]`, e.g. `sp500_list_2025_jun:ticker:active`.
    pub fn parse(spec: &str) -> model::Result<SourceTable> {
        let mut parts = spec.trim().split(':');
        let name = parts.next().unwrap_or_default();
        let column = parts.next().unwrap_or("symbol");
        let active_only = match parts.next() {
            None => false,
            Some("active") => true,
            Some(other) => {
                return Err(IngestError::Config(format!(
                    "unknown ticker table flag '{other}' in '{spec}'"
                )));
            }
        };
        SourceTable::new(name, column, active_only)
    }

    fn query(&self) -> String {
        let mut sql = format!("SELECT \"{}\" FROM \"{}\"", self.column, self.name);
        if self.active_only {
            sql.push_str(" WHERE is_active = 1");
        }
        sql
    }

    /// Reads every symbol of the table.
    pub fn read_symbols(&self, conn: &Connection) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare(&self.query())?;
        let symbols = stmt.query_map([], |row| row.get(0))?;
        symbols.collect()
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Allow-list of source tables.
#[derive(Debug, Clone)]
pub struct TickerTables {
    tables: Vec<SourceTable>,
}

impl Default for TickerTables {
    fn default() -> Self {
        TickerTables {
            tables: vec![
                SourceTable {
                    name: "sp500_list_2025_jun".into(),
                    column: "ticker".into(),
                    active_only: true,
                },
                SourceTable {
                    name: "spxl_tickers".into(),
                    column: "symbol".into(),
                    active_only: false,
                },
            ],
        }
    }
}

impl TickerTables {
    /// Adds or replaces a table definition.
    pub fn register(&mut self, table: SourceTable) {
        self.tables.retain(|t| t.name != table.name);
        self.tables.push(table);
    }

    pub fn lookup(&self, name: &str) -> model::Result<&SourceTable> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| IngestError::Config(format!("unknown ticker table: {name}")))
    }

    pub fn names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }
}
