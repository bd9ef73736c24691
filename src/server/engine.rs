//! In-memory catalog backing the mock server.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use log::debug;
use thiserror::Error;

use crate::protocol::{ErrorCode, Response, RowSet, Value};

use super::statement::{ColumnDef, Filter, Projection, Statement};

pub const DEFAULT_DATABASE: &str = "default";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("database '{0}' does not exist")]
    UnknownDatabase(String),
    #[error("database '{0}' already exists")]
    DatabaseExists(String),
    #[error("table '{0}' does not exist")]
    UnknownTable(String),
    #[error("table '{0}' already exists")]
    TableExists(String),
    #[error("column '{0}' does not exist")]
    UnknownColumn(String),
    #[error("column '{0}' is named twice")]
    DuplicateColumn(String),
    #[error("expected {expected} values, got {actual}")]
    ValueCountMismatch { expected: usize, actual: usize },
    #[error("serial column '{0}' has no values left")]
    SerialExhausted(String),
}

#[derive(Debug, Default)]
struct Table {
    columns: Vec<ColumnDef>,
    rows: Vec<Vec<Value>>,
    next_serial: i64,
}

impl Table {
    fn column_index(&self, name: &str) -> Result<usize, EngineError> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| EngineError::UnknownColumn(name.to_string()))
    }

    fn insert(&mut self, columns: &[String], rows: Vec<Vec<Value>>) -> Result<u64, EngineError> {
        let targets: Vec<usize> = if columns.is_empty() {
            (0..self.columns.len()).collect()
        } else {
            columns
                .iter()
                .map(|c| self.column_index(c))
                .collect::<Result<_, _>>()?
        };
        for (i, &index) in targets.iter().enumerate() {
            if targets[..i].contains(&index) {
                return Err(EngineError::DuplicateColumn(
                    self.columns[index].name.clone(),
                ));
            }
        }

        // Validate everything before touching the table so a bad row inserts nothing.
        for row in &rows {
            if row.len() != targets.len() {
                return Err(EngineError::ValueCountMismatch {
                    expected: targets.len(),
                    actual: row.len(),
                });
            }
        }

        let mut serial = self.next_serial;
        let mut built = Vec::with_capacity(rows.len());
        for values in rows {
            let mut slots = vec![None; self.columns.len()];
            for (&index, value) in targets.iter().zip(values) {
                slots[index] = Some(value);
            }

            let mut row = Vec::with_capacity(slots.len());
            for (value, column) in slots.into_iter().zip(&self.columns) {
                row.push(match value {
                    Some(Value::Integer(i)) if column.serial => {
                        serial = serial.max(i);
                        Value::Integer(i)
                    }
                    Some(value) => value,
                    None if column.serial => {
                        serial = serial
                            .checked_add(1)
                            .ok_or_else(|| EngineError::SerialExhausted(column.name.clone()))?;
                        Value::Integer(serial)
                    }
                    None => Value::Null,
                });
            }
            built.push(row);
        }

        let inserted = built.len() as u64;
        self.next_serial = serial;
        self.rows.extend(built);
        Ok(inserted)
    }

    fn select(
        &self,
        projection: &Projection,
        filter: Option<&Filter>,
    ) -> Result<RowSet, EngineError> {
        let indices: Vec<usize> = match projection {
            Projection::All => (0..self.columns.len()).collect(),
            Projection::Columns(names) => names
                .iter()
                .map(|c| self.column_index(c))
                .collect::<Result<_, _>>()?,
        };
        let filter = filter
            .map(|f| self.column_index(&f.column).map(|i| (i, &f.value)))
            .transpose()?;

        let mut set = RowSet::new(
            indices
                .iter()
                .map(|&i| self.columns[i].name.clone())
                .collect(),
        );
        for row in &self.rows {
            if let Some((index, value)) = filter {
                if &row[index] != value {
                    continue;
                }
            }
            set.push(indices.iter().map(|&i| row[i].clone()).collect());
        }

        Ok(set)
    }
}

#[derive(Debug, Default)]
struct Database {
    tables: HashMap<String, Table>,
}

impl Database {
    fn table(&mut self, name: &str) -> Result<&mut Table, EngineError> {
        self.tables
            .get_mut(&name.to_lowercase())
            .ok_or_else(|| EngineError::UnknownTable(name.to_string()))
    }
}

/// All databases known to one server, shared between sessions.
#[derive(Debug)]
pub struct Catalog {
    databases: HashMap<String, Database>,
}

impl Default for Catalog {
    fn default() -> Self {
        let mut databases = HashMap::new();
        databases.insert(DEFAULT_DATABASE.to_string(), Database::default());
        Self { databases }
    }
}

impl Catalog {
    fn database(&mut self, name: &str) -> Result<&mut Database, EngineError> {
        self.databases
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownDatabase(name.to_string()))
    }
}

/// Per-connection state: the catalog plus the database selected with `USE`.
pub struct Session {
    catalog: Arc<Mutex<Catalog>>,
    database: String,
}

impl Session {
    pub fn new(catalog: Arc<Mutex<Catalog>>) -> Self {
        Self {
            catalog,
            database: DEFAULT_DATABASE.to_string(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Parses and runs one command, turning every failure into an error reply.
    pub fn execute(&mut self, text: &str) -> Response {
        let statement = match Statement::try_from(text) {
            Ok(statement) => statement,
            Err(e) => {
                return Response::Error {
                    code: ErrorCode::Syntax,
                    message: e.to_string(),
                };
            }
        };

        debug!("executing {statement:?} in '{}'", self.database);
        match self.run(statement) {
            Ok(response) => response,
            Err(e) => Response::Error {
                code: ErrorCode::Execution,
                message: e.to_string(),
            },
        }
    }

    fn run(&mut self, statement: Statement) -> Result<Response, EngineError> {
        let mut catalog = self
            .catalog
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let ack = |affected| Response::Acknowledgement { affected };

        match statement {
            Statement::CreateDatabase { name } => {
                let name = name.to_lowercase();
                if catalog.databases.contains_key(&name) {
                    return Err(EngineError::DatabaseExists(name));
                }
                catalog.databases.insert(name, Database::default());
                Ok(ack(0))
            }
            Statement::Use { name } => {
                let name = name.to_lowercase();
                catalog.database(&name)?;
                self.database = name;
                Ok(ack(0))
            }
            Statement::CreateTable { name, columns } => {
                for (i, column) in columns.iter().enumerate() {
                    if columns[..i]
                        .iter()
                        .any(|c| c.name.eq_ignore_ascii_case(&column.name))
                    {
                        return Err(EngineError::DuplicateColumn(column.name.clone()));
                    }
                }

                let database = catalog.database(&self.database)?;
                let key = name.to_lowercase();
                if database.tables.contains_key(&key) {
                    return Err(EngineError::TableExists(name));
                }
                database.tables.insert(
                    key,
                    Table {
                        columns,
                        ..Table::default()
                    },
                );
                Ok(ack(0))
            }
            Statement::DropTable { name } => {
                let database = catalog.database(&self.database)?;
                database
                    .tables
                    .remove(&name.to_lowercase())
                    .ok_or(EngineError::UnknownTable(name))?;
                Ok(ack(0))
            }
            Statement::Insert {
                table,
                columns,
                rows,
            } => {
                let table = catalog.database(&self.database)?.table(&table)?;
                Ok(ack(table.insert(&columns, rows)?))
            }
            Statement::Select {
                table,
                projection,
                filter,
            } => {
                let table = catalog.database(&self.database)?.table(&table)?;
                Ok(Response::RowSet(table.select(&projection, filter.as_ref())?))
            }
        }
    }
}
