//! Turning raw results into rows of values.

use std::sync::Arc;

use crate::codec::decode::decode_bytes;
use crate::codec::registry::{Parser, ParserRegistry};
use crate::error::{Error, Result};
use crate::protocol::types::Oid;
use crate::transport::{RawResult, RawRow};
use crate::value::Value;

/// Column descriptor of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
}

impl Column {
    pub fn new(name: impl Into<String>, type_oid: Oid) -> Self {
        Self {
            name: name.into(),
            type_oid,
        }
    }
}

/// One converted row.
///
/// Values are kept in column order; lookups by name return the first column with
/// that name.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[Column]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Value of the column named `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c.name == name)?;
        self.values.get(index)
    }

    /// Value at column position `index`.
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `(column name, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .zip(self.values.iter())
    }
}

/// Outcome of a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// The statement returned a result set (possibly empty).
    Rows(Vec<Row>),
    /// The statement reported an affected-row count.
    RowsAffected(u64),
    /// The statement reported neither (DDL, empty query, ...).
    Empty,
}

impl QueryResult {
    /// Rows of the result; empty for non-row results.
    pub fn rows(&self) -> &[Row] {
        match self {
            QueryResult::Rows(rows) => rows,
            _ => &[],
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryResult::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn rows_affected(&self) -> Option<u64> {
        match self {
            QueryResult::RowsAffected(n) => Some(*n),
            _ => None,
        }
    }
}

/// Applies base decoding and registered parsers to a raw result.
pub struct ResultConverter<'a> {
    registry: &'a ParserRegistry,
}

impl<'a> ResultConverter<'a> {
    pub fn new(registry: &'a ParserRegistry) -> Self {
        Self { registry }
    }

    pub fn convert(&self, raw: RawResult) -> Result<QueryResult> {
        match raw {
            RawResult::Rows { columns, rows } => {
                self.convert_rows(columns, rows).map(QueryResult::Rows)
            }
            RawResult::Command {
                rows_affected: Some(n),
            } => Ok(QueryResult::RowsAffected(n)),
            RawResult::Command {
                rows_affected: None,
            } => Ok(QueryResult::Empty),
        }
    }

    fn convert_rows(&self, columns: Vec<Column>, rows: Vec<RawRow>) -> Result<Vec<Row>> {
        // Parsers are resolved once per result, not once per cell.
        let parsers: Vec<Option<Parser>> = columns
            .iter()
            .map(|c| self.registry.get(c.type_oid))
            .collect();
        let columns: Arc<[Column]> = columns.into();

        rows.into_iter()
            .map(|raw| {
                if raw.len() != columns.len() {
                    return Err(Error::Protocol(format!(
                        "row has {} values for {} columns",
                        raw.len(),
                        columns.len()
                    )));
                }
                let values = raw
                    .into_iter()
                    .zip(columns.iter().zip(parsers.iter()))
                    .map(|(cell, (column, parser))| {
                        let value = match cell {
                            None => Value::Null,
                            Some(bytes) => decode_bytes(column.type_oid, &bytes)?,
                        };
                        match parser {
                            Some(parser) => map_leaves(value, parser),
                            None => Ok(value),
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Row::new(Arc::clone(&columns), values))
            })
            .collect()
    }
}

/// Apply `parser` to every non-NULL leaf of `value`.
pub fn map_leaves(value: Value, parser: &Parser) -> Result<Value> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Array(items) => items
            .into_iter()
            .map(|item| map_leaves(item, parser))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => parser(other),
    }
}
