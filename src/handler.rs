//! Result sinks for the query state machines.

use bytes::Bytes;

use crate::codec::Column;
use crate::error::Result;
use crate::protocol::backend::query::{CommandComplete, DataRow, RowDescription};
use crate::transport::RawResult;

/// Receives the results of a query as the state machine reads them.
///
/// Callback patterns by statement type:
/// - rows: `result_start` → `row*` → `result_end`
/// - INSERT/UPDATE/DELETE/DDL: `result_end` only
/// - empty query string: `empty_query`
///
/// A simple query with several statements repeats the pattern once per statement.
pub trait ResultHandler {
    fn result_start(&mut self, cols: RowDescription<'_>) -> Result<()>;

    fn row(&mut self, row: DataRow<'_>) -> Result<()>;

    fn result_end(&mut self, complete: CommandComplete<'_>) -> Result<()>;

    fn empty_query(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Collects the last result of a query into a [`RawResult`].
#[derive(Debug, Default)]
pub struct CollectHandler {
    columns: Option<Vec<Column>>,
    rows: Vec<Vec<Option<Bytes>>>,
    last: Option<RawResult>,
}

impl CollectHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last complete result; a query that produced none yields an empty command.
    pub fn into_result(self) -> RawResult {
        self.last.unwrap_or(RawResult::Command {
            rows_affected: None,
        })
    }
}

impl ResultHandler for CollectHandler {
    fn result_start(&mut self, cols: RowDescription<'_>) -> Result<()> {
        self.columns = Some(
            cols.fields()
                .iter()
                .map(|f| Column::new(f.name, f.type_oid()))
                .collect(),
        );
        self.rows.clear();
        Ok(())
    }

    fn row(&mut self, row: DataRow<'_>) -> Result<()> {
        let cells = row
            .cells()?
            .into_iter()
            .map(|cell| cell.map(Bytes::copy_from_slice))
            .collect();
        self.rows.push(cells);
        Ok(())
    }

    fn result_end(&mut self, complete: CommandComplete<'_>) -> Result<()> {
        self.last = Some(match self.columns.take() {
            Some(columns) => RawResult::Rows {
                columns,
                rows: std::mem::take(&mut self.rows),
            },
            None => RawResult::Command {
                rows_affected: complete.rows_affected(),
            },
        });
        Ok(())
    }

    fn empty_query(&mut self) -> Result<()> {
        self.last = Some(RawResult::Command {
            rows_affected: None,
        });
        Ok(())
    }
}
