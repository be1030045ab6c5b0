//! Row and command results.

use std::mem::size_of;

use zerocopy::byteorder::big_endian::{I16 as I16BE, I32 as I32BE, U16 as U16BE, U32 as U32BE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::{read_bytes, read_cstr, read_i32, read_u16};
use crate::protocol::types::{FormatCode, Oid};

/// Fixed-size tail of a field description (18 bytes).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct FieldDescriptionTail {
    pub table_oid: U32BE,
    pub column_id: I16BE,
    pub type_oid: U32BE,
    pub type_size: I16BE,
    pub type_modifier: I32BE,
    pub format: U16BE,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldDescription<'a> {
    pub name: &'a str,
    pub tail: &'a FieldDescriptionTail,
}

impl FieldDescription<'_> {
    pub fn type_oid(&self) -> Oid {
        self.tail.type_oid.get()
    }

    pub fn format(&self) -> FormatCode {
        FormatCode::from_u16(self.tail.format.get())
    }
}

/// RowDescription: the columns of the rows that follow.
#[derive(Debug)]
pub struct RowDescription<'a> {
    fields: Vec<FieldDescription<'a>>,
}

impl<'a> RowDescription<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        const TAIL_SIZE: usize = size_of::<FieldDescriptionTail>();

        let (count, mut data) = read_u16(payload)?;
        let mut fields = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let (name, rest) = read_cstr(data)?;
            let (tail, rest) = read_bytes(rest, TAIL_SIZE)?;
            let tail = FieldDescriptionTail::ref_from_bytes(tail)?;
            fields.push(FieldDescription { name, tail });
            data = rest;
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[FieldDescription<'a>] {
        &self.fields
    }
}

/// DataRow: one row of optional cells.
#[derive(Debug, Clone, Copy)]
pub struct DataRow<'a> {
    count: u16,
    cells: &'a [u8],
}

impl<'a> DataRow<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (count, cells) = read_u16(payload)?;
        Ok(Self { count, cells })
    }

    pub fn len(&self) -> usize {
        usize::from(self.count)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Cells in column order; `None` is NULL.
    pub fn cells(&self) -> Result<Vec<Option<&'a [u8]>>> {
        let mut out = Vec::with_capacity(self.len());
        let mut data = self.cells;
        for _ in 0..self.count {
            let (len, rest) = read_i32(data)?;
            data = rest;
            if len < 0 {
                out.push(None);
                continue;
            }
            let len = usize::try_from(len)
                .map_err(|_| Error::Protocol(format!("DataRow: bad cell length {len}")))?;
            let (cell, rest) = read_bytes(data, len)?;
            out.push(Some(cell));
            data = rest;
        }
        Ok(out)
    }
}

/// CommandComplete: the command tag, e.g. `INSERT 0 1` or `COPY 3`.
#[derive(Debug, Clone, Copy)]
pub struct CommandComplete<'a> {
    pub tag: &'a str,
}

impl<'a> CommandComplete<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (tag, _) = read_cstr(payload)?;
        Ok(Self { tag })
    }

    /// Row count of the tag, for commands that report one.
    pub fn rows_affected(&self) -> Option<u64> {
        let mut words = self.tag.split_whitespace();
        let command = words.next()?;
        let count = match command {
            // INSERT carries the legacy OID before the count
            "INSERT" => words.nth(1),
            "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "COPY" | "MOVE" | "FETCH" => words.next(),
            _ => None,
        }?;
        count.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tags() {
        let count = |tag| CommandComplete { tag }.rows_affected();
        assert_eq!(count("INSERT 0 1"), Some(1));
        assert_eq!(count("UPDATE 10"), Some(10));
        assert_eq!(count("COPY 3"), Some(3));
        assert_eq!(count("CREATE TABLE"), None);
        assert_eq!(count("BEGIN"), None);
    }

    #[test]
    fn data_row_cells() {
        let payload = [0, 3, 0, 0, 0, 1, b'7', 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0];
        let row = DataRow::parse(&payload);
        let cells = row.and_then(|r| r.cells()).unwrap_or_default();
        assert_eq!(cells, vec![Some(&b"7"[..]), None, Some(&b""[..])]);
    }

    #[test]
    fn data_row_truncated() {
        let payload = [0, 1, 0, 0, 0, 5, b'a'];
        assert!(DataRow::parse(&payload).and_then(|r| r.cells()).is_err());
    }

    #[test]
    fn row_description() {
        let mut payload = vec![0, 1];
        payload.extend_from_slice(b"id\0");
        payload.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        payload.extend_from_slice(&23_u32.to_be_bytes());
        payload.extend_from_slice(&[0, 4, 0xff, 0xff, 0xff, 0xff, 0, 0]);
        let desc = RowDescription::parse(&payload);
        let fields: Vec<(String, Oid)> = desc
            .map(|d| {
                d.fields()
                    .iter()
                    .map(|f| (f.name.to_string(), f.type_oid()))
                    .collect()
            })
            .unwrap_or_default();
        assert_eq!(fields, vec![("id".to_string(), 23)]);
    }
}
