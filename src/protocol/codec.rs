//! Big-endian read/write primitives and the framed message builder.

use zerocopy::FromBytes;
use zerocopy::byteorder::big_endian::{I32 as I32BE, U16 as U16BE, U32 as U32BE};

use crate::error::{Error, Result};

/// Split `N` bytes off the front of `data`.
#[inline]
fn take<'a, const N: usize>(data: &'a [u8], what: &str) -> Result<(&'a [u8], &'a [u8])> {
    data.split_at_checked(N).ok_or_else(|| {
        Error::Protocol(format!("{what}: buffer too short: {} < {N}", data.len()))
    })
}

macro_rules! read_be {
    ($name:ident, $ty:ty, $wire:ty, $n:literal) => {
        #[doc = concat!("Read a big-endian `", stringify!($ty), "`.")]
        #[inline]
        pub fn $name(data: &[u8]) -> Result<($ty, &[u8])> {
            let (head, rest) = take::<$n>(data, stringify!($name))?;
            let value = <$wire>::ref_from_bytes(head)
                .map_err(|e| Error::Protocol(format!("{}: {e:?}", stringify!($name))))?
                .get();
            Ok((value, rest))
        }
    };
}

read_be!(read_u16, u16, U16BE, 2);
read_be!(read_i32, i32, I32BE, 4);
read_be!(read_u32, u32, U32BE, 4);

#[inline]
pub fn read_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((&b, rest)) => Ok((b, rest)),
        None => Err(Error::Protocol("read_u8: empty buffer".into())),
    }
}

/// Read `len` raw bytes.
#[inline]
pub fn read_bytes(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    data.split_at_checked(len).ok_or_else(|| {
        Error::Protocol(format!(
            "read_bytes: buffer too short: {} < {len}",
            data.len()
        ))
    })
}

/// Read a NUL-terminated string, returning it without the terminator.
#[inline]
pub fn read_cstring(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let pos = memchr::memchr(0, data)
        .ok_or_else(|| Error::Protocol("read_cstring: no null terminator found".into()))?;
    let (s, rest) = data.split_at(pos);
    Ok((s, rest.get(1..).unwrap_or_default()))
}

#[inline]
pub fn read_cstr(data: &[u8]) -> Result<(&str, &[u8])> {
    let (bytes, rest) = read_cstring(data)?;
    let s = simdutf8::compat::from_utf8(bytes)
        .map_err(|e| Error::Protocol(format!("read_cstr: invalid UTF-8: {e}")))?;
    Ok((s, rest))
}

/// Writes one framed message and back-fills its length on [`finish`](Self::finish).
///
/// The type byte is not counted in the length; the length field counts itself.
pub struct MessageBuilder<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
}

impl<'a> MessageBuilder<'a> {
    pub fn new(buf: &'a mut Vec<u8>, type_byte: u8) -> Self {
        buf.push(type_byte);
        Self::new_startup(buf)
    }

    /// Startup-style message without a type byte.
    pub fn new_startup(buf: &'a mut Vec<u8>) -> Self {
        let start = buf.len();
        buf.extend_from_slice(&[0; 4]);
        Self { buf, start }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn write_cstr(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Count prefix for a list of `len` items.
    pub fn write_count(&mut self, len: usize) -> Result<()> {
        let n = i16::try_from(len)
            .map_err(|_| Error::InvalidUsage(format!("too many items for one message: {len}")))?;
        self.write_i16(n);
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        let len = i32::try_from(self.buf.len() - self.start)
            .map_err(|_| Error::InvalidUsage("message exceeds 2 GiB".into()))?;
        if let Some(slot) = self.buf.get_mut(self.start..self.start + 4) {
            slot.copy_from_slice(&len.to_be_bytes());
        }
        Ok(())
    }
}
