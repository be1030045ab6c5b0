//! Reusable message buffers shared by the state machines and the I/O driver.

pub struct BufferSet {
    /// Payload of the last message read (length prefix stripped)
    pub read_buffer: Vec<u8>,
    /// Outgoing messages; the driver clears it once written
    pub write_buffer: Vec<u8>,
    /// Type byte of the last message read
    pub type_byte: u8,
}

impl BufferSet {
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::with_capacity(8192),
            write_buffer: Vec::with_capacity(8192),
            type_byte: 0,
        }
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}
