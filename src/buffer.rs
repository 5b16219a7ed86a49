//! Scratch buffer reused across a connection's message lifecycle.

/// Buffer owned by a single connection and reused message-to-message to avoid
/// per-message heap churn on the read side.
#[derive(Debug, Default)]
pub struct BufferSet {
    /// Raw bytes of the message currently being parsed (payload only, no header).
    pub read_buffer: Vec<u8>,
    /// Type byte of the message currently in `read_buffer`.
    pub type_byte: u8,
}

impl BufferSet {
    /// Create an empty buffer set.
    pub fn new() -> Self {
        Self::default()
    }
}
