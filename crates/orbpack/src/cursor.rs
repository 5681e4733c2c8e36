/// A cursor tracks how much of a borrowed input chunk has been consumed.
///
/// Decoders never look past what they need, so a chunk may hold the end of one
/// value and the start of the next.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    slice: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(slice: &'a [u8]) -> Self {
        Self { slice, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.slice.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek_byte(&self) -> Option<u8> {
        self.slice.get(self.pos).copied()
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        let byte = self.peek_byte()?;
        self.pos += 1;
        Some(byte)
    }

    /// Takes at most `max` bytes; returns an empty slice once exhausted.
    pub fn take_up_to(&mut self, max: usize) -> &'a [u8] {
        let len = max.min(self.remaining());
        let slice = &self.slice[self.pos..self.pos + len];
        self.pos += len;
        slice
    }

    pub fn as_slice(&self) -> &'a [u8] {
        &self.slice[self.pos..]
    }
}
