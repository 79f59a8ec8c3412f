//! Per-connection message buffers
//!
//! Each connection owns a small ring of fixed-size message slots and a cursor
//! naming the slot the next send or receive uses. Rotating the cursor after
//! every request keeps a new message from landing on top of one that has not
//! been consumed yet.

use crate::error::{KvError, Result};

/// Default number of message slots per connection
pub const MESSAGE_BUFFER_COUNT: usize = 4;

/// Ring of message slots with a current-slot cursor
pub struct ConnectionBuffers {
    slots: Vec<Box<[u8]>>,
    current: usize,
}

impl ConnectionBuffers {
    pub fn new(count: usize, slot_size: usize) -> Result<Self> {
        if count == 0 {
            return Err(KvError::Config("message buffer count cannot be 0".into()));
        }
        if slot_size == 0 {
            return Err(KvError::Config("message buffer size cannot be 0".into()));
        }

        let slots = (0..count)
            .map(|_| vec![0u8; slot_size].into_boxed_slice())
            .collect();

        Ok(Self { slots, current: 0 })
    }

    /// The slot under the cursor
    pub fn current(&self) -> &[u8] {
        &self.slots[self.current]
    }

    pub fn current_mut(&mut self) -> &mut [u8] {
        &mut self.slots[self.current]
    }

    pub fn slot(&self, index: usize) -> &[u8] {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.slots[index]
    }

    pub fn cursor(&self) -> usize {
        self.current
    }

    /// Move the cursor to the next slot, wrapping around the ring
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot_size(&self) -> usize {
        self.slots[0].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_wraps() {
        let mut buffers = ConnectionBuffers::new(3, 16).unwrap();
        assert_eq!(buffers.cursor(), 0);

        for expected in [1, 2, 0, 1] {
            buffers.advance();
            assert_eq!(buffers.cursor(), expected);
        }

        buffers.reset();
        assert_eq!(buffers.cursor(), 0);
    }

    #[test]
    fn test_slots_are_independent() {
        let mut buffers = ConnectionBuffers::new(2, 8).unwrap();
        buffers.current_mut()[0] = 42;
        buffers.advance();
        buffers.current_mut()[0] = 7;

        assert_eq!(buffers.slot(0)[0], 42);
        assert_eq!(buffers.slot(1)[0], 7);
        assert_eq!(buffers.slot_size(), 8);
    }

    #[test]
    fn test_rejects_empty_ring() {
        assert!(ConnectionBuffers::new(0, 16).is_err());
        assert!(ConnectionBuffers::new(4, 0).is_err());
    }
}
