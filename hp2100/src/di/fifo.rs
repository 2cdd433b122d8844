//! The DI card's tagged FIFO.
//!
//! Each entry holds a 16-bit word plus four tag bits which carry the
//! bus context of the byte(s) in it through the buffer.  In packed
//! mode an entry holds two bytes, upper first; the input and output
//! byte pointers say which half is next.
use std::collections::VecDeque;

use bitflags::bitflags;
use serde::Serialize;

bitflags! {
    /// Tag bits stored above the data word of a FIFO entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct Tags: u32 {
        /// The byte was (or is to be) sent with ATN asserted.
        const ATN = 1 << 16;
        /// The byte was (or is to be) sent with EOI asserted.
        const EOI = 1 << 17;
        /// The DMA transfer ended with this entry.
        const EDT = 1 << 18;
        /// Last byte received.
        const LBR = 1 << 19;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct FifoStatus: u8 {
        const EMPTY     = 1 << 0;
        const HALF_FULL = 1 << 1;
        const FULL      = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FifoEntry(u32);

impl FifoEntry {
    pub fn new(data: u16, tags: Tags) -> FifoEntry {
        FifoEntry(u32::from(data) | tags.bits())
    }

    pub fn data(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn tags(&self) -> Tags {
        Tags::from_bits_truncate(self.0)
    }

    fn add(&mut self, byte: u8, tags: Tags) {
        self.0 |= u32::from(byte) | tags.bits();
    }
}

/// Which half of a packed entry is next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BytePointer {
    Upper,
    Lower,
}

/// Who is putting data in (or taking it out of) the FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FifoAccess {
    /// A word at a time, from the I/O data bus.
    Cpu,
    /// A byte at a time, from the HP-IB.
    Bus,
    /// A byte looped back from the card's own output, stored in both
    /// halves of the entry.
    Diagnostic,
}

#[derive(Debug, Clone, Serialize)]
pub struct Fifo {
    entries: VecDeque<FifoEntry>,
    capacity: usize,
    input_pointer: BytePointer,
    output_pointer: BytePointer,
}

impl Fifo {
    pub fn with_capacity(capacity: usize) -> Fifo {
        Fifo {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            input_pointer: BytePointer::Upper,
            output_pointer: BytePointer::Upper,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn status(&self) -> FifoStatus {
        let mut status = FifoStatus::empty();
        if self.is_empty() {
            status |= FifoStatus::EMPTY;
        }
        if self.entries.len() * 2 >= self.capacity {
            status |= FifoStatus::HALF_FULL;
        }
        if self.is_full() {
            status |= FifoStatus::FULL;
        }
        status
    }

    pub fn input_pointer(&self) -> BytePointer {
        self.input_pointer
    }

    pub fn output_pointer(&self) -> BytePointer {
        self.output_pointer
    }

    pub fn reset_pointers(&mut self) {
        self.input_pointer = BytePointer::Upper;
        self.output_pointer = BytePointer::Upper;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.reset_pointers();
    }

    /// True when the oldest entry is complete, i.e. it is not a
    /// packed entry still waiting for its lower byte.
    pub fn word_available(&self) -> bool {
        match self.entries.len() {
            0 => false,
            1 => self.input_pointer == BytePointer::Upper,
            _ => true,
        }
    }

    /// Appends a whole entry.  Returns false (and changes nothing) if
    /// the FIFO is full.
    pub fn push_word(&mut self, data: u16, tags: Tags) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries.push_back(FifoEntry::new(data, tags));
        true
    }

    /// Appends one byte.  In packed mode the byte goes into the upper
    /// half of a new entry or the lower half of the newest one, as
    /// the input pointer says.  Returns false (and changes nothing)
    /// if a new entry is needed and the FIFO is full.
    pub fn push_byte(&mut self, byte: u8, tags: Tags, packed: bool) -> bool {
        if !packed {
            return self.push_word(u16::from(byte), tags);
        }
        if self.input_pointer == BytePointer::Lower {
            if let Some(entry) = self.entries.back_mut() {
                entry.add(byte, tags);
                self.input_pointer = BytePointer::Upper;
                return true;
            }
        }
        if !self.push_word(u16::from(byte) << 8, tags) {
            return false;
        }
        self.input_pointer = BytePointer::Lower;
        true
    }

    /// Closes a packed entry which has only its upper byte.
    pub fn complete_entry(&mut self) {
        self.input_pointer = BytePointer::Upper;
    }

    pub fn pop_word(&mut self) -> Option<FifoEntry> {
        let entry = self.entries.pop_front();
        if self.entries.is_empty() {
            self.output_pointer = BytePointer::Upper;
        }
        entry
    }

    /// Removes the next byte to be sent on the bus, with the tags
    /// that apply to it.  In packed mode, the upper byte of an entry
    /// carries only its ATN tag; the other tags belong to the lower
    /// (last) byte.  When `odd` is set, an entry tagged EDT ends after
    /// its upper byte.
    pub fn pop_byte(&mut self, packed: bool, odd: bool) -> Option<(u8, Tags)> {
        let entry = *self.entries.front()?;
        let tags = entry.tags();
        if !packed {
            self.entries.pop_front();
            return Some(((entry.data() & 0xFF) as u8, tags));
        }
        match self.output_pointer {
            BytePointer::Upper => {
                let byte = (entry.data() >> 8) as u8;
                if odd && tags.contains(Tags::EDT) {
                    self.pop_word();
                    Some((byte, tags))
                } else {
                    self.output_pointer = BytePointer::Lower;
                    Some((byte, tags & Tags::ATN))
                }
            }
            BytePointer::Lower => {
                self.output_pointer = BytePointer::Upper;
                self.pop_word();
                Some(((entry.data() & 0xFF) as u8, tags))
            }
        }
    }

    /// Adds `tags` to the newest entry.  Returns false if the FIFO is
    /// empty.
    pub fn tag_newest(&mut self, tags: Tags) -> bool {
        match self.entries.back_mut() {
            Some(entry) => {
                entry.0 |= tags.bits();
                true
            }
            None => false,
        }
    }

    pub fn newest(&self) -> Option<FifoEntry> {
        self.entries.back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::{proptest, Arbitrary};

    #[test]
    fn test_packed_bytes_share_an_entry() {
        let mut fifo = Fifo::with_capacity(16);
        assert!(fifo.push_byte(0x12, Tags::empty(), true));
        assert!(!fifo.word_available());
        assert!(fifo.push_byte(0x34, Tags::EOI, true));
        assert!(fifo.word_available());
        assert_eq!(fifo.len(), 1);
        let entry = fifo.pop_word().expect("an entry");
        assert_eq!(entry.data(), 0x1234);
        assert_eq!(entry.tags(), Tags::EOI);
    }

    #[test]
    fn test_packed_byte_unload_order() {
        let mut fifo = Fifo::with_capacity(16);
        assert!(fifo.push_word(0xABCD, Tags::ATN | Tags::EOI));
        assert_eq!(fifo.pop_byte(true, false), Some((0xAB, Tags::ATN)));
        assert_eq!(fifo.pop_byte(true, false), Some((0xCD, Tags::ATN | Tags::EOI)));
        assert_eq!(fifo.pop_byte(true, false), None);
    }

    #[test]
    fn test_odd_final_word() {
        let mut fifo = Fifo::with_capacity(16);
        assert!(fifo.push_word(0x4142, Tags::EDT));
        assert_eq!(fifo.pop_byte(true, true), Some((0x41, Tags::EDT)));
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_half_and_full_transitions() {
        let mut fifo = Fifo::with_capacity(128);
        for n in 1..=128 {
            assert!(fifo.push_byte(n as u8, Tags::empty(), false));
            let status = fifo.status();
            assert_eq!(status.contains(FifoStatus::HALF_FULL), n >= 64, "after {n} loads");
            assert_eq!(status.contains(FifoStatus::FULL), n == 128, "after {n} loads");
        }
        assert!(!fifo.push_byte(0, Tags::empty(), false));
        assert_eq!(fifo.len(), 128);
    }

    #[derive(Arbitrary, Debug, Clone, Copy)]
    enum Operation {
        LoadByte(u8, bool),
        LoadWord(u16),
        UnloadByte(bool),
        UnloadWord,
        Clear,
    }

    #[proptest]
    fn occupancy_stays_in_range(
        #[strategy(1usize..40)] capacity: usize,
        operations: Vec<Operation>,
    ) {
        let mut fifo = Fifo::with_capacity(capacity);
        for op in operations {
            let before = fifo.len();
            match op {
                Operation::LoadByte(byte, packed) => {
                    fifo.push_byte(byte, Tags::empty(), packed);
                }
                Operation::LoadWord(word) => {
                    fifo.push_word(word, Tags::empty());
                }
                Operation::UnloadByte(packed) => {
                    if fifo.pop_byte(packed, false).is_none() {
                        assert_eq!(before, 0);
                    }
                }
                Operation::UnloadWord => {
                    if fifo.pop_word().is_none() {
                        assert_eq!(before, 0);
                    }
                }
                Operation::Clear => fifo.clear(),
            }
            assert!(fifo.len() <= capacity);
        }
    }
}
