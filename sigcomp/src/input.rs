//! Cursor over the compressed part of a SigComp message, feeding the
//! INPUT-BYTES, INPUT-BITS and INPUT-HUFFMAN instructions.

pub struct InputCursor {
    data: Vec<u8>,
    byte_pos: usize,
    // bits of data[byte_pos] already handed out
    bit_pos: u8,
    // P bit in force when the current partial byte was started
    lsb_first: bool,
}

impl InputCursor {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
            lsb_first: false,
        }
    }

    pub fn remaining_bits(&self) -> usize {
        (self.data.len() - self.byte_pos) * 8 - self.bit_pos as usize
    }

    pub fn remaining_bytes(&self) -> usize {
        let partial = usize::from(self.bit_pos > 0);
        self.data.len() - self.byte_pos - partial
    }

    fn discard_partial_byte(&mut self) {
        if self.bit_pos > 0 {
            self.byte_pos += 1;
            self.bit_pos = 0;
        }
    }

    /// Byte-aligned read; a partially consumed byte is dropped first.
    /// Returns `None` without consuming anything when the input is too short.
    pub fn read_bytes(&mut self, length: usize) -> Option<Vec<u8>> {
        if self.remaining_bytes() < length {
            return None;
        }
        self.discard_partial_byte();
        let bytes = self.data[self.byte_pos..self.byte_pos + length].to_vec();
        self.byte_pos += length;
        Some(bytes)
    }

    /// Read `count` (at most 16) bits. Bits are taken from each byte MSB
    /// first, or LSB first when `lsb_first` (the P bit) is set, and packed
    /// so that the first bit taken is the most significant bit of the
    /// result. Changing the P bit mid-byte drops the rest of that byte.
    pub fn read_bits(&mut self, count: u8, lsb_first: bool) -> Option<u16> {
        debug_assert!(count <= 16);
        if lsb_first != self.lsb_first {
            self.discard_partial_byte();
            self.lsb_first = lsb_first;
        }
        if self.remaining_bits() < count as usize {
            return None;
        }
        let mut value: u16 = 0;
        for _ in 0..count {
            let byte = self.data[self.byte_pos];
            let shift = if lsb_first {
                self.bit_pos
            } else {
                7 - self.bit_pos
            };
            value = (value << 1) | u16::from((byte >> shift) & 1);
            self.bit_pos += 1;
            if self.bit_pos == 8 {
                self.bit_pos = 0;
                self.byte_pos += 1;
            }
        }
        Some(value)
    }
}

/// Reverse the low `count` bits of `value`.
pub fn reverse_bits(value: u16, count: u8) -> u16 {
    if count == 0 {
        0
    } else {
        value.reverse_bits() >> (16 - count as u32)
    }
}
