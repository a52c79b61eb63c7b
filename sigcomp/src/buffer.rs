//! # UDVM Memory
//!
//! Circular byte memory backing a UDVM run. Every address is reduced modulo
//! the capacity before it touches the backing storage, so no access can be
//! out of range: it wraps.
//!
//! Two families of accessors exist:
//! - plain accessors (`read`, `write`, `read_u16`, ...) that only wrap at
//!   the capacity;
//! - byte-copy accessors (`copy_internal`, `load_external`,
//!   `store_external`) that additionally honour the circular window set up
//!   by the `byte_copy_left` / `byte_copy_right` registers.

use byteorder::{BigEndian, ByteOrder};

pub const MAX_MEMORY_SIZE: usize = 65536;

// UDVM registers and header fields that live inside memory
pub const UDVM_MEMORY_SIZE_INDEX: u16 = 0;
pub const CYCLES_PER_BIT_INDEX: u16 = 2;
pub const SIGCOMP_VERSION_INDEX: u16 = 4;
pub const PARTIAL_STATE_ID_LENGTH_INDEX: u16 = 6;
pub const STATE_LENGTH_INDEX: u16 = 8;
pub const BYTE_COPY_LEFT_INDEX: u16 = 64;
pub const BYTE_COPY_RIGHT_INDEX: u16 = 66;
pub const INPUT_BIT_ORDER_INDEX: u16 = 68;
pub const STACK_LOCATION_INDEX: u16 = 70;

pub struct MemoryBuffer {
    inner: Vec<u8>,
}

impl MemoryBuffer {
    /// Zero-filled memory of `capacity` bytes, clamped to `1..=65536`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_MEMORY_SIZE);
        Self {
            inner: vec![0; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.len()
    }

    /// Backing index of `address + offset`.
    pub fn index(&self, address: u16, offset: usize) -> usize {
        (address as usize + offset) % self.inner.len()
    }

    pub fn get(&self, address: u16) -> u8 {
        self.inner[self.index(address, 0)]
    }

    pub fn set(&mut self, address: u16, value: u8) {
        let index = self.index(address, 0);
        self.inner[index] = value;
    }

    pub fn read(&self, address: u16, length: usize) -> Vec<u8> {
        (0..length)
            .map(|offset| self.inner[self.index(address, offset)])
            .collect()
    }

    pub fn write(&mut self, address: u16, bytes: &[u8]) {
        for (offset, byte) in bytes.iter().enumerate() {
            let index = self.index(address, offset);
            self.inner[index] = *byte;
        }
    }

    pub fn read_u16(&self, address: u16) -> u16 {
        BigEndian::read_u16(&[
            self.inner[self.index(address, 0)],
            self.inner[self.index(address, 1)],
        ])
    }

    pub fn write_u16(&mut self, address: u16, value: u16) {
        let mut buf = [0; 2];
        BigEndian::write_u16(&mut buf, value);
        self.write(address, &buf);
    }

    fn byte_copy_window(&self) -> (u16, u16) {
        (
            self.read_u16(BYTE_COPY_LEFT_INDEX),
            self.read_u16(BYTE_COPY_RIGHT_INDEX),
        )
    }

    fn step(address: u16, (left, right): (u16, u16)) -> u16 {
        let next = address.wrapping_add(1);
        if next == right {
            left
        } else {
            next
        }
    }

    /// Address following `address` under the byte copying rules.
    pub fn next_copy_address(&self, address: u16) -> u16 {
        Self::step(address, self.byte_copy_window())
    }

    /// Start of a COPY-OFFSET source: count `offset` addresses back from
    /// `destination`, jumping from `byte_copy_left` to `byte_copy_right - 1`.
    pub fn offset_source(&self, destination: u16, offset: u16) -> u16 {
        let (left, right) = self.byte_copy_window();
        let mut position = destination;
        for _ in 0..offset {
            position = if position == left {
                right.wrapping_sub(1)
            } else {
                position.wrapping_sub(1)
            };
        }
        position
    }

    /// Forward byte-at-a-time copy under the byte copying rules. Source and
    /// destination may overlap, in which case bytes written earlier in the
    /// copy are read again (the repeating-pattern idiom). Returns the address
    /// after the last byte written.
    pub fn copy_internal(&mut self, destination: u16, source: u16, length: usize) -> u16 {
        let window = self.byte_copy_window();
        let (mut dst, mut src) = (destination, source);
        for _ in 0..length {
            let byte = self.get(src);
            self.set(dst, byte);
            src = Self::step(src, window);
            dst = Self::step(dst, window);
        }
        dst
    }

    /// Write external bytes under the byte copying rules, returning the
    /// address after the last byte written.
    pub fn load_external(&mut self, destination: u16, bytes: &[u8]) -> u16 {
        let window = self.byte_copy_window();
        let mut dst = destination;
        for byte in bytes {
            self.set(dst, *byte);
            dst = Self::step(dst, window);
        }
        dst
    }

    /// Read `length` bytes out under the byte copying rules.
    pub fn store_external(&self, source: u16, length: usize) -> Vec<u8> {
        let window = self.byte_copy_window();
        let mut src = source;
        let mut bytes = Vec::with_capacity(length);
        for _ in 0..length {
            bytes.push(self.get(src));
            src = Self::step(src, window);
        }
        bytes
    }
}
