//! Operand encodings of RFC 3320 §8.5.
//!
//! ```text
//! literal (#)                          reference ($)
//! 0nnnnnnn                    N        0nnnnnnn                   memory[2N]
//! 10nnnnnn nnnnnnnn           N        10nnnnnn nnnnnnnn          memory[2N]
//! 11000000 n16                N        11000000 n16               memory[N]
//!
//! multitype (%)
//! 00nnnnnn                    N        1000011n                   2^(N+6)
//! 01nnnnnn                    memory[2N]
//! 10001nnn                    2^(N+8)  111nnnnn                   N+65504
//! 1001nnnn nnnnnnnn           N+61440  101nnnnn nnnnnnnn          N
//! 110nnnnn nnnnnnnn           memory[N]
//! 10000000 n16                N        10000001 n16               memory[N]
//! ```
//!
//! An address operand (@) is a multitype added to the address of the
//! instruction it belongs to, modulo 2^16.

use crate::buffer::MemoryBuffer;
use crate::nack::NackReason;
use crate::udvm::UdvmError;

fn invalid() -> UdvmError {
    UdvmError::MalformedBytecode(NackReason::InvalidOperand)
}

/// Reads the operands of the instruction at `start`.
pub struct OperandReader<'a> {
    memory: &'a MemoryBuffer,
    start: u16,
    pc: u16,
}

impl<'a> OperandReader<'a> {
    pub fn new(memory: &'a MemoryBuffer, start: u16) -> Self {
        Self {
            memory,
            start,
            pc: start.wrapping_add(1),
        }
    }

    /// Address of the instruction being decoded.
    pub fn start(&self) -> u16 {
        self.start
    }

    /// Address of the next unread byte.
    pub fn position(&self) -> u16 {
        self.pc
    }

    fn byte(&mut self) -> u8 {
        let byte = self.memory.get(self.pc);
        self.pc = self.pc.wrapping_add(1);
        byte
    }

    fn word(&mut self) -> u16 {
        let word = self.memory.read_u16(self.pc);
        self.pc = self.pc.wrapping_add(2);
        word
    }

    pub fn literal(&mut self) -> Result<u16, UdvmError> {
        let first = self.byte();
        match first {
            0x00..=0x7F => Ok(first as u16),
            0x80..=0xBF => Ok((((first & 0x3F) as u16) << 8) | self.byte() as u16),
            0xC0 => Ok(self.word()),
            _ => Err(invalid()),
        }
    }

    /// Memory address named by a reference operand.
    pub fn reference(&mut self) -> Result<u16, UdvmError> {
        let first = self.byte();
        match first {
            0x00..=0x7F => Ok((first as u16) * 2),
            0x80..=0xBF => {
                let n = (((first & 0x3F) as u16) << 8) | self.byte() as u16;
                Ok(n.wrapping_mul(2))
            }
            0xC0 => Ok(self.word()),
            _ => Err(invalid()),
        }
    }

    pub fn multitype(&mut self) -> Result<u16, UdvmError> {
        let first = self.byte();
        let value = match first {
            0x00..=0x3F => first as u16,
            0x40..=0x7F => self.memory.read_u16(((first & 0x3F) as u16) * 2),
            0x80 => self.word(),
            0x81 => {
                let address = self.word();
                self.memory.read_u16(address)
            }
            0x86 | 0x87 => 1 << ((first & 0x01) + 6),
            0x88..=0x8F => 1 << ((first & 0x07) + 8),
            0x90..=0x9F => ((((first & 0x0F) as u16) << 8) | self.byte() as u16) + 61440,
            0xA0..=0xBF => (((first & 0x1F) as u16) << 8) | self.byte() as u16,
            0xC0..=0xDF => {
                let address = (((first & 0x1F) as u16) << 8) | self.byte() as u16;
                self.memory.read_u16(address)
            }
            0xE0..=0xFF => (first & 0x1F) as u16 + 65504,
            _ => return Err(invalid()),
        };
        Ok(value)
    }

    pub fn address(&mut self) -> Result<u16, UdvmError> {
        Ok(self.start.wrapping_add(self.multitype()?))
    }
}
