//! # Decompression failure reports (NACK)
//!
//! Failure reasons are numbered as in RFC 4077. A [`NackReport`] is a plain
//! value built from the failure; the transport side turns it into a NACK
//! message with [`NackReport::to_bytes`]:
//!
//! ```text
//! | 1 1 1 1 1 | T | 0 0 |  header
//! :  returned feedback  :  if T
//! |   code_len = 0      |
//! | code_len | version  |
//! |    reason code      |
//! | opcode of failed instruction |
//! |   pc of failed instruction   |  2 bytes
//! : sha-1 of failed message      :  20 bytes
//! :      error details           :
//! ```

use nebula_utils::{sha1, SHA1_LEN};
use std::fmt;

pub const NACK_VERSION: u8 = 1;

#[derive(
    strum_macros::Display,
    strum_macros::FromRepr,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
)]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NackReason {
    StateNotFound = 1,
    CyclesExhausted = 2,
    UserRequested = 3,
    Segfault = 4,
    TooManyStateRequests = 5,
    InvalidStateIdLength = 6,
    InvalidStatePriority = 7,
    OutputOverflow = 8,
    StackUnderflow = 9,
    BadInputBitorder = 10,
    DivByZero = 11,
    SwitchValueTooHigh = 12,
    TooManyBitsRequested = 13,
    InvalidOperand = 14,
    HuffmanNoMatch = 15,
    MessageTooShort = 16,
    InvalidCodeLocation = 17,
    BytecodesTooLarge = 18,
    InvalidOpcode = 19,
    InvalidStateProbeLength = 20,
    IdNotUnique = 21,
    MultiloadOverwritten = 22,
    StateTooShort = 23,
    InternalError = 24,
    FramingError = 25,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackReport {
    pub reason: NackReason,
    pub details: Option<Vec<u8>>,
    /// Execution pointer of the failed instruction, `None` when the failure
    /// happened before the UDVM started executing.
    pub pc: Option<u16>,
    /// Opcode of the failed instruction, 0 when there is none.
    pub opcode: u8,
    pub message_sha1: [u8; SHA1_LEN],
}

impl NackReport {
    pub fn build(reason: NackReason, details: Option<Vec<u8>>, pc: Option<u16>) -> NackReport {
        NackReport {
            reason,
            details,
            pc,
            opcode: 0,
            message_sha1: [0; SHA1_LEN],
        }
    }

    pub fn with_opcode(mut self, opcode: u8) -> NackReport {
        self.opcode = opcode;
        self
    }

    /// Attach the hash identifying the message that failed.
    pub fn for_message(mut self, message: &[u8]) -> NackReport {
        self.message_sha1 = sha1(message);
        self
    }

    pub fn to_bytes(&self, feedback: Option<&[u8]>) -> Vec<u8> {
        let details = self.details.as_deref().unwrap_or_default();
        let mut out = Vec::with_capacity(27 + details.len());
        match feedback {
            Some(item) => {
                out.push(0xFC);
                out.extend_from_slice(item);
            }
            None => out.push(0xF8),
        }
        out.push(0x00);
        out.push(NACK_VERSION);
        out.push(self.reason as u8);
        out.push(self.opcode);
        out.extend_from_slice(&self.pc.unwrap_or(0).to_be_bytes());
        out.extend_from_slice(&self.message_sha1);
        out.extend_from_slice(details);
        out
    }
}

impl fmt::Display for NackReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.reason as u8)?;
        if let Some(pc) = self.pc {
            write!(f, " at pc {} opcode {}", pc, self.opcode)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes() {
        assert_eq!(11, NackReason::DivByZero as u8);
        assert_eq!(Some(NackReason::FramingError), NackReason::from_repr(25));
        assert_eq!(None, NackReason::from_repr(0));
        assert_eq!("BAD_INPUT_BITORDER", NackReason::BadInputBitorder.to_string());
        assert_eq!("ID_NOT_UNIQUE", NackReason::IdNotUnique.to_string());
    }

    #[test]
    fn nack_message_layout() {
        let report = NackReport::build(NackReason::CyclesExhausted, Some(vec![16]), Some(0x0180))
            .with_opcode(22)
            .for_message(b"abc");
        let bytes = report.to_bytes(None);
        assert_eq!(&[0xF8, 0x00, 0x01, 2, 22, 0x01, 0x80], &bytes[..7]);
        assert_eq!(&sha1(b"abc"), &bytes[7..27]);
        assert_eq!(&[16], &bytes[27..]);
        assert_eq!("CYCLES_EXHAUSTED (2) at pc 384 opcode 22", report.to_string());
    }

    #[test]
    fn nack_message_with_feedback() {
        let report = NackReport::build(NackReason::MessageTooShort, None, None);
        let bytes = report.to_bytes(Some(&[0x81, 0x55]));
        assert_eq!(&[0xFC, 0x81, 0x55, 0x00, 0x01, 16, 0, 0, 0], &bytes[..9]);
        assert_eq!(29, bytes.len());
    }
}
