//! SigComp message header parsing.
//!
//! ```text
//!  0   1   2   3   4   5   6   7          0   1   2   3   4   5   6   7
//! +---+---+---+---+---+---+---+---+      +---+---+---+---+---+---+---+---+
//! | 1   1   1   1   1 | T |  len  |      | 1   1   1   1   1 | T |   0   |
//! +---+---+---+---+---+---+---+---+      +---+---+---+---+---+---+---+---+
//! :    returned feedback item     :      :    returned feedback item     :
//! +---+---+---+---+---+---+---+---+      +---+---+---+---+---+---+---+---+
//! :   partial state identifier    :      |           code_len            |
//! +---+---+---+---+---+---+---+---+      +---+---+---+---+---+---+---+---+
//! :   remaining SigComp message   :      |   code_len    |  destination  |
//! +---+---+---+---+---+---+---+---+      +---+---+---+---+---+---+---+---+
//!                                        :    uploaded UDVM bytecode     :
//!                                        +---+---+---+---+---+---+---+---+
//!                                        :   remaining SigComp message   :
//!                                        +---+---+---+---+---+---+---+---+
//! ```

use crate::nack::NackReason;
use thiserror::Error;

const PREFIX_MASK: u8 = 0xF8;
const FEEDBACK_BIT: u8 = 0x04;
const LEN_MASK: u8 = 0x03;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("not a sigcomp message")]
    NotSigComp,
    #[error("message too short")]
    TooShort,
    #[error("invalid bytecode destination")]
    InvalidCodeLocation,
}

impl MessageError {
    pub fn reason(&self) -> NackReason {
        match self {
            MessageError::NotSigComp => NackReason::FramingError,
            MessageError::TooShort => NackReason::MessageTooShort,
            MessageError::InvalidCodeLocation => NackReason::InvalidCodeLocation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Bytecode uploaded with the message, to be loaded at `destination`.
    Bytecode { destination: u16, code: Vec<u8> },
    /// Reference to a stored state holding the bytecode.
    StateReference { partial_id: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigCompMessage {
    /// Returned feedback item, including its leading length byte.
    pub returned_feedback: Option<Vec<u8>>,
    pub payload: Payload,
    /// Compressed bitstream read by the INPUT instructions.
    pub remaining: Vec<u8>,
}

pub fn is_sigcomp(data: &[u8]) -> bool {
    data.first()
        .map(|b| b & PREFIX_MASK == PREFIX_MASK)
        .unwrap_or(false)
}

/// Parse a feedback item at the start of `data` (`0xxxxxxx`, or
/// `1 + length` followed by `length` bytes) and return it with its size.
pub fn parse_feedback_item(data: &[u8]) -> Result<Vec<u8>, MessageError> {
    let first = *data.first().ok_or(MessageError::TooShort)?;
    let size = if first & 0x80 == 0 {
        1
    } else {
        1 + (first & 0x7F) as usize
    };
    data.get(..size)
        .map(|item| item.to_vec())
        .ok_or(MessageError::TooShort)
}

impl SigCompMessage {
    pub fn parse(data: &[u8]) -> Result<SigCompMessage, MessageError> {
        if !is_sigcomp(data) {
            return Err(MessageError::NotSigComp);
        }
        let header = data[0];
        let mut pos = 1;

        let returned_feedback = if header & FEEDBACK_BIT != 0 {
            let item = parse_feedback_item(&data[pos..])?;
            pos += item.len();
            Some(item)
        } else {
            None
        };

        let len = header & LEN_MASK;
        let payload = if len != 0 {
            let id_len = 3 + 3 * len as usize;
            let partial_id = data
                .get(pos..pos + id_len)
                .ok_or(MessageError::TooShort)?
                .to_vec();
            pos += id_len;
            Payload::StateReference { partial_id }
        } else {
            let field = data.get(pos..pos + 2).ok_or(MessageError::TooShort)?;
            let code_len = ((field[0] as usize) << 4) | (field[1] >> 4) as usize;
            let destination = field[1] & 0x0F;
            if destination == 0 {
                return Err(MessageError::InvalidCodeLocation);
            }
            pos += 2;
            let code = data
                .get(pos..pos + code_len)
                .ok_or(MessageError::TooShort)?
                .to_vec();
            pos += code_len;
            Payload::Bytecode {
                destination: (destination as u16 + 1) * 64,
                code,
            }
        };

        Ok(SigCompMessage {
            returned_feedback,
            payload,
            remaining: data[pos..].to_vec(),
        })
    }
}
