//! # UDVM instruction set
//!
//! [`decode`] turns the bytes at an execution pointer into an
//! [`Instruction`] with every operand resolved to its value (or, for `$`
//! operands that are written back, to its memory address). Execution lives
//! in `exec`.

use crate::buffer::MemoryBuffer;
use crate::nack::NackReason;
use crate::operand::OperandReader;
use crate::state::TempState;
use crate::udvm::UdvmError;
use strum_macros::{Display, EnumString, FromRepr};

#[derive(Display, EnumString, FromRepr, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING-KEBAB-CASE")]
pub enum Opcode {
    DecompressionFailure = 0,
    And = 1,
    Or = 2,
    Not = 3,
    Lshift = 4,
    Rshift = 5,
    Add = 6,
    Subtract = 7,
    Multiply = 8,
    Divide = 9,
    Remainder = 10,
    SortAscending = 11,
    SortDescending = 12,
    #[strum(serialize = "SHA-1")]
    Sha1 = 13,
    Load = 14,
    Multiload = 15,
    Push = 16,
    Pop = 17,
    Copy = 18,
    CopyLiteral = 19,
    CopyOffset = 20,
    Memset = 21,
    Jump = 22,
    Compare = 23,
    Call = 24,
    Return = 25,
    Switch = 26,
    Crc = 27,
    InputBytes = 28,
    InputBits = 29,
    InputHuffman = 30,
    StateAccess = 31,
    StateCreate = 32,
    StateFree = 33,
    Output = 34,
    EndMessage = 35,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    And,
    Or,
    Lshift,
    Rshift,
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HuffmanEntry {
    pub bits: u16,
    pub lower_bound: u16,
    pub upper_bound: u16,
    pub uncompressed: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    DecompressionFailure,
    Arith {
        op: ArithOp,
        operand: u16,
        value: u16,
    },
    Not {
        operand: u16,
    },
    Sort {
        order: SortOrder,
        start: u16,
        n: u16,
        k: u16,
    },
    Sha1 {
        position: u16,
        length: u16,
        destination: u16,
    },
    Load {
        address: u16,
        value: u16,
    },
    Multiload {
        address: u16,
        values: Vec<u16>,
    },
    Push {
        value: u16,
    },
    Pop {
        address: u16,
    },
    Copy {
        position: u16,
        length: u16,
        destination: u16,
    },
    CopyLiteral {
        position: u16,
        length: u16,
        destination: u16,
    },
    CopyOffset {
        offset: u16,
        length: u16,
        destination: u16,
    },
    Memset {
        address: u16,
        length: u16,
        start_value: u16,
        offset: u16,
    },
    Jump {
        address: u16,
    },
    Compare {
        value_1: u16,
        value_2: u16,
        less: u16,
        equal: u16,
        greater: u16,
    },
    Call {
        address: u16,
    },
    Return,
    Switch {
        j: u16,
        addresses: Vec<u16>,
    },
    Crc {
        value: u16,
        position: u16,
        length: u16,
        address: u16,
    },
    InputBytes {
        length: u16,
        destination: u16,
        address: u16,
    },
    InputBits {
        length: u16,
        destination: u16,
        address: u16,
    },
    InputHuffman {
        destination: u16,
        address: u16,
        table: Vec<HuffmanEntry>,
    },
    StateAccess {
        partial_id_start: u16,
        partial_id_length: u16,
        begin: u16,
        length: u16,
        address: u16,
        instruction: u16,
    },
    StateCreate(TempState),
    StateFree {
        partial_id_start: u16,
        partial_id_length: u16,
    },
    Output {
        start: u16,
        length: u16,
    },
    EndMessage {
        requested_feedback_location: u16,
        returned_parameters_location: u16,
        state: TempState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub opcode: Opcode,
    pub instruction: Instruction,
    /// Address following the last operand.
    pub next: u16,
}

fn temp_state(ops: &mut OperandReader) -> Result<TempState, UdvmError> {
    Ok(TempState {
        length: ops.multitype()?,
        address: ops.multitype()?,
        instruction: ops.multitype()?,
        minimum_access_length: ops.multitype()?,
        retention_priority: ops.multitype()?,
    })
}

fn arith(op: ArithOp, ops: &mut OperandReader) -> Result<Instruction, UdvmError> {
    Ok(Instruction::Arith {
        op,
        operand: ops.reference()?,
        value: ops.multitype()?,
    })
}

fn sort(order: SortOrder, ops: &mut OperandReader) -> Result<Instruction, UdvmError> {
    Ok(Instruction::Sort {
        order,
        start: ops.multitype()?,
        n: ops.multitype()?,
        k: ops.multitype()?,
    })
}

/// Decode the instruction at `pc`.
pub fn decode(memory: &MemoryBuffer, pc: u16) -> Result<Decoded, UdvmError> {
    let opcode = Opcode::from_repr(memory.get(pc))
        .ok_or(UdvmError::MalformedBytecode(NackReason::InvalidOpcode))?;
    let mut ops = OperandReader::new(memory, pc);
    let ops = &mut ops;

    let instruction = match opcode {
        Opcode::DecompressionFailure => Instruction::DecompressionFailure,
        Opcode::And => arith(ArithOp::And, ops)?,
        Opcode::Or => arith(ArithOp::Or, ops)?,
        Opcode::Not => Instruction::Not {
            operand: ops.reference()?,
        },
        Opcode::Lshift => arith(ArithOp::Lshift, ops)?,
        Opcode::Rshift => arith(ArithOp::Rshift, ops)?,
        Opcode::Add => arith(ArithOp::Add, ops)?,
        Opcode::Subtract => arith(ArithOp::Subtract, ops)?,
        Opcode::Multiply => arith(ArithOp::Multiply, ops)?,
        Opcode::Divide => arith(ArithOp::Divide, ops)?,
        Opcode::Remainder => arith(ArithOp::Remainder, ops)?,
        Opcode::SortAscending => sort(SortOrder::Ascending, ops)?,
        Opcode::SortDescending => sort(SortOrder::Descending, ops)?,
        Opcode::Sha1 => Instruction::Sha1 {
            position: ops.multitype()?,
            length: ops.multitype()?,
            destination: ops.multitype()?,
        },
        Opcode::Load => Instruction::Load {
            address: ops.multitype()?,
            value: ops.multitype()?,
        },
        Opcode::Multiload => {
            let address = ops.multitype()?;
            let n = ops.literal()?;
            let values = (0..n)
                .map(|_| ops.multitype())
                .collect::<Result<Vec<_>, _>>()?;
            Instruction::Multiload { address, values }
        }
        Opcode::Push => Instruction::Push {
            value: ops.multitype()?,
        },
        Opcode::Pop => Instruction::Pop {
            address: ops.multitype()?,
        },
        Opcode::Copy => Instruction::Copy {
            position: ops.multitype()?,
            length: ops.multitype()?,
            destination: ops.multitype()?,
        },
        Opcode::CopyLiteral => Instruction::CopyLiteral {
            position: ops.multitype()?,
            length: ops.multitype()?,
            destination: ops.reference()?,
        },
        Opcode::CopyOffset => Instruction::CopyOffset {
            offset: ops.multitype()?,
            length: ops.multitype()?,
            destination: ops.reference()?,
        },
        Opcode::Memset => Instruction::Memset {
            address: ops.multitype()?,
            length: ops.multitype()?,
            start_value: ops.multitype()?,
            offset: ops.multitype()?,
        },
        Opcode::Jump => Instruction::Jump {
            address: ops.address()?,
        },
        Opcode::Compare => Instruction::Compare {
            value_1: ops.multitype()?,
            value_2: ops.multitype()?,
            less: ops.address()?,
            equal: ops.address()?,
            greater: ops.address()?,
        },
        Opcode::Call => Instruction::Call {
            address: ops.address()?,
        },
        Opcode::Return => Instruction::Return,
        Opcode::Switch => {
            let n = ops.literal()?;
            let j = ops.multitype()?;
            let addresses = (0..n)
                .map(|_| ops.address())
                .collect::<Result<Vec<_>, _>>()?;
            Instruction::Switch { j, addresses }
        }
        Opcode::Crc => Instruction::Crc {
            value: ops.multitype()?,
            position: ops.multitype()?,
            length: ops.multitype()?,
            address: ops.address()?,
        },
        Opcode::InputBytes => Instruction::InputBytes {
            length: ops.multitype()?,
            destination: ops.multitype()?,
            address: ops.address()?,
        },
        Opcode::InputBits => Instruction::InputBits {
            length: ops.multitype()?,
            destination: ops.multitype()?,
            address: ops.address()?,
        },
        Opcode::InputHuffman => {
            let destination = ops.multitype()?;
            let address = ops.address()?;
            let n = ops.literal()?;
            let mut table = Vec::with_capacity(n as usize);
            for _ in 0..n {
                table.push(HuffmanEntry {
                    bits: ops.multitype()?,
                    lower_bound: ops.multitype()?,
                    upper_bound: ops.multitype()?,
                    uncompressed: ops.multitype()?,
                });
            }
            Instruction::InputHuffman {
                destination,
                address,
                table,
            }
        }
        Opcode::StateAccess => Instruction::StateAccess {
            partial_id_start: ops.multitype()?,
            partial_id_length: ops.multitype()?,
            begin: ops.multitype()?,
            length: ops.multitype()?,
            address: ops.multitype()?,
            instruction: ops.multitype()?,
        },
        Opcode::StateCreate => Instruction::StateCreate(temp_state(ops)?),
        Opcode::StateFree => Instruction::StateFree {
            partial_id_start: ops.multitype()?,
            partial_id_length: ops.multitype()?,
        },
        Opcode::Output => Instruction::Output {
            start: ops.multitype()?,
            length: ops.multitype()?,
        },
        Opcode::EndMessage => Instruction::EndMessage {
            requested_feedback_location: ops.multitype()?,
            returned_parameters_location: ops.multitype()?,
            state: temp_state(ops)?,
        },
    };

    Ok(Decoded {
        opcode,
        instruction,
        next: ops.position(),
    })
}

fn ceil_log2(k: u16) -> u64 {
    if k <= 1 {
        0
    } else {
        (u16::BITS - (k - 1).leading_zeros()) as u64
    }
}

impl Instruction {
    /// Cycles charged before execution. STATE-ACCESS with a zero
    /// `state_length` is charged the rest once the state is known.
    pub fn cost(&self) -> u64 {
        let extra = match self {
            Instruction::Sort { n, k, .. } => *k as u64 * (ceil_log2(*k) + *n as u64),
            Instruction::Sha1 { length, .. }
            | Instruction::Copy { length, .. }
            | Instruction::CopyLiteral { length, .. }
            | Instruction::CopyOffset { length, .. }
            | Instruction::Memset { length, .. }
            | Instruction::Crc { length, .. }
            | Instruction::InputBytes { length, .. }
            | Instruction::StateAccess { length, .. }
            | Instruction::Output { length, .. } => *length as u64,
            Instruction::Multiload { values, .. } => values.len() as u64,
            Instruction::Switch { addresses, .. } => addresses.len() as u64,
            Instruction::InputHuffman { table, .. } => table.len() as u64,
            Instruction::StateCreate(state) | Instruction::EndMessage { state, .. } => {
                state.length as u64
            }
            _ => 0,
        };
        1 + extra
    }
}
