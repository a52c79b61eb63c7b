//! # Universal Decompressor Virtual Machine
//!
//! One [`Udvm`] decompresses one message. It owns the UDVM memory and the
//! compressed input, borrows the state store, and runs the fetch, decode
//! and execute loop until END-MESSAGE, a failure, or the cycle budget is
//! spent. Every instruction is charged its cost before it runs, and the
//! budget is checked again once it has run.
//!
//! State creation and state free requests are only collected while the
//! bytecode runs. They reach the store at END-MESSAGE, in the order they
//! were issued, so a failed run never changes the compartment.

use crate::buffer::{MemoryBuffer, CYCLES_PER_BIT_INDEX};
use crate::input::InputCursor;
use crate::instruction::decode;
use crate::nack::{NackReason, NackReport};
use crate::state::{CompartmentId, StateError, StateItem, StateStore, TempState};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// STATE-CREATE and STATE-FREE requests allowed per message, each.
pub const MAX_STATE_REQUESTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UdvmError {
    #[error("malformed bytecode: {0}")]
    MalformedBytecode(NackReason),
    #[error("division by zero")]
    ArithmeticFault,
    #[error("memory fault: {0}")]
    MemoryFault(NackReason),
    #[error("compressed input exhausted")]
    InputExhausted,
    #[error("state fault: {reason}")]
    StateFault {
        reason: NackReason,
        partial_id: Vec<u8>,
    },
    #[error("cycles exhausted")]
    CyclesExhausted { cycles_per_bit: u16 },
    #[error("decompression failure requested by bytecode")]
    ExplicitFailure,
}

impl UdvmError {
    pub fn reason(&self) -> NackReason {
        match self {
            UdvmError::MalformedBytecode(reason) => *reason,
            UdvmError::ArithmeticFault => NackReason::DivByZero,
            UdvmError::MemoryFault(reason) => *reason,
            UdvmError::InputExhausted => NackReason::MessageTooShort,
            UdvmError::StateFault { reason, .. } => *reason,
            UdvmError::CyclesExhausted { .. } => NackReason::CyclesExhausted,
            UdvmError::ExplicitFailure => NackReason::UserRequested,
        }
    }

    /// Error details carried by the NACK.
    pub fn details(&self) -> Option<Vec<u8>> {
        match self {
            UdvmError::StateFault { partial_id, .. } if !partial_id.is_empty() => {
                Some(partial_id.clone())
            }
            UdvmError::CyclesExhausted { cycles_per_bit } => Some(vec![*cycles_per_bit as u8]),
            _ => None,
        }
    }

    pub(crate) fn state(reason: NackReason) -> UdvmError {
        UdvmError::StateFault {
            reason,
            partial_id: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateRequest {
    Create(TempState),
    Free(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue(u16),
    Halt,
}

/// Feedback the bytecode asks the remote compressor for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedFeedback {
    /// S bit: no state will be kept for the compressor.
    pub stateless: bool,
    /// I bit: the compressor need not advertise its local state ids.
    pub omit_state_ids: bool,
    /// Feedback item to return in the next message, with its length byte.
    pub item: Option<Vec<u8>>,
}

impl RequestedFeedback {
    pub fn read(memory: &MemoryBuffer, location: u16) -> RequestedFeedback {
        let flags = memory.get(location);
        let item = if flags & 0x04 != 0 {
            let first = memory.get(location.wrapping_add(1));
            let size = if first & 0x80 == 0 {
                1
            } else {
                1 + (first & 0x7F) as usize
            };
            Some(memory.read(location.wrapping_add(1), size))
        } else {
            None
        };
        RequestedFeedback {
            stateless: flags & 0x02 != 0,
            omit_state_ids: flags & 0x01 != 0,
            item,
        }
    }
}

/// Capabilities announced by the remote endpoint's bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedParameters {
    pub cycles_per_bit: u16,
    /// `None` for the reserved encoding 0.
    pub decompression_memory_size: Option<u32>,
    pub state_memory_size: u32,
    pub sigcomp_version: u8,
    pub state_ids: Vec<Vec<u8>>,
}

impl ReturnedParameters {
    pub fn read(memory: &MemoryBuffer, location: u16) -> ReturnedParameters {
        let sizes = memory.get(location);
        let dms_code = (sizes >> 3) & 0x07;
        let sms_code = sizes & 0x07;

        let mut state_ids = Vec::new();
        let mut position = location.wrapping_add(2);
        let mut consumed = 2;
        loop {
            let length = memory.get(position) as usize;
            if !(6..=20).contains(&length) || consumed + 1 + length > memory.capacity() {
                break;
            }
            state_ids.push(memory.read(position.wrapping_add(1), length));
            position = position.wrapping_add(1 + length as u16);
            consumed += 1 + length;
        }

        ReturnedParameters {
            cycles_per_bit: 16 << (sizes >> 6),
            decompression_memory_size: (dms_code != 0).then(|| 1024 << dms_code),
            state_memory_size: if sms_code == 0 { 0 } else { 1024 << sms_code },
            sigcomp_version: memory.get(location.wrapping_add(1)),
            state_ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub output: Vec<u8>,
    pub requested_feedback: Option<RequestedFeedback>,
    pub returned_parameters: Option<ReturnedParameters>,
    pub committed_states: Vec<StateItem>,
    /// STATE-FREE requests that matched nothing when committed.
    pub free_failures: Vec<StateError>,
    pub cycles: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdvmFailure {
    pub error: UdvmError,
    pub pc: Option<u16>,
    pub opcode: u8,
}

impl UdvmFailure {
    pub fn to_nack(&self) -> NackReport {
        NackReport::build(self.error.reason(), self.error.details(), self.pc)
            .with_opcode(self.opcode)
    }
}

impl fmt::Display for UdvmFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.pc {
            Some(pc) => write!(f, "{} at pc {} opcode {}", self.error, pc, self.opcode),
            None => write!(f, "{}", self.error),
        }
    }
}

pub struct Udvm<'a> {
    pub(crate) memory: MemoryBuffer,
    pub(crate) pc: u16,
    pub(crate) opcode: u8,
    pub(crate) cycles: u64,
    pub(crate) max_cycles: u64,
    pub(crate) cycles_per_bit: u16,
    pub(crate) input: InputCursor,
    pub(crate) store: &'a StateStore,
    pub(crate) compartment: Option<CompartmentId>,
    pub(crate) requests: Vec<StateRequest>,
    pub(crate) output: Vec<u8>,
    pub(crate) max_output: usize,
    pub(crate) state: RunState,
    pub(crate) requested_feedback: Option<RequestedFeedback>,
    pub(crate) returned_parameters: Option<ReturnedParameters>,
    pub(crate) committed: Vec<StateItem>,
    pub(crate) free_failures: Vec<StateError>,
}

impl<'a> Udvm<'a> {
    /// A UDVM over prepared `memory`, starting at `entry`.
    pub fn new(
        memory: MemoryBuffer,
        entry: u16,
        input: Vec<u8>,
        max_cycles: u64,
        store: &'a StateStore,
    ) -> Udvm<'a> {
        let cycles_per_bit = memory.read_u16(CYCLES_PER_BIT_INDEX);
        Udvm {
            memory,
            pc: entry,
            opcode: 0,
            cycles: 0,
            max_cycles,
            cycles_per_bit,
            input: InputCursor::new(input),
            store,
            compartment: None,
            requests: Vec::new(),
            output: Vec::new(),
            max_output: usize::MAX,
            state: RunState::Running,
            requested_feedback: None,
            returned_parameters: None,
            committed: Vec::new(),
            free_failures: Vec::new(),
        }
    }

    pub fn with_compartment(mut self, compartment: Option<CompartmentId>) -> Udvm<'a> {
        self.compartment = compartment;
        self
    }

    pub fn with_max_output(mut self, max_output: usize) -> Udvm<'a> {
        self.max_output = max_output;
        self
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn memory(&self) -> &MemoryBuffer {
        &self.memory
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub(crate) fn charge(&mut self, cycles: u64) -> Result<(), UdvmError> {
        self.cycles += cycles;
        if self.cycles > self.max_cycles {
            return Err(UdvmError::CyclesExhausted {
                cycles_per_bit: self.cycles_per_bit,
            });
        }
        Ok(())
    }

    fn try_step(&mut self) -> Result<(), UdvmError> {
        self.opcode = self.memory.get(self.pc);
        let decoded = decode(&self.memory, self.pc)?;
        self.charge(decoded.instruction.cost())?;
        let flow = self.execute(self.pc, decoded.next, decoded.instruction)?;
        // STATE-ACCESS may have charged more while running
        self.charge(0)?;
        match flow {
            Flow::Continue(next) => self.pc = next,
            Flow::Halt => self.state = RunState::Succeeded,
        }
        Ok(())
    }

    /// Execute one instruction. Once the run is over this does nothing.
    pub fn step(&mut self) -> Result<RunState, UdvmError> {
        if self.state != RunState::Running {
            return Ok(self.state);
        }
        if let Err(e) = self.try_step() {
            self.state = RunState::Failed;
            return Err(e);
        }
        Ok(self.state)
    }

    pub fn run(mut self) -> Result<Completion, UdvmFailure> {
        loop {
            match self.step() {
                Ok(RunState::Running) => continue,
                Ok(_) => break,
                Err(error) => {
                    debug!(
                        "udvm failed at pc {} opcode {} after {} cycles: {error}",
                        self.pc, self.opcode, self.cycles
                    );
                    return Err(UdvmFailure {
                        error,
                        pc: Some(self.pc),
                        opcode: self.opcode,
                    });
                }
            }
        }
        debug!(
            "udvm finished after {} cycles, {} bytes output",
            self.cycles,
            self.output.len()
        );
        Ok(Completion {
            output: self.output,
            requested_feedback: self.requested_feedback,
            returned_parameters: self.returned_parameters,
            committed_states: self.committed,
            free_failures: self.free_failures,
            cycles: self.cycles,
        })
    }
}
