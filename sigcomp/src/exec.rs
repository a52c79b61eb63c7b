//! Instruction semantics.
//!
//! Byte-oriented instructions go through the byte copying rules of
//! [`MemoryBuffer`]; 2-byte words are plain big-endian accesses.

use crate::buffer::{INPUT_BIT_ORDER_INDEX, STACK_LOCATION_INDEX};
use crate::input::reverse_bits;
use crate::instruction::{ArithOp, HuffmanEntry, Instruction, SortOrder};
use crate::nack::NackReason;
use crate::state::{StateItem, TempState, MAX_PARTIAL_ID_LENGTH, MIN_PARTIAL_ID_LENGTH};
use crate::udvm::{
    Flow, RequestedFeedback, ReturnedParameters, StateRequest, Udvm, UdvmError,
    MAX_STATE_REQUESTS,
};
use nebula_utils::sha1;
use std::collections::HashSet;
use tracing::{debug, warn};

const BIT_ORDER_F: u16 = 0x0004;
const BIT_ORDER_H: u16 = 0x0002;
const BIT_ORDER_P: u16 = 0x0001;
const MAX_INPUT_BITS: u16 = 16;
const MAX_RETENTION_PRIORITY: u16 = 65535;

/// 16-bit result of an arithmetic instruction.
pub fn arithmetic(op: ArithOp, a: u16, b: u16) -> Result<u16, UdvmError> {
    let result = match op {
        ArithOp::And => a & b,
        ArithOp::Or => a | b,
        ArithOp::Lshift => a.checked_shl(b as u32).unwrap_or(0),
        ArithOp::Rshift => a.checked_shr(b as u32).unwrap_or(0),
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Subtract => a.wrapping_sub(b),
        ArithOp::Multiply => a.wrapping_mul(b),
        ArithOp::Divide => a.checked_div(b).ok_or(UdvmError::ArithmeticFault)?,
        ArithOp::Remainder => a.checked_rem(b).ok_or(UdvmError::ArithmeticFault)?,
    };
    Ok(result)
}

/// Stable order of records by key.
pub fn sort_permutation(keys: &[u16], order: SortOrder) -> Vec<usize> {
    let mut permutation: Vec<usize> = (0..keys.len()).collect();
    match order {
        SortOrder::Ascending => permutation.sort_by(|a, b| keys[*a].cmp(&keys[*b])),
        SortOrder::Descending => permutation.sort_by(|a, b| keys[*b].cmp(&keys[*a])),
    }
    permutation
}

/// FCS-16 of RFC 1662.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x8408
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

fn valid_partial_id_length(length: u16) -> bool {
    (MIN_PARTIAL_ID_LENGTH..=MAX_PARTIAL_ID_LENGTH).contains(&(length as usize))
}

impl<'a> Udvm<'a> {
    pub(crate) fn execute(
        &mut self,
        start: u16,
        next: u16,
        instruction: Instruction,
    ) -> Result<Flow, UdvmError> {
        match instruction {
            Instruction::DecompressionFailure => return Err(UdvmError::ExplicitFailure),
            Instruction::Arith { op, operand, value } => {
                let result = arithmetic(op, self.memory.read_u16(operand), value)?;
                self.memory.write_u16(operand, result);
            }
            Instruction::Not { operand } => {
                let value = self.memory.read_u16(operand);
                self.memory.write_u16(operand, !value);
            }
            Instruction::Sort { order, start, n, k } => self.sort(order, start, n, k),
            Instruction::Sha1 {
                position,
                length,
                destination,
            } => {
                let digest = sha1(&self.memory.store_external(position, length as usize));
                self.memory.load_external(destination, &digest);
            }
            Instruction::Load { address, value } => self.memory.write_u16(address, value),
            Instruction::Multiload { address, values } => {
                if self.overwrites_instruction(start, next, address, values.len()) {
                    return Err(UdvmError::MemoryFault(NackReason::MultiloadOverwritten));
                }
                for (i, value) in values.iter().enumerate() {
                    let target = address.wrapping_add((i as u16).wrapping_mul(2));
                    self.memory.write_u16(target, *value);
                }
            }
            Instruction::Push { value } => self.push(value),
            Instruction::Pop { address } => {
                let value = self.pop()?;
                self.memory.write_u16(address, value);
            }
            Instruction::Copy {
                position,
                length,
                destination,
            } => {
                self.memory
                    .copy_internal(destination, position, length as usize);
            }
            Instruction::CopyLiteral {
                position,
                length,
                destination,
            } => {
                let dest = self.memory.read_u16(destination);
                let after = self.memory.copy_internal(dest, position, length as usize);
                self.memory.write_u16(destination, after);
            }
            Instruction::CopyOffset {
                offset,
                length,
                destination,
            } => {
                let dest = self.memory.read_u16(destination);
                let source = self.memory.offset_source(dest, offset);
                let after = self.memory.copy_internal(dest, source, length as usize);
                self.memory.write_u16(destination, after);
            }
            Instruction::Memset {
                address,
                length,
                start_value,
                offset,
            } => {
                let bytes: Vec<u8> = (0..length)
                    .map(|i| start_value.wrapping_add(i.wrapping_mul(offset)) as u8)
                    .collect();
                self.memory.load_external(address, &bytes);
            }
            Instruction::Jump { address } => return Ok(Flow::Continue(address)),
            Instruction::Compare {
                value_1,
                value_2,
                less,
                equal,
                greater,
            } => {
                let target = match value_1.cmp(&value_2) {
                    std::cmp::Ordering::Less => less,
                    std::cmp::Ordering::Equal => equal,
                    std::cmp::Ordering::Greater => greater,
                };
                return Ok(Flow::Continue(target));
            }
            Instruction::Call { address } => {
                self.push(next);
                return Ok(Flow::Continue(address));
            }
            Instruction::Return => return Ok(Flow::Continue(self.pop()?)),
            Instruction::Switch { j, addresses } => {
                let target = addresses
                    .get(j as usize)
                    .ok_or(UdvmError::MalformedBytecode(NackReason::SwitchValueTooHigh))?;
                return Ok(Flow::Continue(*target));
            }
            Instruction::Crc {
                value,
                position,
                length,
                address,
            } => {
                let data = self.memory.store_external(position, length as usize);
                if crc16(&data) != value {
                    return Ok(Flow::Continue(address));
                }
            }
            Instruction::InputBytes {
                length,
                destination,
                address,
            } => match self.input.read_bytes(length as usize) {
                Some(bytes) => {
                    self.memory.load_external(destination, &bytes);
                }
                None => return self.input_exhausted(start, address),
            },
            Instruction::InputBits {
                length,
                destination,
                address,
            } => {
                let order = self.bit_order()?;
                if length > MAX_INPUT_BITS {
                    return Err(UdvmError::MalformedBytecode(
                        NackReason::TooManyBitsRequested,
                    ));
                }
                let bits = length as u8;
                match self.input.read_bits(bits, order & BIT_ORDER_P != 0) {
                    Some(value) => {
                        let value = if order & BIT_ORDER_F != 0 {
                            reverse_bits(value, bits)
                        } else {
                            value
                        };
                        self.memory.write_u16(destination, value);
                    }
                    None => return self.input_exhausted(start, address),
                }
            }
            Instruction::InputHuffman {
                destination,
                address,
                table,
            } => return self.input_huffman(start, next, destination, address, &table),
            Instruction::StateAccess {
                partial_id_start,
                partial_id_length,
                begin,
                length,
                address,
                instruction,
            } => {
                return self.state_access(
                    next,
                    partial_id_start,
                    partial_id_length,
                    begin,
                    length,
                    address,
                    instruction,
                )
            }
            Instruction::StateCreate(state) => {
                if !valid_partial_id_length(state.minimum_access_length) {
                    return Err(UdvmError::state(NackReason::InvalidStateProbeLength));
                }
                if state.retention_priority == MAX_RETENTION_PRIORITY {
                    return Err(UdvmError::state(NackReason::InvalidStatePriority));
                }
                self.request(StateRequest::Create(state))?;
            }
            Instruction::StateFree {
                partial_id_start,
                partial_id_length,
            } => {
                if !valid_partial_id_length(partial_id_length) {
                    return Err(UdvmError::state(NackReason::InvalidStateIdLength));
                }
                let partial_id = self
                    .memory
                    .store_external(partial_id_start, partial_id_length as usize);
                self.request(StateRequest::Free(partial_id))?;
            }
            Instruction::Output { start, length } => {
                if self.output.len() + length as usize > self.max_output {
                    return Err(UdvmError::MemoryFault(NackReason::OutputOverflow));
                }
                let bytes = self.memory.store_external(start, length as usize);
                self.output.extend_from_slice(&bytes);
            }
            Instruction::EndMessage {
                requested_feedback_location,
                returned_parameters_location,
                state,
            } => {
                self.end_message(requested_feedback_location, returned_parameters_location, state);
                return Ok(Flow::Halt);
            }
        }
        Ok(Flow::Continue(next))
    }

    fn bit_order(&self) -> Result<u16, UdvmError> {
        let order = self.memory.read_u16(INPUT_BIT_ORDER_INDEX);
        if order & !(BIT_ORDER_F | BIT_ORDER_H | BIT_ORDER_P) != 0 {
            return Err(UdvmError::MalformedBytecode(NackReason::BadInputBitorder));
        }
        Ok(order)
    }

    /// Jump to `address` when the input ran out. An address pointing back
    /// at the instruction itself has nowhere to go.
    fn input_exhausted(&self, start: u16, address: u16) -> Result<Flow, UdvmError> {
        if address == start {
            return Err(UdvmError::InputExhausted);
        }
        Ok(Flow::Continue(address))
    }

    fn push(&mut self, value: u16) {
        let location = self.memory.read_u16(STACK_LOCATION_INDEX);
        let fill = self.memory.read_u16(location);
        let slot = location.wrapping_add(2).wrapping_add(fill.wrapping_mul(2));
        self.memory.write_u16(slot, value);
        self.memory.write_u16(location, fill.wrapping_add(1));
    }

    fn pop(&mut self) -> Result<u16, UdvmError> {
        let location = self.memory.read_u16(STACK_LOCATION_INDEX);
        let fill = self.memory.read_u16(location);
        if fill == 0 {
            return Err(UdvmError::MemoryFault(NackReason::StackUnderflow));
        }
        let fill = fill - 1;
        self.memory.write_u16(location, fill);
        let slot = location.wrapping_add(2).wrapping_add(fill.wrapping_mul(2));
        Ok(self.memory.read_u16(slot))
    }

    fn overwrites_instruction(&self, start: u16, next: u16, address: u16, count: usize) -> bool {
        let code: HashSet<usize> = (0..next.wrapping_sub(start))
            .map(|offset| self.memory.index(start.wrapping_add(offset), 0))
            .collect();
        (0..count * 2).any(|offset| {
            let target = address.wrapping_add(offset as u16);
            code.contains(&self.memory.index(target, 0))
        })
    }

    /// `n` lists of `k` words from `start`; record `i` is word `i` of every
    /// list and is keyed by its word in the first list.
    fn sort(&mut self, order: SortOrder, start: u16, n: u16, k: u16) {
        let word = |list: u16, i: u16| {
            start.wrapping_add(list.wrapping_mul(k).wrapping_add(i).wrapping_mul(2))
        };
        let lists: Vec<Vec<u16>> = (0..n)
            .map(|list| (0..k).map(|i| self.memory.read_u16(word(list, i))).collect())
            .collect();
        let Some(keys) = lists.first() else {
            return;
        };
        let permutation = sort_permutation(keys, order);
        for (list, values) in lists.iter().enumerate() {
            for (i, from) in permutation.iter().enumerate() {
                self.memory
                    .write_u16(word(list as u16, i as u16), values[*from]);
            }
        }
    }

    fn input_huffman(
        &mut self,
        start: u16,
        next: u16,
        destination: u16,
        address: u16,
        table: &[HuffmanEntry],
    ) -> Result<Flow, UdvmError> {
        let order = self.bit_order()?;
        let total: u32 = table.iter().map(|entry| entry.bits as u32).sum();
        if total > MAX_INPUT_BITS as u32 {
            return Err(UdvmError::MalformedBytecode(NackReason::TooManyBitsRequested));
        }
        let mut h: u32 = 0;
        for entry in table {
            let bits = entry.bits as u8;
            let Some(value) = self.input.read_bits(bits, order & BIT_ORDER_P != 0) else {
                return self.input_exhausted(start, address);
            };
            let value = if order & BIT_ORDER_H != 0 {
                reverse_bits(value, bits)
            } else {
                value
            };
            h = (h << bits) | value as u32;
            if (entry.lower_bound as u32..=entry.upper_bound as u32).contains(&h) {
                let symbol = (h + entry.uncompressed as u32 - entry.lower_bound as u32) as u16;
                self.memory.write_u16(destination, symbol);
                return Ok(Flow::Continue(next));
            }
        }
        Err(UdvmError::MalformedBytecode(NackReason::HuffmanNoMatch))
    }

    #[allow(clippy::too_many_arguments)]
    fn state_access(
        &mut self,
        next: u16,
        partial_id_start: u16,
        partial_id_length: u16,
        begin: u16,
        length: u16,
        address: u16,
        instruction: u16,
    ) -> Result<Flow, UdvmError> {
        if !valid_partial_id_length(partial_id_length) {
            return Err(UdvmError::state(NackReason::InvalidStateIdLength));
        }
        let partial_id = self
            .memory
            .store_external(partial_id_start, partial_id_length as usize);
        let item = match self.store.lookup(self.compartment.as_ref(), &partial_id) {
            Ok(item) => item,
            Err(e) => {
                return Err(UdvmError::StateFault {
                    reason: e.reason(),
                    partial_id,
                })
            }
        };

        let copy_length = if length == 0 {
            item.value.len()
        } else {
            length as usize
        };
        let address = if address == 0 { item.address } else { address };
        let instruction = if instruction == 0 {
            item.instruction
        } else {
            instruction
        };

        let begin = begin as usize;
        let value = item
            .value
            .get(begin..begin + copy_length)
            .ok_or_else(|| UdvmError::state(NackReason::StateTooShort))?;
        self.memory.load_external(address, value);
        if length == 0 {
            self.charge(copy_length as u64)?;
        }

        if instruction == 0 {
            Ok(Flow::Continue(next))
        } else {
            Ok(Flow::Continue(instruction))
        }
    }

    fn pending_creates(&self) -> usize {
        self.requests
            .iter()
            .filter(|r| matches!(r, StateRequest::Create(_)))
            .count()
    }

    fn pending_frees(&self) -> usize {
        self.requests.len() - self.pending_creates()
    }

    // creates and frees are capped separately
    fn request(&mut self, request: StateRequest) -> Result<(), UdvmError> {
        let pending = match request {
            StateRequest::Create(_) => self.pending_creates(),
            StateRequest::Free(_) => self.pending_frees(),
        };
        if pending >= MAX_STATE_REQUESTS {
            return Err(UdvmError::state(NackReason::TooManyStateRequests));
        }
        self.requests.push(request);
        Ok(())
    }

    fn end_message(
        &mut self,
        requested_feedback_location: u16,
        returned_parameters_location: u16,
        state: TempState,
    ) {
        if valid_partial_id_length(state.minimum_access_length)
            && state.retention_priority != MAX_RETENTION_PRIORITY
            && self.pending_creates() < MAX_STATE_REQUESTS
        {
            self.requests.push(StateRequest::Create(state));
        }

        if requested_feedback_location != 0 {
            self.requested_feedback = Some(RequestedFeedback::read(
                &self.memory,
                requested_feedback_location,
            ));
        }
        if returned_parameters_location != 0 {
            self.returned_parameters = Some(ReturnedParameters::read(
                &self.memory,
                returned_parameters_location,
            ));
        }

        let requests = std::mem::take(&mut self.requests);
        if requests.is_empty() {
            return;
        }
        let Some(id) = self.compartment.as_ref() else {
            debug!("no compartment, dropping {} state requests", requests.len());
            return;
        };
        let compartment = self.store.compartment(id);
        let mut compartment = compartment.lock();
        for request in requests {
            match request {
                StateRequest::Create(temp) => {
                    let item: StateItem = temp.capture(&self.memory);
                    compartment.stage(item);
                }
                StateRequest::Free(partial_id) => {
                    if let Err(e) = compartment.free(&partial_id) {
                        warn!(
                            "state free {} failed: {e}",
                            hex::encode(&partial_id)
                        );
                        self.free_failures.push(e);
                    }
                }
            }
        }
        self.committed = compartment.commit();
    }
}
