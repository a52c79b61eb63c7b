//! # Decompressor
//!
//! Entry point used by the SIP transport. A message is parsed, the UDVM
//! memory is set up from its header (RFC 3320 §7 and §8.1), the UDVM runs,
//! and the result is either the decompressed message or a [`NackReport`]
//! ready to be sent back to the compressor.
//!
//! ```text
//!  0             7 8            15
//! +---------------+---------------+
//! |        UDVM_memory_size       |  0 - 1
//! +---------------+---------------+
//! |        cycles_per_bit         |  2 - 3
//! +---------------+---------------+
//! |        SigComp_version        |  4 - 5
//! +---------------+---------------+
//! |    partial_state_ID_length    |  6 - 7
//! +---------------+---------------+
//! |         state_length          |  8 - 9
//! +---------------+---------------+
//! :           reserved            :  10 - 63
//! +---------------+---------------+
//! ```

use crate::buffer::{
    MemoryBuffer, CYCLES_PER_BIT_INDEX, PARTIAL_STATE_ID_LENGTH_INDEX, SIGCOMP_VERSION_INDEX,
    STATE_LENGTH_INDEX, UDVM_MEMORY_SIZE_INDEX,
};
use crate::config::Config;
use crate::message::{Payload, SigCompMessage};
use crate::nack::{NackReason, NackReport};
use crate::state::{CompartmentId, StateError, StateItem, StateStore};
use crate::udvm::{RequestedFeedback, ReturnedParameters, Udvm};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Each datagram carries exactly one message.
    #[default]
    Message,
    /// Messages are delimited inside a byte stream.
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decompressed {
    pub output: Vec<u8>,
    /// Feedback item the remote compressor sent back to us.
    pub returned_feedback: Option<Vec<u8>>,
    pub requested_feedback: Option<RequestedFeedback>,
    pub returned_parameters: Option<ReturnedParameters>,
    pub committed_states: Vec<StateItem>,
    pub free_failures: Vec<StateError>,
    pub cycles: u64,
}

pub struct Decompressor {
    config: Config,
    store: Arc<StateStore>,
}

impl Decompressor {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(StateStore::new(config.state_memory_size));
        Self { config, store }
    }

    /// A decompressor sharing an existing state store.
    pub fn with_store(config: Config, store: Arc<StateStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    fn init_memory(&self, size: usize) -> MemoryBuffer {
        let mut memory = MemoryBuffer::new(size);
        // 65536 is written as 0
        memory.write_u16(UDVM_MEMORY_SIZE_INDEX, size as u16);
        memory.write_u16(CYCLES_PER_BIT_INDEX, self.config.cycles_per_bit);
        memory.write_u16(SIGCOMP_VERSION_INDEX, self.config.sigcomp_version);
        memory
    }

    pub fn decompress(
        &self,
        compartment: Option<&CompartmentId>,
        message: &[u8],
        transport: TransportKind,
    ) -> Result<Decompressed, NackReport> {
        let nack = |reason: NackReason, details: Option<Vec<u8>>| {
            NackReport::build(reason, details, None).for_message(message)
        };

        let parsed = SigCompMessage::parse(message).map_err(|e| {
            warn!("invalid sigcomp message of {} bytes: {e}", message.len());
            nack(e.reason(), None)
        })?;

        let size = self
            .config
            .udvm_memory_size(message.len(), transport)
            .ok_or_else(|| {
                warn!(
                    "sigcomp message of {} bytes exceeds decompression memory",
                    message.len()
                );
                let dms = self.config.decompression_memory_size.min(u16::MAX as usize) as u16;
                nack(NackReason::BytecodesTooLarge, Some(dms.to_be_bytes().to_vec()))
            })?;
        let mut memory = self.init_memory(size);

        let entry = match &parsed.payload {
            Payload::Bytecode { destination, code } => {
                if *destination as usize + code.len() > size {
                    warn!(
                        "{} bytes of bytecode at {destination} do not fit in {size} bytes",
                        code.len()
                    );
                    return Err(nack(
                        NackReason::BytecodesTooLarge,
                        Some((size as u16).to_be_bytes().to_vec()),
                    ));
                }
                memory.write(*destination, code);
                *destination
            }
            Payload::StateReference { partial_id } => {
                let item = self.store.lookup(compartment, partial_id).map_err(|e| {
                    warn!("state {} not usable: {e}", hex::encode(partial_id));
                    nack(e.reason(), Some(partial_id.clone()))
                })?;
                memory.write_u16(PARTIAL_STATE_ID_LENGTH_INDEX, partial_id.len() as u16);
                memory.write_u16(STATE_LENGTH_INDEX, item.value.len() as u16);
                memory.write(item.address, &item.value);
                item.instruction
            }
        };

        let udvm = Udvm::new(
            memory,
            entry,
            parsed.remaining,
            self.config.maximum_udvm_cycles(message.len()),
            &self.store,
        )
        .with_compartment(compartment.cloned())
        .with_max_output(self.config.max_output_size);

        match udvm.run() {
            Ok(completion) => {
                debug!(
                    "decompressed {} bytes into {} in {} cycles, {} states committed",
                    message.len(),
                    completion.output.len(),
                    completion.cycles,
                    completion.committed_states.len()
                );
                Ok(Decompressed {
                    output: completion.output,
                    returned_feedback: parsed.returned_feedback,
                    requested_feedback: completion.requested_feedback,
                    returned_parameters: completion.returned_parameters,
                    committed_states: completion.committed_states,
                    free_failures: completion.free_failures,
                    cycles: completion.cycles,
                })
            }
            Err(failure) => {
                warn!("decompression failed: {failure}");
                Err(failure.to_nack().for_message(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nebula_utils::sha1;

    const END: [u8; 8] = [0x23, 0, 0, 0, 0, 0, 0, 0];

    // header for bytecode uploaded at 128
    fn message(code: &[u8], input: &[u8]) -> Vec<u8> {
        let len = code.len();
        let mut data = vec![0xF8, (len >> 4) as u8, (((len & 0x0F) << 4) | 1) as u8];
        data.extend_from_slice(code);
        data.extend_from_slice(input);
        data
    }

    // Outputs a built-in "INVITE sip:" prefix then copies the input, and
    // saves itself as a state loaded and started at 128.
    fn dictionary_program() -> Vec<u8> {
        let mut code: Vec<u8> = vec![];
        code.extend([0x22, 0xA0, 0x95, 0x0B]);
        code.extend([0x1C, 0x01, 0x8A, 0x09]);
        code.extend([0x22, 0x8A, 0x01]);
        code.extend([0x16, 0xF9]);
        code.extend([0x23, 0x00, 0x00, 0x20, 0x87, 0x87, 0x06, 0x00]);
        code.extend(b"INVITE sip:");
        code
    }

    fn state_message(id: &[u8], input: &[u8]) -> Vec<u8> {
        let mut data = vec![0xF9];
        data.extend_from_slice(&id[..6]);
        data.extend_from_slice(input);
        data
    }

    #[test]
    fn decompresses_uploaded_bytecode() {
        let decompressor = Decompressor::new(Config::default());
        let code = [&[0x1Cu8, 0x05, 0x88, 0x0F][..], &[0x22, 0x88, 0x05], &END, &[0x00]].concat();
        let result = decompressor
            .decompress(None, &message(&code, b"hello"), TransportKind::Message)
            .unwrap();
        assert_eq!(b"hello".to_vec(), result.output);
        assert_eq!(None, result.returned_feedback);

        let data = message(&code, b"hel");
        let nack = decompressor
            .decompress(None, &data, TransportKind::Message)
            .unwrap_err();
        assert_eq!(NackReason::UserRequested, nack.reason);
        assert_eq!((Some(143), 0), (nack.pc, nack.opcode));
        assert_eq!(sha1(&data), nack.message_sha1);
    }

    #[test]
    fn global_dictionary_round_trip() {
        let decompressor = Decompressor::new(Config::default());
        let dictionary = StateItem::new(dictionary_program(), 128, 128, 6, 65535);
        decompressor.store().add_global_state(dictionary.clone());

        let data = state_message(&dictionary.id, b"bob@example.com SIP/2.0\r\n");
        let result = decompressor
            .decompress(None, &data, TransportKind::Message)
            .unwrap();
        assert_eq!(b"INVITE sip:bob@example.com SIP/2.0\r\n".to_vec(), result.output);
        // no compartment, nothing is saved
        assert!(result.committed_states.is_empty());
    }

    #[test]
    fn global_dictionary_resaved_in_compartment() {
        let decompressor = Decompressor::new(Config::default());
        let dictionary = StateItem::new(dictionary_program(), 128, 128, 6, 65535);
        decompressor.store().add_global_state(dictionary.clone());
        let peer = CompartmentId::from("udp:192.0.2.1:5060");

        let first = decompressor
            .decompress(Some(&peer), &state_message(&dictionary.id, b"a"), TransportKind::Message)
            .unwrap();
        assert_eq!(b"INVITE sip:a".to_vec(), first.output);
        assert_eq!(1, first.committed_states.len());
        assert_eq!(dictionary.id, first.committed_states[0].id);

        let second = decompressor
            .decompress(Some(&peer), &state_message(&dictionary.id, b"b"), TransportKind::Message)
            .unwrap();
        assert_eq!(b"INVITE sip:b".to_vec(), second.output);
    }

    #[test]
    fn state_saved_by_one_message_serves_the_next() {
        let decompressor = Decompressor::new(Config::default());
        let peer = CompartmentId::from("udp:192.0.2.1:5060");

        let first = decompressor
            .decompress(
                Some(&peer),
                &message(&dictionary_program(), b"alice"),
                TransportKind::Message,
            )
            .unwrap();
        assert_eq!(b"INVITE sip:alice".to_vec(), first.output);
        let saved = StateItem::new(dictionary_program(), 128, 128, 6, 0);
        assert_eq!(vec![saved.clone()], first.committed_states);

        let second = decompressor
            .decompress(Some(&peer), &state_message(&saved.id, b"bob"), TransportKind::Message)
            .unwrap();
        assert_eq!(b"INVITE sip:bob".to_vec(), second.output);

        let other = CompartmentId::from("udp:192.0.2.2:5060");
        let nack = decompressor
            .decompress(Some(&other), &state_message(&saved.id, b"bob"), TransportKind::Message)
            .unwrap_err();
        assert_eq!(NackReason::StateNotFound, nack.reason);
        assert_eq!(Some(saved.id[..6].to_vec()), nack.details);
        assert_eq!(None, nack.pc);
    }

    #[test]
    fn header_failures() {
        let decompressor = Decompressor::new(Config::default());
        let nack = decompressor
            .decompress(None, b"INVITE sip:bob@example.com", TransportKind::Message)
            .unwrap_err();
        assert_eq!(NackReason::FramingError, nack.reason);

        let nack = decompressor
            .decompress(None, &[0xF8, 0x00], TransportKind::Message)
            .unwrap_err();
        assert_eq!(NackReason::MessageTooShort, nack.reason);

        let nack = decompressor
            .decompress(None, &[0xF8, 0x00, 0x10, 0x00], TransportKind::Message)
            .unwrap_err();
        assert_eq!(NackReason::InvalidCodeLocation, nack.reason);
    }

    #[test]
    fn bytecode_too_large() {
        let config = Config {
            decompression_memory_size: 2048,
            ..Config::default()
        };
        let decompressor = Decompressor::new(config);
        let nack = decompressor
            .decompress(None, &message(&vec![0x00; 1990], &[]), TransportKind::Message)
            .unwrap_err();
        assert_eq!(NackReason::BytecodesTooLarge, nack.reason);
        assert_eq!(Some(vec![0, 55]), nack.details);

        let nack = decompressor
            .decompress(None, &message(&vec![0x00; 2100], &[]), TransportKind::Message)
            .unwrap_err();
        assert_eq!(NackReason::BytecodesTooLarge, nack.reason);
        assert_eq!(Some(vec![0x08, 0x00]), nack.details);
    }

    #[test]
    fn memory_registers_per_transport() {
        let decompressor = Decompressor::new(Config::default());
        let code = [&[0x22u8, 0x00, 0x06][..], &END].concat();
        let data = message(&code, &[]);

        let result = decompressor
            .decompress(None, &data, TransportKind::Stream)
            .unwrap();
        assert_eq!(vec![0x10, 0x00, 0x00, 0x10, 0x00, 0x01], result.output);

        let result = decompressor
            .decompress(None, &data, TransportKind::Message)
            .unwrap();
        let size = (8192 - data.len()) as u16;
        assert_eq!(size.to_be_bytes().to_vec(), result.output[..2].to_vec());
    }

    #[test]
    fn endless_loop_is_cut_by_cycle_budget() {
        let decompressor = Decompressor::new(Config::default());
        let nack = decompressor
            .decompress(None, &message(&[0x06, 0x64, 0x01, 0x16, 0xFD], &[]), TransportKind::Message)
            .unwrap_err();
        assert_eq!(NackReason::CyclesExhausted, nack.reason);
        assert_eq!(Some(vec![16]), nack.details);
    }

    #[test]
    fn returned_feedback_is_passed_through() {
        let decompressor = Decompressor::new(Config::default());
        let mut data = vec![0xFC, 0x81, 0x2A, 0x00, 0x81];
        data.extend(END);
        let result = decompressor
            .decompress(None, &data, TransportKind::Message)
            .unwrap();
        assert_eq!(Some(vec![0x81, 0x2A]), result.returned_feedback);
    }

    // Runs `code` uploaded at 128 and checks the exact cycle count against
    // the budget for the message.
    fn run_counted(code: &[u8], input: &[u8], cycles: u64) -> Vec<u8> {
        let decompressor = Decompressor::new(Config::default());
        let data = message(code, input);
        let result = decompressor
            .decompress(None, &data, TransportKind::Message)
            .unwrap();
        assert_eq!(cycles, result.cycles);
        assert!(result.cycles <= decompressor.config().maximum_udvm_cycles(data.len()));
        result.output
    }

    fn multitype(value: u16) -> Vec<u8> {
        if value < 64 {
            vec![value as u8]
        } else {
            vec![0xA0 | (value >> 8) as u8, value as u8]
        }
    }

    #[test]
    fn bit_manipulation() {
        let code = [
            &[0x0Eu8, 0x20, 0xB2, 0x34][..],
            &[0x0E, 0x22, 0xA0, 0xFF],
            &[0x01, 0x10, 0xAF, 0xF0],
            &[0x02, 0x11, 0x50],
            &[0x03, 0x10],
            &[0x04, 0x11, 0x04],
            &[0x05, 0x10, 0x03],
            &[0x22, 0x20, 0x04],
            &END,
        ]
        .concat();
        assert_eq!(vec![0x1F, 0xB9, 0x2F, 0xF0], run_counted(&code, &[], 13));
    }

    #[test]
    fn arithmetic_instructions() {
        let code = [
            &[0x0Eu8, 0x20, 0xA3, 0xE8][..],
            &[0x06, 0x10, 0xFF],
            &[0x08, 0x10, 0xA0, 0x64],
            &[0x0E, 0x22, 0x50],
            &[0x09, 0x10, 0x07],
            &[0x0A, 0x11, 0x07],
            &[0x07, 0x11, 0x02],
            &[0x22, 0x20, 0x04],
            &END,
        ]
        .concat();
        assert_eq!(vec![0x13, 0x2D, 0xFF, 0xFF], run_counted(&code, &[], 13));

        let decompressor = Decompressor::new(Config::default());
        let code = [&[0x0Eu8, 0x20, 0x05, 0x09, 0x10, 0x00][..], &END].concat();
        let nack = decompressor
            .decompress(None, &message(&code, &[]), TransportKind::Message)
            .unwrap_err();
        assert_eq!(NackReason::DivByZero, nack.reason);
        assert_eq!((Some(131), 9), (nack.pc, nack.opcode));
    }

    #[test]
    fn sort_keeps_ties_in_order() {
        let code = [
            &[0x0Fu8, 0x20, 0x08, 0x03, 0x01, 0x03, 0x02, 0x0A, 0x0B, 0x0C, 0x0D][..],
            &[0x0B, 0x20, 0x02, 0x04],
            &[0x22, 0x20, 0x10],
            &[0x0C, 0x20, 0x02, 0x04],
            &[0x22, 0x20, 0x10],
            &END,
        ]
        .concat();
        let output = run_counted(&code, &[], 78);
        assert_eq!(
            vec![0, 1, 0, 2, 0, 3, 0, 3, 0, 0x0B, 0, 0x0D, 0, 0x0A, 0, 0x0C],
            output[..16].to_vec()
        );
        assert_eq!(
            vec![0, 3, 0, 3, 0, 2, 0, 1, 0, 0x0A, 0, 0x0C, 0, 0x0D, 0, 0x0B],
            output[16..].to_vec()
        );
    }

    #[test]
    fn sha1_of_fips_180_messages() {
        fn digest_of(input: &[u8]) -> String {
            let length = multitype(input.len() as u16);
            let code = [
                &[0x1Cu8][..],
                &length,
                &[0x88, 0x00, 0x0D, 0x88],
                &length,
                &[0x20, 0x22, 0x20, 0x14],
                &END,
            ]
            .concat();
            let cycles = 2 * input.len() as u64 + 24;
            hex::encode(run_counted(&code, input, cycles))
        }
        assert_eq!("a9993e364706816aba3e25717850c26c9cd0d89d", digest_of(b"abc"));
        assert_eq!(
            "84983e441c3bd26ebaae4aa1f95129e5e54670f1",
            digest_of(b"abcdbcdecdefdefgefghfghighijhijkijkljklmklmnlmnomnopnopq")
        );
        assert_eq!(
            "dea356a2cddd90c7a7ecedc5ebb563934f460452",
            digest_of(
                &b"0123456701234567012345670123456701234567012345670123456701234567".repeat(10)
            )
        );
    }

    #[test]
    fn load_and_multiload() {
        let code = [
            &[0x0Eu8, 0x20, 0x87][..],
            &[0x0F, 0x22, 0x03, 0x50, 0x86, 0xE0],
            &[0x22, 0x20, 0x08],
            &END,
        ]
        .concat();
        assert_eq!(
            vec![0x00, 0x80, 0x00, 0x80, 0x00, 0x40, 0xFF, 0xE0],
            run_counted(&code, &[], 15)
        );

        let decompressor = Decompressor::new(Config::default());
        let code = [&[0x0Fu8, 0xA0, 0x7E, 0x02, 0x01, 0x02][..], &END].concat();
        let nack = decompressor
            .decompress(None, &message(&code, &[]), TransportKind::Message)
            .unwrap_err();
        assert_eq!(NackReason::MultiloadOverwritten, nack.reason);
        assert_eq!((Some(128), 15), (nack.pc, nack.opcode));
    }

    #[test]
    fn copy_wraps_in_byte_copy_window() {
        let code = [
            &[0x0Eu8, 0x86, 0x88][..],
            &[0x0E, 0xA0, 0x42, 0xA1, 0x04],
            &[0x1C, 0x04, 0x88, 0x00],
            &[0x12, 0x88, 0x0A, 0xA1, 0x2C],
            &[0x22, 0xA1, 0x2C, 0x0A],
            &END,
        ]
        .concat();
        assert_eq!(b"abcdabcdab".to_vec(), run_counted(&code, b"abcd", 30));
    }

    #[test]
    fn input_huffman_symbols() {
        let symbol = |destination: u8| {
            vec![
                0x1E, destination, 0x00, 0x02, 0x01, 0x00, 0x00, 0xA0, 0x41, 0x02, 0x04, 0x07,
                0xA0, 0x42,
            ]
        };
        let code = [
            symbol(0x20),
            symbol(0x22),
            symbol(0x24),
            symbol(0x26),
            vec![0x22, 0x20, 0x08],
            END.to_vec(),
        ]
        .concat();
        assert_eq!(
            vec![0x00, 0x41, 0x00, 0x44, 0x00, 0x43, 0x00, 0x41],
            run_counted(&code, &[0x6A], 22)
        );

        let decompressor = Decompressor::new(Config::default());
        let nack = decompressor
            .decompress(None, &message(&code, &[]), TransportKind::Message)
            .unwrap_err();
        assert_eq!(NackReason::MessageTooShort, nack.reason);
    }

    // 8000 iterations of SUBTRACT and COMPARE, 16002 cycles in a 24 byte
    // message
    #[test]
    fn cycle_budget_boundary() {
        let code = [
            &[0x0Eu8, 0x20, 0xBF, 0x40][..],
            &[0x07, 0x10, 0x01],
            &[0x17, 0x50, 0x00, 0xFD, 0x06, 0xFD],
            &END,
        ]
        .concat();
        let data = message(&code, &[]);
        assert_eq!(24, data.len());
        assert_eq!(19072, Config::default().maximum_udvm_cycles(data.len()));
        assert!(run_counted(&code, &[], 16002).is_empty());

        let with_base = |cycles_base: u64| {
            Decompressor::new(Config {
                cycles_base,
                ..Config::default()
            })
            .decompress(None, &data, TransportKind::Message)
        };
        assert_eq!(16002, with_base(809).unwrap().cycles);
        let nack = with_base(808).unwrap_err();
        assert_eq!(NackReason::CyclesExhausted, nack.reason);
        assert_eq!(Some(vec![16]), nack.details);
    }

    #[test]
    fn decompressor_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Decompressor>();
    }
}
