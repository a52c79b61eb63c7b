//! # SigComp Decompression
//!
//! RFC 3320 Signaling Compression for the Nebula SIP stack: the Universal
//! Decompressor Virtual Machine, the per-compartment state store and RFC
//! 4077 NACK reporting.
//!
//! ## Core Components
//!
//! - **Memory**: circular UDVM memory with the byte copying rules
//! - **Instructions**: operand decoding, the 36 UDVM instructions and their
//!   cycle costs
//! - **UDVM**: fetch/decode/execute loop bounded by the cycle budget
//! - **State**: compartments, global dictionary states and eviction
//! - **Framing**: SigComp message headers and stream delimiting
//! - **NACK**: failure reasons and the NACK wire format
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sigcomp::{CompartmentId, Config, Decompressor, TransportKind};
//!
//! let decompressor = Decompressor::new(Config::new()?);
//! let peer = CompartmentId::from("udp:192.0.2.1:5060");
//! match decompressor.decompress(Some(&peer), &datagram, TransportKind::Message) {
//!     Ok(result) => handle_sip(result.output),
//!     Err(nack) => send(nack.to_bytes(None)),
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod decompressor;
mod exec;
pub mod framing;
pub mod input;
pub mod instruction;
pub mod message;
pub mod nack;
pub mod operand;
pub mod state;
pub mod udvm;

pub use config::Config;
pub use decompressor::{Decompressed, Decompressor, TransportKind};
pub use exec::{arithmetic, crc16, sort_permutation};
pub use framing::{encode_stream_message, StreamFramer};
pub use nack::{NackReason, NackReport};
pub use state::{CompartmentId, StateItem, StateStore};
pub use udvm::{Completion, Udvm, UdvmError, UdvmFailure};
