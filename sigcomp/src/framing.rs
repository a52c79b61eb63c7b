//! Delimiting of SigComp messages carried over a stream transport.
//!
//! Messages are terminated by `0xFF 0xFF`. Inside a message a `0xFF` byte
//! is followed by an escape byte `N`: `0x00..=0x7F` stands for one literal
//! `0xFF` followed by `N` bytes copied verbatim, `0x80..=0xFE` is reserved.

use crate::nack::NackReason;
use thiserror::Error;

const ESCAPE: u8 = 0xFF;
const MAX_LITERAL_RUN: u8 = 0x7F;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("reserved escape byte {0:#04x}")]
    ReservedEscape(u8),
}

impl FramingError {
    pub fn reason(&self) -> NackReason {
        NackReason::FramingError
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Marker,
    Literal(u8),
}

/// Incremental decoder turning stream bytes into unescaped messages.
pub struct StreamFramer {
    current: Vec<u8>,
    escape: Escape,
    // skipping the rest of a corrupted message until its delimiter
    discarding: bool,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            current: Vec::new(),
            escape: Escape::None,
            discarding: false,
        }
    }

    /// Feed received bytes, returning every message completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<Vec<u8>, FramingError>> {
        let mut messages = Vec::new();
        for &byte in data {
            match self.escape {
                Escape::Literal(n) => {
                    self.current.push(byte);
                    self.escape = if n > 1 {
                        Escape::Literal(n - 1)
                    } else {
                        Escape::None
                    };
                }
                Escape::Marker => {
                    self.escape = Escape::None;
                    match byte {
                        ESCAPE => {
                            let message = std::mem::take(&mut self.current);
                            if !self.discarding && !message.is_empty() {
                                messages.push(Ok(message));
                            }
                            self.discarding = false;
                        }
                        0..=MAX_LITERAL_RUN => {
                            self.current.push(ESCAPE);
                            if byte > 0 {
                                self.escape = Escape::Literal(byte);
                            }
                        }
                        _ => {
                            self.current.clear();
                            if !self.discarding {
                                messages.push(Err(FramingError::ReservedEscape(byte)));
                            }
                            self.discarding = true;
                        }
                    }
                }
                Escape::None => {
                    if byte == ESCAPE {
                        self.escape = Escape::Marker;
                    } else {
                        self.current.push(byte);
                    }
                }
            }
        }
        messages
    }

    /// Bytes buffered for the message in progress.
    pub fn pending(&self) -> usize {
        self.current.len()
    }
}

/// Escape `message` for a stream transport and append the delimiter.
pub fn encode_stream_message(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 2);
    let mut i = 0;
    while i < message.len() {
        if message[i] == ESCAPE {
            // copy up to 0x7F following bytes verbatim behind the escape
            let run = (message.len() - i - 1).min(MAX_LITERAL_RUN as usize);
            out.push(ESCAPE);
            out.push(run as u8);
            out.extend_from_slice(&message[i + 1..i + 1 + run]);
            i += 1 + run;
        } else {
            out.push(message[i]);
            i += 1;
        }
    }
    out.extend_from_slice(&[ESCAPE, ESCAPE]);
    out
}
