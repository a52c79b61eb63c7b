//! Decompressor parameters.
//!
//! Read from the TOML file named by `SIGCOMP_CONF`, default
//! `/etc/nebula/sigcomp.conf`:
//!
//! ```toml
//! decompression_memory_size = 8192
//! state_memory_size = 2048
//! cycles_per_bit = 16
//! sigcomp_version = 1
//! cycles_base = 1000
//! max_output_size = 65536
//! ```
//!
//! Missing keys take the RFC 3320 defaults.

use crate::buffer::MAX_MEMORY_SIZE;
use crate::decompressor::TransportKind;
use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/nebula/sigcomp.conf";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cycles_per_bit must be 16, 32, 64 or 128, got {0}")]
    CyclesPerBit(u16),
    #[error("decompression_memory_size must be at least 2048, got {0}")]
    DecompressionMemorySize(usize),
    #[error("state_memory_size {0} is not a valid SigComp value")]
    StateMemorySize(usize),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub decompression_memory_size: usize,
    pub state_memory_size: usize,
    pub cycles_per_bit: u16,
    pub sigcomp_version: u16,
    /// Constant term of the cycle budget, 1000 in RFC 3320.
    pub cycles_base: u64,
    pub max_output_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            decompression_memory_size: 8192,
            state_memory_size: 2048,
            cycles_per_bit: 16,
            sigcomp_version: 1,
            cycles_base: 1000,
            max_output_size: 65536,
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    pub fn new() -> Result<Config> {
        let path = std::env::var("SIGCOMP_CONF")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_file(&path)
    }

    pub fn from_file(path: &str) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        contents.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.cycles_per_bit, 16 | 32 | 64 | 128) {
            return Err(ConfigError::CyclesPerBit(self.cycles_per_bit));
        }
        if self.decompression_memory_size < 2048 {
            return Err(ConfigError::DecompressionMemorySize(
                self.decompression_memory_size,
            ));
        }
        if self.state_memory_size != 0
            && (self.state_memory_size < 2048
                || !self.state_memory_size.is_power_of_two())
        {
            return Err(ConfigError::StateMemorySize(self.state_memory_size));
        }
        Ok(())
    }

    /// Cycle budget for a message of `message_len` bytes.
    pub fn maximum_udvm_cycles(&self, message_len: usize) -> u64 {
        (8 * message_len as u64 + self.cycles_base) * self.cycles_per_bit as u64
    }

    /// UDVM memory size for a message, `None` when the message itself does
    /// not fit in the decompression memory.
    pub fn udvm_memory_size(
        &self,
        message_len: usize,
        transport: TransportKind,
    ) -> Option<usize> {
        let size = match transport {
            TransportKind::Message => {
                self.decompression_memory_size.checked_sub(message_len)?
            }
            TransportKind::Stream => self.decompression_memory_size / 2,
        };
        Some(size.min(MAX_MEMORY_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let config: Config = "cycles_per_bit = 32\nstate_memory_size = 4096"
            .parse()
            .unwrap();
        assert_eq!(32, config.cycles_per_bit);
        assert_eq!(4096, config.state_memory_size);
        assert_eq!(8192, config.decompression_memory_size);
        assert_eq!(1000, config.cycles_base);
    }

    #[test]
    fn invalid_values() {
        assert!("cycles_per_bit = 20".parse::<Config>().is_err());
        assert!("decompression_memory_size = 1024".parse::<Config>().is_err());
        assert!("state_memory_size = 3000".parse::<Config>().is_err());
        assert!("state_memory_size = 0".parse::<Config>().is_ok());
        assert!("cycles_per_bit = \"x\"".parse::<Config>().is_err());
    }

    #[test]
    fn cycle_budget() {
        let config = Config::default();
        assert_eq!((8 * 100 + 1000) * 16, config.maximum_udvm_cycles(100));
    }

    #[test]
    fn memory_size_per_transport() {
        let config = Config::default();
        assert_eq!(Some(8092), config.udvm_memory_size(100, TransportKind::Message));
        assert_eq!(Some(4096), config.udvm_memory_size(100, TransportKind::Stream));
        assert_eq!(None, config.udvm_memory_size(9000, TransportKind::Message));
        let big = Config {
            decompression_memory_size: 1 << 20,
            ..Config::default()
        };
        assert_eq!(Some(MAX_MEMORY_SIZE), big.udvm_memory_size(10, TransportKind::Message));
    }
}
