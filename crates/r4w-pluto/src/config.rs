//! Session configuration

use serde::{Deserialize, Serialize};

use crate::sizing::DEFAULT_RX_BUFFER_SIZE;

/// Configuration for a Pluto streaming session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlutoConfig {
    /// Carry raw signed 8-bit I/Q instead of 12-bit samples
    pub extended_mode: bool,

    /// Use the direct-copy path without checking buffer layout and endianness
    pub force_direct_copy: bool,

    /// RX block size (samples) before any sizing decision
    pub default_rx_buffer_size: usize,
}

impl Default for PlutoConfig {
    fn default() -> Self {
        Self {
            extended_mode: false,
            force_direct_copy: true,
            default_rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
        }
    }
}

impl PlutoConfig {
    /// Builder: select the 8-bit-native transport
    pub fn extended(mut self, enabled: bool) -> Self {
        self.extended_mode = enabled;
        self
    }

    /// Builder: verify direct-copy eligibility instead of assuming it
    pub fn verify_direct_copy(mut self) -> Self {
        self.force_direct_copy = false;
        self
    }

    /// Builder: set the initial RX block size
    pub fn rx_buffer_size(mut self, samples: usize) -> Self {
        self.default_rx_buffer_size = samples;
        self
    }
}
