//! Stream types shared by the streamers and the session

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PlutoError, PlutoResult};

/// SoapySDR format identifiers.
pub const FORMAT_CS8: &str = "CS8";
pub const FORMAT_CS12: &str = "CS12";
pub const FORMAT_CS16: &str = "CS16";
pub const FORMAT_CF32: &str = "CF32";

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Receive stream
    Rx,
    /// Transmit stream
    Tx,
}

impl Direction {
    /// LO channel on the ad9361-phy device that feeds this direction.
    pub const fn lo_channel(&self) -> &'static str {
        match self {
            Direction::Rx => "altvoltage0",
            Direction::Tx => "altvoltage1",
        }
    }

    /// Streaming IIO device for this direction.
    pub const fn device_name(&self) -> &'static str {
        match self {
            Direction::Rx => "cf-ad9361-lpc",
            Direction::Tx => "cf-ad9361-dds-core-lpc",
        }
    }
}

/// Wire format exchanged with the application.
///
/// Standard variants decode the hardware's 12-bit samples; the `*Ext`
/// variants treat the transport as raw signed 8-bit I/Q.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireFormat {
    Cs8,
    Cs12,
    Cs16,
    Cf32,
    Cs8Ext,
    Cs12Ext,
    Cs16Ext,
    Cf32Ext,
}

impl WireFormat {
    /// Resolve a SoapySDR format string for the given transport mode.
    pub fn resolve(name: &str, extended: bool) -> PlutoResult<Self> {
        let format = match (name, extended) {
            (FORMAT_CS8, false) => WireFormat::Cs8,
            (FORMAT_CS12, false) => WireFormat::Cs12,
            (FORMAT_CS16, false) => WireFormat::Cs16,
            (FORMAT_CF32, false) => WireFormat::Cf32,
            (FORMAT_CS8, true) => WireFormat::Cs8Ext,
            (FORMAT_CS12, true) => WireFormat::Cs12Ext,
            (FORMAT_CS16, true) => WireFormat::Cs16Ext,
            (FORMAT_CF32, true) => WireFormat::Cf32Ext,
            _ => return Err(PlutoError::UnsupportedFormat(name.to_string())),
        };
        Ok(format)
    }

    /// SoapySDR format string.
    pub const fn name(&self) -> &'static str {
        match self {
            WireFormat::Cs8 | WireFormat::Cs8Ext => FORMAT_CS8,
            WireFormat::Cs12 | WireFormat::Cs12Ext => FORMAT_CS12,
            WireFormat::Cs16 | WireFormat::Cs16Ext => FORMAT_CS16,
            WireFormat::Cf32 | WireFormat::Cf32Ext => FORMAT_CF32,
        }
    }

    /// True for the 8-bit-native transport variants.
    pub const fn is_extended(&self) -> bool {
        matches!(
            self,
            WireFormat::Cs8Ext | WireFormat::Cs12Ext | WireFormat::Cs16Ext | WireFormat::Cf32Ext
        )
    }

    /// Bytes of one complex sample in the caller's buffer.
    #[inline]
    pub const fn bytes_per_sample(&self) -> usize {
        match self {
            WireFormat::Cs8 | WireFormat::Cs8Ext => 2,
            WireFormat::Cs12 | WireFormat::Cs12Ext => 3,
            WireFormat::Cs16 | WireFormat::Cs16Ext => 4,
            WireFormat::Cf32 | WireFormat::Cf32Ext => 8,
        }
    }

    /// Bytes of one I/Q pair in the hardware block when only channel pair 0 is enabled.
    #[inline]
    pub const fn native_step(&self) -> usize {
        if self.is_extended() {
            2
        } else {
            4
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended() {
            write!(f, "{} (extended)", self.name())
        } else {
            f.write_str(self.name())
        }
    }
}

/// SoapySDR stream flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFlags(pub i32);

impl StreamFlags {
    pub const END_BURST: StreamFlags = StreamFlags(1 << 1);
    pub const HAS_TIME: StreamFlags = StreamFlags(1 << 2);
    pub const END_ABRUPT: StreamFlags = StreamFlags(1 << 3);
    pub const ONE_PACKET: StreamFlags = StreamFlags(1 << 4);
    pub const MORE_FRAGMENTS: StreamFlags = StreamFlags(1 << 5);
    pub const WAIT_TRIGGER: StreamFlags = StreamFlags(1 << 6);

    pub const fn empty() -> Self {
        StreamFlags(0)
    }

    pub const fn bits(&self) -> i32 {
        self.0
    }

    pub const fn contains(&self, other: StreamFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bits set here that are not in `allowed`.
    pub const fn without(&self, allowed: StreamFlags) -> StreamFlags {
        StreamFlags(self.0 & !allowed.0)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for StreamFlags {
    type Output = StreamFlags;

    fn bitor(self, rhs: StreamFlags) -> StreamFlags {
        StreamFlags(self.0 | rhs.0)
    }
}

/// Keyword arguments passed at stream setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamArgs {
    args: HashMap<String, String>,
}

impl StreamArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a key/value pair
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.args.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.args.contains_key(key)
    }

    /// Explicit block length in samples, if `bufflen` holds a positive integer.
    ///
    /// Malformed or non-positive values are logged and ignored.
    pub fn bufflen(&self) -> Option<usize> {
        let raw = self.get("bufflen")?;
        match raw.trim().parse::<i64>() {
            Ok(len) if len > 0 => usize::try_from(len).ok(),
            _ => {
                tracing::warn!("Ignoring invalid bufflen '{}'", raw);
                None
            }
        }
    }
}

impl FromStr for StreamArgs {
    type Err = PlutoError;

    /// Parse `key=value,key=value`; entries without `=` are skipped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut args = HashMap::new();
        for pair in s.split(',') {
            if let Some(pos) = pair.find('=') {
                let key = pair[..pos].trim();
                if key.is_empty() {
                    return Err(PlutoError::ConfigError(format!("empty key in '{}'", pair)));
                }
                args.insert(key.to_string(), pair[pos + 1..].trim().to_string());
            }
        }
        Ok(Self { args })
    }
}

impl From<HashMap<String, String>> for StreamArgs {
    fn from(args: HashMap<String, String>) -> Self {
        Self { args }
    }
}

/// Native hardware format and its full-scale value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NativeFormat {
    pub format: &'static str,
    pub full_scale: f64,
}

/// Description of a stream argument (for `stream_args_info`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgInfo {
    pub key: String,
    pub value: String,
    pub name: String,
    pub description: String,
}

/// Asynchronous stream condition reported by `read_stream_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// RX samples dropped by the DMA engine
    Overflow,
    /// TX DMA ran out of samples
    Underflow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_standard_and_extended() {
        assert_eq!(WireFormat::resolve("CF32", false).unwrap(), WireFormat::Cf32);
        assert_eq!(WireFormat::resolve("CS12", true).unwrap(), WireFormat::Cs12Ext);
        assert_eq!(WireFormat::resolve("CS8", true).unwrap().name(), "CS8");
        assert!(WireFormat::Cs16Ext.is_extended());
        assert!(!WireFormat::Cs16.is_extended());
    }

    #[test]
    fn test_resolve_rejects_unknown() {
        for extended in [false, true] {
            match WireFormat::resolve("CU8", extended) {
                Err(PlutoError::UnsupportedFormat(name)) => assert_eq!(name, "CU8"),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_sample_widths() {
        assert_eq!(WireFormat::Cs8.bytes_per_sample(), 2);
        assert_eq!(WireFormat::Cs12Ext.bytes_per_sample(), 3);
        assert_eq!(WireFormat::Cs16.bytes_per_sample(), 4);
        assert_eq!(WireFormat::Cf32Ext.bytes_per_sample(), 8);
        assert_eq!(WireFormat::Cf32.native_step(), 4);
        assert_eq!(WireFormat::Cs8Ext.native_step(), 2);
    }

    #[test]
    fn test_stream_args_parse() {
        let args: StreamArgs = "bufflen=4096, driver = plutosdr".parse().unwrap();
        assert_eq!(args.get("driver"), Some("plutosdr"));
        assert_eq!(args.bufflen(), Some(4096));
    }

    #[test]
    fn test_bufflen_invalid_values_ignored() {
        assert_eq!(StreamArgs::new().with("bufflen", "abc").bufflen(), None);
        assert_eq!(StreamArgs::new().with("bufflen", "0").bufflen(), None);
        assert_eq!(StreamArgs::new().with("bufflen", "-5").bufflen(), None);
        assert_eq!(StreamArgs::new().bufflen(), None);
    }

    #[test]
    fn test_flags() {
        let flags = StreamFlags::END_BURST | StreamFlags::HAS_TIME;
        assert!(flags.contains(StreamFlags::END_BURST));
        assert_eq!(flags.without(StreamFlags::END_BURST), StreamFlags::HAS_TIME);
        assert!(StreamFlags::END_BURST.without(StreamFlags::END_BURST).is_empty());
    }
}
