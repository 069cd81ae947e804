//! R4W PlutoSDR Streaming
//!
//! Moves I/Q samples between the AD9361 IIO DMA ring buffers of an ADALM-Pluto
//! and an application, converting between the hardware's 12-bit samples and
//! the SoapySDR wire formats:
//!
//! - **CS16**, **CF32**, **CS12**, **CS8** on the standard transport
//! - the same four on the extended transport, which carries raw signed 8-bit I/Q
//!
//! The crate covers the streaming core only. Tuning, gains and device
//! discovery stay with the caller.
//!
//! # Feature Flags
//!
//! - `sim` (default): simulated IIO backend for development and tests
//! - `libiio`: runtime-loaded libiio backend for real hardware
//!
//! # Example
//!
//! ```rust,no_run
//! use r4w_pluto::{Direction, PlutoConfig, PlutoSession, SimContext, StreamArgs, StreamFlags};
//!
//! let session = PlutoSession::new(SimContext::new(), PlutoConfig::default());
//! let rx = session
//!     .setup_stream(Direction::Rx, "CS16", &[0], &StreamArgs::new())
//!     .unwrap();
//! session.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
//!
//! let mtu = session.stream_mtu(rx);
//! let mut samples = vec![0u8; mtu * 4];
//! let n = session.read_stream(rx, &mut [&mut samples[..]], mtu, 100_000);
//! println!("read: {:?}", n);
//! ```

pub mod config;
pub mod convert;
pub mod error;
pub mod iio;
pub mod rx;
pub mod session;
pub mod sizing;
pub mod tx;
pub mod types;

// Re-export main types
pub use config::PlutoConfig;
pub use error::{status, PlutoError, PlutoResult};
pub use iio::{IioBuffer, IioDevice, PlutoContext};
pub use rx::RxStreamer;
pub use session::{PlutoSession, StreamHandle};
pub use sizing::BufferPlan;
pub use tx::TxStreamer;
pub use types::{
    ArgInfo, Direction, NativeFormat, StatusEvent, StreamArgs, StreamFlags, WireFormat,
};

#[cfg(feature = "sim")]
pub use iio::{SimContext, SimDevice};

#[cfg(feature = "libiio")]
pub use iio::LibIioContext;
