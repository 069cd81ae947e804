//! # IIO hardware buffer layer
//!
//! The streamers only see the AD9361 through these traits:
//!
//! - **IioDevice**: a streaming device (`cf-ad9361-lpc` for RX,
//!   `cf-ad9361-dds-core-lpc` for TX): channel enables, kernel buffer count,
//!   buffer creation, attribute reads and per-channel sample conversion
//! - **IioBuffer**: one kernel-owned DMA block, refilled or pushed as a whole
//! - **PlutoContext**: hands out the two streaming devices and switches the
//!   RX/TX local oscillators on the `ad9361-phy` device
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        PlutoSession (rx / tx streamers)       │
//! ├──────────────────────────────────────────────┤
//! │   PlutoContext / IioDevice / IioBuffer traits │
//! ├──────────────────────┬───────────────────────┤
//! │  SimContext (sim)    │  LibIioContext        │
//! │                      │  (libiio, runtime)    │
//! └──────────────────────┴───────────────────────┘
//! ```
//!
//! Destroying a buffer is dropping it. Callers that need an in-flight
//! transfer released call [`IioBuffer::cancel`] before the drop.

use std::sync::Arc;

use crate::error::PlutoResult;
use crate::types::Direction;

#[cfg(feature = "libiio")]
pub mod libiio;
#[cfg(feature = "sim")]
pub mod sim;

#[cfg(feature = "libiio")]
pub use libiio::LibIioContext;
#[cfg(feature = "sim")]
pub use sim::{SimContext, SimDevice};

/// One hardware ring-buffer block.
pub trait IioBuffer: Send {
    /// Block contents, from `iio_buffer_start` to `iio_buffer_end`.
    fn data(&self) -> &[u8];

    /// Mutable block contents (TX staging).
    fn data_mut(&mut self) -> &mut [u8];

    /// Bytes between consecutive sample sets.
    fn step(&self) -> usize;

    /// Byte offset of `channel`'s first sample from the block start.
    fn first(&self, channel: usize) -> usize;

    /// Wait for the next block from hardware; returns the bytes received.
    fn refill(&mut self) -> PlutoResult<usize>;

    /// Hand the whole block to hardware; returns the bytes sent.
    fn push(&mut self) -> PlutoResult<usize>;

    /// Cancel any in-flight transfer.
    fn cancel(&mut self);
}

/// A streaming IIO device.
pub trait IioDevice: Send + Sync {
    type Buffer: IioBuffer;

    /// Device name as reported by IIO.
    fn name(&self) -> &str;

    /// Number of scan channels.
    fn channels_count(&self) -> usize;

    fn enable_channel(&self, index: usize);

    fn disable_channel(&self, index: usize);

    /// Number of kernel buffers used by the next created buffer.
    fn set_kernel_buffers_count(&self, count: usize) -> PlutoResult<()>;

    /// Allocate a non-cyclic or cyclic buffer of `samples` sample sets.
    fn create_buffer(&self, samples: usize, cyclic: bool) -> PlutoResult<Self::Buffer>;

    /// Read an integer attribute of a named channel (e.g. `voltage0/sampling_frequency`).
    fn channel_attr_i64(&self, channel: &str, attr: &str) -> PlutoResult<i64>;

    /// Convert one raw hardware sample of `channel` to a native i16.
    fn convert(&self, channel: usize, raw: &[u8]) -> i16;

    /// Convert a native i16 to `channel`'s raw hardware layout.
    fn convert_inverse(&self, channel: usize, value: i16, raw: &mut [u8]);
}

/// IIO context of one Pluto.
pub trait PlutoContext: Send + Sync {
    type Device: IioDevice;

    /// Device that streams in `direction`, if present.
    fn device(&self, direction: Direction) -> Option<Arc<Self::Device>>;

    /// Power the local oscillator for `direction` down or up.
    fn set_lo_powerdown(&self, direction: Direction, powerdown: bool) -> PlutoResult<()>;
}
