//! # Receive Streamer
//!
//! Owns the RX hardware ring buffer of `cf-ad9361-lpc` and hands its blocks
//! to the caller in pieces:
//!
//! ```text
//!   refill ──► [ block: items_in_buffer samples left, read at byte_offset ]
//!                 │
//!                 └─► recv(num_elems) ──► min(items_in_buffer, num_elems) samples
//! ```
//!
//! A block is refilled only once the previous one is fully consumed. The
//! buffer itself is created on [`RxStreamer::start`] and destroyed on
//! [`RxStreamer::stop`]; the streamer object outlives both.

use std::sync::Arc;

use crate::config::PlutoConfig;
use crate::convert::{self, encode_rx};
use crate::error::{PlutoError, PlutoResult};
use crate::iio::{IioBuffer, IioDevice};
use crate::sizing::BufferPlan;
use crate::types::{Direction, StreamArgs, WireFormat};

/// Receive side of one Pluto stream.
pub struct RxStreamer<D: IioDevice> {
    device: Arc<D>,
    channels: Vec<usize>,
    format: WireFormat,
    plan: BufferPlan,
    buffer: Option<D::Buffer>,
    items_in_buffer: usize,
    byte_offset: usize,
    direct_copy: bool,
    force_direct_copy: bool,
}

impl<D: IioDevice> RxStreamer<D> {
    /// Claim the channels for `channels.len()` I/Q pairs and size the ring buffer.
    ///
    /// No hardware buffer exists until [`start`](Self::start).
    pub fn new(
        device: Arc<D>,
        format: WireFormat,
        channels: &[usize],
        args: &StreamArgs,
        config: &PlutoConfig,
    ) -> PlutoResult<Self> {
        let channels = claim_channels(device.as_ref(), channels.len(), format)?;
        tracing::info!("RX using format {}", format);

        let plan = BufferPlan::for_stream(Direction::Rx, args, config.default_rx_buffer_size, || {
            let rate = device.channel_attr_i64("voltage0", "sampling_frequency")?;
            Ok(u64::try_from(rate).unwrap_or(0))
        });
        tracing::info!(
            "RX buffer: {} samples x {} kernel buffers",
            plan.block_size,
            plan.kernel_buffers
        );

        Ok(Self {
            device,
            channels,
            format,
            plan,
            buffer: None,
            items_in_buffer: 0,
            byte_offset: 0,
            direct_copy: false,
            force_direct_copy: config.force_direct_copy,
        })
    }

    /// (Re)create the ring buffer. Any existing buffer is stopped first.
    pub fn start(&mut self) -> PlutoResult<()> {
        self.stop();

        if let Err(e) = self.device.set_kernel_buffers_count(self.plan.kernel_buffers) {
            tracing::warn!(
                "Could not set {} RX kernel buffers: {}",
                self.plan.kernel_buffers,
                e
            );
        }

        let buffer = self
            .device
            .create_buffer(self.plan.block_size, false)
            .map_err(|e| {
                tracing::error!("Unable to create RX buffer: {}", e);
                PlutoError::BufferCreation {
                    device: self.device.name().to_string(),
                    samples: self.plan.block_size,
                    reason: e.to_string(),
                }
            })?;

        // forcing never applies to multi-pair layouts
        self.direct_copy = (self.force_direct_copy && self.channels.len() == 2)
            || convert::is_direct_copy_eligible(self.device.as_ref(), &buffer, &self.channels, self.format);
        tracing::debug!(
            "RX buffer created ({} samples), direct copy: {}",
            self.plan.block_size,
            self.direct_copy
        );

        self.buffer = Some(buffer);
        Ok(())
    }

    /// Cancel and destroy the ring buffer, resetting the read cursor.
    pub fn stop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.cancel();
            drop(buffer);
            tracing::debug!("RX buffer destroyed");
        }
        self.items_in_buffer = 0;
        self.byte_offset = 0;
    }

    /// Read up to `num_elems` samples per channel pair into `buffs`.
    ///
    /// Returns 0 when the stream is not started. `timeout_us` is advisory:
    /// the call blocks for at most one hardware refill.
    pub fn recv(
        &mut self,
        buffs: &mut [&mut [u8]],
        num_elems: usize,
        _timeout_us: i64,
    ) -> PlutoResult<usize> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Ok(0);
        };

        if self.items_in_buffer == 0 {
            match buffer.refill() {
                Ok(bytes) => {
                    self.items_in_buffer = bytes / buffer.step();
                    self.byte_offset = 0;
                }
                Err(e) => {
                    tracing::debug!("RX refill failed: {}", e);
                    return Err(PlutoError::Timeout);
                }
            }
        }

        let pairs = self.channels.len() / 2;
        let width = self.format.bytes_per_sample();
        let capacity = caller_capacity(&*buffs, pairs, width)?;
        let items = self.items_in_buffer.min(num_elems).min(capacity);
        if items == 0 {
            return Ok(0);
        }

        let step = buffer.step();
        if self.direct_copy {
            let src = &buffer.data()[self.byte_offset..];
            convert::rx_direct(self.format, src, items, buffs[0]);
        } else {
            recv_generic(
                self.device.as_ref(),
                buffer,
                &self.channels,
                self.format,
                self.byte_offset,
                items,
                buffs,
            );
        }

        self.items_in_buffer -= items;
        self.byte_offset += items * step;
        Ok(items)
    }

    /// Apply a new block size and kernel depth.
    ///
    /// An active stream gets a freshly created buffer when the plan changes.
    pub fn set_buffer_size(&mut self, plan: BufferPlan) -> PlutoResult<()> {
        let changed = plan != self.plan;
        self.plan = plan;
        tracing::info!("RX MTU: {}", plan.mtu());

        if changed && self.buffer.is_some() {
            self.start()?;
        }
        Ok(())
    }

    pub fn mtu(&self) -> usize {
        self.plan.mtu()
    }

    pub fn plan(&self) -> BufferPlan {
        self.plan
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Enabled channel indices, in I/Q pair order.
    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    /// Samples left unread in the current block.
    pub fn items_in_buffer(&self) -> usize {
        self.items_in_buffer
    }

    /// Read position within the current block, in bytes.
    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn is_active(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn is_direct_copy(&self) -> bool {
        self.direct_copy
    }
}

impl<D: IioDevice> Drop for RxStreamer<D> {
    fn drop(&mut self) {
        self.stop();
        for &channel in &self.channels {
            self.device.disable_channel(channel);
        }
    }
}

/// Disable every channel, then enable `0..2n` for `requested` I/Q pairs.
///
/// In extended mode I and Q travel together in channel 0, so channel 1 is
/// left disabled. Shared with the transmit streamer.
pub(crate) fn claim_channels<D: IioDevice>(
    device: &D,
    requested: usize,
    format: WireFormat,
) -> PlutoResult<Vec<usize>> {
    let wanted = check_channel_count(device, requested)?;
    let count = device.channels_count();

    for i in 0..count {
        device.disable_channel(i);
    }

    let channels: Vec<usize> = (0..wanted).collect();
    for &i in &channels {
        device.enable_channel(i);
    }
    if format.is_extended() {
        device.disable_channel(1);
    }
    Ok(channels)
}

/// Number of scan channels `requested` I/Q pairs occupy, if the device has them.
pub(crate) fn check_channel_count<D: IioDevice>(
    device: &D,
    requested: usize,
) -> PlutoResult<usize> {
    let count = device.channels_count();
    let wanted = 2 * requested.max(1);
    if wanted > count {
        return Err(PlutoError::ConfigError(format!(
            "{} I/Q pairs requested but {} has {} channels",
            wanted / 2,
            device.name(),
            count
        )));
    }
    Ok(wanted)
}

/// Smallest number of samples every caller buffer can hold.
pub(crate) fn caller_capacity<B: AsRef<[u8]>>(
    buffs: &[B],
    pairs: usize,
    width: usize,
) -> PlutoResult<usize> {
    if buffs.len() < pairs {
        return Err(PlutoError::ConfigError(format!(
            "{} buffers given for {} channel pairs",
            buffs.len(),
            pairs
        )));
    }
    Ok(buffs[..pairs]
        .iter()
        .map(|b| b.as_ref().len() / width)
        .min()
        .unwrap_or(0))
}

/// Per-channel decode through the device's raw-to-native conversion.
fn recv_generic<D: IioDevice>(
    device: &D,
    buffer: &D::Buffer,
    channels: &[usize],
    format: WireFormat,
    byte_offset: usize,
    items: usize,
    buffs: &mut [&mut [u8]],
) {
    let data = buffer.data();
    let step = buffer.step();
    let width = format.bytes_per_sample();

    for (pair, out) in channels.chunks_exact(2).zip(buffs.iter_mut()) {
        let (ch_i, ch_q) = (pair[0], pair[1]);
        let base_i = buffer.first(ch_i) + byte_offset;
        let base_q = buffer.first(ch_q) + byte_offset;

        for (j, sample) in out.chunks_exact_mut(width).take(items).enumerate() {
            let at_i = base_i + j * step;
            let (i, q) = if format.is_extended() {
                // I is the first byte in memory, Q the second. The channel's
                // scan format describes one 16-bit word, so it is not applied.
                (i16::from(data[at_i] as i8), i16::from(data[at_i + 1] as i8))
            } else {
                let at_q = base_q + j * step;
                (
                    device.convert(ch_i, &data[at_i..at_i + 2]),
                    device.convert(ch_q, &data[at_q..at_q + 2]),
                )
            };
            encode_rx(format, i, q, sample);
        }
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::iio::SimDevice;
    use byteorder::{ByteOrder, NativeEndian};

    fn device() -> Arc<SimDevice> {
        Arc::new(SimDevice::new("cf-ad9361-lpc", 4))
    }

    fn streamer(dev: &Arc<SimDevice>, format: WireFormat, bufflen: usize) -> RxStreamer<SimDevice> {
        let args = StreamArgs::new().with("bufflen", &bufflen.to_string());
        RxStreamer::new(Arc::clone(dev), format, &[0], &args, &PlutoConfig::default()).unwrap()
    }

    fn read_words(bytes: &[u8]) -> Vec<i16> {
        bytes.chunks_exact(2).map(NativeEndian::read_i16).collect()
    }

    #[test]
    fn test_construction_claims_channels() {
        let dev = device();
        dev.enable_channel(3);
        let rx = streamer(&dev, WireFormat::Cs16, 8);
        assert_eq!(dev.enabled_channels(), vec![0, 1]);
        assert_eq!(rx.channels(), &[0, 1]);
        assert!(!rx.is_active());
        assert_eq!(dev.created_buffers(), Vec::<usize>::new());

        drop(rx);
        assert!(dev.enabled_channels().is_empty());
    }

    #[test]
    fn test_extended_disables_q_channel() {
        let dev = device();
        let rx = streamer(&dev, WireFormat::Cs8Ext, 8);
        assert_eq!(dev.enabled_channels(), vec![0]);
        assert_eq!(rx.channels(), &[0, 1]);
    }

    #[test]
    fn test_too_many_channels() {
        let dev = device();
        let result = RxStreamer::new(
            Arc::clone(&dev),
            WireFormat::Cs16,
            &[0, 1, 2],
            &StreamArgs::new(),
            &PlutoConfig::default(),
        );
        assert!(matches!(result, Err(PlutoError::ConfigError(_))));
    }

    #[test]
    fn test_rate_derived_sizing() {
        let dev = device();
        dev.set_sample_rate(61_440_000);
        let rx = RxStreamer::new(
            Arc::clone(&dev),
            WireFormat::Cs16,
            &[0],
            &StreamArgs::new(),
            &PlutoConfig::default(),
        )
        .unwrap();
        assert_eq!(rx.plan(), BufferPlan::for_rx_rate(61_440_000));
        assert_eq!(rx.mtu(), 7_680_000 / 4);
    }

    #[test]
    fn test_start_creates_buffer_with_kernel_count() {
        let dev = device();
        let mut rx = streamer(&dev, WireFormat::Cs16, 1024);
        rx.start().unwrap();
        assert!(rx.is_active());
        assert!(rx.is_direct_copy());
        assert_eq!(dev.kernel_buffers(), Some(8));
        assert_eq!(dev.created_buffers(), vec![1024]);

        // start is idempotent: the old buffer is cancelled and destroyed
        rx.start().unwrap();
        assert_eq!(dev.cancelled_buffers(), 1);
        assert_eq!(dev.live_buffers(), 1);
    }

    #[test]
    fn test_start_failure_is_fatal() {
        let dev = device();
        dev.set_fail_create(true);
        let mut rx = streamer(&dev, WireFormat::Cs16, 1024);
        match rx.start() {
            Err(PlutoError::BufferCreation { device, samples, .. }) => {
                assert_eq!(device, "cf-ad9361-lpc");
                assert_eq!(samples, 1024);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!rx.is_active());
    }

    #[test]
    fn test_recv_before_start_returns_zero() {
        let dev = device();
        let mut rx = streamer(&dev, WireFormat::Cs16, 8);
        let mut out = vec![0u8; 32];
        assert_eq!(rx.recv(&mut [&mut out[..]], 8, 100_000).unwrap(), 0);
    }

    #[test]
    fn test_partial_consumption_tracks_cursor() {
        let dev = device();
        let mut rx = streamer(&dev, WireFormat::Cs16, 4);
        rx.start().unwrap();
        dev.queue_rx_words(&[1, -1, 2, -2, 3, -3, 4, -4]);

        let mut out = vec![0u8; 12];
        assert_eq!(rx.recv(&mut [&mut out[..]], 3, 0).unwrap(), 3);
        assert_eq!(read_words(&out), vec![1, -1, 2, -2, 3, -3]);
        assert_eq!(rx.items_in_buffer(), 1);
        assert_eq!(rx.byte_offset(), 12);

        // only what is left in the block, no refill
        assert_eq!(rx.recv(&mut [&mut out[..]], 3, 0).unwrap(), 1);
        assert_eq!(read_words(&out[..4]), vec![4, -4]);
        assert_eq!(rx.items_in_buffer(), 0);
    }

    #[test]
    fn test_recv_capped_by_caller_buffer() {
        let dev = device();
        let mut rx = streamer(&dev, WireFormat::Cf32, 4);
        rx.start().unwrap();
        dev.queue_rx_words(&[2048, -2048, 1024, 0, 0, 0, 0, 0]);

        let mut out = vec![0u8; 16];
        assert_eq!(rx.recv(&mut [&mut out[..]], 100, 0).unwrap(), 2);
        let values: Vec<f32> = out.chunks_exact(4).map(NativeEndian::read_f32).collect();
        assert_eq!(values, vec![1.0, -1.0, 0.5, 0.0]);
        assert_eq!(rx.items_in_buffer(), 2);
    }

    #[test]
    fn test_refill_failure_is_timeout_and_recoverable() {
        let dev = device();
        let mut rx = streamer(&dev, WireFormat::Cs16, 2);
        rx.start().unwrap();
        dev.fail_next_refill();

        let mut out = vec![0u8; 8];
        assert_eq!(rx.recv(&mut [&mut out[..]], 2, 0), Err(PlutoError::Timeout));

        dev.queue_rx_words(&[5, 6, 7, 8]);
        assert_eq!(rx.recv(&mut [&mut out[..]], 2, 0).unwrap(), 2);
        assert_eq!(read_words(&out), vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_stop_start_resets_cursor() {
        let dev = device();
        let mut rx = streamer(&dev, WireFormat::Cs16, 4);
        rx.start().unwrap();
        dev.queue_rx_words(&[1, 1, 2, 2, 3, 3, 4, 4]);
        let mut out = vec![0u8; 4];
        rx.recv(&mut [&mut out[..]], 1, 0).unwrap();

        rx.stop();
        rx.start().unwrap();
        assert_eq!(rx.items_in_buffer(), 0);
        assert_eq!(rx.byte_offset(), 0);
    }

    #[test]
    fn test_generic_path_matches_direct() {
        let words = [100i16, -100, 2047, -2048];
        let mut results = Vec::new();

        for force in [true, false] {
            let dev = device();
            let config = PlutoConfig {
                force_direct_copy: force,
                ..PlutoConfig::default()
            };
            let args = StreamArgs::new().with("bufflen", "2");
            let mut rx =
                RxStreamer::new(Arc::clone(&dev), WireFormat::Cs12, &[0], &args, &config).unwrap();
            rx.start().unwrap();
            assert!(rx.is_direct_copy());
            rx.direct_copy = force;

            dev.queue_rx_words(&words);
            let mut out = vec![0u8; 6];
            assert_eq!(rx.recv(&mut [&mut out[..]], 2, 0).unwrap(), 2);
            results.push(out);
        }
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn test_generic_path_two_pairs() {
        let dev = device();
        let config = PlutoConfig::default();
        let args = StreamArgs::new().with("bufflen", "2");
        let mut rx =
            RxStreamer::new(Arc::clone(&dev), WireFormat::Cs16, &[0, 1], &args, &config).unwrap();
        rx.start().unwrap();
        assert!(!rx.is_direct_copy());

        // sample sets: [i0 q0 i1 q1]
        dev.queue_rx_words(&[1, 2, 10, 20, 3, 4, 30, 40]);
        let mut a = vec![0u8; 8];
        let mut b = vec![0u8; 8];
        assert_eq!(rx.recv(&mut [&mut a[..], &mut b[..]], 2, 0).unwrap(), 2);
        assert_eq!(read_words(&a), vec![1, 2, 3, 4]);
        assert_eq!(read_words(&b), vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_generic_path_extended_splits_bytes() {
        let dev = device();
        let config = PlutoConfig::default().extended(true).verify_direct_copy();
        let args = StreamArgs::new().with("bufflen", "2");
        let mut rx =
            RxStreamer::new(Arc::clone(&dev), WireFormat::Cs8Ext, &[0], &args, &config).unwrap();
        rx.start().unwrap();
        assert!(rx.is_direct_copy());
        rx.direct_copy = false;

        dev.queue_rx_block(vec![0x05, 0xFB, 0x80, 0x7F]);
        let mut out = vec![0u8; 4];
        assert_eq!(rx.recv(&mut [&mut out[..]], 2, 0).unwrap(), 2);
        assert_eq!(out, vec![0x05, 0xFB, 0x80, 0x7F]);
    }

    #[test]
    fn test_generic_path_extended_ignores_word_conversion() {
        let dev = device();
        dev.set_byte_swapped(true);
        let config = PlutoConfig::default().extended(true);
        let args = StreamArgs::new().with("bufflen", "2");
        let mut rx =
            RxStreamer::new(Arc::clone(&dev), WireFormat::Cs8Ext, &[0], &args, &config).unwrap();
        rx.start().unwrap();
        rx.direct_copy = false;

        dev.queue_rx_block(vec![0x05, 0xFB, 0x80, 0x7F]);
        let mut out = vec![0u8; 4];
        assert_eq!(rx.recv(&mut [&mut out[..]], 2, 0).unwrap(), 2);
        assert_eq!(out, vec![0x05, 0xFB, 0x80, 0x7F]);
    }

    #[test]
    fn test_set_buffer_size_recreates_only_when_active() {
        let dev = device();
        let mut rx = streamer(&dev, WireFormat::Cs16, 1024);
        rx.set_buffer_size(BufferPlan::explicit(2048)).unwrap();
        assert!(dev.created_buffers().is_empty());
        assert_eq!(rx.mtu(), 2048);

        rx.start().unwrap();
        rx.set_buffer_size(BufferPlan::explicit(2048)).unwrap();
        assert_eq!(dev.created_buffers(), vec![2048]);

        rx.set_buffer_size(BufferPlan::explicit(4096)).unwrap();
        assert_eq!(dev.created_buffers(), vec![2048, 4096]);
        assert_eq!(dev.live_buffers(), 1);
    }

    #[test]
    fn test_drop_cancels_and_destroys() {
        let dev = device();
        let mut rx = streamer(&dev, WireFormat::Cs16, 16);
        rx.start().unwrap();
        drop(rx);
        assert_eq!(dev.cancelled_buffers(), 1);
        assert_eq!(dev.live_buffers(), 0);
    }
}
