//! # Transmit Streamer
//!
//! Stages caller samples into the TX hardware block of
//! `cf-ad9361-dds-core-lpc` and pushes the block once it is full:
//!
//! ```text
//!   send(n) ──► [ block: items_in_buffer staged | free ] ──full──► push
//!   flush   ──► [ staged | zero padding ]                ─────────► push
//! ```
//!
//! `send` never waits for room: it accepts at most what still fits in the
//! current block and reports how many samples it took.

use std::sync::Arc;

use crate::config::PlutoConfig;
use crate::convert::{self, decode_tx};
use crate::error::{PlutoError, PlutoResult};
use crate::iio::{IioBuffer, IioDevice};
use crate::rx::{caller_capacity, claim_channels};
use crate::sizing::BufferPlan;
use crate::types::{StreamArgs, WireFormat};

/// Transmit side of one Pluto stream.
pub struct TxStreamer<D: IioDevice> {
    device: Arc<D>,
    channels: Vec<usize>,
    format: WireFormat,
    plan: BufferPlan,
    buffer: Option<D::Buffer>,
    items_in_buffer: usize,
    direct_copy: bool,
    force_direct_copy: bool,
}

impl<D: IioDevice> TxStreamer<D> {
    /// Claim the channels and create the TX ring buffer.
    pub fn new(
        device: Arc<D>,
        format: WireFormat,
        channels: &[usize],
        args: &StreamArgs,
        config: &PlutoConfig,
    ) -> PlutoResult<Self> {
        let channels = claim_channels(device.as_ref(), channels.len(), format)?;
        tracing::info!("TX using format {}", format);

        let plan = args
            .bufflen()
            .map(BufferPlan::explicit)
            .unwrap_or_else(BufferPlan::for_tx);

        let mut tx = Self {
            device,
            channels,
            format,
            plan,
            buffer: None,
            items_in_buffer: 0,
            direct_copy: false,
            force_direct_copy: config.force_direct_copy,
        };
        tx.create_buffer()?;
        Ok(tx)
    }

    fn create_buffer(&mut self) -> PlutoResult<()> {
        self.destroy_buffer();

        if let Err(e) = self.device.set_kernel_buffers_count(self.plan.kernel_buffers) {
            tracing::warn!(
                "Could not set {} TX kernel buffers: {}",
                self.plan.kernel_buffers,
                e
            );
        }

        let buffer = self
            .device
            .create_buffer(self.plan.block_size, false)
            .map_err(|e| {
                tracing::error!("Unable to create TX buffer: {}", e);
                PlutoError::BufferCreation {
                    device: self.device.name().to_string(),
                    samples: self.plan.block_size,
                    reason: e.to_string(),
                }
            })?;

        self.direct_copy = (self.force_direct_copy && self.channels.len() == 2)
            || convert::is_direct_copy_eligible(self.device.as_ref(), &buffer, &self.channels, self.format);
        tracing::info!(
            "TX buffer: {} samples x {} kernel buffers, direct copy: {}",
            self.plan.block_size,
            self.plan.kernel_buffers,
            self.direct_copy
        );

        self.buffer = Some(buffer);
        Ok(())
    }

    fn destroy_buffer(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.cancel();
            drop(buffer);
            tracing::debug!("TX buffer destroyed");
        }
        self.items_in_buffer = 0;
    }

    /// Stage up to `num_elems` samples per channel pair from `buffs`.
    ///
    /// Accepts no more than the room left in the current block. A block that
    /// becomes full is pushed before returning. `timeout_us` is advisory.
    pub fn send(&mut self, buffs: &[&[u8]], num_elems: usize, _timeout_us: i64) -> PlutoResult<usize> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Ok(0);
        };

        let pairs = self.channels.len() / 2;
        let width = self.format.bytes_per_sample();
        let capacity = caller_capacity(buffs, pairs, width)?;
        let room = self.plan.block_size - self.items_in_buffer;
        let items = room.min(num_elems).min(capacity);

        let offset = self.items_in_buffer * buffer.step();
        if self.direct_copy {
            convert::tx_direct(self.format, buffs[0], items, &mut buffer.data_mut()[offset..]);
        } else {
            send_generic(
                self.device.as_ref(),
                buffer,
                &self.channels,
                self.format,
                offset,
                items,
                buffs,
            );
        }
        self.items_in_buffer += items;

        if self.items_in_buffer == self.plan.block_size {
            self.items_in_buffer = 0;
            if items != num_elems {
                tracing::warn!(
                    "TX block not aligned: {} of {} samples admitted",
                    items,
                    num_elems
                );
            }
            if let Err(e) = buffer.push() {
                tracing::warn!(
                    "TX push failed, {} staged samples dropped: {}",
                    self.plan.block_size,
                    e
                );
                return Err(PlutoError::Timeout);
            }
        }
        Ok(items)
    }

    /// Push a partially filled block, zero-padding the unused tail.
    ///
    /// Returns the samples pushed (the whole block), or 0 when nothing is staged.
    pub fn flush(&mut self) -> PlutoResult<usize> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Ok(0);
        };
        if self.items_in_buffer == 0 {
            return Ok(0);
        }

        let step = buffer.step();
        let staged = self.items_in_buffer;
        buffer.data_mut()[staged * step..].fill(0);
        self.items_in_buffer = 0;

        let bytes = buffer.push().map_err(|e| {
            tracing::warn!("TX flush push failed, {} staged samples dropped: {}", staged, e);
            PlutoError::Timeout
        })?;
        tracing::debug!("TX flushed {} staged samples", staged);
        Ok(bytes / step)
    }

    /// Apply a new block size and kernel depth, recreating the buffer if needed.
    ///
    /// Staged samples are discarded when the buffer is recreated.
    pub fn set_buffer_size(&mut self, plan: BufferPlan) -> PlutoResult<()> {
        if self.buffer.is_none() || plan != self.plan {
            self.plan = plan;
            self.create_buffer()?;
        }
        tracing::info!("TX MTU: {}", self.plan.mtu());
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

    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    /// Samples staged in the current block and not yet pushed.
    pub fn items_in_buffer(&self) -> usize {
        self.items_in_buffer
    }

    pub fn is_direct_copy(&self) -> bool {
        self.direct_copy
    }
}

impl<D: IioDevice> Drop for TxStreamer<D> {
    fn drop(&mut self) {
        self.destroy_buffer();
        for &channel in &self.channels {
            self.device.disable_channel(channel);
        }
    }
}

/// Per-channel encode through the device's native-to-raw conversion.
fn send_generic<D: IioDevice>(
    device: &D,
    buffer: &mut D::Buffer,
    channels: &[usize],
    format: WireFormat,
    offset: usize,
    items: usize,
    buffs: &[&[u8]],
) {
    let step = buffer.step();
    let width = format.bytes_per_sample();
    let firsts: Vec<(usize, usize)> = channels
        .chunks_exact(2)
        .map(|pair| (buffer.first(pair[0]) + offset, buffer.first(pair[1]) + offset))
        .collect();
    let data = buffer.data_mut();

    for ((pair, (base_i, base_q)), src) in channels.chunks_exact(2).zip(firsts).zip(buffs) {
        let (ch_i, ch_q) = (pair[0], pair[1]);

        for (j, sample) in src.chunks_exact(width).take(items).enumerate() {
            let (i, q) = decode_tx(format, sample);
            let at_i = base_i + j * step;
            if format.is_extended() {
                // packed byte pair, written without the channel's word conversion
                data[at_i] = i as i8 as u8;
                data[at_i + 1] = q as i8 as u8;
            } else {
                let at_q = base_q + j * step;
                device.convert_inverse(ch_i, i, &mut data[at_i..at_i + 2]);
                device.convert_inverse(ch_q, q, &mut data[at_q..at_q + 2]);
            }
        }
    }
}
