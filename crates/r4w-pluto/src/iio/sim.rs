//! Simulated IIO backend for development and testing
//!
//! Stands in for the AD9361 streaming devices so the streamers can be
//! exercised without hardware:
//! - RX blocks are scripted with [`SimDevice::queue_rx_block`]
//! - TX pushes are captured and can be inspected with [`SimDevice::pushes`]
//! - refill, push and allocation failures can be injected
//!
//! Every channel is 16 bits wide, so a block's step is two bytes per
//! enabled channel.

use std::collections::VecDeque;
use std::sync::Arc;

use byteorder::{ByteOrder, NativeEndian};
use parking_lot::Mutex;

use super::{IioBuffer, IioDevice, PlutoContext};
use crate::error::{PlutoError, PlutoResult};
use crate::types::Direction;

/// errno returned by the simulated refill when no block is queued.
const ETIMEDOUT: i32 = 110;
const ENOMEM: i32 = 12;
const ENOENT: i32 = 2;

/// Bytes per simulated channel sample.
const CHANNEL_BYTES: usize = 2;

#[derive(Default)]
struct SimState {
    enabled: Vec<bool>,
    kernel_buffers: Option<usize>,
    created: Vec<usize>,
    destroyed: usize,
    cancelled: usize,
    rx_blocks: VecDeque<Vec<u8>>,
    pushes: Vec<Vec<u8>>,
    fail_refill: bool,
    fail_push: bool,
    fail_create: bool,
    sample_rate: i64,
    byte_swapped: bool,
}

/// Simulated streaming device.
pub struct SimDevice {
    name: String,
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    /// Create a device with `channels` 16-bit scan channels.
    pub fn new(name: &str, channels: usize) -> Self {
        let state = SimState {
            enabled: vec![false; channels],
            sample_rate: 2_400_000,
            ..SimState::default()
        };
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Queue raw bytes returned by the next refill.
    pub fn queue_rx_block(&self, block: Vec<u8>) {
        self.state.lock().rx_blocks.push_back(block);
    }

    /// Queue a block of native-endian 16-bit words.
    pub fn queue_rx_words(&self, words: &[i16]) {
        let mut block = vec![0u8; words.len() * CHANNEL_BYTES];
        NativeEndian::write_i16_into(words, &mut block);
        self.queue_rx_block(block);
    }

    /// Make the next refill fail.
    pub fn fail_next_refill(&self) {
        self.state.lock().fail_refill = true;
    }

    /// Make the next push fail.
    pub fn fail_next_push(&self) {
        self.state.lock().fail_push = true;
    }

    /// Make buffer creation fail until cleared.
    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    pub fn set_sample_rate(&self, rate: i64) {
        self.state.lock().sample_rate = rate;
    }

    /// Store samples byte-swapped relative to the host.
    pub fn set_byte_swapped(&self, swapped: bool) {
        self.state.lock().byte_swapped = swapped;
    }

    /// Contents of every pushed block, oldest first.
    pub fn pushes(&self) -> Vec<Vec<u8>> {
        self.state.lock().pushes.clone()
    }

    pub fn kernel_buffers(&self) -> Option<usize> {
        self.state.lock().kernel_buffers
    }

    /// Sizes (in samples) of every buffer created so far.
    pub fn created_buffers(&self) -> Vec<usize> {
        self.state.lock().created.clone()
    }

    pub fn destroyed_buffers(&self) -> usize {
        self.state.lock().destroyed
    }

    pub fn cancelled_buffers(&self) -> usize {
        self.state.lock().cancelled
    }

    /// Buffers created and not yet destroyed.
    pub fn live_buffers(&self) -> usize {
        let state = self.state.lock();
        state.created.len() - state.destroyed
    }

    /// Indices of currently enabled channels.
    pub fn enabled_channels(&self) -> Vec<usize> {
        let state = self.state.lock();
        state
            .enabled
            .iter()
            .enumerate()
            .filter_map(|(i, &on)| on.then_some(i))
            .collect()
    }
}

impl IioDevice for SimDevice {
    type Buffer = SimBuffer;

    fn name(&self) -> &str {
        &self.name
    }

    fn channels_count(&self) -> usize {
        self.state.lock().enabled.len()
    }

    fn enable_channel(&self, index: usize) {
        if let Some(on) = self.state.lock().enabled.get_mut(index) {
            *on = true;
        }
    }

    fn disable_channel(&self, index: usize) {
        if let Some(on) = self.state.lock().enabled.get_mut(index) {
            *on = false;
        }
    }

    fn set_kernel_buffers_count(&self, count: usize) -> PlutoResult<()> {
        self.state.lock().kernel_buffers = Some(count);
        Ok(())
    }

    fn create_buffer(&self, samples: usize, _cyclic: bool) -> PlutoResult<SimBuffer> {
        let mut state = self.state.lock();
        let enabled: Vec<usize> = state
            .enabled
            .iter()
            .enumerate()
            .filter_map(|(i, &on)| on.then_some(i))
            .collect();

        if state.fail_create || enabled.is_empty() || samples == 0 {
            return Err(PlutoError::Hardware {
                op: "create_buffer",
                code: -ENOMEM,
            });
        }

        state.created.push(samples);
        let step = enabled.len() * CHANNEL_BYTES;

        Ok(SimBuffer {
            data: vec![0u8; samples * step],
            step,
            enabled,
            state: Arc::clone(&self.state),
        })
    }

    fn channel_attr_i64(&self, channel: &str, attr: &str) -> PlutoResult<i64> {
        match (channel, attr) {
            ("voltage0", "sampling_frequency") => Ok(self.state.lock().sample_rate),
            _ => Err(PlutoError::Hardware {
                op: "attr_read",
                code: -ENOENT,
            }),
        }
    }

    fn convert(&self, _channel: usize, raw: &[u8]) -> i16 {
        let value = NativeEndian::read_i16(raw);
        if self.state.lock().byte_swapped {
            value.swap_bytes()
        } else {
            value
        }
    }

    fn convert_inverse(&self, _channel: usize, value: i16, raw: &mut [u8]) {
        let value = if self.state.lock().byte_swapped {
            value.swap_bytes()
        } else {
            value
        };
        NativeEndian::write_i16(raw, value);
    }
}

/// Simulated DMA block.
pub struct SimBuffer {
    data: Vec<u8>,
    step: usize,
    enabled: Vec<usize>,
    state: Arc<Mutex<SimState>>,
}

impl IioBuffer for SimBuffer {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn step(&self) -> usize {
        self.step
    }

    fn first(&self, channel: usize) -> usize {
        self.enabled
            .iter()
            .position(|&c| c == channel)
            .map(|pos| pos * CHANNEL_BYTES)
            .unwrap_or(0)
    }

    fn refill(&mut self) -> PlutoResult<usize> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_refill) {
            return Err(PlutoError::Hardware {
                op: "refill",
                code: -ETIMEDOUT,
            });
        }

        let block = state.rx_blocks.pop_front().ok_or(PlutoError::Hardware {
            op: "refill",
            code: -ETIMEDOUT,
        })?;

        let len = block.len().min(self.data.len());
        self.data[..len].copy_from_slice(&block[..len]);
        self.data[len..].fill(0);
        Ok(len)
    }

    fn push(&mut self) -> PlutoResult<usize> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_push) {
            return Err(PlutoError::Hardware {
                op: "push",
                code: -ETIMEDOUT,
            });
        }
        state.pushes.push(self.data.clone());
        Ok(self.data.len())
    }

    fn cancel(&mut self) {
        self.state.lock().cancelled += 1;
    }
}

impl Drop for SimBuffer {
    fn drop(&mut self) {
        self.state.lock().destroyed += 1;
    }
}

/// Simulated Pluto context with one RX and one TX streaming device.
pub struct SimContext {
    rx: Option<Arc<SimDevice>>,
    tx: Option<Arc<SimDevice>>,
    lo_powerdown: Mutex<[bool; 2]>,
}

impl SimContext {
    /// Context modeled on a 2R2T Pluto: four scan channels per direction.
    pub fn new() -> Self {
        Self::with_channels(4)
    }

    pub fn with_channels(channels: usize) -> Self {
        Self {
            rx: Some(Arc::new(SimDevice::new(Direction::Rx.device_name(), channels))),
            tx: Some(Arc::new(SimDevice::new(Direction::Tx.device_name(), channels))),
            lo_powerdown: Mutex::new([true, true]),
        }
    }

    /// Context without streaming devices (e.g. wrong firmware).
    pub fn empty() -> Self {
        Self {
            rx: None,
            tx: None,
            lo_powerdown: Mutex::new([true, true]),
        }
    }

    /// True if the LO feeding `direction` is powered.
    pub fn lo_powered(&self, direction: Direction) -> bool {
        !self.lo_powerdown.lock()[lo_index(direction)]
    }
}

impl Default for SimContext {
    fn default() -> Self {
        Self::new()
    }
}

fn lo_index(direction: Direction) -> usize {
    match direction {
        Direction::Rx => 0,
        Direction::Tx => 1,
    }
}

impl PlutoContext for SimContext {
    type Device = SimDevice;

    fn device(&self, direction: Direction) -> Option<Arc<SimDevice>> {
        match direction {
            Direction::Rx => self.rx.clone(),
            Direction::Tx => self.tx.clone(),
        }
    }

    fn set_lo_powerdown(&self, direction: Direction, powerdown: bool) -> PlutoResult<()> {
        self.lo_powerdown.lock()[lo_index(direction)] = powerdown;
        Ok(())
    }
}
