//! # Stream Session
//!
//! [`PlutoSession`] owns at most one receive and one transmit streamer and
//! is the surface the streaming framework talks to. Each direction has its
//! own lock, so RX and TX never serialize against each other.
//!
//! Streams are addressed by [`StreamHandle`]s. A handle carries its
//! direction and a generation id; it only resolves while the streamer it
//! was issued for is installed. Closing or replacing a stream makes every
//! earlier handle for that direction stale.
//!
//! ```rust,ignore
//! use r4w_pluto::{PlutoConfig, PlutoSession, SimContext, StreamArgs, Direction};
//!
//! let session = PlutoSession::new(SimContext::new(), PlutoConfig::default());
//! let rx = session.setup_stream(Direction::Rx, "CF32", &[0], &StreamArgs::new())?;
//! session.activate_stream(rx, StreamFlags::empty(), 0, 0)?;
//!
//! let mut samples = vec![0u8; session.stream_mtu(rx) * 8];
//! let n = session.read_stream(rx, &mut [&mut samples[..]], session.stream_mtu(rx), 100_000)?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::PlutoConfig;
use crate::error::{PlutoError, PlutoResult};
use crate::iio::PlutoContext;
use crate::rx::{check_channel_count, RxStreamer};
use crate::tx::TxStreamer;
use crate::types::{
    ArgInfo, Direction, NativeFormat, StatusEvent, StreamArgs, StreamFlags, WireFormat,
    FORMAT_CF32, FORMAT_CS12, FORMAT_CS16, FORMAT_CS8,
};

/// Full scale of RX samples (12 bits, LSB aligned).
pub const RX_NATIVE_FULL_SCALE: f64 = 2048.0;

/// Full scale of TX samples (12 bits, MSB aligned).
pub const TX_NATIVE_FULL_SCALE: f64 = 32768.0;

/// Source of stream ids, shared by every session in the process.
static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque reference to one set-up stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamHandle {
    Rx(u64),
    Tx(u64),
}

impl StreamHandle {
    pub fn direction(&self) -> Direction {
        match self {
            StreamHandle::Rx(_) => Direction::Rx,
            StreamHandle::Tx(_) => Direction::Tx,
        }
    }
}

struct Slot<S> {
    id: u64,
    streamer: S,
}

type RxSlot<C> = Slot<RxStreamer<<C as PlutoContext>::Device>>;
type TxSlot<C> = Slot<TxStreamer<<C as PlutoContext>::Device>>;

/// Owner of the active RX and TX streams of one Pluto.
pub struct PlutoSession<C: PlutoContext> {
    config: PlutoConfig,
    context: C,
    rx: Mutex<Option<RxSlot<C>>>,
    tx: Mutex<Option<TxSlot<C>>>,
}

impl<C: PlutoContext> PlutoSession<C> {
    pub fn new(context: C, config: PlutoConfig) -> Self {
        Self {
            config,
            context,
            rx: Mutex::new(None),
            tx: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PlutoConfig {
        &self.config
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    /// Wire formats offered on every channel.
    pub fn stream_formats(&self, _direction: Direction, _channel: usize) -> Vec<&'static str> {
        vec![FORMAT_CS8, FORMAT_CS12, FORMAT_CS16, FORMAT_CF32]
    }

    /// Native hardware format and its full scale.
    pub fn native_stream_format(&self, direction: Direction, _channel: usize) -> NativeFormat {
        let full_scale = match direction {
            Direction::Rx => RX_NATIVE_FULL_SCALE,
            Direction::Tx => TX_NATIVE_FULL_SCALE,
        };
        NativeFormat {
            format: FORMAT_CS16,
            full_scale,
        }
    }

    /// Stream arguments understood at setup. `bufflen` is not advertised.
    pub fn stream_args_info(&self, _direction: Direction, _channel: usize) -> Vec<ArgInfo> {
        Vec::new()
    }

    /// Create the streamer for `direction`, replacing any existing one.
    ///
    /// `channels` lists the logical channels; each one claims an I/Q pair.
    /// A request the device cannot satisfy leaves the existing stream alone.
    /// If construction fails once the old stream is gone, the LO is powered
    /// back down.
    pub fn setup_stream(
        &self,
        direction: Direction,
        format: &str,
        channels: &[usize],
        args: &StreamArgs,
    ) -> PlutoResult<StreamHandle> {
        let wire = WireFormat::resolve(format, self.config.extended_mode).map_err(|e| {
            tracing::error!("{}", e);
            e
        })?;
        let device = self
            .context
            .device(direction)
            .ok_or_else(|| PlutoError::DeviceNotFound(direction.device_name().to_string()))?;
        check_channel_count(device.as_ref(), channels.len()).map_err(|e| {
            tracing::error!("{}", e);
            e
        })?;
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);

        match direction {
            Direction::Rx => {
                let mut slot = self.rx.lock();
                // the old streamer releases its channels before the new one claims them
                *slot = None;
                let streamer = self.power_up_then(Direction::Rx, || {
                    RxStreamer::new(device, wire, channels, args, &self.config)
                })?;
                *slot = Some(Slot { id, streamer });
                tracing::info!("RX stream {} set up ({})", id, wire);
                Ok(StreamHandle::Rx(id))
            }
            Direction::Tx => {
                let mut slot = self.tx.lock();
                *slot = None;
                let streamer = self.power_up_then(Direction::Tx, || {
                    TxStreamer::new(device, wire, channels, args, &self.config)
                })?;
                *slot = Some(Slot { id, streamer });
                tracing::info!("TX stream {} set up ({})", id, wire);
                Ok(StreamHandle::Tx(id))
            }
        }
    }

    /// Power the LO of `direction` on and build a streamer, powering it down again on failure.
    fn power_up_then<S>(
        &self,
        direction: Direction,
        build: impl FnOnce() -> PlutoResult<S>,
    ) -> PlutoResult<S> {
        self.context.set_lo_powerdown(direction, false)?;
        build().map_err(|e| {
            tracing::error!("{:?} stream setup failed: {}", direction, e);
            if let Err(lo) = self.context.set_lo_powerdown(direction, true) {
                tracing::warn!("Could not power down {:?} LO: {}", direction, lo);
            }
            e
        })
    }

    /// Destroy the stream behind `handle` and power its LO down.
    pub fn close_stream(&self, handle: StreamHandle) -> PlutoResult<()> {
        match handle {
            StreamHandle::Rx(id) => {
                let mut slot = self.rx.lock();
                if !matches!(slot.as_ref(), Some(s) if s.id == id) {
                    return Err(unknown_handle(handle));
                }
                *slot = None;
            }
            StreamHandle::Tx(id) => {
                let mut slot = self.tx.lock();
                if !matches!(slot.as_ref(), Some(s) if s.id == id) {
                    return Err(unknown_handle(handle));
                }
                *slot = None;
            }
        }
        tracing::info!("{:?} stream closed", handle.direction());
        self.context.set_lo_powerdown(handle.direction(), true)
    }

    /// Current block size of the stream, or 0 for an unknown handle.
    pub fn stream_mtu(&self, handle: StreamHandle) -> usize {
        let mtu = match handle {
            StreamHandle::Rx(_) => self.with_rx(handle, |rx| Ok(rx.mtu())),
            StreamHandle::Tx(_) => self.with_tx(handle, |tx| Ok(tx.mtu())),
        };
        mtu.unwrap_or(0)
    }

    /// Start streaming. Only END_BURST is accepted in `flags`.
    ///
    /// TX buffers exist from setup, so activating a TX stream only checks the handle.
    pub fn activate_stream(
        &self,
        handle: StreamHandle,
        flags: StreamFlags,
        _time_ns: i64,
        _num_elems: usize,
    ) -> PlutoResult<()> {
        let unsupported = flags.without(StreamFlags::END_BURST);
        if !unsupported.is_empty() {
            return Err(PlutoError::NotSupported(format!(
                "activate flags {:#x}",
                unsupported.bits()
            )));
        }

        match handle {
            StreamHandle::Rx(_) => self.with_rx(handle, |rx| rx.start()),
            StreamHandle::Tx(_) => self.with_tx(handle, |_| Ok(())),
        }
    }

    /// Stop streaming: RX drops its buffer, TX pushes whatever is staged.
    pub fn deactivate_stream(
        &self,
        handle: StreamHandle,
        _flags: StreamFlags,
        _time_ns: i64,
    ) -> PlutoResult<()> {
        match handle {
            StreamHandle::Rx(_) => self.with_rx(handle, |rx| {
                rx.stop();
                Ok(())
            }),
            StreamHandle::Tx(_) => self.with_tx(handle, |tx| tx.flush().map(|_| ())),
        }
    }

    /// Read up to `num_elems` samples per channel pair.
    pub fn read_stream(
        &self,
        handle: StreamHandle,
        buffs: &mut [&mut [u8]],
        num_elems: usize,
        timeout_us: i64,
    ) -> PlutoResult<usize> {
        self.with_rx(handle, |rx| rx.recv(buffs, num_elems, timeout_us))
    }

    /// Write up to `num_elems` samples per channel pair.
    pub fn write_stream(
        &self,
        handle: StreamHandle,
        buffs: &[&[u8]],
        num_elems: usize,
        timeout_us: i64,
    ) -> PlutoResult<usize> {
        self.with_tx(handle, |tx| tx.send(buffs, num_elems, timeout_us))
    }

    /// Poll for an asynchronous overflow or underflow.
    pub fn read_stream_status(
        &self,
        handle: StreamHandle,
        _timeout_us: i64,
    ) -> PlutoResult<Option<StatusEvent>> {
        // TODO: report Overflow/Underflow from bit 2 of DMA status register 0x80000088
        match handle {
            StreamHandle::Rx(_) => self.with_rx(handle, |_| Ok(None)),
            StreamHandle::Tx(_) => self.with_tx(handle, |_| Ok(None)),
        }
    }

    fn with_rx<R>(
        &self,
        handle: StreamHandle,
        f: impl FnOnce(&mut RxStreamer<C::Device>) -> PlutoResult<R>,
    ) -> PlutoResult<R> {
        let StreamHandle::Rx(id) = handle else {
            return Err(unknown_handle(handle));
        };
        match self.rx.lock().as_mut() {
            Some(slot) if slot.id == id => f(&mut slot.streamer),
            _ => Err(unknown_handle(handle)),
        }
    }

    fn with_tx<R>(
        &self,
        handle: StreamHandle,
        f: impl FnOnce(&mut TxStreamer<C::Device>) -> PlutoResult<R>,
    ) -> PlutoResult<R> {
        let StreamHandle::Tx(id) = handle else {
            return Err(unknown_handle(handle));
        };
        match self.tx.lock().as_mut() {
            Some(slot) if slot.id == id => f(&mut slot.streamer),
            _ => Err(unknown_handle(handle)),
        }
    }
}

fn unknown_handle(handle: StreamHandle) -> PlutoError {
    PlutoError::NotSupported(format!("no live stream for {:?}", handle))
}
