//! Hardware ring-buffer sizing
//!
//! A [`BufferPlan`] is the block size (samples per DMA block) and the number
//! of kernel buffers held in flight. The MTU advertised to the streaming
//! framework always equals the block size.
//!
//! The rate-derived path works on a nominal block of `rate / 8` samples,
//! aligned down to 4096 and capped by [`MAX_BLOCK_SIZE`]; the kernel depth is
//! derived from that nominal block, and the applied block is a quarter of it.
//! The `/8` and `/4` factors are fixed by the AD9361 DMA path.

use crate::error::PlutoResult;
use crate::types::{Direction, StreamArgs};

/// RX block size used until a sizing decision is made.
pub const DEFAULT_RX_BUFFER_SIZE: usize = 1 << 16;

/// Largest nominal block, in samples.
pub const MAX_BLOCK_SIZE: usize = 32_000_000;

/// Largest total of nominal block × kernel buffers, in samples.
pub const MAX_TOTAL_SIZE: usize = 60_000_000;

/// Deepest kernel buffer queue.
pub const MAX_KERNEL_BUFFERS: usize = 64;

/// Kernel buffers used with an explicit `bufflen`.
pub const EXPLICIT_KERNEL_BUFFERS: usize = 8;

/// Nominal TX block; TX sizing does not depend on the sample rate.
pub const TX_NOMINAL_BLOCK: usize = 1024 * 1280;

/// Nominal blocks are aligned down to 2^12 samples.
const BLOCK_ALIGN_SHIFT: u32 = 12;

/// Smallest nominal block after alignment, so tiny rates never yield an empty block.
const MIN_NOMINAL_BLOCK: usize = 1 << BLOCK_ALIGN_SHIFT;

/// Block size and kernel buffer depth for one hardware ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlan {
    /// Samples per block (also the MTU)
    pub block_size: usize,
    /// Kernel buffers in flight
    pub kernel_buffers: usize,
}

impl BufferPlan {
    /// Plan for an explicit block length.
    pub const fn explicit(block_size: usize) -> Self {
        Self {
            block_size,
            kernel_buffers: EXPLICIT_KERNEL_BUFFERS,
        }
    }

    /// Plan derived from the RX sample rate.
    pub fn for_rx_rate(sample_rate: u64) -> Self {
        let nominal = usize::try_from(sample_rate / 8).unwrap_or(usize::MAX);
        Self::from_nominal(nominal)
    }

    /// Plan for TX auto-sizing.
    pub fn for_tx() -> Self {
        Self::from_nominal(TX_NOMINAL_BLOCK)
    }

    /// Choose a plan from the stream arguments, falling back to auto-sizing.
    ///
    /// `sample_rate` is only consulted for RX streams without a valid `bufflen`;
    /// if it cannot be read, `fallback_block` is used with the explicit depth.
    pub fn for_stream<F>(
        direction: Direction,
        args: &StreamArgs,
        fallback_block: usize,
        sample_rate: F,
    ) -> Self
    where
        F: FnOnce() -> PlutoResult<u64>,
    {
        if let Some(len) = args.bufflen() {
            return Self::explicit(len);
        }

        match direction {
            Direction::Rx => match sample_rate() {
                Ok(rate) => Self::for_rx_rate(rate),
                Err(e) => {
                    tracing::warn!(
                        "Could not read RX sampling_frequency ({}), using {} samples",
                        e,
                        fallback_block
                    );
                    Self::explicit(fallback_block)
                }
            },
            Direction::Tx => Self::for_tx(),
        }
    }

    /// MTU advertised for this plan.
    #[inline]
    pub const fn mtu(&self) -> usize {
        self.block_size
    }

    fn from_nominal(nominal: usize) -> Self {
        let aligned = (nominal >> BLOCK_ALIGN_SHIFT) << BLOCK_ALIGN_SHIFT;
        let block = aligned.clamp(MIN_NOMINAL_BLOCK, MAX_BLOCK_SIZE);
        let kernel_buffers = (MAX_TOTAL_SIZE / block).min(MAX_KERNEL_BUFFERS);

        Self {
            block_size: block / 4,
            kernel_buffers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlutoError;

    #[test]
    fn test_explicit_plan() {
        let plan = BufferPlan::explicit(10_000);
        assert_eq!(plan.block_size, 10_000);
        assert_eq!(plan.kernel_buffers, 8);
        assert_eq!(plan.mtu(), 10_000);
    }

    #[test]
    fn test_rx_rate_plan() {
        // 2.4 MS/s -> 300000 -> aligned 299008 -> depth 200 capped at 64
        let plan = BufferPlan::for_rx_rate(2_400_000);
        assert_eq!(plan.block_size, 299_008 / 4);
        assert_eq!(plan.kernel_buffers, 64);

        // 61.44 MS/s -> 7680000 -> aligned 7680000 -> depth 7
        let plan = BufferPlan::for_rx_rate(61_440_000);
        assert_eq!(plan.block_size, 7_680_000 / 4);
        assert_eq!(plan.kernel_buffers, 7);
    }

    #[test]
    fn test_tx_plan_ignores_rate() {
        let plan = BufferPlan::for_tx();
        assert_eq!(plan.block_size, 1_310_720 / 4);
        assert_eq!(plan.kernel_buffers, 45);
    }

    #[test]
    fn test_pathological_rates_stay_in_bounds() {
        for rate in [0u64, 1, 4095, 32_767, 32_768, 1_000_000_000, u64::MAX] {
            let plan = BufferPlan::for_rx_rate(rate);
            assert!(plan.block_size * 4 <= MAX_BLOCK_SIZE, "rate {}", rate);
            assert!(plan.block_size > 0, "rate {}", rate);
            assert!(plan.kernel_buffers >= 1 && plan.kernel_buffers <= MAX_KERNEL_BUFFERS);
        }
        assert_eq!(BufferPlan::for_rx_rate(0).block_size, 1024);
        assert_eq!(BufferPlan::for_rx_rate(u64::MAX).block_size, MAX_BLOCK_SIZE / 4);
        assert_eq!(BufferPlan::for_rx_rate(u64::MAX).kernel_buffers, 1);
    }

    #[test]
    fn test_for_stream_prefers_bufflen() {
        let args = StreamArgs::new().with("bufflen", "2048");
        let plan = BufferPlan::for_stream(Direction::Rx, &args, 4096, || {
            panic!("rate must not be read with explicit bufflen")
        });
        assert_eq!(plan, BufferPlan::explicit(2048));
    }

    #[test]
    fn test_for_stream_invalid_bufflen_falls_back() {
        let args = StreamArgs::new().with("bufflen", "nope");
        let plan = BufferPlan::for_stream(Direction::Rx, &args, 4096, || Ok(2_400_000));
        assert_eq!(plan, BufferPlan::for_rx_rate(2_400_000));

        let plan = BufferPlan::for_stream(Direction::Tx, &args, 4096, || Ok(2_400_000));
        assert_eq!(plan, BufferPlan::for_tx());
    }

    #[test]
    fn test_for_stream_unreadable_rate() {
        let plan = BufferPlan::for_stream(Direction::Rx, &StreamArgs::new(), 1 << 16, || {
            Err(PlutoError::Hardware { op: "attr_read", code: -2 })
        });
        assert_eq!(plan, BufferPlan::explicit(1 << 16));
    }
}
