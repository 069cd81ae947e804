//! Sample conversion between the AD9361 native layout and the wire formats.
//!
//! # Native layouts
//!
//! | Transport | Bytes per I/Q pair | Component                                   |
//! |-----------|--------------------|---------------------------------------------|
//! | Standard  | 4                  | i16, 12 significant bits (RX LSB aligned, TX MSB aligned) |
//! | Extended  | 2                  | raw i8                                      |
//!
//! # RX scaling
//!
//! | Format | Standard                 | Extended          |
//! |--------|--------------------------|-------------------|
//! | CS16   | copy                     | `v << 8`          |
//! | CF32   | `v / 2048.0`             | `v / 128.0`       |
//! | CS12   | 12-bit pack              | 12-bit pack       |
//! | CS8    | `v >> 4`                 | copy              |
//!
//! CS12 packs one I/Q pair into three bytes:
//! `byte0 = i[7:0]`, `byte1 = q[3:0] << 4 | i[11:8]`, `byte2 = q[11:4]`.
//!
//! All multi-byte values use host byte order, as SoapySDR buffers do.

use byteorder::{ByteOrder, NativeEndian};

use crate::iio::{IioBuffer, IioDevice};
use crate::types::WireFormat;

/// RX full scale of the standard transport (12 bits, LSB aligned).
pub const RX_FULL_SCALE: f32 = 2048.0;

/// TX full scale of the standard transport (12 bits, MSB aligned).
pub const TX_FULL_SCALE: f32 = 32768.0;

/// Full scale of the extended 8-bit transport.
pub const EXT_FULL_SCALE: f32 = 128.0;

/// Pack a 12-bit I/Q pair into three bytes.
#[inline]
pub fn pack_cs12(i: i16, q: i16, out: &mut [u8]) {
    out[0] = i as u8;
    out[1] = ((q << 4) | ((i >> 8) & 0x0f)) as u8;
    out[2] = (q >> 4) as u8;
}

/// Unpack three CS12 bytes into sign-extended 12-bit values.
#[inline]
pub fn unpack_cs12(bytes: &[u8]) -> (i16, i16) {
    let i = u16::from(bytes[0]) | (u16::from(bytes[1] & 0x0f) << 8);
    let q = u16::from(bytes[1] >> 4) | (u16::from(bytes[2]) << 4);
    (sign_extend_12(i), sign_extend_12(q))
}

#[inline]
fn sign_extend_12(raw: u16) -> i16 {
    ((raw << 4) as i16) >> 4
}

/// Write one received I/Q pair (`i`, `q` in native units) in `format`.
///
/// Extended formats expect the raw 8-bit values.
#[inline]
pub fn encode_rx(format: WireFormat, i: i16, q: i16, out: &mut [u8]) {
    match format {
        WireFormat::Cs16 => {
            NativeEndian::write_i16(&mut out[0..2], i);
            NativeEndian::write_i16(&mut out[2..4], q);
        }
        WireFormat::Cf32 => {
            NativeEndian::write_f32(&mut out[0..4], f32::from(i) / RX_FULL_SCALE);
            NativeEndian::write_f32(&mut out[4..8], f32::from(q) / RX_FULL_SCALE);
        }
        WireFormat::Cs12 | WireFormat::Cs12Ext => pack_cs12(i, q, out),
        WireFormat::Cs8 => {
            out[0] = (i >> 4) as i8 as u8;
            out[1] = (q >> 4) as i8 as u8;
        }
        WireFormat::Cs16Ext => {
            NativeEndian::write_i16(&mut out[0..2], i16::from(i as i8) << 8);
            NativeEndian::write_i16(&mut out[2..4], i16::from(q as i8) << 8);
        }
        WireFormat::Cf32Ext => {
            NativeEndian::write_f32(&mut out[0..4], f32::from(i as i8) / EXT_FULL_SCALE);
            NativeEndian::write_f32(&mut out[4..8], f32::from(q as i8) / EXT_FULL_SCALE);
        }
        WireFormat::Cs8Ext => {
            out[0] = i as u8;
            out[1] = q as u8;
        }
    }
}

/// Convert `items` pairs straight out of a single-channel-pair block.
///
/// `src` starts at the read position in the block; `dst` must hold
/// `items * format.bytes_per_sample()` bytes.
pub fn rx_direct(format: WireFormat, src: &[u8], items: usize, dst: &mut [u8]) {
    let width = format.bytes_per_sample();
    let dst = &mut dst[..items * width];

    match format {
        WireFormat::Cs16 | WireFormat::Cs8Ext => {
            let len = dst.len();
            dst.copy_from_slice(&src[..len]);
        }
        WireFormat::Cs12Ext => {
            // Reads 4-byte standard pairs although the extended block has a
            // 2-byte step; kept bit-compatible. Bytes past the block read as 0.
            for (k, out) in dst.chunks_exact_mut(width).enumerate() {
                let i = word_or_zero(src, 4 * k);
                let q = word_or_zero(src, 4 * k + 2);
                pack_cs12(i, q, out);
            }
        }
        _ if format.is_extended() => {
            for (pair, out) in src.chunks_exact(2).zip(dst.chunks_exact_mut(width)) {
                encode_rx(format, i16::from(pair[0] as i8), i16::from(pair[1] as i8), out);
            }
        }
        _ => {
            for (pair, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(width)) {
                let i = NativeEndian::read_i16(&pair[0..2]);
                let q = NativeEndian::read_i16(&pair[2..4]);
                encode_rx(format, i, q, out);
            }
        }
    }
}

#[inline]
fn word_or_zero(src: &[u8], offset: usize) -> i16 {
    src.get(offset..offset + 2)
        .map(NativeEndian::read_i16)
        .unwrap_or(0)
}

/// Read one caller I/Q pair in `format` and return it in native TX units.
///
/// Standard formats yield 12-bit MSB-aligned i16 values; extended formats
/// yield the raw 8-bit values.
#[inline]
pub fn decode_tx(format: WireFormat, sample: &[u8]) -> (i16, i16) {
    match format {
        WireFormat::Cs16 => (
            NativeEndian::read_i16(&sample[0..2]),
            NativeEndian::read_i16(&sample[2..4]),
        ),
        WireFormat::Cf32 => (
            scale_f32(NativeEndian::read_f32(&sample[0..4]), TX_FULL_SCALE),
            scale_f32(NativeEndian::read_f32(&sample[4..8]), TX_FULL_SCALE),
        ),
        WireFormat::Cs12 => {
            let (i, q) = unpack_cs12(sample);
            (i << 4, q << 4)
        }
        WireFormat::Cs8 => (
            i16::from(sample[0] as i8) << 8,
            i16::from(sample[1] as i8) << 8,
        ),
        WireFormat::Cs16Ext => (
            NativeEndian::read_i16(&sample[0..2]) >> 8,
            NativeEndian::read_i16(&sample[2..4]) >> 8,
        ),
        WireFormat::Cf32Ext => (
            scale_f32(NativeEndian::read_f32(&sample[0..4]), EXT_FULL_SCALE),
            scale_f32(NativeEndian::read_f32(&sample[4..8]), EXT_FULL_SCALE),
        ),
        WireFormat::Cs12Ext => {
            let (i, q) = unpack_cs12(sample);
            (i >> 4, q >> 4)
        }
        WireFormat::Cs8Ext => (i16::from(sample[0] as i8), i16::from(sample[1] as i8)),
    }
}

/// Scale a normalized float to `full_scale`, saturating at the integer range.
#[inline]
fn scale_f32(x: f32, full_scale: f32) -> i16 {
    let max = full_scale - 1.0;
    (x * max).round().clamp(-full_scale, max) as i16
}

/// Write `items` caller pairs from `src` into a single-channel-pair block.
///
/// `dst` starts at the staging position in the block.
pub fn tx_direct(format: WireFormat, src: &[u8], items: usize, dst: &mut [u8]) {
    let width = format.bytes_per_sample();
    let src = &src[..items * width];

    match format {
        WireFormat::Cs16 | WireFormat::Cs8Ext => {
            dst[..src.len()].copy_from_slice(src);
        }
        _ if format.is_extended() => {
            for (sample, out) in src.chunks_exact(width).zip(dst.chunks_exact_mut(2)) {
                let (i, q) = decode_tx(format, sample);
                out[0] = i as i8 as u8;
                out[1] = q as i8 as u8;
            }
        }
        _ => {
            for (sample, out) in src.chunks_exact(width).zip(dst.chunks_exact_mut(4)) {
                let (i, q) = decode_tx(format, sample);
                NativeEndian::write_i16(&mut out[0..2], i);
                NativeEndian::write_i16(&mut out[2..4], q);
            }
        }
    }
}

/// True if `buffer` can be converted with [`rx_direct`] / [`tx_direct`].
///
/// Requires a single channel pair, a block step equal to the native pair
/// width, channel 0 at the start of the block and a device whose raw
/// layout is the host's native i16.
pub fn is_direct_copy_eligible<D: IioDevice>(
    device: &D,
    buffer: &D::Buffer,
    channels: &[usize],
    format: WireFormat,
) -> bool {
    if channels.len() != 2 || buffer.step() != format.native_step() {
        return false;
    }
    if buffer.first(channels[0]) != 0 {
        return false;
    }

    let probe: i16 = 0x1234;
    let mut raw = [0u8; 2];
    NativeEndian::write_i16(&mut raw, probe);
    device.convert(channels[0], &raw) == probe
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(values: &[i16]) -> Vec<u8> {
        let mut bytes = vec![0u8; values.len() * 2];
        NativeEndian::write_i16_into(values, &mut bytes);
        bytes
    }

    fn floats(bytes: &[u8]) -> Vec<f32> {
        bytes.chunks_exact(4).map(NativeEndian::read_f32).collect()
    }

    #[cfg(feature = "sim")]
    #[test]
    fn test_direct_copy_eligibility() {
        let dev = crate::iio::SimDevice::new("sim", 4);
        dev.enable_channel(0);
        dev.enable_channel(1);
        let buffer = dev.create_buffer(8, false).unwrap();
        assert!(is_direct_copy_eligible(&dev, &buffer, &[0, 1], WireFormat::Cs16));
        // extended transport expects a 2-byte step
        assert!(!is_direct_copy_eligible(&dev, &buffer, &[0, 1], WireFormat::Cs16Ext));
        assert!(!is_direct_copy_eligible(&dev, &buffer, &[0, 1, 2, 3], WireFormat::Cs16));

        dev.set_byte_swapped(true);
        assert!(!is_direct_copy_eligible(&dev, &buffer, &[0, 1], WireFormat::Cs16));
    }

    #[test]
    fn test_cf32_full_scale() {
        let src = words(&[2048, -2048, 1024, 0]);
        let mut dst = vec![0u8; 16];
        rx_direct(WireFormat::Cf32, &src, 2, &mut dst);
        assert_eq!(floats(&dst), vec![1.0, -1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_cs12_layout() {
        let mut out = [0u8; 3];
        pack_cs12(0x0AB, 0x0CD, &mut out);
        assert_eq!(out, [0xAB, 0xD0, 0x0C]);

        pack_cs12(0x5AB, 0x7CD, &mut out);
        assert_eq!(out, [0xAB, 0xD5, 0x7C]);
    }

    #[test]
    fn test_cs12_negative_values() {
        let mut out = [0u8; 3];
        pack_cs12(-1, -2048, &mut out);
        assert_eq!(out, [0xFF, 0x0F, 0x80]);
        assert_eq!(unpack_cs12(&out), (-1, -2048));
    }

    #[test]
    fn test_cs12_unpack_inverts_pack() {
        for (i, q) in [(0, 0), (2047, -2048), (-1234, 777), (0x0AB, 0x0CD)] {
            let mut out = [0u8; 3];
            pack_cs12(i, q, &mut out);
            assert_eq!(unpack_cs12(&out), (i, q));
        }
    }

    #[test]
    fn test_cs8_shifts_arithmetically() {
        let src = words(&[2047, -2048, -17, 16]);
        let mut dst = vec![0u8; 4];
        rx_direct(WireFormat::Cs8, &src, 2, &mut dst);
        assert_eq!(dst.iter().map(|&b| b as i8).collect::<Vec<_>>(), vec![127, -128, -2, 1]);
    }

    #[test]
    fn test_cs16_is_copy() {
        let src = words(&[100, -200, 300, -400, 9, 9]);
        let mut dst = vec![0u8; 8];
        rx_direct(WireFormat::Cs16, &src, 2, &mut dst);
        assert_eq!(dst, src[..8]);
    }

    #[test]
    fn test_extended_rx_formats() {
        let src = vec![0x80u8, 0x7F, 0x01, 0xFF];

        let mut cf32 = vec![0u8; 16];
        rx_direct(WireFormat::Cf32Ext, &src, 2, &mut cf32);
        let values = floats(&cf32);
        assert_eq!(values[0], -1.0);
        assert!((values[1] - 127.0 / 128.0).abs() < 1e-6);
        assert!((values[3] + 1.0 / 128.0).abs() < 1e-6);

        let mut cs16 = vec![0u8; 8];
        rx_direct(WireFormat::Cs16Ext, &src, 2, &mut cs16);
        let mut expected = [0i16; 4];
        NativeEndian::read_i16_into(&cs16, &mut expected);
        assert_eq!(expected, [-32768, 0x7F00, 0x0100, -256]);

        let mut cs8 = vec![0u8; 4];
        rx_direct(WireFormat::Cs8Ext, &src, 2, &mut cs8);
        assert_eq!(cs8, src);
    }

    #[test]
    fn test_cs12_extended_reads_standard_pairs() {
        let src = words(&[0x0AB, 0x0CD]);
        let mut dst = vec![0u8; 6];
        rx_direct(WireFormat::Cs12Ext, &src, 2, &mut dst);
        assert_eq!(&dst[..3], &[0xAB, 0xD0, 0x0C]);
        // second pair lies past the source and reads as zero
        assert_eq!(&dst[3..], &[0, 0, 0]);
    }

    #[test]
    fn test_tx_cs16_interleaves() {
        let src = words(&[1, 2, 3, 4]);
        let mut dst = vec![0u8; 8];
        tx_direct(WireFormat::Cs16, &src, 2, &mut dst);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_tx_cs16_extended_narrows() {
        let src = words(&[0x7F00, -32768, 0x0100, -1]);
        let mut dst = vec![0u8; 4];
        tx_direct(WireFormat::Cs16Ext, &src, 2, &mut dst);
        assert_eq!(dst.iter().map(|&b| b as i8).collect::<Vec<_>>(), vec![127, -128, 1, -1]);
    }

    #[test]
    fn test_tx_cf32_saturates() {
        let mut sample = [0u8; 8];
        NativeEndian::write_f32(&mut sample[0..4], 1.5);
        NativeEndian::write_f32(&mut sample[4..8], -1.0);
        assert_eq!(decode_tx(WireFormat::Cf32, &sample), (32767, -32767));

        NativeEndian::write_f32(&mut sample[0..4], 0.5);
        NativeEndian::write_f32(&mut sample[4..8], -2.0);
        assert_eq!(decode_tx(WireFormat::Cf32Ext, &sample), (64, -128));
    }

    #[test]
    fn test_tx_cs8_and_cs12_msb_align() {
        assert_eq!(decode_tx(WireFormat::Cs8, &[0x7F, 0x80]), (0x7F00, -32768));

        let mut packed = [0u8; 3];
        pack_cs12(2047, -2048, &mut packed);
        assert_eq!(decode_tx(WireFormat::Cs12, &packed), (0x7FF0, -32768));
        assert_eq!(decode_tx(WireFormat::Cs12Ext, &packed), (127, -128));
    }
}
