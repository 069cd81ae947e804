//! # libiio backend
//!
//! Talks to the Pluto's AD9361 through libiio, loaded at runtime with
//! libloading so the crate builds and runs without libiio installed.
//!
//! ## Devices
//!
//! - `cf-ad9361-lpc`: RX streaming device (input channels)
//! - `cf-ad9361-dds-core-lpc`: TX streaming device (output channels)
//! - `ad9361-phy`: transceiver control, used here only for LO power
//!
//! ## Requirements
//!
//! - **Linux**: `sudo apt install libiio0` (or `libiio-dev`)
//! - **macOS**: `brew install libiio`
//! - **Windows**: libiio installer from Analog Devices
//!
//! Block contents are exposed in place: `iio_buffer_start` ..
//! `iio_buffer_end` becomes the slice returned by [`IioBuffer::data`].

use std::ffi::{c_char, c_int, c_longlong, c_uint, c_void, CString};
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use libloading::{Library, Symbol};

use super::{IioBuffer, IioDevice, PlutoContext};
use crate::error::{PlutoError, PlutoResult};
use crate::types::Direction;

type Ctx = *mut c_void;
type Dev = *mut c_void;
type Chn = *mut c_void;
type Buf = *mut c_void;

/// Transceiver control device.
const PHY_DEVICE: &str = "ad9361-phy";

const ENOENT: i32 = 2;
const ENOMEM: i32 = 12;

/// Loaded libiio and the entry points used by the streamers.
struct IioLib {
    _lib: Library,
    create_default_context: Symbol<'static, unsafe extern "C" fn() -> Ctx>,
    create_context_from_uri: Symbol<'static, unsafe extern "C" fn(*const c_char) -> Ctx>,
    context_destroy: Symbol<'static, unsafe extern "C" fn(Ctx)>,
    find_device: Symbol<'static, unsafe extern "C" fn(Ctx, *const c_char) -> Dev>,
    channels_count: Symbol<'static, unsafe extern "C" fn(Dev) -> c_uint>,
    get_channel: Symbol<'static, unsafe extern "C" fn(Dev, c_uint) -> Chn>,
    find_channel: Symbol<'static, unsafe extern "C" fn(Dev, *const c_char, bool) -> Chn>,
    channel_enable: Symbol<'static, unsafe extern "C" fn(Chn)>,
    channel_disable: Symbol<'static, unsafe extern "C" fn(Chn)>,
    set_kernel_buffers_count: Symbol<'static, unsafe extern "C" fn(Dev, c_uint) -> c_int>,
    create_buffer: Symbol<'static, unsafe extern "C" fn(Dev, usize, bool) -> Buf>,
    buffer_destroy: Symbol<'static, unsafe extern "C" fn(Buf)>,
    buffer_cancel: Symbol<'static, unsafe extern "C" fn(Buf)>,
    buffer_refill: Symbol<'static, unsafe extern "C" fn(Buf) -> isize>,
    buffer_push: Symbol<'static, unsafe extern "C" fn(Buf) -> isize>,
    buffer_start: Symbol<'static, unsafe extern "C" fn(Buf) -> *mut c_void>,
    buffer_first: Symbol<'static, unsafe extern "C" fn(Buf, Chn) -> *mut c_void>,
    buffer_end: Symbol<'static, unsafe extern "C" fn(Buf) -> *mut c_void>,
    buffer_step: Symbol<'static, unsafe extern "C" fn(Buf) -> isize>,
    attr_read_longlong:
        Symbol<'static, unsafe extern "C" fn(Chn, *const c_char, *mut c_longlong) -> c_int>,
    attr_write_bool: Symbol<'static, unsafe extern "C" fn(Chn, *const c_char, bool) -> c_int>,
    channel_convert: Symbol<'static, unsafe extern "C" fn(Chn, *mut c_void, *const c_void)>,
    channel_convert_inverse: Symbol<'static, unsafe extern "C" fn(Chn, *mut c_void, *const c_void)>,
}

static LIBIIO: OnceLock<Option<IioLib>> = OnceLock::new();

#[cfg(target_os = "linux")]
const LIB_NAMES: &[&str] = &["libiio.so.0", "libiio.so"];

#[cfg(target_os = "macos")]
const LIB_NAMES: &[&str] = &["libiio.dylib", "iio.framework/iio"];

#[cfg(target_os = "windows")]
const LIB_NAMES: &[&str] = &["libiio.dll"];

fn load_library() -> Option<IioLib> {
    for name in LIB_NAMES {
        if let Ok(lib) = unsafe { Library::new(name) } {
            let result = unsafe {
                // The Library is stored next to its symbols and lives as long as they do.
                let lib_ref: &'static Library = std::mem::transmute(&lib);

                Some(IioLib {
                    create_default_context: lib_ref.get(b"iio_create_default_context\0").ok()?,
                    create_context_from_uri: lib_ref.get(b"iio_create_context_from_uri\0").ok()?,
                    context_destroy: lib_ref.get(b"iio_context_destroy\0").ok()?,
                    find_device: lib_ref.get(b"iio_context_find_device\0").ok()?,
                    channels_count: lib_ref.get(b"iio_device_get_channels_count\0").ok()?,
                    get_channel: lib_ref.get(b"iio_device_get_channel\0").ok()?,
                    find_channel: lib_ref.get(b"iio_device_find_channel\0").ok()?,
                    channel_enable: lib_ref.get(b"iio_channel_enable\0").ok()?,
                    channel_disable: lib_ref.get(b"iio_channel_disable\0").ok()?,
                    set_kernel_buffers_count: lib_ref
                        .get(b"iio_device_set_kernel_buffers_count\0")
                        .ok()?,
                    create_buffer: lib_ref.get(b"iio_device_create_buffer\0").ok()?,
                    buffer_destroy: lib_ref.get(b"iio_buffer_destroy\0").ok()?,
                    buffer_cancel: lib_ref.get(b"iio_buffer_cancel\0").ok()?,
                    buffer_refill: lib_ref.get(b"iio_buffer_refill\0").ok()?,
                    buffer_push: lib_ref.get(b"iio_buffer_push\0").ok()?,
                    buffer_start: lib_ref.get(b"iio_buffer_start\0").ok()?,
                    buffer_first: lib_ref.get(b"iio_buffer_first\0").ok()?,
                    buffer_end: lib_ref.get(b"iio_buffer_end\0").ok()?,
                    buffer_step: lib_ref.get(b"iio_buffer_step\0").ok()?,
                    attr_read_longlong: lib_ref.get(b"iio_channel_attr_read_longlong\0").ok()?,
                    attr_write_bool: lib_ref.get(b"iio_channel_attr_write_bool\0").ok()?,
                    channel_convert: lib_ref.get(b"iio_channel_convert\0").ok()?,
                    channel_convert_inverse: lib_ref.get(b"iio_channel_convert_inverse\0").ok()?,
                    _lib: lib,
                })
            };

            if result.is_some() {
                tracing::info!("Loaded libiio: {}", name);
                return result;
            }
        }
    }
    tracing::debug!("libiio not found");
    None
}

fn get_lib() -> Option<&'static IioLib> {
    LIBIIO.get_or_init(load_library).as_ref()
}

/// Check if libiio can be loaded.
pub fn is_available() -> bool {
    get_lib().is_some()
}

fn c_string(s: &str) -> PlutoResult<CString> {
    CString::new(s).map_err(|_| PlutoError::ConfigError(format!("invalid IIO name '{}'", s)))
}

/// Owned `iio_context`, destroyed when the last device or buffer lets go.
struct ContextHandle {
    lib: &'static IioLib,
    ctx: NonNull<c_void>,
}

// SAFETY: the context is only destroyed once, from Drop; libiio contexts may
// be used from any thread.
unsafe impl Send for ContextHandle {}
unsafe impl Sync for ContextHandle {}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        tracing::debug!("Destroying IIO context");
        unsafe { (self.lib.context_destroy)(self.ctx.as_ptr()) };
    }
}

/// libiio-backed Pluto context.
pub struct LibIioContext {
    handle: Arc<ContextHandle>,
    phy: Option<NonNull<c_void>>,
    rx: Option<Arc<LibIioDevice>>,
    tx: Option<Arc<LibIioDevice>>,
}

// SAFETY: device pointers are owned by the context kept alive in `handle`.
unsafe impl Send for LibIioContext {}
unsafe impl Sync for LibIioContext {}

impl LibIioContext {
    /// Open the default context (local IIO, or `IIOD_REMOTE` when set).
    pub fn new_default() -> PlutoResult<Self> {
        let lib = get_lib().ok_or(PlutoError::LibraryNotFound)?;
        let ctx = unsafe { (lib.create_default_context)() };
        Self::from_raw(lib, ctx, "default")
    }

    /// Open a context from a URI such as `ip:192.168.2.1` or `usb:1.5.5`.
    pub fn from_uri(uri: &str) -> PlutoResult<Self> {
        let lib = get_lib().ok_or(PlutoError::LibraryNotFound)?;
        let c_uri = c_string(uri)?;
        let ctx = unsafe { (lib.create_context_from_uri)(c_uri.as_ptr()) };
        Self::from_raw(lib, ctx, uri)
    }

    fn from_raw(lib: &'static IioLib, ctx: Ctx, label: &str) -> PlutoResult<Self> {
        let ctx = NonNull::new(ctx).ok_or_else(|| {
            PlutoError::DeviceNotFound(format!("IIO context '{}'", label))
        })?;
        let handle = Arc::new(ContextHandle { lib, ctx });
        tracing::info!("Opened IIO context '{}'", label);

        let find = |name: &str| -> PlutoResult<Option<NonNull<c_void>>> {
            let c_name = c_string(name)?;
            Ok(NonNull::new(unsafe {
                (lib.find_device)(ctx.as_ptr(), c_name.as_ptr())
            }))
        };

        let phy = find(PHY_DEVICE)?;
        let stream_device = |direction: Direction| -> PlutoResult<Option<Arc<LibIioDevice>>> {
            let name = direction.device_name();
            Ok(find(name)?.map(|dev| {
                Arc::new(LibIioDevice {
                    handle: Arc::clone(&handle),
                    dev,
                    name: name.to_string(),
                    output: direction == Direction::Tx,
                })
            }))
        };
        let rx = stream_device(Direction::Rx)?;
        let tx = stream_device(Direction::Tx)?;

        Ok(Self { handle, phy, rx, tx })
    }

    fn lib(&self) -> &'static IioLib {
        self.handle.lib
    }
}

impl PlutoContext for LibIioContext {
    type Device = LibIioDevice;

    fn device(&self, direction: Direction) -> Option<Arc<LibIioDevice>> {
        match direction {
            Direction::Rx => self.rx.clone(),
            Direction::Tx => self.tx.clone(),
        }
    }

    fn set_lo_powerdown(&self, direction: Direction, powerdown: bool) -> PlutoResult<()> {
        let lib = self.lib();
        let phy = self
            .phy
            .ok_or_else(|| PlutoError::DeviceNotFound(PHY_DEVICE.to_string()))?;
        let c_chn = c_string(direction.lo_channel())?;
        let chn = unsafe { (lib.find_channel)(phy.as_ptr(), c_chn.as_ptr(), true) };
        if chn.is_null() {
            return Err(PlutoError::Hardware {
                op: "find_channel",
                code: -ENOENT,
            });
        }

        let attr = c_string("powerdown")?;
        let ret = unsafe { (lib.attr_write_bool)(chn, attr.as_ptr(), powerdown) };
        if ret < 0 {
            return Err(PlutoError::Hardware {
                op: "attr_write",
                code: ret,
            });
        }
        tracing::debug!("{} LO powerdown = {}", direction.lo_channel(), powerdown);
        Ok(())
    }
}

/// One streaming device of a [`LibIioContext`].
pub struct LibIioDevice {
    handle: Arc<ContextHandle>,
    dev: NonNull<c_void>,
    name: String,
    output: bool,
}

// SAFETY: see LibIioContext; channel and buffer calls are serialized by the
// session's per-direction lock.
unsafe impl Send for LibIioDevice {}
unsafe impl Sync for LibIioDevice {}

impl LibIioDevice {
    fn lib(&self) -> &'static IioLib {
        self.handle.lib
    }

    fn channel(&self, index: usize) -> Option<Chn> {
        let index = c_uint::try_from(index).ok()?;
        let chn = unsafe { (self.lib().get_channel)(self.dev.as_ptr(), index) };
        (!chn.is_null()).then_some(chn)
    }
}

impl IioDevice for LibIioDevice {
    type Buffer = LibIioBuffer;

    fn name(&self) -> &str {
        &self.name
    }

    fn channels_count(&self) -> usize {
        unsafe { (self.lib().channels_count)(self.dev.as_ptr()) as usize }
    }

    fn enable_channel(&self, index: usize) {
        if let Some(chn) = self.channel(index) {
            unsafe { (self.lib().channel_enable)(chn) };
        }
    }

    fn disable_channel(&self, index: usize) {
        if let Some(chn) = self.channel(index) {
            unsafe { (self.lib().channel_disable)(chn) };
        }
    }

    fn set_kernel_buffers_count(&self, count: usize) -> PlutoResult<()> {
        let count = c_uint::try_from(count).unwrap_or(c_uint::MAX);
        let ret = unsafe { (self.lib().set_kernel_buffers_count)(self.dev.as_ptr(), count) };
        if ret < 0 {
            return Err(PlutoError::Hardware {
                op: "set_kernel_buffers_count",
                code: ret,
            });
        }
        Ok(())
    }

    fn create_buffer(&self, samples: usize, cyclic: bool) -> PlutoResult<LibIioBuffer> {
        let buf = unsafe { (self.lib().create_buffer)(self.dev.as_ptr(), samples, cyclic) };
        let buf = NonNull::new(buf).ok_or(PlutoError::Hardware {
            op: "create_buffer",
            code: -ENOMEM,
        })?;
        Ok(LibIioBuffer {
            handle: Arc::clone(&self.handle),
            dev: self.dev,
            buf,
        })
    }

    fn channel_attr_i64(&self, channel: &str, attr: &str) -> PlutoResult<i64> {
        let lib = self.lib();
        let c_chn = c_string(channel)?;
        let chn = unsafe { (lib.find_channel)(self.dev.as_ptr(), c_chn.as_ptr(), self.output) };
        if chn.is_null() {
            return Err(PlutoError::Hardware {
                op: "find_channel",
                code: -ENOENT,
            });
        }

        let c_attr = c_string(attr)?;
        let mut value: c_longlong = 0;
        let ret = unsafe { (lib.attr_read_longlong)(chn, c_attr.as_ptr(), &mut value) };
        if ret < 0 {
            return Err(PlutoError::Hardware {
                op: "attr_read",
                code: ret,
            });
        }
        Ok(value)
    }

    fn convert(&self, channel: usize, raw: &[u8]) -> i16 {
        let mut value: i16 = 0;
        if let (Some(chn), true) = (self.channel(channel), raw.len() >= 2) {
            unsafe {
                (self.lib().channel_convert)(
                    chn,
                    &mut value as *mut i16 as *mut c_void,
                    raw.as_ptr() as *const c_void,
                )
            };
        }
        value
    }

    fn convert_inverse(&self, channel: usize, value: i16, raw: &mut [u8]) {
        if let (Some(chn), true) = (self.channel(channel), raw.len() >= 2) {
            unsafe {
                (self.lib().channel_convert_inverse)(
                    chn,
                    raw.as_mut_ptr() as *mut c_void,
                    &value as *const i16 as *const c_void,
                )
            };
        }
    }
}

/// An `iio_buffer`, destroyed on drop.
pub struct LibIioBuffer {
    handle: Arc<ContextHandle>,
    dev: NonNull<c_void>,
    buf: NonNull<c_void>,
}

// SAFETY: a buffer is owned by exactly one streamer and used under its lock.
unsafe impl Send for LibIioBuffer {}

impl LibIioBuffer {
    fn lib(&self) -> &'static IioLib {
        self.handle.lib
    }

    fn bounds(&self) -> (*mut u8, usize) {
        let lib = self.lib();
        let start = unsafe { (lib.buffer_start)(self.buf.as_ptr()) } as *mut u8;
        let end = unsafe { (lib.buffer_end)(self.buf.as_ptr()) } as *mut u8;
        let len = (end as usize).saturating_sub(start as usize);
        (start, len)
    }
}

impl IioBuffer for LibIioBuffer {
    fn data(&self) -> &[u8] {
        let (start, len) = self.bounds();
        if start.is_null() {
            return &[];
        }
        // SAFETY: libiio owns start..end for the buffer's lifetime.
        unsafe { std::slice::from_raw_parts(start, len) }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        let (start, len) = self.bounds();
        if start.is_null() {
            return &mut [];
        }
        // SAFETY: as in `data`, and `&mut self` makes this the only view.
        unsafe { std::slice::from_raw_parts_mut(start, len) }
    }

    fn step(&self) -> usize {
        let step = unsafe { (self.lib().buffer_step)(self.buf.as_ptr()) };
        usize::try_from(step).unwrap_or(0).max(1)
    }

    fn first(&self, channel: usize) -> usize {
        let lib = self.lib();
        let Ok(index) = c_uint::try_from(channel) else {
            return 0;
        };
        let chn = unsafe { (lib.get_channel)(self.dev.as_ptr(), index) };
        if chn.is_null() {
            return 0;
        }
        let start = unsafe { (lib.buffer_start)(self.buf.as_ptr()) } as usize;
        let first = unsafe { (lib.buffer_first)(self.buf.as_ptr(), chn) } as usize;
        first.saturating_sub(start)
    }

    fn refill(&mut self) -> PlutoResult<usize> {
        let ret = unsafe { (self.lib().buffer_refill)(self.buf.as_ptr()) };
        usize::try_from(ret).map_err(|_| PlutoError::Hardware {
            op: "refill",
            code: ret as i32,
        })
    }

    fn push(&mut self) -> PlutoResult<usize> {
        let ret = unsafe { (self.lib().buffer_push)(self.buf.as_ptr()) };
        usize::try_from(ret).map_err(|_| PlutoError::Hardware {
            op: "push",
            code: ret as i32,
        })
    }

    fn cancel(&mut self) {
        unsafe { (self.lib().buffer_cancel)(self.buf.as_ptr()) };
    }
}

impl Drop for LibIioBuffer {
    fn drop(&mut self) {
        unsafe { (self.lib().buffer_destroy)(self.buf.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_availability() {
        if is_available() {
            println!("libiio is available");
        } else {
            println!("libiio not available (expected on most dev machines)");
        }
    }

    #[test]
    fn test_open_without_library() {
        if is_available() {
            println!("Skipping test - libiio is installed");
            return;
        }
        assert_eq!(
            LibIioContext::from_uri("ip:192.168.2.1").err(),
            Some(PlutoError::LibraryNotFound)
        );
        assert_eq!(LibIioContext::new_default().err(), Some(PlutoError::LibraryNotFound));
    }

    #[test]
    fn test_nul_in_uri_rejected() {
        if !is_available() {
            return;
        }
        assert!(matches!(
            LibIioContext::from_uri("ip:\0"),
            Err(PlutoError::ConfigError(_))
        ));
    }
}
