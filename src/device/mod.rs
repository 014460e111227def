//! Block device abstraction: geometry discovery, device enumeration, and hot-plug reconnect.

pub mod enumerator;
pub mod geometry;
pub mod hotplug;
pub mod linux;
pub mod sysfs;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

use std::io;

pub use geometry::DeviceGeometry;

/// Error returned by [`BlockDevice::reset_bus`] when the device's parent bus does not support a
/// reset operation when the underlying device does not support one.
#[derive(Debug, snafu::Snafu)]
pub enum ResetError {
    #[snafu(display("bus reset is not supported for this device"))]
    Unsupported,
    #[snafu(display("bus reset ioctl failed: {}", source))]
    Io { source: io::Error },
}

/// The minimal surface the retriable I/O layer needs from an open device: plain
/// seek/read/write, a liveness check, and an optional bus-level reset.
///
/// A production instance is opened with direct + synchronous + large-file + read-write semantics;
/// the identity of "the device under test" is established by
/// [`crate::identity::IdentityBuffers`], not by path, since the underlying path or device number
/// may change across a reconnect.
pub trait BlockDevice: Send {
    fn seek(&mut self, offset: u64) -> io::Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<()>;
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// `true` if the system path backing this device is still present and its reported size has
    /// not dropped to zero.
    fn is_present(&self) -> bool;

    /// Performs a bus-level reset if the underlying bus supports it (USB, on Linux).
    fn reset_bus(&mut self) -> Result<(), ResetError>;

    /// Opaque (major, minor) device number, used by the enumerator to recognize that a
    /// newly-arrived path is the "same" kernel device object.
    fn device_number(&self) -> (u32, u32);
}
