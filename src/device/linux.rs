//! Linux implementation of [`BlockDevice`]: direct/synchronous I/O over an open file descriptor,
//! geometry discovered via block-device ioctls, and a best-effort USB bus reset.
//!
//! Ioctl names and the `sysfs` `size` attribute units are grounded in
//! reported size (`BLKGETSIZE64`) and max sectors per request (`BLKSECTGET`).

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::stat::{fstat, major, minor};

use super::{BlockDevice, DeviceGeometry, ResetError};

// Linux block-device ioctl numbers, from <linux/fs.h> / <linux/hdreg.h>.
nix::ioctl_read!(ioctl_blkgetsize64, 0x12, 114, u64);
nix::ioctl_read!(ioctl_blkssz_get, 0x12, 104, libc::c_int);
nix::ioctl_read!(ioctl_blksect_get, 0x12, 103, libc::c_ushort);
nix::ioctl_none!(ioctl_usbdevfs_reset, b'U', 20);

/// `is_present()` runs a `path.exists()` syscall plus three geometry ioctls; the retry layer
/// calls it on every seek/read/write, so its result is cached for this long.
const PRESENCE_CACHE_TTL: Duration = Duration::from_millis(200);

/// An open Linux block device, opened with `O_DIRECT | O_SYNC | O_LARGEFILE | O_RDWR`.
pub struct LinuxBlockDevice {
    file: File,
    path: PathBuf,
    device_number: (u32, u32),
    presence_cache: Cell<Option<(Instant, bool)>>,
}

impl LinuxBlockDevice {
    /// Opens `path` read-write with direct, synchronous, large-file semantics.
    pub fn open_read_write(path: &Path) -> io::Result<Self> {
        Self::open(path, true)
    }

    /// Opens `path` read-only, for the enumerator's identity-matching pass,
    /// which must not perturb a device it ultimately rejects.
    pub fn open_read_only(path: &Path) -> io::Result<Self> {
        Self::open(path, false)
    }

    fn open(path: &Path, read_write: bool) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(read_write);
        options.custom_flags(libc::O_DIRECT | libc::O_SYNC | libc::O_LARGEFILE);
        let file = options.open(path)?;
        let stat = fstat(file.as_raw_fd()).map_err(io::Error::from)?;
        let rdev = stat.st_rdev;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            device_number: (major(rdev) as u32, minor(rdev) as u32),
            presence_cache: Cell::new(None),
        })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Discovers geometry for an already-open device: reported size, logical sector size, and
    /// max sectors per request. The enumerator re-opens the device read-write after this
    /// has already run once read-only during candidate matching; both opens observe the same
    /// geometry.
    pub fn discover_geometry(&self) -> io::Result<DeviceGeometry> {
        let reported_size = unsafe {
            let mut size: u64 = 0;
            ioctl_blkgetsize64(self.fd(), &mut size).map_err(io::Error::from)?;
            size
        };
        let sector_size = unsafe {
            let mut size: libc::c_int = 0;
            ioctl_blkssz_get(self.fd(), &mut size).map_err(io::Error::from)?;
            size as u32
        };
        let max_sectors_per_request = unsafe {
            let mut sectors: libc::c_ushort = 0;
            ioctl_blksect_get(self.fd(), &mut sectors).map_err(io::Error::from)?;
            sectors as u32
        };

        Ok(DeviceGeometry::new(
            sector_size,
            reported_size,
            reported_size,
            sector_size,
            max_sectors_per_request,
        ))
    }

    /// `true` if this device's kernel object is attached under a USB host controller, per the
    /// `sysfs` device-tree link at `/sys/class/block/<name>/device`.
    fn is_usb(&self) -> bool {
        let Some(name) = self.path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let sysfs_device = PathBuf::from("/sys/class/block").join(name).join("device");
        match std::fs::canonicalize(&sysfs_device) {
            Ok(resolved) => resolved.to_string_lossy().contains("usb"),
            Err(_) => false,
        }
    }

    /// Locates the `/dev/bus/usb/BBB/DDD` devfs node backing this device, by walking up the
    /// `sysfs` device-tree link to the USB device directory and reading its `busnum`/`devnum`
    /// attributes.
    fn usb_devfs_node(&self) -> Option<PathBuf> {
        let name = self.path.file_name()?.to_str()?;
        let sysfs_device =
            std::fs::canonicalize(PathBuf::from("/sys/class/block").join(name).join("device"))
                .ok()?;
        let mut dir = sysfs_device.as_path();
        loop {
            let busnum = std::fs::read_to_string(dir.join("busnum")).ok();
            let devnum = std::fs::read_to_string(dir.join("devnum")).ok();
            if let (Some(busnum), Some(devnum)) = (busnum, devnum) {
                let bus: u32 = busnum.trim().parse().ok()?;
                let dev: u32 = devnum.trim().parse().ok()?;
                return Some(PathBuf::from(format!("/dev/bus/usb/{bus:03}/{dev:03}")));
            }
            dir = dir.parent()?;
        }
    }
}

impl BlockDevice for LinuxBlockDevice {
    fn seek(&mut self, offset: u64) -> io::Result<()> {
        use std::io::Seek;
        self.file.seek(io::SeekFrom::Start(offset))?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        use std::io::Read;
        self.file.read_exact(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.file.write_all(buf)
    }

    fn is_present(&self) -> bool {
        if let Some((checked_at, present)) = self.presence_cache.get() {
            if checked_at.elapsed() < PRESENCE_CACHE_TTL {
                return present;
            }
        }

        let present = self.path.exists()
            && matches!(self.discover_geometry(), Ok(geometry) if geometry.reported_size > 0);
        self.presence_cache.set(Some((Instant::now(), present)));
        present
    }

    fn reset_bus(&mut self) -> Result<(), ResetError> {
        if !self.is_usb() {
            return Err(ResetError::Unsupported);
        }
        let Some(devfs_node) = self.usb_devfs_node() else {
            return Err(ResetError::Unsupported);
        };
        let usb_file = File::open(devfs_node).map_err(|source| ResetError::Io { source })?;
        unsafe { ioctl_usbdevfs_reset(usb_file.as_raw_fd()) }
            .map_err(io::Error::from)
            .map_err(|source| ResetError::Io { source })?;
        Ok(())
    }

    fn device_number(&self) -> (u32, u32) {
        self.device_number
    }
}
