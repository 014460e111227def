//! Production [`DeviceSource`]: candidate discovery via `/sys/class/block`, opening through
//! [`LinuxBlockDevice`].
//!
//! Grounded in `original_source/mfst.c`'s device-scan routine, which walks the same `sysfs` tree
//! reading each block device's `size` attribute (in 512-byte units) before opening candidates.

use std::io;
use std::path::Path;

use super::enumerator::DeviceSource;
use super::linux::LinuxBlockDevice;
use super::BlockDevice;

const SYSFS_BLOCK: &str = "/sys/class/block";
const SYSFS_SECTOR_SIZE: u64 = 512;

/// Scans `/sys/class/block` for devices whose reported size (the `size` attribute, in 512-byte
/// units) matches the expected byte count.
pub struct SysfsDeviceSource;

impl SysfsDeviceSource {
    pub fn new() -> Self {
        Self
    }

    fn device_node_path(name: &str) -> std::path::PathBuf {
        Path::new("/dev").join(name)
    }

    fn reported_size_bytes(name: &str) -> Option<u64> {
        let size_path = Path::new(SYSFS_BLOCK).join(name).join("size");
        let contents = std::fs::read_to_string(size_path).ok()?;
        let sectors: u64 = contents.trim().parse().ok()?;
        Some(sectors * SYSFS_SECTOR_SIZE)
    }
}

impl Default for SysfsDeviceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSource for SysfsDeviceSource {
    fn candidates_by_size(&self, expected_reported_size: u64) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(SYSFS_BLOCK) else {
            return Vec::new();
        };

        let mut candidates = Vec::new();
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if Self::reported_size_bytes(&name) == Some(expected_reported_size) {
                candidates.push(Self::device_node_path(&name).to_string_lossy().into_owned());
            }
        }
        candidates
    }

    fn open_read_only(&self, path: &str) -> io::Result<Box<dyn BlockDevice>> {
        let device = LinuxBlockDevice::open_read_only(Path::new(path))?;
        Ok(Box::new(device))
    }

    fn open_read_write(&self, path: &str) -> io::Result<Box<dyn BlockDevice>> {
        let device = LinuxBlockDevice::open_read_write(Path::new(path))?;
        Ok(Box::new(device))
    }

    fn discover_geometry(&self, path: &str) -> io::Result<super::DeviceGeometry> {
        LinuxBlockDevice::open_read_only(Path::new(path))?.discover_geometry()
    }
}
