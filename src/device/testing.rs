//! In-memory fake [`BlockDevice`] with fault injection, used by unit and scenario tests.
//!
//! Mirrors the fault-injectable fakes used elsewhere in this codebase for disk-backed buffer
//! tests, adapted to the synchronous seek/read/write surface this system needs instead of
//! `tokio::fs`.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};

use super::enumerator::DeviceSource;
use super::{BlockDevice, ResetError};

/// A fake block device backed by an in-memory buffer, with knobs for the failure modes
/// the engine must tolerate: fake-flash aliasing past a threshold, per-sector
/// I/O failures, a disconnect fired mid-operation, and USB-reset support/unavailability.
pub struct FakeBlockDevice {
    storage: Vec<u8>,
    position: u64,
    sector_size: u32,
    present: bool,
    /// Writes at or past this offset are silently dropped; reads past it return zero. Models
    /// "fake flash" devices whose advertised capacity exceeds their real capacity.
    fake_flash_threshold: Option<u64>,
    /// Byte offsets whose sector will fail I/O with [`io::ErrorKind::Other`].
    failing_sectors: HashSet<u64>,
    /// If set, `disconnect_after_bytes` more bytes written across all writes will flip `present`
    /// to `false`, simulating a mid-write disconnect.
    disconnect_after_bytes: Option<u64>,
    supports_reset: bool,
    pub reset_calls: u32,
    device_number: (u32, u32),
    /// Sectors whose next write will be corrupted (written scrambled instead of verbatim), then
    /// removed from this set -- models a transient write/media fault that self-heals afterward,
    /// as opposed to `failing_sectors`, which fails every I/O indefinitely.
    poison_next_write: HashSet<u64>,
}

impl FakeBlockDevice {
    pub fn new(size: u64, sector_size: u32) -> Self {
        Self {
            storage: vec![0u8; size as usize],
            position: 0,
            sector_size,
            present: true,
            fake_flash_threshold: None,
            failing_sectors: HashSet::new(),
            disconnect_after_bytes: None,
            supports_reset: true,
            reset_calls: 0,
            device_number: (8, 0),
            poison_next_write: HashSet::new(),
        }
    }

    /// Marks the sector containing `offset` so that its next write stores scrambled bytes instead
    /// of the caller's payload, then heals (later writes to that sector are unaffected). Models a
    /// one-off transient fault rather than a permanently failing sector.
    pub fn poison_next_write_at(&mut self, offset: u64) {
        self.poison_next_write.insert(offset - (offset % self.sector_size as u64));
    }

    pub fn with_fake_flash_threshold(mut self, threshold: u64) -> Self {
        self.fake_flash_threshold = Some(threshold);
        self
    }

    pub fn with_failing_sector(mut self, offset: u64) -> Self {
        self.failing_sectors.insert(offset - (offset % self.sector_size as u64));
        self
    }

    pub fn with_disconnect_after_bytes(mut self, bytes: u64) -> Self {
        self.disconnect_after_bytes = Some(bytes);
        self
    }

    pub fn without_reset_support(mut self) -> Self {
        self.supports_reset = false;
        self
    }

    /// Directly seeds storage, bypassing fault injection -- used by tests to set up the "real"
    /// content a device already holds.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) {
        let end = offset as usize + bytes.len();
        if end > self.storage.len() {
            self.storage.resize(end, 0);
        }
        self.storage[offset as usize..end].copy_from_slice(bytes);
    }

    pub fn reconnect(&mut self) {
        self.present = true;
    }

    pub fn force_disconnect(&mut self) {
        self.present = false;
    }

    pub fn size(&self) -> u64 {
        self.storage.len() as u64
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }
}

impl BlockDevice for FakeBlockDevice {
    fn seek(&mut self, offset: u64) -> io::Result<()> {
        if !self.present {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        self.position = offset;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if !self.present {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let sector = self.position - (self.position % self.sector_size as u64);
        if self.failing_sectors.contains(&sector) {
            return Err(io::Error::other("simulated sector read failure"));
        }

        let start = self.position as usize;
        let end = start + buf.len();
        if let Some(threshold) = self.fake_flash_threshold {
            if self.position >= threshold {
                buf.fill(0);
                self.position += buf.len() as u64;
                return Ok(());
            }
        }
        if end > self.storage.len() {
            return Err(io::Error::other("read past end of device"));
        }
        buf.copy_from_slice(&self.storage[start..end]);
        self.position += buf.len() as u64;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        if !self.present {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let sector = self.position - (self.position % self.sector_size as u64);
        if self.failing_sectors.contains(&sector) {
            return Err(io::Error::other("simulated sector write failure"));
        }

        let start = self.position as usize;
        let end = start + buf.len();
        let past_threshold = self.fake_flash_threshold.is_some_and(|t| self.position >= t);
        if end > self.storage.len() {
            return Err(io::Error::other("write past end of device"));
        }
        if !past_threshold {
            if self.poison_next_write.remove(&sector) {
                let scrambled: Vec<u8> = buf.iter().map(|b| b ^ 0xFF).collect();
                self.storage[start..end].copy_from_slice(&scrambled);
            } else {
                self.storage[start..end].copy_from_slice(buf);
            }
        }
        self.position += buf.len() as u64;

        if let Some(remaining) = self.disconnect_after_bytes {
            let remaining = remaining.saturating_sub(buf.len() as u64);
            self.disconnect_after_bytes = Some(remaining);
            if remaining == 0 {
                self.present = false;
            }
        }
        Ok(())
    }

    fn is_present(&self) -> bool {
        self.present
    }

    fn reset_bus(&mut self) -> Result<(), ResetError> {
        if !self.supports_reset {
            return Err(ResetError::Unsupported);
        }
        self.reset_calls += 1;
        self.present = true;
        Ok(())
    }

    fn device_number(&self) -> (u32, u32) {
        self.device_number
    }
}

/// A handle to a [`FakeBlockDevice`] shared between an enumerator's read-only probe open and its
/// subsequent read-write reopen, so both observe (and mutate) the same backing storage.
#[derive(Clone)]
pub struct SharedFakeDevice(pub Arc<Mutex<FakeBlockDevice>>);

impl BlockDevice for SharedFakeDevice {
    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.0.lock().unwrap().seek(offset)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.0.lock().unwrap().read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.lock().unwrap().write(buf)
    }

    fn is_present(&self) -> bool {
        self.0.lock().unwrap().is_present()
    }

    fn reset_bus(&mut self) -> Result<(), ResetError> {
        self.0.lock().unwrap().reset_bus()
    }

    fn device_number(&self) -> (u32, u32) {
        self.0.lock().unwrap().device_number()
    }
}

/// An in-memory [`DeviceSource`] backing a fixed set of named fake devices, for enumerator and
/// retriable-I/O-layer tests.
#[derive(Default)]
pub struct FakeDeviceSource {
    devices: HashMap<String, (Arc<Mutex<FakeBlockDevice>>, u64)>,
    next_device_number: u32,
}

impl FakeDeviceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device at `path` with the given reported size and sector size, running `setup` on
    /// it to seed its identity-matching content before it's discoverable.
    pub fn add_device(
        &mut self,
        path: &str,
        size: u64,
        sector_size: u32,
        setup: impl FnOnce(&mut FakeBlockDevice),
    ) {
        let mut device = FakeBlockDevice::new(size, sector_size);
        device.device_number = (8, self.next_device_number);
        self.next_device_number += 1;
        setup(&mut device);
        self.devices
            .insert(path.to_string(), (Arc::new(Mutex::new(device)), size));
    }

    /// Direct access to an already-added device, for tests that simulate disconnect/reconnect or
    /// corruption after the device has been registered.
    pub fn get(&self, path: &str) -> Arc<Mutex<FakeBlockDevice>> {
        self.devices
            .get(path)
            .expect("device must have been added via add_device")
            .0
            .clone()
    }

    pub fn remove(&mut self, path: &str) {
        self.devices.remove(path);
    }
}

impl DeviceSource for FakeDeviceSource {
    fn candidates_by_size(&self, expected_reported_size: u64) -> Vec<String> {
        self.devices
            .iter()
            .filter(|(_, (_, size))| *size == expected_reported_size)
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn open_read_only(&self, path: &str) -> io::Result<Box<dyn BlockDevice>> {
        self.open_read_write(path)
    }

    fn open_read_write(&self, path: &str) -> io::Result<Box<dyn BlockDevice>> {
        self.devices
            .get(path)
            .map(|(device, _)| Box::new(SharedFakeDevice(device.clone())) as Box<dyn BlockDevice>)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn discover_geometry(&self, path: &str) -> io::Result<super::DeviceGeometry> {
        let (device, size) = self
            .devices
            .get(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let sector_size = device.lock().unwrap().sector_size();
        Ok(super::DeviceGeometry::new(sector_size, *size, *size, sector_size, 128))
    }
}
