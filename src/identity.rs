//! BOD/MOD identity buffers used to recognize "the same device" across
//! disconnects and process restarts.

use crate::device::BlockDevice;

pub const BOD_MOD_SIZE: usize = 1024 * 1024;

/// Outcome of comparing a candidate device's content against a known identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMatch {
    ExactBod,
    ExactMod,
    /// At least 50% of MOD's sector-sized sub-blocks matched.
    PartialMod,
    NoMatch,
    IoError,
}

/// Two fixed-size 1 MiB snapshots: content expected at offset 0 (BOD) and at offset
/// `floor(physical_size / 2)` (MOD).
#[derive(Debug, Clone)]
pub struct IdentityBuffers {
    pub bod: Box<[u8; BOD_MOD_SIZE]>,
    pub mod_: Box<[u8; BOD_MOD_SIZE]>,
}

impl IdentityBuffers {
    pub fn empty() -> Self {
        Self {
            bod: Box::new([0u8; BOD_MOD_SIZE]),
            mod_: Box::new([0u8; BOD_MOD_SIZE]),
        }
    }

    pub fn mod_offset(physical_size: u64) -> u64 {
        physical_size / 2
    }

    /// Mirrors `bytes` (written at `device_offset`) into whichever identity buffer(s) it
    /// overlaps. Returns `true` if any buffer was touched, signaling the caller to request a
    /// state save.
    pub fn mirror_write(&mut self, device_offset: u64, bytes: &[u8], physical_size: u64) -> bool {
        let mut touched = false;
        touched |= mirror_region(&mut self.bod, 0, device_offset, bytes);
        touched |= mirror_region(
            &mut self.mod_,
            Self::mod_offset(physical_size),
            device_offset,
            bytes,
        );
        touched
    }

    /// Re-reads both identity regions from `device` and classifies the result. A read error on a
    /// sector during comparison is treated as a mismatch (zero-filled), never fatal -- the
    /// purpose here is identification, not integrity.
    pub fn compare(
        &self,
        device: &mut dyn BlockDevice,
        sector_size: u32,
        physical_size: u64,
    ) -> IdentityMatch {
        let observed_bod = match read_region_tolerant(device, 0, BOD_MOD_SIZE, sector_size) {
            Some(buf) => buf,
            None => return IdentityMatch::IoError,
        };
        if observed_bod.as_slice() == self.bod.as_slice() {
            return IdentityMatch::ExactBod;
        }

        let mod_offset = Self::mod_offset(physical_size);
        let observed_mod = match read_region_tolerant(device, mod_offset, BOD_MOD_SIZE, sector_size)
        {
            Some(buf) => buf,
            None => return IdentityMatch::IoError,
        };
        if observed_mod.as_slice() == self.mod_.as_slice() {
            return IdentityMatch::ExactMod;
        }

        let sector_size = sector_size as usize;
        let sub_blocks = BOD_MOD_SIZE / sector_size;
        let matching = (0..sub_blocks)
            .filter(|i| {
                let start = i * sector_size;
                let end = start + sector_size;
                observed_mod[start..end] == self.mod_[start..end]
            })
            .count();

        if sub_blocks > 0 && matching * 2 >= sub_blocks {
            IdentityMatch::PartialMod
        } else {
            IdentityMatch::NoMatch
        }
    }
}

fn mirror_region(buffer: &mut [u8; BOD_MOD_SIZE], region_start: u64, write_start: u64, bytes: &[u8]) -> bool {
    let region_end = region_start + BOD_MOD_SIZE as u64;
    let write_end = write_start + bytes.len() as u64;
    if write_start >= region_end || write_end <= region_start {
        return false;
    }

    let overlap_start = write_start.max(region_start);
    let overlap_end = write_end.min(region_end);

    let src_offset = (overlap_start - write_start) as usize;
    let dst_offset = (overlap_start - region_start) as usize;
    let len = (overlap_end - overlap_start) as usize;

    buffer[dst_offset..dst_offset + len].copy_from_slice(&bytes[src_offset..src_offset + len]);
    true
}

/// Reads `len` bytes starting at `offset`, zero-filling any sector that fails to read rather than
/// treating it as fatal. Returns `None` only if the device is unreachable entirely (e.g. seek
/// fails), which the caller reports as [`IdentityMatch::IoError`].
fn read_region_tolerant(
    device: &mut dyn BlockDevice,
    offset: u64,
    len: usize,
    sector_size: u32,
) -> Option<Vec<u8>> {
    let sector_size = sector_size as usize;
    let mut out = vec![0u8; len];
    if device.seek(offset).is_err() {
        return None;
    }
    let mut position = 0;
    while position < len {
        let chunk_len = sector_size.min(len - position);
        let mut chunk = vec![0u8; chunk_len];
        match device.read(&mut chunk) {
            Ok(()) => out[position..position + chunk_len].copy_from_slice(&chunk),
            Err(_) => {
                // Leave this sector zero-filled and keep going; re-seek past the failed sector.
                let _ = device.seek(offset + position as u64 + chunk_len as u64);
            }
        }
        position += chunk_len;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::FakeBlockDevice;

    fn filled(byte: u8) -> Box<[u8; BOD_MOD_SIZE]> {
        Box::new([byte; BOD_MOD_SIZE])
    }

    #[test]
    fn mirror_write_touches_bod_only() {
        let mut identity = IdentityBuffers::empty();
        let data = vec![0xAB; 512];
        let touched = identity.mirror_write(0, &data, 1 << 30);
        assert!(touched);
        assert_eq!(&identity.bod[0..512], data.as_slice());
        assert_eq!(identity.mod_[0], 0);
    }

    #[test]
    fn mirror_write_spans_mod_boundary() {
        let mut identity = IdentityBuffers::empty();
        let physical_size = 1 << 30; // mod offset = 512 MiB
        let mod_offset = IdentityBuffers::mod_offset(physical_size);
        let data = vec![0xCD; 4096];
        // Write starting 2048 bytes before the MOD region, spanning across its start.
        let touched = identity.mirror_write(mod_offset - 2048, &data, physical_size);
        assert!(touched);
        assert_eq!(&identity.mod_[0..2048], &data[2048..4096]);
    }

    #[test]
    fn compare_detects_exact_bod() {
        let mut identity = IdentityBuffers::empty();
        identity.bod = filled(0x11);
        let mut device = FakeBlockDevice::new(8 * 1024 * 1024, 512);
        device.write_at(0, &[0x11; BOD_MOD_SIZE]);
        assert_eq!(
            identity.compare(&mut device, 512, 8 * 1024 * 1024),
            IdentityMatch::ExactBod
        );
    }

    #[test]
    fn compare_detects_partial_mod() {
        let physical_size = 4 * 1024 * 1024u64;
        let mut identity = IdentityBuffers::empty();
        identity.mod_ = filled(0x22);
        let mut device = FakeBlockDevice::new(physical_size, 512);
        let mod_offset = IdentityBuffers::mod_offset(physical_size);
        let mut mod_region = vec![0x22u8; BOD_MOD_SIZE];
        // Corrupt just under half of the 512-byte sub-blocks so >= 50% still match.
        let sub_blocks = BOD_MOD_SIZE / 512;
        for i in 0..(sub_blocks / 2 - 1) {
            let start = i * 512;
            mod_region[start..start + 512].fill(0x99);
        }
        device.write_at(mod_offset, &mod_region);
        assert_eq!(
            identity.compare(&mut device, 512, physical_size),
            IdentityMatch::PartialMod
        );
    }

    #[test]
    fn compare_reports_no_match() {
        let mut identity = IdentityBuffers::empty();
        identity.bod = filled(0x33);
        identity.mod_ = filled(0x44);
        let device_size = 4 * 1024 * 1024u64;
        let mut device = FakeBlockDevice::new(device_size, 512);
        device.write_at(0, &[0xFF; BOD_MOD_SIZE]);
        device.write_at(IdentityBuffers::mod_offset(device_size), &[0xEE; BOD_MOD_SIZE]);
        assert_eq!(
            identity.compare(&mut device, 512, device_size),
            IdentityMatch::NoMatch
        );
    }
}
