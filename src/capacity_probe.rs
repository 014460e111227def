//! Capacity probe: discovers the real physical size `P <= R` of a device, detecting "fake
//! flash" media whose advertised capacity exceeds what it can actually store.
//!
//! Stage 1 spreads nine 4 MiB slices across the device and looks for the first one that fails to
//! read back what was written. Stage 2 bisects within the bounds Stage 1 narrowed things down to.

use snafu::Snafu;
use tracing::{info, warn};

use crate::device::enumerator::{DeviceSource, SearchParams};
use crate::device::hotplug::HotplugSource;
use crate::device::geometry::DeviceGeometry;
use crate::io_retry::{IoOutcome, RetriableIo, RetriableIoError};
use crate::rng::Rng;

const SLICE_BYTES: usize = 4 * 1024 * 1024;
const BISECT_WRITE_BYTES: usize = 36 * 1024 * 1024;
const BISECT_READ_BYTES: usize = 16 * 1024 * 1024;
const BISECT_RESOLUTION_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Snafu)]
pub enum CapacityProbeError {
    #[snafu(display("the first sector of the device is unstable; capacity cannot be trusted"))]
    FirstSectorUnstable,
    #[snafu(display("I/O error during capacity probe: {}", source))]
    Io { source: RetriableIoError },
}

impl From<RetriableIoError> for CapacityProbeError {
    fn from(source: RetriableIoError) -> Self {
        CapacityProbeError::Io { source }
    }
}

/// Result of a completed capacity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityProbeResult {
    /// `P`: the detected physical size, in bytes.
    pub physical_size: u64,
    /// `true` if `P < R` (the advertised capacity exceeds the real one).
    pub fake_flash: bool,
}

struct Io<'a, 'b> {
    io: &'a mut RetriableIo,
    source: &'a dyn DeviceSource,
    hotplug: &'a mut dyn HotplugSource,
    params: &'a SearchParams<'b>,
    cancel: &'a dyn Fn() -> bool,
}

impl<'a, 'b> Io<'a, 'b> {
    fn seek(&mut self, offset: u64) -> Result<(), RetriableIoError> {
        self.io.seek(offset)
    }

    fn write(&mut self, buf: &[u8]) -> Result<IoOutcome, RetriableIoError> {
        self.io.write(buf, self.source, self.hotplug, self.params, self.cancel)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<IoOutcome, RetriableIoError> {
        self.io.read(buf, self.source, self.hotplug, self.params, self.cancel)
    }
}

/// Runs the capacity probe to completion, returning the detected physical size. `seed` should be
/// derived from wall-clock entropy by the caller; tests pass a fixed value for determinism.
pub fn probe_capacity(
    io: &mut RetriableIo,
    source: &dyn DeviceSource,
    hotplug: &mut dyn HotplugSource,
    params: &SearchParams<'_>,
    geometry: &DeviceGeometry,
    seed: u32,
    cancel: &dyn Fn() -> bool,
) -> Result<CapacityProbeResult, CapacityProbeError> {
    let mut ops = Io { io, source, hotplug, params, cancel };
    let sector_size = geometry.sector_size as u64;
    let n_l = geometry.logical_sector_count();
    let reported_size = geometry.reported_size;

    let slice_sectors = SLICE_BYTES as u64 / sector_size;
    let starts = stage1_slice_starts(n_l, slice_sectors, seed);

    let mut rng = Rng::new(seed);
    let payloads: Vec<Vec<u8>> = (0..9)
        .map(|_| {
            let mut buf = vec![0u8; SLICE_BYTES];
            rng.fill(&mut buf);
            buf
        })
        .collect();

    // Write last-to-first to evict cache from the end of the device.
    for i in (0..9).rev() {
        ops.seek(starts[i] * sector_size)?;
        ops.write(&payloads[i])?;
    }

    // Read back in forward order and compare at sector granularity.
    for i in 0..9 {
        ops.seek(starts[i] * sector_size)?;
        let mut observed = vec![0u8; SLICE_BYTES];
        ops.read(&mut observed)?;

        if let Some(offset) = first_mismatch(&payloads[i], &observed, sector_size as usize) {
            if i == 0 {
                if offset == 0 {
                    warn!("first sector of the device is unstable; abandoning capacity probe");
                    return Err(CapacityProbeError::FirstSectorUnstable);
                }
                return Ok(finish(offset as u64, reported_size));
            }
            if offset == 0 {
                // Mismatch begins at the start of this slice: bisect between the end of the
                // last known-good slice and the start of this one.
                let low = starts[i - 1] + slice_sectors;
                let high = starts[i];
                return bisect(&mut ops, geometry, low, high, reported_size);
            }
            let physical_size = starts[i] * sector_size + offset as u64;
            return Ok(finish(physical_size, reported_size));
        }
    }

    info!("capacity probe: all nine spread slices verified; device appears fully writable");
    Ok(finish(n_l * sector_size, reported_size))
}

fn stage1_slice_starts(n_l: u64, slice_sectors: u64, seed: u32) -> [u64; 9] {
    let mut rng = Rng::new(seed ^ 0x5B17_3A21);
    let mut starts = [0u64; 9];
    starts[0] = 0;
    starts[8] = n_l.saturating_sub(slice_sectors);

    let remaining_start = slice_sectors;
    let remaining_end = starts[8];
    let span = remaining_end.saturating_sub(remaining_start);
    let partition_size = span / 7;

    for (i, slot) in starts[1..8].iter_mut().enumerate() {
        let partition_start = remaining_start + i as u64 * partition_size;
        let room = partition_size.saturating_sub(slice_sectors);
        let jitter = if room > 0 { rng.next() as u64 % room } else { 0 };
        *slot = partition_start + jitter;
    }

    starts
}

/// First byte offset, within `expected`, where `observed` diverges, compared sector by sector (a
/// sector either matches completely or counts as a mismatch at its first byte).
fn first_mismatch(expected: &[u8], observed: &[u8], sector_size: usize) -> Option<usize> {
    for (sector_start, (exp_chunk, obs_chunk)) in expected
        .chunks(sector_size)
        .zip(observed.chunks(sector_size))
        .enumerate()
        .map(|(i, chunks)| (i * sector_size, chunks))
    {
        if exp_chunk != obs_chunk {
            return Some(sector_start);
        }
    }
    None
}

fn bisect(
    ops: &mut Io<'_, '_>,
    geometry: &DeviceGeometry,
    mut low: u64,
    mut high: u64,
    reported_size: u64,
) -> Result<CapacityProbeResult, CapacityProbeError> {
    let sector_size = geometry.sector_size as u64;
    let resolution_sectors = BISECT_RESOLUTION_BYTES / sector_size;
    let write_sectors = BISECT_WRITE_BYTES as u64 / sector_size;
    let read_sectors = BISECT_READ_BYTES as u64 / sector_size;

    loop {
        let cur = if high - low > resolution_sectors {
            low + (high - low) / 2
        } else {
            low
        };

        let mut rng = Rng::new((cur as u32).wrapping_mul(2654435761).wrapping_add(0xA5));
        let mut payload = vec![0u8; (write_sectors * sector_size) as usize];
        rng.fill(&mut payload);

        ops.seek(cur * sector_size)?;
        ops.write(&payload)?;

        ops.seek(cur * sector_size)?;
        let mut observed = vec![0u8; (read_sectors * sector_size) as usize];
        ops.read(&mut observed)?;

        let mismatch = first_mismatch(&payload[..observed.len()], &observed, sector_size as usize);

        if high - low <= resolution_sectors {
            return match mismatch {
                None => Ok(finish(low * sector_size, reported_size)),
                Some(0) => Ok(finish(low * sector_size, reported_size)),
                Some(offset) => Ok(finish(cur * sector_size + offset as u64, reported_size)),
            };
        }

        match mismatch {
            None => low = cur,
            Some(0) => high = cur,
            Some(offset) => return Ok(finish(cur * sector_size + offset as u64, reported_size)),
        }
    }
}

fn finish(physical_size: u64, reported_size: u64) -> CapacityProbeResult {
    CapacityProbeResult {
        physical_size,
        fake_flash: physical_size < reported_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::hotplug::testing::FakeHotplugSource;
    use crate::device::testing::FakeDeviceSource;
    use crate::identity::IdentityBuffers;
    use crate::io_retry::RetriableIo;

    fn geometry(sector_size: u32, size: u64) -> DeviceGeometry {
        DeviceGeometry::new(sector_size, size, size, sector_size, 4096)
    }

    #[test]
    fn good_device_reports_full_size() {
        let sector_size = 512u32;
        let size = 256 * 1024 * 1024u64;
        let mut source = FakeDeviceSource::new();
        source.add_device("/dev/sdx", size, sector_size, |_| {});
        let device = source.open_read_write("/dev/sdx").unwrap();

        let mut io = RetriableIo::new(device, 1);
        let identity = IdentityBuffers::empty();
        let params = SearchParams {
            expected_reported_size: size,
            identity: &identity,
            sector_size,
            physical_size: size,
            preferred_path: None,
            must_match_preferred: false,
        };
        let mut hotplug = FakeHotplugSource::new(0);
        let geometry = geometry(sector_size, size);

        let result = probe_capacity(&mut io, &source, &mut hotplug, &params, &geometry, 42, &|| false)
            .expect("probe should succeed");
        assert_eq!(result.physical_size, size);
        assert!(!result.fake_flash);
    }

    #[test]
    fn fake_flash_is_detected_within_bisection_resolution() {
        let sector_size = 512u32;
        let size = 256 * 1024 * 1024u64;
        let real_size = 64 * 1024 * 1024u64; // writes past here are dropped

        let mut source = FakeDeviceSource::new();
        source.add_device("/dev/sdx", size, sector_size, |_| {});
        let device = source.open_read_write("/dev/sdx").unwrap();
        {
            let fake = source.get("/dev/sdx");
            let mut fake = fake.lock().unwrap();
            *fake = crate::device::testing::FakeBlockDevice::new(size, sector_size)
                .with_fake_flash_threshold(real_size);
        }

        let mut io = RetriableIo::new(device, 1);
        let identity = IdentityBuffers::empty();
        let params = SearchParams {
            expected_reported_size: size,
            identity: &identity,
            sector_size,
            physical_size: size,
            preferred_path: None,
            must_match_preferred: false,
        };
        let mut hotplug = FakeHotplugSource::new(0);
        let geometry = geometry(sector_size, size);

        let result = probe_capacity(&mut io, &source, &mut hotplug, &params, &geometry, 7, &|| false)
            .expect("probe should succeed");
        assert!(result.fake_flash);
        assert!(result.physical_size <= real_size);
        assert!(result.physical_size + 2 * BISECT_RESOLUTION_BYTES >= real_size);
    }

    #[test]
    fn first_mismatch_detects_divergent_sector() {
        let sector_size = 4;
        let expected = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let mut observed = expected.clone();
        observed[5] = 99;
        assert_eq!(first_mismatch(&expected, &observed, sector_size), Some(4));
    }

    #[test]
    fn first_mismatch_none_when_identical() {
        let data = vec![1u8; 32];
        assert_eq!(first_mismatch(&data, &data, 8), None);
    }

    #[test]
    fn stage1_slices_do_not_overlap() {
        let n_l = 1_000_000u64;
        let slice_sectors = 8192u64; // 4 MiB / 512
        let starts = stage1_slice_starts(n_l, slice_sectors, 123);
        for window in starts.windows(2) {
            assert!(
                window[0] + slice_sectors <= window[1],
                "slices must not overlap: {:?}",
                starts
            );
        }
    }
}
