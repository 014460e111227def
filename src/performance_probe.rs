//! Performance probe: fixed-duration sequential and random read/write benchmarks.
//!
//! Grounded in `original_source/device_speed_test.c`. Unlike the endurance loop's payload
//! contract, nothing here is re-read and verified against a reseeded generator -- these are pure
//! rate measurements, so the RNG is reseeded from wall-clock-derived entropy rather than the
//! slice-seed contract.

use std::time::{Duration, Instant};

use snafu::Snafu;
use tracing::info;

use crate::device::enumerator::{DeviceSource, SearchParams};
use crate::device::geometry::DeviceGeometry;
use crate::device::hotplug::HotplugSource;
use crate::io_retry::{RetriableIo, RetriableIoError};
use crate::rng::Rng;

/// Default measurement duration per sub-test (matches the source's fixed 10 s window).
pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);

const RANDOM_IO_SIZE: usize = 4096;

#[derive(Debug, Snafu)]
pub enum PerformanceProbeError {
    #[snafu(display("I/O error during performance probe: {}", source))]
    Io { source: RetriableIoError },
}

impl From<RetriableIoError> for PerformanceProbeError {
    fn from(source: RetriableIoError) -> Self {
        PerformanceProbeError::Io { source }
    }
}

/// Measured throughput from a completed performance probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceResult {
    pub sequential_read_bytes_per_sec: f64,
    pub sequential_write_bytes_per_sec: f64,
    pub random_read_iops: f64,
    pub random_write_iops: f64,
}

/// Runs the four fixed-duration sub-measurements: sequential write, sequential read, random
/// write, random read. `sequential_block_size` is normally the optimal block size from §4.8, or
/// 1 MiB if that probe was skipped.
#[allow(clippy::too_many_arguments)]
pub fn probe_performance(
    io: &mut RetriableIo,
    source: &dyn DeviceSource,
    hotplug: &mut dyn HotplugSource,
    params: &SearchParams<'_>,
    geometry: &DeviceGeometry,
    sequential_block_size: u32,
    duration: Duration,
    cancel: &dyn Fn() -> bool,
) -> Result<PerformanceResult, PerformanceProbeError> {
    let sequential_write_bytes_per_sec =
        sequential_pass(io, source, hotplug, params, sequential_block_size, duration, true, cancel)?;
    let sequential_read_bytes_per_sec =
        sequential_pass(io, source, hotplug, params, sequential_block_size, duration, false, cancel)?;
    let random_write_iops = random_pass(io, source, hotplug, params, geometry, duration, true, cancel)?;
    let random_read_iops = random_pass(io, source, hotplug, params, geometry, duration, false, cancel)?;

    info!(
        sequential_write_bytes_per_sec,
        sequential_read_bytes_per_sec, random_write_iops, random_read_iops, "performance probe complete"
    );

    Ok(PerformanceResult {
        sequential_read_bytes_per_sec,
        sequential_write_bytes_per_sec,
        random_read_iops,
        random_write_iops,
    })
}

#[allow(clippy::too_many_arguments)]
fn sequential_pass(
    io: &mut RetriableIo,
    source: &dyn DeviceSource,
    hotplug: &mut dyn HotplugSource,
    params: &SearchParams<'_>,
    block_size: u32,
    duration: Duration,
    write: bool,
    cancel: &dyn Fn() -> bool,
) -> Result<f64, PerformanceProbeError> {
    let mut rng = Rng::new(wall_clock_seed());
    let mut buffer = vec![0u8; block_size as usize];

    io.seek(0)?;
    let start = Instant::now();
    let mut bytes = 0u64;
    while start.elapsed() < duration {
        if write {
            rng.fill(&mut buffer);
            io.write(&buffer, source, hotplug, params, cancel)?;
        } else {
            io.read(&mut buffer, source, hotplug, params, cancel)?;
        }
        bytes += buffer.len() as u64;
    }
    let elapsed = start.elapsed().as_secs_f64().max(f64::MIN_POSITIVE);
    io.seek(0)?;

    Ok(bytes as f64 / elapsed)
}

#[allow(clippy::too_many_arguments)]
fn random_pass(
    io: &mut RetriableIo,
    source: &dyn DeviceSource,
    hotplug: &mut dyn HotplugSource,
    params: &SearchParams<'_>,
    geometry: &DeviceGeometry,
    duration: Duration,
    write: bool,
    cancel: &dyn Fn() -> bool,
) -> Result<f64, PerformanceProbeError> {
    let sector_size = geometry.sector_size as u64;
    let sectors_per_io = (RANDOM_IO_SIZE as u64 / sector_size).max(1);
    let physical_sectors = geometry.physical_sector_count();
    let addressable_sectors = physical_sectors.saturating_sub(sectors_per_io).max(1);

    let mut rng = Rng::new(wall_clock_seed());
    let mut buffer = vec![0u8; RANDOM_IO_SIZE];

    let start = Instant::now();
    let mut ops = 0u64;
    while start.elapsed() < duration {
        let sector = (u64::from(rng.next()) << 32 | u64::from(rng.next())) % addressable_sectors;
        io.seek(sector * sector_size)?;
        if write {
            rng.fill(&mut buffer);
            io.write(&buffer, source, hotplug, params, cancel)?;
        } else {
            io.read(&mut buffer, source, hotplug, params, cancel)?;
        }
        ops += 1;
    }
    let elapsed = start.elapsed().as_secs_f64().max(f64::MIN_POSITIVE);

    Ok(ops as f64 / elapsed)
}

/// Derives an RNG seed from wall-clock time; this probe's payload is never replayed, so only
/// freshness (not reproducibility) matters.
fn wall_clock_seed() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ (d.as_secs() as u32))
        .unwrap_or(0xC0FFEE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::hotplug::testing::FakeHotplugSource;
    use crate::device::testing::FakeDeviceSource;
    use crate::identity::IdentityBuffers;

    #[test]
    fn probe_reports_nonzero_rates_on_a_healthy_device() {
        let sector_size = 512u32;
        let size = 8 * 1024 * 1024u64;
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
        let geometry = DeviceGeometry::new(sector_size, size, size, 4096, 128);

        let result = probe_performance(
            &mut io,
            &source,
            &mut hotplug,
            &params,
            &geometry,
            4096,
            Duration::from_millis(20),
            &|| false,
        )
        .expect("probe should succeed");

        assert!(result.sequential_write_bytes_per_sec > 0.0);
        assert!(result.sequential_read_bytes_per_sec > 0.0);
        assert!(result.random_write_iops > 0.0);
        assert!(result.random_read_iops > 0.0);
    }
}
