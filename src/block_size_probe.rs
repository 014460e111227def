//! Optimal-block-size probe: a timed sweep across power-of-two request sizes, picking the
//! smallest size that reaches the device's throughput plateau.
//!
//! Grounded in `original_source/block_size_test.c`'s sweep from 512 B to 64 MiB (18 sizes),
//! skipping sizes below the kernel's preferred block size or above `max_sectors_per_request * S`.

use std::time::Instant;

use snafu::Snafu;
use tracing::{debug, info};

use crate::device::enumerator::{DeviceSource, SearchParams};
use crate::device::geometry::DeviceGeometry;
use crate::device::hotplug::HotplugSource;
use crate::io_retry::RetriableIo;
use crate::rng::Rng;

/// Default total bytes streamed per admitted block size (256 MiB, matching the source).
pub const DEFAULT_SWEEP_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Snafu)]
pub enum BlockSizeProbeError {
    #[snafu(display("I/O error during block size probe: {}", source))]
    Io { source: crate::io_retry::RetriableIoError },
}

impl From<crate::io_retry::RetriableIoError> for BlockSizeProbeError {
    fn from(source: crate::io_retry::RetriableIoError) -> Self {
        BlockSizeProbeError::Io { source }
    }
}

/// The 18 power-of-two sizes this probe considers, from 512 B to 64 MiB.
fn candidate_sizes() -> [u32; 18] {
    std::array::from_fn(|i| 512u32 << i)
}

/// Sweeps admitted block sizes, streaming `sweep_bytes` through each sequentially from offset 0,
/// and returns the smallest size whose throughput exceeds the previous best by more than 5%.
pub fn probe_optimal_block_size(
    io: &mut RetriableIo,
    source: &dyn DeviceSource,
    hotplug: &mut dyn HotplugSource,
    params: &SearchParams<'_>,
    geometry: &DeviceGeometry,
    sweep_bytes: u64,
    cancel: &dyn Fn() -> bool,
) -> Result<u32, BlockSizeProbeError> {
    let mut best_rate = 0.0f64;
    let mut best_size = geometry.preferred_block_size.max(geometry.sector_size);

    for size in candidate_sizes() {
        if size < geometry.preferred_block_size {
            continue;
        }
        if u64::from(size) > u64::from(geometry.max_sectors_per_request) * u64::from(geometry.sector_size) {
            continue;
        }
        if u64::from(size) > geometry.reported_size.min(64 * 1024 * 1024) {
            continue;
        }

        let rate = time_sequential_write(io, source, hotplug, params, size, sweep_bytes, cancel)?;
        debug!(block_size = size, bytes_per_sec = rate, "block size probe sample");

        if best_rate == 0.0 || rate > best_rate * 1.05 {
            best_rate = rate;
            best_size = size;
        }
    }

    info!(block_size = best_size, "optimal block size selected");
    Ok(best_size)
}

fn time_sequential_write(
    io: &mut RetriableIo,
    source: &dyn DeviceSource,
    hotplug: &mut dyn HotplugSource,
    params: &SearchParams<'_>,
    block_size: u32,
    total_bytes: u64,
    cancel: &dyn Fn() -> bool,
) -> Result<f64, BlockSizeProbeError> {
    let mut rng = Rng::new(block_size.wrapping_mul(2246822519));
    let mut buffer = vec![0u8; block_size as usize];

    io.seek(0)?;
    let start = Instant::now();
    let mut written = 0u64;
    while written < total_bytes {
        rng.fill(&mut buffer);
        io.write(&buffer, source, hotplug, params, cancel)?;
        written += buffer.len() as u64;
    }
    let elapsed = start.elapsed().as_secs_f64().max(f64::MIN_POSITIVE);
    io.seek(0)?;

    Ok(written as f64 / elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::hotplug::testing::FakeHotplugSource;
    use crate::device::testing::FakeDeviceSource;
    use crate::identity::IdentityBuffers;

    #[test]
    fn skips_sizes_outside_bounds_and_returns_a_candidate() {
        let sector_size = 512u32;
        let size = 64 * 1024 * 1024u64;
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

        let chosen = probe_optimal_block_size(
            &mut io,
            &source,
            &mut hotplug,
            &params,
            &geometry,
            256 * 1024,
            &|| false,
        )
        .expect("probe should succeed");

        assert!(chosen >= 4096);
        assert!(chosen.is_power_of_two());
        assert!(u64::from(chosen) <= 128 * u64::from(sector_size));
    }

    #[test]
    fn candidate_sizes_span_512b_to_64mib() {
        let sizes = candidate_sizes();
        assert_eq!(sizes[0], 512);
        assert_eq!(sizes[17], 64 * 1024 * 1024);
    }
}
