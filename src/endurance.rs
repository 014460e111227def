//! The endurance loop: round after round of shuffled-slice write and read-verify, until half the
//! device's logical sectors are bad or a fatal, unrecoverable I/O error occurs.
//!
//! Grounded in `original_source/mfst.c`'s main testing loop, restructured around the three-tier
//! retry layer in [`crate::io_retry`] instead of inline `goto`-based recovery.

use snafu::Snafu;
use tracing::warn;

use crate::device::enumerator::{DeviceSource, SearchParams};
use crate::device::geometry::DeviceGeometry;
use crate::device::hotplug::HotplugSource;
use crate::identity::IdentityBuffers;
use crate::io_retry::{IoOutcome, RetriableIo, RetriableIoError};
use crate::rng::{slice_seed, Rng};
use crate::sector_map::SectorMap;

const NUM_SLICES: usize = 16;

#[derive(Debug, Snafu)]
pub enum EnduranceError {
    #[snafu(display("fatal error during write phase: {}", source))]
    Write { source: RetriableIoError },
    #[snafu(display("fatal error during read-verify phase: {}", source))]
    Read { source: RetriableIoError },
    #[snafu(display("fatal error seeking to the next slice: {}", source))]
    Seek { source: RetriableIoError },
}

impl EnduranceError {
    pub fn abort_reason(&self) -> AbortReason {
        let (source, default_reason) = match self {
            EnduranceError::Write { source } => (source, AbortReason::WriteError),
            EnduranceError::Read { source } => (source, AbortReason::ReadError),
            EnduranceError::Seek { source } => (source, AbortReason::SeekError),
        };
        match source {
            RetriableIoError::SeekAfterReopenFailed { .. } => AbortReason::SeekError,
            RetriableIoError::RecoveryExhausted { .. } => AbortReason::DeviceRemoved,
            RetriableIoError::Cancelled => AbortReason::OperatorRequest,
            RetriableIoError::FatalAtRoundZero { .. } => default_reason,
        }
    }
}

/// Why the endurance loop stopped running rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    ReadError,
    WriteError,
    SeekError,
    FiftyPercentFailure,
    DeviceRemoved,
    OperatorRequest,
}

/// Device-search parameters that do not change across a round (everything [`SearchParams`] needs
/// except the identity buffers, which are mutated mid-round by BOD/MOD mirroring).
pub struct StaticParams<'a> {
    pub expected_reported_size: u64,
    pub sector_size: u32,
    pub physical_size: u64,
    pub preferred_path: Option<&'a str>,
    pub must_match_preferred: bool,
}

fn search_params<'a>(static_params: &StaticParams<'a>, identity: &'a IdentityBuffers) -> SearchParams<'a> {
    SearchParams {
        expected_reported_size: static_params.expected_reported_size,
        identity,
        sector_size: static_params.sector_size,
        physical_size: static_params.physical_size,
        preferred_path: static_params.preferred_path,
        must_match_preferred: static_params.must_match_preferred,
    }
}

/// Everything that persists across rounds: the sector map (sized to the *logical* sector count,
/// matching the persisted-state contract), the identity buffers, and the running counters.
pub struct EngineState {
    pub sector_map: SectorMap,
    pub identity: IdentityBuffers,
    pub rounds_completed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub base_seed: u32,
    pub first_failure_round: Option<u64>,
    pub ten_percent_failure_round: Option<u64>,
    pub twenty_five_percent_failure_round: Option<u64>,
}

impl EngineState {
    pub fn new(logical_sector_count: u64, base_seed: u32) -> Self {
        Self {
            sector_map: SectorMap::new(logical_sector_count),
            identity: IdentityBuffers::empty(),
            rounds_completed: 0,
            bytes_read: 0,
            bytes_written: 0,
            base_seed,
            first_failure_round: None,
            ten_percent_failure_round: None,
            twenty_five_percent_failure_round: None,
        }
    }
}

/// Result of one completed round.
pub struct RoundOutcome {
    /// Sectors that were previously marked bad but verified correctly this round.
    pub good_sectors_this_round: u64,
    pub aborted: Option<AbortReason>,
}

fn slice_bounds(n_p: u64, slice_sectors_base: u64, slice: usize) -> (u64, u64) {
    let start = slice_sectors_base * slice as u64;
    let end = if slice == NUM_SLICES - 1 {
        n_p
    } else {
        slice_sectors_base * (slice as u64 + 1)
    };
    (start, end)
}

fn uniform_permutation(rng: &mut Rng, n: usize) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..n).collect();
    for i in (1..n).rev() {
        let j = (rng.next() as usize) % (i + 1);
        perm.swap(i, j);
    }
    perm
}

fn first_mismatch_sector(expected: &[u8], observed: &[u8], sector_size: usize) -> Option<usize> {
    expected
        .chunks(sector_size)
        .zip(observed.chunks(sector_size))
        .position(|(e, o)| e != o)
}

/// Runs one full round (write phase, then read-verify phase) and its end-of-round bookkeeping.
/// `on_state_dirty` is invoked both whenever a BOD/MOD-overlapping write requests a save and once
/// more at round end; the caller owns the actual persistence (see [`crate::state`]).
#[allow(clippy::too_many_arguments)]
pub fn run_round(
    state: &mut EngineState,
    io: &mut RetriableIo,
    source: &dyn DeviceSource,
    hotplug: &mut dyn HotplugSource,
    static_params: &StaticParams<'_>,
    geometry: &DeviceGeometry,
    block_size: u32,
    cancel: &dyn Fn() -> bool,
    mut on_state_dirty: impl FnMut(&EngineState),
) -> Result<RoundOutcome, EnduranceError> {
    run_write_phase(
        state,
        io,
        source,
        hotplug,
        static_params,
        geometry,
        block_size,
        cancel,
        &mut on_state_dirty,
    )?;

    let good_sectors_this_round = run_read_phase(state, io, source, hotplug, static_params, geometry, block_size, cancel)?;

    let n_l = geometry.logical_sector_count();
    state.rounds_completed += 1;
    update_failure_thresholds(state, n_l);
    state.sector_map.reset_per_round_flags();
    on_state_dirty(state);

    let aborted = if state.sector_map.count_bad() * 2 >= n_l {
        Some(AbortReason::FiftyPercentFailure)
    } else {
        None
    };

    Ok(RoundOutcome { good_sectors_this_round, aborted })
}

fn update_failure_thresholds(state: &mut EngineState, n_l: u64) {
    let bad = state.sector_map.count_bad();
    if bad >= 1 && state.first_failure_round.is_none() {
        state.first_failure_round = Some(state.rounds_completed);
    }
    if bad * 10 >= n_l && state.ten_percent_failure_round.is_none() {
        state.ten_percent_failure_round = Some(state.rounds_completed);
    }
    if bad * 4 >= n_l && state.twenty_five_percent_failure_round.is_none() {
        state.twenty_five_percent_failure_round = Some(state.rounds_completed);
    }
}

#[allow(clippy::too_many_arguments)]
fn run_write_phase(
    state: &mut EngineState,
    io: &mut RetriableIo,
    source: &dyn DeviceSource,
    hotplug: &mut dyn HotplugSource,
    static_params: &StaticParams<'_>,
    geometry: &DeviceGeometry,
    block_size: u32,
    cancel: &dyn Fn() -> bool,
    on_state_dirty: &mut impl FnMut(&EngineState),
) -> Result<(), EnduranceError> {
    let sector_size = geometry.sector_size as u64;
    let n_p = geometry.physical_sector_count();
    let slice_sectors_base = n_p / NUM_SLICES as u64;
    let block_sectors = (block_size as u64 / sector_size).max(1);

    let mut permutation_rng = Rng::new(state.base_seed ^ (state.rounds_completed as u32).wrapping_mul(2654435761));
    let permutation = uniform_permutation(&mut permutation_rng, NUM_SLICES);

    for &slice in &permutation {
        let (slice_start, slice_end) = slice_bounds(n_p, slice_sectors_base, slice);

        'restart_slice: loop {
            let mut rng = Rng::new(slice_seed(state.base_seed, state.rounds_completed, slice));
            let mut cursor = slice_start;

            while cursor < slice_end {
                if cancel() {
                    return Ok(());
                }

                let chunk_sectors = block_sectors.min(slice_end - cursor);
                let mut buffer = vec![0u8; (chunk_sectors * sector_size) as usize];
                rng.fill(&mut buffer);

                let mut offset_in_chunk = 0u64;
                loop {
                    if offset_in_chunk >= chunk_sectors {
                        break;
                    }
                    let write_sector = cursor + offset_in_chunk;
                    let byte_offset = (offset_in_chunk * sector_size) as usize;
                    let remainder = &buffer[byte_offset..];

                    io.seek(write_sector * sector_size)
                        .map_err(|source| EnduranceError::Seek { source })?;
                    let params = search_params(static_params, &state.identity);
                    let outcome = io
                        .write(remainder, source, hotplug, &params, cancel)
                        .map_err(|source| EnduranceError::Write { source })?;

                    match outcome {
                        IoOutcome::Ok => {
                            let written_sectors = chunk_sectors - offset_in_chunk;
                            state.sector_map.mark_written(write_sector..write_sector + written_sectors);
                            state.bytes_written += remainder.len() as u64;
                            if state
                                .identity
                                .mirror_write(write_sector * sector_size, remainder, geometry.detected_physical_size)
                            {
                                on_state_dirty(state);
                            }
                            offset_in_chunk = chunk_sectors;
                        }
                        IoOutcome::Recovered => continue 'restart_slice,
                        IoOutcome::SectorFailure => {
                            state.sector_map.mark_bad(write_sector);
                            offset_in_chunk += 1;
                        }
                    }
                }
                cursor += chunk_sectors;
            }
            break;
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_read_phase(
    state: &mut EngineState,
    io: &mut RetriableIo,
    source: &dyn DeviceSource,
    hotplug: &mut dyn HotplugSource,
    static_params: &StaticParams<'_>,
    geometry: &DeviceGeometry,
    block_size: u32,
    cancel: &dyn Fn() -> bool,
) -> Result<u64, EnduranceError> {
    let sector_size = geometry.sector_size as u64;
    let n_p = geometry.physical_sector_count();
    let slice_sectors_base = n_p / NUM_SLICES as u64;
    let block_sectors = (block_size as u64 / sector_size).max(1);

    let mut permutation_rng =
        Rng::new((state.base_seed ^ 0x4B72_5591).wrapping_add((state.rounds_completed as u32).wrapping_mul(17)));
    let permutation = uniform_permutation(&mut permutation_rng, NUM_SLICES);

    let mut good_sectors_this_round = 0u64;

    for &slice in &permutation {
        let (slice_start, slice_end) = slice_bounds(n_p, slice_sectors_base, slice);
        let mut rng = Rng::new(slice_seed(state.base_seed, state.rounds_completed, slice));
        let mut cursor = slice_start;

        while cursor < slice_end {
            if cancel() {
                return Ok(good_sectors_this_round);
            }

            let chunk_sectors = block_sectors.min(slice_end - cursor);
            let mut expected = vec![0u8; (chunk_sectors * sector_size) as usize];
            rng.fill(&mut expected);

            let mut offset_in_chunk = 0u64;
            loop {
                if offset_in_chunk >= chunk_sectors {
                    break;
                }
                let read_sector = cursor + offset_in_chunk;
                let remaining_sectors = chunk_sectors - offset_in_chunk;
                let byte_offset = (offset_in_chunk * sector_size) as usize;
                let mut observed = vec![0u8; (remaining_sectors * sector_size) as usize];

                io.seek(read_sector * sector_size)
                    .map_err(|source| EnduranceError::Seek { source })?;
                let params = search_params(static_params, &state.identity);
                let outcome = io
                    .read(&mut observed, source, hotplug, &params, cancel)
                    .map_err(|source| EnduranceError::Read { source })?;

                match outcome {
                    IoOutcome::Recovered => continue,
                    IoOutcome::SectorFailure => {
                        state.sector_map.mark_bad(read_sector);
                        offset_in_chunk += 1;
                    }
                    IoOutcome::Ok => {
                        state.sector_map.mark_read(read_sector..read_sector + remaining_sectors);

                        match first_mismatch_sector(&expected[byte_offset..], &observed, sector_size as usize) {
                            None => {
                                state.bytes_read += observed.len() as u64;
                                for s in read_sector..read_sector + remaining_sectors {
                                    if state.sector_map.is_bad(s) {
                                        good_sectors_this_round += 1;
                                    }
                                }
                                offset_in_chunk = chunk_sectors;
                            }
                            Some(mismatch_idx) => {
                                let mismatched_sector = read_sector + mismatch_idx as u64;
                                let start = mismatch_idx * sector_size as usize;
                                let end = start + sector_size as usize;
                                if observed[start..end].iter().all(|&b| b == 0) {
                                    warn!(sector = mismatched_sector, "verification mismatch: sector reads as all-zero");
                                }
                                // Only the sectors consumed this step are new bytes; the tail
                                // past the mismatch gets re-read (and re-counted) next iteration.
                                state.bytes_read += end as u64;
                                for s in read_sector..mismatched_sector {
                                    if state.sector_map.is_bad(s) {
                                        good_sectors_this_round += 1;
                                    }
                                }
                                state.sector_map.mark_bad(mismatched_sector);
                                offset_in_chunk += mismatch_idx as u64 + 1;
                            }
                        }
                    }
                }
            }
            cursor += chunk_sectors;
        }
    }

    Ok(good_sectors_this_round)
}
