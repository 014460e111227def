//! Process entrypoint: parses the CLI, shows the destructive-operation countdown, wires up
//! logging and the advisory lockfile, then drives the probe pipeline (enumerator -> capacity
//! probe -> block-size probe -> performance probe -> endurance loop).
//!
//! Kept thin by design: every decision with a correctness contract lives in `lib.rs`'s modules,
//! unit-tested there. This file only sequences them and bridges CLI/file-system/signal concerns.

use std::io::Write as _;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing::{error, info, warn};

use blockwear::block_size_probe::{probe_optimal_block_size, DEFAULT_SWEEP_BYTES};
use blockwear::capacity_probe::{probe_capacity, CapacityProbeError};
use blockwear::cli::Cli;
use blockwear::config::Config;
use blockwear::device::enumerator::{find_device, DeviceSource, SearchParams};
use blockwear::device::geometry::DeviceGeometry;
use blockwear::device::hotplug::PollingHotplugSource;
use blockwear::device::sysfs::SysfsDeviceSource;
use blockwear::endurance::{run_round, AbortReason, EngineState, StaticParams};
use blockwear::identity::IdentityBuffers;
use blockwear::io_retry::RetriableIo;
use blockwear::lockfile::Lockfile;
use blockwear::logging;
use blockwear::performance_probe::{probe_performance, PerformanceResult, DEFAULT_DURATION};
use blockwear::speed_class::classify_speed;
use blockwear::state::{
    PersistedDeviceInfo, PersistedGeometry, PersistedProgramOptions, PersistedState,
};
use blockwear::stats::{StatsSample, StatsWriter};

const COUNTDOWN_SECS: u64 = 15;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config: Config = cli.into();

    if !config.has_a_target() {
        eprintln!("error: a device path or --state-file is required");
        return ExitCode::FAILURE;
    }

    install_sigint_handler();

    if !config.this_will_destroy_my_device && !run_countdown() {
        eprintln!("aborted: operator cancelled the destructive-operation countdown");
        return ExitCode::FAILURE;
    }

    let _logging_guard = match logging::init(config.log_file_path()) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("error: failed to initialize logging: {error}");
            return ExitCode::FAILURE;
        }
    };

    match run(&config) {
        Ok(outcome) => {
            info!(
                rounds_completed = outcome.rounds_completed,
                abort_reason = ?outcome.abort_reason,
                "run finished"
            );
            if outcome.graceful() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(error) => {
            error!(%error, "fatal error during setup");
            ExitCode::FAILURE
        }
    }
}

static CANCEL_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_signal: libc::c_int) {
    CANCEL_REQUESTED.store(true, Ordering::SeqCst);
}

fn cancel_requested() -> bool {
    CANCEL_REQUESTED.load(Ordering::SeqCst)
}

/// Installs a SIGINT handler that flips [`CANCEL_REQUESTED`]. Every long-running phase below
/// threads a `&dyn Fn() -> bool` cancellation predicate through instead of owning signal state
/// itself; this flag and the advisory lockfile are the only two process-wide globals.
fn install_sigint_handler() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // Safety: `handle_sigint` only performs an atomic store, which is async-signal-safe.
    let _ = unsafe { signal(Signal::SIGINT, SigHandler::Handler(handle_sigint)) };
}

/// Counts down from [`COUNTDOWN_SECS`], printing the remaining time each second. Returns `false`
/// if the operator hits Ctrl-C during the countdown (the handler is installed before this runs,
/// so an early Ctrl-C is honored rather than ignored).
fn run_countdown() -> bool {
    eprintln!(
        "WARNING: this will destroy all data on the target device. Press Ctrl-C now to abort."
    );
    for remaining in (1..=COUNTDOWN_SECS).rev() {
        if cancel_requested() {
            eprintln!();
            return false;
        }
        eprint!("\rstarting in {remaining:2} seconds... ");
        std::io::stderr().flush().ok();
        sleep(Duration::from_secs(1));
    }
    eprintln!();
    !cancel_requested()
}

struct RunOutcome {
    abort_reason: AbortReason,
    rounds_completed: u64,
}

impl RunOutcome {
    fn graceful(&self) -> bool {
        matches!(
            self.abort_reason,
            AbortReason::FiftyPercentFailure | AbortReason::OperatorRequest
        )
    }
}

fn run(config: &Config) -> anyhow::Result<RunOutcome> {
    let lockfile = Lockfile::open(&config.lockfile)?;
    lockfile.lock()?;

    let device_source = SysfsDeviceSource::new();
    let mut hotplug = PollingHotplugSource;
    let cancel: &dyn Fn() -> bool = &cancel_requested;

    let loaded = match &config.state_file {
        Some(path) => PersistedState::load(path).unwrap_or_else(|error| {
            warn!(%error, "state file rejected; proceeding as if no state existed");
            None
        }),
        None => None,
    };

    if config.device.is_none() && loaded.is_none() {
        anyhow::bail!("no device path given, and no state file to resume identity from");
    }

    let (mut geometry, identity) = match &loaded {
        Some(state) => {
            let identity = state.decode_identity()?;
            let geometry = DeviceGeometry::new(
                state.device_geometry.sector_size,
                state.device_geometry.reported_size,
                state.device_geometry.detected_size,
                state.device_geometry.sector_size,
                128,
            );
            (geometry, identity)
        }
        None => {
            let path = config.device.as_ref().expect("checked above");
            let geometry = device_source.discover_geometry(&path_str(path))?;
            (geometry, IdentityBuffers::empty())
        }
    };

    let device_uuid = loaded
        .as_ref()
        .and_then(|state| state.device_uuid.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let rounds_completed = loaded.as_ref().map_or(0, |state| state.state.rounds_completed);

    let handle = if let Some(path) = &config.device {
        device_source.open_read_write(&path_str(path))?
    } else {
        let params = SearchParams {
            expected_reported_size: geometry.reported_size,
            identity: &identity,
            sector_size: geometry.sector_size,
            physical_size: geometry.detected_physical_size,
            preferred_path: None,
            must_match_preferred: false,
        };
        find_device(&device_source, &params)?.handle
    };

    let mut io = RetriableIo::new(handle, rounds_completed);

    let device_info = match &loaded {
        Some(state) => state.device_info.clone(),
        None => {
            let static_params = StaticParams {
                expected_reported_size: geometry.reported_size,
                sector_size: geometry.sector_size,
                physical_size: geometry.detected_physical_size,
                preferred_path: config.device.as_deref().and_then(|p| p.to_str()),
                must_match_preferred: false,
            };
            let params = SearchParams {
                expected_reported_size: static_params.expected_reported_size,
                identity: &identity,
                sector_size: static_params.sector_size,
                physical_size: static_params.physical_size,
                preferred_path: static_params.preferred_path,
                must_match_preferred: static_params.must_match_preferred,
            };

            let physical_size = match config.sectors {
                Some(sectors) => sectors * u64::from(geometry.sector_size),
                None => {
                    let seed = wall_clock_seed();
                    match probe_capacity(&mut io, &device_source, &mut hotplug, &params, &geometry, seed, cancel) {
                        Ok(result) => {
                            if result.fake_flash {
                                warn!(
                                    physical_size = result.physical_size,
                                    reported_size = geometry.reported_size,
                                    "fake flash detected: device advertises more capacity than it has"
                                );
                            }
                            result.physical_size
                        }
                        Err(CapacityProbeError::FirstSectorUnstable) => {
                            warn!("first sector unstable; falling back to the reported size");
                            geometry.reported_size
                        }
                        Err(other) => return Err(other.into()),
                    }
                }
            };
            geometry = geometry.with_detected_physical_size(physical_size);

            let params = SearchParams {
                expected_reported_size: geometry.reported_size,
                identity: &identity,
                sector_size: geometry.sector_size,
                physical_size: geometry.detected_physical_size,
                preferred_path: static_params.preferred_path,
                must_match_preferred: false,
            };

            let block_size = if config.probe_for_block_size {
                probe_optimal_block_size(&mut io, &device_source, &mut hotplug, &params, &geometry, DEFAULT_SWEEP_BYTES, cancel)?
            } else {
                geometry.preferred_block_size.max(geometry.sector_size)
            };

            let performance = probe_performance(
                &mut io,
                &device_source,
                &mut hotplug,
                &params,
                &geometry,
                block_size,
                DEFAULT_DURATION,
                cancel,
            )?;
            log_speed_class(&performance);

            PersistedDeviceInfo {
                block_size,
                sequential_read_speed: performance.sequential_read_bytes_per_sec,
                sequential_write_speed: performance.sequential_write_bytes_per_sec,
                random_read_iops: performance.random_read_iops,
                random_write_iops: performance.random_write_iops,
            }
        }
    };

    let n_l = geometry.logical_sector_count();
    let mut engine = match &loaded {
        Some(state) => EngineState {
            sector_map: state.decode_sector_map(n_l)?,
            identity,
            rounds_completed: state.state.rounds_completed,
            bytes_read: state.state.bytes_read,
            bytes_written: state.state.bytes_written,
            base_seed: wall_clock_seed(),
            first_failure_round: state.state.first_failure_round,
            ten_percent_failure_round: state.state.ten_percent_failure_round,
            twenty_five_percent_failure_round: state.state.twenty_five_percent_failure_round,
        },
        None => EngineState::new(n_l, wall_clock_seed()),
    };

    let static_params = StaticParams {
        expected_reported_size: geometry.reported_size,
        sector_size: geometry.sector_size,
        physical_size: geometry.detected_physical_size,
        preferred_path: config.device.as_deref().and_then(|p| p.to_str()),
        must_match_preferred: false,
    };

    // Probes are timing-sensitive and cooperate with other processes via the lockfile; the
    // endurance loop itself is long-running and does not hold it.
    lockfile.unlock()?;

    let mut stats_writer = config
        .stats_file
        .as_deref()
        .map(|path| StatsWriter::open(path, config.stats_interval_secs))
        .transpose()?;
    let mut last_tick = Instant::now();
    let stats_interval = Duration::from_secs(config.stats_interval_secs.max(1));

    let program_options = PersistedProgramOptions {
        disable_curses: config.no_curses,
        stats_file: config.stats_file.as_ref().map(|p| p.display().to_string()),
        log_file: config.log_file.as_ref().map(|p| p.display().to_string()),
        lock_file: config.lockfile.display().to_string(),
        stats_interval: config.stats_interval_secs,
    };
    let persisted_geometry = PersistedGeometry {
        reported_size: geometry.reported_size,
        detected_size: geometry.detected_physical_size,
        sector_size: geometry.sector_size,
    };
    let state_path = config.state_file.clone();
    let block_size = device_info.block_size;

    let save = |engine: &EngineState| {
        let Some(path) = state_path.as_deref() else { return };
        let document = PersistedState::build(
            Some(device_uuid.clone()),
            persisted_geometry.clone(),
            device_info.clone(),
            program_options.clone(),
            &engine.sector_map,
            &engine.identity,
            engine.rounds_completed,
            engine.bytes_read,
            engine.bytes_written,
            engine.first_failure_round,
            engine.ten_percent_failure_round,
            engine.twenty_five_percent_failure_round,
        );
        if let Err(error) = document.save(path) {
            warn!(%error, "failed to persist state snapshot");
        }
    };

    let abort_reason = loop {
        io.set_rounds_completed(engine.rounds_completed);
        let outcome = run_round(
            &mut engine,
            &mut io,
            &device_source,
            &mut hotplug,
            &static_params,
            &geometry,
            block_size,
            cancel,
            &save,
        )?;
        info!(
            rounds_completed = engine.rounds_completed,
            bad_sectors = engine.sector_map.count_bad(),
            good_sectors_this_round = outcome.good_sectors_this_round,
            "round complete"
        );

        if let Some(writer) = stats_writer.as_mut() {
            if last_tick.elapsed() >= stats_interval {
                writer.record(StatsSample {
                    timestamp_unix: unix_timestamp(),
                    rounds_completed: engine.rounds_completed,
                    bytes_written: engine.bytes_written,
                    bytes_read: engine.bytes_read,
                    bad_sectors: engine.sector_map.count_bad(),
                })?;
                last_tick = Instant::now();
            }
        }

        if let Some(reason) = outcome.aborted {
            break reason;
        }
        if cancel_requested() {
            break AbortReason::OperatorRequest;
        }
    };

    Ok(RunOutcome {
        abort_reason,
        rounds_completed: engine.rounds_completed,
    })
}

fn path_str(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

fn log_speed_class(performance: &PerformanceResult) {
    let classes = classify_speed(performance.sequential_write_bytes_per_sec);
    let labels: Vec<&str> = classes.iter().map(|c| c.label()).collect();
    info!(
        sequential_write_bytes_per_sec = performance.sequential_write_bytes_per_sec,
        sequential_read_bytes_per_sec = performance.sequential_read_bytes_per_sec,
        random_write_iops = performance.random_write_iops,
        random_read_iops = performance.random_read_iops,
        speed_classes = ?labels,
        "performance probe complete"
    );
}

fn wall_clock_seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ (d.as_secs() as u32))
        .unwrap_or(0xC0FFEE)
}

fn unix_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
