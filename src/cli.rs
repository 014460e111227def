//! Command-line surface.
//!
//! Grounded in `original_source/mfst.c`'s `getopt_long` table, which fixes the long flag names
//! this mirrors exactly.

use std::path::PathBuf;

use clap::Parser;

const DEFAULT_LOCKFILE: &str = "mfst.lock";
const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

/// A destructive wear-endurance stress tester for block storage devices.
#[derive(Debug, Parser)]
#[command(name = "blockwear", version, about, long_about = None)]
pub struct Cli {
    /// Path to the block device under test. Required unless `--state-file` names an existing,
    /// loadable state file (in which case the device is re-located by identity).
    pub device: Option<PathBuf>,

    /// Append CSV statistics to this file at `--stats-interval` cadence.
    #[arg(long = "stats-file", value_name = "PATH")]
    pub stats_file: Option<PathBuf>,

    /// Seconds between CSV stats rows.
    #[arg(long = "stats-interval", value_name = "SECONDS", default_value_t = DEFAULT_STATS_INTERVAL_SECS)]
    pub stats_interval: u64,

    /// Write structured logs to this file, in addition to stderr.
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Run the optimal-block-size probe before the endurance loop.
    #[arg(short = 'b', long = "probe-for-block-size")]
    pub probe_for_block_size: bool,

    /// Disable the interactive curses UI (headless operation).
    #[arg(short = 'n', long = "no-curses")]
    pub no_curses: bool,

    /// Advisory lockfile path, coordinating with any other process exercising this device.
    #[arg(short = 'f', long = "lockfile", value_name = "PATH", default_value = DEFAULT_LOCKFILE)]
    pub lockfile: PathBuf,

    /// Resume (or create) persisted state at this path.
    #[arg(short = 't', long = "state-file", value_name = "PATH")]
    pub state_file: Option<PathBuf>,

    /// Skip the capacity probe and use this sector count as the physical size.
    #[arg(short = 'e', long = "sectors", value_name = "N")]
    pub sectors: Option<u64>,

    /// Skip the 15-second destructive-operation countdown.
    #[arg(long = "this-will-destroy-my-device")]
    pub this_will_destroy_my_device: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_path_and_defaults() {
        let cli = Cli::parse_from(["blockwear", "/dev/sdx"]);
        assert_eq!(cli.device, Some(PathBuf::from("/dev/sdx")));
        assert_eq!(cli.lockfile, PathBuf::from(DEFAULT_LOCKFILE));
        assert_eq!(cli.stats_interval, DEFAULT_STATS_INTERVAL_SECS);
        assert!(!cli.this_will_destroy_my_device);
    }

    #[test]
    fn parses_long_flags() {
        let cli = Cli::parse_from([
            "blockwear",
            "/dev/sdx",
            "--stats-file",
            "stats.csv",
            "--stats-interval",
            "30",
            "--log-file",
            "run.log",
            "--probe-for-block-size",
            "--no-curses",
            "--this-will-destroy-my-device",
        ]);
        assert_eq!(cli.stats_file, Some(PathBuf::from("stats.csv")));
        assert_eq!(cli.stats_interval, 30);
        assert_eq!(cli.log_file, Some(PathBuf::from("run.log")));
        assert!(cli.probe_for_block_size);
        assert!(cli.no_curses);
        assert!(cli.this_will_destroy_my_device);
    }

    #[test]
    fn state_file_without_device_is_accepted() {
        let cli = Cli::parse_from(["blockwear", "--state-file", "state.json"]);
        assert!(cli.device.is_none());
        assert_eq!(cli.state_file, Some(PathBuf::from("state.json")));
    }
}
