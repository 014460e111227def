//! Typed configuration, built once from [`crate::cli::Cli`] and threaded by reference through
//! every phase of the run instead of re-parsing or re-deriving flags downstream.

use std::path::{Path, PathBuf};

use crate::cli::Cli;

/// The realized device-testing context for one run: everything downstream phases need, derived
/// once from the parsed command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub device: Option<PathBuf>,
    pub stats_file: Option<PathBuf>,
    pub stats_interval_secs: u64,
    pub log_file: Option<PathBuf>,
    pub probe_for_block_size: bool,
    pub no_curses: bool,
    pub lockfile: PathBuf,
    pub state_file: Option<PathBuf>,
    pub sectors: Option<u64>,
    pub this_will_destroy_my_device: bool,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            device: cli.device,
            stats_file: cli.stats_file,
            stats_interval_secs: cli.stats_interval,
            log_file: cli.log_file,
            probe_for_block_size: cli.probe_for_block_size,
            no_curses: cli.no_curses,
            lockfile: cli.lockfile,
            state_file: cli.state_file,
            sectors: cli.sectors,
            this_will_destroy_my_device: cli.this_will_destroy_my_device,
        }
    }
}

impl Config {
    /// `true` once either a device path or a resumable state file has been given; `main` rejects
    /// the run before doing any I/O otherwise.
    pub fn has_a_target(&self) -> bool {
        self.device.is_some() || self.state_file.is_some()
    }

    pub fn log_file_path(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn device_alone_is_a_valid_target() {
        let cli = Cli::parse_from(["blockwear", "/dev/sdx"]);
        let config: Config = cli.into();
        assert!(config.has_a_target());
    }

    #[test]
    fn state_file_alone_is_a_valid_target() {
        let cli = Cli::parse_from(["blockwear", "--state-file", "state.json"]);
        let config: Config = cli.into();
        assert!(config.has_a_target());
    }

    #[test]
    fn neither_is_not_a_valid_target() {
        let cli = Cli::parse_from(["blockwear"]);
        let config: Config = cli.into();
        assert!(!config.has_a_target());
    }
}
