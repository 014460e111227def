//! CSV stats file emitter: one header row, then one row per `--stats-interval` tick.
//!
//! Grounded in the same delta-bookkeeping pattern used elsewhere in this codebase for internal
//! metrics counters, adapted to a flat CSV sink rather than a `metrics`-crate registry since there
//! is no scrape endpoint here.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum StatsError {
    #[snafu(display("failed to open stats file: {}", source))]
    Open { source: io::Error },
    #[snafu(display("failed to write stats row: {}", source))]
    Write { source: io::Error },
}

const HEADER: &str = "timestamp,rounds_completed,delta_bytes_written,total_bytes_written,write_rate,delta_bytes_read,total_bytes_read,read_rate,delta_bad_sectors,total_bad_sectors,bad_sector_rate";

/// A single interval's worth of engine counters, as observed by the caller at tick time.
#[derive(Debug, Clone, Copy)]
pub struct StatsSample {
    pub timestamp_unix: u64,
    pub rounds_completed: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub bad_sectors: u64,
}

/// Appends one CSV row per tick, computing deltas against the previous sample and rates against
/// the configured interval.
pub struct StatsWriter {
    file: File,
    interval_secs: u64,
    previous: Option<StatsSample>,
}

impl StatsWriter {
    /// Opens `path` for append, writing the header row only if the file is newly created (empty).
    pub fn open(path: &Path, interval_secs: u64) -> Result<Self, StatsError> {
        let existed = path.exists() && std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| StatsError::Open { source })?;
        if !existed {
            writeln!(file, "{HEADER}").map_err(|source| StatsError::Write { source })?;
        }
        Ok(Self { file, interval_secs, previous: None })
    }

    /// Appends one row for `sample`, computing deltas against the last call (zero deltas on the
    /// first).
    pub fn record(&mut self, sample: StatsSample) -> Result<(), StatsError> {
        let previous = self.previous.unwrap_or(StatsSample {
            timestamp_unix: sample.timestamp_unix,
            rounds_completed: sample.rounds_completed,
            bytes_written: sample.bytes_written,
            bytes_read: sample.bytes_read,
            bad_sectors: sample.bad_sectors,
        });

        let delta_written = sample.bytes_written.saturating_sub(previous.bytes_written);
        let delta_read = sample.bytes_read.saturating_sub(previous.bytes_read);
        let delta_bad = sample.bad_sectors.saturating_sub(previous.bad_sectors);
        let interval = self.interval_secs.max(1) as f64;

        writeln!(
            self.file,
            "{},{},{},{},{:.2},{},{},{:.2},{},{},{:.4}",
            sample.timestamp_unix,
            sample.rounds_completed,
            delta_written,
            sample.bytes_written,
            delta_written as f64 / interval,
            delta_read,
            sample.bytes_read,
            delta_read as f64 / interval,
            delta_bad,
            sample.bad_sectors,
            delta_bad as f64 / interval,
        )
        .map_err(|source| StatsError::Write { source })?;

        self.previous = Some(sample);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn header_is_written_once_and_rows_accumulate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.csv");

        {
            let mut writer = StatsWriter::open(&path, 60).unwrap();
            writer
                .record(StatsSample {
                    timestamp_unix: 1000,
                    rounds_completed: 1,
                    bytes_written: 1_000_000,
                    bytes_read: 900_000,
                    bad_sectors: 0,
                })
                .unwrap();
            writer
                .record(StatsSample {
                    timestamp_unix: 1060,
                    rounds_completed: 2,
                    bytes_written: 2_500_000,
                    bytes_read: 2_000_000,
                    bad_sectors: 3,
                })
                .unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("1060,2,1500000,2500000"));
    }

    #[test]
    fn reopening_an_existing_file_does_not_duplicate_the_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.csv");
        {
            let mut writer = StatsWriter::open(&path, 60).unwrap();
            writer
                .record(StatsSample {
                    timestamp_unix: 1,
                    rounds_completed: 1,
                    bytes_written: 10,
                    bytes_read: 10,
                    bad_sectors: 0,
                })
                .unwrap();
        }
        {
            let mut writer = StatsWriter::open(&path, 60).unwrap();
            writer
                .record(StatsSample {
                    timestamp_unix: 2,
                    rounds_completed: 2,
                    bytes_written: 20,
                    bytes_read: 20,
                    bad_sectors: 0,
                })
                .unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches(HEADER).count(), 1);
    }
}
