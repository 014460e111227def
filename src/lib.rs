//! Library surface for `blockwear`: a destructive wear-endurance stress tester for block storage
//! devices. `main.rs` is a thin driver over these modules; integration tests exercise them
//! directly.

pub mod block_size_probe;
pub mod capacity_probe;
pub mod cli;
pub mod config;
pub mod device;
pub mod endurance;
pub mod identity;
pub mod io_retry;
pub mod lockfile;
pub mod logging;
pub mod performance_probe;
pub mod rng;
pub mod sector_map;
pub mod speed_class;
pub mod state;
pub mod stats;
