//! Durable crash-resumable state: serialized as JSON with Base64-encoded binary fields, written
//! atomically (write-temp, rename-over) and loaded with full-document validation before any
//! program state is mutated.
//!
//! Grounded in `original_source/state.c`'s `save_state`/`load_state`, replacing its 20+ manual
//! JSON-object-build error-return sites and its parallel name/type/required/base64 property
//! arrays with `serde`-derived structs and a single post-deserialize validation pass.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::identity::{IdentityBuffers, BOD_MOD_SIZE};
use crate::sector_map::SectorMap;

#[derive(Debug, Snafu)]
pub enum StateError {
    #[snafu(display("failed to write state file: {}", source))]
    Io { source: io::Error },
    #[snafu(display("failed to serialize state: {}", source))]
    Serialize { source: serde_json::Error },
    #[snafu(display("state file is not valid JSON: {}", source))]
    Parse { source: serde_json::Error },
    #[snafu(display("state file rejected: {reason}"))]
    Invalid { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedGeometry {
    pub reported_size: u64,
    pub detected_size: u64,
    pub sector_size: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedDeviceInfo {
    pub block_size: u32,
    pub sequential_read_speed: f64,
    pub sequential_write_speed: f64,
    pub random_read_iops: f64,
    pub random_write_iops: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedProgramOptions {
    pub disable_curses: bool,
    pub stats_file: Option<String>,
    pub log_file: Option<String>,
    pub lock_file: String,
    pub stats_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEngineState {
    pub sector_map: String,
    pub beginning_of_device_data: String,
    pub middle_of_device_data: String,
    pub rounds_completed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub first_failure_round: Option<u64>,
    pub ten_percent_failure_round: Option<u64>,
    pub twenty_five_percent_failure_round: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub device_uuid: Option<String>,
    pub device_geometry: PersistedGeometry,
    pub device_info: PersistedDeviceInfo,
    pub program_options: PersistedProgramOptions,
    pub state: PersistedEngineState,
}

impl PersistedState {
    /// Builds the on-disk document from live engine values, packing the sector map and encoding
    /// the identity buffers as Base64.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        device_uuid: Option<String>,
        geometry: PersistedGeometry,
        device_info: PersistedDeviceInfo,
        program_options: PersistedProgramOptions,
        sector_map: &SectorMap,
        identity: &IdentityBuffers,
        rounds_completed: u64,
        bytes_read: u64,
        bytes_written: u64,
        first_failure_round: Option<u64>,
        ten_percent_failure_round: Option<u64>,
        twenty_five_percent_failure_round: Option<u64>,
    ) -> Self {
        Self {
            device_uuid,
            device_geometry: geometry,
            device_info,
            program_options,
            state: PersistedEngineState {
                sector_map: BASE64.encode(sector_map.pack()),
                beginning_of_device_data: BASE64.encode(identity.bod.as_slice()),
                middle_of_device_data: BASE64.encode(identity.mod_.as_slice()),
                rounds_completed,
                bytes_read,
                bytes_written,
                first_failure_round,
                ten_percent_failure_round,
                twenty_five_percent_failure_round,
            },
        }
    }

    /// Decodes and validates the Base64 sector map against `sector_count`, returning a ready
    /// [`SectorMap`]. Call only after [`validate`](Self::validate) has accepted the document.
    pub fn decode_sector_map(&self, sector_count: u64) -> Result<SectorMap, StateError> {
        let bytes = BASE64
            .decode(&self.state.sector_map)
            .map_err(|e| invalid(format!("sector_map is not valid base64: {e}")))?;
        if bytes.len() != SectorMap::packed_len(sector_count) {
            return Err(invalid(format!(
                "sector_map length {} does not match expected {} for {sector_count} sectors",
                bytes.len(),
                SectorMap::packed_len(sector_count)
            )));
        }
        Ok(SectorMap::unpack(&bytes, sector_count))
    }

    /// Decodes and validates the BOD/MOD Base64 fields into [`IdentityBuffers`]. Call only after
    /// [`validate`](Self::validate) has accepted the document.
    pub fn decode_identity(&self) -> Result<IdentityBuffers, StateError> {
        let bod = BASE64
            .decode(&self.state.beginning_of_device_data)
            .map_err(|e| invalid(format!("beginning_of_device_data is not valid base64: {e}")))?;
        let mod_ = BASE64
            .decode(&self.state.middle_of_device_data)
            .map_err(|e| invalid(format!("middle_of_device_data is not valid base64: {e}")))?;
        if bod.len() != BOD_MOD_SIZE || mod_.len() != BOD_MOD_SIZE {
            return Err(invalid("BOD/MOD fields must each decode to exactly 1 MiB".to_string()));
        }
        let mut identity = IdentityBuffers::empty();
        identity.bod.copy_from_slice(&bod);
        identity.mod_.copy_from_slice(&mod_);
        Ok(identity)
    }

    /// Validates every required field's presence, type, and size before any caller is permitted
    /// to apply this state. Rejects the whole document on the first failure; never partially
    /// applies a state.
    pub fn validate(&self) -> Result<(), StateError> {
        if self.device_geometry.reported_size == 0 {
            return Err(invalid("device_geometry.reported_size must be positive".to_string()));
        }
        if self.device_geometry.detected_size == 0 {
            return Err(invalid("device_geometry.detected_size must be positive".to_string()));
        }
        if !self.device_geometry.sector_size.is_power_of_two() {
            return Err(invalid("device_geometry.sector_size must be a power of two".to_string()));
        }
        if self.device_geometry.reported_size % u64::from(self.device_geometry.sector_size) != 0 {
            return Err(invalid("device_geometry.reported_size must be a multiple of sector_size".to_string()));
        }

        let sector_count = self.device_geometry.reported_size / u64::from(self.device_geometry.sector_size);
        let expected_map_len = SectorMap::packed_len(sector_count);
        let map_len = BASE64
            .decode(&self.state.sector_map)
            .map_err(|e| invalid(format!("sector_map is not valid base64: {e}")))?
            .len();
        if map_len != expected_map_len {
            return Err(invalid(format!(
                "sector_map length {map_len} does not match expected {expected_map_len}"
            )));
        }

        let bod_len = BASE64
            .decode(&self.state.beginning_of_device_data)
            .map_err(|e| invalid(format!("beginning_of_device_data is not valid base64: {e}")))?
            .len();
        if bod_len != BOD_MOD_SIZE {
            return Err(invalid(format!("beginning_of_device_data must decode to {BOD_MOD_SIZE} bytes")));
        }

        let mod_len = BASE64
            .decode(&self.state.middle_of_device_data)
            .map_err(|e| invalid(format!("middle_of_device_data is not valid base64: {e}")))?
            .len();
        if mod_len != BOD_MOD_SIZE {
            return Err(invalid(format!("middle_of_device_data must decode to {BOD_MOD_SIZE} bytes")));
        }

        Ok(())
    }

    /// Serializes and writes `self` to `path` atomically: a full write to `<path>.temp`, then an
    /// atomic rename over `path`.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(self).context_serialize()?;
        let temp_path = temp_path_for(path);
        {
            let mut file = File::create(&temp_path).context_io()?;
            file.write_all(&json).context_io()?;
            file.sync_all().context_io()?;
        }
        fs::rename(&temp_path, path).context_io()?;
        Ok(())
    }

    /// Parses and fully validates the document at `path`. Returns `Ok(None)` if `path` does not
    /// exist (the caller proceeds as if no state existed); never mutates caller state itself --
    /// that's left to the caller once this returns `Ok(Some(..))`.
    pub fn load(path: &Path) -> Result<Option<Self>, StateError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StateError::Io { source }),
        };
        let state: PersistedState = serde_json::from_slice(&bytes).context_parse()?;
        state.validate()?;
        Ok(Some(state))
    }
}

fn temp_path_for(path: &Path) -> std::path::PathBuf {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".temp");
    std::path::PathBuf::from(temp)
}

fn invalid(reason: String) -> StateError {
    StateError::Invalid { reason }
}

trait IoContext<T> {
    fn context_io(self) -> Result<T, StateError>;
}

impl<T> IoContext<T> for Result<T, io::Error> {
    fn context_io(self) -> Result<T, StateError> {
        self.map_err(|source| StateError::Io { source })
    }
}

trait SerializeContext<T> {
    fn context_serialize(self) -> Result<T, StateError>;
}

impl<T> SerializeContext<T> for Result<T, serde_json::Error> {
    fn context_serialize(self) -> Result<T, StateError> {
        self.map_err(|source| StateError::Serialize { source })
    }
}

trait ParseContext<T> {
    fn context_parse(self) -> Result<T, StateError>;
}

impl<T> ParseContext<T> for Result<T, serde_json::Error> {
    fn context_parse(self) -> Result<T, StateError> {
        self.map_err(|source| StateError::Parse { source })
    }
}
