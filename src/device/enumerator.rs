//! Device enumerator: locates the device under test among all candidates on the system.

use std::io;

use snafu::Snafu;
use tracing::{debug, info, warn};

use super::BlockDevice;
use crate::identity::{IdentityBuffers, IdentityMatch};

/// Search parameters for [`find_device`].
pub struct SearchParams<'a> {
    pub expected_reported_size: u64,
    pub identity: &'a IdentityBuffers,
    pub sector_size: u32,
    pub physical_size: u64,
    pub preferred_path: Option<&'a str>,
    pub must_match_preferred: bool,
}

/// A source of openable device candidates. Production code lists `/sys/class/block`; tests
/// supply an in-memory fake. This indirection is what makes `find_device` unit-testable without a
/// real block device present.
pub trait DeviceSource {
    /// Every device path present on the system whose reported size equals `expected_reported_size`.
    fn candidates_by_size(&self, expected_reported_size: u64) -> Vec<String>;
    fn open_read_only(&self, path: &str) -> io::Result<Box<dyn BlockDevice>>;
    fn open_read_write(&self, path: &str) -> io::Result<Box<dyn BlockDevice>>;

    /// Discovers `path`'s geometry without regard to identity -- used once, at initial
    /// acquisition of a device named directly on the command line, before any BOD/MOD content
    /// exists to match against.
    fn discover_geometry(&self, path: &str) -> io::Result<super::DeviceGeometry>;
}

#[derive(Debug, Snafu)]
pub enum EnumeratorError {
    #[snafu(display("no block device matched the expected geometry and identity"))]
    NotFound,
    #[snafu(display("{count} candidate devices matched identity; operator disambiguation required"))]
    Ambiguous { count: usize },
    #[snafu(display("failed to open matched device read-write: {}", source))]
    ReopenFailed { source: io::Error },
}

/// A device accepted by the §4.4 acceptance test, re-opened read-write.
pub struct EnumeratedDevice {
    pub path: String,
    pub device_number: (u32, u32),
    pub handle: Box<dyn BlockDevice>,
}

/// Builds the candidate set, applies the identity
/// acceptance test to each, then resolve zero/one/many matches.
pub fn find_device(
    source: &dyn DeviceSource,
    params: &SearchParams<'_>,
) -> Result<EnumeratedDevice, EnumeratorError> {
    let candidates: Vec<String> = if params.must_match_preferred {
        params
            .preferred_path
            .map(|p| vec![p.to_string()])
            .unwrap_or_default()
    } else {
        source.candidates_by_size(params.expected_reported_size)
    };

    let mut matches = Vec::new();
    for path in candidates {
        let mut device = match source.open_read_only(&path) {
            Ok(device) => device,
            Err(error) => {
                warn!(%path, %error, "failed to open candidate device read-only");
                continue;
            }
        };
        match params
            .identity
            .compare(device.as_mut(), params.sector_size, params.physical_size)
        {
            IdentityMatch::ExactBod | IdentityMatch::ExactMod | IdentityMatch::PartialMod => {
                debug!(%path, "candidate accepted by identity comparison");
                matches.push(path);
            }
            IdentityMatch::NoMatch => {
                debug!(%path, "candidate rejected: no identity match");
            }
            IdentityMatch::IoError => {
                warn!(%path, "candidate rejected: I/O error during identity comparison");
            }
        }
    }

    let chosen = match matches.len() {
        0 => return Err(EnumeratorError::NotFound),
        1 => matches.into_iter().next().unwrap(),
        count => {
            if let Some(preferred) = params.preferred_path {
                if matches.iter().any(|m| m == preferred) {
                    preferred.to_string()
                } else {
                    return Err(EnumeratorError::Ambiguous { count });
                }
            } else {
                return Err(EnumeratorError::Ambiguous { count });
            }
        }
    };

    let handle = source
        .open_read_write(&chosen)
        .map_err(|source| EnumeratorError::ReopenFailed { source })?;
    let device_number = handle.device_number();
    info!(path = %chosen, "device matched and reopened read-write");
    Ok(EnumeratedDevice {
        path: chosen,
        device_number,
        handle,
    })
}
