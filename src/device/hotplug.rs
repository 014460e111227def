//! Reconnect watcher: blocks until a device matching the expected identity reappears.

use std::thread::sleep;
use std::time::Duration;

use tracing::info;

use super::enumerator::{find_device, DeviceSource, EnumeratedDevice, SearchParams};

/// Polling interval for synthetic/polling hot-plug backends.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A stream of block-device hot-plug arrival events. The real backend polls `/sys/class/block`;
/// tests inject synthetic arrivals.
pub trait HotplugSource {
    /// Blocks (or, for a polling backend, sleeps one [`POLL_INTERVAL`]) until there is reason to
    /// believe a new block device may have arrived, then returns. Does not itself identify which
    /// device arrived -- the caller re-runs the §4.4 acceptance test against the whole candidate
    /// set, since polling backends cannot cheaply diff "what's new".
    fn wait_for_arrival(&mut self, cancel: &dyn Fn() -> bool) -> ArrivalWait;
}

pub enum ArrivalWait {
    /// An arrival event fired (or the poll interval elapsed); try matching again.
    Woke,
    /// The caller's cancellation predicate fired; give up.
    Cancelled,
}

/// Polls `/sys/class/block` every [`POLL_INTERVAL`] -- the production backend. A socket-based
/// `libudev` monitor would also satisfy this trait, but a 100 ms polling contract is already
/// simple enough that polling sysfs directly avoids pulling in `libudev`.
pub struct PollingHotplugSource;

impl HotplugSource for PollingHotplugSource {
    fn wait_for_arrival(&mut self, cancel: &dyn Fn() -> bool) -> ArrivalWait {
        sleep(POLL_INTERVAL);
        if cancel() {
            ArrivalWait::Cancelled
        } else {
            ArrivalWait::Woke
        }
    }
}

/// Blocks until a device re-matching `params` arrives. No timeout; the caller
/// is expected to wrap this with external cancellation via `cancel`.
pub fn wait_for_device_reconnect(
    source: &dyn DeviceSource,
    hotplug: &mut dyn HotplugSource,
    params: &SearchParams<'_>,
    cancel: &dyn Fn() -> bool,
) -> Option<EnumeratedDevice> {
    loop {
        if let Ok(device) = find_device(source, params) {
            info!(path = %device.path, "device reconnected");
            return Some(device);
        }
        match hotplug.wait_for_arrival(cancel) {
            ArrivalWait::Woke => continue,
            ArrivalWait::Cancelled => return None,
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use super::*;
    use std::cell::Cell;

    /// A [`HotplugSource`] that fires a fixed number of "arrival" wake-ups, then reports
    /// cancellation -- lets tests bound how long `wait_for_device_reconnect` loops before the
    /// candidate set is expected to match.
    pub struct FakeHotplugSource {
        remaining_wakeups: Cell<u32>,
    }

    impl FakeHotplugSource {
        pub fn new(wakeups: u32) -> Self {
            Self {
                remaining_wakeups: Cell::new(wakeups),
            }
        }
    }

    impl HotplugSource for FakeHotplugSource {
        fn wait_for_arrival(&mut self, cancel: &dyn Fn() -> bool) -> ArrivalWait {
            if cancel() {
                return ArrivalWait::Cancelled;
            }
            let remaining = self.remaining_wakeups.get();
            if remaining == 0 {
                return ArrivalWait::Cancelled;
            }
            self.remaining_wakeups.set(remaining - 1);
            ArrivalWait::Woke
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeHotplugSource;
    use super::*;
    use crate::device::testing::FakeDeviceSource;
    use crate::identity::IdentityBuffers;

    #[test]
    fn reconnect_succeeds_once_device_reappears() {
        let mut identity = IdentityBuffers::empty();
        identity.bod = Box::new([0x77; crate::identity::BOD_MOD_SIZE]);

        let mut source = FakeDeviceSource::new();
        source.add_device("/dev/sdx", 4 * 1024 * 1024, 512, |dev| {
            dev.write_at(0, &[0x77; crate::identity::BOD_MOD_SIZE]);
        });

        let params = SearchParams {
            expected_reported_size: 4 * 1024 * 1024,
            identity: &identity,
            sector_size: 512,
            physical_size: 4 * 1024 * 1024,
            preferred_path: None,
            must_match_preferred: false,
        };

        let mut hotplug = FakeHotplugSource::new(5);
        let found = wait_for_device_reconnect(&source, &mut hotplug, &params, &|| false);
        assert!(found.is_some());
    }

    #[test]
    fn cancellation_stops_the_wait() {
        let identity = IdentityBuffers::empty();
        let source = FakeDeviceSource::new();
        let params = SearchParams {
            expected_reported_size: 4 * 1024 * 1024,
            identity: &identity,
            sector_size: 512,
            physical_size: 4 * 1024 * 1024,
            preferred_path: None,
            must_match_preferred: false,
        };

        let mut hotplug = FakeHotplugSource::new(1000);
        let found = wait_for_device_reconnect(&source, &mut hotplug, &params, &|| true);
        assert!(found.is_none());
    }
}
