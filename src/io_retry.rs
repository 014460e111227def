//! Retriable I/O layer: seek/read/write wrapped with op-retry, bus-reset, and
//! reconnect escalation.
//!
//! The source threads a boolean out-flag through every write to signal "recovered from
//! disconnect, restart your loop"; here that's a result variant
//! instead (ok / recovered / sector failure / fatal), which the endurance loop pattern-matches on.

use std::io;
use std::time::Duration;

use snafu::Snafu;
use tracing::{error, warn};

use crate::device::enumerator::{find_device, DeviceSource, SearchParams};
use crate::device::hotplug::{wait_for_device_reconnect, HotplugSource};
use crate::device::BlockDevice;

pub const MAX_OP_RETRIES: u32 = 5;
pub const MAX_RESET_RETRIES: u32 = 5;

#[derive(Debug, Snafu)]
pub enum RetriableIoError {
    #[snafu(display("fatal I/O error at round 0 (no recovery permitted before round 1): {}", source))]
    FatalAtRoundZero { source: io::Error },
    #[snafu(display("seek after reopen failed, which is fatal to the operation: {}", source))]
    SeekAfterReopenFailed { source: io::Error },
    #[snafu(display("device reset and reconnect both exhausted: {}", source))]
    RecoveryExhausted { source: io::Error },
    #[snafu(display("operator cancelled while waiting for device reconnect"))]
    Cancelled,
}

/// Outcome of a retriable read/write. Sector-level failures are absorbed here and signaled to the
/// caller so it can mark the sector bad and continue.
pub enum IoOutcome {
    Ok,
    /// Succeeded, but only after a reconnect occurred mid-operation -- the caller restarts
    /// whatever unit of work (a slice) was in flight.
    Recovered,
    /// Permanent sector-level failure; the handle is still valid, and the caller should mark the
    /// offending sector bad and move on.
    SectorFailure,
}

/// Holds the single owned device handle plus the bookkeeping the three-tier recovery policy
/// needs: the current round (to gate whether recovery is even permitted) and the offset the next
/// operation expects to be seeked to after any reopen.
pub struct RetriableIo {
    device: Box<dyn BlockDevice>,
    rounds_completed: u64,
    current_offset: u64,
}

impl RetriableIo {
    pub fn new(device: Box<dyn BlockDevice>, rounds_completed: u64) -> Self {
        Self {
            device,
            rounds_completed,
            current_offset: 0,
        }
    }

    pub fn set_rounds_completed(&mut self, rounds_completed: u64) {
        self.rounds_completed = rounds_completed;
    }

    pub fn device_mut(&mut self) -> &mut dyn BlockDevice {
        self.device.as_mut()
    }

    fn recovery_permitted(&self) -> bool {
        // Before round 1 completes, BOD/MOD do not yet reflect committed data, so identity cannot
        // be verified and reconnect would risk misidentifying a device.
        self.rounds_completed >= 1
    }

    pub fn seek(&mut self, offset: u64) -> Result<(), RetriableIoError> {
        self.current_offset = offset;
        self.run_tiers(None, |device| device.seek(offset))
            .map(|_: IoOutcome| ())
    }

    pub fn read(
        &mut self,
        buf: &mut [u8],
        source: &dyn DeviceSource,
        hotplug: &mut dyn HotplugSource,
        params: &SearchParams<'_>,
        cancel: &dyn Fn() -> bool,
    ) -> Result<IoOutcome, RetriableIoError> {
        let offset = self.current_offset;
        let len = buf.len();
        let outcome = self.run_tiers(Some((source, params, hotplug, cancel)), |device| {
            device.read(buf)
        });
        if outcome.is_ok() {
            self.current_offset = offset + len as u64;
        }
        outcome
    }

    pub fn write(
        &mut self,
        buf: &[u8],
        source: &dyn DeviceSource,
        hotplug: &mut dyn HotplugSource,
        params: &SearchParams<'_>,
        cancel: &dyn Fn() -> bool,
    ) -> Result<IoOutcome, RetriableIoError> {
        let offset = self.current_offset;
        let len = buf.len();
        let outcome = self.run_tiers(Some((source, params, hotplug, cancel)), |device| {
            device.write(buf)
        });
        if outcome.is_ok() {
            self.current_offset = offset + len as u64;
        }
        outcome
    }

    /// Drives the three-tier escalation for one logical operation. `op` is retried in place;
    /// `recovery` (when supplied) carries what's needed to re-locate the device after a reset or
    /// disconnect.
    #[allow(clippy::type_complexity)]
    fn run_tiers(
        &mut self,
        recovery: Option<(
            &dyn DeviceSource,
            &SearchParams<'_>,
            &mut dyn HotplugSource,
            &dyn Fn() -> bool,
        )>,
        mut op: impl FnMut(&mut dyn BlockDevice) -> io::Result<()>,
    ) -> Result<IoOutcome, RetriableIoError> {
        let saved_offset = self.current_offset;

        // Ordering: absence is checked first.
        if !self.device.is_present() {
            return self.escalate_to_reconnect(recovery, saved_offset, None);
        }

        let mut op_retries = 0;
        loop {
            match op(self.device.as_mut()) {
                Ok(()) => return Ok(IoOutcome::Ok),
                Err(error) => {
                    if !self.device.is_present() {
                        return self.escalate_to_reconnect(recovery, saved_offset, Some(error));
                    }

                    op_retries += 1;
                    if op_retries < MAX_OP_RETRIES {
                        warn!(attempt = op_retries, %error, "transient I/O error, retrying");
                        // A partial read_exact/write_all can advance the file position before
                        // failing; reseek so the retry lands at the offset the caller asked for.
                        if self.device.seek(saved_offset).is_err() {
                            if !self.recovery_permitted() {
                                return Err(RetriableIoError::FatalAtRoundZero { source: error });
                            }
                            return self.escalate_to_reset(recovery, saved_offset, &mut op);
                        }
                        self.current_offset = saved_offset;
                        continue;
                    }

                    if !self.recovery_permitted() {
                        return Err(RetriableIoError::FatalAtRoundZero { source: error });
                    }

                    return self.escalate_to_reset(recovery, saved_offset, &mut op);
                }
            }
        }
    }

    /// Bus-reset tier: after a reset, the original operation is retried in place (not just
    /// reseeked) up to [`MAX_RESET_RETRIES`] times. A device that remains present throughout but
    /// whose operation keeps failing is a sector-level media failure, not a transport fault --
    /// the handle is still good, so the caller marks the sector bad and moves on rather than
    /// escalating to reconnect. Reconnect is reserved for genuine device absence.
    fn escalate_to_reset(
        &mut self,
        recovery: Option<(
            &dyn DeviceSource,
            &SearchParams<'_>,
            &mut dyn HotplugSource,
            &dyn Fn() -> bool,
        )>,
        saved_offset: u64,
        op: &mut dyn FnMut(&mut dyn BlockDevice) -> io::Result<()>,
    ) -> Result<IoOutcome, RetriableIoError> {
        for attempt in 0..MAX_RESET_RETRIES {
            match self.device.reset_bus() {
                Ok(()) => {
                    if let Some((source, params, ..)) = recovery.as_ref() {
                        if let Ok(relocated) = find_device(*source, *params) {
                            self.device = relocated.handle;
                        }
                    }
                    if !self.device.is_present() {
                        return self.escalate_to_reconnect(recovery, saved_offset, None);
                    }
                    if self.device.seek(saved_offset).is_err() {
                        // A seek failure after reopen is fatal to the operation, per the
                        // ordering rule; treat the reset as having not recovered anything.
                        continue;
                    }
                    self.current_offset = saved_offset;
                    match op(self.device.as_mut()) {
                        Ok(()) => return Ok(IoOutcome::Ok),
                        Err(_) => {
                            warn!(attempt, "device reset but the operation is still failing");
                            continue;
                        }
                    }
                }
                Err(_unsupported) => {
                    // Reset tier unavailable, but the device is still present: this is a
                    // sector-level failure, not a disconnect -- per the "Unsupported-operation"
                    // downgrade, we don't escalate to reconnect just because reset isn't
                    // supported on this bus.
                    warn!("bus reset unsupported; treating as a sector-level failure");
                    return Ok(IoOutcome::SectorFailure);
                }
            }
        }
        if self.device.is_present() {
            Ok(IoOutcome::SectorFailure)
        } else {
            self.escalate_to_reconnect(recovery, saved_offset, None)
        }
    }

    fn escalate_to_reconnect(
        &mut self,
        recovery: Option<(
            &dyn DeviceSource,
            &SearchParams<'_>,
            &mut dyn HotplugSource,
            &dyn Fn() -> bool,
        )>,
        saved_offset: u64,
        last_error: Option<io::Error>,
    ) -> Result<IoOutcome, RetriableIoError> {
        if !self.recovery_permitted() {
            return Err(RetriableIoError::FatalAtRoundZero {
                source: last_error.unwrap_or_else(|| io::Error::other("device absent at round 0")),
            });
        }

        let Some((source, params, hotplug, cancel)) = recovery else {
            return Err(RetriableIoError::RecoveryExhausted {
                source: last_error.unwrap_or_else(|| io::Error::other("device absent")),
            });
        };

        match wait_for_device_reconnect(source, hotplug, params, cancel) {
            Some(relocated) => {
                self.device = relocated.handle;
                self.reseek_after_reopen(saved_offset)?;
                Ok(IoOutcome::Recovered)
            }
            None => Err(RetriableIoError::Cancelled),
        }
    }

    fn reseek_after_reopen(&mut self, saved_offset: u64) -> Result<IoOutcome, RetriableIoError> {
        self.device
            .seek(saved_offset)
            .map_err(|source| RetriableIoError::SeekAfterReopenFailed { source })?;
        self.current_offset = saved_offset;
        Ok(IoOutcome::Ok)
    }
}

impl IoOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, IoOutcome::Ok | IoOutcome::Recovered)
    }
}

pub const RECOVERY_POLL_BACKOFF: Duration = Duration::from_millis(100);
