//! Driver tunables
//!
//! Everything in here has a sensible default, the surrounding driver only needs to touch it to
//! work around a misbehaving controller or to tighten the timeouts.

::bitflags::bitflags! {
    /// Controller errata, supplied by the (external) device quirk table
    #[derive(Debug,Copy,Clone,PartialEq,Eq,Default)]
    pub struct Quirks: u32 {
        /// Writes to `ASYNCLISTADDR` can be lost, and must be read back and retried
        const ASYNC_BASE_WRITE_RETRY = 1 << 0;
        /// The frame rollover interrupt can't be trusted, the frame counter is tracked from the housekeeping tick
        const NO_FRAME_ROLLOVER_IRQ = 1 << 1;
        /// Reset takes longer than the usual bound, allow ten times the polls
        const LONG_RESET = 1 << 2;
    }
}

#[derive(Debug,Clone)]
pub struct Config
{
    /// Minimum lead (in frames) between the hardware frame cursor and a newly linked periodic entry
    ///
    /// The effective value is the larger of this and the controller's isochronous scheduling threshold.
    pub keep_away_frames: u32,
    /// How far ahead (in frames) isochronous descriptors are linked into the periodic table
    pub isoch_window_frames: u32,
    /// Poll interval for hardware acknowledgements (doorbell, schedule enable/disable, halt, reset)
    pub rendezvous_poll_us: u32,
    /// Maximum number of polls before a hardware acknowledgement is considered lost
    pub rendezvous_max_polls: u32,
    /// Attempts made to latch `ASYNCLISTADDR` (at least 8 with [Quirks::ASYNC_BASE_WRITE_RETRY])
    pub async_base_write_retries: u32,
    /// Number of times a bus (transaction) error is re-armed before being reported
    pub bus_error_retries: u8,
    /// Default "no progress" timeout for control transfers (milliseconds, 0 = none)
    pub control_no_data_timeout_ms: u32,
    /// Default "no progress" timeout for bulk transfers (milliseconds, 0 = none)
    pub bulk_no_data_timeout_ms: u32,
    /// Time an async queue head may sit idle before it's moved to the inactive list (milliseconds, 0 = never)
    pub inactive_threshold_ms: u32,
    /// Size of each descriptor pool growth step, in pages
    pub pages_per_block: usize,
    pub quirks: Quirks,
}
impl Default for Config
{
    fn default() -> Self {
        Config {
            keep_away_frames: 2,
            isoch_window_frames: 256,
            rendezvous_poll_us: 1000,
            rendezvous_max_polls: 100,
            async_base_write_retries: 4,
            bus_error_retries: 3,
            control_no_data_timeout_ms: 5000,
            bulk_no_data_timeout_ms: 0,
            inactive_threshold_ms: 2000,
            pages_per_block: 1,
            quirks: Quirks::empty(),
        }
    }
}
impl Config
{
    /// Number of `ASYNCLISTADDR` write attempts, taking quirks into account
    pub(crate) fn async_base_attempts(&self) -> u32 {
        if self.quirks.contains(Quirks::ASYNC_BASE_WRITE_RETRY) {
            self.async_base_write_retries.max(8)
        }
        else {
            self.async_base_write_retries.max(1)
        }
    }
    /// Poll ceiling for controller reset
    pub(crate) fn reset_max_polls(&self) -> u32 {
        if self.quirks.contains(Quirks::LONG_RESET) {
            self.rendezvous_max_polls.saturating_mul(10)
        }
        else {
            self.rendezvous_max_polls
        }
    }
    /// Isochronous window, clamped so that two windows never alias the same periodic table slot
    pub(crate) fn isoch_window(&self, keep_away: u32) -> u32 {
        self.isoch_window_frames.clamp(keep_away + 1, crate::PERIODIC_SIZE as u32 - 1)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn quirk_attempts()
    {
        let mut c = Config::default();
        assert_eq!(c.async_base_attempts(), 4);
        c.async_base_write_retries = 0;
        assert_eq!(c.async_base_attempts(), 1);
        c.quirks |= Quirks::ASYNC_BASE_WRITE_RETRY;
        assert_eq!(c.async_base_attempts(), 8);
        c.async_base_write_retries = 20;
        assert_eq!(c.async_base_attempts(), 20);
        assert_eq!(c.reset_max_polls(), c.rendezvous_max_polls);
        c.quirks |= Quirks::LONG_RESET;
        assert_eq!(c.reset_max_polls(), c.rendezvous_max_polls * 10);
    }

    #[test]
    fn window_clamped()
    {
        let mut c = Config::default();
        c.isoch_window_frames = 5000;
        assert_eq!(c.isoch_window(4), 1023);
        c.isoch_window_frames = 1;
        assert_eq!(c.isoch_window(4), 5);
    }
}
