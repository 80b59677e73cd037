//! Time sources and device clock translation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::types::Time;

/// Injectable source of "now".
///
/// The default clocks are anchored to `tokio::time::Instant`, so a paused
/// tokio runtime drives timers and the reported time in lockstep.
#[derive(Clone)]
pub struct Clock {
    source: Arc<dyn Fn() -> Time + Send + Sync>,
}

impl Clock {
    /// Wall-clock milliseconds since the unix epoch.
    pub fn system() -> Self {
        Self::starting_at(chrono::Utc::now().timestamp_millis())
    }

    /// A clock reading `time` right now and advancing with the tokio clock.
    pub fn starting_at(time: Time) -> Self {
        let origin = tokio::time::Instant::now();
        Self::from_fn(move || time + origin.elapsed().as_millis() as Time)
    }

    /// Wrap an arbitrary time function (the `getCurrentTime` override).
    pub fn from_fn(f: impl Fn() -> Time + Send + Sync + 'static) -> Self {
        Self {
            source: Arc::new(f),
        }
    }

    pub fn now(&self) -> Time {
        (self.source)()
    }

    /// Real duration until `time`, zero if it has passed.
    pub fn until(&self, time: Time) -> Duration {
        millis((time - self.now()).max(0))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock").field("now", &self.now()).finish()
    }
}

pub(crate) fn millis(ms: Time) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

/// Translates conductor time into a device's own addressing scheme.
pub trait TimeTranslation: Send + Sync {
    fn to_device_time(&self, time: Time) -> String;
}

/// Maps conductor time onto a 24h `HH:MM:SS:FF` timecode.
///
/// Anchored once: `anchor_time` on the conductor clock corresponds to
/// `anchor_timecode` milliseconds into the device's day.
#[derive(Debug, Clone)]
pub struct TimecodeTranslation {
    anchor_time: Time,
    anchor_timecode: Time,
    fps: u32,
}

impl TimecodeTranslation {
    pub fn new(anchor_time: Time, anchor_timecode: Time, fps: u32) -> Self {
        Self {
            anchor_time,
            anchor_timecode,
            fps: fps.max(1),
        }
    }

    /// Anchor `now` to the current UTC time of day.
    pub fn time_of_day(now: Time, fps: u32) -> Self {
        let since_midnight = chrono::Utc::now().timestamp_millis().rem_euclid(86_400_000);
        Self::new(now, since_midnight, fps)
    }
}

impl TimeTranslation for TimecodeTranslation {
    fn to_device_time(&self, time: Time) -> String {
        let timecode = (self.anchor_timecode + (time - self.anchor_time)).rem_euclid(86_400_000);
        let frame_ms = 1000 / self.fps as Time;
        format!(
            "{:02}:{:02}:{:02}:{:02}",
            (timecode / 3_600_000) % 24,
            (timecode / 60_000) % 60,
            (timecode / 1000) % 60,
            (timecode % 1000) / frame_ms.max(1),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_starting_at_follows_tokio_time() {
        let clock = Clock::starting_at(1000);
        assert_eq!(clock.now(), 1000);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.now(), 1250);
        assert_eq!(clock.until(1300), Duration::from_millis(50));
        assert_eq!(clock.until(1000), Duration::ZERO);
    }

    #[test]
    fn test_timecode_formatting() {
        let tc = TimecodeTranslation::new(10_000, 3_600_000, 50);
        assert_eq!(tc.to_device_time(10_000), "01:00:00:00");
        assert_eq!(tc.to_device_time(10_000 + 61_500), "01:01:01:25");
        assert_eq!(tc.to_device_time(10_000 + 40), "01:00:00:02");
    }

    #[test]
    fn test_timecode_wraps_at_midnight() {
        let tc = TimecodeTranslation::new(0, 86_399_000, 25);
        assert_eq!(tc.to_device_time(2000), "00:00:01:00");
    }
}
