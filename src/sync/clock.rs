//! Drift-corrected presentation clocks
//!
//! A [`Clock`] is anchored to a presentation timestamp at a wall-clock
//! instant and extrapolates from there at its configured speed. It tracks a
//! serial source (normally the stream's packet queue): whenever that
//! source has moved to a newer epoch than the one the clock was last set
//! in, the clock reports no value at all.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Monotonic wall-clock time in seconds
pub trait TimeSource: Send + Sync {
    fn now(&self) -> f64;
}

/// Supplies the epoch serial a clock is compared against
pub trait SerialSource: Send + Sync {
    fn current_serial(&self) -> u64;
}

/// Real monotonic time, measured from construction
pub struct SystemTimeSource {
    origin: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually driven time for simulations and tests
#[derive(Default)]
pub struct ManualTimeSource {
    now: Mutex<f64>,
}

impl ManualTimeSource {
    pub fn new(start: f64) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, seconds: f64) {
        *self.now.lock() = seconds;
    }

    pub fn advance(&self, seconds: f64) {
        *self.now.lock() += seconds;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

#[derive(Debug, Clone, Copy)]
struct ClockState {
    pts: Option<f64>,
    pts_drift: f64,
    last_updated: f64,
    speed: f64,
    paused: bool,
    serial: Option<u64>,
}

/// Presentation clock
pub struct Clock {
    name: &'static str,
    time: Arc<dyn TimeSource>,

    /// `None` means the clock tracks its own serial and is always current
    tracked: Option<Arc<dyn SerialSource>>,

    state: Mutex<ClockState>,
}

impl Clock {
    /// A clock compared against `tracked`, or against itself when `None`
    pub fn new(
        name: &'static str,
        time: Arc<dyn TimeSource>,
        tracked: Option<Arc<dyn SerialSource>>,
    ) -> Self {
        let last_updated = time.now();
        Self {
            name,
            time,
            tracked,
            state: Mutex::new(ClockState {
                pts: None,
                pts_drift: 0.0,
                last_updated,
                speed: 1.0,
                paused: false,
                serial: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current clock value, `None` when unset or stale
    pub fn now(&self) -> Option<f64> {
        let state = self.state.lock();
        self.value_locked(&state, self.time.now())
    }

    /// Value and serial read under one lock
    pub fn read(&self) -> (Option<f64>, Option<u64>) {
        let state = self.state.lock();
        (self.value_locked(&state, self.time.now()), state.serial)
    }

    /// Anchor the clock at `pts` now
    pub fn set(&self, pts: Option<f64>, serial: u64) {
        self.set_at(pts, serial, self.time.now());
    }

    /// Anchor the clock at `pts` as of wall time `time`
    pub fn set_at(&self, pts: Option<f64>, serial: u64, time: f64) {
        let mut state = self.state.lock();
        Self::anchor(&mut state, pts, Some(serial), time);
    }

    /// Change speed without a jump in the reported value
    pub fn set_speed(&self, speed: f64) {
        let mut state = self.state.lock();
        let time = self.time.now();
        let current = self.value_locked(&state, time);
        let serial = state.serial;
        Self::anchor(&mut state, current, serial, time);
        state.speed = speed;
    }

    /// Freeze or release the clock at its current value
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock();
        let time = self.time.now();
        let current = self.value_locked(&state, time);
        let serial = state.serial;
        Self::anchor(&mut state, current, serial, time);
        state.paused = paused;
    }

    /// Adopt `other`'s value when it is valid and this clock is invalid or
    /// further than `threshold` seconds away from it
    pub fn sync_to(&self, other: &Clock, threshold: f64) -> bool {
        let (other_value, other_serial) = other.read();
        let (Some(other_value), Some(other_serial)) = (other_value, other_serial) else {
            return false;
        };

        let current = self.now();
        let adopt = match current {
            None => true,
            Some(value) => (value - other_value).abs() > threshold,
        };

        if adopt {
            self.set(Some(other_value), other_serial);
        }
        adopt
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn serial(&self) -> Option<u64> {
        self.state.lock().serial
    }

    /// Wall time of the last anchor
    pub fn last_updated(&self) -> f64 {
        self.state.lock().last_updated
    }

    /// Last anchored pts, regardless of staleness
    pub fn anchor_pts(&self) -> Option<f64> {
        self.state.lock().pts
    }

    fn anchor(state: &mut ClockState, pts: Option<f64>, serial: Option<u64>, time: f64) {
        state.pts = pts;
        state.last_updated = time;
        state.pts_drift = pts.map_or(0.0, |pts| pts - time);
        state.serial = serial;
    }

    fn value_locked(&self, state: &ClockState, time: f64) -> Option<f64> {
        let serial = state.serial?;
        if let Some(source) = &self.tracked {
            if source.current_serial() != serial {
                return None;
            }
        }

        let pts = state.pts?;
        if state.paused {
            Some(pts)
        } else {
            Some(state.pts_drift + time - (time - state.last_updated) * (1.0 - state.speed))
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.state.lock();
        f.debug_struct("Clock")
            .field("name", &self.name)
            .field("pts", &state.pts)
            .field("speed", &state.speed)
            .field("paused", &state.paused)
            .field("serial", &state.serial)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct TestSerial(AtomicU64);

    impl SerialSource for TestSerial {
        fn current_serial(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn manual() -> Arc<ManualTimeSource> {
        Arc::new(ManualTimeSource::new(100.0))
    }

    #[test]
    fn test_unset_clock_is_invalid() {
        let clock = Clock::new("ext", manual(), None);
        assert_eq!(clock.now(), None);
        assert_eq!(clock.serial(), None);
    }

    #[test]
    fn test_clock_advances_with_time() {
        let time = manual();
        let clock = Clock::new("ext", time.clone(), None);
        clock.set(Some(5.0), 0);
        time.advance(0.5);
        assert!((clock.now().unwrap() - 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_stale_serial_reports_invalid() {
        let time = manual();
        let serial = Arc::new(TestSerial(AtomicU64::new(1)));
        let clock = Clock::new("video", time, Some(serial.clone() as Arc<dyn SerialSource>));

        clock.set(Some(1.0), 1);
        assert!(clock.now().is_some());

        serial.0.store(2, Ordering::SeqCst);
        assert_eq!(clock.now(), None);

        clock.set(Some(7.0), 2);
        assert_eq!(clock.now(), Some(7.0));
    }

    #[test]
    fn test_set_speed_has_no_jump() {
        let time = manual();
        let clock = Clock::new("ext", time.clone(), None);
        clock.set(Some(10.0), 0);
        time.advance(2.0);

        let before = clock.now().unwrap();
        clock.set_speed(1.5);
        let after = clock.now().unwrap();
        assert!((before - after).abs() < 1e-9);

        time.advance(2.0);
        assert!((clock.now().unwrap() - (before + 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_pause_freezes_value() {
        let time = manual();
        let clock = Clock::new("ext", time.clone(), None);
        clock.set(Some(3.0), 0);
        time.advance(1.0);

        clock.set_paused(true);
        time.advance(5.0);
        assert!((clock.now().unwrap() - 4.0).abs() < 1e-9);

        clock.set_paused(false);
        assert!((clock.last_updated() - 106.0).abs() < 1e-9);
        time.advance(1.0);
        assert!((clock.now().unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_sync_to() {
        let time = manual();
        let master = Clock::new("ext", time.clone(), None);
        let slave = Clock::new("video", time.clone(), None);

        assert!(!master.sync_to(&slave, 10.0));

        slave.set(Some(42.0), 3);
        assert!(master.sync_to(&slave, 10.0));
        assert_eq!(master.now(), Some(42.0));
        assert_eq!(master.serial(), Some(3));

        slave.set(Some(45.0), 3);
        assert!(!master.sync_to(&slave, 10.0));
        assert_eq!(master.now(), Some(42.0));

        slave.set(Some(60.0), 4);
        assert!(master.sync_to(&slave, 10.0));
        assert_eq!(master.now(), Some(60.0));
    }
}
