//! Precision timestamps and sample-tagged time entries.

use std::cmp::Ordering;
use std::ops::{Add, AddAssign};
use std::time::{SystemTime, UNIX_EPOCH};

/// Split-precision UTC timestamp: whole seconds plus fractional seconds.
///
/// The split representation preserves sub-microsecond precision at epoch
/// scale, where a single f64 would not. `tfsec` is kept normalized to
/// `[0.0, 1.0)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionTime {
    /// Whole seconds since the UNIX epoch
    pub twsec: f64,
    /// Fractional seconds, normalized to [0.0, 1.0)
    pub tfsec: f64,
}

impl PrecisionTime {
    /// Construct from whole and fractional seconds, normalizing.
    pub fn new(twsec: f64, tfsec: f64) -> Self {
        let mut t = PrecisionTime { twsec, tfsec };
        t.normalize();
        t
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        PrecisionTime::new(since_epoch.as_secs() as f64, since_epoch.subsec_nanos() as f64 * 1e-9)
    }

    /// A sentinel "not set" timestamp, used by string/file streams that
    /// carry no timing.
    pub fn not_set() -> Self {
        PrecisionTime { twsec: 0.0, tfsec: 0.0 }
    }

    /// Total seconds as a single f64 (lossy; for display and deltas only).
    pub fn as_secs_f64(&self) -> f64 {
        self.twsec + self.tfsec
    }

    fn normalize(&mut self) {
        if self.tfsec >= 1.0 || self.tfsec < 0.0 {
            let whole = self.tfsec.floor();
            self.twsec += whole;
            self.tfsec -= whole;
        }
    }
}

impl Add<f64> for PrecisionTime {
    type Output = PrecisionTime;

    /// Offset a timestamp by a number of seconds.
    fn add(self, seconds: f64) -> PrecisionTime {
        PrecisionTime::new(self.twsec, self.tfsec + seconds)
    }
}

impl AddAssign<f64> for PrecisionTime {
    fn add_assign(&mut self, seconds: f64) {
        self.tfsec += seconds;
        self.normalize();
    }
}

impl PartialOrd for PrecisionTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.twsec.partial_cmp(&other.twsec) {
            Some(Ordering::Equal) => self.tfsec.partial_cmp(&other.tfsec),
            ord => ord,
        }
    }
}

/// A timestamp tagged with the sample offset it applies to within a data
/// block.
///
/// The first timestamp of a block is always at offset 0. Additional
/// entries mark offsets where timing was recomputed across packet joins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleTimestamp {
    /// The timestamp value
    pub time: PrecisionTime,
    /// Sample offset within the block this time applies to
    pub offset: usize,
    /// True when the time was interpolated rather than received
    pub synthetic: bool,
}

impl SampleTimestamp {
    pub fn new(time: PrecisionTime, offset: usize, synthetic: bool) -> Self {
        SampleTimestamp { time, offset, synthetic }
    }
}
