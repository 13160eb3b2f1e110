use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

/// Fixed far-future sentinel marking the currently-open history interval.
pub fn end_of_time() -> DateTime<Utc> {
    let naive = NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .expect("end-of-time constant is valid");
    Utc.from_utc_datetime(&naive)
}

/// Rounds instants down to a fixed granularity boundary, anchored at the
/// Unix epoch. History interval boundaries are always quantized values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantizer {
    granularity_secs: i64,
}

impl Default for Quantizer {
    fn default() -> Self {
        Self::new(Duration::minutes(15))
    }
}

impl Quantizer {
    pub fn new(granularity: Duration) -> Self {
        let secs = granularity.num_seconds();
        assert!(secs > 0, "granularity must be positive");
        Self {
            granularity_secs: secs,
        }
    }

    pub fn quantize(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let t = instant.timestamp();
        let floored = t - t.rem_euclid(self.granularity_secs);
        match Utc.timestamp_opt(floored, 0) {
            chrono::LocalResult::Single(dt) => dt,
            // Unreachable for any floored unix timestamp, but fall back to
            // the input rather than panic.
            _ => instant,
        }
    }
}

/// Time source for the engine. Injected so tests can steer mutations across
/// (or into) quantization buckets.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A settable clock for tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
