use std::sync::atomic::{AtomicU64, Ordering};

use time::{Date, Month, OffsetDateTime, Time};

pub const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to. Used to step across cache TTLs,
/// rate-limit windows and billing cycles in tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: u64) {
        self.now_ms.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance_millis(secs.saturating_mul(1000));
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

fn to_datetime(ms: u64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn to_millis(datetime: OffsetDateTime) -> u64 {
    let millis = datetime.unix_timestamp_nanos() / 1_000_000;
    u64::try_from(millis).unwrap_or(0)
}

fn midnight_utc(date: Date) -> u64 {
    to_millis(date.with_time(Time::MIDNIGHT).assume_utc())
}

/// First instant (UTC) of the calendar month after the one containing `now_ms`.
pub fn next_month_start(now_ms: u64) -> u64 {
    let date = to_datetime(now_ms).date();
    let (year, month) = match date.month() {
        Month::December => (date.year() + 1, Month::January),
        month => (date.year(), month.next()),
    };
    match Date::from_calendar_date(year, month, 1) {
        Ok(first) => midnight_utc(first),
        Err(_) => u64::MAX,
    }
}

/// First instant (UTC) of the calendar month containing `now_ms`.
pub fn month_start(now_ms: u64) -> u64 {
    let date = to_datetime(now_ms).date();
    match Date::from_calendar_date(date.year(), date.month(), 1) {
        Ok(first) => midnight_utc(first),
        Err(_) => 0,
    }
}

/// Midnight (UTC) of the day containing `now_ms`.
pub fn day_start(now_ms: u64) -> u64 {
    now_ms - now_ms % MILLIS_PER_DAY
}

/// `YYYY-MM-DD` for the day containing `ms`.
pub fn format_day(ms: u64) -> String {
    let date = to_datetime(ms).date();
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}
