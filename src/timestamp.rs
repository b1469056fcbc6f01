use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use time::macros::format_description;
use time::OffsetDateTime;

/// A wall-clock instant with microsecond resolution.
///
/// Event loops hand a `Timestamp` to read callbacks so user code can see when
/// the poller observed the event, without issuing another clock syscall.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    micro_seconds_since_epoch: i64,
}

pub const MICRO_SECONDS_PER_SECOND: i64 = 1_000_000;

impl Timestamp {
    pub fn from_micros(micro_seconds_since_epoch: i64) -> Timestamp {
        Timestamp {
            micro_seconds_since_epoch,
        }
    }

    /// The current wall-clock time.
    pub fn now() -> Timestamp {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);

        Timestamp::from_micros(micros)
    }

    pub fn micros(&self) -> i64 {
        self.micro_seconds_since_epoch
    }

    pub fn is_valid(&self) -> bool {
        self.micro_seconds_since_epoch > 0
    }
}

impl fmt::Display for Timestamp {
    /// Renders as `YYYY/MM/DD HH:MM:SS` (UTC).
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let datetime = OffsetDateTime::UNIX_EPOCH
            + time::Duration::microseconds(self.micro_seconds_since_epoch);
        let format = format_description!("[year]/[month]/[day] [hour]:[minute]:[second]");

        match datetime.format(&format) {
            Ok(s) => fmt.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Timestamp;

    #[test]
    fn formats_calendar_time() {
        // 2001-09-09 01:46:40 UTC
        let ts = Timestamp::from_micros(1_000_000_000 * 1_000_000);
        assert_eq!(ts.to_string(), "2001/09/09 01:46:40");
    }

    #[test]
    fn now_is_valid_and_monotonic_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a.is_valid());
        assert!(b >= a);
    }

    #[test]
    fn default_is_invalid() {
        assert!(!Timestamp::default().is_valid());
    }
}
