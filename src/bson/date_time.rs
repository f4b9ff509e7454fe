use std::fmt;

use chrono::{DateTime as ChronoDateTime, Local, TimeZone, Utc};

/// Ticks (100 ns units) between 0001-01-01 and the unix epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Point in time stored as ticks: 100-nanosecond intervals since
/// 0001-01-01T00:00:00 UTC.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct DateTime {
    ticks: i64,
}

impl DateTime {
    pub fn from_ticks(ticks: i64) -> Self {
        DateTime { ticks }
    }

    pub fn now() -> Self {
        Self::from_utc(Utc::now())
    }

    pub fn ticks(&self) -> i64 {
        self.ticks
    }

    pub fn from_utc(dt: ChronoDateTime<Utc>) -> Self {
        let ticks = UNIX_EPOCH_TICKS
            + dt.timestamp() * 10_000_000
            + (dt.timestamp_subsec_nanos() as i64) / 100;
        DateTime { ticks }
    }

    pub fn to_utc(&self) -> ChronoDateTime<Utc> {
        let unix_ticks = self.ticks - UNIX_EPOCH_TICKS;
        let secs = unix_ticks.div_euclid(10_000_000);
        let nanos = (unix_ticks.rem_euclid(10_000_000) * 100) as u32;
        Utc.timestamp_opt(secs, nanos).single().unwrap_or_default()
    }

    /// Render in local time unless the engine's UTC_DATE pragma is set.
    pub fn to_local(&self) -> ChronoDateTime<Local> {
        self.to_utc().with_timezone(&Local)
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_utc().to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_chrono() {
        let now = DateTime::now();
        let back = DateTime::from_utc(now.to_utc());
        assert_eq!(now.ticks(), back.ticks());
    }

    #[test]
    fn epoch_has_known_ticks() {
        let epoch = Utc.timestamp_opt(0, 0).single().unwrap();
        assert_eq!(DateTime::from_utc(epoch).ticks(), UNIX_EPOCH_TICKS);
    }
}
