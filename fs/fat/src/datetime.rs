//! DOS packed date/time and its conversion to/from
//! [`SystemTime`]. No crate in this workspace pulls in a calendar library,
//! so the civil-calendar math is the well-known Howard Hinnant
//! `days_from_civil`/`civil_from_days` algorithm, good for the full `i32`
//! year range with no leap-second handling (DOS timestamps don't have any).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fatrs_err::{Error, FatError, Result};

/// How a [`DosDateTime`] maps to [`SystemTime`]: DOS timestamps carry no
/// timezone of their own, so the caller has to supply one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tz {
    Utc,
    /// A fixed UTC offset in seconds, positive east of Greenwich.
    ///
    /// There's no tz-database crate anywhere in this corpus, so rather than
    /// reach for one just for this, local time is modelled as a caller-
    /// supplied fixed offset. Good enough for a filesystem engine that
    /// doesn't need DST transitions; see DESIGN.md.
    Local(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DosDate(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DosTime(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosDateTime {
    pub date: DosDate,
    pub time: DosTime,
    /// Tenths of a second, 0-199 (the extra bit covers up to 199 so the
    /// field can also encode up to one extra second), per `DIR_CrtTimeTenth`.
    pub time_tenth: u8,
}

impl DosDate {
    pub fn from_parts(year: i32, month: u32, day: u32) -> Result<Self> {
        if !(1980..=2107).contains(&year) || !(1..=12).contains(&month) || !(1..=31).contains(&day)
        {
            return Err(Error::Fs(FatError::InvalidDateTime));
        }
        Ok(Self(((year as u16 - 1980) << 9) | ((month as u16) << 5) | day as u16))
    }

    pub fn year(self) -> i32 {
        1980 + (self.0 >> 9) as i32
    }

    pub fn month(self) -> u32 {
        ((self.0 >> 5) & 0x0F) as u32
    }

    pub fn day(self) -> u32 {
        (self.0 & 0x1F) as u32
    }
}

impl DosTime {
    pub fn from_parts(hour: u32, minute: u32, second: u32) -> Result<Self> {
        if hour > 23 || minute > 59 || second > 59 {
            return Err(Error::Fs(FatError::InvalidDateTime));
        }
        Ok(Self(((hour as u16) << 11) | ((minute as u16) << 5) | (second as u16 / 2)))
    }

    pub fn hour(self) -> u32 {
        (self.0 >> 11) as u32
    }

    pub fn minute(self) -> u32 {
        ((self.0 >> 5) & 0x3F) as u32
    }

    /// Seconds, rounded down to the nearest even second: DOS only stores
    /// 2-second resolution here (finer resolution lives in `time_tenth`).
    pub fn second(self) -> u32 {
        (self.0 & 0x1F) as u32 * 2
    }
}

impl DosDateTime {
    pub fn from_parts(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
        time_tenth: u8,
    ) -> Result<Self> {
        Ok(Self {
            date: DosDate::from_parts(year, month, day)?,
            time: DosTime::from_parts(hour, minute, second)?,
            time_tenth,
        })
    }

    pub fn epoch() -> Self {
        Self {
            date: DosDate(0x0021), // 1980-01-01
            time: DosTime(0),
            time_tenth: 0,
        }
    }

    pub fn now(tz: Tz) -> Self {
        Self::from_system_time(SystemTime::now(), tz)
            .unwrap_or_else(|_| Self::epoch())
    }

    pub fn to_system_time(self, tz: Tz) -> Result<SystemTime> {
        let days = days_from_civil(self.date.year(), self.date.month(), self.date.day());
        let mut secs = days * 86_400
            + self.time.hour() as i64 * 3600
            + self.time.minute() as i64 * 60
            + self.time.second() as i64
            + (self.time_tenth as i64) / 10;
        let offset = match tz {
            Tz::Utc => 0,
            Tz::Local(offset) => offset as i64,
        };
        secs -= offset;
        let tenths = (self.time_tenth as u32) % 10;
        if secs >= 0 {
            Ok(UNIX_EPOCH + Duration::new(secs as u64, tenths * 100_000_000))
        } else {
            (UNIX_EPOCH - Duration::new((-secs) as u64, 0))
                .checked_add(Duration::new(0, tenths * 100_000_000))
                .ok_or(Error::Fs(FatError::InvalidDateTime))
        }
    }

    pub fn from_system_time(time: SystemTime, tz: Tz) -> Result<Self> {
        let offset = match tz {
            Tz::Utc => 0,
            Tz::Local(offset) => offset as i64,
        };
        let (secs, nanos): (i64, u32) = match time.duration_since(UNIX_EPOCH) {
            Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => {
                let d = e.duration();
                if d.subsec_nanos() == 0 {
                    (-(d.as_secs() as i64), 0)
                } else {
                    (-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
                }
            }
        };
        let local = secs + offset;
        let days = local.div_euclid(86_400);
        let tod = local.rem_euclid(86_400);
        let (year, month, day) = civil_from_days(days);
        let hour = tod / 3600;
        let minute = (tod % 3600) / 60;
        let second = tod % 60;
        let time_tenth = (second % 2) as u8 * 10 + (nanos / 100_000_000) as u8;
        DosDateTime::from_parts(
            year,
            month as u32,
            day as u32,
            hour as u32,
            minute as u32,
            second as u32,
            time_tenth,
        )
    }
}

/// Days since 1970-01-01 for a given proleptic-Gregorian civil date.
/// Howard Hinnant's `days_from_civil`, valid for any `i32` year.
fn days_from_civil(y: i32, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y as i64 - 1 } else { y as i64 };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64; // [0, 399]
    let mp = (m as i64 + 9) % 12; // [0, 11], Mar=0 .. Feb=11
    let doy = (153 * mp + 2) / 5 + d as i64 - 1; // [0, 365]
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy; // [0, 146096]
    era * 146_097 + doe - 719_468
}

/// Inverse of [`days_from_civil`].
fn civil_from_days(z: i64) -> (i32, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as i64; // [0, 146096]
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365; // [0, 399]
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100); // [0, 365]
    let mp = (5 * doy + 2) / 153; // [0, 11]
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32; // [1, 31]
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32; // [1, 12]
    let y = if m <= 2 { y + 1 } else { y };
    (y as i32, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_calendar_round_trips() {
        for days in [-719_468, -1, 0, 1, 18_262, 100_000] {
            let (y, m, d) = civil_from_days(days);
            assert_eq!(days_from_civil(y, m, d), days);
        }
    }

    #[test]
    fn epoch_matches_the_dos_1980_floor() {
        let epoch = DosDateTime::epoch();
        assert_eq!(epoch.date.year(), 1980);
        assert_eq!(epoch.date.month(), 1);
        assert_eq!(epoch.date.day(), 1);
    }

    #[test]
    fn dos_datetime_round_trips_through_system_time() {
        let original = DosDateTime::from_parts(2024, 6, 15, 13, 37, 42, 5).unwrap();
        let st = original.to_system_time(Tz::Utc).unwrap();
        let back = DosDateTime::from_system_time(st, Tz::Utc).unwrap();
        assert_eq!(original.date, back.date);
        assert_eq!(original.time, back.time);
    }

    #[test]
    fn second_resolution_is_two_seconds_but_tenths_cover_the_gap() {
        let t = DosTime::from_parts(10, 0, 3).unwrap();
        assert_eq!(t.second(), 2); // truncated down to even seconds
    }

    #[test]
    fn rejects_out_of_range_fields() {
        assert!(DosDate::from_parts(1979, 12, 31).is_err());
        assert!(DosTime::from_parts(24, 0, 0).is_err());
    }

    #[test]
    fn local_offset_shifts_relative_to_utc() {
        let utc = DosDateTime::from_parts(2024, 1, 1, 0, 30, 0, 0).unwrap();
        let st = utc.to_system_time(Tz::Utc).unwrap();
        let local = DosDateTime::from_system_time(st, Tz::Local(3600)).unwrap();
        assert_eq!(local.time.hour(), 1);
    }
}
