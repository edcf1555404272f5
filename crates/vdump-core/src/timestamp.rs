//! Archive timestamps.
//!
//! The wire format stores nine broken-down local-time fields (struct-tm
//! conventions: `year` counts from 1900, `mon` and `yday` are 0-based,
//! `wday` counts from Sunday). Comparisons go through the reconstructed
//! epoch value, so two timestamps written in different DST regimes still
//! order correctly.

use std::cmp::Ordering;
use std::fmt;
use std::io::{BufRead, Write};

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Timelike};

use crate::serialize;
use vdump_types::error::Result;

#[derive(Clone, Copy)]
pub struct Timestamp {
    sec: i64,
    min: i64,
    hour: i64,
    mday: i64,
    mon: i64,
    year: i64,
    wday: i64,
    yday: i64,
    is_dst: i64,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(Local::now())
    }

    pub fn from_unix(secs: i64) -> Self {
        let dt = Local
            .timestamp_opt(secs, 0)
            .single()
            .unwrap_or_else(|| Local.timestamp_opt(0, 0).unwrap());
        Self::from_datetime(dt)
    }

    fn from_datetime(dt: DateTime<Local>) -> Self {
        Timestamp {
            sec: dt.second() as i64,
            min: dt.minute() as i64,
            hour: dt.hour() as i64,
            mday: dt.day() as i64,
            mon: dt.month0() as i64,
            year: dt.year() as i64 - 1900,
            wday: dt.weekday().num_days_from_sunday() as i64,
            yday: dt.ordinal0() as i64,
            is_dst: 0,
        }
    }

    /// Reconstruct epoch seconds from the broken-down fields.
    ///
    /// The earliest candidate wins when local time is ambiguous (DST fold);
    /// unresolvable field combinations collapse to 0 rather than failing,
    /// since they can only come from a corrupt archive and header identity
    /// checks will reject it anyway.
    pub fn unix(&self) -> i64 {
        NaiveDate::from_ymd_opt(
            (self.year + 1900) as i32,
            (self.mon + 1) as u32,
            self.mday as u32,
        )
        .and_then(|d| d.and_hms_opt(self.hour as u32, self.min as u32, self.sec as u32))
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        serialize::put_i64(w, self.sec)?;
        serialize::put_i64(w, self.min)?;
        serialize::put_i64(w, self.hour)?;
        serialize::put_i64(w, self.mday)?;
        serialize::put_i64(w, self.mon)?;
        serialize::put_i64(w, self.year)?;
        serialize::put_i64(w, self.wday)?;
        serialize::put_i64(w, self.yday)?;
        serialize::put_i64(w, self.is_dst)?;
        Ok(())
    }

    pub fn read_from(r: &mut impl BufRead) -> Result<Self> {
        Ok(Timestamp {
            sec: serialize::get_i64(r)?,
            min: serialize::get_i64(r)?,
            hour: serialize::get_i64(r)?,
            mday: serialize::get_i64(r)?,
            mon: serialize::get_i64(r)?,
            year: serialize::get_i64(r)?,
            wday: serialize::get_i64(r)?,
            yday: serialize::get_i64(r)?,
            is_dst: serialize::get_i64(r)?,
        })
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.unix() == other.unix()
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.unix().cmp(&other.unix())
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.unix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_preserves_epoch() {
        let ts = Timestamp::from_unix(1_600_000_000);
        let mut buf = Vec::new();
        ts.write_to(&mut buf).unwrap();
        let back = Timestamp::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(ts, back);
        assert_eq!(back.unix(), 1_600_000_000);
    }

    #[test]
    fn serialized_form_is_nine_fields() {
        let ts = Timestamp::from_unix(0);
        let mut buf = Vec::new();
        ts.write_to(&mut buf).unwrap();
        assert_eq!(buf.iter().filter(|&&b| b == 0).count(), 9);
    }

    #[test]
    fn ordering_follows_epoch() {
        let older = Timestamp::from_unix(1_000_000);
        let newer = Timestamp::from_unix(2_000_000);
        assert!(older < newer);
        assert!(newer > older);
        assert_ne!(older, newer);
    }

    #[test]
    fn now_is_recent() {
        let ts = Timestamp::now();
        let unix = ts.unix();
        // Written in 2026; any sane clock is past 2020.
        assert!(unix > 1_577_836_800, "unix = {unix}");
    }
}
