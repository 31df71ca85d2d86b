//! Calendar intervals, time zones and timestamp parsing for the date
//! histogram.
//!
//! Interval strings are a sequence of optionally signed counts followed by
//! a unit, e.g. `1d`, `month`, `1y-2M+3d`. A unit without a count means one.
//!
//! | Units | Kind |
//! |-------|------|
//! | `y` `year` `quarter` `M` `month` `w` `week` `d` `day` | calendar |
//! | `h` `hour` `m` `minute` `s` `second` `ms` `micros` `nanos` | fixed |
//!
//! Multi-unit calendar intervals (`2M`, `3d`, ...) use naive fixed-length
//! truncation measured from the Unix epoch (a year is 365.25 days, a month
//! a twelfth of that). Multi-week intervals are measured from Monday
//! 1970-01-05 so buckets still start on Mondays.
//!
//! Zones are either fixed offsets or IANA names. Calendar boundaries are
//! local midnights in the zone, so a day bucket across a DST change is 23
//! or 25 hours long.

use anyhow::{anyhow, bail, Result};
use chrono::{
    DateTime, Datelike, Days, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;

const NANOS_PER_SECOND: i128 = 1_000_000_000;
const NANOS_PER_DAY: i128 = 86_400 * NANOS_PER_SECOND;
const NAIVE_YEAR_NANOS: i128 = NANOS_PER_DAY * 36525 / 100;
const NAIVE_MONTH_NANOS: i128 = NAIVE_YEAR_NANOS / 12;
const WEEK_NANOS: i128 = 7 * NANOS_PER_DAY;
/// 1970-01-05 was a Monday.
const FIRST_MONDAY_NANOS: i128 = 4 * NANOS_PER_DAY;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    text: String,
    years: i64,
    quarters: i64,
    months: i64,
    weeks: i64,
    days: i64,
    time_nanos: i64,
}

impl Interval {
    pub fn parse(text: &str) -> Result<Self> {
        let mut iv = Interval {
            text: text.to_string(),
            years: 0,
            quarters: 0,
            months: 0,
            weeks: 0,
            days: 0,
            time_nanos: 0,
        };

        let bytes = text.as_bytes();
        let mut pos = 0;
        let mut units = 0;
        while pos < bytes.len() {
            let c = bytes[pos];
            if c.is_ascii_whitespace() {
                pos += 1;
                continue;
            }

            let mut sign = 1i64;
            if c == b'+' || c == b'-' {
                if c == b'-' {
                    sign = -1;
                }
                pos += 1;
            }

            let digits = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
            let count = if pos > digits {
                text[digits..pos]
                    .parse::<i32>()
                    .map_err(|e| anyhow!("failed to parse interval {:?}: {}", text, e))?
                    as i64
            } else {
                1
            };

            let name_start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_alphabetic() {
                pos += 1;
            }
            let unit = &text[name_start..pos];
            if unit.is_empty() {
                bail!("failed to parse interval {:?}: missing unit", text);
            }

            let value = sign * count;
            match unit {
                "y" | "year" => iv.years += value,
                "quarter" => iv.quarters += value,
                "M" | "month" => iv.months += value,
                "w" | "week" => iv.weeks += value,
                "d" | "day" => iv.days += value,
                _ => {
                    let nanos: i64 = match unit {
                        "h" | "hour" => 3_600_000_000_000,
                        "m" | "minute" => 60_000_000_000,
                        "s" | "second" => 1_000_000_000,
                        "ms" => 1_000_000,
                        "micros" => 1_000,
                        "nanos" => 1,
                        other => bail!("not expected time unit: {}", other),
                    };
                    iv.time_nanos += value * nanos;
                }
            }
            units += 1;
        }

        if units == 0 {
            bail!("failed to parse interval {:?}: empty", text);
        }
        Ok(iv)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Fixed part of the interval: days plus time units. Used for offsets.
    pub fn fixed_offset(&self) -> Duration {
        Duration::days(self.days) + Duration::nanoseconds(self.time_nanos)
    }

    /// Truncates `t` to the start of its bucket in `zone`.
    pub fn truncate(&self, t: DateTime<FixedOffset>, zone: &Zone) -> Result<DateTime<FixedOffset>> {
        let t = zone.localize(&t);

        if self.years == 1 {
            return zone.midnight(t.year(), 1, 1);
        }
        if self.years > 1 {
            let v = zone.localize(&naive_truncate(&t, self.years as i128 * NAIVE_YEAR_NANOS, 0)?);
            return zone.midnight(v.year(), 1, 1);
        }
        if self.quarters > 0 {
            let month = (t.month() - 1) / 3 * 3 + 1;
            return zone.midnight(t.year(), month, 1);
        }
        if self.weeks > 0 {
            let back = Days::new(t.weekday().num_days_from_monday() as u64);
            let date = t
                .date_naive()
                .checked_sub_days(back)
                .ok_or_else(|| anyhow!("date out of range"))?;
            let monday = zone.midnight(date.year(), date.month(), date.day())?;
            if self.weeks == 1 {
                return Ok(monday);
            }
            let step = self.weeks as i128 * WEEK_NANOS;
            return Ok(zone.localize(&naive_truncate(&monday, step, FIRST_MONDAY_NANOS)?));
        }
        if self.months == 1 {
            return zone.midnight(t.year(), t.month(), 1);
        }
        if self.months > 1 {
            let v = zone.localize(&naive_truncate(&t, self.months as i128 * NAIVE_MONTH_NANOS, 0)?);
            return zone.midnight(v.year(), v.month(), 1);
        }
        if self.days == 1 {
            return zone.midnight(t.year(), t.month(), t.day());
        }
        if self.days > 1 {
            let v = zone.localize(&naive_truncate(&t, self.days as i128 * NANOS_PER_DAY, 0)?);
            return zone.midnight(v.year(), v.month(), v.day());
        }
        if self.time_nanos <= 0 {
            return Ok(t);
        }
        Ok(zone.localize(&naive_truncate(&t, self.time_nanos as i128, 0)?))
    }
}

/// Rounds `t` down to a multiple of `step` nanoseconds counted from `origin`
/// nanoseconds after the Unix epoch.
fn naive_truncate(t: &DateTime<FixedOffset>, step: i128, origin: i128) -> Result<DateTime<Utc>> {
    if step <= 0 {
        return Ok(t.with_timezone(&Utc));
    }
    let nanos = t.timestamp() as i128 * NANOS_PER_SECOND + t.timestamp_subsec_nanos() as i128;
    let shifted = nanos - origin;
    let truncated = shifted - shifted.rem_euclid(step) + origin;

    let secs = truncated.div_euclid(NANOS_PER_SECOND) as i64;
    let subsec = truncated.rem_euclid(NANOS_PER_SECOND) as u32;
    DateTime::from_timestamp(secs, subsec).ok_or_else(|| anyhow!("timestamp out of range"))
}

/// Time zone of a date histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl Zone {
    pub fn utc() -> Zone {
        Zone::Named(Tz::UTC)
    }

    /// Parses `UTC`, `Z`, an offset such as `+08:00`, `-0130`, `+05`, or an
    /// IANA name such as `America/New_York`.
    pub fn parse(s: &str) -> Result<Zone> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("utc") || s.eq_ignore_ascii_case("z") {
            return Ok(Zone::utc());
        }
        if s.starts_with(['+', '-']) || s.as_bytes()[0].is_ascii_digit() {
            return parse_offset(s).map(Zone::Fixed);
        }
        Tz::from_str(s)
            .map(Zone::Named)
            .map_err(|_| anyhow!("unknown time zone {:?}", s))
    }

    /// `t` in this zone, with the offset in effect at that instant.
    pub fn localize<T: TimeZone>(&self, t: &DateTime<T>) -> DateTime<FixedOffset> {
        match self {
            Zone::Fixed(offset) => t.with_timezone(offset),
            Zone::Named(tz) => t.with_timezone(tz).fixed_offset(),
        }
    }

    /// Reads a local wall-clock time. An ambiguous time (DST fall-back)
    /// resolves to the earlier instant; a skipped time is an error.
    pub fn from_local(&self, naive: &NaiveDateTime) -> Option<DateTime<FixedOffset>> {
        match self {
            Zone::Fixed(offset) => offset.from_local_datetime(naive).earliest(),
            Zone::Named(tz) => tz
                .from_local_datetime(naive)
                .earliest()
                .map(|t| t.fixed_offset()),
        }
    }

    /// Start of the given local day. Zones that skip midnight start the day
    /// at the first hour that exists.
    fn midnight(&self, year: i32, month: u32, day: u32) -> Result<DateTime<FixedOffset>> {
        let date = NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| anyhow!("invalid date {}-{}-{}", year, month, day))?;
        (0..3)
            .filter_map(|hour| date.and_hms_opt(hour, 0, 0))
            .find_map(|naive| self.from_local(&naive))
            .ok_or_else(|| anyhow!("no midnight on {} in {}", date, self))
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Fixed(offset) if offset.local_minus_utc() == 0 => f.write_str("UTC"),
            Zone::Fixed(offset) => {
                let secs = offset.local_minus_utc();
                let sign = if secs < 0 { '-' } else { '+' };
                let secs = secs.abs();
                write!(f, "{}{:02}:{:02}", sign, secs / 3600, secs % 3600 / 60)
            }
            Zone::Named(tz) => f.write_str(tz.name()),
        }
    }
}

/// Parses a fixed offset such as `+08:00`, `-0130` or `05`.
fn parse_offset(s: &str) -> Result<FixedOffset> {
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    if rest.starts_with(':') {
        bail!("offset {:?} has an unexpected format", s);
    }
    let digits = rest.replacen(':', "", 1);
    if !(digits.len() == 2 || digits.len() == 4) || !digits.bytes().all(|b| b.is_ascii_digit()) {
        bail!("offset {:?} has an unexpected format", s);
    }

    let hours: i32 = digits[..2].parse()?;
    let minutes: i32 = if digits.len() == 4 {
        digits[2..].parse()?
    } else {
        0
    };
    let mut seconds = (hours * 60 + minutes) * 60;
    if negative {
        seconds = -seconds;
    }
    FixedOffset::east_opt(seconds).ok_or_else(|| anyhow!("offset {:?} is out of range", s))
}

/// Parses a timestamp. Values without an explicit offset are read in `zone`.
pub fn parse_datetime_in(s: &str, zone: &Zone) -> Result<DateTime<FixedOffset>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(zone.localize(&t));
    }
    if let Ok(t) = DateTime::parse_from_rfc2822(s) {
        return Ok(zone.localize(&t));
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(t) = DateTime::parse_from_str(s, pattern) {
            return Ok(zone.localize(&t));
        }
    }

    let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|pattern| NaiveDateTime::parse_from_str(s, pattern).ok())
        .or_else(|| {
            ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"]
                .iter()
                .find_map(|pattern| NaiveDate::parse_from_str(s, pattern).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| anyhow!("failed to parse {:?} as a timestamp", s))?;

    zone.from_local(&naive)
        .ok_or_else(|| anyhow!("{:?} does not exist in {}", s, zone))
}

/// Formats `t` with a Joda-style pattern such as `yyyy-MM-ddTHH:mm:ss.SSSZZ`.
///
/// Letters without a Joda meaning are copied literally; text inside single
/// quotes is literal too.
pub fn format_joda(pattern: &str, t: &DateTime<FixedOffset>) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            i += 1;
            while i < chars.len() && chars[i] != '\'' {
                out.push(chars[i]);
                i += 1;
            }
            i += 1;
            continue;
        }

        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }

        let piece = match (c, run) {
            ('y', 2) => format!("{:02}", t.year().rem_euclid(100)),
            ('y', _) | ('Y', _) => format!("{:04}", t.year()),
            ('M', 1) => t.month().to_string(),
            ('M', 2) => format!("{:02}", t.month()),
            ('M', 3) => t.format("%b").to_string(),
            ('M', _) => t.format("%B").to_string(),
            ('d', 1) => t.day().to_string(),
            ('d', _) => format!("{:02}", t.day()),
            ('H', 1) => t.hour().to_string(),
            ('H', _) => format!("{:02}", t.hour()),
            ('h', 1) => t.hour12().1.to_string(),
            ('h', _) => format!("{:02}", t.hour12().1),
            ('m', 1) => t.minute().to_string(),
            ('m', _) => format!("{:02}", t.minute()),
            ('s', 1) => t.second().to_string(),
            ('s', _) => format!("{:02}", t.second()),
            ('S', n) => {
                let nanos = format!("{:09}", t.nanosecond() % 1_000_000_000);
                nanos[..n.min(9)].to_string()
            }
            ('a', _) => t.format("%p").to_string(),
            ('E', n) if n >= 4 => t.format("%A").to_string(),
            ('E', _) => t.format("%a").to_string(),
            ('Z', 1) => t.format("%z").to_string(),
            ('Z', _) => t.format("%:z").to_string(),
            (other, n) => std::iter::repeat(other).take(n).collect(),
        };
        out.push_str(&piece);
        i += run;
    }

    out
}
