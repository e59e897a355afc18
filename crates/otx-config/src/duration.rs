//! ISO-8601 duration (`PnYnMnWnDTnHnMnS`) with calendar-aware addition.
//!
//! Only integer components are accepted. Year and month components are added
//! on the calendar (`2024-01-31 + P1M = 2024-02-29`); everything else is a
//! fixed span.

use std::fmt;

use chrono::{DateTime, Duration, Months, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoDuration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl IsoDuration {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let body = s
            .strip_prefix('P')
            .or_else(|| s.strip_prefix('p'))
            .ok_or_else(|| "must start with 'P'".to_string())?;
        if body.is_empty() {
            return Err("no components".to_string());
        }

        let mut out = IsoDuration::default();
        let mut in_time = false;
        let mut saw_time_component = false;
        let mut saw_any = false;
        let mut digits = String::new();

        for c in body.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let c = c.to_ascii_uppercase();
            if c == 'T' {
                if in_time || !digits.is_empty() {
                    return Err("misplaced 'T'".to_string());
                }
                in_time = true;
                continue;
            }
            if digits.is_empty() {
                return Err(format!("designator '{c}' without a value"));
            }
            let n: u32 = digits
                .parse()
                .map_err(|_| format!("component '{digits}{c}' out of range"))?;
            digits.clear();
            let slot = match (in_time, c) {
                (false, 'Y') => &mut out.years,
                (false, 'M') => &mut out.months,
                (false, 'W') => &mut out.weeks,
                (false, 'D') => &mut out.days,
                (true, 'H') => &mut out.hours,
                (true, 'M') => &mut out.minutes,
                (true, 'S') => &mut out.seconds,
                _ => return Err(format!("unexpected designator '{c}'")),
            };
            *slot = n;
            saw_any = true;
            if in_time {
                saw_time_component = true;
            }
        }

        if !digits.is_empty() {
            return Err(format!("trailing number '{digits}' without designator"));
        }
        if in_time && !saw_time_component {
            return Err("'T' must be followed by a time component".to_string());
        }
        if !saw_any {
            return Err("no components".to_string());
        }
        if out.is_zero() {
            return Err("duration must be positive".to_string());
        }
        Ok(out)
    }

    pub fn is_zero(&self) -> bool {
        *self == IsoDuration::default()
    }

    /// Fixed-span part (weeks and below), `None` when it does not fit a `Duration`.
    fn fixed_span(&self) -> Option<Duration> {
        let secs = u64::from(self.weeks) * 604_800
            + u64::from(self.days) * 86_400
            + u64::from(self.hours) * 3_600
            + u64::from(self.minutes) * 60
            + u64::from(self.seconds);
        i64::try_from(secs).ok().and_then(Duration::try_seconds)
    }

    /// `start + self`, saturating at the maximum representable instant.
    pub fn add_to(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        let months = self.years.saturating_mul(12).saturating_add(self.months);
        start
            .checked_add_months(Months::new(months))
            .zip(self.fixed_span())
            .and_then(|(t, span)| t.checked_add_signed(span))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl fmt::Display for IsoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P")?;
        for (n, d) in [
            (self.years, 'Y'),
            (self.months, 'M'),
            (self.weeks, 'W'),
            (self.days, 'D'),
        ] {
            if n > 0 {
                write!(f, "{n}{d}")?;
            }
        }
        if self.hours > 0 || self.minutes > 0 || self.seconds > 0 {
            write!(f, "T")?;
            for (n, d) in [(self.hours, 'H'), (self.minutes, 'M'), (self.seconds, 'S')] {
                if n > 0 {
                    write!(f, "{n}{d}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_common_forms() {
        let d = IsoDuration::parse("PT30M").unwrap();
        assert_eq!(d.minutes, 30);
        let d = IsoDuration::parse("P1DT12H").unwrap();
        assert_eq!((d.days, d.hours), (1, 12));
        let d = IsoDuration::parse("P1Y2M3W").unwrap();
        assert_eq!((d.years, d.months, d.weeks), (1, 2, 3));
    }

    #[test]
    fn month_vs_minute_disambiguated_by_t() {
        assert_eq!(IsoDuration::parse("P1M").unwrap().months, 1);
        assert_eq!(IsoDuration::parse("PT1M").unwrap().minutes, 1);
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "P", "PT", "1D", "P1", "PT1D", "P1H", "P0D", "PXD", "P1.5D", "P1DT"] {
            assert!(IsoDuration::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn month_addition_is_calendar_aware() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 10, 0, 0).unwrap();
        let next = IsoDuration::parse("P1M").unwrap().add_to(start);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 29, 10, 0, 0).unwrap());
    }

    #[test]
    fn fixed_components_add_exactly() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let next = IsoDuration::parse("P1DT1H30M5S").unwrap().add_to(start);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 2, 1, 30, 5).unwrap());
    }

    #[test]
    fn display_round_trips_canonical_form() {
        assert_eq!(IsoDuration::parse("p1dt2h").unwrap().to_string(), "P1DT2H");
        assert_eq!(IsoDuration::parse("PT45S").unwrap().to_string(), "PT45S");
    }
}
