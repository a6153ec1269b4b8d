use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A commitment duration like "2 hours", "14 days" or "1 year, 6 months".
///
/// Month and year terms are calendar-aware: adding them lands on the same
/// day-of-month where possible, clamped to the end of the month otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitmentDuration {
    pub years: u32,
    pub months: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
}

impl CommitmentDuration {
    pub fn is_zero(&self) -> bool {
        self.years == 0 && self.months == 0 && self.days == 0 && self.hours == 0 && self.minutes == 0
    }

    /// Compute the expiry timestamp for a commitment anchored at `start`.
    /// Returns None on calendar overflow.
    pub fn add_to(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let total_months = self.years.checked_mul(12)?.checked_add(self.months)?;
        let with_months = start.checked_add_months(Months::new(total_months))?;
        with_months
            .checked_add_signed(Duration::days(i64::from(self.days)))?
            .checked_add_signed(Duration::hours(i64::from(self.hours)))?
            .checked_add_signed(Duration::minutes(i64::from(self.minutes)))
    }
}

fn term(f: &mut fmt::Formatter<'_>, first: &mut bool, n: u32, unit: &str) -> fmt::Result {
    if n == 0 {
        return Ok(());
    }
    if !*first {
        write!(f, ", ")?;
    }
    *first = false;
    if n == 1 {
        write!(f, "1 {}", unit)
    } else {
        write!(f, "{} {}s", n, unit)
    }
}

impl fmt::Display for CommitmentDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(f, "0 seconds");
        }
        let mut first = true;
        term(f, &mut first, self.years, "year")?;
        term(f, &mut first, self.months, "month")?;
        term(f, &mut first, self.days, "day")?;
        term(f, &mut first, self.hours, "hour")?;
        term(f, &mut first, self.minutes, "minute")
    }
}

impl FromStr for CommitmentDuration {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut result = CommitmentDuration::default();
        let tokens: Vec<&str> = input
            .split([',', ' '])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();

        if tokens.is_empty() {
            return Err("empty duration".to_string());
        }
        if tokens.len() % 2 != 0 {
            return Err(format!("malformed duration: {:?}", input));
        }

        for pair in tokens.chunks(2) {
            let count: u32 = pair[0]
                .parse()
                .map_err(|_| format!("invalid count in duration: {:?}", pair[0]))?;
            let field = match pair[1].trim_end_matches('s') {
                "year" => &mut result.years,
                "month" => &mut result.months,
                "day" => &mut result.days,
                "hour" => &mut result.hours,
                "minute" => &mut result.minutes,
                unit => return Err(format!("invalid unit in duration: {:?}", unit)),
            };
            *field = field
                .checked_add(count)
                .ok_or_else(|| format!("duration term too large: {:?}", input))?;
        }

        if result.is_zero() {
            return Err("duration must be positive".to_string());
        }
        Ok(result)
    }
}

impl Serialize for CommitmentDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CommitmentDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_single_term() {
        let d: CommitmentDuration = "2 hours".parse().unwrap();
        assert_eq!(d.hours, 2);
        let d: CommitmentDuration = "1 year".parse().unwrap();
        assert_eq!(d.years, 1);
        let d: CommitmentDuration = "14 days".parse().unwrap();
        assert_eq!(d.days, 14);
    }

    #[test]
    fn test_parse_multi_term() {
        let d: CommitmentDuration = "1 year, 6 months".parse().unwrap();
        assert_eq!((d.years, d.months), (1, 6));
        let d: CommitmentDuration = "2 days 12 hours".parse().unwrap();
        assert_eq!((d.days, d.hours), (2, 12));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<CommitmentDuration>().is_err());
        assert!("three hours".parse::<CommitmentDuration>().is_err());
        assert!("5 fortnights".parse::<CommitmentDuration>().is_err());
        assert!("5".parse::<CommitmentDuration>().is_err());
        assert!("0 hours".parse::<CommitmentDuration>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for input in ["2 hours", "1 year, 6 months", "14 days", "1 minute"] {
            let d: CommitmentDuration = input.parse().unwrap();
            assert_eq!(d.to_string(), input);
            let again: CommitmentDuration = d.to_string().parse().unwrap();
            assert_eq!(again, d);
        }
    }

    #[test]
    fn test_add_to_calendar_aware() {
        let d: CommitmentDuration = "1 month".parse().unwrap();
        // Jan 31 + 1 month clamps to Feb 28 (2026 is not a leap year).
        assert_eq!(d.add_to(at(2026, 1, 31, 9)), Some(at(2026, 2, 28, 9)));

        let d: CommitmentDuration = "2 hours".parse().unwrap();
        assert_eq!(d.add_to(at(2026, 1, 31, 23)), Some(at(2026, 2, 1, 1)));

        let d: CommitmentDuration = "1 year, 2 months".parse().unwrap();
        assert_eq!(d.add_to(at(2026, 1, 15, 0)), Some(at(2027, 3, 15, 0)));
    }

    #[test]
    fn test_serde_as_string() {
        let d: CommitmentDuration = "3 months".parse().unwrap();
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, r#""3 months""#);
        let back: CommitmentDuration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
