use crate::error::ReportError;
use chrono::{DateTime, Duration, Utc};
use std::convert::TryFrom;
use std::str::FromStr;

/// GetMetricStatistics returns at most this many datapoints per call.
pub const MAX_DATAPOINTS_PER_CALL: i64 = 1440;

/// CloudWatch keeps hourly data for 15 months.
pub const MAX_LOOKBACK_SECONDS: i64 = 455 * 86_400;

pub const MAX_PERIOD_SECONDS: i64 = 86_400;

/// A relative window ending "now", kept in its ISO-8601 form for widget
/// definitions and report text.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookback {
    iso: String,
    duration: Duration,
}

impl Lookback {
    pub fn iso(&self) -> &str {
        &self.iso
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl FromStr for Lookback {
    type Err = ReportError;

    /// Accepts `[-]P[nD][T[nH][nM][nS]]`. The sign is optional since the window
    /// always ends now.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ReportError::Config(format!("invalid lookback duration {:?}", value));
        let trimmed = value.trim();
        let body = trimmed.strip_prefix('-').unwrap_or(trimmed);
        let body = body.strip_prefix('P').ok_or_else(invalid)?;

        let mut seconds: i64 = 0;
        let mut digits = String::new();
        let mut in_time = false;
        let mut components = 0;
        for c in body.chars() {
            match c {
                '0'..='9' => digits.push(c),
                'T' if !in_time && digits.is_empty() => in_time = true,
                'D' | 'H' | 'M' | 'S' => {
                    let amount: i64 = digits.parse().map_err(|_| invalid())?;
                    digits.clear();
                    let unit = match (c, in_time) {
                        ('D', false) => 86_400,
                        ('H', true) => 3_600,
                        ('M', true) => 60,
                        ('S', true) => 1,
                        _ => return Err(invalid()),
                    };
                    seconds = amount
                        .checked_mul(unit)
                        .and_then(|s| s.checked_add(seconds))
                        .ok_or_else(invalid)?;
                    components += 1;
                }
                _ => return Err(invalid()),
            }
        }
        if !digits.is_empty() || components == 0 || !(1..=MAX_LOOKBACK_SECONDS).contains(&seconds) {
            return Err(invalid());
        }

        Ok(Lookback {
            iso: format!("-P{}", body),
            duration: Duration::seconds(seconds),
        })
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct TimeRange {
    pub start: chrono::DateTime<Utc>,
    pub end: chrono::DateTime<Utc>,
}

impl TryFrom<(DateTime<Utc>, &Lookback)> for TimeRange {
    type Error = ReportError;

    fn try_from((end, lookback): (DateTime<Utc>, &Lookback)) -> Result<Self, Self::Error> {
        let start = end
            .checked_sub_signed(lookback.duration())
            .ok_or(ReportError::NoneValue)?;
        Ok(TimeRange { start, end })
    }
}

impl TimeRange {
    /// Splits the range into consecutive sub-ranges each holding at most
    /// `MAX_DATAPOINTS_PER_CALL` periods.
    pub fn windows(&self, period_seconds: i64) -> Vec<TimeRange> {
        let step = Duration::seconds(
            period_seconds.clamp(1, MAX_PERIOD_SECONDS) * MAX_DATAPOINTS_PER_CALL,
        );
        let mut windows = Vec::new();
        let mut start = self.start;
        while start < self.end {
            let end = start
                .checked_add_signed(step)
                .map_or(self.end, |next| std::cmp::min(next, self.end));
            windows.push(TimeRange { start, end });
            start = end;
        }
        windows
    }

    pub fn format_start(&self) -> String {
        format_timestamp(&self.start)
    }

    pub fn format_end(&self) -> String {
        format_timestamp(&self.end)
    }
}

pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use crate::error::ReportError;
    use crate::time_range::{Lookback, TimeRange};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::convert::TryFrom;
    use std::str::FromStr;

    #[test]
    fn test_parse_lookback() {
        let lookback = Lookback::from_str("-PT24H").unwrap();
        assert_eq!(lookback.duration(), Duration::hours(24));
        assert_eq!(lookback.iso(), "-PT24H");

        let lookback = Lookback::from_str("P7D").unwrap();
        assert_eq!(lookback.duration(), Duration::days(7));
        assert_eq!(lookback.iso(), "-P7D");

        let lookback = Lookback::from_str("-P1DT1H30M15S").unwrap();
        assert_eq!(lookback.duration(), Duration::seconds(86_400 + 3_600 + 1_800 + 15));
    }

    #[test]
    fn test_parse_invalid_lookback() {
        for value in &[
            "",
            "24h",
            "-PT",
            "-PT24",
            "-P1H",
            "-PT0H",
            "-PTT1H",
            "-PT1D",
            "-P456D",
            "-PT9999999999999999H",
        ] {
            assert!(
                matches!(Lookback::from_str(value), Err(ReportError::Config(_))),
                "{} should be rejected",
                value
            );
        }
    }

    #[test]
    fn test_try_from() {
        let end = DateTime::<Utc>::from_str("2020-12-01T15:00:00.0+00:00").unwrap();
        let lookback = Lookback::from_str("-PT24H").unwrap();

        let time_range = TimeRange::try_from((end, &lookback));
        assert_eq!(
            time_range.unwrap(),
            TimeRange {
                start: Utc.ymd(2020, 11, 30).and_hms(15, 0, 0),
                end: Utc.ymd(2020, 12, 1).and_hms(15, 0, 0),
            }
        );
    }

    #[test]
    fn test_windows_fit_in_one_call() {
        let end = Utc.ymd(2020, 12, 1).and_hms(0, 0, 0);
        let lookback = Lookback::from_str("-PT24H").unwrap();
        let range = TimeRange::try_from((end, &lookback)).unwrap();

        assert_eq!(range.windows(300), vec![range]);
    }

    #[test]
    fn test_windows_split_at_datapoint_limit() {
        let end = Utc.ymd(2020, 12, 3).and_hms(0, 0, 0);
        let lookback = Lookback::from_str("-PT48H").unwrap();
        let range = TimeRange::try_from((end, &lookback)).unwrap();

        // 60s periods: 1440 points per day
        let windows = range.windows(60);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].start, range.start);
        assert_eq!(windows[0].end, Utc.ymd(2020, 12, 2).and_hms(0, 0, 0));
        assert_eq!(windows[1].start, windows[0].end);
        assert_eq!(windows[1].end, range.end);
    }

    #[test]
    fn test_windows_with_oversized_period() {
        let end = Utc.ymd(2020, 12, 1).and_hms(0, 0, 0);
        let lookback = Lookback::from_str("-P455D").unwrap();
        let range = TimeRange::try_from((end, &lookback)).unwrap();

        assert_eq!(range.windows(i64::MAX), vec![range]);
    }

    #[test]
    fn test_format() {
        let range = TimeRange {
            start: Utc.ymd(2020, 11, 30).and_hms(15, 0, 0),
            end: Utc.ymd(2020, 12, 1).and_hms(15, 0, 0),
        };
        assert_eq!(range.format_start(), "2020-11-30T15:00:00Z");
        assert_eq!(range.format_end(), "2020-12-01T15:00:00Z");
    }
}
