//! Leaderboard periods and ranked entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Ranking window. Daily/weekly/monthly windows are UTC-aligned; weeks start
/// on Monday (ISO).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
    AllTime,
}

impl Period {
    pub const ALL: [Period; 4] = [
        Period::Daily,
        Period::Weekly,
        Period::Monthly,
        Period::AllTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
            Period::AllTime => "alltime",
        }
    }

    /// The half-open window `[start, end)` containing `at`.
    pub fn window(&self, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            Period::Daily => {
                let start = at
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight is valid")
                    .and_utc();
                (start, start + Duration::days(1))
            }
            Period::Weekly => {
                let days_from_monday =
                    at.date_naive().weekday().num_days_from_monday() as i64;
                let start = (at.date_naive() - Duration::days(days_from_monday))
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight is valid")
                    .and_utc();
                (start, start + Duration::weeks(1))
            }
            Period::Monthly => {
                let start = at
                    .date_naive()
                    .with_day(1)
                    .expect("day 1 is valid")
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight is valid")
                    .and_utc();
                let end = if start.month() == 12 {
                    Utc.with_ymd_and_hms(start.year() + 1, 1, 1, 0, 0, 0)
                        .single()
                        .expect("jan 1 is valid")
                } else {
                    Utc.with_ymd_and_hms(start.year(), start.month() + 1, 1, 0, 0, 0)
                        .single()
                        .expect("first of month is valid")
                };
                (start, end)
            }
            Period::AllTime => (
                Utc.timestamp_opt(0, 0).single().expect("epoch is valid"),
                // Far future, effectively unbounded.
                Utc.with_ymd_and_hms(3000, 1, 1, 0, 0, 0)
                    .single()
                    .expect("year 3000 is valid"),
            ),
        }
    }

}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Period::Daily),
            "weekly" => Ok(Period::Weekly),
            "monthly" => Ok(Period::Monthly),
            "alltime" | "all-time" | "all_time" => Ok(Period::AllTime),
            other => Err(format!("unknown period: {other}")),
        }
    }
}

/// One ranked row of a period leaderboard. Rank is derived at read time.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LeaderboardEntry {
    pub user_id: String,
    pub period: Period,
    pub points: i64,
    /// 1-based rank within the period.
    pub rank: u64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid RFC 3339 timestamp")
    }

    #[test]
    fn daily_window_is_utc_midnight_aligned() {
        let (start, end) = Period::Daily.window(at("2026-08-19T15:30:00Z"));
        assert_eq!(start, at("2026-08-19T00:00:00Z"));
        assert_eq!(end, at("2026-08-20T00:00:00Z"));
    }

    #[test]
    fn weekly_window_starts_monday() {
        // 2026-08-19 is a Wednesday.
        let (start, end) = Period::Weekly.window(at("2026-08-19T15:30:00Z"));
        assert_eq!(start, at("2026-08-17T00:00:00Z"));
        assert_eq!(end, at("2026-08-24T00:00:00Z"));
    }

    #[test]
    fn monthly_window_handles_december_rollover() {
        let (start, end) = Period::Monthly.window(at("2026-12-15T00:00:00Z"));
        assert_eq!(start, at("2026-12-01T00:00:00Z"));
        assert_eq!(end, at("2027-01-01T00:00:00Z"));
    }

    #[test]
    fn all_time_window_contains_everything() {
        let (start, end) = Period::AllTime.window(at("2026-08-19T00:00:00Z"));
        assert!(start < at("1971-01-01T00:00:00Z"));
        assert!(end > at("2999-01-01T00:00:00Z"));
    }

    #[test]
    fn period_parses_from_string() {
        assert_eq!("daily".parse::<Period>().unwrap(), Period::Daily);
        assert_eq!("ALLTIME".parse::<Period>().unwrap(), Period::AllTime);
        assert_eq!("all-time".parse::<Period>().unwrap(), Period::AllTime);
        assert!("yearly".parse::<Period>().is_err());
    }
}
