use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use regex::Regex;

use crate::date_util::{last_day_of_month, quarter_of, week_monday};
use crate::error::{Error, Result};

static RE_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").unwrap());
static RE_WEEK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-W(\d{1,2})$").unwrap());
static RE_QUARTER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-Q([1-4])$").unwrap());
static RE_MONTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})$").unwrap());

/// Report granularity, coarsest to finest roll-up level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Annual,
}

impl Granularity {
    pub const ALL: [Granularity; 5] = [
        Granularity::Daily,
        Granularity::Weekly,
        Granularity::Monthly,
        Granularity::Quarterly,
        Granularity::Annual,
    ];

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "daily" | "day" => Ok(Granularity::Daily),
            "weekly" | "week" => Ok(Granularity::Weekly),
            "monthly" | "month" => Ok(Granularity::Monthly),
            "quarterly" | "quarter" => Ok(Granularity::Quarterly),
            "annual" | "year" | "yearly" => Ok(Granularity::Annual),
            other => Err(Error::PeriodParse(format!(
                "unrecognized granularity: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Weekly => "weekly",
            Granularity::Monthly => "monthly",
            Granularity::Quarterly => "quarterly",
            Granularity::Annual => "annual",
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete reporting period, identified by a canonical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Day(NaiveDate),
    Week(i32, u8),
    Month(i32, u8),
    Quarter(i32, u8),
    Year(i32),
}

impl Period {
    /// Parse a period key.
    ///
    /// Supported formats:
    /// - `2024-07-27` — day
    /// - `2024-W30` — ISO week
    /// - `2024-07` — month
    /// - `2024-Q3` — quarter
    /// - `2024` — year
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();

        // Year: "2024"
        if s.len() == 4 {
            if let Ok(year) = s.parse::<i32>() {
                return Ok(Period::Year(year));
            }
        }

        // Day: "2024-07-27"
        if RE_DATE.is_match(s) {
            let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| Error::PeriodParse(format!("invalid date: {s}")))?;
            return Ok(Period::Day(date));
        }

        // Week: "2024-W30"
        if let Some(caps) = RE_WEEK.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let week: u8 = caps[2].parse().unwrap();
            if (1..=53).contains(&week)
                && NaiveDate::from_isoywd_opt(year, week as u32, Weekday::Mon).is_some()
            {
                return Ok(Period::Week(year, week));
            }
        }

        // Quarter: "2024-Q1" through "2024-Q4"
        if let Some(caps) = RE_QUARTER.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let q: u8 = caps[2].parse().unwrap();
            return Ok(Period::Quarter(year, q));
        }

        // Month: "2024-07"
        if let Some(caps) = RE_MONTH.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let month: u8 = caps[2].parse().unwrap();
            if (1..=12).contains(&month) {
                return Ok(Period::Month(year, month));
            }
        }

        Err(Error::PeriodParse(format!("unrecognized period: {s}")))
    }

    /// Parse a period key and require it to match the given granularity.
    pub fn parse_for(granularity: Granularity, s: &str) -> Result<Self> {
        let p = Period::parse(s)?;
        if p.granularity() != granularity {
            return Err(Error::PeriodParse(format!(
                "period {s} is {}, expected {granularity}",
                p.granularity()
            )));
        }
        Ok(p)
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Period::Day(_) => Granularity::Daily,
            Period::Week(_, _) => Granularity::Weekly,
            Period::Month(_, _) => Granularity::Monthly,
            Period::Quarter(_, _) => Granularity::Quarterly,
            Period::Year(_) => Granularity::Annual,
        }
    }

    /// Convert to the canonical key string used for cache rows and file names.
    pub fn to_key(&self) -> String {
        match self {
            Period::Day(d) => d.format("%Y-%m-%d").to_string(),
            Period::Week(y, w) => format!("{y}-W{w:02}"),
            Period::Month(y, m) => format!("{y}-{m:02}"),
            Period::Quarter(y, q) => format!("{y}-Q{q}"),
            Period::Year(y) => format!("{y}"),
        }
    }

    /// Get the date range (inclusive start, inclusive end) for this period.
    /// Weeks run Monday through Sunday per ISO 8601.
    pub fn date_range(&self) -> (NaiveDate, NaiveDate) {
        match self {
            Period::Day(d) => (*d, *d),
            Period::Week(y, w) => {
                let start = NaiveDate::from_isoywd_opt(*y, *w as u32, Weekday::Mon).unwrap();
                (start, start + Duration::days(6))
            }
            Period::Month(y, m) => (
                NaiveDate::from_ymd_opt(*y, *m as u32, 1).unwrap(),
                last_day_of_month(*y, *m as u32),
            ),
            Period::Quarter(y, q) => {
                let start_month = (*q as u32 - 1) * 3 + 1;
                let end_month = *q as u32 * 3;
                (
                    NaiveDate::from_ymd_opt(*y, start_month, 1).unwrap(),
                    last_day_of_month(*y, end_month),
                )
            }
            Period::Year(y) => (
                NaiveDate::from_ymd_opt(*y, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(*y, 12, 31).unwrap(),
            ),
        }
    }

    /// The immediate sub-periods that roll up into this one.
    ///
    /// A week decomposes into its seven days. A month decomposes into the ISO
    /// weeks whose Monday falls inside the month, so a week straddling a month
    /// boundary belongs to exactly one month. A quarter decomposes into its
    /// three months and a year into its four quarters. Days have no children.
    pub fn children(&self) -> Vec<Period> {
        match self {
            Period::Day(_) => Vec::new(),
            Period::Week(_, _) => {
                let (start, _) = self.date_range();
                (0..7)
                    .map(|i| Period::Day(start + Duration::days(i)))
                    .collect()
            }
            Period::Month(y, m) => {
                let first = NaiveDate::from_ymd_opt(*y, *m as u32, 1).unwrap();
                let last = last_day_of_month(*y, *m as u32);
                let mut monday = week_monday(first);
                if monday < first {
                    monday += Duration::days(7);
                }
                let mut weeks = Vec::new();
                while monday <= last {
                    let iw = monday.iso_week();
                    weeks.push(Period::Week(iw.year(), iw.week() as u8));
                    monday += Duration::days(7);
                }
                weeks
            }
            Period::Quarter(y, q) => {
                let start_month = (*q - 1) * 3 + 1;
                (start_month..start_month + 3)
                    .map(|m| Period::Month(*y, m))
                    .collect()
            }
            Period::Year(y) => (1..=4).map(|q| Period::Quarter(*y, q)).collect(),
        }
    }

    /// Get the previous period of the same type.
    pub fn previous(&self) -> Self {
        match self {
            Period::Day(d) => Period::Day(*d - Duration::days(1)),
            Period::Week(y, w) => {
                let monday = NaiveDate::from_isoywd_opt(*y, *w as u32, Weekday::Mon).unwrap()
                    - Duration::days(7);
                let iw = monday.iso_week();
                Period::Week(iw.year(), iw.week() as u8)
            }
            Period::Month(y, m) => {
                if *m == 1 {
                    Period::Month(y - 1, 12)
                } else {
                    Period::Month(*y, m - 1)
                }
            }
            Period::Quarter(y, q) => {
                if *q == 1 {
                    Period::Quarter(y - 1, 4)
                } else {
                    Period::Quarter(*y, q - 1)
                }
            }
            Period::Year(y) => Period::Year(y - 1),
        }
    }

    /// The most recent fully elapsed period of the given granularity as of
    /// `today`. This is what the scheduled jobs report on.
    pub fn previous_complete(granularity: Granularity, today: NaiveDate) -> Self {
        match granularity {
            Granularity::Daily => Period::Day(today - Duration::days(1)),
            Granularity::Weekly => {
                let iw = today.iso_week();
                Period::Week(iw.year(), iw.week() as u8).previous()
            }
            Granularity::Monthly => Period::Month(today.year(), today.month() as u8).previous(),
            Granularity::Quarterly => {
                Period::Quarter(today.year(), quarter_of(today)).previous()
            }
            Granularity::Annual => Period::Year(today.year() - 1),
        }
    }

    /// Returns true if this period contains today.
    pub fn is_current(&self) -> bool {
        let today = chrono::Local::now().date_naive();
        let (start, end) = self.date_range();
        today >= start && today <= end
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}
