use chrono::{Datelike, Duration, NaiveDate};

/// Get the last day of a given month.
pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap() - Duration::days(1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap() - Duration::days(1)
    }
}

/// Get the quarter (1-4) for a given date.
pub fn quarter_of(d: NaiveDate) -> u8 {
    ((d.month() - 1) / 3 + 1) as u8
}

/// Get the Monday of the ISO week containing the given date.
pub fn week_monday(d: NaiveDate) -> NaiveDate {
    d - Duration::days(d.weekday().num_days_from_monday() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_day_of_month() {
        assert_eq!(
            last_day_of_month(2025, 1),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap()
        );
        assert_eq!(
            last_day_of_month(2025, 2),
            NaiveDate::from_ymd_opt(2025, 2, 28).unwrap()
        );
        assert_eq!(
            last_day_of_month(2024, 2),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        ); // Leap year
        assert_eq!(
            last_day_of_month(2025, 12),
            NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()
        );
    }

    #[test]
    fn test_quarter_of() {
        assert_eq!(quarter_of(NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()), 1);
        assert_eq!(quarter_of(NaiveDate::from_ymd_opt(2025, 3, 31).unwrap()), 1);
        assert_eq!(quarter_of(NaiveDate::from_ymd_opt(2025, 4, 1).unwrap()), 2);
        assert_eq!(quarter_of(NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()), 2);
        assert_eq!(quarter_of(NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()), 3);
        assert_eq!(
            quarter_of(NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()),
            4
        );
    }

    #[test]
    fn test_week_monday() {
        // 2024-07-24 is a Wednesday
        let wed = NaiveDate::from_ymd_opt(2024, 7, 24).unwrap();
        assert_eq!(
            week_monday(wed),
            NaiveDate::from_ymd_opt(2024, 7, 22).unwrap()
        );
        let mon = NaiveDate::from_ymd_opt(2024, 7, 22).unwrap();
        assert_eq!(week_monday(mon), mon);
        let sun = NaiveDate::from_ymd_opt(2024, 7, 28).unwrap();
        assert_eq!(
            week_monday(sun),
            NaiveDate::from_ymd_opt(2024, 7, 22).unwrap()
        );
    }

    #[test]
    fn test_week_monday_crosses_month() {
        // 2024-08-01 is a Thursday in the week of Monday 2024-07-29
        let d = NaiveDate::from_ymd_opt(2024, 8, 1).unwrap();
        assert_eq!(
            week_monday(d),
            NaiveDate::from_ymd_opt(2024, 7, 29).unwrap()
        );
    }
}
