//! Calendar arithmetic used by the schedule resolver.
//!
//! Weekdays are ISO numbered (Monday = 1 .. Sunday = 7). Weeks are
//! Monday-aligned.

use chrono::{Datelike, Duration, NaiveDate};

pub fn iso_weekday(date: NaiveDate) -> u32 {
    date.weekday().number_from_monday()
}

/// Number of days in `month` of `year`, or `None` for an invalid month.
pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    u32::try_from((next - first).num_days()).ok()
}

pub fn is_last_day_of_month(date: NaiveDate) -> bool {
    date.succ_opt().map_or(true, |next| next.month() != date.month())
}

/// ISO week of month.
///
/// Week 1 is the first Monday-aligned week holding at least four days of the
/// month. Days before it belong to week 0.
pub fn week_of_month(date: NaiveDate) -> u32 {
    let offset = date
        .with_day(1)
        .map_or(0, |first| first.weekday().num_days_from_monday());
    let first_week_is_full = 7 - offset >= 4;
    (date.day() - 1 + offset) / 7 + u32::from(first_week_is_full)
}

/// Whether no later day of the same month falls on the same weekday.
pub fn is_last_weekday_of_month(date: NaiveDate) -> bool {
    (date + Duration::days(7)).month() != date.month()
}

pub fn days_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to - from).num_days()
}

/// Calendar weeks between the Monday-aligned weeks holding `from` and `to`.
pub fn weeks_between(from: NaiveDate, to: NaiveDate) -> i64 {
    days_between(monday_of(from), monday_of(to)) / 7
}

fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(2023, 2), Some(28));
        assert_eq!(days_in_month(2024, 2), Some(29));
        assert_eq!(days_in_month(2024, 12), Some(31));
        assert_eq!(days_in_month(2024, 4), Some(30));
        assert_eq!(days_in_month(2024, 13), None);
    }

    #[test]
    fn test_last_day() {
        assert!(is_last_day_of_month(d(2023, 2, 28)));
        assert!(!is_last_day_of_month(d(2024, 2, 28)));
        assert!(is_last_day_of_month(d(2024, 12, 31)));
    }

    #[test]
    fn test_week_of_month() {
        // January 2024 starts on a Monday
        assert_eq!(week_of_month(d(2024, 1, 1)), 1);
        assert_eq!(week_of_month(d(2024, 1, 29)), 5);
        // February 2024 starts on a Thursday: its first week counts
        assert_eq!(week_of_month(d(2024, 2, 1)), 1);
        assert_eq!(week_of_month(d(2024, 2, 26)), 5);
        // March 2024 starts on a Friday: the first three days are week 0
        assert_eq!(week_of_month(d(2024, 3, 1)), 0);
        assert_eq!(week_of_month(d(2024, 3, 4)), 1);
        assert_eq!(week_of_month(d(2024, 3, 25)), 4);
    }

    #[test]
    fn test_last_weekday() {
        assert!(is_last_weekday_of_month(d(2024, 3, 25)));
        assert!(!is_last_weekday_of_month(d(2024, 3, 18)));
    }

    #[test]
    fn test_weeks_between_is_monday_aligned() {
        // Sunday to the following Monday is one week apart
        assert_eq!(weeks_between(d(2024, 1, 7), d(2024, 1, 8)), 1);
        assert_eq!(weeks_between(d(2024, 1, 1), d(2024, 1, 7)), 0);
        assert_eq!(weeks_between(d(2024, 1, 1), d(2024, 1, 15)), 2);
        assert_eq!(iso_weekday(d(2024, 1, 7)), 7);
    }
}
