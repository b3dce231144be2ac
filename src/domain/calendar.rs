use crate::domain::holidays::holiday_name;
use crate::domain::models::iso_key;
use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
use serde::Serialize;
use std::ops::RangeInclusive;

pub const GRID_CELLS: usize = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    first_day: NaiveDate,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|first_day| Self { first_day })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            first_day: date.with_day(1).unwrap_or(date),
        }
    }

    pub fn year(&self) -> i32 {
        self.first_day.year()
    }

    pub fn month(&self) -> u32 {
        self.first_day.month()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.first_day
    }

    pub fn last_day(&self) -> NaiveDate {
        self.next()
            .first_day
            .pred_opt()
            .unwrap_or(self.first_day)
    }

    pub fn next(&self) -> Self {
        Self {
            first_day: self
                .first_day
                .checked_add_months(Months::new(1))
                .unwrap_or(self.first_day),
        }
    }

    pub fn prev(&self) -> Self {
        Self {
            first_day: self
                .first_day
                .checked_sub_months(Months::new(1))
                .unwrap_or(self.first_day),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year() && date.month() == self.month()
    }

    /// First date on or before the 1st that falls on `week_start`.
    pub fn grid_start(&self, week_start: Weekday) -> NaiveDate {
        let offset = (self.first_day.weekday().num_days_from_monday() + 7
            - week_start.num_days_from_monday())
            % 7;
        self.first_day
            .checked_sub_days(Days::new(u64::from(offset)))
            .unwrap_or(self.first_day)
    }

    /// Dates covered by the 42-cell grid, padding included.
    pub fn grid_range(&self, week_start: Weekday) -> RangeInclusive<NaiveDate> {
        let start = self.grid_start(week_start);
        let end = start
            .checked_add_days(Days::new(GRID_CELLS as u64 - 1))
            .unwrap_or(start);
        start..=end
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DayCell {
    pub date: NaiveDate,
    pub iso_key: String,
    pub in_current_month: bool,
    pub is_today: bool,
    pub weekday: Weekday,
    pub holiday: Option<&'static str>,
}

/// Six full weeks starting on `week_start`, padded with the tail of the
/// previous month and the head of the next.
pub fn build_month(month: YearMonth, today: NaiveDate, week_start: Weekday) -> Vec<DayCell> {
    month
        .grid_start(week_start)
        .iter_days()
        .take(GRID_CELLS)
        .map(|date| DayCell {
            date,
            iso_key: iso_key(date),
            in_current_month: month.contains(date),
            is_today: date == today,
            weekday: date.weekday(),
            holiday: holiday_name(date),
        })
        .collect()
}
