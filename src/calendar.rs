//! Trading calendar collaborators

use crate::error::{PipelineError, Result};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// Trading calendar trait
///
/// The engine only needs `trading_dates` and `prior_dates`; the remaining
/// methods are the building blocks their default implementations use.
pub trait TradingCalendar: Send + Sync {
    /// Check if a date is a trading day
    fn is_trading_day(&self, date: NaiveDate) -> bool;

    /// Get the next trading day after the given date
    fn next_trading_day(&self, date: NaiveDate) -> Result<NaiveDate> {
        let mut current = date + Duration::days(1);
        for _ in 0..365 {
            if self.is_trading_day(current) {
                return Ok(current);
            }
            current = current + Duration::days(1);
        }
        Err(PipelineError::Calendar(format!(
            "No trading day found within 365 days after {}",
            date
        )))
    }

    /// Get the previous trading day before the given date
    fn previous_trading_day(&self, date: NaiveDate) -> Result<NaiveDate> {
        let mut current = date - Duration::days(1);
        for _ in 0..365 {
            if self.is_trading_day(current) {
                return Ok(current);
            }
            current = current - Duration::days(1);
        }
        Err(PipelineError::Calendar(format!(
            "No trading day found within 365 days before {}",
            date
        )))
    }

    /// All trading dates between two dates (inclusive), ascending
    fn trading_dates(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut current = start;

        while current <= end {
            if self.is_trading_day(current) {
                days.push(current);
            }
            current = current + Duration::days(1);
        }

        days
    }

    /// Up to `count` trading dates strictly before `date`, ascending.
    ///
    /// Returns fewer than `count` dates when the calendar runs out of history.
    fn prior_dates(&self, date: NaiveDate, count: usize) -> Vec<NaiveDate> {
        let mut dates = Vec::with_capacity(count);
        let mut current = date;

        while dates.len() < count {
            match self.previous_trading_day(current) {
                Ok(prev) => {
                    dates.push(prev);
                    current = prev;
                }
                Err(_) => break,
            }
        }

        dates.reverse();
        dates
    }
}

/// Weekday calendar with holidays and an optional first session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeekdayCalendar {
    /// Sorted list of holiday dates
    holidays: Vec<NaiveDate>,
    /// Dates before this are not trading days
    first_session: Option<NaiveDate>,
}

impl WeekdayCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calendar with the fixed-date US market holidays for the given years
    pub fn us_equities(years: impl IntoIterator<Item = i32>) -> Self {
        let mut calendar = Self::new();
        for year in years {
            for (month, day) in [(1, 1), (6, 19), (7, 4), (12, 25)] {
                if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                    calendar.add_holiday(date);
                }
            }
        }
        calendar
    }

    /// Add a custom holiday
    pub fn add_holiday(&mut self, date: NaiveDate) {
        if let Err(pos) = self.holidays.binary_search(&date) {
            self.holidays.insert(pos, date);
        }
    }

    pub fn with_first_session(mut self, date: NaiveDate) -> Self {
        self.first_session = Some(date);
        self
    }

    pub fn first_session(&self) -> Option<NaiveDate> {
        self.first_session
    }

    fn is_weekend(date: NaiveDate) -> bool {
        matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

impl TradingCalendar for WeekdayCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        if self.first_session.map_or(false, |first| date < first) {
            return false;
        }
        !Self::is_weekend(date) && self.holidays.binary_search(&date).is_err()
    }

    fn previous_trading_day(&self, date: NaiveDate) -> Result<NaiveDate> {
        let mut current = date - Duration::days(1);
        for _ in 0..365 {
            if self.first_session.map_or(false, |first| current < first) {
                break;
            }
            if self.is_trading_day(current) {
                return Ok(current);
            }
            current = current - Duration::days(1);
        }
        Err(PipelineError::Calendar(format!(
            "No trading day before {}",
            date
        )))
    }
}

/// Calendar backed by an explicit list of sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionCalendar {
    sessions: Vec<NaiveDate>,
}

impl SessionCalendar {
    /// Build from any collection of dates; duplicates are dropped
    pub fn new(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        let mut sessions: Vec<NaiveDate> = dates.into_iter().collect();
        sessions.sort();
        sessions.dedup();
        Self { sessions }
    }

    pub fn sessions(&self) -> &[NaiveDate] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl TradingCalendar for SessionCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.sessions.binary_search(&date).is_ok()
    }

    fn next_trading_day(&self, date: NaiveDate) -> Result<NaiveDate> {
        let idx = self.sessions.partition_point(|d| *d <= date);
        self.sessions
            .get(idx)
            .copied()
            .ok_or_else(|| PipelineError::Calendar(format!("No session after {}", date)))
    }

    fn previous_trading_day(&self, date: NaiveDate) -> Result<NaiveDate> {
        let idx = self.sessions.partition_point(|d| *d < date);
        if idx == 0 {
            return Err(PipelineError::Calendar(format!(
                "No session before {}",
                date
            )));
        }
        Ok(self.sessions[idx - 1])
    }

    fn trading_dates(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let lo = self.sessions.partition_point(|d| *d < start);
        let hi = self.sessions.partition_point(|d| *d <= end);
        if lo >= hi {
            return Vec::new();
        }
        self.sessions[lo..hi].to_vec()
    }

    fn prior_dates(&self, date: NaiveDate, count: usize) -> Vec<NaiveDate> {
        let idx = self.sessions.partition_point(|d| *d < date);
        self.sessions[idx.saturating_sub(count)..idx].to_vec()
    }
}
