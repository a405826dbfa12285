//! Five-field cron expressions (`minute hour day-of-month month day-of-week`).
//!
//! Supports `*`, single values, `N-M` ranges, comma lists, `/STEP`, month and
//! weekday names, and the usual `@daily`-style macros. Evaluation walks the
//! calendar field by field instead of minute by minute, so even yearly rules
//! resolve quickly.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike,
};

/// How far [`CronSchedule::next_after`] and [`CronSchedule::prev_at_or_before`]
/// search before giving up on an expression that never fires (`0 0 30 2 *`).
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// Error returned when a cron expression cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid {field} field: {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error("unknown macro: {0}")]
    UnknownMacro(String),
}

#[derive(Debug, Clone, Copy)]
struct Field {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: Field = Field {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOUR: Field = Field {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAY_OF_MONTH: Field = Field {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTH: Field = Field {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ],
};
const DAY_OF_WEEK: Field = Field {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
};

impl Field {
    fn value(&self, token: &str) -> Option<u32> {
        let value = match token.parse::<u32>() {
            Ok(v) => v,
            Err(_) => {
                let lower = token.to_ascii_lowercase();
                self.names.iter().position(|n| *n == lower)? as u32 + self.min
            }
        };
        (self.min..=self.max).contains(&value).then_some(value)
    }

    /// Parse one field into a bitmask with bit `n` set when value `n` matches.
    fn parse(&self, text: &str) -> Result<u64, CronError> {
        let invalid = || CronError::InvalidField {
            field: self.name,
            value: text.to_string(),
        };

        let mut bits = 0u64;
        for item in text.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step.parse::<u32>().map_err(|_| invalid())?)),
                None => (item, None),
            };
            if step == Some(0) {
                return Err(invalid());
            }

            let (lo, hi) = if range == "*" {
                (self.min, self.max)
            } else if let Some((lo, hi)) = range.split_once('-') {
                (
                    self.value(lo).ok_or_else(invalid)?,
                    self.value(hi).ok_or_else(invalid)?,
                )
            } else {
                let v = self.value(range).ok_or_else(invalid)?;
                // `N/STEP` runs from N to the end of the field.
                (v, if step.is_some() { self.max } else { v })
            };
            if lo > hi {
                return Err(invalid());
            }

            let step = step.unwrap_or(1);
            let mut v = lo;
            while v <= hi {
                bits |= 1 << v;
                v = match v.checked_add(step) {
                    Some(next) => next,
                    None => break,
                };
            }
        }
        Ok(bits)
    }
}

fn has(bits: u64, value: u32) -> bool {
    value < 64 && bits & (1 << value) != 0
}

/// A parsed recurrence rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    /// Both day fields are restricted, so either one matching is enough.
    day_or: bool,
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let expression = s.trim();
        let expanded = match expression.strip_prefix('@') {
            Some(name) => match name.to_ascii_lowercase().as_str() {
                "yearly" | "annually" => "0 0 1 1 *",
                "monthly" => "0 0 1 * *",
                "weekly" => "0 0 * * 0",
                "daily" | "midnight" => "0 0 * * *",
                "hourly" => "0 * * * *",
                _ => return Err(CronError::UnknownMacro(expression.to_string())),
            },
            None => expression,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut days_of_week = DAY_OF_WEEK.parse(fields[4])?;
        // 7 is an alias for Sunday.
        if has(days_of_week, 7) {
            days_of_week |= 1;
        }

        Ok(Self {
            expression: expression.to_string(),
            minutes: MINUTE.parse(fields[0])?,
            hours: HOUR.parse(fields[1])?,
            days_of_month: DAY_OF_MONTH.parse(fields[2])?,
            months: MONTH.parse(fields[3])?,
            days_of_week,
            day_or: !fields[2].starts_with('*') && !fields[4].starts_with('*'),
        })
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl CronSchedule {
    /// Whether the rule fires at the given wall-clock minute.
    pub fn matches(&self, t: &NaiveDateTime) -> bool {
        has(self.months, t.month())
            && self.matches_day(t.date())
            && has(self.hours, t.hour())
            && has(self.minutes, t.minute())
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        let dom = has(self.days_of_month, date.day());
        let dow = has(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.day_or {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// The most recent trigger at or before `at`.
    ///
    /// Returns `None` if the rule has not fired within the search horizon.
    pub fn prev_at_or_before<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = at.timezone();
        let start = floor_minute(at.naive_local())?;
        let limit = start - Duration::days(SEARCH_HORIZON_DAYS);
        let one = Duration::minutes(1);

        let mut t = start;
        while t >= limit {
            if !has(self.months, t.month()) {
                t = t.date().with_day(1)?.and_time(NaiveTime::MIN) - one;
                continue;
            }
            if !self.matches_day(t.date()) {
                t = t.date().and_time(NaiveTime::MIN) - one;
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = t.with_minute(0)? - one;
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t -= one;
                continue;
            }

            let found = match tz.from_local_datetime(&t) {
                LocalResult::Single(d) => Some(d),
                LocalResult::Ambiguous(early, late) => Some(if late <= *at { late } else { early }),
                LocalResult::None => None,
            };
            if let Some(d) = found.filter(|d| d <= at) {
                return Some(d);
            }
            t -= one;
        }
        None
    }

    /// The first trigger strictly after `at`.
    pub fn next_after<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = at.timezone();
        let start = floor_minute(at.naive_local())? + Duration::minutes(1);
        let limit = start + Duration::days(SEARCH_HORIZON_DAYS);
        let one = Duration::minutes(1);

        let mut t = start;
        while t <= limit {
            if !has(self.months, t.month()) {
                t = first_of_next_month(t.date())?.and_time(NaiveTime::MIN);
                continue;
            }
            if !self.matches_day(t.date()) {
                t = t.date().succ_opt()?.and_time(NaiveTime::MIN);
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t += one;
                continue;
            }

            let found = match tz.from_local_datetime(&t) {
                LocalResult::Single(d) => Some(d),
                LocalResult::Ambiguous(early, late) => Some(if early > *at { early } else { late }),
                LocalResult::None => None,
            };
            if let Some(d) = found.filter(|d| d > at) {
                return Some(d);
            }
            t += one;
        }
        None
    }
}

fn floor_minute(t: NaiveDateTime) -> Option<NaiveDateTime> {
    Some(t.date().and_time(NaiveTime::from_hms_opt(t.hour(), t.minute(), 0)?))
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
}
