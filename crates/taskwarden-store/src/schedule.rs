//! Weekly day/time schedules: `{"0": ["09:00", "13:30"], "4": ["18:00"]}`.
//!
//! Day 0 is Monday, 6 is Sunday (chrono's `num_days_from_monday`). Times are
//! local wall-clock minutes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Day of week, 0 = Monday … 6 = Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DayOfWeek(u8);

impl DayOfWeek {
    pub const MONDAY: DayOfWeek = DayOfWeek(0);
    pub const SUNDAY: DayOfWeek = DayOfWeek(6);

    pub fn new(day: u8) -> Result<Self> {
        if day <= 6 {
            Ok(Self(day))
        } else {
            Err(StoreError::Configuration(format!(
                "day of week must be 0 (Monday) to 6 (Sunday), got {day}"
            )))
        }
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn short_name(self) -> &'static str {
        DAY_NAMES[self.0 as usize]
    }
}

impl From<Weekday> for DayOfWeek {
    fn from(day: Weekday) -> Self {
        Self(day.num_days_from_monday() as u8)
    }
}

impl TryFrom<u8> for DayOfWeek {
    type Error = StoreError;

    fn try_from(day: u8) -> Result<Self> {
        Self::new(day)
    }
}

impl From<DayOfWeek> for u8 {
    fn from(day: DayOfWeek) -> u8 {
        day.0
    }
}

impl FromStr for DayOfWeek {
    type Err = StoreError;

    /// Accepts `0`–`6` or an English day name / three-letter prefix.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Self::new(n);
        }
        let lower = s.to_ascii_lowercase();
        DAY_NAMES
            .iter()
            .position(|name| lower.len() >= 3 && lower.starts_with(&name.to_ascii_lowercase()))
            .map(|i| Self(i as u8))
            .ok_or_else(|| StoreError::Configuration(format!("unknown day of week: '{s}'")))
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Minute-granularity time of day, rendered as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(StoreError::Configuration(format!(
                "time out of range: {hour}:{minute:02}"
            )));
        }
        Ok(Self { hour, minute })
    }

    /// Truncate a timestamp to its schedule slot.
    pub fn of(at: &NaiveDateTime) -> Self {
        Self {
            hour: at.hour() as u8,
            minute: at.minute() as u8,
        }
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }
}

impl FromStr for TimeOfDay {
    type Err = StoreError;

    /// Parses `HH:MM` (a single-digit hour is accepted and normalized).
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || StoreError::Configuration(format!("invalid time '{s}', expected HH:MM"));
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(invalid());
        }
        let hour = h.parse::<u8>().map_err(|_| invalid())?;
        let minute = m.parse::<u8>().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> String {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Day-of-week → set of times. Days without times are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeeklySchedule(BTreeMap<DayOfWeek, BTreeSet<TimeOfDay>>);

impl WeeklySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly for tests and the CLI.
    pub fn at(mut self, day: DayOfWeek, time: TimeOfDay) -> Self {
        self.insert(day, time);
        self
    }

    pub fn insert(&mut self, day: DayOfWeek, time: TimeOfDay) {
        self.0.entry(day).or_default().insert(time);
    }

    /// Parse one `DAY=HH:MM[,HH:MM…]` entry and merge it in.
    pub fn add_entry(&mut self, entry: &str) -> Result<()> {
        let (day, times) = entry.split_once('=').ok_or_else(|| {
            StoreError::Configuration(format!(
                "invalid schedule entry '{entry}', expected DAY=HH:MM[,HH:MM]"
            ))
        })?;
        let day: DayOfWeek = day.parse()?;
        for time in times.split(',').filter(|t| !t.trim().is_empty()) {
            self.insert(day, time.parse()?);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeSet::is_empty)
    }

    pub fn times_on(&self, day: DayOfWeek) -> impl Iterator<Item = TimeOfDay> + '_ {
        self.0.get(&day).into_iter().flat_map(|set| set.iter().copied())
    }

    /// All (day, time) slots in day order.
    pub fn slots(&self) -> impl Iterator<Item = (DayOfWeek, TimeOfDay)> + '_ {
        self.0
            .iter()
            .flat_map(|(day, times)| times.iter().map(move |t| (*day, *t)))
    }

    /// Drop days that ended up with no times.
    pub fn normalize(&mut self) {
        self.0.retain(|_, times| !times.is_empty());
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut schedule: WeeklySchedule =
            serde_json::from_str(json).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        schedule.normalize();
        Ok(schedule)
    }

    /// First slot strictly after `from`, looking at most one week ahead.
    pub fn next_after(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        let today = from.date();
        (0..=7).find_map(|offset| {
            let date = today + Duration::days(offset);
            let day = DayOfWeek::from(date.weekday());
            self.times_on(day)
                .filter_map(|t| date.and_hms_opt(t.hour as u32, t.minute as u32, 0))
                .find(|candidate| *candidate > from)
        })
    }

    /// Human-readable form: `Mon 09:00, 13:30; Fri 18:00`.
    pub fn describe(&self) -> String {
        if self.is_empty() {
            return "unscheduled".to_string();
        }
        self.0
            .iter()
            .filter(|(_, times)| !times.is_empty())
            .map(|(day, times)| {
                let times: Vec<String> = times.iter().map(TimeOfDay::to_string).collect();
                format!("{day} {}", times.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}
