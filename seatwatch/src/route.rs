//! The route being watched and the shape of a probe result.
use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Remaining-seat text reported for a slot the source did not list.
pub const NOT_AVAILABLE: &str = "N/A";

const TIME_FORMAT: &str = "%H:%M";
const MONTH_SUFFIX: char = '월';
const DAY_SUFFIX: char = '일';

/// A route/date/time-set to watch for seats.
///
/// Immutable once a job has been created for it. Construct through [`RouteQuery::new`] or call
/// [`RouteQuery::validated`] on deserialized input, both of which normalize the target times
/// into ascending `HH:MM` order without duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteQuery {
    pub departure_id: String,
    pub arrival_id: String,
    /// Month as shown by the source, e.g. `"11"` or `"11월"`.
    pub target_month: String,
    /// Day of month, e.g. `"18"` or `"18일"`.
    pub target_date: String,
    pub target_times: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("{0} terminal id must not be empty")]
    EmptyTerminal(&'static str),
    #[error("At least one target time is required")]
    NoTargetTimes,
    #[error("Invalid target time {0:?}, expected HH:MM")]
    InvalidTime(String),
    #[error("Invalid target month {0:?}")]
    InvalidMonth(String),
    #[error("Invalid target date {0:?}")]
    InvalidDate(String),
    #[error("Day {day} does not exist in month {month}")]
    NonexistentDate { month: u32, day: u32 },
}

impl RouteQuery {
    pub fn new(
        departure_id: impl Into<String>,
        arrival_id: impl Into<String>,
        target_month: impl Into<String>,
        target_date: impl Into<String>,
        target_times: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, RouteError> {
        Self {
            departure_id: departure_id.into(),
            arrival_id: arrival_id.into(),
            target_month: target_month.into(),
            target_date: target_date.into(),
            target_times: target_times.into_iter().map(Into::into).collect(),
        }
        .validated()
    }

    /// Checks every field and normalizes `target_times`.
    pub fn validated(mut self) -> Result<Self, RouteError> {
        if self.departure_id.trim().is_empty() {
            return Err(RouteError::EmptyTerminal("departure"));
        }
        if self.arrival_id.trim().is_empty() {
            return Err(RouteError::EmptyTerminal("arrival"));
        }
        self.month()?;
        self.day()?;
        let times = self
            .target_times
            .iter()
            .map(|time| parse_time(time))
            .collect::<Result<BTreeSet<_>, _>>()?;
        if times.is_empty() {
            return Err(RouteError::NoTargetTimes);
        }
        self.target_times = times
            .into_iter()
            .map(|time| time.format(TIME_FORMAT).to_string())
            .collect();
        Ok(self)
    }

    pub fn month(&self) -> Result<u32, RouteError> {
        strip_suffix(&self.target_month, MONTH_SUFFIX)
            .parse::<u32>()
            .ok()
            .filter(|month| (1..=12).contains(month))
            .ok_or_else(|| RouteError::InvalidMonth(self.target_month.clone()))
    }

    pub fn day(&self) -> Result<u32, RouteError> {
        strip_suffix(&self.target_date, DAY_SUFFIX)
            .parse::<u32>()
            .ok()
            .filter(|day| (1..=31).contains(day))
            .ok_or_else(|| RouteError::InvalidDate(self.target_date.clone()))
    }

    /// The latest of the target times.
    pub fn latest_time(&self) -> Result<NaiveTime, RouteError> {
        self.target_times
            .iter()
            .map(|time| parse_time(time))
            .try_fold(None, |latest: Option<NaiveTime>, time| {
                time.map(|time| Some(latest.map_or(time, |latest| latest.max(time))))
            })?
            .ok_or(RouteError::NoTargetTimes)
    }

    /// The instant after which probing this route is pointless: the latest target time on the
    /// target day, read as civil time in `time_zone`.
    ///
    /// The year is the current year in `time_zone`, or the next one when the target month has
    /// already passed.
    pub fn deadline(&self, time_zone: Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>, RouteError> {
        let (month, day) = (self.month()?, self.day()?);
        let local_now = now.with_timezone(&time_zone);
        let year = if month < local_now.month() {
            local_now.year() + 1
        } else {
            local_now.year()
        };
        let date = NaiveDate::from_ymd_opt(year, month, day)
            .ok_or(RouteError::NonexistentDate { month, day })?;
        time_zone
            .from_local_datetime(&date.and_time(self.latest_time()?))
            .earliest()
            .map(|deadline| deadline.with_timezone(&Utc))
            .ok_or(RouteError::NonexistentDate { month, day })
    }
}

fn strip_suffix(value: &str, suffix: char) -> &str {
    let value = value.trim();
    value.strip_suffix(suffix).unwrap_or(value).trim()
}

fn parse_time(value: &str) -> Result<NaiveTime, RouteError> {
    let trimmed = value.trim();
    match trimmed.split_once(':') {
        Some((hours, minutes)) if !hours.is_empty() && minutes.len() == 2 => {
            NaiveTime::parse_from_str(trimmed, TIME_FORMAT)
                .map_err(|_| RouteError::InvalidTime(value.to_owned()))
        }
        _ => Err(RouteError::InvalidTime(value.to_owned())),
    }
}

/// Availability for a single departure time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlotResult {
    pub time: String,
    pub remaining_seats_text: String,
    pub status_text: String,
    pub has_seats: bool,
}

impl TimeSlotResult {
    /// A slot the source did not list at all.
    pub fn not_listed(time: impl Into<String>) -> Self {
        Self {
            time: time.into(),
            remaining_seats_text: NOT_AVAILABLE.to_owned(),
            status_text: NOT_AVAILABLE.to_owned(),
            has_seats: false,
        }
    }
}

/// What a single probe of a route observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeOutcome {
    pub checked_at: DateTime<Utc>,
    pub results: Vec<TimeSlotResult>,
    pub found_seats: bool,
    /// False when the probe ran but could not read the source.
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_found_time: Option<String>,
    pub duration_ms: u64,
}

impl ProbeOutcome {
    /// Builds an outcome with one result per target time of `route`, in target order.
    ///
    /// Slots missing from `listed` are reported as [`TimeSlotResult::not_listed`].
    pub fn from_slots(
        route: &RouteQuery,
        listed: Vec<TimeSlotResult>,
        checked_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        let results: Vec<_> = route
            .target_times
            .iter()
            .map(|time| {
                listed
                    .iter()
                    .find(|slot| slot.time == *time)
                    .cloned()
                    .unwrap_or_else(|| TimeSlotResult::not_listed(time.as_str()))
            })
            .collect();
        let first_found_time = results
            .iter()
            .find(|slot| slot.has_seats)
            .map(|slot| slot.time.clone());
        Self {
            checked_at,
            found_seats: first_found_time.is_some(),
            first_found_time,
            results,
            succeeded: true,
            error_message: None,
            duration_ms,
        }
    }

    /// An outcome recording that the source could not be read.
    pub fn failed(message: impl Into<String>, checked_at: DateTime<Utc>, duration_ms: u64) -> Self {
        Self {
            checked_at,
            results: Vec::new(),
            found_seats: false,
            succeeded: false,
            error_message: Some(message.into()),
            first_found_time: None,
            duration_ms,
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    impl RouteQuery {
        pub(crate) fn mock() -> Self {
            Self::new("4100", "3600", "11월", "18", ["18:40", "19:40"]).unwrap()
        }
    }

    impl TimeSlotResult {
        pub(crate) fn mock(time: &str, has_seats: bool) -> Self {
            Self {
                time: time.to_owned(),
                remaining_seats_text: if has_seats { "3석" } else { "0석" }.to_owned(),
                status_text: if has_seats { "예매가능" } else { "매진" }.to_owned(),
                has_seats,
            }
        }
    }

    fn kst(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Seoul
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn times_are_sorted_and_deduplicated() {
        let route = RouteQuery::new("a", "b", "3", "1", ["19:40", "08:05", "19:40", "8:05"]).unwrap();

        assert_eq!(route.target_times, vec!["08:05", "19:40"]);
    }

    #[test]
    fn invalid_fields_are_rejected() {
        assert_matches!(
            RouteQuery::new("", "b", "3", "1", ["10:00"]),
            Err(RouteError::EmptyTerminal("departure"))
        );
        assert_matches!(
            RouteQuery::new("a", "b", "13", "1", ["10:00"]),
            Err(RouteError::InvalidMonth(_))
        );
        assert_matches!(
            RouteQuery::new("a", "b", "3", "32일", ["10:00"]),
            Err(RouteError::InvalidDate(_))
        );
        assert_matches!(
            RouteQuery::new("a", "b", "3", "1", ["24:00"]),
            Err(RouteError::InvalidTime(_))
        );
        assert_matches!(
            RouteQuery::new("a", "b", "3", "1", ["1000"]),
            Err(RouteError::InvalidTime(_))
        );
        assert_matches!(
            RouteQuery::new("a", "b", "3", "1", Vec::<String>::new()),
            Err(RouteError::NoTargetTimes)
        );
    }

    #[test]
    fn deadline_uses_latest_time_in_source_zone() {
        let route = RouteQuery::new("a", "b", "11월", "18일", ["09:00", "18:40"]).unwrap();
        let now = kst(2025, 11, 18, 12, 0);

        let deadline = route.deadline(chrono_tz::Asia::Seoul, now).unwrap();

        assert_eq!(deadline, kst(2025, 11, 18, 18, 40));
        assert_eq!(deadline - kst(2025, 11, 18, 9, 40), TimeDelta::hours(9));
    }

    #[test]
    fn deadline_rolls_into_next_year_for_past_months() {
        let route = RouteQuery::new("a", "b", "1", "5", ["07:00"]).unwrap();
        let now = kst(2025, 12, 30, 12, 0);

        let deadline = route.deadline(chrono_tz::Asia::Seoul, now).unwrap();

        assert_eq!(deadline, kst(2026, 1, 5, 7, 0));
    }

    #[test]
    fn deadline_rejects_nonexistent_dates() {
        let route = RouteQuery::new("a", "b", "2", "30", ["07:00"]).unwrap();

        assert_matches!(
            route.deadline(chrono_tz::Asia::Seoul, kst(2025, 1, 1, 0, 0)),
            Err(RouteError::NonexistentDate { month: 2, day: 30 })
        );
    }

    #[test]
    fn from_slots_fills_unlisted_times() {
        let route = RouteQuery::mock();
        let outcome = ProbeOutcome::from_slots(
            &route,
            vec![TimeSlotResult::mock("19:40", true), TimeSlotResult::mock("21:00", true)],
            Utc::now(),
            120,
        );

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0], TimeSlotResult::not_listed("18:40"));
        assert_eq!(outcome.results[0].remaining_seats_text, NOT_AVAILABLE);
        assert!(outcome.found_seats);
        assert!(outcome.succeeded);
        assert_eq!(outcome.first_found_time.as_deref(), Some("19:40"));
    }

    #[test]
    fn route_query_uses_camel_case() {
        let json = serde_json::to_value(RouteQuery::mock()).unwrap();

        assert_eq!(json["departureId"], "4100");
        assert_eq!(json["targetTimes"][1], "19:40");
    }
}
