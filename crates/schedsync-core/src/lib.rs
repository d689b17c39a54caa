//! Core schedule model: coordinates, raw and canonical event records, normalization.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "schedsync-core";

/// First season for which the upstream provider publishes detailed game data.
/// Archive backfill only covers seasons before this one.
pub const DETAILED_STATS_START_YEAR: i32 = 2009;

const REGULAR_SEASON_WEEKS: u32 = 17;

/// Season segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "PRE")]
    Pre,
    #[serde(rename = "REG")]
    Regular,
    #[serde(rename = "POST")]
    Post,
}

impl Phase {
    /// Iteration order used by the enumerator.
    pub const ALL: [Phase; 3] = [Phase::Pre, Phase::Regular, Phase::Post];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pre => "PRE",
            Phase::Regular => "REG",
            Phase::Post => "POST",
        }
    }

    /// Nominal week range for the phase.
    pub fn weeks(self) -> RangeInclusive<u32> {
        match self {
            Phase::Pre => 0..=4,
            Phase::Regular => 1..=REGULAR_SEASON_WEEKS,
            Phase::Post => 1..=4,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown season phase {0:?} (expected PRE, REG or POST)")]
pub struct UnknownPhase(pub String);

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PRE" => Ok(Phase::Pre),
            "REG" | "REGULAR" => Ok(Phase::Regular),
            "POST" => Ok(Phase::Post),
            _ => Err(UnknownPhase(s.to_string())),
        }
    }
}

/// Address of one fetch unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub year: i32,
    pub phase: Phase,
    pub week: u32,
}

impl Coordinate {
    pub fn new(year: i32, phase: Phase, week: u32) -> Self {
        Self { year, phase, week }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.year, self.phase, self.week)
    }
}

/// Optional restriction of each enumeration dimension to a single value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinateFilter {
    pub year: Option<i32>,
    pub phase: Option<Phase>,
    pub week: Option<u32>,
}

impl CoordinateFilter {
    pub fn is_unset(&self) -> bool {
        self.year.is_none() && self.phase.is_none() && self.week.is_none()
    }
}

/// Source of "now" expressed as a season coordinate.
pub trait CurrentPeriod: Send + Sync {
    fn current(&self) -> Coordinate;
}

/// Always reports the same coordinate.
#[derive(Debug, Clone, Copy)]
pub struct FixedPeriod(pub Coordinate);

impl CurrentPeriod for FixedPeriod {
    fn current(&self) -> Coordinate {
        self.0
    }
}

/// Maps a calendar date onto the league calendar.
///
/// Regular season week 1 starts on the Thursday after Labor Day. The four weeks before
/// it are preseason weeks 1-4, and anything earlier in the year is preseason week 0.
/// After 17 regular weeks the postseason runs for four weeks; January and February
/// belong to the previous year's season.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalendarPeriod {
    today: Option<NaiveDate>,
}

impl CalendarPeriod {
    /// Uses the UTC wall clock every time it is asked.
    pub fn system() -> Self {
        Self { today: None }
    }

    pub fn on(date: NaiveDate) -> Self {
        Self { today: Some(date) }
    }

    pub fn coordinate_for(date: NaiveDate) -> Coordinate {
        let season = if date.month() <= 2 {
            date.year() - 1
        } else {
            date.year()
        };
        let kickoff = regular_season_kickoff(season);

        if date < kickoff {
            let weeks_before = ((kickoff - date).num_days() - 1) / 7 + 1;
            let week = (5 - weeks_before).max(0) as u32;
            return Coordinate::new(season, Phase::Pre, week);
        }

        let week = ((date - kickoff).num_days() / 7 + 1) as u32;
        if week <= REGULAR_SEASON_WEEKS {
            Coordinate::new(season, Phase::Regular, week)
        } else {
            Coordinate::new(season, Phase::Post, (week - REGULAR_SEASON_WEEKS).min(4))
        }
    }
}

impl CurrentPeriod for CalendarPeriod {
    fn current(&self) -> Coordinate {
        let today = self.today.unwrap_or_else(|| Utc::now().date_naive());
        Self::coordinate_for(today)
    }
}

fn regular_season_kickoff(season: i32) -> NaiveDate {
    let labor_day = NaiveDate::from_weekday_of_month_opt(season, 9, Weekday::Mon, 1)
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(season, 9, 1).unwrap_or_default());
    labor_day + Duration::days(3)
}

/// Lazily enumerates the coordinates to synchronize, year-major, then PRE/REG/POST,
/// then ascending week. The current year is read from `period` once per call.
pub fn enumerate_coordinates(
    filter: CoordinateFilter,
    period: &dyn CurrentPeriod,
) -> impl Iterator<Item = Coordinate> + Clone {
    let current_year = period.current().year;
    (DETAILED_STATS_START_YEAR..=current_year)
        .filter(move |year| filter.year.map_or(true, |y| y == *year))
        .flat_map(move |year| {
            Phase::ALL
                .into_iter()
                .filter(move |phase| filter.phase.map_or(true, |p| p == *phase))
                .flat_map(move |phase| {
                    phase
                        .weeks()
                        .filter(move |week| filter.week.map_or(true, |w| w == *week))
                        .map(move |week| Coordinate::new(year, phase, week))
                })
        })
}

/// One game element as the source reports it. Absent attributes are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub eid: String,
    pub weekday: String,
    pub kickoff_time: String,
    pub home: String,
    pub away: String,
    pub game_key: String,
    pub home_score: String,
    pub away_score: String,
}

/// Canonical persisted game record.
///
/// Fields are declared in ascending order of their serialized names; the snapshot file
/// relies on that for stable key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "away")]
    pub away_team: String,
    pub away_score: String,
    pub day: u32,
    #[serde(rename = "eid")]
    pub id: String,
    #[serde(rename = "gamekey")]
    pub game_key: String,
    #[serde(rename = "home")]
    pub home_team: String,
    pub home_score: String,
    pub month: u32,
    #[serde(rename = "season_type")]
    pub phase: Phase,
    #[serde(rename = "time")]
    pub kickoff_time: String,
    #[serde(rename = "wday")]
    pub weekday: String,
    pub week: u32,
    pub year: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("event id {id:?} does not begin with an 8-digit YYYYMMDD date")]
    MissingDatePrefix { id: String },
    #[error("event id {id:?} embeds an impossible date (month {month}, day {day})")]
    ImpossibleDate { id: String, month: u32, day: u32 },
}

/// Builds the canonical record for `raw` fetched at `coordinate`.
///
/// Month and day come from the id's `YYYYMMDD` prefix; every other field is passed
/// through untouched, scores included.
pub fn normalize(raw: RawEvent, coordinate: Coordinate) -> Result<EventRecord, NormalizeError> {
    let (month, day) = date_from_event_id(&raw.eid)?;
    Ok(EventRecord {
        away_team: raw.away,
        away_score: raw.away_score,
        day,
        id: raw.eid,
        game_key: raw.game_key,
        home_team: raw.home,
        home_score: raw.home_score,
        month,
        phase: coordinate.phase,
        kickoff_time: raw.kickoff_time,
        weekday: raw.weekday,
        week: coordinate.week,
        year: coordinate.year,
    })
}

fn date_from_event_id(id: &str) -> Result<(u32, u32), NormalizeError> {
    let prefix = id
        .get(..8)
        .filter(|p| p.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| NormalizeError::MissingDatePrefix { id: id.to_string() })?;

    // prefix is eight ASCII digits here
    let month: u32 = prefix[4..6].parse().unwrap_or_default();
    let day: u32 = prefix[6..8].parse().unwrap_or_default();
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(NormalizeError::ImpossibleDate {
            id: id.to_string(),
            month,
            day,
        });
    }
    Ok((month, day))
}
