//! Schedule synchronization driver: run modes, coordinate selection, fetch-normalize-upsert.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use schedsync_adapters::{
    ArchiveSource, RemoteSource, ScheduleSource, DEFAULT_ARCHIVE_EXTENSION, DEFAULT_REMOTE_URL,
};
use schedsync_core::{
    enumerate_coordinates, normalize, CalendarPeriod, Coordinate, CoordinateFilter, CurrentPeriod,
    DETAILED_STATS_START_YEAR,
};
use schedsync_storage::{
    check_writable, BackoffPolicy, HttpClientConfig, HttpFetcher, LoadError, PermissionError,
    SaveError, Snapshot, Upsert,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "schedsync-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub schedule_path: PathBuf,
    pub remote_url: String,
    pub archive_extension: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schedule_path: PathBuf::from("schedule.json"),
            remote_url: DEFAULT_REMOTE_URL.to_string(),
            archive_extension: DEFAULT_ARCHIVE_EXTENSION.to_string(),
            user_agent: "schedsync/0.1".to_string(),
            http_timeout_secs: 20,
            http_max_retries: 2,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            schedule_path: std::env::var("SCHEDSYNC_SCHEDULE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.schedule_path),
            remote_url: std::env::var("SCHEDSYNC_REMOTE_URL").unwrap_or(defaults.remote_url),
            archive_extension: std::env::var("SCHEDSYNC_ARCHIVE_EXT")
                .unwrap_or(defaults.archive_extension),
            user_agent: std::env::var("SCHEDSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("SCHEDSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            http_max_retries: std::env::var("SCHEDSYNC_HTTP_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_max_retries),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
        }
    }
}

/// What a run starts from and which coordinates it visits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Every coordinate since detailed stats began, from the remote source, into an empty
    /// snapshot.
    Rebuild,
    /// Pre-detailed-stats seasons from a directory of downloaded week documents, into an
    /// empty snapshot.
    Backfill { directory: PathBuf },
    /// The existing snapshot, updated for the filtered coordinates or, with no filter,
    /// the current week only.
    Incremental { filter: CoordinateFilter },
}

impl RunMode {
    pub fn label(&self) -> &'static str {
        match self {
            RunMode::Rebuild => "rebuild",
            RunMode::Backfill { .. } => "backfill",
            RunMode::Incremental { .. } => "incremental",
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Save(#[from] SaveError),
}

/// Per-coordinate outcome counts for one pass over a coordinate list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub coordinates: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub unavailable: Vec<Coordinate>,
    pub malformed: Vec<Coordinate>,
}

impl SyncStats {
    pub fn upserted(&self) -> usize {
        self.inserted + self.replaced + self.unchanged
    }

    fn absorb(&mut self, other: SyncStats) {
        self.coordinates += other.coordinates;
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.unchanged += other.unchanged;
        self.unavailable.extend(other.unavailable);
        self.malformed.extend(other.malformed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub previous_update: Option<DateTime<Utc>>,
    pub stats: SyncStats,
    pub total_records: usize,
    pub schedule_path: PathBuf,
    pub sha256: String,
}

/// Fetches each coordinate from `source` in order and upserts the normalized records.
///
/// Unavailable weeks are logged and skipped. A week containing any record that cannot be
/// normalized is skipped as a whole.
pub async fn sync_coordinates<I>(
    snapshot: &mut Snapshot,
    coordinates: I,
    source: &dyn ScheduleSource,
) -> SyncStats
where
    I: IntoIterator<Item = Coordinate>,
{
    let mut stats = SyncStats::default();
    let kind = source.kind();

    for coordinate in coordinates {
        stats.coordinates += 1;
        let Coordinate { year, phase, week } = coordinate;
        info!(year, %phase, week, source = %kind, "Updating {coordinate}...");

        let raw_events = match source.fetch_week(coordinate).await {
            Ok(events) => events,
            Err(err) if err.is_unavailable() => {
                warn!(
                    %coordinate,
                    source = %kind,
                    location = %source.locate(coordinate),
                    error = %err,
                    "schedule week unavailable; continuing"
                );
                stats.unavailable.push(coordinate);
                continue;
            }
            Err(err) => {
                error!(
                    %coordinate,
                    source = %kind,
                    location = %source.locate(coordinate),
                    error = %err,
                    "schedule week is malformed; skipping"
                );
                stats.malformed.push(coordinate);
                continue;
            }
        };

        let records = match raw_events
            .into_iter()
            .map(|raw| normalize(raw, coordinate))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(records) => records,
            Err(err) => {
                error!(
                    %coordinate,
                    source = %kind,
                    location = %source.locate(coordinate),
                    error = %err,
                    "schedule week has an unusable event id; skipping"
                );
                stats.malformed.push(coordinate);
                continue;
            }
        };

        for record in records {
            match snapshot.upsert(record) {
                Upsert::Inserted => stats.inserted += 1,
                Upsert::Replaced => stats.replaced += 1,
                Upsert::Unchanged => stats.unchanged += 1,
            }
        }
    }

    stats
}

pub struct Synchronizer {
    config: SyncConfig,
    remote: Box<dyn ScheduleSource>,
    period: Box<dyn CurrentPeriod>,
}

impl Synchronizer {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let remote = RemoteSource::new(http, &config.remote_url)?;
        Ok(Self {
            config,
            remote: Box::new(remote),
            period: Box::new(CalendarPeriod::system()),
        })
    }

    pub fn with_remote(mut self, remote: Box<dyn ScheduleSource>) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_period(mut self, period: Box<dyn CurrentPeriod>) -> Self {
        self.period = period;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs `mode` against the configured schedule file.
    pub async fn run(&self, mode: &RunMode) -> Result<SyncRunSummary, SyncError> {
        let path = self.config.schedule_path.clone();
        self.run_at(mode, &path).await
    }

    /// Runs `mode` against `path`. Writability is checked before any fetch; the snapshot is
    /// saved once, at the end.
    pub async fn run_at(&self, mode: &RunMode, path: &Path) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, mode = mode.label());
        self.run_inner(run_id, mode, path).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        mode: &RunMode,
        path: &Path,
    ) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        check_writable(path).await?;

        let (mut snapshot, previous_update, stats) = match mode {
            RunMode::Rebuild => {
                let mut snapshot = Snapshot::new();
                let coordinates = enumerate_coordinates(CoordinateFilter::default(), &*self.period);
                let stats = sync_coordinates(&mut snapshot, coordinates, &*self.remote).await;
                (snapshot, None, stats)
            }
            RunMode::Backfill { directory } => {
                let mut snapshot = Snapshot::new();
                let archive =
                    ArchiveSource::with_extension(directory.clone(), &self.config.archive_extension);
                let coordinates = backfill_coordinates(&archive);
                let mut stats = SyncStats::default();
                for season in coordinates.chunk_by(|a, b| a.year == b.year) {
                    let year = season[0].year;
                    info!(year, "backfilling season {year}");
                    stats.absorb(
                        sync_coordinates(&mut snapshot, season.iter().copied(), &archive).await,
                    );
                }
                (snapshot, None, stats)
            }
            RunMode::Incremental { filter } => {
                let mut snapshot = Snapshot::load(path).await?;
                let previous_update = snapshot.last_updated_at();
                match previous_update {
                    Some(at) => info!(last_updated = %at, "Last updated: {at}"),
                    None => info!("Last updated: unknown"),
                }

                let coordinates: Vec<Coordinate> = if filter.is_unset() {
                    vec![self.period.current()]
                } else {
                    enumerate_coordinates(*filter, &*self.period).collect()
                };
                let stats = sync_coordinates(&mut snapshot, coordinates, &*self.remote).await;
                (snapshot, previous_update, stats)
            }
        };

        let saved = snapshot.save(path).await?;
        info!(
            path = %saved.path.display(),
            records = saved.records,
            bytes = saved.bytes,
            sha256 = %saved.sha256,
            inserted = stats.inserted,
            replaced = stats.replaced,
            unavailable = stats.unavailable.len(),
            malformed = stats.malformed.len(),
            "schedule saved"
        );

        Ok(SyncRunSummary {
            run_id,
            mode: mode.label(),
            started_at,
            finished_at: Utc::now(),
            previous_update,
            stats,
            total_records: saved.records,
            schedule_path: saved.path,
            sha256: saved.sha256,
        })
    }
}

/// Archive coordinates for seasons before detailed stats, latest file first.
fn backfill_coordinates(archive: &ArchiveSource) -> Vec<Coordinate> {
    let mut coordinates = match archive.coordinates() {
        Ok(coordinates) => coordinates,
        Err(err) => {
            warn!(dir = %archive.dir().display(), error = %err, "could not list archive directory");
            return Vec::new();
        }
    };
    coordinates.reverse();
    coordinates.retain(|c| c.year < DETAILED_STATS_START_YEAR);
    coordinates
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use schedsync_adapters::{AdapterError, SourceKind};
    use schedsync_core::{FixedPeriod, Phase, RawEvent};
    use schedsync_storage::FetchError;
    use tempfile::tempdir;

    enum Week {
        Games(Vec<RawEvent>),
        Down,
        Garbled,
    }

    #[derive(Default)]
    struct ScriptedSource {
        weeks: HashMap<Coordinate, Week>,
        calls: Mutex<Vec<Coordinate>>,
    }

    impl ScriptedSource {
        fn with(mut self, coordinate: Coordinate, week: Week) -> Self {
            self.weeks.insert(coordinate, week);
            self
        }

        fn calls(&self) -> Vec<Coordinate> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ScheduleSource for ScriptedSource {
        fn kind(&self) -> SourceKind {
            SourceKind::Remote
        }

        fn locate(&self, coordinate: Coordinate) -> String {
            format!("scripted://{coordinate}")
        }

        async fn fetch_week(&self, coordinate: Coordinate) -> Result<Vec<RawEvent>, AdapterError> {
            self.calls.lock().unwrap().push(coordinate);
            match self.weeks.get(&coordinate) {
                Some(Week::Games(games)) => Ok(games.clone()),
                Some(Week::Down) => Err(AdapterError::Transport {
                    url: self.locate(coordinate),
                    source: FetchError::HttpStatus {
                        status: 503,
                        url: self.locate(coordinate),
                    },
                }),
                Some(Week::Garbled) => Err(AdapterError::Format {
                    origin: self.locate(coordinate),
                    reason: "not a scorestrip".into(),
                }),
                None => Ok(Vec::new()),
            }
        }
    }

    /// Shares one scripted source between the synchronizer and the assertions.
    struct Shared(std::sync::Arc<ScriptedSource>);

    #[async_trait]
    impl ScheduleSource for Shared {
        fn kind(&self) -> SourceKind {
            self.0.kind()
        }

        fn locate(&self, coordinate: Coordinate) -> String {
            self.0.locate(coordinate)
        }

        async fn fetch_week(&self, coordinate: Coordinate) -> Result<Vec<RawEvent>, AdapterError> {
            self.0.fetch_week(coordinate).await
        }
    }

    fn game(eid: &str, home: &str, home_score: &str) -> RawEvent {
        RawEvent {
            eid: eid.to_string(),
            weekday: "Sun".into(),
            kickoff_time: "1:00".into(),
            home: home.to_string(),
            away: "NYJ".into(),
            game_key: "56000".into(),
            home_score: home_score.to_string(),
            away_score: "10".into(),
        }
    }

    fn synchronizer(source: std::sync::Arc<ScriptedSource>, current: Coordinate) -> Synchronizer {
        Synchronizer::new(SyncConfig::default())
            .unwrap()
            .with_remote(Box::new(Shared(source)))
            .with_period(Box::new(FixedPeriod(current)))
    }

    async fn seed(path: &Path, games: &[(RawEvent, Coordinate)]) {
        let mut snapshot = Snapshot::new();
        for (raw, coordinate) in games {
            snapshot.upsert(normalize(raw.clone(), *coordinate).unwrap());
        }
        snapshot.save(path).await.unwrap();
    }

    #[tokio::test]
    async fn unwritable_target_stops_before_any_fetch() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("missing-dir").join("schedule.json");
        let source = std::sync::Arc::new(ScriptedSource::default());
        let sync = synchronizer(source.clone(), Coordinate::new(2013, Phase::Regular, 1));

        for mode in [
            RunMode::Rebuild,
            RunMode::Incremental {
                filter: CoordinateFilter::default(),
            },
        ] {
            let err = sync.run_at(&mode, &path).await.unwrap_err();
            assert!(matches!(err, SyncError::Permission(_)));
        }
        assert!(source.calls().is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn incremental_without_filter_updates_only_the_current_week() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("schedule.json");
        let week1 = Coordinate::new(2013, Phase::Regular, 1);
        let week2 = Coordinate::new(2013, Phase::Regular, 2);
        seed(&path, &[(game("2013090800", "NE", "23"), week1)]).await;

        let source = std::sync::Arc::new(
            ScriptedSource::default().with(week2, Week::Games(vec![game("2013091500", "NE", "")])),
        );
        let summary = synchronizer(source.clone(), week2)
            .run_at(&RunMode::Incremental { filter: CoordinateFilter::default() }, &path)
            .await
            .expect("incremental run");

        assert_eq!(source.calls(), vec![week2]);
        assert_eq!(summary.stats.inserted, 1);
        assert_eq!(summary.total_records, 2);
        assert!(summary.previous_update.is_some());

        let reloaded = Snapshot::load(&path).await.unwrap();
        assert!(reloaded.get("2013090800").is_some());
        assert_eq!(reloaded.get("2013091500").unwrap().week, 2);
    }

    #[tokio::test]
    async fn incremental_with_filter_visits_the_enumerated_weeks() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("schedule.json");
        seed(&path, &[]).await;

        let source = std::sync::Arc::new(ScriptedSource::default());
        let filter = CoordinateFilter {
            year: Some(2010),
            phase: Some(Phase::Post),
            week: None,
        };
        synchronizer(source.clone(), Coordinate::new(2013, Phase::Regular, 1))
            .run_at(&RunMode::Incremental { filter }, &path)
            .await
            .expect("filtered run");

        let weeks: Vec<u32> = source.calls().iter().map(|c| c.week).collect();
        assert_eq!(weeks, vec![1, 2, 3, 4]);
        assert!(source.calls().iter().all(|c| c.year == 2010 && c.phase == Phase::Post));
    }

    #[tokio::test]
    async fn incremental_refuses_to_run_without_a_readable_snapshot() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("schedule.json");
        let source = std::sync::Arc::new(ScriptedSource::default());

        let err = synchronizer(source.clone(), Coordinate::new(2013, Phase::Regular, 1))
            .run_at(&RunMode::Incremental { filter: CoordinateFilter::default() }, &path)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Load(_)));
        assert!(source.calls().is_empty());
        assert!(!path.exists());

        std::fs::write(&path, "not json").unwrap();
        let err = synchronizer(source.clone(), Coordinate::new(2013, Phase::Regular, 1))
            .run_at(&RunMode::Incremental { filter: CoordinateFilter::default() }, &path)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Load(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not json");
    }

    #[tokio::test]
    async fn rebuild_starts_empty_and_walks_every_coordinate() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("schedule.json");
        let stale = Coordinate::new(2009, Phase::Regular, 1);
        seed(&path, &[(game("2009091300", "STALE", "0"), stale)]).await;

        let source = std::sync::Arc::new(
            ScriptedSource::default().with(
                Coordinate::new(2009, Phase::Post, 4),
                Week::Games(vec![game("2010020700", "IND", "17")]),
            ),
        );
        let summary = synchronizer(source.clone(), Coordinate::new(2009, Phase::Regular, 3))
            .run_at(&RunMode::Rebuild, &path)
            .await
            .expect("rebuild");

        assert_eq!(source.calls().len(), 26);
        assert_eq!(summary.total_records, 1);
        let reloaded = Snapshot::load(&path).await.unwrap();
        assert!(reloaded.get("2009091300").is_none());
        assert_eq!(reloaded.get("2010020700").unwrap().phase, Phase::Post);
    }

    #[tokio::test]
    async fn failed_weeks_are_skipped_without_aborting_the_run() {
        let down = Coordinate::new(2013, Phase::Regular, 1);
        let garbled = Coordinate::new(2013, Phase::Regular, 2);
        let bad_id = Coordinate::new(2013, Phase::Regular, 3);
        let good = Coordinate::new(2013, Phase::Regular, 4);
        let source = ScriptedSource::default()
            .with(down, Week::Down)
            .with(garbled, Week::Garbled)
            .with(
                bad_id,
                Week::Games(vec![game("2013092200", "SEA", "45"), game("TBD", "KC", "")]),
            )
            .with(good, Week::Games(vec![game("2013092900", "DEN", "52")]));

        let mut snapshot = Snapshot::new();
        let stats = sync_coordinates(&mut snapshot, [down, garbled, bad_id, good], &source).await;

        assert_eq!(stats.coordinates, 4);
        assert_eq!(stats.unavailable, vec![down]);
        assert_eq!(stats.malformed, vec![garbled, bad_id]);
        assert_eq!(stats.upserted(), 1);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("2013092200").is_none());
    }

    #[tokio::test]
    async fn refetched_events_replace_stored_versions() {
        let week = Coordinate::new(2013, Phase::Regular, 1);
        let mut snapshot = Snapshot::new();
        snapshot.upsert(normalize(game("2013090800", "NE", ""), week).unwrap());

        let source = ScriptedSource::default()
            .with(week, Week::Games(vec![game("2013090800", "NE", "23")]));
        let stats = sync_coordinates(&mut snapshot, [week, week], &source).await;

        assert_eq!(stats.replaced, 1);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(snapshot.get("2013090800").unwrap().home_score, "23");
    }

    #[test]
    fn backfill_keeps_only_pre_detailed_seasons_latest_first() {
        let dir = tempdir().expect("tempdir");
        for name in ["1999-2-REG.xml", "2005-10-REG.xml", "2005-9-REG.xml", "2012-1-REG.xml"] {
            std::fs::write(dir.path().join(name), "<ss/>").unwrap();
        }
        let coordinates = backfill_coordinates(&ArchiveSource::new(dir.path()));
        assert_eq!(
            coordinates,
            vec![
                Coordinate::new(2005, Phase::Regular, 10),
                Coordinate::new(2005, Phase::Regular, 9),
                Coordinate::new(1999, Phase::Regular, 2),
            ]
        );
    }

    #[test]
    fn backfill_of_missing_directory_has_no_coordinates() {
        let dir = tempdir().expect("tempdir");
        assert!(backfill_coordinates(&ArchiveSource::new(dir.path().join("absent"))).is_empty());
    }
}
