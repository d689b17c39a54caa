//! Schedule source contracts + the remote and archive scorestrip adapters.

use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use schedsync_core::{Coordinate, Phase, RawEvent};
use schedsync_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "schedsync-adapters";

pub const DEFAULT_REMOTE_URL: &str = "http://www.nfl.com/ajax/scorestrip";
pub const DEFAULT_ARCHIVE_EXTENSION: &str = "xml";

const POST_WIRE_OFFSET: u32 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    Remote,
    Archive,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SourceKind::Remote => "remote",
            SourceKind::Archive => "archive",
        })
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("archive file {} does not exist", .path.display())]
    MissingArchiveFile { path: PathBuf },
    #[error("reading archive file {}: {source}", .path.display())]
    ArchiveRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed schedule document from {origin}: {reason}")]
    Format { origin: String, reason: String },
}

impl AdapterError {
    /// True when the week's data is simply unavailable (network or archive), as opposed
    /// to present but unusable.
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, AdapterError::Format { .. })
    }
}

/// Where per-week schedule documents come from.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// URL or file path for `coordinate`, for diagnostics.
    fn locate(&self, coordinate: Coordinate) -> String;

    async fn fetch_week(&self, coordinate: Coordinate) -> Result<Vec<RawEvent>, AdapterError>;
}

/// Week number the upstream endpoint expects. Postseason weeks continue the regular
/// season numbering, except that the provider skips wire week 21.
pub fn wire_week(phase: Phase, week: u32) -> u32 {
    match phase {
        Phase::Post => {
            let wire = week + POST_WIRE_OFFSET;
            if wire == 21 {
                22
            } else {
                wire
            }
        }
        Phase::Pre | Phase::Regular => week,
    }
}

pub fn schedule_url(base: &Url, coordinate: Coordinate) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut()
        .clear()
        .append_pair("season", &coordinate.year.to_string())
        .append_pair("seasonType", coordinate.phase.as_str())
        .append_pair("week", &wire_week(coordinate.phase, coordinate.week).to_string());
    url
}

/// Projects every `g` element of a scorestrip document. A well-formed document with no
/// game elements is an empty week, not an error; anything without a closed `ss` root
/// holding a `gms` list is a format error.
pub fn parse_schedule_document(bytes: &[u8], origin: &str) -> Result<Vec<RawEvent>, AdapterError> {
    let malformed = |reason: String| AdapterError::Format {
        origin: origin.to_string(),
        reason,
    };
    let text = std::str::from_utf8(bytes).map_err(|e| malformed(format!("body is not UTF-8: {e}")))?;

    // the HTML parser recovers from truncation, so require the closing root tag
    let trimmed = text.trim_end();
    let closed = trimmed
        .get(trimmed.len().saturating_sub(5)..)
        .is_some_and(|tail| tail.eq_ignore_ascii_case("</ss>"));
    if !closed {
        return Err(malformed("document does not end with a closing ss element".to_string()));
    }

    let game_list = Selector::parse("ss > gms").map_err(|e| malformed(e.to_string()))?;
    let games = Selector::parse("ss > gms g").map_err(|e| malformed(e.to_string()))?;
    let document = Html::parse_document(text);
    if document.select(&game_list).next().is_none() {
        return Err(malformed("document has no ss > gms element".to_string()));
    }

    Ok(document
        .select(&games)
        .map(|game| {
            let attr = |name: &str| game.value().attr(name).unwrap_or_default().to_string();
            RawEvent {
                eid: attr("eid"),
                weekday: attr("d"),
                kickoff_time: attr("t"),
                home: attr("h"),
                away: attr("v"),
                game_key: attr("gsis"),
                home_score: attr("hs"),
                away_score: attr("vs"),
            }
        })
        .collect())
}

/// Live scorestrip endpoint.
#[derive(Debug)]
pub struct RemoteSource {
    http: HttpFetcher,
    base_url: Url,
}

impl RemoteSource {
    pub fn new(http: HttpFetcher, base_url: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("parsing remote url {base_url}"))?;
        Ok(Self { http, base_url })
    }

    pub fn url_for(&self, coordinate: Coordinate) -> Url {
        schedule_url(&self.base_url, coordinate)
    }
}

#[async_trait]
impl ScheduleSource for RemoteSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    fn locate(&self, coordinate: Coordinate) -> String {
        self.url_for(coordinate).to_string()
    }

    async fn fetch_week(&self, coordinate: Coordinate) -> Result<Vec<RawEvent>, AdapterError> {
        let url = self.url_for(coordinate).to_string();
        let response = self
            .http
            .fetch_bytes(&url)
            .await
            .map_err(|source| AdapterError::Transport {
                url: url.clone(),
                source,
            })?;
        parse_schedule_document(&response.body, &url)
    }
}

/// Directory of previously downloaded scorestrip documents named
/// `{year}-{week}-{phase}.{ext}`.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    dir: PathBuf,
    extension: String,
}

impl ArchiveSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_extension(dir, DEFAULT_ARCHIVE_EXTENSION)
    }

    pub fn with_extension(dir: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name_for(&self, coordinate: Coordinate) -> String {
        format!(
            "{}-{}-{}.{}",
            coordinate.year, coordinate.week, coordinate.phase, self.extension
        )
    }

    pub fn path_for(&self, coordinate: Coordinate) -> PathBuf {
        self.dir.join(self.file_name_for(coordinate))
    }

    /// Coordinates of the archive files present, in natural filename order.
    /// Names that do not follow the archive convention are skipped with a warning.
    pub fn coordinates(&self) -> Result<Vec<Coordinate>, AdapterError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| AdapterError::ArchiveRead {
            path: self.dir.clone(),
            source,
        })?;
        let suffix = format!(".{}", self.extension);

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(&suffix))
            .collect();
        names.sort_by(|a, b| natural_cmp(a, b));

        let mut coordinates = Vec::with_capacity(names.len());
        for name in names {
            match parse_archive_file_name(&name, &self.extension) {
                Some(coordinate) => coordinates.push(coordinate),
                None => warn!(
                    dir = %self.dir.display(),
                    file = %name,
                    "skipping archive file that is not named year-week-phase"
                ),
            }
        }
        Ok(coordinates)
    }
}

#[async_trait]
impl ScheduleSource for ArchiveSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Archive
    }

    fn locate(&self, coordinate: Coordinate) -> String {
        self.path_for(coordinate).display().to_string()
    }

    async fn fetch_week(&self, coordinate: Coordinate) -> Result<Vec<RawEvent>, AdapterError> {
        let path = self.path_for(coordinate);
        let bytes = tokio::fs::read(&path).await.map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                AdapterError::MissingArchiveFile { path: path.clone() }
            } else {
                AdapterError::ArchiveRead {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        parse_schedule_document(&bytes, &path.display().to_string())
    }
}

/// Parses `{year}-{week}-{phase}.{ext}`. Only canonical spellings are accepted, so the
/// coordinate always maps back to the same file name.
pub fn parse_archive_file_name(name: &str, extension: &str) -> Option<Coordinate> {
    let stem = name.strip_suffix(extension)?.strip_suffix('.')?;
    let mut parts = stem.splitn(3, '-');
    let year: i32 = parts.next()?.parse().ok()?;
    let week: u32 = parts.next()?.parse().ok()?;
    let phase: Phase = parts.next()?.parse().ok()?;
    let coordinate = Coordinate::new(year, phase, week);
    let canonical = format!("{year}-{week}-{phase}");
    (canonical == stem).then_some(coordinate)
}

/// Orders strings the way people read them: digit runs compare numerically.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = chunks(a);
    let mut right = chunks(b);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.is_digits, y.is_digits) {
                    (true, true) => {
                        let xs = x.text.trim_start_matches('0');
                        let ys = y.text.trim_start_matches('0');
                        xs.len().cmp(&ys.len()).then_with(|| xs.cmp(ys))
                    }
                    (false, false) => x.text.cmp(y.text),
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

struct Chunk<'a> {
    text: &'a str,
    is_digits: bool,
}

fn chunks(s: &str) -> impl Iterator<Item = Chunk<'_>> {
    let mut rest = s;
    std::iter::from_fn(move || {
        let first = rest.chars().next()?;
        let is_digits = first.is_ascii_digit();
        let end = rest
            .find(|c: char| c.is_ascii_digit() != is_digits)
            .unwrap_or(rest.len());
        let (text, tail) = rest.split_at(end);
        rest = tail;
        Some(Chunk { text, is_digits })
    })
}
