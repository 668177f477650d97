//! Archive queries: which years, months and days have recordings, what is
//! in a day, and zip downloads of (part of) a day.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::storage::leading_number;

/// Largest JSON listing returned by the query endpoints.
pub const MAX_RESPONSE_BYTES: usize = 131_072;

/// Where the archive files are served.
pub const VIDEO_URI: &str = "/dvr/storage/videos";

const VIDEO_EXTENSIONS: [&str; 3] = ["mkv", "mp4", "avi"];

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Not Found")]
    NotFound,
    #[error("Missing parameters")]
    MissingParameters,
    #[error("Out of space, response too large")]
    TooLarge,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueryError {
    pub fn status(&self) -> u16 {
        match self {
            QueryError::NotFound => 404,
            QueryError::MissingParameters => 400,
            QueryError::TooLarge => 413,
            QueryError::Internal(_) => 500,
        }
    }
}

/// Query string of the calendar endpoints.  `cam` and `hour` are
/// `+`-separated lists (which arrive as spaces once decoded).
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DateQuery {
    pub year: Option<String>,
    pub month: Option<String>,
    pub day: Option<String>,
    pub cam: Option<String>,
    pub hour: Option<String>,
}

impl DateQuery {
    fn year(&self) -> Result<i32, QueryError> {
        number(self.year.as_deref())
    }

    fn month(&self) -> Result<u32, QueryError> {
        number(self.month.as_deref())
    }

    fn date(&self) -> Result<NaiveDate, QueryError> {
        let (year, month, day) = (self.year()?, self.month()?, number(self.day.as_deref())?);
        NaiveDate::from_ymd_opt(year, month, day).ok_or(QueryError::NotFound)
    }

    fn cameras(&self) -> Vec<&str> {
        self.cam.as_deref().map(split_list).unwrap_or_default()
    }

    /// Hour range `[start, end)`, the whole day by default.
    fn hours(&self) -> (u32, u32) {
        let Some(hours) = self.hour.as_deref() else {
            return (0, 24);
        };
        let list = split_list(hours);
        let start = list.first().and_then(|h| leading_number(h)).unwrap_or(0);
        let end = list.get(1).and_then(|h| leading_number(h)).unwrap_or(24);
        (start, end)
    }
}

fn number<T: std::str::FromStr>(value: Option<&str>) -> Result<T, QueryError> {
    let value = value.ok_or(QueryError::MissingParameters)?;
    value.trim().parse().map_err(|_| QueryError::NotFound)
}

fn split_list(text: &str) -> Vec<&str> {
    text.split(['+', ' ']).filter(|s| !s.is_empty()).collect()
}

fn month_dir(root: &Path, year: i32, month: u32) -> PathBuf {
    root.join(year.to_string()).join(format!("{month:02}"))
}

fn day_dir(root: &Path, date: NaiveDate) -> PathBuf {
    month_dir(root, date.year(), date.month()).join(format!("{:02}", date.day()))
}

/// Serialize a listing, refusing anything too large.
pub fn to_json<T: Serialize>(value: &T) -> Result<String, QueryError> {
    let text = serde_json::to_string(value).map_err(|e| QueryError::Internal(e.to_string()))?;
    if text.len() >= MAX_RESPONSE_BYTES {
        return Err(QueryError::TooLarge);
    }
    Ok(text)
}

/// Years present in the archive, in order.
pub fn years(root: &Path) -> Result<Vec<u32>, QueryError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(QueryError::Internal(e.to_string())),
    };
    let mut years: Vec<u32> = entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| leading_number(&e.file_name().to_string_lossy()))
        .collect();
    years.sort_unstable();
    years.dedup();
    Ok(years)
}

/// `[false, jan, ..., dec]`: which months of a year have recordings.
pub fn yearly(root: &Path, query: &DateQuery) -> Result<Vec<bool>, QueryError> {
    let year = query.year()?;
    let mut months = vec![false];
    months.extend((1..=12).map(|month| month_dir(root, year, month).is_dir()));
    Ok(months)
}

/// `[false, day1, ..., dayN]` for the days of the requested month.
pub fn monthly(root: &Path, query: &DateQuery) -> Result<Vec<bool>, QueryError> {
    let (year, month) = (query.year()?, query.month()?);
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or(QueryError::NotFound)?;
    let mut days = vec![false];
    days.extend(
        first
            .iter_days()
            .take_while(|d| d.month() == month)
            .map(|d| day_dir(root, d).is_dir()),
    );
    Ok(days)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recording {
    pub src: String,
    pub time: String,
    pub size: u64,
    pub video: String,
    pub image: String,
}

impl Recording {
    /// Parse a `<time>-<source>[:<suffix>].<ext>` video file name.
    fn parse(name: &str, uri: &str, size: u64) -> Option<Self> {
        let (stem, ext) = name.rsplit_once('.')?;
        if !VIDEO_EXTENSIONS.contains(&ext) {
            return None;
        }
        let (time, source) = stem.split_once('-')?;
        let src = source.rsplit_once(':').map_or(source, |(s, _)| s);
        Some(Self {
            src: src.to_string(),
            time: time.to_string(),
            size,
            video: format!("{uri}/{name}"),
            image: format!("{uri}/{stem}.jpg"),
        })
    }
}

/// The recordings of one day.
pub fn daily(root: &Path, query: &DateQuery) -> Result<Vec<Recording>, QueryError> {
    let date = query.date()?;
    let dir = day_dir(root, date);
    let entries = std::fs::read_dir(&dir).map_err(|_| QueryError::NotFound)?;
    let uri = format!(
        "{VIDEO_URI}/{}/{:02}/{:02}",
        date.year(),
        date.month(),
        date.day()
    );

    let mut recordings: Vec<Recording> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                return None;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            Recording::parse(&name, &uri, size)
        })
        .collect();
    recordings.sort_by(|a, b| a.video.cmp(&b.video));
    Ok(recordings)
}

/// Does a file of source `source` (`front:00.mp4`) belong to camera `cam`?
fn camera_matches(source: &str, cam: &str) -> bool {
    match source.strip_prefix(cam) {
        Some(rest) => rest.is_empty() || rest.starts_with(':') || rest.starts_with('.'),
        None => false,
    }
}

static ARCHIVE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The zip file name offered to the client.
pub fn archive_name(query: &DateQuery) -> Result<String, QueryError> {
    let date = query.date()?;
    Ok(format!(
        "videos-{}-{:02}-{:02}.zip",
        date.year(),
        date.month(),
        date.day()
    ))
}

/// Build a zip (stored, not compressed: videos do not compress) of the
/// files of one day, optionally limited to some cameras and hours.
/// The archive is written in `workdir`; the caller removes it.
pub fn archive(root: &Path, query: &DateQuery, workdir: &Path) -> Result<PathBuf, QueryError> {
    let date = query.date()?;
    let dir = day_dir(root, date);
    let entries = std::fs::read_dir(&dir).map_err(|_| QueryError::NotFound)?;
    let cameras = query.cameras();
    let (start, end) = query.hours();

    let mut selected: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().is_ok_and(|t| t.is_file()) {
                return None;
            }
            let hour = leading_number(&name).unwrap_or(0);
            if hour < start || hour >= end {
                return None;
            }
            if !cameras.is_empty() {
                let (_, source) = name.split_once('-')?;
                if !cameras.iter().any(|cam| camera_matches(source, cam)) {
                    return None;
                }
            }
            Some((name, entry.path()))
        })
        .collect();
    if selected.is_empty() {
        return Err(QueryError::Internal("no matching recording".to_string()));
    }
    selected.sort();

    let path = workdir.join(format!(
        "vigil-videos-{}-{}-{}.zip",
        date,
        std::process::id(),
        ARCHIVE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    debug!("Building archive {} ({} files)", path.display(), selected.len());
    if let Err(e) = write_archive(&path, &selected) {
        warn!("Cannot build archive {}: {e}", path.display());
        let _ = std::fs::remove_file(&path);
        return Err(QueryError::Internal(e.to_string()));
    }
    Ok(path)
}

fn write_archive(path: &Path, files: &[(String, PathBuf)]) -> zip::result::ZipResult<()> {
    let mut writer = ZipWriter::new(File::create(path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, source) in files {
        writer.start_file(name.as_str(), options)?;
        io::copy(&mut File::open(source)?, &mut writer)?;
    }
    writer.finish()?;
    Ok(())
}
