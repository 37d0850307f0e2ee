// In engine/src/marker.rs
//!
//! Sentinel files recording pipeline progress between process invocations.
//!
//! A marker is present or absent at a fixed path; its body carries a
//! timestamp header, an optional `AlterNG` sub-code, the human notice and an
//! optional metadata map. Wrapping tooling only relies on presence.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Error;

const METADATA_SEPARATOR: &str = "--- metadata";
const CODE_PREFIX: &str = "code: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlterNgCode {
    /// Altered previous schema still differs from next.
    Dif,
    /// An alter statement failed.
    Alf,
    /// A take-finally assertion failed.
    Tff,
}

impl AlterNgCode {
    pub fn as_str(self) -> &'static str {
        match self {
            AlterNgCode::Dif => "DIF",
            AlterNgCode::Alf => "ALF",
            AlterNgCode::Tff => "TFF",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "DIF" => Some(AlterNgCode::Dif),
            "ALF" => Some(AlterNgCode::Alf),
            "TFF" => Some(AlterNgCode::Tff),
            _ => None,
        }
    }
}

impl fmt::Display for AlterNgCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    PreviousOk,
    PreviousNg,
    NextNg,
    AlterNg(AlterNgCode),
    AlterCheck,
    SavePrevious,
}

impl MarkerKind {
    /// Every kind with a distinct file, `AlterNg` represented once.
    pub const ALL: [MarkerKind; 6] = [
        MarkerKind::PreviousOk,
        MarkerKind::PreviousNg,
        MarkerKind::NextNg,
        MarkerKind::AlterNg(AlterNgCode::Dif),
        MarkerKind::AlterCheck,
        MarkerKind::SavePrevious,
    ];

    pub const NG: [MarkerKind; 3] = [
        MarkerKind::PreviousNg,
        MarkerKind::NextNg,
        MarkerKind::AlterNg(AlterNgCode::Dif),
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            MarkerKind::PreviousOk => "previous-OK.mark",
            MarkerKind::PreviousNg => "previous-NG.mark",
            MarkerKind::NextNg => "next-NG.mark",
            MarkerKind::AlterNg(_) => "alter-NG.mark",
            MarkerKind::AlterCheck => "alter-check.mark",
            MarkerKind::SavePrevious => "save-previous.mark",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MarkerKind::PreviousOk => "PreviousOK",
            MarkerKind::PreviousNg => "PreviousNG",
            MarkerKind::NextNg => "NextNG",
            MarkerKind::AlterNg(_) => "AlterNG",
            MarkerKind::AlterCheck => "AlterCheck",
            MarkerKind::SavePrevious => "SavePrevious",
        }
    }

    pub fn is_ng(self) -> bool {
        matches!(
            self,
            MarkerKind::PreviousNg | MarkerKind::NextNg | MarkerKind::AlterNg(_)
        )
    }

    fn code(self) -> Option<AlterNgCode> {
        match self {
            MarkerKind::AlterNg(code) => Some(code),
            _ => None,
        }
    }

    /// PreviousOK and PreviousNG never coexist.
    fn exclusive_counterpart(self) -> Option<MarkerKind> {
        match self {
            MarkerKind::PreviousOk => Some(MarkerKind::PreviousNg),
            MarkerKind::PreviousNg => Some(MarkerKind::PreviousOk),
            _ => None,
        }
    }
}

impl fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "{}({code})", self.label()),
            None => f.write_str(self.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerRecord {
    pub code: Option<AlterNgCode>,
    pub notice: String,
    pub written_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

impl MarkerRecord {
    fn render(&self, kind: MarkerKind) -> Result<String, Error> {
        let written_at = self.written_at.unwrap_or_else(Utc::now);
        let mut body = format!("[{}] {}\n", kind.label(), written_at.to_rfc3339());
        if let Some(code) = self.code {
            body.push_str(CODE_PREFIX);
            body.push_str(code.as_str());
            body.push('\n');
        }
        body.push('\n');
        body.push_str(self.notice.trim_end());
        body.push('\n');
        if !self.metadata.is_empty() {
            body.push_str(METADATA_SEPARATOR);
            body.push('\n');
            body.push_str(&serde_json::to_string(&self.metadata)?);
            body.push('\n');
        }
        Ok(body)
    }

    fn parse(content: &str) -> Result<Self, String> {
        let mut lines = content.lines();
        let header = lines.next().ok_or_else(|| "empty marker".to_string())?;
        let written_at = header
            .split_once("] ")
            .and_then(|(_, stamp)| DateTime::parse_from_rfc3339(stamp.trim()).ok())
            .map(|stamp| stamp.with_timezone(&Utc));

        let mut code = None;
        let mut notice_lines = Vec::new();
        let mut metadata = BTreeMap::new();
        let mut in_notice = false;
        while let Some(line) = lines.next() {
            if !in_notice {
                if let Some(raw) = line.strip_prefix(CODE_PREFIX) {
                    code = AlterNgCode::parse(raw);
                    continue;
                }
                if line.is_empty() {
                    in_notice = true;
                }
                continue;
            }
            if line == METADATA_SEPARATOR {
                let raw: String = lines.by_ref().collect::<Vec<_>>().join("\n");
                metadata = serde_json::from_str(raw.trim())
                    .map_err(|err| format!("invalid metadata: {err}"))?;
                break;
            }
            notice_lines.push(line);
        }

        Ok(Self {
            code,
            notice: notice_lines.join("\n"),
            written_at,
            metadata,
        })
    }
}

/// Reads and writes marker files under one directory.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, kind: MarkerKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    pub fn write(&self, kind: MarkerKind, notice: &str) -> Result<PathBuf, Error> {
        self.write_with_metadata(kind, notice, BTreeMap::new())
    }

    /// Overwrites the marker atomically, deleting its exclusive counterpart first.
    pub fn write_with_metadata(
        &self,
        kind: MarkerKind,
        notice: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<PathBuf, Error> {
        fs::create_dir_all(&self.dir).map_err(|err| self.marker_error(&self.dir, err))?;
        if let Some(counterpart) = kind.exclusive_counterpart() {
            self.delete(counterpart)?;
        }

        let record = MarkerRecord {
            code: kind.code(),
            notice: notice.to_string(),
            written_at: Some(Utc::now()),
            metadata,
        };
        let body = record.render(kind)?;

        let path = self.path_of(kind);
        let staging = self.dir.join(format!(".{}.tmp", kind.file_name()));
        let write_staging = || -> io::Result<()> {
            let mut file = fs::File::create(&staging)?;
            file.write_all(body.as_bytes())?;
            file.sync_all()
        };
        write_staging().map_err(|err| self.marker_error(&staging, err))?;
        fs::rename(&staging, &path).map_err(|err| self.marker_error(&path, err))?;

        info!(marker = %kind, path = %path.display(), "marker written");
        Ok(path)
    }

    pub fn exists(&self, kind: MarkerKind) -> bool {
        self.path_of(kind).is_file()
    }

    pub fn read(&self, kind: MarkerKind) -> Result<Option<MarkerRecord>, Error> {
        let path = self.path_of(kind);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.marker_error(&path, err)),
        };
        MarkerRecord::parse(&content)
            .map(Some)
            .map_err(|reason| Error::Marker { path, reason })
    }

    /// Returns whether a marker file was actually removed.
    pub fn delete(&self, kind: MarkerKind) -> Result<bool, Error> {
        let path = self.path_of(kind);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(marker = %kind, "marker deleted");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(self.marker_error(&path, err)),
        }
    }

    pub fn delete_all(&self, kinds: &[MarkerKind]) -> Result<(), Error> {
        for kind in kinds {
            self.delete(*kind)?;
        }
        Ok(())
    }

    pub fn delete_all_ng(&self) -> Result<(), Error> {
        self.delete_all(&MarkerKind::NG)
    }

    /// The NG markers currently present, `AlterNg` carrying its recorded code.
    pub fn present_ng(&self) -> Vec<MarkerKind> {
        MarkerKind::NG
            .into_iter()
            .filter(|kind| self.exists(*kind))
            .map(|kind| match kind {
                MarkerKind::AlterNg(_) => self
                    .read(kind)
                    .ok()
                    .flatten()
                    .and_then(|record| record.code)
                    .map(MarkerKind::AlterNg)
                    .unwrap_or(kind),
                _ => kind,
            })
            .collect()
    }

    fn marker_error(&self, path: &Path, err: io::Error) -> Error {
        Error::Marker {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}
