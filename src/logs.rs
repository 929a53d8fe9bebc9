//! Build log format and the log pipeline (convert + lint).
//!
//! Build and summary logs share one line format:
//!
//! ```text
//! # DoomLinux smoke build summary
//!
//! ## Stages
//! ✅ rootfs | 20261016T101500Z | 8 directories, 1 installer(s) staged
//! ✅ iso | 20261016T101502Z | DoomLinux.iso (40960 bytes)
//!
//! ## Result
//! ✨ result | 20261016T101502Z | DoomLinux smoke build complete 🎉
//! ```
//!
//! Every line starting with a status glyph is an event: `<glyph> <stage> |
//! <timestamp> | <detail>`. The summary is the source of truth; CSV and LaTeX
//! renderings are derived from it and can be regenerated at any time.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::LintError;

pub const SUCCESS_GLYPH: &str = "✅";
pub const CELEBRATION_GLYPH: &str = "✨";
pub const FAILURE_GLYPH: &str = "❌";
pub const PARTY_GLYPH: &str = "🎉";
pub const STAGES_SECTION: &str = "## Stages";
pub const RESULT_SECTION: &str = "## Result";

/// Markers a summary must contain, checked in this order. Section headers
/// must stand on a line of their own; glyphs must lead a parsed event.
pub const REQUIRED_MARKERS: &[(&str, &str)] = &[
    (STAGES_SECTION, "stages section header"),
    (SUCCESS_GLYPH, "success status marker"),
    (RESULT_SECTION, "result section header"),
    (CELEBRATION_GLYPH, "celebration marker"),
];

/// Status of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Ok,
    Failed,
    Celebrate,
}

impl EventStatus {
    pub fn glyph(self) -> &'static str {
        match self {
            EventStatus::Ok => SUCCESS_GLYPH,
            EventStatus::Failed => FAILURE_GLYPH,
            EventStatus::Celebrate => CELEBRATION_GLYPH,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Ok => "ok",
            EventStatus::Failed => "failed",
            EventStatus::Celebrate => "celebrate",
        }
    }

    fn from_line(line: &str) -> Option<(Self, &str)> {
        [EventStatus::Ok, EventStatus::Failed, EventStatus::Celebrate]
            .into_iter()
            .find_map(|status| {
                line.strip_prefix(status.glyph())
                    .map(|rest| (status, rest.trim_start()))
            })
    }
}

/// One structured log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub status: EventStatus,
    pub stage: String,
    pub timestamp: String,
    pub detail: String,
}

impl LogEvent {
    pub fn new(status: EventStatus, stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status,
            stage: stage.into(),
            timestamp: now_utc_compact(),
            detail: detail.into(),
        }
    }

    /// Render as a log line (no trailing newline).
    pub fn to_line(&self) -> String {
        format!(
            "{} {} | {} | {}",
            self.status.glyph(),
            self.stage,
            self.timestamp,
            self.detail.replace('\n', " ")
        )
    }

    /// Parse a log line; `None` for headers, blank lines and free text.
    pub fn parse(line: &str) -> Option<Self> {
        let (status, rest) = EventStatus::from_line(line.trim_end())?;
        let mut parts = rest.splitn(3, " | ");
        let stage = parts.next()?.trim();
        if stage.is_empty() {
            return None;
        }
        let timestamp = parts.next().unwrap_or("").trim();
        let detail = parts.next().unwrap_or("").trim();
        Some(Self {
            status,
            stage: stage.to_string(),
            timestamp: timestamp.to_string(),
            detail: detail.to_string(),
        })
    }
}

/// All events in `text`, in order of appearance.
pub fn parse_events(text: &str) -> Vec<LogEvent> {
    text.lines().filter_map(LogEvent::parse).collect()
}

/// Render a success summary from the stage events.
pub fn render_summary(title: &str, stages: &[LogEvent], result: &LogEvent) -> String {
    let mut out = format!("# {}\n\n{}\n", title, STAGES_SECTION);
    for event in stages {
        out.push_str(&event.to_line());
        out.push('\n');
    }
    out.push_str(&format!("\n{}\n{}\n", RESULT_SECTION, result.to_line()));
    out
}

/// Append-only build log.
#[derive(Debug, Clone)]
pub struct BuildLog {
    path: PathBuf,
}

impl BuildLog {
    /// Open (creating parent directories); existing content is kept.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_line(&self, line: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    pub fn record(&self, event: &LogEvent) -> io::Result<()> {
        self.append_line(&event.to_line())
    }
}

/// Write `content` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp-{}", file_name, std::process::id()));
    fs::write(&tmp, content)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

/// Paths written by [`convert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedLogs {
    pub source: PathBuf,
    pub csv: PathBuf,
    pub tex: PathBuf,
    pub rows: usize,
}

/// Render `summary` as `<stem>.csv` and `<stem>.tex` alongside it.
///
/// Only reads the source; identical input bytes give identical outputs.
pub fn convert(summary: &Path) -> io::Result<ConvertedLogs> {
    let text = fs::read_to_string(summary)?;
    let events = parse_events(&text);
    let source_name = summary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let csv = summary.with_extension("csv");
    let tex = summary.with_extension("tex");
    write_atomic(&csv, render_csv(&events).as_bytes())?;
    write_atomic(&tex, render_latex(&events, &source_name).as_bytes())?;

    info!(
        source = %summary.display(),
        rows = events.len(),
        "log summary converted"
    );

    Ok(ConvertedLogs {
        source: summary.to_path_buf(),
        csv,
        tex,
        rows: events.len(),
    })
}

/// CSV with a header row and one row per event.
pub fn render_csv(events: &[LogEvent]) -> String {
    let mut out = String::from("status,stage,timestamp,detail\n");
    for event in events {
        let row = [
            event.status.as_str(),
            event.stage.as_str(),
            event.timestamp.as_str(),
            event.detail.as_str(),
        ]
        .iter()
        .map(|field| csv_field(field))
        .collect::<Vec<_>>()
        .join(",");
        out.push_str(&row);
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// LaTeX `tabular` mirroring [`render_csv`] row for row.
pub fn render_latex(events: &[LogEvent], source_name: &str) -> String {
    let mut out = format!(
        "% Generated from {}\n\\begin{{tabular}}{{llll}}\n\\hline\nStatus & Stage & Timestamp & Detail \\\\\n\\hline\n",
        latex_escape(source_name)
    );
    for event in events {
        out.push_str(&format!(
            "{} & {} & {} & {} \\\\\n",
            latex_escape(event.status.as_str()),
            latex_escape(&event.stage),
            latex_escape(&event.timestamp),
            latex_escape(&event.detail),
        ));
    }
    out.push_str("\\hline\n\\end{tabular}\n");
    out
}

fn latex_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\textbackslash{}"),
            '&' | '%' | '$' | '#' | '_' | '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            '~' => out.push_str("\\textasciitilde{}"),
            '^' => out.push_str("\\textasciicircum{}"),
            '✅' => out.push_str("[ok]"),
            '❌' => out.push_str("[failed]"),
            '✨' => out.push_str("[done]"),
            '🎉' => out.push_str("[party]"),
            _ => out.push(c),
        }
    }
    out
}

/// Outcome of a passing lint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintReport {
    pub path: PathBuf,
    pub events: usize,
}

/// Check `path` for the required markers. Never modifies the file.
///
/// Fails on the first missing marker (in [`REQUIRED_MARKERS`] order), then on
/// the first recorded failure line.
pub fn lint(path: &Path) -> Result<LintReport, LintError> {
    let text = fs::read_to_string(path).map_err(|err| LintError::Unreadable {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    lint_text(&text, path)
}

pub fn lint_text(text: &str, path: &Path) -> Result<LintReport, LintError> {
    let events = parse_events(text);
    for &(marker, description) in REQUIRED_MARKERS {
        if !marker_present(text, &events, marker) {
            return Err(LintError::MissingMarker {
                path: path.to_path_buf(),
                marker,
                description,
            });
        }
    }

    if let Some((index, line)) = text
        .lines()
        .enumerate()
        .find(|(_, line)| line.trim_start().starts_with(FAILURE_GLYPH))
    {
        return Err(LintError::FailureRecorded {
            path: path.to_path_buf(),
            line: index + 1,
            text: line.trim().to_string(),
        });
    }

    let events = events.len();
    debug!(path = %path.display(), events, "log lint passed");
    Ok(LintReport {
        path: path.to_path_buf(),
        events,
    })
}

fn marker_present(text: &str, events: &[LogEvent], marker: &str) -> bool {
    if marker.starts_with('#') {
        text.lines().any(|line| line.trim_end() == marker)
    } else {
        events.iter().any(|event| event.status.glyph() == marker)
    }
}

/// Compact UTC timestamp, e.g. `20261016T101500Z`.
pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
