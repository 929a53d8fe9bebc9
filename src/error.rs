//! Error types for the DoomLinux build pipeline.
//!
//! Each pipeline component has its own error enum so callers can tell a
//! workspace problem from a failed stage or a misbehaving external tool.
//! [`BuildError`] is what the orchestrator surfaces; it always names the
//! stage that failed.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while resetting or locking the workspace.
///
/// These are fatal: the user has to fix permissions or release a busy file
/// before another build can start.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("failed to remove workspace artifact '{}': {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open workspace lock '{}': {source}", path.display())]
    LockOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("workspace '{}' is locked by another build (lock file: {})", root.display(), path.display())]
    Locked { root: PathBuf, path: PathBuf },
}

/// Non-zero exit (or interruption) of an invoked utility.
#[derive(Error, Debug)]
pub enum ExternalToolError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program} {}' exited with code {code}: {}", args.join(" "), summarize(stdout, stderr))]
    Failed {
        program: String,
        args: Vec<String>,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("'{program} {}' was interrupted by a signal; workspace must be reset", args.join(" "))]
    Interrupted {
        program: String,
        args: Vec<String>,
        stdout: String,
        stderr: String,
    },
}

impl ExternalToolError {
    /// True when the tool did not run to completion.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ExternalToolError::Interrupted { .. })
    }
}

fn summarize(stdout: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = stdout.trim();
    if stdout.is_empty() {
        "(no output)".to_string()
    } else {
        stdout.to_string()
    }
}

/// Failures inside a single build stage.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("rootfs directory '{}' already has content; reset the workspace first", path.display())]
    RootfsNotEmpty { path: PathBuf },

    #[error("failed to create rootfs directory '{dir}' at '{}': {source}", path.display())]
    Scaffold {
        dir: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("required input missing: {what} ({})", path.display())]
    MissingInput { what: &'static str, path: PathBuf },

    #[error("distribution name {name:?} cannot be used as a boot menu label")]
    InvalidDistroName { name: String },

    #[error("missing required host tools:\n{}", format_missing(missing))]
    MissingTool { missing: Vec<(String, String)> },

    #[error("image tool produced an empty image at '{}'", path.display())]
    EmptyImage { path: PathBuf },

    #[error("{what} at '{}' is empty", path.display())]
    EmptyOutput { what: &'static str, path: PathBuf },

    #[error(transparent)]
    Tool(#[from] ExternalToolError),
}

fn format_missing(missing: &[(String, String)]) -> String {
    missing
        .iter()
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect::<Vec<_>>()
        .join("\n")
}

impl StageError {
    /// True when an external tool was cut short and the workspace can no
    /// longer be trusted.
    pub fn leaves_workspace_inconsistent(&self) -> bool {
        matches!(self, StageError::Tool(tool) if tool.is_interrupted())
    }
}

/// Post-build checks. Used by callers and tests, never by the pipeline.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("expected directory missing: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("expected file missing: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("'{}' does not mention {needle:?}", path.display())]
    MissingContent { path: PathBuf, needle: String },

    #[error("boot config '{}' has {count} menu entries labelled {label:?}; expected exactly one", path.display())]
    MenuEntryCount {
        path: PathBuf,
        label: String,
        count: usize,
    },

    #[error("image '{}' is empty", .0.display())]
    EmptyImage(PathBuf),
}

/// Failure of the log lint. Names the first problem only.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LintError {
    #[error("failed to read log '{}': {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("log '{}' is missing required marker {marker:?} ({description})", path.display())]
    MissingMarker {
        path: PathBuf,
        marker: &'static str,
        description: &'static str,
    },

    #[error("log '{}' records a failure on line {line}: {text}", path.display())]
    FailureRecorded {
        path: PathBuf,
        line: usize,
        text: String,
    },
}

/// Problems loading `DoomLinux.toml`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config '{}': {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },

    #[error("unsupported build mode '{0}'; expected 'smoke' or 'full'")]
    UnknownMode(String),
}

/// Pipeline stage names, used in logs, state records and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Workspace,
    Preflight,
    Rootfs,
    Bootloader,
    Iso,
    Summary,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Workspace => "workspace",
            Stage::Preflight => "preflight",
            Stage::Rootfs => "rootfs",
            Stage::Bootloader => "bootloader",
            Stage::Iso => "iso",
            Stage::Summary => "summary",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the orchestrator reports when a build stops.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("workspace stage failed: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },

    #[error("{stage} stage cannot run from state '{from}'")]
    OutOfOrder { stage: Stage, from: &'static str },

    #[error("failed to persist build record '{}': {source}", path.display())]
    Record {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    /// The stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            BuildError::Workspace(_) => Stage::Workspace,
            BuildError::Stage { stage, .. } | BuildError::OutOfOrder { stage, .. } => *stage,
            BuildError::Record { .. } => Stage::Summary,
        }
    }

    /// Process exit code distinguishing the failing stage.
    pub fn exit_code(&self) -> i32 {
        match self.stage() {
            Stage::Workspace => 3,
            Stage::Preflight => 4,
            Stage::Rootfs => 10,
            Stage::Bootloader => 11,
            Stage::Iso => 12,
            Stage::Summary => 13,
        }
    }
}
