//! Build orchestration as an explicit state machine.
//!
//! ```text
//! Clean ──► Prepared ──► RootfsBuilt ──► BootConfigured ──► ImageAssembled ──► SummaryEmitted
//!   │          │              │                │                  │                │
//!   └──────────┴──────────────┴────────────────┴──────────────────┴────────────────┴──► Failed { stage }
//! ```
//!
//! Each stage has one transition method. Calling it from any other state is
//! rejected with [`BuildError::OutOfOrder`] before anything runs. `Prepared`
//! is only reachable through [`Orchestrator::prepare`], so no stage runs
//! against a workspace that was not reset first.
//!
//! A failure appends a `❌` line to the build log, removes the image and the
//! summary, persists the state record and parks the machine in `Failed`; only
//! a fresh [`Orchestrator`] can build again. Failing to persist the record
//! after a stage counts as a failure of that stage.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

use crate::bootloader::{self, BootConfig, BootEntry};
use crate::config::{BuildConfig, BuildMode};
use crate::error::{BuildError, Stage, StageError, WorkspaceError};
use crate::iso::{self, ImageArtifact};
use crate::logs::{self, BuildLog, EventStatus, LogEvent, PARTY_GLYPH};
use crate::preflight;
use crate::process::ProcessRunner;
use crate::rootfs::{self, RootfsTree, ROOTFS_DIRS};
use crate::workspace::Workspace;

/// State record file inside `staging/`.
pub const STATE_FILENAME: &str = "build-state.json";

/// Position of the build state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Clean,
    /// Preflight passed, stale outputs removed, workspace reset.
    Prepared,
    RootfsBuilt,
    BootConfigured,
    ImageAssembled,
    SummaryEmitted,
    Failed {
        stage: Stage,
        /// An external tool was interrupted; nothing in the workspace can be
        /// trusted until the next reset.
        inconsistent: bool,
    },
}

impl BuildState {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildState::Clean => "clean",
            BuildState::Prepared => "prepared",
            BuildState::RootfsBuilt => "rootfs_built",
            BuildState::BootConfigured => "boot_configured",
            BuildState::ImageAssembled => "image_assembled",
            BuildState::SummaryEmitted => "summary_emitted",
            BuildState::Failed { .. } => "failed",
        }
    }
}

/// Persisted form of the state machine, rewritten on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub distro: String,
    pub mode: BuildMode,
    pub state: BuildState,
    pub started_at_utc: String,
    pub updated_at_utc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BuildRecord {
    /// Read a previously persisted record, if any.
    pub fn load(ws: &Workspace) -> Option<Self> {
        let text = fs::read_to_string(state_path(ws)).ok()?;
        serde_json::from_str(&text).ok()
    }
}

/// Location of the persisted state record.
pub fn state_path(ws: &Workspace) -> PathBuf {
    ws.staging_dir().join(STATE_FILENAME)
}

/// `<root>/<log_dir>/<mode>-summary.txt`
pub fn summary_path(ws: &Workspace, config: &BuildConfig, mode: BuildMode) -> PathBuf {
    ws.root()
        .join(&config.log_dir)
        .join(format!("{}-summary.txt", mode))
}

/// `<root>/<log_dir>/<mode>-build.log`
pub fn build_log_path(ws: &Workspace, config: &BuildConfig, mode: BuildMode) -> PathBuf {
    ws.root()
        .join(&config.log_dir)
        .join(format!("{}-build.log", mode))
}

/// Outcome of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub mode: BuildMode,
    pub image: ImageArtifact,
    pub summary: PathBuf,
    pub build_log: PathBuf,
}

/// Drives one build through the stages against one workspace.
pub struct Orchestrator<'a> {
    ws: Workspace,
    config: BuildConfig,
    mode: BuildMode,
    runner: &'a dyn ProcessRunner,
    log: BuildLog,
    state: BuildState,
    check_host_tools: bool,
    started_at_utc: String,
    events: Vec<LogEvent>,
    rootfs: Option<RootfsTree>,
    boot: Option<BootConfig>,
    image: Option<ImageArtifact>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        ws: Workspace,
        config: BuildConfig,
        mode: BuildMode,
        runner: &'a dyn ProcessRunner,
    ) -> Result<Self, BuildError> {
        let log_path = build_log_path(&ws, &config, mode);
        let log = BuildLog::open(&log_path).map_err(|source| BuildError::Record {
            path: log_path,
            source,
        })?;
        Ok(Self {
            ws,
            config,
            mode,
            runner,
            log,
            state: BuildState::Clean,
            check_host_tools: mode == BuildMode::Full,
            started_at_utc: logs::now_utc_compact(),
            events: Vec::new(),
            rootfs: None,
            boot: None,
            image: None,
        })
    }

    /// Skip the host tool check (the runner is not a real system).
    pub fn without_preflight(mut self) -> Self {
        self.check_host_tools = false;
        self
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    pub fn workspace(&self) -> &Workspace {
        &self.ws
    }

    /// Rootfs produced so far, once `RootfsBuilt` was reached.
    pub fn rootfs(&self) -> Option<&RootfsTree> {
        self.rootfs.as_ref()
    }

    pub fn boot_config(&self) -> Option<&BootConfig> {
        self.boot.as_ref()
    }

    pub fn summary_path(&self) -> PathBuf {
        summary_path(&self.ws, &self.config, self.mode)
    }

    pub fn build_log_path(&self) -> &Path {
        self.log.path()
    }

    /// Run every stage in order.
    pub fn run(mut self) -> Result<BuildReport, BuildError> {
        self.prepare()?;
        self.build_rootfs()?;
        self.configure_boot()?;
        self.assemble_image()?;
        self.emit_summary()
    }

    /// `Clean → Prepared`: preflight (full mode), drop the stale summary,
    /// reset the workspace.
    pub fn prepare(&mut self) -> Result<(), BuildError> {
        self.require(BuildState::Clean, Stage::Workspace)?;
        let _span = info_span!("stage", stage = "workspace", mode = %self.mode).entered();

        self.append(&format!(
            "== {} {} build started {} ==",
            self.config.name, self.mode, self.started_at_utc
        ));

        if let Some(previous) = BuildRecord::load(&self.ws) {
            if let BuildState::Failed {
                stage,
                inconsistent: true,
            } = previous.state
            {
                warn!(%stage, "previous build was interrupted; workspace will be reset");
            }
        }

        if self.check_host_tools {
            if let Err(err) = preflight::check_host_tools(&self.config, self.mode) {
                // Nothing was touched yet; keep the previous outputs and record.
                self.state = BuildState::Failed {
                    stage: Stage::Preflight,
                    inconsistent: false,
                };
                self.log_failure(Stage::Preflight, &err.to_string());
                return Err(BuildError::Stage {
                    stage: Stage::Preflight,
                    source: err,
                });
            }
            self.succeed(Stage::Preflight, "host tools present".to_string());
        }

        if let Err(err) = self.remove_stale_summary().and_then(|()| self.ws.reset()) {
            return Err(self.fail_workspace(err));
        }
        self.succeed(
            Stage::Workspace,
            format!("workspace reset at {}", self.ws.root().display()),
        );
        self.advance(BuildState::Prepared, Stage::Workspace)
    }

    /// `Prepared → RootfsBuilt`
    pub fn build_rootfs(&mut self) -> Result<(), BuildError> {
        self.require(BuildState::Prepared, Stage::Rootfs)?;
        let _span = info_span!("stage", stage = "rootfs").entered();

        match rootfs::build_rootfs(&self.ws, &self.config, self.mode, self.runner) {
            Ok(tree) => {
                self.succeed(
                    Stage::Rootfs,
                    format!(
                        "{} directories, {} installer(s) staged",
                        ROOTFS_DIRS.len(),
                        tree.installers.len()
                    ),
                );
                self.rootfs = Some(tree);
                self.advance(BuildState::RootfsBuilt, Stage::Rootfs)
            }
            Err(err) => Err(self.fail(Stage::Rootfs, err)),
        }
    }

    /// `RootfsBuilt → BootConfigured`
    pub fn configure_boot(&mut self) -> Result<(), BuildError> {
        self.require(BuildState::RootfsBuilt, Stage::Bootloader)?;
        let _span = info_span!("stage", stage = "bootloader").entered();

        let kernel = self.config.kernel_filename();
        let entry = BootEntry::from_config(&self.config, &kernel);
        match bootloader::write_boot_config(&self.ws, &entry) {
            Ok(boot) => {
                let detail = format!(
                    "{} in {}",
                    bootloader::menu_entry_line(&boot.label),
                    relative(&self.ws, &boot.path)
                );
                self.succeed(Stage::Bootloader, detail);
                self.boot = Some(boot);
                self.advance(BuildState::BootConfigured, Stage::Bootloader)
            }
            Err(err) => Err(self.fail(Stage::Bootloader, err)),
        }
    }

    /// `BootConfigured → ImageAssembled`
    pub fn assemble_image(&mut self) -> Result<(), BuildError> {
        self.require(BuildState::BootConfigured, Stage::Iso)?;
        let _span = info_span!("stage", stage = "iso").entered();

        match iso::assemble_iso(&self.ws, &self.config, self.mode, self.runner) {
            Ok(image) => {
                self.succeed(
                    Stage::Iso,
                    format!(
                        "{} ({} bytes, sha256 {})",
                        relative(&self.ws, &image.path),
                        image.size_bytes,
                        image.sha256
                    ),
                );
                self.image = Some(image);
                self.advance(BuildState::ImageAssembled, Stage::Iso)
            }
            Err(err) => Err(self.fail(Stage::Iso, err)),
        }
    }

    /// `ImageAssembled → SummaryEmitted`: write the summary atomically.
    pub fn emit_summary(&mut self) -> Result<BuildReport, BuildError> {
        self.require(BuildState::ImageAssembled, Stage::Summary)?;
        let _span = info_span!("stage", stage = "summary").entered();

        let image = match self.image.clone() {
            Some(image) => image,
            None => {
                return Err(BuildError::OutOfOrder {
                    stage: Stage::Summary,
                    from: self.state.as_str(),
                })
            }
        };

        let result = LogEvent::new(
            EventStatus::Celebrate,
            "result",
            format!(
                "{} {} build complete {}",
                self.config.name, self.mode, PARTY_GLYPH
            ),
        );
        let title = format!("{} {} build summary", self.config.name, self.mode);
        let text = logs::render_summary(&title, &self.events, &result);

        let summary = self.summary_path();
        if let Err(source) = logs::write_atomic(&summary, text.as_bytes()) {
            let err = StageError::Write {
                path: summary.clone(),
                source,
            };
            return Err(self.fail(Stage::Summary, err));
        }

        self.advance(BuildState::SummaryEmitted, Stage::Summary)?;
        self.append(&result.to_line());
        info!(summary = %summary.display(), "summary emitted");

        Ok(BuildReport {
            mode: self.mode,
            image,
            summary,
            build_log: self.log.path().to_path_buf(),
        })
    }

    fn require(&self, required: BuildState, stage: Stage) -> Result<(), BuildError> {
        if self.state == required {
            Ok(())
        } else {
            Err(BuildError::OutOfOrder {
                stage,
                from: self.state.as_str(),
            })
        }
    }

    /// Enter `next` and persist it. A record that cannot be written fails
    /// `stage`.
    fn advance(&mut self, next: BuildState, stage: Stage) -> Result<(), BuildError> {
        self.state = next;
        match self.write_record(None) {
            Ok(()) => Ok(()),
            Err(source) => {
                let err = StageError::Write {
                    path: state_path(&self.ws),
                    source,
                };
                Err(self.fail(stage, err))
            }
        }
    }

    fn succeed(&mut self, stage: Stage, detail: String) {
        let event = LogEvent::new(EventStatus::Ok, stage.as_str(), detail);
        self.append(&event.to_line());
        info!(%stage, detail = %event.detail, "stage complete");
        self.events.push(event);
    }

    /// Record a failed stage and park the machine in `Failed`.
    fn fail(&mut self, stage: Stage, err: StageError) -> BuildError {
        let inconsistent = err.leaves_workspace_inconsistent();
        self.enter_failed(stage, inconsistent, err.to_string());
        BuildError::Stage { stage, source: err }
    }

    fn fail_workspace(&mut self, err: WorkspaceError) -> BuildError {
        self.enter_failed(Stage::Workspace, false, err.to_string());
        BuildError::Workspace(err)
    }

    fn enter_failed(&mut self, stage: Stage, inconsistent: bool, reason: String) {
        self.state = BuildState::Failed {
            stage,
            inconsistent,
        };
        self.log_failure(stage, &reason);
        self.discard_outputs();
        if let Err(record_err) = self.write_record(Some(reason)) {
            warn!(error = %record_err, "failed to persist build state after failure");
        }
    }

    /// A failed build leaves neither an image nor a summary behind.
    fn discard_outputs(&mut self) {
        self.image = None;
        for path in [
            self.ws.partial_image_path(),
            self.ws.image_path(),
            self.summary_path(),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "removed output of failed build"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "failed to remove output of failed build"),
            }
        }
    }

    fn log_failure(&self, stage: Stage, reason: &str) {
        let event = LogEvent::new(EventStatus::Failed, stage.as_str(), reason);
        self.append(&event.to_line());
        warn!(%stage, error = %reason, "stage failed");
    }

    /// Append to the build log; a log write failure never fails the build.
    fn append(&self, line: &str) {
        if let Err(err) = self.log.append_line(line) {
            warn!(path = %self.log.path().display(), error = %err, "failed to append to build log");
        }
    }

    /// Remove the previous summary and its renderings. Anything other than
    /// "already absent" is fatal: a stale summary must not outlive a failed
    /// build.
    fn remove_stale_summary(&self) -> Result<(), WorkspaceError> {
        let summary = self.summary_path();
        for path in [
            summary.clone(),
            summary.with_extension("csv"),
            summary.with_extension("tex"),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "removed stale summary output"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(WorkspaceError::Remove { path, source }),
            }
        }
        Ok(())
    }

    fn write_record(&self, error: Option<String>) -> io::Result<()> {
        let record = BuildRecord {
            distro: self.config.name.clone(),
            mode: self.mode,
            state: self.state,
            started_at_utc: self.started_at_utc.clone(),
            updated_at_utc: logs::now_utc_compact(),
            image_path: self.image.as_ref().map(|i| i.path.display().to_string()),
            image_sha256: self.image.as_ref().map(|i| i.sha256.clone()),
            error,
        };
        let payload = serde_json::to_vec_pretty(&record).map_err(io::Error::other)?;
        logs::write_atomic(&state_path(&self.ws), &payload)
    }
}

fn relative(ws: &Workspace, path: &Path) -> String {
    path.strip_prefix(ws.root())
        .unwrap_or(path)
        .display()
        .to_string()
}
