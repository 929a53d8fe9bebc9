//! Staged build pipeline for the DoomLinux live ISO.
//!
//! The pipeline turns an empty workspace root into a bootable image in four
//! stages, then records a human-readable summary:
//!
//! - **Workspace** - the artifact paths of one root, plus `reset()`
//! - **Rootfs** - directory scaffold, install instructions, installer payload
//! - **Bootloader** - `grub.cfg` with a single menu entry
//! - **ISO** - initramfs, kernel and the final image
//! - **Logs** - build log, summary, CSV/LaTeX conversion and lint
//!
//! # Architecture
//!
//! ```text
//! doomlinux build
//!     │
//!     └── Orchestrator (state machine)
//!             │
//!             ├── preflight::check_host_tools   (full mode)
//!             ├── Workspace::reset
//!             ├── rootfs::build_rootfs ──────┐
//!             ├── bootloader::write_boot_config
//!             ├── iso::assemble_iso ─────────┤
//!             │                              └── ProcessRunner (sh, cpio, gzip, grub-mkrescue)
//!             └── logs::render_summary
//!
//! doomlinux logs convert|lint
//!     │
//!     └── logs::convert / logs::lint   (summary file only)
//! ```
//!
//! # Modes
//!
//! `full` executes installer scripts and the external image tool. `smoke`
//! (`DOOMLINUX_TEST_MODE=smoke`) walks the same stage sequence but stages the
//! installers without running them and packs the initramfs and image in
//! process, so it needs nothing beyond the workspace itself.
//!
//! # Example
//!
//! ```rust,ignore
//! use doomlinux_builder::{BuildConfig, BuildMode, Orchestrator, SystemRunner, Workspace};
//!
//! let config = BuildConfig::load(root)?;
//! let ws = Workspace::new(root, config.image_filename());
//! let report = Orchestrator::new(ws, config, BuildMode::Smoke, &SystemRunner)?.run()?;
//! println!("image at {}", report.image.path.display());
//! ```

pub mod bootloader;
pub mod config;
pub mod error;
pub mod iso;
pub mod logs;
pub mod orchestrator;
pub mod preflight;
pub mod process;
pub mod rootfs;
pub mod validate;
pub mod workspace;

pub use config::{BuildConfig, BuildMode, ImageTool};
pub use error::{
    BuildError, ConfigError, ExternalToolError, LintError, Stage, StageError, ValidationError,
    WorkspaceError,
};
pub use orchestrator::{BuildReport, BuildState, Orchestrator};
pub use process::{ProcessRunner, SystemRunner, ToolCommand, ToolOutput};
pub use validate::validate;
pub use workspace::{Artifact, Workspace};
