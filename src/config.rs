//! Build configuration.
//!
//! The pipeline reads an optional `DoomLinux.toml` from the workspace root.
//! Every field has a default, so a missing file builds stock DoomLinux.
//!
//! ```toml
//! [distro]
//! name = "DoomLinux"
//! image_name = "DoomLinux"
//!
//! [installer]
//! name = "TrenchBroom"
//! scripts = ["scripts/install-trenchbroom.sh"]
//!
//! [boot]
//! kernel = "staging/bzImage"
//! cmdline = "quiet"
//! timeout = 5
//!
//! [image]
//! tool = "grub-mkrescue"
//! ```

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;
use crate::workspace::STAGING_DIR;

/// Config file looked up at the workspace root.
pub const CONFIG_FILENAME: &str = "DoomLinux.toml";

/// Environment variable selecting the build mode.
pub const MODE_ENV_VAR: &str = "DOOMLINUX_TEST_MODE";

/// Execution mode of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// Every stage with real installer and image tool execution.
    Full,
    /// Same stage sequence, stubbed payload work and in-process archives.
    Smoke,
}

impl BuildMode {
    /// Mode selected by [`MODE_ENV_VAR`]. Absence (or any other value) means full.
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(MODE_ENV_VAR).ok().as_deref())
    }

    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "smoke" => BuildMode::Smoke,
            _ => BuildMode::Full,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildMode::Full => "full",
            BuildMode::Smoke => "smoke",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(BuildMode::Full),
            "smoke" => Ok(BuildMode::Smoke),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Image creation backend used in full mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageTool {
    GrubMkrescue,
    Xorriso,
}

impl ImageTool {
    /// Host binary and the package that provides it.
    pub fn binary(self) -> (&'static str, &'static str) {
        match self {
            ImageTool::GrubMkrescue => ("grub-mkrescue", "grub2-common"),
            ImageTool::Xorriso => ("xorriso", "xorriso"),
        }
    }
}

/// Fully resolved build configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// Distribution name; used verbatim as the boot menu label.
    pub name: String,
    /// Image file stem; the image lands at `<root>/<image_name>.iso`.
    pub image_name: String,
    /// Tool documented by the install instructions.
    pub installer_name: String,
    /// File under `rootfs/root/` holding the install instructions.
    pub instructions_file: String,
    /// Installer scripts, relative to the workspace root.
    pub installer_scripts: Vec<PathBuf>,
    /// Kernel image produced by the installer payload, relative to the root.
    pub kernel: PathBuf,
    /// Initramfs file name under `iso/boot/`.
    pub initramfs_name: String,
    pub cmdline: String,
    pub grub_timeout: u32,
    pub image_tool: ImageTool,
    /// Directory (relative to the root) receiving build and summary logs.
    pub log_dir: PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            name: "DoomLinux".to_string(),
            image_name: "DoomLinux".to_string(),
            installer_name: "TrenchBroom".to_string(),
            instructions_file: "TRENCHBROOM-INSTALL.txt".to_string(),
            installer_scripts: vec![PathBuf::from("scripts/install-trenchbroom.sh")],
            kernel: PathBuf::from("staging/bzImage"),
            initramfs_name: "initramfs.cpio.gz".to_string(),
            cmdline: "quiet".to_string(),
            grub_timeout: 5,
            image_tool: ImageTool::GrubMkrescue,
            log_dir: PathBuf::from("tests/artifacts"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    distro: Option<DistroToml>,
    installer: Option<InstallerToml>,
    boot: Option<BootToml>,
    image: Option<ImageToml>,
    logs: Option<LogsToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DistroToml {
    name: Option<String>,
    image_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstallerToml {
    name: Option<String>,
    instructions_file: Option<String>,
    scripts: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BootToml {
    kernel: Option<String>,
    initramfs_name: Option<String>,
    cmdline: Option<String>,
    timeout: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    tool: Option<ImageTool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogsToml {
    dir: Option<String>,
}

impl BuildConfig {
    /// Load `DoomLinux.toml` from `root`, falling back to defaults when absent.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(CONFIG_FILENAME);
        if !path.is_file() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load an explicit config file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let parsed: ConfigToml = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let invalid = |reason: String| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        };

        let mut config = Self::default();

        if let Some(distro) = parsed.distro {
            if let Some(name) = distro.name {
                config.name = name.trim().to_string();
            }
            if let Some(image_name) = distro.image_name {
                config.image_name = image_name.trim().to_string();
            }
        }
        if config.name.is_empty() {
            return Err(invalid("distro.name must not be empty".to_string()));
        }
        if config.image_name.is_empty() || config.image_name.contains('/') {
            return Err(invalid(format!(
                "distro.image_name must be a plain file stem, got '{}'",
                config.image_name
            )));
        }

        if let Some(installer) = parsed.installer {
            if let Some(name) = installer.name {
                config.installer_name = name.trim().to_string();
            }
            if let Some(file) = installer.instructions_file {
                parse_relative_path(&file, "installer.instructions_file").map_err(&invalid)?;
                config.instructions_file = file;
            }
            if let Some(scripts) = installer.scripts {
                config.installer_scripts = scripts
                    .iter()
                    .map(|s| parse_relative_path(s, "installer.scripts"))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(&invalid)?;
            }
        }
        if config.installer_name.is_empty() {
            return Err(invalid("installer.name must not be empty".to_string()));
        }

        if let Some(boot) = parsed.boot {
            if let Some(kernel) = boot.kernel {
                config.kernel = parse_kernel_path(&kernel).map_err(&invalid)?;
            }
            if let Some(initramfs_name) = boot.initramfs_name {
                if initramfs_name.is_empty() || initramfs_name.contains('/') {
                    return Err(invalid(format!(
                        "boot.initramfs_name must be a file name, got '{}'",
                        initramfs_name
                    )));
                }
                config.initramfs_name = initramfs_name;
            }
            if let Some(cmdline) = boot.cmdline {
                config.cmdline = cmdline.trim().to_string();
            }
            if let Some(timeout) = boot.timeout {
                config.grub_timeout = timeout;
            }
        }

        if let Some(tool) = parsed.image.and_then(|image| image.tool) {
            config.image_tool = tool;
        }

        if let Some(dir) = parsed.logs.and_then(|logs| logs.dir) {
            config.log_dir = parse_relative_path(&dir, "logs.dir").map_err(&invalid)?;
        }

        Ok(config)
    }

    /// Image file name (`<image_name>.iso`).
    pub fn image_filename(&self) -> String {
        format!("{}.iso", self.image_name)
    }

    /// Kernel file name as placed under `iso/boot/`.
    pub fn kernel_filename(&self) -> String {
        self.kernel
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vmlinuz".to_string())
    }
}

fn parse_relative_path(raw: &str, field: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(raw);
    if raw.trim().is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    if candidate.is_absolute() {
        return Err(format!("{field} must be relative, got absolute path '{raw}'"));
    }
    for component in candidate.components() {
        if matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            return Err(format!(
                "{field} contains invalid traversal/root component in '{raw}'"
            ));
        }
    }
    Ok(candidate.to_path_buf())
}

/// The kernel is a build input that smoke builds write and `reset()` clears,
/// so it has to live under `staging/`.
fn parse_kernel_path(raw: &str) -> Result<PathBuf, String> {
    let path = parse_relative_path(raw, "boot.kernel")?;
    let mut components = path.components();
    let in_staging = components.next() == Some(Component::Normal(STAGING_DIR.as_ref()))
        && components.next().is_some();
    if !in_staging {
        return Err(format!(
            "boot.kernel must be a file under '{STAGING_DIR}/', got '{raw}'"
        ));
    }
    Ok(path)
}
