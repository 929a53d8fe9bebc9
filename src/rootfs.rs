//! Root filesystem stage.
//!
//! Creates the DoomLinux directory scaffold under `rootfs/` and installs the
//! installer payload into `rootfs/root/`.
//!
//! # Modes
//!
//! - **full**: installer scripts are executed through the [`ProcessRunner`]
//!   with `DOOMLINUX_ROOTFS`, `DOOMLINUX_STAGING` and `DOOMLINUX_MODE` set.
//!   They are expected to drop busybox into `rootfs/bin` and the kernel at
//!   the configured path; what they do is opaque to this crate.
//! - **smoke**: scripts are copied (executable) into `rootfs/root/` but not
//!   run, and a stub `init` plus a placeholder kernel are written instead.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::{BuildConfig, BuildMode};
use crate::error::StageError;
use crate::process::{ProcessRunner, ToolCommand};
use crate::workspace::Workspace;

/// Top-level directories every DoomLinux rootfs must contain, in creation order.
pub const ROOTFS_DIRS: [&str; 8] = ["bin", "dev", "mnt", "proc", "sys", "tmp", "root", "etc"];

/// Init script used when no installer provides one.
const INIT_SCRIPT: &str = "#!/bin/sh\n\
mount -t proc none /proc\n\
mount -t sysfs none /sys\n\
mount -t devtmpfs none /dev 2>/dev/null\n\
echo\n\
cat /etc/motd 2>/dev/null\n\
exec /bin/sh\n";

/// Placeholder kernel written by smoke builds.
pub const SMOKE_KERNEL: &[u8] = b"DoomLinux smoke kernel placeholder\n";

/// What the rootfs stage produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootfsTree {
    pub root: PathBuf,
    pub instructions: PathBuf,
    /// Installer scripts executed (full) or copied (smoke).
    pub installers: Vec<PathBuf>,
}

/// Build the rootfs tree for `config` inside `ws`.
pub fn build_rootfs(
    ws: &Workspace,
    config: &BuildConfig,
    mode: BuildMode,
    runner: &dyn ProcessRunner,
) -> Result<RootfsTree, StageError> {
    let root = ws.rootfs_dir();
    ensure_empty_or_absent(&root)?;
    create_scaffold(&root)?;

    let scripts = resolve_installers(ws, config)?;

    let instructions = root.join("root").join(&config.instructions_file);
    write_file(&instructions, render_instructions(config).as_bytes(), None)?;

    write_file(
        &root.join("etc/os-release"),
        os_release(config).as_bytes(),
        None,
    )?;

    fs::create_dir_all(ws.staging_dir()).map_err(|source| StageError::Write {
        path: ws.staging_dir(),
        source,
    })?;

    match mode {
        BuildMode::Full => {
            for script in &scripts {
                run_installer(ws, script, mode, runner)?;
            }
            let init = root.join("init");
            if !init.exists() {
                write_file(&init, INIT_SCRIPT.as_bytes(), Some(0o755))?;
            }
        }
        BuildMode::Smoke => {
            for script in &scripts {
                stage_installer_copy(&root, script)?;
            }
            write_file(&root.join("init"), INIT_SCRIPT.as_bytes(), Some(0o755))?;
            write_file(&ws.root().join(&config.kernel), SMOKE_KERNEL, None)?;
        }
    }

    info!(
        rootfs = %root.display(),
        installers = scripts.len(),
        %mode,
        "rootfs populated"
    );

    Ok(RootfsTree {
        root,
        instructions,
        installers: scripts,
    })
}

/// Create the eight required directories under `root`.
///
/// Reports the first directory that could not be created and leaves the
/// partial tree in place for inspection.
pub fn create_scaffold(root: &Path) -> Result<(), StageError> {
    for dir in ROOTFS_DIRS {
        let path = root.join(dir);
        fs::create_dir_all(&path).map_err(|source| StageError::Scaffold {
            dir,
            path: path.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Install instructions; always names the installer so validators can find it.
pub fn render_instructions(config: &BuildConfig) -> String {
    let mut text = format!(
        "{installer} for {distro}\n\
         {underline}\n\
         \n\
         {installer} is the level editor shipped alongside {distro}.\n\
         To install it on the live system:\n\
         \n",
        installer = config.installer_name,
        distro = config.name,
        underline = "=".repeat(config.installer_name.len() + config.name.len() + 5),
    );

    if config.installer_scripts.is_empty() {
        text.push_str(&format!(
            "  Download {} from its release page and unpack it under /root.\n",
            config.installer_name
        ));
    } else {
        for script in &config.installer_scripts {
            let name = script
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| script.display().to_string());
            text.push_str(&format!("  sh /root/{}\n", name));
        }
    }

    text.push_str(&format!(
        "\nThen launch {} from a shell and point it at your WAD directory.\n",
        config.installer_name
    ));
    text
}

fn os_release(config: &BuildConfig) -> String {
    let id = config
        .name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    format!(
        "NAME=\"{name}\"\nID={id}\nPRETTY_NAME=\"{name}\"\n",
        name = config.name
    )
}

fn ensure_empty_or_absent(root: &Path) -> Result<(), StageError> {
    match fs::read_dir(root) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(StageError::RootfsNotEmpty {
                    path: root.to_path_buf(),
                });
            }
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StageError::Read {
            path: root.to_path_buf(),
            source,
        }),
    }
}

fn resolve_installers(ws: &Workspace, config: &BuildConfig) -> Result<Vec<PathBuf>, StageError> {
    let mut scripts = Vec::with_capacity(config.installer_scripts.len());
    for relative in &config.installer_scripts {
        let path = ws.root().join(relative);
        if !path.is_file() {
            return Err(StageError::MissingInput {
                what: "installer script",
                path,
            });
        }
        scripts.push(path);
    }
    Ok(scripts)
}

fn run_installer(
    ws: &Workspace,
    script: &Path,
    mode: BuildMode,
    runner: &dyn ProcessRunner,
) -> Result<(), StageError> {
    info!(script = %script.display(), "running installer");
    let command = ToolCommand::new("sh")
        .arg_path(script)
        .current_dir(ws.root())
        .env_path("DOOMLINUX_ROOTFS", &ws.rootfs_dir())
        .env_path("DOOMLINUX_STAGING", &ws.staging_dir())
        .env("DOOMLINUX_MODE", mode.as_str());
    let output = runner.run(&command)?;
    if !output.stderr.trim().is_empty() {
        warn!(script = %script.display(), stderr = %output.stderr.trim(), "installer wrote to stderr");
    }
    Ok(())
}

fn stage_installer_copy(root: &Path, script: &Path) -> Result<(), StageError> {
    let Some(name) = script.file_name() else {
        return Err(StageError::MissingInput {
            what: "installer script name",
            path: script.to_path_buf(),
        });
    };
    let dest = root.join("root").join(name);
    let content = fs::read(script).map_err(|source| StageError::Read {
        path: script.to_path_buf(),
        source,
    })?;
    write_file(&dest, &content, Some(0o755))
}

fn write_file(path: &Path, content: &[u8], mode: Option<u32>) -> Result<(), StageError> {
    let wrap = |source| StageError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(wrap)?;
    }
    fs::write(path, content).map_err(wrap)?;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(wrap)?;
    }
    Ok(())
}
