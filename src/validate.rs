//! Post-build checks over a finished workspace.
//!
//! The pipeline never calls these; they back the `validate` command and the
//! test suite.

use std::fs;

use crate::bootloader::count_menu_entries;
use crate::config::BuildConfig;
use crate::error::ValidationError;
use crate::rootfs::ROOTFS_DIRS;
use crate::workspace::Workspace;

/// Check the layout a successful build leaves behind. Returns the first
/// problem found.
pub fn validate(ws: &Workspace, config: &BuildConfig) -> Result<(), ValidationError> {
    let rootfs = ws.rootfs_dir();
    for dir in ROOTFS_DIRS {
        let path = rootfs.join(dir);
        if !path.is_dir() {
            return Err(ValidationError::MissingDirectory(path));
        }
    }

    let instructions = rootfs.join("root").join(&config.instructions_file);
    let text = fs::read_to_string(&instructions)
        .map_err(|_| ValidationError::MissingFile(instructions.clone()))?;
    if !text.contains(&config.installer_name) {
        return Err(ValidationError::MissingContent {
            path: instructions,
            needle: config.installer_name.clone(),
        });
    }

    let grub_cfg = ws.grub_cfg_path();
    let text = fs::read_to_string(&grub_cfg)
        .map_err(|_| ValidationError::MissingFile(grub_cfg.clone()))?;
    let count = count_menu_entries(&text, &config.name);
    if count != 1 {
        return Err(ValidationError::MenuEntryCount {
            path: grub_cfg,
            label: config.name.clone(),
            count,
        });
    }

    let image = ws.image_path();
    match fs::metadata(&image) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        Ok(meta) if meta.is_file() => Err(ValidationError::EmptyImage(image)),
        _ => Err(ValidationError::MissingFile(image)),
    }
}
