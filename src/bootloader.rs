//! GRUB configuration for the ISO layout.
//!
//! The rendered file carries exactly one `menuentry "<Name>" { ... }` block.
//! Validators match that line as a substring, so the label is the literal
//! distribution name with no decoration.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::BuildConfig;
use crate::error::StageError;
use crate::workspace::Workspace;

/// Rendered boot configuration on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub path: PathBuf,
    pub label: String,
}

/// Kernel and initramfs as seen from inside the ISO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry<'a> {
    pub name: &'a str,
    pub kernel: &'a str,
    pub initramfs: &'a str,
    pub cmdline: &'a str,
    pub timeout: u32,
}

impl<'a> BootEntry<'a> {
    pub fn from_config(config: &'a BuildConfig, kernel_filename: &'a str) -> Self {
        Self {
            name: &config.name,
            kernel: kernel_filename,
            initramfs: &config.initramfs_name,
            cmdline: &config.cmdline,
            timeout: config.grub_timeout,
        }
    }
}

/// The `menuentry` line validators look for.
pub fn menu_entry_line(name: &str) -> String {
    format!("menuentry \"{}\" {{", name)
}

/// Render `grub.cfg` text.
pub fn render(entry: &BootEntry<'_>) -> Result<String, StageError> {
    validate_label(entry.name)?;

    let cmdline = entry.cmdline.trim();
    let linux = if cmdline.is_empty() {
        format!("linux /boot/{}", entry.kernel)
    } else {
        format!("linux /boot/{} {}", entry.kernel, cmdline)
    };

    Ok(format!(
        "set default=0\n\
         set timeout={timeout}\n\
         \n\
         insmod all_video\n\
         \n\
         {menu}\n\
         \x20   {linux}\n\
         \x20   initrd /boot/{initramfs}\n\
         }}\n",
        timeout = entry.timeout,
        menu = menu_entry_line(entry.name),
        linux = linux,
        initramfs = entry.initramfs,
    ))
}

/// Render and atomically install `iso/boot/grub/grub.cfg`.
///
/// Re-running replaces the file wholesale; readers see either the old or the
/// new content, never a partial write.
pub fn write_boot_config(ws: &Workspace, entry: &BootEntry<'_>) -> Result<BootConfig, StageError> {
    let text = render(entry)?;
    let path = ws.grub_cfg_path();
    write_atomic(&path, text.as_bytes())?;
    info!(path = %path.display(), label = entry.name, "boot config written");
    Ok(BootConfig {
        path,
        label: entry.name.to_string(),
    })
}

/// Number of `menuentry "<label>" {` lines in `text`.
pub fn count_menu_entries(text: &str, label: &str) -> usize {
    let needle = menu_entry_line(label);
    text.lines()
        .filter(|line| line.trim_start().starts_with(&needle))
        .count()
}

fn validate_label(name: &str) -> Result<(), StageError> {
    if name.trim().is_empty() || name.contains('"') || name.contains('\n') || name.contains('\\') {
        return Err(StageError::InvalidDistroName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StageError> {
    let wrap = |source| StageError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(wrap)?;
    }
    let tmp = path.with_extension(format!("cfg.tmp-{}", std::process::id()));
    fs::write(&tmp, content).map_err(wrap)?;
    if let Err(source) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(wrap(source));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(name: &str) -> BootEntry<'_> {
        BootEntry {
            name,
            kernel: "bzImage",
            initramfs: "initramfs.cpio.gz",
            cmdline: "quiet",
            timeout: 5,
        }
    }

    #[test]
    fn render_contains_single_menu_entry() {
        let text = render(&entry("DoomLinux")).unwrap();
        assert!(text.contains("menuentry \"DoomLinux\" {"));
        assert!(text.contains("    linux /boot/bzImage quiet\n"));
        assert!(text.contains("    initrd /boot/initramfs.cpio.gz\n"));
        assert_eq!(count_menu_entries(&text, "DoomLinux"), 1);
        assert_eq!(text.matches("menuentry").count(), 1);
    }

    #[test]
    fn empty_cmdline_has_no_trailing_space() {
        let mut e = entry("DoomLinux");
        e.cmdline = "  ";
        let text = render(&e).unwrap();
        assert!(text.contains("    linux /boot/bzImage\n"));
    }

    #[test]
    fn quotes_in_name_are_rejected() {
        let err = render(&entry("Doom\"Linux")).unwrap_err();
        assert!(matches!(err, StageError::InvalidDistroName { .. }));
    }

    #[test]
    fn write_replaces_previous_config() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path(), "DoomLinux.iso");

        write_boot_config(&ws, &entry("Old Name")).unwrap();
        let cfg = write_boot_config(&ws, &entry("DoomLinux")).unwrap();

        let text = fs::read_to_string(&cfg.path).unwrap();
        assert_eq!(cfg.path, temp.path().join("iso/boot/grub/grub.cfg"));
        assert!(text.contains("menuentry \"DoomLinux\""));
        assert!(!text.contains("Old Name"));

        let leftovers: Vec<_> = fs::read_dir(cfg.path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("grub.cfg")]);
    }

    #[test]
    fn from_config_uses_config_fields() {
        let config = BuildConfig::default();
        let e = BootEntry::from_config(&config, "bzImage");
        assert_eq!(e.name, "DoomLinux");
        assert_eq!(e.initramfs, "initramfs.cpio.gz");
        assert_eq!(e.timeout, 5);
    }
}
