//! ISO assembly stage.
//!
//! Lays out `iso/boot/` (kernel + initramfs next to the already rendered
//! `grub/grub.cfg`) and produces the single-file image.
//!
//! The image is always built at `<image>.partial` and renamed into place, so
//! the final path either holds a complete, non-empty image or nothing.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{BuildConfig, BuildMode, ImageTool};
use crate::error::StageError;
use crate::process::{ProcessRunner, ToolCommand};
use crate::workspace::Workspace;

/// The finished image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Assemble the ISO layout and create the image.
///
/// Requires the rootfs tree and `grub.cfg` to exist already.
pub fn assemble_iso(
    ws: &Workspace,
    config: &BuildConfig,
    mode: BuildMode,
    runner: &dyn ProcessRunner,
) -> Result<ImageArtifact, StageError> {
    let rootfs = ws.rootfs_dir();
    if !rootfs.is_dir() {
        return Err(StageError::MissingInput {
            what: "rootfs tree",
            path: rootfs,
        });
    }
    let grub_cfg = ws.grub_cfg_path();
    if !grub_cfg.is_file() {
        return Err(StageError::MissingInput {
            what: "boot configuration",
            path: grub_cfg,
        });
    }

    let boot_dir = ws.iso_dir().join("boot");
    let kernel_src = ws.root().join(&config.kernel);
    if !kernel_src.is_file() {
        return Err(StageError::MissingInput {
            what: "kernel image",
            path: kernel_src,
        });
    }
    let kernel_dst = boot_dir.join(config.kernel_filename());
    hardlink_or_copy(&kernel_src, &kernel_dst)?;

    let initramfs = boot_dir.join(&config.initramfs_name);
    build_initramfs(&rootfs, &initramfs, &ws.staging_dir(), mode, runner)?;

    let image = create_image(ws, config, mode, runner)?;
    info!(
        image = %image.path.display(),
        size_bytes = image.size_bytes,
        sha256 = %image.sha256,
        "image assembled"
    );
    Ok(image)
}

/// Pack the rootfs into the initramfs archive.
fn build_initramfs(
    rootfs: &Path,
    output: &Path,
    scratch: &Path,
    mode: BuildMode,
    runner: &dyn ProcessRunner,
) -> Result<(), StageError> {
    let result = match mode {
        BuildMode::Full => pack_cpio(rootfs, output, scratch, runner),
        BuildMode::Smoke => pack_tree(rootfs, output).map_err(|source| StageError::Write {
            path: output.to_path_buf(),
            source,
        }),
    };

    if result.is_err() {
        let _ = fs::remove_file(output);
        return result;
    }
    if !output.is_file() {
        return Err(StageError::MissingInput {
            what: "initramfs archive",
            path: output.to_path_buf(),
        });
    }
    Ok(())
}

/// gzip-compressed `newc` cpio archive of `rootfs`, written to `output`.
///
/// cpio and gzip run as separate commands so each exit code and stderr is
/// checked on its own. Intermediate files live in `scratch`.
fn pack_cpio(
    rootfs: &Path,
    output: &Path,
    scratch: &Path,
    runner: &dyn ProcessRunner,
) -> Result<(), StageError> {
    fs::create_dir_all(scratch).map_err(|source| StageError::Write {
        path: scratch.to_path_buf(),
        source,
    })?;
    let list = scratch.join("initramfs.list");
    let archive = scratch.join("initramfs.cpio");
    let compressed = scratch.join("initramfs.cpio.gz");
    remove_if_present(&archive)?;
    remove_if_present(&compressed)?;

    write_file_list(rootfs, &list).map_err(|source| StageError::Write {
        path: list.clone(),
        source,
    })?;

    // newc is the only cpio format the kernel unpacks.
    runner.run(
        &ToolCommand::new("cpio")
            .args(["--null", "--quiet", "-o", "-H", "newc", "-O"])
            .arg_path(&archive)
            .current_dir(rootfs)
            .stdin_file(&list),
    )?;
    require_non_empty(&archive, "cpio archive")?;

    runner.run(&ToolCommand::new("gzip").args(["-9", "-n", "-f"]).arg_path(&archive))?;
    require_non_empty(&compressed, "compressed initramfs")?;

    fs::rename(&compressed, output).map_err(|source| StageError::Write {
        path: output.to_path_buf(),
        source,
    })?;
    let _ = fs::remove_file(&list);
    Ok(())
}

/// NUL-separated, sorted paths of every entry under `root`, relative to it.
fn write_file_list(root: &Path, list: &Path) -> io::Result<()> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name().min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        out.extend_from_slice(rel.as_os_str().as_bytes());
        out.push(0);
    }
    fs::write(list, out)
}

fn require_non_empty(path: &Path, what: &'static str) -> Result<(), StageError> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(StageError::EmptyOutput {
            what,
            path: path.to_path_buf(),
        }),
        Err(_) => Err(StageError::MissingInput {
            what,
            path: path.to_path_buf(),
        }),
    }
}

fn create_image(
    ws: &Workspace,
    config: &BuildConfig,
    mode: BuildMode,
    runner: &dyn ProcessRunner,
) -> Result<ImageArtifact, StageError> {
    let partial = ws.partial_image_path();
    let image = ws.image_path();

    remove_if_present(&partial)?;
    remove_if_present(&image)?;

    let result = produce_partial(ws, config, mode, runner, &partial)
        .and_then(|()| finalize(&partial, &image));

    if result.is_err() {
        // Never leave a truncated image behind.
        for path in [&partial, &image] {
            if let Err(err) = fs::remove_file(path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to remove partial image");
                }
            }
        }
    }
    result
}

fn produce_partial(
    ws: &Workspace,
    config: &BuildConfig,
    mode: BuildMode,
    runner: &dyn ProcessRunner,
    partial: &Path,
) -> Result<(), StageError> {
    match mode {
        BuildMode::Full => {
            let command = image_command(config.image_tool, &config.image_name, partial, &ws.iso_dir())
                .current_dir(ws.root());
            runner.run(&command)?;
            Ok(())
        }
        BuildMode::Smoke => pack_tree(&ws.iso_dir(), partial).map_err(|source| StageError::Write {
            path: partial.to_path_buf(),
            source,
        }),
    }
}

/// Command line of the image tool writing `output` from `iso_dir`.
pub fn image_command(tool: ImageTool, image_name: &str, output: &Path, iso_dir: &Path) -> ToolCommand {
    match tool {
        ImageTool::GrubMkrescue => ToolCommand::new("grub-mkrescue")
            .arg("-o")
            .arg_path(output)
            .arg_path(iso_dir),
        ImageTool::Xorriso => ToolCommand::new("xorriso")
            .args(["-as", "mkisofs", "-R", "-J"])
            .args(["-V".to_string(), volume_label(image_name)])
            .arg("-o")
            .arg_path(output)
            .arg_path(iso_dir),
    }
}

/// ISO 9660 volume label: uppercase, `[A-Z0-9_]`, at most 32 characters.
pub fn volume_label(image_name: &str) -> String {
    let label: String = image_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .take(32)
        .collect();
    if label.is_empty() {
        "DOOMLINUX".to_string()
    } else {
        label
    }
}

fn finalize(partial: &Path, image: &Path) -> Result<ImageArtifact, StageError> {
    let size_bytes = match fs::metadata(partial) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(StageError::MissingInput {
                what: "image tool output",
                path: partial.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(StageError::Read {
                path: partial.to_path_buf(),
                source,
            })
        }
    };
    if size_bytes == 0 {
        return Err(StageError::EmptyImage {
            path: image.to_path_buf(),
        });
    }

    fs::rename(partial, image).map_err(|source| StageError::Write {
        path: image.to_path_buf(),
        source,
    })?;

    let sha256 = sha256_file(image).map_err(|source| StageError::Read {
        path: image.to_path_buf(),
        source,
    })?;

    Ok(ImageArtifact {
        path: image.to_path_buf(),
        size_bytes,
        sha256,
    })
}

/// Write `src_dir` as a tar archive at `output`.
///
/// Entries are sorted and normalized (mtime 0, root ownership), so the same
/// tree always yields the same bytes.
pub fn pack_tree(src_dir: &Path, output: &Path) -> io::Result<()> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(output)?;
    let mut builder = tar::Builder::new(file);

    for entry in WalkDir::new(src_dir).sort_by_file_name().min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let metadata = fs::symlink_metadata(entry.path())?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_link_name(&target)?;
            builder.append_data(&mut header, rel, io::empty())?;
        } else if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(permissions_mode(&metadata, 0o755));
            builder.append_data(&mut header, rel, io::empty())?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            header.set_mode(permissions_mode(&metadata, 0o644));
            let reader = BufReader::new(File::open(entry.path())?);
            builder.append_data(&mut header, rel, reader)?;
        }
    }

    builder.into_inner()?.sync_all()?;
    Ok(())
}

fn permissions_mode(metadata: &fs::Metadata, fallback: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    let mode = metadata.permissions().mode() & 0o7777;
    if mode == 0 {
        fallback
    } else {
        mode
    }
}

/// Hard-link `src` to `dest`, copying when linking is not possible
/// (cross-device, unsupported filesystem).
pub fn hardlink_or_copy(src: &Path, dest: &Path) -> Result<(), StageError> {
    let wrap = |source| StageError::Write {
        path: dest.to_path_buf(),
        source,
    };
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(wrap)?;
    }
    if dest.exists() || dest.is_symlink() {
        fs::remove_file(dest).map_err(wrap)?;
    }
    if fs::hard_link(src, dest).is_ok() {
        return Ok(());
    }
    fs::copy(src, dest).map_err(wrap)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), StageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StageError::Write {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::{write_boot_config, BootEntry};
    use crate::error::ExternalToolError;
    use crate::process::fake::ScriptedRunner;
    use tempfile::TempDir;

    /// Workspace with a rootfs, a kernel and a grub.cfg in place.
    fn prepared() -> (TempDir, Workspace, BuildConfig) {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path(), "DoomLinux.iso");
        let config = BuildConfig::default();
        fs::create_dir_all(ws.rootfs_dir().join("bin")).unwrap();
        fs::write(ws.rootfs_dir().join("init"), "#!/bin/sh\n").unwrap();
        fs::create_dir_all(ws.staging_dir()).unwrap();
        fs::write(ws.root().join(&config.kernel), "kernel").unwrap();
        let kernel = config.kernel_filename();
        write_boot_config(&ws, &BootEntry::from_config(&config, &kernel)).unwrap();
        (temp, ws, config)
    }

    #[test]
    fn smoke_produces_non_empty_image() {
        let (_temp, ws, config) = prepared();
        let image = assemble_iso(&ws, &config, BuildMode::Smoke, &ScriptedRunner::new()).unwrap();

        assert_eq!(image.path, ws.image_path());
        assert!(image.size_bytes > 0);
        assert_eq!(image.sha256.len(), 64);
        assert!(ws.iso_dir().join("boot/bzImage").is_file());
        assert!(ws.iso_dir().join("boot/initramfs.cpio.gz").is_file());
        assert!(ws.grub_cfg_path().is_file());
        assert!(!ws.partial_image_path().exists());
    }

    #[test]
    fn smoke_image_is_deterministic() {
        let (_temp, ws, config) = prepared();
        let first = assemble_iso(&ws, &config, BuildMode::Smoke, &ScriptedRunner::new()).unwrap();
        let second = assemble_iso(&ws, &config, BuildMode::Smoke, &ScriptedRunner::new()).unwrap();
        assert_eq!(first.sha256, second.sha256);
    }

    /// Stand in for cpio, gzip and grub-mkrescue by writing their outputs.
    fn fake_tools(cmd: &ToolCommand) {
        match cmd.program.as_str() {
            "cpio" => fs::write(cmd.args.last().unwrap(), b"070701").unwrap(),
            "gzip" => {
                let src = cmd.args.last().unwrap();
                fs::write(format!("{src}.gz"), b"\x1f\x8b").unwrap();
                fs::remove_file(src).unwrap();
            }
            "grub-mkrescue" => fs::write(&cmd.args[1], b"ISO9660").unwrap(),
            _ => {}
        }
    }

    #[test]
    fn full_invokes_cpio_gzip_then_image_tool() {
        let (_temp, ws, config) = prepared();
        let runner = ScriptedRunner::new().with_effect(fake_tools);

        let image = assemble_iso(&ws, &config, BuildMode::Full, &runner).unwrap();

        assert_eq!(runner.programs(), vec!["cpio", "gzip", "grub-mkrescue"]);
        let calls = runner.calls.borrow();
        assert_eq!(calls[0].cwd.as_deref(), Some(ws.rootfs_dir().as_path()));
        assert!(calls[0].display().contains("-o -H newc -O"));
        assert_eq!(
            calls[0].stdin.as_deref(),
            Some(ws.staging_dir().join("initramfs.list").as_path())
        );
        assert_eq!(calls[2].args[1], ws.partial_image_path().to_string_lossy());
        assert_eq!(
            fs::read(ws.iso_dir().join("boot/initramfs.cpio.gz")).unwrap(),
            b"\x1f\x8b"
        );
        assert_eq!(fs::read(&image.path).unwrap(), b"ISO9660");
    }

    #[test]
    fn file_list_names_every_rootfs_entry() {
        let (_temp, ws, _config) = prepared();
        let list = ws.staging_dir().join("list");
        write_file_list(&ws.rootfs_dir(), &list).unwrap();
        assert_eq!(fs::read(&list).unwrap(), b"bin\0init\0");
    }

    #[test]
    fn failing_cpio_fails_the_stage() {
        let (_temp, ws, config) = prepared();
        let runner = ScriptedRunner::new()
            .then_exit(Some(2), "cpio: write error")
            .with_effect(fake_tools);

        let err = assemble_iso(&ws, &config, BuildMode::Full, &runner).unwrap_err();

        match &err {
            StageError::Tool(ExternalToolError::Failed { program, code, stderr, .. }) => {
                assert_eq!(program, "cpio");
                assert_eq!(*code, 2);
                assert!(stderr.contains("write error"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(runner.programs(), vec!["cpio"]);
        assert!(!ws.iso_dir().join("boot/initramfs.cpio.gz").exists());
        assert!(!ws.image_path().exists());
    }

    #[test]
    fn empty_cpio_archive_is_rejected() {
        let (_temp, ws, config) = prepared();
        let runner = ScriptedRunner::new().with_effect(|cmd| {
            if cmd.program == "cpio" {
                fs::write(cmd.args.last().unwrap(), b"").unwrap();
            }
        });

        let err = assemble_iso(&ws, &config, BuildMode::Full, &runner).unwrap_err();
        assert!(matches!(
            err,
            StageError::EmptyOutput {
                what: "cpio archive",
                ..
            }
        ));
        assert_eq!(runner.programs(), vec!["cpio"]);
    }

    #[test]
    fn failing_gzip_fails_the_stage() {
        let (_temp, ws, config) = prepared();
        let runner = ScriptedRunner::new()
            .then_exit(Some(0), "")
            .then_exit(Some(1), "gzip: No space left on device")
            .with_effect(fake_tools);

        let err = assemble_iso(&ws, &config, BuildMode::Full, &runner).unwrap_err();
        assert!(matches!(
            err,
            StageError::Tool(ExternalToolError::Failed { code: 1, .. })
        ));
        assert!(!ws.iso_dir().join("boot/initramfs.cpio.gz").exists());
    }

    #[test]
    fn failing_image_tool_leaves_no_image() {
        let (_temp, ws, config) = prepared();
        let runner = ScriptedRunner::new()
            .then_exit(Some(0), "")
            .then_exit(Some(0), "")
            .then_exit(Some(1), "xorriso : FAILURE")
            .with_effect(fake_tools);

        let err = assemble_iso(&ws, &config, BuildMode::Full, &runner).unwrap_err();

        assert!(matches!(
            err,
            StageError::Tool(ExternalToolError::Failed { code: 1, .. })
        ));
        assert!(!ws.image_path().exists());
        assert!(!ws.partial_image_path().exists());
    }

    #[test]
    fn empty_tool_output_is_rejected() {
        let (_temp, ws, config) = prepared();
        let runner = ScriptedRunner::new().with_effect(|cmd| {
            if cmd.program == "grub-mkrescue" {
                fs::write(&cmd.args[1], b"").unwrap();
            } else {
                fake_tools(cmd);
            }
        });

        let err = assemble_iso(&ws, &config, BuildMode::Full, &runner).unwrap_err();
        assert!(matches!(err, StageError::EmptyImage { .. }));
        assert!(!ws.image_path().exists());
    }

    #[test]
    fn missing_boot_config_is_rejected_before_any_work() {
        let (_temp, ws, config) = prepared();
        fs::remove_file(ws.grub_cfg_path()).unwrap();
        let runner = ScriptedRunner::new();

        let err = assemble_iso(&ws, &config, BuildMode::Full, &runner).unwrap_err();
        assert!(matches!(
            err,
            StageError::MissingInput {
                what: "boot configuration",
                ..
            }
        ));
        assert!(runner.calls.borrow().is_empty());
    }

    #[test]
    fn missing_kernel_is_rejected() {
        let (_temp, ws, config) = prepared();
        fs::remove_file(ws.root().join(&config.kernel)).unwrap();
        let err = assemble_iso(&ws, &config, BuildMode::Smoke, &ScriptedRunner::new()).unwrap_err();
        assert!(matches!(err, StageError::MissingInput { what: "kernel image", .. }));
    }

    #[test]
    fn xorriso_command_carries_volume_label() {
        let cmd = image_command(
            ImageTool::Xorriso,
            "Doom-Linux",
            Path::new("/w/out.partial"),
            Path::new("/w/iso"),
        );
        assert_eq!(
            cmd.display(),
            "xorriso -as mkisofs -R -J -V DOOM_LINUX -o /w/out.partial /w/iso"
        );
    }

    #[test]
    fn pack_tree_round_trips_through_tar_reader() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::write(src.join("etc/motd"), "welcome").unwrap();
        std::os::unix::fs::symlink("etc/motd", src.join("motd")).unwrap();

        let out = temp.path().join("out.tar");
        pack_tree(&src, &out).unwrap();

        let mut archive = tar::Archive::new(File::open(&out).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["etc", "etc/motd", "motd"]);
    }
}
