//! Preflight checks for full builds.
//!
//! Validates that the host has the tools a full build shells out to before
//! the workspace is touched, instead of failing halfway through assembly.

use crate::config::{BuildConfig, BuildMode};
use crate::error::StageError;

/// Check if a command exists on the host system (searches `PATH`).
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools every full build needs regardless of image backend.
///
/// Each tuple is (command_name, package_name).
pub const BASE_TOOLS: &[(&str, &str)] = &[
    ("sh", "dash"),
    ("cpio", "cpio"),
    ("gzip", "gzip"),
];

/// Tools required for `config` in `mode`. Smoke builds need none.
pub fn required_tools(config: &BuildConfig, mode: BuildMode) -> Vec<(&'static str, &'static str)> {
    match mode {
        BuildMode::Smoke => Vec::new(),
        BuildMode::Full => {
            let mut tools = BASE_TOOLS.to_vec();
            tools.push(config.image_tool.binary());
            tools
        }
    }
}

/// Check that specific tools are available.
///
/// Reports every missing tool at once, with the package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<(), StageError> {
    let missing: Vec<(String, String)> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| (tool.to_string(), package.to_string()))
        .collect();

    if !missing.is_empty() {
        return Err(StageError::MissingTool { missing });
    }
    Ok(())
}

/// Check everything a build of `config` in `mode` will invoke.
pub fn check_host_tools(config: &BuildConfig, mode: BuildMode) -> Result<(), StageError> {
    check_required_tools(&required_tools(config, mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageTool;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_failure_lists_packages() {
        let tools = &[
            ("sh", "dash"),
            ("nonexistent_command_xyz", "fake-package"),
        ];
        let err = check_required_tools(tools).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nonexistent_command_xyz (install: fake-package)"));
        assert!(!msg.contains("dash"));
    }

    #[test]
    fn smoke_needs_no_host_tools() {
        assert!(required_tools(&BuildConfig::default(), BuildMode::Smoke).is_empty());
        assert!(check_host_tools(&BuildConfig::default(), BuildMode::Smoke).is_ok());
    }

    #[test]
    fn full_includes_configured_image_tool() {
        let config = BuildConfig {
            image_tool: ImageTool::Xorriso,
            ..BuildConfig::default()
        };
        let tools = required_tools(&config, BuildMode::Full);
        assert!(tools.contains(&("xorriso", "xorriso")));
        assert!(tools.contains(&("cpio", "cpio")));
    }
}
