//! Host preflight checks.
//!
//! The build shells out to a container tool for every step, so a missing
//! or broken installation is caught up front instead of surfacing as a
//! cryptic mid-build error with a half-populated working container.

use anyhow::{bail, Context, Result};

use crate::process::{self, Cmd};

/// Tools the image build invokes, as (command, package) pairs.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("buildah", "buildah")];

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    process::exists(cmd)
}

/// Check that specific tools are available, reporting every missing one
/// with its package name.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {tool} (install: {package})"))
        .collect();

    if !missing.is_empty() {
        bail!("missing required host tools:\n{}", missing.join("\n"));
    }

    Ok(())
}

/// Full preflight for an image build: every required tool is on PATH and
/// the container tool actually answers.
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)?;

    // A present-but-broken buildah (e.g. missing runtime deps) still fails
    // `--version`; catch that here rather than mid-build.
    Cmd::new("buildah")
        .arg("--version")
        .run()
        .context("buildah is installed but not runnable")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists_for_common_tools() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_all_present_tools_pass() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_missing_tool_reports_package() {
        let tools = &[
            ("ls", "coreutils"),
            ("nonexistent_command_xyz", "fake-package"),
        ];
        let err = check_required_tools(tools).unwrap_err();
        assert!(err.to_string().contains("nonexistent_command_xyz"));
        assert!(err.to_string().contains("fake-package"));
    }
}
