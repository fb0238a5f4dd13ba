//! Buildah CLI backend.
//!
//! Shells out to `buildah` for container and image operations. Artifact
//! copies go through the mounted root filesystem with `std::fs`, the same
//! way the original packaging script copied into `$(buildah mount ...)`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::Cmd;
use crate::recipe::ImageFormat;

use super::{dest_in_mount, ContainerEngine};

const BUILDAH_INSTALL_HINT: &str =
    "buildah failed. Install it first:\n\
     On Fedora: sudo dnf install buildah\n\
     On Ubuntu: sudo apt install buildah";

/// The production [`ContainerEngine`], backed by the `buildah` binary.
#[derive(Debug, Clone)]
pub struct Buildah {
    program: String,
}

impl Buildah {
    pub fn new() -> Self {
        Self {
            program: "buildah".to_string(),
        }
    }

    /// Use a different binary name or path (e.g. for rootless wrappers).
    pub fn with_program(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    fn cmd(&self) -> Cmd {
        Cmd::new(&self.program)
    }
}

impl Default for Buildah {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerEngine for Buildah {
    fn instantiate(&self, base_image: &str) -> Result<String> {
        let stdout = self
            .cmd()
            .arg("from")
            .arg(base_image)
            .error_msg(BUILDAH_INSTALL_HINT)
            .capture()?;
        // `buildah from` prints pull progress before the container name.
        let Some(container) = last_line(&stdout) else {
            bail!("`buildah from {base_image}` printed no container name");
        };
        Ok(container.to_string())
    }

    fn mount(&self, container: &str) -> Result<PathBuf> {
        let stdout = self.cmd().arg("mount").arg(container).capture()?;
        let Some(path) = last_line(&stdout) else {
            bail!("`buildah mount {container}` printed no mount path");
        };
        Ok(PathBuf::from(path))
    }

    fn copy_into(&self, mount: &Path, source: &Path, dest: &str) -> Result<()> {
        let target = dest_in_mount(mount, dest)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("creating destination directory '{}'", parent.display())
            })?;
        }
        // fs::copy carries the source's permission bits, so an executable
        // stays executable inside the image.
        fs::copy(source, &target).with_context(|| {
            format!(
                "copying '{}' into mount at '{}'",
                source.display(),
                target.display()
            )
        })?;
        Ok(())
    }

    fn set_entrypoint(&self, container: &str, entrypoint: &str) -> Result<()> {
        self.cmd()
            .args(["config", "--entrypoint"])
            .arg(exec_form(entrypoint)?)
            .arg(container)
            .run()
    }

    fn set_user(&self, container: &str, user: &str) -> Result<()> {
        self.cmd()
            .args(["config", "--user"])
            .arg(user)
            .arg(container)
            .run()
    }

    fn commit(&self, container: &str, image_name: &str, format: ImageFormat) -> Result<String> {
        let stdout = self
            .cmd()
            .args(["commit", "--format"])
            .arg(format.as_flag())
            .arg(container)
            .arg(image_name)
            .capture()?;
        let Some(image_id) = last_line(&stdout) else {
            bail!("`buildah commit` printed no image id for '{image_name}'");
        };
        Ok(image_id.to_string())
    }

    fn unmount(&self, container: &str) -> Result<()> {
        self.cmd().arg("umount").arg(container).run()
    }

    fn remove(&self, container: &str) -> Result<()> {
        self.cmd().arg("rm").arg(container).run()
    }
}

/// Encode an entrypoint in exec form so the runtime does not wrap it in a
/// shell.
fn exec_form(entrypoint: &str) -> Result<String> {
    serde_json::to_string(&[entrypoint]).context("encoding entrypoint as exec form")
}

fn last_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_exec_form_encoding() {
        assert_eq!(exec_form("/simpleldap").unwrap(), r#"["/simpleldap"]"#);
        // Quoting survives awkward paths
        assert_eq!(
            exec_form("/opt/my \"app\"").unwrap(),
            r#"["/opt/my \"app\""]"#
        );
    }

    #[test]
    fn test_last_line_skips_progress_output() {
        let stdout = "Getting image source signatures\nCopying blob done\nfedora-working-container";
        assert_eq!(last_line(stdout), Some("fedora-working-container"));
        assert_eq!(last_line("\n \n"), None);
    }

    #[test]
    fn test_copy_into_creates_parents_and_preserves_content() {
        let temp = TempDir::new().unwrap();
        let mount = temp.path().join("mnt");
        fs::create_dir_all(&mount).unwrap();
        let source = temp.path().join("binary");
        fs::write(&source, b"#!ELF not really").unwrap();

        let engine = Buildah::new();
        engine
            .copy_into(&mount, &source, "/opt/app/binary")
            .unwrap();

        assert_eq!(
            fs::read(mount.join("opt/app/binary")).unwrap(),
            b"#!ELF not really"
        );
    }

    #[test]
    fn test_copy_into_missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let engine = Buildah::new();
        let err = engine
            .copy_into(temp.path(), Path::new("/nonexistent_source_12345"), "/x")
            .unwrap_err();
        assert!(err.to_string().contains("copying"));
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_into_preserves_executable_bit() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let source = temp.path().join("binary");
        fs::write(&source, b"x").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o755)).unwrap();

        let engine = Buildah::new();
        engine.copy_into(temp.path(), &source, "/binary").unwrap();

        let mode = fs::metadata(temp.path().join("binary"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
