//! Narrow capability interface over a container-build tool.
//!
//! The build procedure consumes exactly this surface, so the concrete
//! backend (buildah in production) can be swapped or mocked in tests
//! without touching builder logic.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use crate::recipe::ImageFormat;

pub mod buildah;

pub use buildah::Buildah;

/// Operations the image build needs from a container tool.
///
/// Handles are opaque strings owned by the backend; the builder only
/// threads them between calls.
pub trait ContainerEngine {
    /// Create a working container from a base image. Returns the
    /// container handle. May pull the image from a registry.
    fn instantiate(&self, base_image: &str) -> Result<String>;

    /// Mount the working container's root filesystem and return the
    /// host path. Valid until [`ContainerEngine::unmount`].
    fn mount(&self, container: &str) -> Result<PathBuf>;

    /// Place a host file at `dest` (absolute, in-image) inside the mount.
    fn copy_into(&self, mount: &Path, source: &Path, dest: &str) -> Result<()>;

    /// Set the image entrypoint. Metadata only; the path is not checked
    /// for existence or executability.
    fn set_entrypoint(&self, container: &str, entrypoint: &str) -> Result<()>;

    /// Set the image's default runtime user (`uid:gid`). Metadata only.
    fn set_user(&self, container: &str, user: &str) -> Result<()>;

    /// Snapshot the container's filesystem and metadata as a new image.
    /// Returns the image id. The only step that produces a durable result.
    fn commit(&self, container: &str, image_name: &str, format: ImageFormat) -> Result<String>;

    /// Release the root filesystem mount.
    fn unmount(&self, container: &str) -> Result<()>;

    /// Remove the working container.
    fn remove(&self, container: &str) -> Result<()>;
}

/// Resolve an absolute in-image destination to its host path under the
/// container's mount point.
pub fn dest_in_mount(mount: &Path, dest: &str) -> Result<PathBuf> {
    let Some(relative) = dest.strip_prefix('/') else {
        bail!("in-image destination must be absolute, got '{dest}'");
    };
    if relative.is_empty() {
        bail!("in-image destination must name a file, got '{dest}'");
    }
    Ok(mount.join(relative))
}
