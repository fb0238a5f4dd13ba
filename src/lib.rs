//! Buildah-backed container image builder.
//!
//! Packages prebuilt artifacts (a compiled binary and its data file) into
//! an OCI/Docker image by driving a container-build tool through a fixed
//! sequence: instantiate a working container from a base image, mount its
//! root filesystem, copy the artifacts in, configure entrypoint and user,
//! commit, release.
//!
//! - **Recipes** - Declarative build parameters with defaults matching the
//!   original packaging script ([`recipe`])
//! - **Engine** - Narrow capability interface over the container tool,
//!   with a buildah backend ([`engine`])
//! - **Builder** - The sequential procedure with guaranteed cleanup
//!   ([`builder`])
//! - **Reports** - Per-run manifests with artifact digests ([`report`])
//! - **Preflight** - Host tool validation before builds ([`preflight`])
//!
//! # Example
//!
//! ```rust,ignore
//! use container_builder::{build_image, Buildah, ImageRecipe};
//!
//! let recipe = ImageRecipe::default();
//! let engine = Buildah::new();
//! let summary = build_image(&engine, &recipe)?;
//! println!("committed {}", summary.image_id);
//! ```

pub mod builder;
pub mod engine;
pub mod preflight;
pub mod process;
pub mod recipe;
pub mod report;

pub use builder::{build_image, BuildSummary};
pub use engine::{Buildah, ContainerEngine};
pub use recipe::{load_recipe, ImageFormat, ImageRecipe};
