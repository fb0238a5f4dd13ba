//! Build recipes: the parameters of a container image build.
//!
//! The recipe replaces the hard-coded literals of the original packaging
//! script with an explicit configuration structure. [`ImageRecipe::default`]
//! reproduces those literals exactly, so running with no recipe file builds
//! the same image the script did.
//!
//! Recipes load from TOML:
//!
//! ```toml
//! [image]
//! name = "simpleldap"
//! base = "docker.io/fedora:35"
//! entrypoint = "/simpleldap"
//! user = "1000:1000"
//! format = "docker"
//!
//! [[artifact]]
//! source = "./target/release/simpleldap"
//! dest = "/simpleldap"
//!
//! [[artifact]]
//! source = "./database.sqlite"
//! dest = "/database.sqlite"
//!
//! [build]
//! pull_retries = 2
//! keep_on_failure = false
//! ```
//!
//! Every field is optional; omitted fields fall back to the defaults above.
//! Unknown keys are rejected.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Base image the working container is instantiated from.
pub const DEFAULT_BASE_IMAGE: &str = "docker.io/fedora:35";

/// Name the committed image is stored under.
pub const DEFAULT_IMAGE_NAME: &str = "simpleldap";

/// Entrypoint recorded in the committed image's metadata.
pub const DEFAULT_ENTRYPOINT: &str = "/simpleldap";

/// Runtime user recorded in the committed image's metadata.
pub const DEFAULT_USER: &str = "1000:1000";

/// Directory holding build locks and run manifests.
pub const DEFAULT_STATE_DIR: &str = ".builds";

/// Extra instantiation attempts after the first failure.
pub const DEFAULT_PULL_RETRIES: u32 = 2;

const MAX_PULL_RETRIES: u32 = 10;

/// Storage format of the committed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Docker image manifest format (the original script's choice).
    Docker,
    /// OCI image manifest format.
    Oci,
}

impl ImageFormat {
    /// Value passed to the container tool's `--format` flag.
    pub fn as_flag(&self) -> &'static str {
        match self {
            ImageFormat::Docker => "docker",
            ImageFormat::Oci => "oci",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_flag())
    }
}

/// A host file embedded into the image at a fixed destination path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Artifact {
    /// Path on the host, resolved relative to the working directory.
    pub source: PathBuf,
    /// Absolute path inside the image.
    pub dest: String,
}

/// Knobs for the build procedure itself, as opposed to the image contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Keep the working container (mounted) when a build fails, for
    /// diagnosis. Cleanup is the default.
    pub keep_on_failure: bool,
    /// Extra instantiation attempts after the first failure. Instantiation
    /// is the only step with a transient failure mode (registry pulls).
    pub pull_retries: u32,
    /// Overall wall-clock budget. Checked between steps; a running step is
    /// never interrupted.
    pub timeout_secs: Option<u64>,
    /// Directory for build locks and run manifests.
    pub state_dir: PathBuf,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            keep_on_failure: false,
            pull_retries: DEFAULT_PULL_RETRIES,
            timeout_secs: None,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}

/// Complete parameterization of one image build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecipe {
    pub image_name: String,
    pub base_image: String,
    pub entrypoint: String,
    pub user: String,
    pub format: ImageFormat,
    pub artifacts: Vec<Artifact>,
    pub build: BuildOptions,
}

impl Default for ImageRecipe {
    fn default() -> Self {
        Self {
            image_name: DEFAULT_IMAGE_NAME.to_string(),
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            entrypoint: DEFAULT_ENTRYPOINT.to_string(),
            user: DEFAULT_USER.to_string(),
            format: ImageFormat::Docker,
            artifacts: vec![
                Artifact {
                    source: PathBuf::from("./target/release/simpleldap"),
                    dest: "/simpleldap".to_string(),
                },
                Artifact {
                    source: PathBuf::from("./database.sqlite"),
                    dest: "/database.sqlite".to_string(),
                },
            ],
            build: BuildOptions::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeDoc {
    image: ImageDoc,
    #[serde(default, rename = "artifact")]
    artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    build: Option<BuildDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageDoc {
    name: Option<String>,
    base: Option<String>,
    entrypoint: Option<String>,
    user: Option<String>,
    format: Option<ImageFormat>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildDoc {
    keep_on_failure: Option<bool>,
    pull_retries: Option<u32>,
    timeout_secs: Option<u64>,
    state_dir: Option<PathBuf>,
}

/// Load and validate a recipe from a TOML file.
///
/// Omitted fields fall back to the defaults matching the original script.
pub fn load_recipe(path: &Path) -> Result<ImageRecipe> {
    let bytes = fs::read_to_string(path)
        .with_context(|| format!("reading build recipe '{}'", path.display()))?;
    let doc: RecipeDoc = toml::from_str(&bytes)
        .with_context(|| format!("parsing build recipe '{}'", path.display()))?;

    let defaults = ImageRecipe::default();
    let build_doc = doc.build.unwrap_or_default();

    let recipe = ImageRecipe {
        image_name: doc
            .image
            .name
            .map(|name| name.trim().to_string())
            .unwrap_or(defaults.image_name),
        base_image: doc
            .image
            .base
            .map(|base| base.trim().to_string())
            .unwrap_or(defaults.base_image),
        entrypoint: doc.image.entrypoint.unwrap_or(defaults.entrypoint),
        user: doc.image.user.unwrap_or(defaults.user),
        format: doc.image.format.unwrap_or(defaults.format),
        artifacts: if doc.artifacts.is_empty() {
            defaults.artifacts
        } else {
            doc.artifacts
        },
        build: BuildOptions {
            keep_on_failure: build_doc.keep_on_failure.unwrap_or(false),
            pull_retries: build_doc.pull_retries.unwrap_or(DEFAULT_PULL_RETRIES),
            timeout_secs: build_doc.timeout_secs,
            state_dir: build_doc
                .state_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
        },
    };

    recipe
        .validate()
        .with_context(|| format!("invalid build recipe '{}'", path.display()))?;
    Ok(recipe)
}

impl ImageRecipe {
    /// Structural checks. Source artifact existence is a build-time concern,
    /// not a load-time one, and is checked by the builder.
    pub fn validate(&self) -> Result<()> {
        if self.image_name.is_empty() || self.image_name.contains(char::is_whitespace) {
            bail!("image.name must be a non-empty reference without whitespace");
        }
        if self.base_image.is_empty() || self.base_image.contains(char::is_whitespace) {
            bail!("image.base must be a non-empty reference without whitespace");
        }
        if !self.entrypoint.starts_with('/') {
            bail!(
                "image.entrypoint must be an absolute path inside the image, got '{}'",
                self.entrypoint
            );
        }
        parse_user_spec(&self.user)?;
        if self.artifacts.is_empty() {
            bail!("at least one [[artifact]] is required");
        }
        for artifact in &self.artifacts {
            if artifact.source.as_os_str().is_empty() {
                bail!("artifact.source must not be empty");
            }
            if !artifact.dest.starts_with('/') || artifact.dest.ends_with('/') {
                bail!(
                    "artifact.dest must be an absolute file path inside the image, got '{}'",
                    artifact.dest
                );
            }
        }
        if self.build.pull_retries > MAX_PULL_RETRIES {
            bail!(
                "build.pull_retries must be at most {}, got {}",
                MAX_PULL_RETRIES,
                self.build.pull_retries
            );
        }
        Ok(())
    }

    /// Render the fully-resolved recipe as TOML.
    pub fn to_toml(&self) -> Result<String> {
        let doc = RecipeDoc {
            image: ImageDoc {
                name: Some(self.image_name.clone()),
                base: Some(self.base_image.clone()),
                entrypoint: Some(self.entrypoint.clone()),
                user: Some(self.user.clone()),
                format: Some(self.format),
            },
            artifacts: self.artifacts.clone(),
            build: Some(BuildDoc {
                keep_on_failure: Some(self.build.keep_on_failure),
                pull_retries: Some(self.build.pull_retries),
                timeout_secs: self.build.timeout_secs,
                state_dir: Some(self.build.state_dir.clone()),
            }),
        };
        toml::to_string_pretty(&doc).context("rendering recipe as TOML")
    }
}

/// Parse a `uid:gid` user spec into its numeric parts.
pub fn parse_user_spec(spec: &str) -> Result<(u32, u32)> {
    let Some((uid, gid)) = spec.split_once(':') else {
        bail!("image.user must be numeric 'uid:gid', got '{}'", spec);
    };
    let uid = uid
        .parse::<u32>()
        .with_context(|| format!("image.user has non-numeric uid in '{spec}'"))?;
    let gid = gid
        .parse::<u32>()
        .with_context(|| format!("image.user has non-numeric gid in '{spec}'"))?;
    Ok((uid, gid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_recipe_matches_original_literals() {
        let recipe = ImageRecipe::default();
        assert_eq!(recipe.image_name, "simpleldap");
        assert_eq!(recipe.base_image, "docker.io/fedora:35");
        assert_eq!(recipe.entrypoint, "/simpleldap");
        assert_eq!(recipe.user, "1000:1000");
        assert_eq!(recipe.format, ImageFormat::Docker);
        assert_eq!(recipe.artifacts.len(), 2);
        assert_eq!(
            recipe.artifacts[0].source,
            PathBuf::from("./target/release/simpleldap")
        );
        assert_eq!(recipe.artifacts[0].dest, "/simpleldap");
        assert_eq!(recipe.artifacts[1].dest, "/database.sqlite");
        assert!(recipe.validate().is_ok());
    }

    #[test]
    fn test_load_recipe_partial_toml_fills_defaults() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("image.toml");
        fs::write(
            &path,
            "[image]\nname = \"myapp\"\n\n[[artifact]]\nsource = \"./myapp\"\ndest = \"/myapp\"\n",
        )
        .unwrap();

        let recipe = load_recipe(&path).unwrap();
        assert_eq!(recipe.image_name, "myapp");
        assert_eq!(recipe.base_image, DEFAULT_BASE_IMAGE);
        assert_eq!(recipe.user, DEFAULT_USER);
        assert_eq!(recipe.artifacts.len(), 1);
        assert_eq!(recipe.build.pull_retries, DEFAULT_PULL_RETRIES);
    }

    #[test]
    fn test_load_recipe_rejects_unknown_keys() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("image.toml");
        fs::write(&path, "[image]\nnam = \"typo\"\n").unwrap();

        let err = load_recipe(&path).unwrap_err();
        assert!(err.to_string().contains("parsing build recipe"));
    }

    #[test]
    fn test_load_recipe_oci_format() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("image.toml");
        fs::write(&path, "[image]\nformat = \"oci\"\n").unwrap();

        let recipe = load_recipe(&path).unwrap();
        assert_eq!(recipe.format, ImageFormat::Oci);
        assert_eq!(recipe.format.as_flag(), "oci");
    }

    #[test]
    fn test_validate_rejects_relative_dest() {
        let mut recipe = ImageRecipe::default();
        recipe.artifacts[0].dest = "simpleldap".to_string();
        let err = recipe.validate().unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn test_validate_rejects_relative_entrypoint() {
        let recipe = ImageRecipe {
            entrypoint: "simpleldap".to_string(),
            ..ImageRecipe::default()
        };
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_user_spec() {
        for bad in ["1000", "root:root", "1000:1000:1000", ""] {
            let recipe = ImageRecipe {
                user: bad.to_string(),
                ..ImageRecipe::default()
            };
            assert!(recipe.validate().is_err(), "accepted '{bad}'");
        }
    }

    #[test]
    fn test_validate_rejects_empty_artifacts() {
        let recipe = ImageRecipe {
            artifacts: Vec::new(),
            ..ImageRecipe::default()
        };
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn test_validate_caps_pull_retries() {
        let mut recipe = ImageRecipe::default();
        recipe.build.pull_retries = 100;
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn test_parse_user_spec() {
        assert_eq!(parse_user_spec("1000:1000").unwrap(), (1000, 1000));
        assert_eq!(parse_user_spec("0:0").unwrap(), (0, 0));
        assert!(parse_user_spec("1000").is_err());
        assert!(parse_user_spec("a:b").is_err());
    }

    #[test]
    fn test_to_toml_round_trips() {
        let temp = tempfile::TempDir::new().unwrap();
        let recipe = ImageRecipe::default();
        let rendered = recipe.to_toml().unwrap();

        let path = temp.path().join("image.toml");
        fs::write(&path, rendered).unwrap();
        let reloaded = load_recipe(&path).unwrap();
        assert_eq!(reloaded, recipe);
    }
}
