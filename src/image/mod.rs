//! Image tree: the staged directory that becomes the bootable medium.
//!
//! The tree has a top level (`TESTING/` by default) holding tools and license
//! files, and an `iso_root/` below it that is packaged as the ISO. What goes
//! inside `iso_root/` depends on the [`ProvisionStrategy`]:
//!
//! - [`limine::LimineRelease`] - pinned binary release of Limine, static
//!   `limine.conf` template
//! - [`grub::GrubMinimal`] - generated minimal `grub.cfg`, bootloader supplied
//!   by the host's `grub-mkrescue` at packaging time
//!
//! The tree is not torn down automatically; later plain launches reuse it.

pub mod grub;
pub mod limine;
pub mod package;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Project;
use crate::error::Error;
use crate::fetch::{FailurePolicy, Pipeline, SetupReport};
use crate::process::Cmd;

pub use grub::GrubMinimal;
pub use limine::LimineRelease;
pub use package::package;

/// Directory under the tree root that is packaged as the ISO.
pub const ISO_ROOT_DIR: &str = "iso_root";

/// Where the kernel binary lives inside the medium.
pub const KERNEL_ISO_PATH: &str = "boot/crescent-kernel";

/// Which provisioning strategy to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Pinned Limine binary release with a static config template.
    #[default]
    Limine,
    /// Generated minimal GRUB config.
    Grub,
}

/// How the tree's directories are created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupMode {
    /// Re-runnable: existing directories are fine.
    #[default]
    Idempotent,
    /// Guarded first run: fails if the tree root already exists.
    Fresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTree {
    root: PathBuf,
    iso_root: PathBuf,
}

impl ImageTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let iso_root = root.join(ISO_ROOT_DIR);
        Self { root, iso_root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn iso_root(&self) -> &Path {
        &self.iso_root
    }

    /// Path of `rel` inside the medium.
    pub fn in_iso(&self, rel: &str) -> PathBuf {
        self.iso_root.join(rel)
    }

    /// Path of `rel` at the tree's top level (outside the medium).
    pub fn top(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Create the tree root and `dirs` (relative to `iso_root`).
    pub fn create(&self, dirs: &[&str], mode: SetupMode) -> Result<()> {
        match mode {
            SetupMode::Fresh => {
                if self.root.exists() {
                    return Err(Error::TreeExists(self.root.clone()).into());
                }
                fs::create_dir_all(&self.root)
                    .with_context(|| format!("Failed to create {}", self.root.display()))?;
            }
            SetupMode::Idempotent => {
                fs::create_dir_all(&self.root)
                    .with_context(|| format!("Failed to create {}", self.root.display()))?;
            }
        }

        for dir in dirs {
            let path = self.in_iso(dir);
            fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
        }
        Ok(())
    }

    /// Entries of `required` that do not exist.
    pub fn missing(&self, required: &[PathBuf]) -> Vec<PathBuf> {
        required.iter().filter(|p| !p.exists()).cloned().collect()
    }

    /// Fail unless every file in `required` exists.
    pub fn verify(&self, required: &[PathBuf]) -> Result<()> {
        let missing = self.missing(required);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::IncompleteTree(missing).into())
        }
    }
}

/// A way of turning an empty directory into a bootable image tree.
pub trait ProvisionStrategy {
    fn kind(&self) -> StrategyKind;

    /// Directories the layout needs, relative to `iso_root`.
    fn directories(&self) -> &'static [&'static str];

    /// Bootloader and config files that must exist before packaging.
    fn required_files(&self, tree: &ImageTree) -> Vec<PathBuf>;

    /// Write configuration and bootloader files. Directories already exist.
    fn populate(&self, tree: &ImageTree, pipeline: &mut Pipeline);

    /// Commands that turn `iso_root` into the medium at `iso`, run in order.
    fn package_commands(&self, tree: &ImageTree, iso: &Path) -> Vec<Cmd>;
}

/// Build the strategy selected by `kind` from the project configuration.
pub fn strategy_for(kind: StrategyKind, project: &Project) -> Box<dyn ProvisionStrategy> {
    match kind {
        StrategyKind::Limine => Box::new(LimineRelease::new(
            project.limine_template(),
            project.bootloader_source(),
        )),
        StrategyKind::Grub => Box::new(GrubMinimal::default()),
    }
}

/// Set up the image tree: directories first, then the strategy's stages.
///
/// Directory creation is not a pipeline stage: if it fails (including a fresh
/// setup finding an existing tree) nothing else is attempted.
pub fn provision(
    tree: &ImageTree,
    strategy: &dyn ProvisionStrategy,
    mode: SetupMode,
    policy: FailurePolicy,
) -> Result<SetupReport> {
    println!("Setting up image tree at {}...", tree.root().display());
    log::info!("provisioning strategy: {:?}, mode: {:?}", strategy.kind(), mode);
    tree.create(strategy.directories(), mode)?;

    let mut pipeline = Pipeline::new(policy);
    strategy.populate(tree, &mut pipeline);
    Ok(pipeline.finish())
}
