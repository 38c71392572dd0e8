//! Pinned Limine binary release.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::{ImageTree, ProvisionStrategy, StrategyKind};
use crate::fetch::{ArtifactFetcher, BootloaderSource, CopyStep, Pipeline};
use crate::process::Cmd;

const LIMINE_DIR: &str = "boot/limine";
const EFI_BOOT_DIR: &str = "EFI/BOOT";
const CONFIG_NAME: &str = "limine.conf";
const BIOS_CD: &str = "boot/limine/limine-bios-cd.bin";
const UEFI_CD: &str = "boot/limine/limine-uefi-cd.bin";

/// Files harvested from the release: (checkout path, destination relative to iso_root).
const ISO_FILES: &[(&str, &str)] = &[
    ("BOOTX64.EFI", "EFI/BOOT/BOOTX64.EFI"),
    ("BOOTIA32.EFI", "EFI/BOOT/BOOTIA32.EFI"),
    ("limine-bios.sys", "boot/limine/limine-bios.sys"),
    ("limine-bios-cd.bin", "boot/limine/limine-bios-cd.bin"),
    ("limine-uefi-cd.bin", "boot/limine/limine-uefi-cd.bin"),
];

/// Files harvested into the tree's top level, outside the medium.
const TOP_FILES: &[&str] = &["limine", "LICENSE"];

pub struct LimineRelease {
    template: PathBuf,
    fetcher: ArtifactFetcher,
}

impl LimineRelease {
    pub fn new(template: impl Into<PathBuf>, source: BootloaderSource) -> Self {
        Self {
            template: template.into(),
            fetcher: ArtifactFetcher::new(source),
        }
    }

    pub fn with_fetcher(mut self, fetcher: ArtifactFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn copy_plan(&self, tree: &ImageTree) -> Vec<CopyStep> {
        let iso = ISO_FILES.iter().map(|&(src, dest)| CopyStep {
            src,
            dest: tree.in_iso(dest),
        });
        let top = TOP_FILES.iter().map(|&src| CopyStep {
            src,
            dest: tree.top(src),
        });
        iso.chain(top).collect()
    }

    /// The installer binary harvested from the release.
    pub fn installer(tree: &ImageTree) -> PathBuf {
        tree.top("limine")
    }

    fn config_path(tree: &ImageTree) -> PathBuf {
        tree.in_iso(LIMINE_DIR).join(CONFIG_NAME)
    }

    fn install_config(&self, tree: &ImageTree) -> Result<()> {
        let dest = Self::config_path(tree);
        fs::copy(&self.template, &dest).with_context(|| {
            format!(
                "Failed to copy {} -> {}",
                self.template.display(),
                dest.display()
            )
        })?;
        Ok(())
    }
}

impl ProvisionStrategy for LimineRelease {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Limine
    }

    fn directories(&self) -> &'static [&'static str] {
        &[LIMINE_DIR, EFI_BOOT_DIR]
    }

    fn required_files(&self, tree: &ImageTree) -> Vec<PathBuf> {
        let mut files = vec![Self::config_path(tree)];
        files.extend(self.copy_plan(tree).into_iter().map(|step| step.dest));
        files
    }

    fn populate(&self, tree: &ImageTree, pipeline: &mut Pipeline) {
        pipeline.stage(format!("copy {}", CONFIG_NAME), || self.install_config(tree));
        self.fetcher
            .fetch_into(tree.root(), &self.copy_plan(tree), pipeline);
    }

    fn package_commands(&self, tree: &ImageTree, iso: &Path) -> Vec<Cmd> {
        let xorriso = Cmd::new("xorriso")
            .args(["-as", "mkisofs", "-R", "-r", "-J"])
            .args(["-b", BIOS_CD])
            .args(["-no-emul-boot", "-boot-load-size", "4", "-boot-info-table"])
            .args(["-hfsplus", "-apm-block-size", "2048"])
            .args(["--efi-boot", UEFI_CD])
            .args(["-efi-boot-part", "--efi-boot-image", "--protective-msdos-label"])
            .arg_path(tree.iso_root())
            .arg("-o")
            .arg_path(iso)
            .error_msg("Failed to build ISO with xorriso");

        let bios_install = Cmd::new(Self::installer(tree))
            .arg("bios-install")
            .arg_path(iso)
            .error_msg("Failed to install Limine BIOS stages");

        vec![xorriso, bios_install]
    }
}
