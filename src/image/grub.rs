//! Generated minimal GRUB configuration.
//!
//! No network fetch: the bootloader itself comes from the host's
//! `grub-mkrescue` when the tree is packaged.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::{ImageTree, ProvisionStrategy, StrategyKind, KERNEL_ISO_PATH};
use crate::fetch::Pipeline;
use crate::process::Cmd;

const GRUB_DIR: &str = "boot/grub";
const CONFIG_NAME: &str = "grub.cfg";

/// A single boot menu entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrubEntry {
    pub title: String,
    /// Kernel path inside the medium, absolute from its root.
    pub kernel_path: String,
    /// Load all video drivers so the kernel gets a framebuffer.
    pub video: bool,
}

impl Default for GrubEntry {
    fn default() -> Self {
        Self {
            title: "crescent".to_string(),
            kernel_path: format!("/{}", KERNEL_ISO_PATH),
            video: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GrubMinimal {
    pub entry: GrubEntry,
}

impl GrubMinimal {
    /// Single default entry, no timeout.
    pub fn render_config(&self) -> String {
        let entry = &self.entry;
        let mut cfg = String::new();
        cfg.push_str("set timeout=0\n");
        cfg.push_str("set default=0\n\n");
        cfg.push_str(&format!("menuentry \"{}\" {{\n", entry.title));
        if entry.video {
            cfg.push_str("    insmod all_video\n");
        }
        cfg.push_str(&format!("    multiboot2 {}\n", entry.kernel_path));
        cfg.push_str("    boot\n");
        cfg.push_str("}\n");
        cfg
    }

    fn config_path(tree: &ImageTree) -> PathBuf {
        tree.in_iso(GRUB_DIR).join(CONFIG_NAME)
    }

    fn write_config(&self, tree: &ImageTree) -> Result<()> {
        let path = Self::config_path(tree);
        fs::write(&path, self.render_config())
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

impl ProvisionStrategy for GrubMinimal {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Grub
    }

    fn directories(&self) -> &'static [&'static str] {
        &[GRUB_DIR]
    }

    fn required_files(&self, tree: &ImageTree) -> Vec<PathBuf> {
        vec![Self::config_path(tree)]
    }

    fn populate(&self, tree: &ImageTree, pipeline: &mut Pipeline) {
        pipeline.stage(format!("generate {}", CONFIG_NAME), || self.write_config(tree));
    }

    fn package_commands(&self, tree: &ImageTree, iso: &Path) -> Vec<Cmd> {
        vec![Cmd::new("grub-mkrescue")
            .arg("-o")
            .arg_path(iso)
            .arg_path(tree.iso_root())
            .error_msg("Failed to build ISO with grub-mkrescue")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::fetch::FailurePolicy;
    use crate::image::{provision, SetupMode};
    use tempfile::tempdir;

    #[test]
    fn test_render_default_config() {
        let cfg = GrubMinimal::default().render_config();
        assert_eq!(
            cfg,
            "set timeout=0\n\
             set default=0\n\
             \n\
             menuentry \"crescent\" {\n    \
             insmod all_video\n    \
             multiboot2 /boot/crescent-kernel\n    \
             boot\n\
             }\n"
        );
    }

    #[test]
    fn test_render_without_video() {
        let grub = GrubMinimal {
            entry: GrubEntry {
                video: false,
                ..GrubEntry::default()
            },
        };
        let cfg = grub.render_config();
        assert!(!cfg.contains("insmod"));
        assert!(cfg.contains("multiboot2 /boot/crescent-kernel"));
    }

    #[test]
    fn test_provision_writes_config_without_network() {
        let dir = tempdir().unwrap();
        let tree = ImageTree::new(dir.path().join("TESTING"));
        let grub = GrubMinimal::default();

        let report =
            provision(&tree, &grub, SetupMode::Fresh, FailurePolicy::Strict).unwrap();
        assert!(report.is_ok());
        assert_eq!(report.stages.len(), 1);

        let written = fs::read_to_string(tree.in_iso("boot/grub/grub.cfg")).unwrap();
        assert_eq!(written, grub.render_config());
        assert!(tree.verify(&grub.required_files(&tree)).is_ok());
    }

    #[test]
    fn test_fresh_provision_twice_fails() {
        let dir = tempdir().unwrap();
        let tree = ImageTree::new(dir.path().join("TESTING"));
        let grub = GrubMinimal::default();

        provision(&tree, &grub, SetupMode::Fresh, FailurePolicy::Permissive).unwrap();
        let err = provision(&tree, &grub, SetupMode::Fresh, FailurePolicy::Permissive)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::TreeExists(_))
        ));

        // Idempotent reruns are fine.
        provision(&tree, &grub, SetupMode::Idempotent, FailurePolicy::Permissive).unwrap();
    }

    #[test]
    fn test_package_command() {
        let tree = ImageTree::new("/p/TESTING");
        let cmds = GrubMinimal::default().package_commands(&tree, Path::new("/p/out.iso"));
        assert_eq!(cmds.len(), 1);
        assert_eq!(
            cmds[0].display(),
            "grub-mkrescue -o /p/out.iso /p/TESTING/iso_root"
        );
    }
}
