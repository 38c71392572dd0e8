//! Turn a provisioned image tree into the bootable medium.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use super::{ImageTree, ProvisionStrategy, KERNEL_ISO_PATH};

/// Copy `kernel` into the tree and build `iso` from it.
///
/// Refuses partial trees. Every packaging command is fail-fast.
pub fn package(
    tree: &ImageTree,
    strategy: &dyn ProvisionStrategy,
    kernel: &Path,
    iso: &Path,
) -> Result<()> {
    tree.verify(&strategy.required_files(tree))?;

    if !kernel.is_file() {
        bail!(
            "Kernel not found: {}\nBuild the kernel before packaging.",
            kernel.display()
        );
    }

    let dest = tree.in_iso(KERNEL_ISO_PATH);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::copy(kernel, &dest)
        .with_context(|| format!("Failed to copy {} -> {}", kernel.display(), dest.display()))?;

    if let Some(parent) = iso.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    println!("Packaging {}...", iso.display());
    for cmd in strategy.package_commands(tree, iso) {
        log::debug!("package: {}", cmd.display());
        cmd.run()?;
    }

    let size = fs::metadata(iso)
        .with_context(|| format!("Packaging finished but {} is missing", iso.display()))?
        .len();
    println!("[OK] {} ({:.1} MB)", iso.display(), size as f64 / 1_000_000.0);
    Ok(())
}
