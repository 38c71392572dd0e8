//! OVMF firmware check.
//!
//! Missing firmware is a warning: only `--efi` launches need it.

use std::path::Path;

use super::CheckResult;
use crate::config::OVMF_PATH_ENV;
use crate::launch::{OVMF_CODE, OVMF_VARS};

pub fn check_firmware(dir: &Path) -> Vec<CheckResult> {
    [OVMF_CODE, OVMF_VARS]
        .iter()
        .map(|file| {
            let path = dir.join(file);
            if path.is_file() {
                CheckResult::pass(file.to_string(), format!("Found at {}", path.display()))
            } else {
                CheckResult::warn(
                    file.to_string(),
                    format!("Not found at {} (needed for --efi)", path.display()),
                    format!("Install edk2-ovmf, or point --ovmf-path / {} at it", OVMF_PATH_ENV),
                )
            }
        })
        .collect()
}
