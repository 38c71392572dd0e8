//! QEMU launcher for the Crescent test image.
//!
//! [`QemuBuilder`] composes the emulator invocation as an argument vector:
//!
//! ```text
//! -cdrom <iso> -net none -debugcon stdio
//!     [-S -s]
//!     [-drive if=pflash,unit=0,... -drive if=pflash,unit=1,...]
//!     -m <memory> -smp cpus=<n>
//! ```
//!
//! [`run`] either provisions the image tree and stops (`--setup`), or checks
//! that the medium exists and launches the emulator, handing back its exit
//! code as the orchestrator's own.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fmt;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::{defaults, Project};
use crate::error::Error;
use crate::fetch::FailurePolicy;
use crate::image::{provision, ImageTree, ProvisionStrategy, SetupMode};
use crate::process::Cmd;

/// Exit status when the bootable medium is missing.
pub const EXIT_MISSING_MEDIUM: i32 = 2;

pub const OVMF_CODE: &str = "OVMF_CODE.fd";
pub const OVMF_VARS: &str = "OVMF_VARS.fd";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Firmware {
    /// QEMU's built-in SeaBIOS.
    #[default]
    Bios,
    /// OVMF from the configured firmware directory.
    Efi,
}

/// A QEMU memory size: digits with an optional `K`/`M`/`G`/`T` suffix.
///
/// Passed to QEMU exactly as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySize(String);

impl MemorySize {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MemorySize {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = match s.char_indices().last() {
            Some((i, c)) if matches!(c.to_ascii_uppercase(), 'K' | 'M' | 'G' | 'T') => &s[..i],
            _ => s,
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidMemorySize(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything that varies between launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub cpus: NonZeroU32,
    pub debug: bool,
    pub firmware: Firmware,
    /// Only consulted for [`Firmware::Efi`].
    pub firmware_dir: PathBuf,
    pub memory: MemorySize,
    pub iso: PathBuf,
}

impl LaunchOptions {
    /// Options for `iso` with the built-in defaults.
    pub fn new(iso: impl Into<PathBuf>) -> Self {
        Self {
            cpus: NonZeroU32::new(defaults::CPUS).unwrap_or(NonZeroU32::MIN),
            debug: false,
            firmware: Firmware::Bios,
            firmware_dir: defaults::FIRMWARE_DIR.into(),
            memory: MemorySize(defaults::MEMORY.to_string()),
            iso: iso.into(),
        }
    }

    /// Options taken from the project configuration.
    ///
    /// A `cpus` or `memory` given here wins, and the configured value it
    /// replaces is never validated.
    pub fn from_project(
        project: &Project,
        cpus: Option<NonZeroU32>,
        memory: Option<MemorySize>,
    ) -> Result<Self> {
        let launch = &project.config.launch;
        let cpus = match cpus {
            Some(cpus) => cpus,
            None => NonZeroU32::new(launch.cpus).context("launch.cpus must be at least 1")?,
        };
        let memory = match memory {
            Some(memory) => memory,
            None => launch
                .memory
                .parse()
                .context("Invalid launch.memory in configuration")?,
        };
        Ok(Self {
            cpus,
            debug: false,
            firmware: Firmware::Bios,
            firmware_dir: project.firmware_dir(),
            memory,
            iso: project.iso(),
        })
    }
}

/// Builder for the emulator command.
#[derive(Debug, Clone)]
pub struct QemuBuilder {
    qemu: String,
    options: LaunchOptions,
}

impl QemuBuilder {
    pub fn new(options: LaunchOptions) -> Self {
        Self {
            qemu: defaults::QEMU.to_string(),
            options,
        }
    }

    /// Use a different emulator binary.
    pub fn qemu(mut self, program: impl Into<String>) -> Self {
        self.qemu = program.into();
        self
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    pub fn args(&self) -> Vec<OsString> {
        let opts = &self.options;
        let mut args: Vec<OsString> = Vec::new();

        // Baseline: medium, no network, debug console on stdio
        args.push("-cdrom".into());
        args.push(opts.iso.clone().into_os_string());
        args.extend(["-net", "none", "-debugcon", "stdio"].map(OsString::from));

        // Halt at reset and open the gdbstub on tcp::1234
        if opts.debug {
            args.extend(["-S", "-s"].map(OsString::from));
        }

        if opts.firmware == Firmware::Efi {
            for (unit, file) in [(0, OVMF_CODE), (1, OVMF_VARS)] {
                args.push("-drive".into());
                args.push(pflash_drive(unit, &opts.firmware_dir.join(file)));
            }
        }

        args.push("-m".into());
        args.push(opts.memory.as_str().into());
        args.push("-smp".into());
        args.push(format!("cpus={}", opts.cpus).into());
        args
    }

    pub fn build(&self) -> Cmd {
        Cmd::new(&self.qemu)
            .args(self.args())
            .error_msg("Error when running qemu")
    }
}

fn pflash_drive(unit: u32, file: &Path) -> OsString {
    let mut spec = OsString::from(format!("if=pflash,unit={},file=", unit));
    spec.push(file.as_os_str());
    spec.push(",readonly=on");
    spec
}

/// Provisioning requested with `--setup`.
pub struct SetupPlan {
    pub tree: ImageTree,
    pub strategy: Box<dyn ProvisionStrategy>,
    pub mode: SetupMode,
    pub policy: FailurePolicy,
}

/// One invocation of the launcher.
pub struct Invocation {
    /// When present, provision and stop; the emulator is never started.
    pub setup: Option<SetupPlan>,
    pub qemu: QemuBuilder,
    /// Print the emulator command instead of running it.
    pub dry_run: bool,
}

/// Run an invocation and return the process exit code.
pub fn run(invocation: &Invocation) -> Result<i32> {
    if let Some(plan) = &invocation.setup {
        return run_setup(plan);
    }

    let iso = &invocation.qemu.options().iso;
    if !iso.exists() {
        return Err(Error::MissingMedium(iso.clone()).into());
    }

    let cmd = invocation.qemu.build();
    if invocation.dry_run {
        println!("{}", cmd.display());
        return Ok(0);
    }

    println!("Running {} in QEMU...", iso.display());
    log::debug!("qemu: {}", cmd.display());
    Ok(cmd.capture().exit_code)
}

fn run_setup(plan: &SetupPlan) -> Result<i32> {
    let report = provision(&plan.tree, plan.strategy.as_ref(), plan.mode, plan.policy)?;
    report.print_summary();

    if let Some(failed) = report.first_failure() {
        match plan.policy {
            FailurePolicy::Strict => return Err(Error::SetupFailed(failed.stage.clone()).into()),
            FailurePolicy::Permissive => eprintln!(
                "Warning: {} setup stage(s) failed; the image tree may be incomplete",
                report.failures().len()
            ),
        }
    }

    println!("Setup done");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::GrubMinimal;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn strings(builder: &QemuBuilder) -> Vec<String> {
        builder
            .args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn options() -> LaunchOptions {
        LaunchOptions::new("/p/TESTING/crescent.iso")
    }

    /// A stand-in emulator that records that it ran and exits with `code`.
    fn fake_qemu(dir: &Path, code: i32) -> (PathBuf, PathBuf) {
        let marker = dir.join("qemu-ran");
        let script = dir.join("fake-qemu");
        fs::write(
            &script,
            format!("#!/bin/sh\ntouch '{}'\nexit {}\n", marker.display(), code),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        (script, marker)
    }

    #[test]
    fn test_memory_size_grammar() {
        for ok in ["128M", "256m", "4G", "1024", "2t", "512K"] {
            assert_eq!(ok.parse::<MemorySize>().unwrap().as_str(), ok);
        }
        for bad in ["", "M", "12MB", "1.5G", "-1G", "G128", "12 M"] {
            assert!(bad.parse::<MemorySize>().is_err(), "{:?} accepted", bad);
        }
    }

    #[test]
    fn test_defaults_composition() {
        let args = strings(&QemuBuilder::new(options()));
        assert_eq!(
            args,
            [
                "-cdrom",
                "/p/TESTING/crescent.iso",
                "-net",
                "none",
                "-debugcon",
                "stdio",
                "-m",
                "128M",
                "-smp",
                "cpus=2",
            ]
        );
    }

    #[test]
    fn test_one_cpu_and_memory_token() {
        let mut opts = options();
        opts.cpus = NonZeroU32::new(8).unwrap();
        opts.memory = "1G".parse().unwrap();
        let args = strings(&QemuBuilder::new(opts));

        assert_eq!(args.iter().filter(|a| *a == "-smp").count(), 1);
        assert_eq!(args.iter().filter(|a| *a == "-m").count(), 1);
        assert!(args.contains(&"cpus=8".to_string()));
        assert!(args.contains(&"1G".to_string()));
    }

    #[test]
    fn test_debug_flags_come_together() {
        let plain = strings(&QemuBuilder::new(options()));
        assert!(!plain.contains(&"-S".to_string()));
        assert!(!plain.contains(&"-s".to_string()));

        let mut opts = options();
        opts.debug = true;
        let args = strings(&QemuBuilder::new(opts));
        let halt = args.iter().position(|a| a == "-S").unwrap();
        assert_eq!(args[halt + 1], "-s");
    }

    #[test]
    fn test_efi_adds_two_readonly_flash_drives() {
        let mut opts = options();
        opts.firmware = Firmware::Efi;
        opts.firmware_dir = PathBuf::from("/opt/ovmf");
        let args = strings(&QemuBuilder::new(opts));

        let drives: Vec<_> = args
            .windows(2)
            .filter(|w| w[0] == "-drive")
            .map(|w| w[1].clone())
            .collect();
        assert_eq!(
            drives,
            [
                "if=pflash,unit=0,file=/opt/ovmf/OVMF_CODE.fd,readonly=on",
                "if=pflash,unit=1,file=/opt/ovmf/OVMF_VARS.fd,readonly=on",
            ]
        );
    }

    #[test]
    fn test_bios_ignores_firmware_dir() {
        let mut opts = options();
        opts.firmware_dir = PathBuf::from("/opt/ovmf");
        let args = strings(&QemuBuilder::new(opts));
        assert!(!args.iter().any(|a| a == "-drive" || a.contains("pflash")));
    }

    #[test]
    fn test_debug_bios_example() {
        let mut opts = options();
        opts.cpus = NonZeroU32::new(4).unwrap();
        opts.memory = "256M".parse().unwrap();
        opts.debug = true;
        let args = strings(&QemuBuilder::new(opts)).join(" ");

        assert_eq!(
            args,
            "-cdrom /p/TESTING/crescent.iso -net none -debugcon stdio -S -s -m 256M -smp cpus=4"
        );
        assert!(!args.contains("pflash"));
    }

    #[test]
    fn test_from_project_rejects_bad_memory() {
        let mut config = crate::config::Config::default();
        config.launch.memory = "lots".to_string();
        let project = Project::new("/p", config);
        assert!(LaunchOptions::from_project(&project, None, None).is_err());
    }

    #[test]
    fn test_override_skips_bad_config_values() {
        let mut config = crate::config::Config::default();
        config.launch.memory = "lots".to_string();
        config.launch.cpus = 0;
        let project = Project::new("/p", config);

        let opts = LaunchOptions::from_project(
            &project,
            NonZeroU32::new(4),
            Some("512M".parse().unwrap()),
        )
        .unwrap();
        assert_eq!(opts.memory.to_string(), "512M");
        assert_eq!(opts.cpus.get(), 4);
    }

    #[test]
    fn test_from_project_rejects_zero_cpus() {
        let mut config = crate::config::Config::default();
        config.launch.cpus = 0;
        let project = Project::new("/p", config);
        assert!(LaunchOptions::from_project(&project, None, None).is_err());
    }

    #[test]
    fn test_missing_medium_never_launches() {
        let dir = tempdir().unwrap();
        let (qemu, marker) = fake_qemu(dir.path(), 0);
        let invocation = Invocation {
            setup: None,
            qemu: QemuBuilder::new(LaunchOptions::new(dir.path().join("crescent.iso")))
                .qemu(qemu.to_string_lossy()),
            dry_run: false,
        };

        let err = run(&invocation).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MissingMedium(_))
        ));
        assert!(!marker.exists());
    }

    #[test]
    fn test_setup_never_launches_and_exits_zero() {
        let dir = tempdir().unwrap();
        let (qemu, marker) = fake_qemu(dir.path(), 0);
        let invocation = Invocation {
            setup: Some(SetupPlan {
                tree: ImageTree::new(dir.path().join("TESTING")),
                strategy: Box::new(GrubMinimal::default()),
                mode: SetupMode::Idempotent,
                policy: FailurePolicy::Permissive,
            }),
            qemu: QemuBuilder::new(LaunchOptions::new(dir.path().join("crescent.iso")))
                .qemu(qemu.to_string_lossy()),
            dry_run: false,
        };

        assert_eq!(run(&invocation).unwrap(), 0);
        assert!(!marker.exists());
        assert!(dir.path().join("TESTING/iso_root/boot/grub/grub.cfg").exists());
    }

    #[test]
    fn test_strict_setup_failure_is_an_error() {
        let dir = tempdir().unwrap();
        let (qemu, marker) = fake_qemu(dir.path(), 0);
        let invocation = Invocation {
            setup: Some(SetupPlan {
                tree: ImageTree::new(dir.path().join("TESTING")),
                // No limine.conf template next to the tree.
                strategy: Box::new(crate::image::LimineRelease::new(
                    dir.path().join("limine.conf"),
                    crate::fetch::BootloaderSource::new("https://example.invalid/l.git", "b", 1),
                )),
                mode: SetupMode::Idempotent,
                policy: FailurePolicy::Strict,
            }),
            qemu: QemuBuilder::new(LaunchOptions::new(dir.path().join("crescent.iso")))
                .qemu(qemu.to_string_lossy()),
            dry_run: false,
        };

        let err = run(&invocation).unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::SetupFailed(stage)) => assert_eq!(stage, "copy limine.conf"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!marker.exists());
    }

    #[test]
    fn test_emulator_exit_code_propagates() {
        let dir = tempdir().unwrap();
        let (qemu, marker) = fake_qemu(dir.path(), 33);
        let iso = dir.path().join("crescent.iso");
        fs::write(&iso, "iso").unwrap();
        let invocation = Invocation {
            setup: None,
            qemu: QemuBuilder::new(LaunchOptions::new(&iso)).qemu(qemu.to_string_lossy()),
            dry_run: false,
        };

        assert_eq!(run(&invocation).unwrap(), 33);
        assert!(marker.exists());
    }

    #[test]
    fn test_dry_run_does_not_launch() {
        let dir = tempdir().unwrap();
        let (qemu, marker) = fake_qemu(dir.path(), 0);
        let iso = dir.path().join("crescent.iso");
        fs::write(&iso, "iso").unwrap();
        let invocation = Invocation {
            setup: None,
            qemu: QemuBuilder::new(LaunchOptions::new(&iso)).qemu(qemu.to_string_lossy()),
            dry_run: true,
        };

        assert_eq!(run(&invocation).unwrap(), 0);
        assert!(!marker.exists());
    }
}
