//! Crescent kernel test environment.
//!
//! Provisions a bootable image tree, launches it in QEMU with the requested
//! firmware and resources, and feeds kernel section relocations into GDB.

pub mod config;
pub mod error;
pub mod fetch;
pub mod image;
pub mod launch;
pub mod preflight;
pub mod process;
pub mod symbols;

pub use error::Error;
