//! Offline builder for wear-levelled FAT flash images.
//!
//! The stack, bottom up: a host file emulating SPI flash ([`flash`]), the
//! wear-levelling layer ([`wl`]), a sector shim for the FAT library
//! ([`diskio`]), the mounted volume ([`volume`]) and the recursive host copy
//! ([`copy`]). [`builder`] ties them together.
pub mod builder;
pub mod copy;
pub mod diskio;
pub mod flash;
pub mod path;
pub mod volume;
pub mod wl;

pub use builder::{build, BuildError, BuildOptions, BuildReport};
