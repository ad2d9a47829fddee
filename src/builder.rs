//! End-to-end image construction.
//!
//! The build walks a fixed sequence of stages and stops at the first one
//! that fails. Whatever was already written to the image file stays there;
//! the mounted volume and the file are released by ownership on the way out.
use crate::copy::{CopyError, CopyFailure, TreeCopier};
use crate::diskio::DiskIo;
use crate::flash::{FileFlash, FlashError, FLASH_SECTOR_SIZE};
use crate::volume::{self, FatError, Volume, VolumeStats};
use crate::wl::{WearLeveling, WlConfig, WlError};
use log::{debug, error, info, warn};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Longest host or image path accepted, terminator included.
pub const MAX_PATH_LEN: usize = 4096;

/// Most source paths accepted on one command line.
pub const MAX_SOURCE_PATHS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Unparsed,
    ImageAllocated,
    FlashConfigured,
    FilesystemFormatted,
    FilesystemMounted,
    FilesPopulated,
    Reported,
    Closed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Unparsed => "unparsed",
            Stage::ImageAllocated => "image allocated",
            Stage::FlashConfigured => "flash configured",
            Stage::FilesystemFormatted => "filesystem formatted",
            Stage::FilesystemMounted => "filesystem mounted",
            Stage::FilesPopulated => "files populated",
            Stage::Reported => "reported",
            Stage::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid image size of {kb} KB: {reason}")]
    InvalidSize { kb: usize, reason: &'static str },

    #[error("no source paths given")]
    NoSources,

    #[error("{count} source paths given, at most {max} are accepted")]
    TooManySources { count: usize, max: usize },

    #[error("unable to create image file '{}': {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: FlashError,
    },

    #[error("wear levelling initialization failed: {0}")]
    WearLeveling(#[source] WlError),

    #[error("filesystem creation failed: {0}")]
    Format(#[source] FatError),

    #[error("mounting filesystem failed: {0}")]
    Mount(#[source] FatError),

    #[error("reading free space failed: {0}")]
    Stats(#[source] FatError),

    #[error("unmounting filesystem failed: {0}")]
    Unmount(#[source] FatError),

    #[error("unable to sync image file '{}': {source}", path.display())]
    Sync {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BuildError {
    /// The stage the build was trying to reach when it failed.
    pub fn stage(&self) -> Stage {
        match self {
            BuildError::InvalidSize { .. }
            | BuildError::NoSources
            | BuildError::TooManySources { .. } => Stage::Unparsed,
            BuildError::Image { .. } => Stage::ImageAllocated,
            BuildError::WearLeveling(_) => Stage::FlashConfigured,
            BuildError::Format(_) => Stage::FilesystemFormatted,
            BuildError::Mount(_) => Stage::FilesystemMounted,
            BuildError::Stats(_) => Stage::Reported,
            BuildError::Unmount(_) | BuildError::Sync { .. } => Stage::Closed,
        }
    }
}

/// Size of the image and how it divides into flash sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    pub image_bytes: usize,
    pub sector_size: usize,
    pub sector_count: usize,
}

impl FlashGeometry {
    /// Any remainder below one sector is left unused at the end of the image.
    pub fn from_kb(kb: usize) -> Result<Self, BuildError> {
        let image_bytes = kb.checked_mul(1024).ok_or(BuildError::InvalidSize {
            kb,
            reason: "size overflows",
        })?;
        let sector_count = image_bytes / FLASH_SECTOR_SIZE;
        if sector_count == 0 {
            return Err(BuildError::InvalidSize {
                kb,
                reason: "smaller than one flash sector",
            });
        }
        Ok(FlashGeometry {
            image_bytes,
            sector_size: FLASH_SECTOR_SIZE,
            sector_count,
        })
    }

    /// Bytes handed to the wear-leveling layer.
    pub fn region_bytes(&self) -> usize {
        self.sector_count * self.sector_size
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub image: PathBuf,
    pub size_kb: usize,
    pub sources: Vec<PathBuf>,
    pub max_path_len: usize,
}

impl BuildOptions {
    pub fn new(image: PathBuf, size_kb: usize, sources: Vec<PathBuf>) -> Self {
        BuildOptions {
            image,
            size_kb,
            sources,
            max_path_len: MAX_PATH_LEN,
        }
    }
}

#[derive(Debug)]
pub struct BuildReport {
    pub directories_created: usize,
    pub files_copied: usize,
    pub failures: Vec<CopyFailure>,
    pub flash: FlashGeometry,
    pub fs_sector_size: usize,
    pub fs_sector_count: usize,
    pub volume: VolumeStats,
}

impl fmt::Display for BuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Filesystem created")?;
        writeln!(f)?;
        writeln!(f, "  directories created: {}", self.directories_created)?;
        writeln!(f, "  files copied: {}", self.files_copied)?;
        if !self.failures.is_empty() {
            writeln!(f, "  entries failed: {}", self.failures.len())?;
        }
        writeln!(f)?;
        writeln!(f, "  flash sector size: {}", self.flash.sector_size)?;
        writeln!(f, "  flash sectors: {}", self.flash.sector_count)?;
        writeln!(f)?;
        writeln!(f, "  filesystem type: {:?}", self.volume.fat_type)?;
        writeln!(f, "  filesystem sector size: {}", self.fs_sector_size)?;
        writeln!(f, "  filesystem sectors: {}", self.fs_sector_count)?;
        writeln!(f, "  filesystem cluster size: {}", self.volume.cluster_size)?;
        writeln!(f, "  filesystem total clusters: {}", self.volume.total_clusters)?;
        write!(f, "  filesystem free clusters: {}", self.volume.free_clusters)
    }
}

fn enter(stage: Stage) {
    debug!("Stage: {stage}");
}

/// Create the image file and populate it from `options.sources`.
///
/// A source that cannot be copied does not stop the others. Its failure is
/// logged and kept in [`BuildReport::failures`].
pub fn build(options: &BuildOptions) -> Result<BuildReport, BuildError> {
    enter(Stage::Unparsed);
    if options.sources.is_empty() {
        return Err(BuildError::NoSources);
    }
    if options.sources.len() > MAX_SOURCE_PATHS {
        return Err(BuildError::TooManySources {
            count: options.sources.len(),
            max: MAX_SOURCE_PATHS,
        });
    }
    let geometry = FlashGeometry::from_kb(options.size_kb)?;

    info!(
        "Creating {} byte image '{}'",
        geometry.image_bytes,
        options.image.display()
    );
    let flash = FileFlash::create(&options.image, geometry.image_bytes, geometry.sector_size)
        .map_err(|source| BuildError::Image {
            path: options.image.clone(),
            source,
        })?;
    enter(Stage::ImageAllocated);

    let cfg = WlConfig::new(geometry.region_bytes(), geometry.sector_size);
    let mut wl = WearLeveling::configure(cfg, flash).map_err(BuildError::WearLeveling)?;
    wl.init().map_err(BuildError::WearLeveling)?;
    enter(Stage::FlashConfigured);

    let mut disk = DiskIo::new(wl);
    disk.initialize();
    let fs_sector_size = disk.sector_size();
    let fs_sector_count = disk.sector_count();
    volume::format(&mut disk, fs_sector_size, fs_sector_count).map_err(BuildError::Format)?;
    enter(Stage::FilesystemFormatted);

    let volume = Volume::mount(&mut disk).map_err(BuildError::Mount)?;
    enter(Stage::FilesystemMounted);

    let mut copier = TreeCopier::new(&volume, options.max_path_len);
    let mut rejected = Vec::new();
    for source in &options.sources {
        match copier.copy(source, "") {
            Ok(()) => {}
            Err(CopyError::Incomplete { path, failed }) => {
                warn!("'{}' was copied with {failed} failed entries", path.display());
            }
            Err(err) => {
                error!("Unable to copy '{}': {err}", source.display());
                rejected.push(CopyFailure {
                    path: source.clone(),
                    error: err,
                });
            }
        }
    }
    let directories_created = copier.directories_created();
    let files_copied = copier.files_copied();
    let mut failures = copier.into_failures();
    failures.append(&mut rejected);
    enter(Stage::FilesPopulated);

    let stats = volume.stats().map_err(BuildError::Stats)?;
    volume.unmount().map_err(BuildError::Unmount)?;

    let report = BuildReport {
        directories_created,
        files_copied,
        failures,
        flash: geometry,
        fs_sector_size,
        fs_sector_count,
        volume: stats,
    };
    enter(Stage::Reported);

    let mut file = disk.into_inner().into_inner();
    file.sync().map_err(|source| BuildError::Sync {
        path: options.image.clone(),
        source,
    })?;
    enter(Stage::Closed);

    Ok(report)
}
