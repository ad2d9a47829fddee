//! The FAT volume as seen by the copy engine.
//!
//! Paths are `/` separated and relative to the volume root; `""` is the root
//! itself. Every library failure is wrapped together with the operation and
//! the path it was applied to.
use fatfs::{FatType, FileSystem, FormatVolumeOptions, FsOptions, ReadWriteSeek};
use log::debug;
use std::io::{self, Seek, SeekFrom, Write};
use thiserror::Error;

/// Upper bound on root directory entries reserved by `format`.
pub const MAX_ROOT_DIR_ENTRIES: u16 = 512;

const DIR_ENTRY_LEN: usize = 32;

/// Sectors ahead of the data area: boot sector, the single FAT and the
/// fixed root directory.
const METADATA_SECTORS: usize = 3;

/// Root entries that fill exactly one sector, capped at 512.
pub fn root_dir_entries(sector_size: usize) -> u16 {
    let per_sector = sector_size / DIR_ENTRY_LEN;
    u16::try_from(per_sector)
        .unwrap_or(MAX_ROOT_DIR_ENTRIES)
        .min(MAX_ROOT_DIR_ENTRIES)
}

#[derive(Debug, Error)]
#[error("{op} '{path}' failed: {source}")]
pub struct FatError {
    pub op: &'static str,
    pub path: String,
    #[source]
    pub source: io::Error,
}

impl FatError {
    pub(crate) fn new(op: &'static str, path: &str, source: io::Error) -> Self {
        FatError {
            op,
            path: path.to_string(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    pub cluster_size: u32,
    pub total_clusters: u32,
    pub free_clusters: u32,
    pub fat_type: FatType,
}

/// Lay down an empty FAT filesystem covering the whole disk, without a
/// partition table, using one FAT.
pub fn format<IO: ReadWriteSeek>(
    mut disk: IO,
    sector_size: usize,
    sector_count: usize,
) -> Result<(), FatError> {
    let bytes_per_sector = u16::try_from(sector_size).map_err(|_| {
        FatError::new("format", "", invalid_input("sector size does not fit in 16 bits"))
    })?;
    let total_sectors = u32::try_from(sector_count).map_err(|_| {
        FatError::new("format", "", invalid_input("sector count does not fit in 32 bits"))
    })?;

    if sector_count <= METADATA_SECTORS {
        return Err(FatError::new(
            "format",
            "",
            invalid_input("volume has no room for a data area"),
        ));
    }

    let root_entries = root_dir_entries(sector_size);
    debug!("Formatting {sector_count} sectors of {sector_size} bytes, {root_entries} root entries");
    rewind(&mut disk).map_err(|source| FatError::new("format", "", source))?;
    let options = FormatVolumeOptions::new()
        .bytes_per_sector(bytes_per_sector)
        .total_sectors(total_sectors)
        .fats(1)
        .max_root_dir_entries(root_entries);
    fatfs::format_volume(disk, options).map_err(|source| FatError::new("format", "", source))
}

fn rewind<IO: Seek>(disk: &mut IO) -> io::Result<()> {
    disk.seek(SeekFrom::Start(0)).map(|_| ())
}

fn invalid_input(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn relative(path: &str) -> &str {
    path.trim_matches('/')
}

fn same_name(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_uppercase)
        .eq(b.chars().flat_map(char::to_uppercase))
}

pub struct Volume<IO: ReadWriteSeek> {
    fs: FileSystem<IO>,
}

impl<IO: ReadWriteSeek> Volume<IO> {
    /// The library expects the disk positioned at its first byte.
    pub fn mount(mut disk: IO) -> Result<Self, FatError> {
        rewind(&mut disk).map_err(|source| FatError::new("mount", "", source))?;
        let fs = FileSystem::new(disk, FsOptions::new())
            .map_err(|source| FatError::new("mount", "", source))?;
        debug!("Mounted {:?} volume", fs.fat_type());
        Ok(Volume { fs })
    }

    /// Flush all metadata and release the disk.
    pub fn unmount(self) -> Result<(), FatError> {
        self.fs
            .unmount()
            .map_err(|source| FatError::new("unmount", "", source))
    }

    /// Kind of the entry at `path`, or `None` if there is nothing there.
    /// Names compare case-insensitively, as FAT does.
    pub fn stat(&self, path: &str) -> Result<Option<EntryKind>, FatError> {
        let rel = relative(path);
        if rel.is_empty() {
            return Ok(Some(EntryKind::Directory));
        }
        let (parent, name) = rel.rsplit_once('/').unwrap_or(("", rel));

        let root = self.fs.root_dir();
        let dir = if parent.is_empty() {
            root
        } else {
            match root.open_dir(parent) {
                Ok(dir) => dir,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(source) => return Err(FatError::new("stat", path, source)),
            }
        };

        for entry in dir.iter() {
            let entry = entry.map_err(|source| FatError::new("stat", path, source))?;
            if same_name(&entry.file_name(), name) {
                let kind = if entry.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                return Ok(Some(kind));
            }
        }
        Ok(None)
    }

    pub fn mkdir(&self, path: &str) -> Result<(), FatError> {
        self.fs
            .root_dir()
            .create_dir(relative(path))
            .map(|_| ())
            .map_err(|source| FatError::new("mkdir", path, source))
    }

    /// Open `path` for writing, creating it or truncating an existing file.
    pub fn create(&self, path: &str) -> Result<impl Write + '_, FatError> {
        let mut file = self
            .fs
            .root_dir()
            .create_file(relative(path))
            .map_err(|source| FatError::new("create", path, source))?;
        file.truncate()
            .map_err(|source| FatError::new("truncate", path, source))?;
        Ok(file)
    }

    pub fn unlink(&self, path: &str) -> Result<(), FatError> {
        self.fs
            .root_dir()
            .remove(relative(path))
            .map_err(|source| FatError::new("unlink", path, source))
    }

    pub fn stats(&self) -> Result<VolumeStats, FatError> {
        let stats = self
            .fs
            .stats()
            .map_err(|source| FatError::new("getfree", "", source))?;
        Ok(VolumeStats {
            cluster_size: stats.cluster_size(),
            total_clusters: stats.total_clusters(),
            free_clusters: stats.free_clusters(),
            fat_type: self.fs.fat_type(),
        })
    }
}
