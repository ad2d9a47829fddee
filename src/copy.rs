//! Recursive copy of host files and directories into a mounted volume.
//!
//! A failing child never stops its siblings: the failure is logged, recorded
//! and the walk continues. [`TreeCopier::copy`] reports the top-level entry's
//! own error directly, or [`CopyError::Incomplete`] when only descendants
//! failed.
use crate::flash::FLASH_SECTOR_SIZE;
use crate::path::{HostPath, ImagePath, PathTooLong};
use crate::volume::{EntryKind, FatError, Volume};
use fatfs::ReadWriteSeek;
use log::{debug, error};
use std::ffi::OsStr;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSide {
    Source,
    Destination,
}

impl fmt::Display for PathSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSide::Source => f.write_str("source"),
            PathSide::Destination => f.write_str("destination"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("'{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{side} name is too long: {source}")]
    PathTooLong {
        side: PathSide,
        #[source]
        source: PathTooLong,
    },

    #[error("'{path}' already exists in the image as a different type")]
    TypeCollision { path: String },

    #[error("'{}' is not supported: {reason}", path.display())]
    Unsupported { path: PathBuf, reason: &'static str },

    #[error(transparent)]
    Library(#[from] FatError),

    #[error("'{}' copied with {failed} failed entries", path.display())]
    Incomplete { path: PathBuf, failed: usize },
}

/// A descendant that could not be copied.
#[derive(Debug)]
pub struct CopyFailure {
    pub path: PathBuf,
    pub error: CopyError,
}

struct CopyState {
    src: HostPath,
    dst: ImagePath,
    buf: Vec<u8>,
}

pub struct TreeCopier<'v, IO: ReadWriteSeek> {
    volume: &'v Volume<IO>,
    max_path_len: usize,
    directories_created: usize,
    files_copied: usize,
    failures: Vec<CopyFailure>,
}

impl<'v, IO: ReadWriteSeek> TreeCopier<'v, IO> {
    pub fn new(volume: &'v Volume<IO>, max_path_len: usize) -> Self {
        TreeCopier {
            volume,
            max_path_len,
            directories_created: 0,
            files_copied: 0,
            failures: Vec::new(),
        }
    }

    pub fn directories_created(&self) -> usize {
        self.directories_created
    }

    pub fn files_copied(&self) -> usize {
        self.files_copied
    }

    pub fn failures(&self) -> &[CopyFailure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<CopyFailure> {
        self.failures
    }

    /// Copy `source` (file or directory) to `destination` in the volume.
    ///
    /// A directory's contents are merged into `destination`. A file copied
    /// onto an existing directory lands inside it under its own name.
    pub fn copy(&mut self, source: &Path, destination: &str) -> Result<(), CopyError> {
        debug!("Processing '{}'", source.display());

        let src = HostPath::new(source, self.max_path_len).map_err(|source| {
            CopyError::PathTooLong {
                side: PathSide::Source,
                source,
            }
        })?;
        let dst = ImagePath::new(destination, self.max_path_len).map_err(|source| {
            CopyError::PathTooLong {
                side: PathSide::Destination,
                source,
            }
        })?;
        let mut state = CopyState {
            src,
            dst,
            buf: vec![0u8; FLASH_SECTOR_SIZE],
        };

        let before = self.failures.len();
        self.walk(&mut state, true)?;

        let failed = self.failures.len() - before;
        if failed > 0 {
            return Err(CopyError::Incomplete {
                path: source.to_path_buf(),
                failed,
            });
        }
        Ok(())
    }

    fn record(&mut self, path: PathBuf, error: CopyError) {
        error!("Unable to copy '{}': {error}", path.display());
        self.failures.push(CopyFailure { path, error });
    }

    fn walk(&mut self, state: &mut CopyState, follow_links: bool) -> Result<(), CopyError> {
        let src = state.src.as_path();
        let meta = if follow_links {
            fs::metadata(src)
        } else {
            fs::symlink_metadata(src)
        }
        .map_err(|source| CopyError::Io {
            path: src.to_path_buf(),
            source,
        })?;

        let file_type = meta.file_type();
        if file_type.is_dir() {
            self.copy_dir(state)
        } else if file_type.is_file() {
            self.copy_file(state)
        } else {
            let reason = if file_type.is_symlink() {
                "symbolic link"
            } else {
                "not a regular file or directory"
            };
            Err(CopyError::Unsupported {
                path: src.to_path_buf(),
                reason,
            })
        }
    }

    fn copy_dir(&mut self, state: &mut CopyState) -> Result<(), CopyError> {
        let dst = state.dst.as_str();
        match self.volume.stat(dst)? {
            Some(EntryKind::Directory) => {}
            Some(EntryKind::File) => {
                return Err(CopyError::TypeCollision {
                    path: dst.to_string(),
                })
            }
            None => {
                debug!("Creating directory '{dst}'");
                self.volume.mkdir(dst)?;
                self.directories_created += 1;
            }
        }

        let entries = fs::read_dir(state.src.as_path()).map_err(|source| CopyError::Io {
            path: state.src.as_path().to_path_buf(),
            source,
        })?;

        for entry in entries {
            let name = match entry {
                Ok(entry) => entry.file_name(),
                Err(source) => {
                    let path = state.src.as_path().to_path_buf();
                    self.record(path.clone(), CopyError::Io { path, source });
                    continue;
                }
            };
            if let Err(err) = self.descend(state, &name) {
                let path = state.src.as_path().join(&name);
                self.record(path, err);
            }
        }
        Ok(())
    }

    fn descend(&mut self, state: &mut CopyState, name: &OsStr) -> Result<(), CopyError> {
        let image_name = name.to_str().ok_or_else(|| CopyError::Unsupported {
            path: state.src.as_path().join(name),
            reason: "name is not valid UTF-8",
        })?;

        let src_mark = state
            .src
            .push_segment(name)
            .map_err(|source| CopyError::PathTooLong {
                side: PathSide::Source,
                source,
            })?;
        let dst_mark = match state.dst.push_segment(image_name) {
            Ok(mark) => mark,
            Err(source) => {
                state.src.pop_to(src_mark);
                return Err(CopyError::PathTooLong {
                    side: PathSide::Destination,
                    source,
                });
            }
        };

        let result = self.walk(state, false);

        state.dst.pop_to(dst_mark);
        state.src.pop_to(src_mark);
        result
    }

    fn copy_file(&mut self, state: &mut CopyState) -> Result<(), CopyError> {
        let mut retarget = None;
        if self.volume.stat(state.dst.as_str())? == Some(EntryKind::Directory) {
            let base = state
                .src
                .as_path()
                .file_name()
                .and_then(OsStr::to_str)
                .ok_or_else(|| CopyError::Unsupported {
                    path: state.src.as_path().to_path_buf(),
                    reason: "no usable base name",
                })?;
            let mark = state
                .dst
                .push_segment(base)
                .map_err(|source| CopyError::PathTooLong {
                    side: PathSide::Destination,
                    source,
                })?;
            retarget = Some(mark);
        }

        let result = self.write_file(state, retarget.is_some());

        if let Some(mark) = retarget {
            state.dst.pop_to(mark);
        }
        result
    }

    fn write_file(&mut self, state: &mut CopyState, retargeted: bool) -> Result<(), CopyError> {
        let src = state.src.as_path();
        let dst = state.dst.as_str();

        if retargeted && self.volume.stat(dst)? == Some(EntryKind::Directory) {
            return Err(CopyError::TypeCollision {
                path: dst.to_string(),
            });
        }

        let mut input = File::open(src).map_err(|source| CopyError::Io {
            path: src.to_path_buf(),
            source,
        })?;

        debug!("Copying file '{}' to '{dst}'", src.display());
        self.store(&mut input, src, dst, &mut state.buf)
    }

    /// Write everything `input` yields to `dst`. On failure the partially
    /// written destination is removed.
    fn store(
        &mut self,
        input: &mut impl Read,
        src: &Path,
        dst: &str,
        buf: &mut [u8],
    ) -> Result<(), CopyError> {
        let volume = self.volume;
        let mut output = volume.create(dst)?;

        match stream(input, &mut output, buf, src, dst) {
            Ok(()) => {
                drop(output);
                self.files_copied += 1;
                Ok(())
            }
            Err(err) => {
                drop(output);
                if let Err(unlink) = volume.unlink(dst) {
                    debug!("Leaving partial file '{dst}' behind: {unlink}");
                }
                Err(err)
            }
        }
    }
}

fn stream(
    input: &mut impl Read,
    output: &mut impl Write,
    buf: &mut [u8],
    src: &Path,
    dst: &str,
) -> Result<(), CopyError> {
    loop {
        let n = match input.read(buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(CopyError::Io {
                    path: src.to_path_buf(),
                    source,
                })
            }
        };
        output
            .write_all(&buf[..n])
            .map_err(|source| FatError::new("write", dst, source))?;
    }
    output
        .flush()
        .map_err(|source| FatError::new("sync", dst, source))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diskio::DiskIo;
    use crate::flash::FileFlash;
    use crate::volume;
    use fatfs::{FileSystem, FsOptions};
    use std::io::{Cursor, Seek, SeekFrom};

    const SECTOR: usize = 4096;

    type MemDisk = DiskIo<FileFlash<Cursor<Vec<u8>>>>;

    fn mem_disk(sectors: usize) -> MemDisk {
        let mut flash = FileFlash::new(Cursor::new(Vec::new()), sectors * SECTOR, SECTOR);
        flash.clear().unwrap();
        let mut disk = DiskIo::new(flash);
        volume::format(&mut disk, SECTOR, sectors).unwrap();
        disk
    }

    fn read_back(disk: &mut MemDisk, path: &str) -> Vec<u8> {
        disk.seek(SeekFrom::Start(0)).unwrap();
        let fs = FileSystem::new(disk, FsOptions::new()).unwrap();
        let mut data = Vec::new();
        fs.root_dir()
            .open_file(path)
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        data
    }

    #[test]
    fn test_copies_tree_into_root() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello world\n").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/b.txt"), b"hey").unwrap();

        let mut disk = mem_disk(12);
        {
            let volume = Volume::mount(&mut disk).unwrap();
            let mut copier = TreeCopier::new(&volume, 4096);
            copier.copy(src.path(), "").unwrap();

            assert_eq!(copier.directories_created(), 1);
            assert_eq!(copier.files_copied(), 2);
            assert!(copier.failures().is_empty());
            volume.unmount().unwrap();
        }

        assert_eq!(read_back(&mut disk, "a.txt"), b"hello world\n");
        assert_eq!(read_back(&mut disk, "sub/b.txt"), b"hey");
    }

    #[test]
    fn test_file_onto_directory_uses_base_name() {
        let src = tempfile::tempdir().unwrap();
        let file = src.path().join("note.txt");
        fs::write(&file, b"inside").unwrap();

        let mut disk = mem_disk(12);
        {
            let volume = Volume::mount(&mut disk).unwrap();
            volume.mkdir("/docs").unwrap();

            let mut copier = TreeCopier::new(&volume, 4096);
            copier.copy(&file, "/docs").unwrap();
            assert_eq!(copier.files_copied(), 1);
            assert_eq!(
                volume.stat("/docs/note.txt").unwrap(),
                Some(EntryKind::File)
            );
            volume.unmount().unwrap();
        }
        assert_eq!(read_back(&mut disk, "docs/note.txt"), b"inside");
    }

    #[test]
    fn test_existing_file_is_overwritten() {
        let src = tempfile::tempdir().unwrap();
        let file = src.path().join("cfg.ini");
        fs::write(&file, b"new").unwrap();

        let mut disk = mem_disk(12);
        {
            let volume = Volume::mount(&mut disk).unwrap();
            let mut old = volume.create("/cfg.ini").unwrap();
            old.write_all(b"previous contents").unwrap();
            drop(old);

            let mut copier = TreeCopier::new(&volume, 4096);
            copier.copy(&file, "/cfg.ini").unwrap();
            volume.unmount().unwrap();
        }
        assert_eq!(read_back(&mut disk, "cfg.ini"), b"new");
    }

    #[test]
    fn test_directory_onto_file_collides() {
        let src = tempfile::tempdir().unwrap();

        let mut disk = mem_disk(12);
        let volume = Volume::mount(&mut disk).unwrap();
        drop(volume.create("/taken").unwrap());

        let mut copier = TreeCopier::new(&volume, 4096);
        let err = copier.copy(src.path(), "/taken").unwrap_err();
        assert!(matches!(err, CopyError::TypeCollision { .. }));
        assert_eq!(copier.directories_created(), 0);
    }

    #[test]
    fn test_retarget_onto_directory_collides() {
        let src = tempfile::tempdir().unwrap();
        let file = src.path().join("a.txt");
        fs::write(&file, b"x").unwrap();

        let mut disk = mem_disk(12);
        let volume = Volume::mount(&mut disk).unwrap();
        volume.mkdir("/out").unwrap();
        volume.mkdir("/out/a.txt").unwrap();

        let mut copier = TreeCopier::new(&volume, 4096);
        let err = copier.copy(&file, "/out").unwrap_err();
        assert!(matches!(err, CopyError::TypeCollision { .. }));
        assert_eq!(copier.files_copied(), 0);
    }

    #[test]
    fn test_overlong_child_skipped_siblings_copied() {
        let src = tempfile::tempdir().unwrap();
        let long_name = "n".repeat(60);
        fs::write(src.path().join("ok.txt"), b"fine").unwrap();
        fs::write(src.path().join(&long_name), b"too long").unwrap();

        // Room for the short child but not the long one on either side.
        let limit = src.path().as_os_str().len() + 1 + 30;

        let mut disk = mem_disk(12);
        let volume = Volume::mount(&mut disk).unwrap();
        let mut copier = TreeCopier::new(&volume, limit);
        let err = copier.copy(src.path(), "").unwrap_err();

        assert!(matches!(err, CopyError::Incomplete { failed: 1, .. }));
        assert_eq!(copier.files_copied(), 1);
        assert_eq!(copier.failures().len(), 1);
        assert!(matches!(
            copier.failures()[0].error,
            CopyError::PathTooLong {
                side: PathSide::Source,
                ..
            }
        ));
        assert_eq!(volume.stat("/ok.txt").unwrap(), Some(EntryKind::File));
    }

    #[test]
    fn test_overlong_top_level_source() {
        let mut disk = mem_disk(12);
        let volume = Volume::mount(&mut disk).unwrap();
        let mut copier = TreeCopier::new(&volume, 8);

        let err = copier.copy(Path::new("/a/very/long/path"), "").unwrap_err();
        assert!(matches!(
            err,
            CopyError::PathTooLong {
                side: PathSide::Source,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_source_is_io_error() {
        let src = tempfile::tempdir().unwrap();
        let mut disk = mem_disk(12);
        let volume = Volume::mount(&mut disk).unwrap();
        let mut copier = TreeCopier::new(&volume, 4096);

        let err = copier
            .copy(&src.path().join("does-not-exist"), "")
            .unwrap_err();
        assert!(matches!(err, CopyError::Io { .. }));
    }

    #[test]
    fn test_volume_full_leaves_no_partial_file() {
        let src = tempfile::tempdir().unwrap();
        let big = src.path().join("big.bin");
        fs::write(&big, vec![0x5A; 40 * 1024]).unwrap();

        let mut disk = mem_disk(12);
        let volume = Volume::mount(&mut disk).unwrap();
        let mut copier = TreeCopier::new(&volume, 4096);

        let err = copier.copy(&big, "").unwrap_err();
        assert!(matches!(err, CopyError::Library(_)));
        assert_eq!(copier.files_copied(), 0);
        assert_eq!(volume.stat("/big.bin").unwrap(), None);

        let stats = volume.stats().unwrap();
        assert_eq!(stats.free_clusters, stats.total_clusters);
    }

    /// Yields `limit` bytes, then fails.
    struct BrokenReader {
        limit: usize,
        done: usize,
    }

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.done >= self.limit {
                return Err(io::Error::new(io::ErrorKind::Other, "device went away"));
            }
            let n = buf.len().min(self.limit - self.done);
            buf[..n].fill(0x42);
            self.done += n;
            Ok(n)
        }
    }

    #[test]
    fn test_host_read_error_removes_partial_file() {
        let mut disk = mem_disk(12);
        let volume = Volume::mount(&mut disk).unwrap();
        let mut copier = TreeCopier::new(&volume, 4096);

        let mut input = BrokenReader {
            limit: 2 * SECTOR + 10,
            done: 0,
        };
        let mut buf = vec![0u8; SECTOR];
        let err = copier
            .store(&mut input, Path::new("/host/flaky.bin"), "/flaky.bin", &mut buf)
            .unwrap_err();

        match err {
            CopyError::Io { path, source } => {
                assert_eq!(path, Path::new("/host/flaky.bin"));
                assert_eq!(source.kind(), io::ErrorKind::Other);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(copier.files_copied(), 0);
        assert_eq!(volume.stat("/flaky.bin").unwrap(), None);

        let stats = volume.stats().unwrap();
        assert_eq!(stats.free_clusters, stats.total_clusters);
    }

    #[test]
    fn test_stream_stops_at_first_read_error() {
        let mut input = BrokenReader {
            limit: 100,
            done: 0,
        };
        let mut output = Vec::new();
        let mut buf = [0u8; 64];

        let err = stream(&mut input, &mut output, &mut buf, Path::new("src"), "/dst").unwrap_err();
        assert!(matches!(err, CopyError::Io { .. }));
        assert_eq!(output.len(), 100);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_tree_is_unsupported() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("real.txt"), b"data").unwrap();
        std::os::unix::fs::symlink("real.txt", src.path().join("link.txt")).unwrap();

        let mut disk = mem_disk(12);
        let volume = Volume::mount(&mut disk).unwrap();
        let mut copier = TreeCopier::new(&volume, 4096);

        let err = copier.copy(src.path(), "").unwrap_err();
        assert!(matches!(err, CopyError::Incomplete { failed: 1, .. }));
        assert!(matches!(
            copier.failures()[0].error,
            CopyError::Unsupported { .. }
        ));
        assert_eq!(copier.files_copied(), 1);
    }
}
