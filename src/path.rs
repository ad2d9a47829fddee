//! Growable path buffers with a hard length limit.
//!
//! The walker extends a path by one segment on the way down and restores it
//! on the way up. Lengths are checked before anything is mutated, and one
//! byte of headroom is kept for the terminator of the on-device layout, so
//! a path of exactly `max` bytes is rejected.
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("path '{path}' would be {len} bytes, limit is {max}")]
pub struct PathTooLong {
    pub path: String,
    pub len: usize,
    pub max: usize,
}

/// Length to restore with [`HostPath::pop_to`] / [`ImagePath::pop_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark(usize);

fn fits(len: usize, max: usize) -> bool {
    len.checked_add(1).map_or(false, |n| n <= max)
}

/// Path on the host filesystem.
#[derive(Debug, Clone)]
pub struct HostPath {
    buf: PathBuf,
    len: usize,
    max: usize,
}

impl HostPath {
    /// Trailing and repeated separators are dropped, so the tracked length
    /// is always the length of the path that is actually opened.
    pub fn new(path: &Path, max: usize) -> Result<Self, PathTooLong> {
        let buf: PathBuf = path.components().collect();
        let len = buf.as_os_str().len();
        if !fits(len, max) {
            return Err(PathTooLong {
                path: path.display().to_string(),
                len,
                max,
            });
        }
        Ok(HostPath { buf, len, max })
    }

    pub fn as_path(&self) -> &Path {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `/<name>`. No separator is added after a root or an empty path.
    pub fn push_segment(&mut self, name: &OsStr) -> Result<Mark, PathTooLong> {
        let separator = usize::from(self.buf.parent().is_some());
        let new_len = self.len + separator + name.len();
        if !fits(new_len, self.max) {
            return Err(PathTooLong {
                path: self.buf.join(name).display().to_string(),
                len: new_len,
                max: self.max,
            });
        }
        let mark = Mark(self.len);
        self.buf.push(name);
        self.len = self.buf.as_os_str().len();
        Ok(mark)
    }

    pub fn pop_to(&mut self, mark: Mark) {
        if mark.0 < self.len {
            self.buf.pop();
            self.len = self.buf.as_os_str().len();
        }
    }
}

impl fmt::Display for HostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.buf.display().fmt(f)
    }
}

/// Path inside the FAT volume. `/` separated, the root is the empty string.
#[derive(Debug, Clone)]
pub struct ImagePath {
    buf: String,
    max: usize,
}

impl ImagePath {
    pub fn new(path: &str, max: usize) -> Result<Self, PathTooLong> {
        if !fits(path.len(), max) {
            return Err(PathTooLong {
                path: path.to_string(),
                len: path.len(),
                max,
            });
        }
        Ok(ImagePath {
            buf: path.to_string(),
            max,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append `/<name>`. The separator is always counted, even at the root,
    /// so the limit does not depend on where the tree is copied to.
    pub fn push_segment(&mut self, name: &str) -> Result<Mark, PathTooLong> {
        let new_len = self.buf.len() + 1 + name.len();
        if !fits(new_len, self.max) {
            return Err(PathTooLong {
                path: format!("{}/{}", self.buf, name),
                len: new_len,
                max: self.max,
            });
        }
        let mark = Mark(self.buf.len());
        self.buf.push('/');
        self.buf.push_str(name);
        Ok(mark)
    }

    pub fn pop_to(&mut self, mark: Mark) {
        self.buf.truncate(mark.0);
    }
}

impl fmt::Display for ImagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)
    }
}
