//! Virtual flash device backed by a host file.
//!
//! The file stands in for raw NOR flash: erased bytes read as `0xFF`,
//! erase and I/O happen at absolute byte addresses, and every access is
//! all-or-nothing. This is the only place that does file-offset arithmetic.
use log::trace;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

/// Byte value of erased flash.
pub const ERASED_BYTE: u8 = 0xFF;

/// Erase unit of the emulated SPI flash.
pub const FLASH_SECTOR_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("range 0x{addr:08x}+{len} exceeds chip size {chip_size}")]
    OutOfBounds {
        addr: usize,
        len: usize,
        chip_size: usize,
    },

    #[error("seek to 0x{addr:08x} failed: {source}")]
    Seek {
        addr: usize,
        #[source]
        source: io::Error,
    },

    #[error("read of {len} bytes at 0x{addr:08x} failed: {source}")]
    Read {
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("write of {len} bytes at 0x{addr:08x} failed: {source}")]
    Write {
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("cannot open backing file: {0}")]
    Open(#[source] io::Error),

    #[error("flash layer is not initialized")]
    Uninitialized,
}

/// Raw flash access used by the wear-leveling layer (and provided by it).
pub trait FlashDevice {
    /// Total addressable size in bytes.
    fn chip_size(&self) -> usize;

    /// Erase granularity in bytes.
    fn sector_size(&self) -> usize;

    fn erase_sector(&mut self, sector: usize) -> Result<(), FlashError> {
        let size = self.sector_size();
        self.erase_range(sector * size, size)
    }

    /// Set `len` bytes starting at `start` to the erased value.
    fn erase_range(&mut self, start: usize, len: usize) -> Result<(), FlashError>;

    /// Write all of `data` at `addr`.
    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), FlashError>;

    /// Fill `buf` from `addr`.
    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), FlashError>;
}

impl<T: FlashDevice + ?Sized> FlashDevice for &mut T {
    fn chip_size(&self) -> usize {
        (**self).chip_size()
    }

    fn sector_size(&self) -> usize {
        (**self).sector_size()
    }

    fn erase_sector(&mut self, sector: usize) -> Result<(), FlashError> {
        (**self).erase_sector(sector)
    }

    fn erase_range(&mut self, start: usize, len: usize) -> Result<(), FlashError> {
        (**self).erase_range(start, len)
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), FlashError> {
        (**self).write(addr, data)
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(addr, buf)
    }
}

/// Flash chip emulated on top of a seekable byte store.
pub struct FileFlash<S = File> {
    store: S,
    chip_size: usize,
    sector_size: usize,
}

impl FileFlash<File> {
    /// Create (or truncate) `path` and fill it with `chip_size` erased bytes.
    pub fn create(path: &Path, chip_size: usize, sector_size: usize) -> Result<Self, FlashError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(FlashError::Open)?;

        let mut flash = FileFlash::new(file, chip_size, sector_size);
        flash.clear()?;
        Ok(flash)
    }

    /// Flush buffered data and sync the file to disk.
    pub fn sync(&mut self) -> io::Result<()> {
        self.store.flush()?;
        self.store.sync_all()
    }
}

impl<S: Read + Write + Seek> FileFlash<S> {
    /// Wrap an existing store without touching its contents.
    pub fn new(store: S, chip_size: usize, sector_size: usize) -> Self {
        FileFlash {
            store,
            chip_size,
            sector_size,
        }
    }

    /// Erase the whole chip. The last chunk is capped when the chip size
    /// is not a whole number of sectors.
    pub fn clear(&mut self) -> Result<(), FlashError> {
        self.erase_range(0, self.chip_size)
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    fn check_range(&self, addr: usize, len: usize) -> Result<(), FlashError> {
        match addr.checked_add(len) {
            Some(end) if end <= self.chip_size => Ok(()),
            _ => Err(FlashError::OutOfBounds {
                addr,
                len,
                chip_size: self.chip_size,
            }),
        }
    }

    fn seek_to(&mut self, addr: usize) -> Result<(), FlashError> {
        self.store
            .seek(SeekFrom::Start(addr as u64))
            .map(|_| ())
            .map_err(|source| FlashError::Seek { addr, source })
    }
}

impl<S: Read + Write + Seek> FlashDevice for FileFlash<S> {
    fn chip_size(&self) -> usize {
        trace!("chip_size - {}", self.chip_size);
        self.chip_size
    }

    fn sector_size(&self) -> usize {
        trace!("sector_size - {}", self.sector_size);
        self.sector_size
    }

    fn erase_sector(&mut self, sector: usize) -> Result<(), FlashError> {
        trace!("erase_sector - sector=0x{sector:08x}");
        let start = sector
            .checked_mul(self.sector_size)
            .ok_or(FlashError::OutOfBounds {
                addr: usize::MAX,
                len: self.sector_size,
                chip_size: self.chip_size,
            })?;
        self.erase_range(start, self.sector_size)
    }

    fn erase_range(&mut self, start: usize, len: usize) -> Result<(), FlashError> {
        trace!("erase_range - addr=0x{start:08x} size={len}");
        self.check_range(start, len)?;
        self.seek_to(start)?;

        let fill = vec![ERASED_BYTE; self.sector_size.min(len).max(1)];
        let mut done = 0;
        while done < len {
            let chunk = fill.len().min(len - done);
            self.store
                .write_all(&fill[..chunk])
                .map_err(|source| FlashError::Write {
                    addr: start + done,
                    len: chunk,
                    source,
                })?;
            done += chunk;
        }
        Ok(())
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), FlashError> {
        trace!("write - addr=0x{addr:08x} size={}", data.len());
        self.check_range(addr, data.len())?;
        self.seek_to(addr)?;
        self.store
            .write_all(data)
            .map_err(|source| FlashError::Write {
                addr,
                len: data.len(),
                source,
            })
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), FlashError> {
        trace!("read - addr=0x{addr:08x} size={}", buf.len());
        self.check_range(addr, buf.len())?;
        self.seek_to(addr)?;
        let len = buf.len();
        self.store
            .read_exact(buf)
            .map_err(|source| FlashError::Read { addr, len, source })
    }
}
