//! Physical disk interface for the FAT library.
//!
//! Sector reads are forwarded to the flash device; sector writes erase the
//! target range first and then program it, since flash can only clear bits.
//! A `Read + Write + Seek` view on top lets `fatfs` drive the device with
//! byte offsets; partial sectors go through a read-modify-write cycle.
use crate::flash::{FlashDevice, FlashError};
use log::trace;
use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error(transparent)]
    Flash(#[from] FlashError),

    #[error("{len} bytes is not a whole number of {sector_size}-byte sectors")]
    Misaligned { len: usize, sector_size: usize },

    #[error("sectors {sector}..{end} are beyond the end of the volume ({sector_count} sectors)")]
    OutOfRange {
        sector: usize,
        end: usize,
        sector_count: usize,
    },

    #[error("unsupported ioctl {0:?}")]
    UnsupportedIoctl(IoctlCommand),
}

impl From<DiskError> for io::Error {
    fn from(err: DiskError) -> Self {
        io::Error::new(io::ErrorKind::Other, err)
    }
}

/// Drive status. A file-backed device is never removed or write protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCommand {
    Sync,
    GetSectorCount,
    GetSectorSize,
    GetBlockSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    SectorCount(usize),
    SectorSize(usize),
}

pub struct DiskIo<D> {
    device: D,
    sector_size: usize,
    sector_count: usize,
    pos: u64,
    scratch: Vec<u8>,
}

impl<D: FlashDevice> DiskIo<D> {
    pub fn new(device: D) -> Self {
        let sector_size = device.sector_size();
        let sector_count = device.chip_size() / sector_size;
        DiskIo {
            device,
            sector_size,
            sector_count,
            pos: 0,
            scratch: vec![0u8; sector_size],
        }
    }

    pub fn initialize(&mut self) -> DiskStatus {
        trace!("disk_initialize");
        DiskStatus::Ready
    }

    pub fn status(&self) -> DiskStatus {
        trace!("disk_status");
        DiskStatus::Ready
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn sector_count(&self) -> usize {
        self.sector_count
    }

    /// Volume length in bytes.
    pub fn len(&self) -> u64 {
        (self.sector_count * self.sector_size) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.sector_count == 0
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    /// Read `buf.len() / sector_size` sectors starting at `sector`.
    pub fn read_sectors(&mut self, sector: usize, buf: &mut [u8]) -> Result<(), DiskError> {
        let count = self.check_span(sector, buf.len())?;
        trace!("disk_read - sector={sector}, count={count}");
        self.device.read(sector * self.sector_size, buf)?;
        Ok(())
    }

    /// Erase and then write `data.len() / sector_size` sectors at `sector`.
    pub fn write_sectors(&mut self, sector: usize, data: &[u8]) -> Result<(), DiskError> {
        let count = self.check_span(sector, data.len())?;
        trace!("disk_write - sector={sector}, count={count}");
        program(&mut self.device, sector * self.sector_size, data)?;
        Ok(())
    }

    pub fn ioctl(&mut self, cmd: IoctlCommand) -> Result<IoctlReply, DiskError> {
        trace!("disk_ioctl - cmd={cmd:?}");
        match cmd {
            IoctlCommand::Sync => Ok(IoctlReply::Done),
            IoctlCommand::GetSectorCount => Ok(IoctlReply::SectorCount(self.sector_count)),
            IoctlCommand::GetSectorSize => Ok(IoctlReply::SectorSize(self.sector_size)),
            IoctlCommand::GetBlockSize => Err(DiskError::UnsupportedIoctl(cmd)),
        }
    }

    fn check_span(&self, sector: usize, len: usize) -> Result<usize, DiskError> {
        if len % self.sector_size != 0 {
            return Err(DiskError::Misaligned {
                len,
                sector_size: self.sector_size,
            });
        }
        let count = len / self.sector_size;
        match sector.checked_add(count) {
            Some(end) if end <= self.sector_count => Ok(count),
            _ => Err(DiskError::OutOfRange {
                sector,
                end: sector.saturating_add(count),
                sector_count: self.sector_count,
            }),
        }
    }

    fn load_scratch(&mut self, sector: usize) -> Result<(), DiskError> {
        self.check_span(sector, self.sector_size)?;
        self.device
            .read(sector * self.sector_size, &mut self.scratch)?;
        Ok(())
    }

    /// Split the span starting at the current position into the sector it
    /// falls in, the offset within that sector and the usable length.
    fn locate(&self, want: usize) -> (usize, usize, usize) {
        let size = self.sector_size as u64;
        let sector = (self.pos / size) as usize;
        let offset = (self.pos % size) as usize;
        let left = self.len() - self.pos;
        let avail = if left < want as u64 { left as usize } else { want };
        (sector, offset, avail)
    }
}

fn program<D: FlashDevice>(device: &mut D, addr: usize, data: &[u8]) -> Result<(), FlashError> {
    device.erase_range(addr, data.len())?;
    device.write(addr, data)
}

impl<D: FlashDevice> Read for DiskIo<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len() {
            return Ok(0);
        }
        let (sector, offset, avail) = self.locate(buf.len());

        let n = if offset == 0 && avail >= self.sector_size {
            let n = avail - avail % self.sector_size;
            self.read_sectors(sector, &mut buf[..n])?;
            n
        } else {
            let n = (self.sector_size - offset).min(avail);
            self.load_scratch(sector)?;
            buf[..n].copy_from_slice(&self.scratch[offset..offset + n]);
            n
        };

        self.pos += n as u64;
        Ok(n)
    }
}

impl<D: FlashDevice> Write for DiskIo<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len() {
            return Ok(0);
        }
        let (sector, offset, avail) = self.locate(buf.len());

        let n = if offset == 0 && avail >= self.sector_size {
            let n = avail - avail % self.sector_size;
            self.write_sectors(sector, &buf[..n])?;
            n
        } else {
            let n = (self.sector_size - offset).min(avail);
            self.load_scratch(sector)?;
            self.scratch[offset..offset + n].copy_from_slice(&buf[..n]);
            program(&mut self.device, sector * self.sector_size, &self.scratch)
                .map_err(DiskError::from)?;
            n
        };

        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ioctl(IoctlCommand::Sync)?;
        Ok(())
    }
}

impl<D: FlashDevice> Seek for DiskIo<D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.len();
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(delta) => len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(p) if p <= len => {
                self.pos = p;
                Ok(p)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek {pos:?} outside volume of {len} bytes"),
            )),
        }
    }
}
