//! Software wear-leveling layer over a [`FlashDevice`].
//!
//! Reproduces the on-flash layout of the ESP-IDF `wear_levelling` driver so
//! that a device can mount the produced image directly.
//!
//! Layout of a region of `full_mem_size` bytes starting at `start_addr`:
//!
//! ```text
//!   [ data pages + 1 dummy page ][ state copy 1 ][ state copy 2 ][ config ]
//! ```
//!
//! Each state copy starts with a 64-byte CRC-protected header followed by one
//! `write_size` record per physical page. A record is zeroed once the dummy
//! page has moved past that position. The dummy page advances by one every
//! `update_rate` sector erases, which rotates logical pages over the whole
//! physical region.
use crate::flash::{FlashDevice, FlashError, ERASED_BYTE};
use log::{debug, trace, warn};
use thiserror::Error;

pub const WL_DEFAULT_UPDATE_RATE: u32 = 16;
pub const WL_DEFAULT_TEMP_BUFF_SIZE: usize = 32;
pub const WL_DEFAULT_WRITE_SIZE: usize = 16;
pub const WL_DEFAULT_START_ADDR: usize = 0;
pub const WL_CURRENT_VERSION: u32 = 1;

const STATE_LEN: usize = 64;
const STATE_CRC_OFFSET: usize = 60;
const CONFIG_LEN: usize = 36;
const CONFIG_CRC_OFFSET: usize = 32;
const CRC_INIT: u32 = u32::MAX;

#[derive(Debug, Error)]
pub enum WlError {
    #[error("invalid wear levelling configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Flash(#[from] FlashError),
}

/// Parameters handed to the wear-leveling layer once, before `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WlConfig {
    pub start_addr: usize,
    pub full_mem_size: usize,
    pub page_size: usize,
    pub sector_size: usize,
    pub update_rate: u32,
    pub write_size: usize,
    pub version: u32,
    pub temp_buff_size: usize,
}

impl WlConfig {
    /// Default configuration covering `full_mem_size` bytes of a flash with
    /// `sector_size` erase blocks.
    pub fn new(full_mem_size: usize, sector_size: usize) -> Self {
        WlConfig {
            start_addr: WL_DEFAULT_START_ADDR,
            full_mem_size,
            page_size: sector_size,
            sector_size,
            update_rate: WL_DEFAULT_UPDATE_RATE,
            write_size: WL_DEFAULT_WRITE_SIZE,
            version: WL_CURRENT_VERSION,
            temp_buff_size: WL_DEFAULT_TEMP_BUFF_SIZE,
        }
    }

    fn to_bytes(self) -> Result<[u8; CONFIG_LEN], WlError> {
        let fields = [
            to_u32(self.start_addr, "start_addr")?,
            to_u32(self.full_mem_size, "full_mem_size")?,
            to_u32(self.page_size, "page_size")?,
            to_u32(self.sector_size, "sector_size")?,
            self.update_rate,
            to_u32(self.write_size, "write_size")?,
            self.version,
            to_u32(self.temp_buff_size, "temp_buff_size")?,
        ];

        let mut out = [0u8; CONFIG_LEN];
        for (i, value) in fields.iter().enumerate() {
            write_le32(&mut out, i * 4, *value);
        }
        let crc = crc32_le(&out[..CONFIG_CRC_OFFSET]);
        write_le32(&mut out, CONFIG_CRC_OFFSET, crc);
        Ok(out)
    }
}

/// The 64-byte state header, stored twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct WlState {
    pos: u32,
    max_pos: u32,
    move_count: u32,
    access_count: u32,
    max_count: u32,
    block_size: u32,
    version: u32,
    device_id: u32,
    reserved: [u32; 7],
    crc: u32,
}

impl WlState {
    fn to_bytes(&self) -> [u8; STATE_LEN] {
        let mut out = [0u8; STATE_LEN];
        let head = [
            self.pos,
            self.max_pos,
            self.move_count,
            self.access_count,
            self.max_count,
            self.block_size,
            self.version,
            self.device_id,
        ];
        for (i, value) in head.iter().chain(self.reserved.iter()).enumerate() {
            write_le32(&mut out, i * 4, *value);
        }
        write_le32(&mut out, STATE_CRC_OFFSET, self.crc);
        out
    }

    fn from_bytes(buf: &[u8; STATE_LEN]) -> Self {
        let mut reserved = [0u32; 7];
        for (i, slot) in reserved.iter_mut().enumerate() {
            *slot = read_le32(buf, 32 + i * 4);
        }
        WlState {
            pos: read_le32(buf, 0),
            max_pos: read_le32(buf, 4),
            move_count: read_le32(buf, 8),
            access_count: read_le32(buf, 12),
            max_count: read_le32(buf, 16),
            block_size: read_le32(buf, 20),
            version: read_le32(buf, 24),
            device_id: read_le32(buf, 28),
            reserved,
            crc: read_le32(buf, STATE_CRC_OFFSET),
        }
    }

    fn compute_crc(&self) -> u32 {
        crc32_le(&self.to_bytes()[..STATE_CRC_OFFSET])
    }

    fn is_valid(&self) -> bool {
        self.compute_crc() == self.crc
    }
}

/// Wear-leveled logical flash on top of a physical [`FlashDevice`].
pub struct WearLeveling<F> {
    flash: F,
    cfg: WlConfig,
    state: WlState,
    state_size: usize,
    cfg_size: usize,
    addr_cfg: usize,
    addr_state1: usize,
    addr_state2: usize,
    flash_size: usize,
    temp: Vec<u8>,
    initialized: bool,
}

impl<F: FlashDevice> WearLeveling<F> {
    /// Validate `cfg` against `flash` and compute the region layout.
    pub fn configure(cfg: WlConfig, flash: F) -> Result<Self, WlError> {
        debug!(
            "Configuring wear levelling: start=0x{:08x} size={} page={} sector={}",
            cfg.start_addr, cfg.full_mem_size, cfg.page_size, cfg.sector_size
        );

        if cfg.sector_size == 0 || cfg.page_size == 0 || cfg.temp_buff_size == 0 {
            return Err(invalid("sizes must be non-zero"));
        }
        if cfg.write_size == 0 {
            return Err(invalid("write_size must be non-zero"));
        }
        if cfg.sector_size % cfg.temp_buff_size != 0 {
            return Err(invalid(format!(
                "sector size {} is not a multiple of temp buffer size {}",
                cfg.sector_size, cfg.temp_buff_size
            )));
        }
        if cfg.page_size % cfg.sector_size != 0 {
            return Err(invalid(format!(
                "page size {} is not a multiple of sector size {}",
                cfg.page_size, cfg.sector_size
            )));
        }
        if cfg.sector_size != flash.sector_size() {
            return Err(invalid(format!(
                "sector size {} does not match flash sector size {}",
                cfg.sector_size,
                flash.sector_size()
            )));
        }
        if cfg.start_addr % cfg.sector_size != 0 || cfg.full_mem_size % cfg.sector_size != 0 {
            return Err(invalid("region is not sector aligned"));
        }
        match cfg.start_addr.checked_add(cfg.full_mem_size) {
            Some(end) if end <= flash.chip_size() => {}
            _ => {
                return Err(invalid(format!(
                    "region 0x{:08x}+{} exceeds chip size {}",
                    cfg.start_addr,
                    cfg.full_mem_size,
                    flash.chip_size()
                )))
            }
        }

        let mut state_size = cfg.sector_size;
        let records = STATE_LEN + (cfg.full_mem_size / cfg.sector_size) * cfg.write_size;
        if state_size < records {
            state_size = records.div_ceil(cfg.sector_size) * cfg.sector_size;
        }
        let cfg_size = cfg.sector_size;

        let data_area = cfg
            .full_mem_size
            .checked_sub(2 * state_size + cfg_size)
            .ok_or_else(|| invalid(format!("{} bytes is too small", cfg.full_mem_size)))?;
        let pages = data_area / cfg.page_size;
        if pages < 2 {
            return Err(invalid(format!(
                "{} bytes leaves no room for data pages",
                cfg.full_mem_size
            )));
        }
        // one page is the dummy
        let flash_size = (pages - 1) * cfg.page_size;

        let end = cfg.start_addr + cfg.full_mem_size;
        let wl = WearLeveling {
            flash,
            cfg,
            state: WlState::default(),
            state_size,
            cfg_size,
            addr_cfg: end - cfg_size,
            addr_state1: end - 2 * state_size - cfg_size,
            addr_state2: end - state_size - cfg_size,
            flash_size,
            temp: vec![0u8; cfg.temp_buff_size],
            initialized: false,
        };

        debug!(
            "Wear levelling layout: flash_size={} state_size={} state1=0x{:08x} state2=0x{:08x} cfg=0x{:08x}",
            wl.flash_size, wl.state_size, wl.addr_state1, wl.addr_state2, wl.addr_cfg
        );
        Ok(wl)
    }

    /// Load (or create) the state records and recover the dummy position.
    pub fn init(&mut self) -> Result<(), WlError> {
        let state1 = self.read_state(self.addr_state1)?;
        let state2 = self.read_state(self.addr_state2)?;

        match (state1.is_valid(), state2.is_valid()) {
            (true, true) => {
                self.state = state1;
                if state1 != state2 {
                    debug!("Wear levelling state copies differ, resyncing copy 2");
                    self.copy_region(self.addr_state1, self.addr_state2, self.state_size)?;
                }
            }
            (true, false) => {
                warn!("Wear levelling state copy 2 is corrupt, repairing");
                self.state = state1;
                self.copy_region(self.addr_state1, self.addr_state2, self.state_size)?;
            }
            (false, true) => {
                warn!("Wear levelling state copy 1 is corrupt, repairing");
                self.state = state2;
                self.copy_region(self.addr_state2, self.addr_state1, self.state_size)?;
            }
            (false, false) => {
                debug!("No wear levelling state found, initializing sections");
                self.init_sections()?;
            }
        }

        let expected_max_pos = self.expected_max_pos()?;
        if self.state.max_pos != expected_max_pos
            || self.state.block_size as usize != self.cfg.page_size
            || self.state.move_count >= expected_max_pos - 1
        {
            warn!("Wear levelling state does not match the configured layout, reinitializing");
            self.init_sections()?;
        }

        self.recover_pos()?;
        self.initialized = true;

        debug!(
            "Wear levelling initialized: pos={} max_pos={} move_count={} max_count={}",
            self.state.pos, self.state.max_pos, self.state.move_count, self.state.max_count
        );
        Ok(())
    }

    /// Number of physical bytes the layer reserves for its own bookkeeping.
    pub fn overhead(&self) -> usize {
        self.cfg.full_mem_size - self.flash_size
    }

    pub fn config(&self) -> &WlConfig {
        &self.cfg
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    fn expected_max_pos(&self) -> Result<u32, WlError> {
        to_u32(1 + self.flash_size / self.cfg.page_size, "max_pos")
    }

    fn read_state(&mut self, addr: usize) -> Result<WlState, WlError> {
        let mut buf = [0u8; STATE_LEN];
        self.flash.read(addr, &mut buf)?;
        Ok(WlState::from_bytes(&buf))
    }

    fn write_state(&mut self, addr: usize) -> Result<(), FlashError> {
        self.flash.erase_range(addr, self.state_size)?;
        self.flash.write(addr, &self.state.to_bytes())
    }

    fn init_sections(&mut self) -> Result<(), WlError> {
        let max_count = if self.cfg.update_rate != 0 {
            self.cfg.update_rate
        } else {
            to_u32(self.flash_size / self.state_size, "max_count")?
        };

        self.state = WlState {
            pos: 0,
            max_pos: self.expected_max_pos()?,
            move_count: 0,
            access_count: 0,
            max_count,
            block_size: to_u32(self.cfg.page_size, "page_size")?,
            version: self.cfg.version,
            device_id: rand::random(),
            reserved: [0; 7],
            crc: 0,
        };
        self.state.crc = self.state.compute_crc();

        self.write_state(self.addr_state1)?;
        self.write_state(self.addr_state2)?;

        let cfg = self.cfg.to_bytes()?;
        self.flash.erase_range(self.addr_cfg, self.cfg_size)?;
        self.flash.write(self.addr_cfg, &cfg)?;
        Ok(())
    }

    fn copy_region(&mut self, src: usize, dst: usize, len: usize) -> Result<(), FlashError> {
        self.flash.erase_range(dst, len)?;
        let mut buf = vec![0u8; self.cfg.sector_size];
        let mut done = 0;
        while done < len {
            let n = buf.len().min(len - done);
            self.flash.read(src + done, &mut buf[..n])?;
            self.flash.write(dst + done, &buf[..n])?;
            done += n;
        }
        Ok(())
    }

    /// The dummy sits at the first position whose record is not yet zeroed.
    fn recover_pos(&mut self) -> Result<(), FlashError> {
        let max_pos = self.state.max_pos as usize;
        let mut record = vec![0u8; self.cfg.write_size];
        let mut position = max_pos.saturating_sub(1);
        for i in 0..max_pos {
            let addr = self.addr_state1 + STATE_LEN + i * self.cfg.write_size;
            self.flash.read(addr, &mut record)?;
            if record.iter().any(|&b| b != 0) {
                position = i;
                break;
            }
        }
        self.state.pos = position as u32;
        Ok(())
    }

    /// Count one erase and move the dummy page forward when due.
    fn update_wl(&mut self) -> Result<(), FlashError> {
        self.state.access_count += 1;
        if self.state.access_count < self.state.max_count {
            return Ok(());
        }
        self.state.access_count = 0;

        let page = self.cfg.page_size;
        let pos = self.state.pos as usize;
        let mut data_pos = pos + 1;
        if data_pos >= self.state.max_pos as usize {
            data_pos = 0;
        }
        let data_addr = self.cfg.start_addr + data_pos * page;
        let dummy_addr = self.cfg.start_addr + pos * page;
        trace!("update_wl - moving page {data_pos} into dummy {pos}");

        self.flash.erase_range(dummy_addr, page)?;
        let chunk = self.temp.len();
        for i in 0..page / chunk {
            self.flash.read(data_addr + i * chunk, &mut self.temp)?;
            self.flash.write(dummy_addr + i * chunk, &self.temp)?;
        }

        let used = vec![0u8; self.cfg.write_size];
        let record = STATE_LEN + pos * self.cfg.write_size;
        self.flash.write(self.addr_state1 + record, &used)?;
        self.flash.write(self.addr_state2 + record, &used)?;

        self.state.pos += 1;
        if self.state.pos >= self.state.max_pos {
            self.state.pos = 0;
            self.state.move_count += 1;
            if self.state.move_count >= self.state.max_pos - 1 {
                self.state.move_count = 0;
            }
            self.state.crc = self.state.compute_crc();
            self.write_state(self.addr_state1)?;
            self.write_state(self.addr_state2)?;
            trace!("update_wl - wrapped, move_count={}", self.state.move_count);
        }
        Ok(())
    }

    /// Translate a logical address into a physical one.
    fn calc_addr(&self, addr: usize) -> usize {
        let page = self.cfg.page_size;
        let shift = self.state.move_count as usize * page;
        let mut result = (self.flash_size - shift + addr) % self.flash_size;
        if result >= self.state.pos as usize * page {
            result += page;
        }
        self.cfg.start_addr + result
    }

    fn check_access(&self, addr: usize, len: usize) -> Result<(), FlashError> {
        if !self.initialized {
            return Err(FlashError::Uninitialized);
        }
        match addr.checked_add(len) {
            Some(end) if end <= self.flash_size => Ok(()),
            _ => Err(FlashError::OutOfBounds {
                addr,
                len,
                chip_size: self.flash_size,
            }),
        }
    }
}

impl<F: FlashDevice> FlashDevice for WearLeveling<F> {
    fn chip_size(&self) -> usize {
        self.flash_size
    }

    fn sector_size(&self) -> usize {
        self.cfg.sector_size
    }

    fn erase_sector(&mut self, sector: usize) -> Result<(), FlashError> {
        let size = self.cfg.sector_size;
        self.check_access(sector.saturating_mul(size), size)?;
        self.update_wl()?;
        let phys = self.calc_addr(sector * size);
        self.flash.erase_sector(phys / size)
    }

    fn erase_range(&mut self, start: usize, len: usize) -> Result<(), FlashError> {
        self.check_access(start, len)?;
        if len == 0 {
            return Ok(());
        }
        let size = self.cfg.sector_size;
        let first = start / size;
        let last = (start + len).div_ceil(size);
        for sector in first..last {
            self.erase_sector(sector)?;
        }
        Ok(())
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), FlashError> {
        self.check_access(addr, data.len())?;
        let page = self.cfg.page_size;
        let mut done = 0;
        while done < data.len() {
            let at = addr + done;
            let n = (page - at % page).min(data.len() - done);
            let phys = self.calc_addr(at);
            self.flash.write(phys, &data[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_access(addr, buf.len())?;
        let page = self.cfg.page_size;
        let len = buf.len();
        let mut done = 0;
        while done < len {
            let at = addr + done;
            let n = (page - at % page).min(len - done);
            let phys = self.calc_addr(at);
            self.flash.read(phys, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> WlError {
    WlError::InvalidConfig(msg.into())
}

fn to_u32(value: usize, what: &str) -> Result<u32, WlError> {
    u32::try_from(value).map_err(|_| invalid(format!("{what} {value} does not fit in 32 bits")))
}

/// CRC32 as computed by the ESP ROM `crc32_le`.
fn crc32_le(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(CRC_INIT);
    hasher.update(data);
    hasher.finalize()
}

fn write_le32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_le32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::FileFlash;
    use std::io::Cursor;

    const SECTOR: usize = 4096;

    type MemFlash = FileFlash<Cursor<Vec<u8>>>;

    fn blank(sectors: usize) -> MemFlash {
        let mut flash = FileFlash::new(Cursor::new(Vec::new()), sectors * SECTOR, SECTOR);
        flash.clear().unwrap();
        flash
    }

    fn mounted(flash: MemFlash) -> WearLeveling<MemFlash> {
        let size = flash.chip_size();
        let mut wl = WearLeveling::configure(WlConfig::new(size, SECTOR), flash).unwrap();
        wl.init().unwrap();
        wl
    }

    fn pattern(sector: usize, round: usize) -> Vec<u8> {
        (0..SECTOR)
            .map(|i| (i * 7 + sector * 31 + round * 13) as u8)
            .collect()
    }

    #[test]
    fn test_layout_for_64k() {
        let wl = WearLeveling::configure(WlConfig::new(16 * SECTOR, SECTOR), blank(16)).unwrap();
        assert_eq!(wl.chip_size(), 12 * SECTOR);
        assert_eq!(wl.addr_cfg, 15 * SECTOR);
        assert_eq!(wl.addr_state2, 14 * SECTOR);
        assert_eq!(wl.addr_state1, 13 * SECTOR);
        assert_eq!(wl.overhead(), 4 * SECTOR);
    }

    #[test]
    fn test_configure_rejects_tiny_region() {
        let result = WearLeveling::configure(WlConfig::new(4 * SECTOR, SECTOR), blank(4));
        assert!(matches!(result, Err(WlError::InvalidConfig(_))));
    }

    #[test]
    fn test_configure_rejects_region_outside_chip() {
        let result = WearLeveling::configure(WlConfig::new(32 * SECTOR, SECTOR), blank(16));
        assert!(matches!(result, Err(WlError::InvalidConfig(_))));
    }

    #[test]
    fn test_configure_rejects_bad_temp_buffer() {
        let mut cfg = WlConfig::new(16 * SECTOR, SECTOR);
        cfg.temp_buff_size = 3000;
        let result = WearLeveling::configure(cfg, blank(16));
        assert!(matches!(result, Err(WlError::InvalidConfig(_))));
    }

    #[test]
    fn test_access_before_init_fails() {
        let mut wl =
            WearLeveling::configure(WlConfig::new(16 * SECTOR, SECTOR), blank(16)).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            wl.read(0, &mut buf),
            Err(FlashError::Uninitialized)
        ));
    }

    #[test]
    fn test_init_writes_valid_records() {
        let wl = mounted(blank(16));
        let raw = wl.into_inner().into_inner().into_inner();

        for addr in [13 * SECTOR, 14 * SECTOR] {
            let mut header = [0u8; STATE_LEN];
            header.copy_from_slice(&raw[addr..addr + STATE_LEN]);
            let state = WlState::from_bytes(&header);
            assert!(state.is_valid());
            assert_eq!(state.pos, 0);
            assert_eq!(state.max_pos, 13);
            assert_eq!(state.max_count, WL_DEFAULT_UPDATE_RATE);
            assert_eq!(state.block_size as usize, SECTOR);
            // no position record used yet
            assert!(raw[addr + STATE_LEN..addr + SECTOR]
                .iter()
                .all(|&b| b == ERASED_BYTE));
        }

        let cfg = &raw[15 * SECTOR..15 * SECTOR + CONFIG_LEN];
        assert_eq!(read_le32(cfg, 4) as usize, 16 * SECTOR);
        assert_eq!(read_le32(cfg, CONFIG_CRC_OFFSET), crc32_le(&cfg[..CONFIG_CRC_OFFSET]));
    }

    #[test]
    fn test_logical_sector_zero_skips_dummy() {
        let mut wl = mounted(blank(16));
        wl.erase_range(0, SECTOR).unwrap();
        wl.write(0, b"hello").unwrap();
        let raw = wl.into_inner().into_inner().into_inner();
        assert_eq!(&raw[SECTOR..SECTOR + 5], b"hello");
    }

    #[test]
    fn test_zero_length_erase_is_noop() {
        let mut wl = mounted(blank(16));
        wl.erase_range(0, SECTOR).unwrap();
        wl.write(0, b"keep").unwrap();

        wl.erase_range(100, 0).unwrap();

        let mut back = [0u8; 4];
        wl.read(0, &mut back).unwrap();
        assert_eq!(&back, b"keep");
        assert_eq!(wl.state.access_count, 1);
    }

    #[test]
    fn test_unaligned_write_spanning_pages() {
        let mut wl = mounted(blank(16));
        wl.erase_range(0, 2 * SECTOR).unwrap();
        let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        wl.write(SECTOR - 300, &data).unwrap();

        let mut back = vec![0u8; data.len()];
        wl.read(SECTOR - 300, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_data_survives_dummy_rotation() {
        let mut wl = mounted(blank(16));
        let sectors = wl.chip_size() / SECTOR;

        for s in 0..sectors {
            wl.erase_sector(s).unwrap();
            wl.write(s * SECTOR, &pattern(s, 0)).unwrap();
        }

        // enough erases to wrap the dummy around the region several times
        let rounds = sectors * WL_DEFAULT_UPDATE_RATE as usize * 3;
        for round in 1..=rounds {
            wl.erase_sector(0).unwrap();
            wl.write(0, &pattern(0, round)).unwrap();
        }
        assert!(wl.state.move_count > 0 || wl.state.pos > 0);

        let mut back = vec![0u8; SECTOR];
        wl.read(0, &mut back).unwrap();
        assert_eq!(back, pattern(0, rounds));
        for s in 1..sectors {
            wl.read(s * SECTOR, &mut back).unwrap();
            assert_eq!(back, pattern(s, 0), "logical sector {s} corrupted");
        }
    }

    #[test]
    fn test_reinit_recovers_position() {
        let mut wl = mounted(blank(16));
        let sectors = wl.chip_size() / SECTOR;
        for s in 0..sectors {
            wl.erase_sector(s).unwrap();
            wl.write(s * SECTOR, &pattern(s, 0)).unwrap();
        }
        for _ in 0..WL_DEFAULT_UPDATE_RATE * 5 {
            wl.erase_sector(1).unwrap();
            wl.write(SECTOR, &pattern(1, 0)).unwrap();
        }
        let pos = wl.state.pos;
        let move_count = wl.state.move_count;

        let mut wl = mounted(wl.into_inner());
        assert_eq!(wl.state.pos, pos);
        assert_eq!(wl.state.move_count, move_count);

        let mut back = vec![0u8; SECTOR];
        for s in 0..sectors {
            wl.read(s * SECTOR, &mut back).unwrap();
            assert_eq!(back, pattern(s, 0));
        }
    }

    #[test]
    fn test_init_repairs_corrupt_copy() {
        let wl = mounted(blank(16));
        let mut flash = wl.into_inner();
        flash.write(14 * SECTOR, &[0u8; 8]).unwrap();

        let wl = mounted(flash);
        let raw = wl.into_inner().into_inner().into_inner();
        assert_eq!(
            raw[13 * SECTOR..13 * SECTOR + STATE_LEN],
            raw[14 * SECTOR..14 * SECTOR + STATE_LEN]
        );
    }

    #[test]
    fn test_crc_matches_rom_convention() {
        // crc32_le(0xFFFFFFFF, "123456789") on the ESP ROM
        assert_eq!(crc32_le(b"123456789"), 0xD202_D277);
    }
}
