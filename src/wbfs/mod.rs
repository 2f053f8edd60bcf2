//! C7: the WBFS multi-disc block container (spec.md 3 "WBFS header" /
//! "WBFS disc info" / "Free Block Table", 4.5).
//!
//! Grounded in `wbfs-interface.c` and `libwbfs/file-formats.h` from the
//! original Wiimms ISO Tools sources: header layout, slot-byte semantics,
//! and the `AUTO → FIRST` allocation default for regular files all come
//! from there.

mod fbt;
pub mod report;

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use binrw::{BinReaderExt, BinWriterExt};
use tracing::{debug, info, warn};

use crate::{
    context::{AllocPolicy, Context},
    error::{CoreError, Result},
    structs::DiscHeader,
};

pub use fbt::Fbt;
pub use report::{CheckReport, RepairOptions, SlotIssue};

pub const WBFS_MAGIC: u32 = 0x5742_4653; // "WBFS"

bitflags::bitflags! {
    /// Per-slot byte in the slot table (spec.md 3 "WBFS header").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u8 {
        const VALID    = 0b0000_0001;
        const USER     = 0b0000_0010;
        const INVALID  = 0b0000_0100;
        const F_SHARED = 0b0000_1000;
        const F_FREED  = 0b0001_0000;
    }
}

impl SlotFlags {
    pub fn is_alive(self) -> bool {
        self.contains(SlotFlags::VALID)
    }
}

/// Geometry invariants derived once per open (spec.md 3 "Geometry
/// invariants").
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub n_hd_sec: u32,
    pub hd_sec_sz: u32,
    pub wbfs_sec_sz: u32,
    pub wbfs_version: u8,
    pub wbfs_blocks_per_disc: u32,
    pub max_discs: u32,
    pub disc_info_size: u32,
}

const MAX_DISC_BYTES: u64 = 2 * crate::WII_DISC_SIZE;
/// magic + n_hd_sec + hd_sec_sz_s + wbfs_sec_sz_s + wbfs_version + padding;
/// the slot table (`disc_table` in the original layout) starts right after.
const HEADER_FIXED_SIZE: u32 = 12;

impl Geometry {
    /// The header, slot table and per-slot disc-info table all live inside
    /// the first WBFS block (spec.md 3 "WBFS header"; `wbfs-interface.c`
    /// reads/writes this whole region as one `wbfs_sec_sz`-sized buffer, with
    /// disc infos starting right after the fixed `hd_sec_sz`-sized header
    /// area). Sizing the disc-info table against `hd_sec_sz` instead of
    /// `wbfs_sec_sz` leaves no room for even a single slot on any real
    /// geometry, since `hd_sec_sz` is typically 512 bytes.
    fn derive(n_hd_sec: u32, hd_sec_sz_s: u8, wbfs_sec_sz_s: u8, wbfs_version: u8) -> Result<Self> {
        let hd_sec_sz = 1u32 << hd_sec_sz_s;
        let wbfs_sec_sz = 1u32 << wbfs_sec_sz_s;
        if hd_sec_sz < 512 {
            return Err(CoreError::InvalidLayout { reason: "hd sector size below 512".into() });
        }
        if (wbfs_sec_sz as u64) < 2 * crate::BLOCK_SIZE {
            return Err(CoreError::InvalidLayout { reason: "wbfs block size below 2 wii sectors".into() });
        }
        let wbfs_blocks_per_disc = MAX_DISC_BYTES.div_ceil(wbfs_sec_sz as u64) as u32;
        let disc_info_size = 0x100 + 2 * wbfs_blocks_per_disc;
        let slot_table_capacity = hd_sec_sz.saturating_sub(HEADER_FIXED_SIZE);
        let disc_info_capacity = wbfs_sec_sz.saturating_sub(hd_sec_sz) / disc_info_size;
        let max_discs = slot_table_capacity.min(disc_info_capacity);
        if max_discs == 0 {
            return Err(CoreError::InvalidLayout { reason: "wbfs block size too small to hold any disc slots".into() });
        }
        Ok(Geometry {
            n_hd_sec,
            hd_sec_sz,
            wbfs_sec_sz,
            wbfs_version,
            wbfs_blocks_per_disc,
            max_discs,
            disc_info_size,
        })
    }

    pub fn total_wbfs_blocks(&self) -> u32 {
        ((self.n_hd_sec as u64 * self.hd_sec_sz as u64) / self.wbfs_sec_sz as u64) as u32
    }
}

#[derive(Debug, Clone)]
pub struct DiscInfo {
    pub header: DiscHeader,
    pub wlba: Vec<u16>,
}

/// A single WBFS container, opened over a raw reader/writer that provides
/// hd-sector-sized access (spec.md 4.5 "Open").
pub struct WbfsFile<RS> {
    file: RS,
    pub geometry: Geometry,
    slot_table: Vec<u8>,
    fbt: Fbt,
}

const SLOT_TABLE_OFF: u64 = HEADER_FIXED_SIZE as u64;

impl<RS: Read + Seek> WbfsFile<RS> {
    pub fn open(mut file: RS) -> Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        let magic: u32 = file.read_be()?;
        if magic != WBFS_MAGIC {
            return Err(CoreError::BadFormat);
        }
        let n_hd_sec: u32 = file.read_be()?;
        let hd_sec_sz_s: u8 = file.read_be()?;
        let wbfs_sec_sz_s: u8 = file.read_be()?;
        let wbfs_version: u8 = file.read_be()?;
        let _padding: u8 = file.read_be()?;
        let geometry = Geometry::derive(n_hd_sec, hd_sec_sz_s, wbfs_sec_sz_s, wbfs_version)?;

        file.seek(SeekFrom::Start(SLOT_TABLE_OFF))?;
        let mut slot_table = vec![0u8; geometry.max_discs as usize];
        file.read_exact(&mut slot_table)?;

        let fbt = Fbt::load(&mut file, &geometry)?;

        info!(max_discs = geometry.max_discs, total_blocks = geometry.total_wbfs_blocks(), "opened wbfs container");
        Ok(WbfsFile { file, geometry, slot_table, fbt })
    }

    pub fn slot_flags(&self, slot: u32) -> Option<SlotFlags> {
        self.slot_table.get(slot as usize).map(|b| SlotFlags::from_bits_truncate(*b))
    }

    pub fn live_slots(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.slot_table.len() as u32).filter(|s| self.slot_flags(*s).unwrap().is_alive())
    }

    /// Disc infos start right at the `hd_sec_sz` boundary and fill up to
    /// `wbfs_sec_sz`, after the fixed header and slot table (spec.md 3
    /// "WBFS disc info").
    fn disc_info_offset(&self, slot: u32) -> u64 {
        self.geometry.hd_sec_sz as u64 + slot as u64 * self.geometry.disc_info_size as u64
    }

    pub fn read_disc_info(&mut self, slot: u32) -> Result<DiscInfo> {
        self.file.seek(SeekFrom::Start(self.disc_info_offset(slot)))?;
        let mut head_buf = [0u8; 0x100];
        self.file.read_exact(&mut head_buf)?;
        let header: DiscHeader = Cursor::new(&head_buf).read_be()?;
        let mut wlba = vec![0u16; self.geometry.wbfs_blocks_per_disc as usize];
        for entry in wlba.iter_mut() {
            *entry = self.file.read_be()?;
        }
        Ok(DiscInfo { header, wlba })
    }

    /// Reads `buf` from a physical WBFS block, for callers (the read-through
    /// facade) that already resolved a virtual block through a disc's WLBA
    /// table (spec.md 4.8 "WBFS-hosted disc").
    pub fn read_block(&mut self, phys_block: u16, in_block_off: u64, buf: &mut [u8]) -> Result<()> {
        let off = phys_block as u64 * self.geometry.wbfs_sec_sz as u64 + in_block_off;
        self.file.seek(SeekFrom::Start(off))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    pub fn find_slot_by_id(&mut self, id6: &[u8; 6]) -> Result<Option<u32>> {
        for slot in self.live_slots().collect::<Vec<_>>() {
            let info = self.read_disc_info(slot)?;
            if &info.header.id6 == id6 {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }
}

impl<RS: Read + Write + Seek> WbfsFile<RS> {
    /// Formats a fresh WBFS container: writes the header and a zeroed slot
    /// table, then an all-free FBT (spec.md 4.5 "growing mode", spec.md 2
    /// C7). The backing file only grows to cover the header block itself;
    /// `add_disc` extends it further, one block at a time, as discs are
    /// added, so a freshly formatted container stays sparse until used.
    pub fn create(mut file: RS, n_hd_sec: u32, hd_sec_sz_s: u8, wbfs_sec_sz_s: u8, wbfs_version: u8) -> Result<Self> {
        let geometry = Geometry::derive(n_hd_sec, hd_sec_sz_s, wbfs_sec_sz_s, wbfs_version)?;

        file.seek(SeekFrom::Start(0))?;
        file.write_be(&WBFS_MAGIC)?;
        file.write_be(&n_hd_sec)?;
        file.write_be(&hd_sec_sz_s)?;
        file.write_be(&wbfs_sec_sz_s)?;
        file.write_be(&wbfs_version)?;
        file.write_be(&0u8)?; // padding

        let slot_table = vec![0u8; geometry.max_discs as usize];
        file.seek(SeekFrom::Start(SLOT_TABLE_OFF))?;
        file.write_all(&slot_table)?;

        let mut fbt = Fbt::new_all_free(&geometry);
        fbt.flush(&mut file, &geometry)?;
        file.flush()?;

        info!(max_discs = geometry.max_discs, total_blocks = geometry.total_wbfs_blocks(), "formatted new wbfs container");
        Ok(WbfsFile { file, geometry, slot_table, fbt })
    }

    /// Alias for [`Self::create`] matching the container-level vocabulary
    /// used elsewhere in this module (spec.md 4.5 "format").
    pub fn format(file: RS, n_hd_sec: u32, hd_sec_sz_s: u8, wbfs_sec_sz_s: u8, wbfs_version: u8) -> Result<Self> {
        Self::create(file, n_hd_sec, hd_sec_sz_s, wbfs_sec_sz_s, wbfs_version)
    }

    /// Allocates `count` free blocks per `policy`, removing them from the
    /// FBT's free set (spec.md 4.5 "Allocate N free WBFS blocks").
    fn allocate_blocks(&mut self, count: u32, policy: AllocPolicy, is_regular_file: bool) -> Result<Vec<u32>> {
        match policy.resolve(is_regular_file) {
            AllocPolicy::First | AllocPolicy::Auto => self.fbt.alloc_first(count),
            AllocPolicy::AvoidFrag => self
                .fbt
                .alloc_longest_run(count)
                .or_else(|_| self.fbt.alloc_first(count)),
        }
    }

    /// Adds `source_blocks` (already split into wbfs-block-sized chunks,
    /// one `None` per unused virtual block) as a new slot, following the
    /// slot-byte-last commit rule (spec.md 4.5 step 5, testable property 5).
    pub fn add_disc(
        &mut self,
        ctx: &Context,
        header: &DiscHeader,
        mut source_blocks: impl FnMut(u32) -> Result<Option<Vec<u8>>>,
        used_virtual_blocks: u32,
        is_regular_file: bool,
    ) -> Result<u32> {
        if self.find_slot_by_id(&header.id6)?.is_some() {
            return Err(CoreError::SlotOccupied(0));
        }
        let slot = self
            .slot_table
            .iter()
            .position(|b| !SlotFlags::from_bits_truncate(*b).contains(SlotFlags::VALID))
            .ok_or(CoreError::WbfsFull)? as u32;

        let allocated = self.allocate_blocks(used_virtual_blocks, ctx.alloc_policy, is_regular_file)?;
        let mut wlba = vec![0u16; self.geometry.wbfs_blocks_per_disc as usize];
        for (virt, phys) in allocated.iter().enumerate().take(used_virtual_blocks as usize) {
            wlba[virt] = *phys as u16;
        }

        for (virt, phys) in allocated.iter().enumerate() {
            if let Some(data) = source_blocks(virt as u32)? {
                self.file.seek(SeekFrom::Start(*phys as u64 * self.geometry.wbfs_sec_sz as u64))?;
                self.file.write_all(&data)?;
            }
        }

        self.file.seek(SeekFrom::Start(self.disc_info_offset(slot)))?;
        let mut head_buf = Vec::new();
        Cursor::new(&mut head_buf).write_be(header)?;
        self.file.write_all(&head_buf)?;
        for entry in &wlba {
            self.file.write_be(entry)?;
        }

        self.fbt.flush(&mut self.file, &self.geometry)?;

        // commit point: the slot becomes visible to readers only now.
        self.slot_table[slot as usize] = (SlotFlags::VALID | SlotFlags::USER).bits();
        self.file.seek(SeekFrom::Start(SLOT_TABLE_OFF + slot as u64))?;
        self.file.write_all(&[self.slot_table[slot as usize]])?;
        self.file.flush()?;
        info!(slot, id6 = %String::from_utf8_lossy(&header.id6), "added disc to wbfs");
        Ok(slot)
    }

    /// Clears the slot byte; if `free_blocks` is set, also frees the WLBA's
    /// blocks in the FBT (spec.md 4.5 "Remove disc").
    pub fn remove_disc(&mut self, slot: u32, free_blocks: bool) -> Result<()> {
        let flags = self.slot_flags(slot).ok_or(CoreError::SlotNotFound(slot))?;
        if !flags.is_alive() {
            return Err(CoreError::SlotNotFound(slot));
        }
        if free_blocks {
            let info = self.read_disc_info(slot)?;
            for &block in info.wlba.iter().filter(|&&b| b != 0) {
                self.fbt.free(block as u32);
            }
            self.fbt.flush(&mut self.file, &self.geometry)?;
        }
        self.slot_table[slot as usize] = 0;
        self.file.seek(SeekFrom::Start(SLOT_TABLE_OFF + slot as u64))?;
        self.file.write_all(&[0])?;
        self.file.flush()?;
        debug!(slot, free_blocks, "removed disc from wbfs");
        Ok(())
    }

    /// Rewrites only the id/title fields of the slot's disc-info copy
    /// (spec.md 4.5 "Rename disc"); no data block moves.
    pub fn rename_disc(&mut self, slot: u32, id6: Option<[u8; 6]>, title: Option<[u8; 0x40]>) -> Result<()> {
        if !self.slot_flags(slot).ok_or(CoreError::SlotNotFound(slot))?.is_alive() {
            return Err(CoreError::SlotNotFound(slot));
        }
        let off = self.disc_info_offset(slot);
        if let Some(id6) = id6 {
            self.file.seek(SeekFrom::Start(off))?;
            self.file.write_all(&id6)?;
        }
        if let Some(title) = title {
            self.file.seek(SeekFrom::Start(off + 0x20))?;
            self.file.write_all(&title)?;
        }
        self.file.flush()?;
        Ok(())
    }

    /// Consistency check across slots and the FBT (spec.md 4.5 "check").
    pub fn check(&mut self) -> Result<CheckReport> {
        let mut report = CheckReport::default();
        let total_blocks = self.geometry.total_wbfs_blocks();
        let mut claimants: Vec<Vec<u32>> = vec![Vec::new(); total_blocks as usize];

        for slot in self.live_slots().collect::<Vec<_>>() {
            let info = self.read_disc_info(slot)?;
            let mut any_used = false;
            for (virt, &block) in info.wlba.iter().enumerate() {
                if block == 0 && virt != 0 {
                    continue;
                }
                any_used = true;
                if (block as u32) >= total_blocks {
                    report.invalid_slots.push(slot);
                    continue;
                }
                claimants[block as usize].push(slot);
                if !self.fbt.is_used(block as u32) {
                    report.lost_blocks.push((slot, block as u32));
                }
            }
            if !any_used {
                report.empty_slots.push(slot);
            }
        }

        for (block, owners) in claimants.iter().enumerate() {
            if owners.len() > 1 {
                report.overlaps.push(SlotIssue { block: block as u32, slots: owners.clone() });
            }
            if owners.is_empty() && self.fbt.is_used(block as u32) && block != 0 {
                report.orphan_blocks.push(block as u32);
            }
        }

        if self.geometry.wbfs_version == 0 {
            report.legacy_v0 = true;
            warn!("wbfs container uses the legacy v0 free-block rounding");
        }
        Ok(report)
    }

    /// Applies `opts` to the state found by a prior [`Self::check`] call
    /// (spec.md 4.5 "repair"): drop unwanted slots first, rebuild the FBT,
    /// then write back.
    pub fn repair(&mut self, report: &CheckReport, opts: &RepairOptions) -> Result<()> {
        if opts.rm_invalid {
            for &slot in &report.invalid_slots {
                self.remove_disc(slot, true)?;
            }
        }
        if opts.rm_overlap {
            for issue in &report.overlaps {
                for &slot in issue.slots.iter().skip(1) {
                    self.remove_disc(slot, false)?;
                }
            }
        }
        if opts.rm_empty {
            for &slot in &report.empty_slots {
                self.remove_disc(slot, false)?;
            }
        }
        if opts.rebuild_fbt {
            self.fbt.clear();
            for slot in self.live_slots().collect::<Vec<_>>() {
                let info = self.read_disc_info(slot)?;
                for &block in info.wlba.iter().filter(|&&b| b != 0) {
                    self.fbt.mark_used(block as u32);
                }
            }
            self.fbt.flush(&mut self.file, &self.geometry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slot_flags_round_trip_bits() {
        let f = SlotFlags::VALID | SlotFlags::USER;
        assert!(f.is_alive());
        assert_eq!(SlotFlags::from_bits_truncate(f.bits()), f);
    }

    #[test]
    fn geometry_rejects_small_hd_sector() {
        assert!(Geometry::derive(1000, 8, 21, 1).is_err());
    }

    #[test]
    fn geometry_max_discs_at_least_one_for_canonical_hd_sector() {
        // 1 GiB file, 512-byte hd sectors, 2 MiB wbfs blocks.
        let geometry = Geometry::derive(2_097_152, 9, 21, 1).unwrap();
        assert!(geometry.max_discs >= 1);
    }

    #[test]
    fn create_then_open_round_trips_geometry() {
        let mut buf = Cursor::new(Vec::new());
        {
            let wbfs = WbfsFile::create(&mut buf, 2_097_152, 9, 21, 1).unwrap();
            assert_eq!(wbfs.live_slots().count(), 0);
        }
        buf.set_position(0);
        let reopened = WbfsFile::open(&mut buf).unwrap();
        assert_eq!(reopened.geometry.max_discs, reopened.slot_table.len() as u32);
        assert!(reopened.live_slots().next().is_none());
    }
}
