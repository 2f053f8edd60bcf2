//! C9's sparse container sub-format: a fixed 0x8000-byte header holding a
//! magic, a little-endian block size, and a present/absent bitmap, followed
//! by only the blocks that are actually present (spec.md 4.8 "Container
//! format").
//!
//! Unlike every other on-disk structure in this crate, CISO integers are
//! little-endian — the format comes from a PC-side tool, not the console.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::{
    context::ChunkMode,
    error::{CoreError, Result},
};

pub const CISO_MAGIC: [u8; 4] = *b"CISO";
pub const HEADER_SIZE: u64 = 0x8000;
const MAP_OFFSET: u64 = 8;
const MAP_SIZE: usize = (HEADER_SIZE - MAP_OFFSET) as usize;
const MIN_BLOCK_SIZE: u32 = 0x8000;

/// Picks a block size per `CHUNK_MODE`, keeping the presence map within the
/// fixed header while staying at least 32 KiB (spec.md 4.8).
pub fn choose_block_size(mode: ChunkMode, source_size: u64) -> u32 {
    match mode {
        ChunkMode::Size32Kib => MIN_BLOCK_SIZE,
        ChunkMode::Iso => crate::BLOCK_SIZE as u32,
        ChunkMode::Pow2 => {
            let mut block = MIN_BLOCK_SIZE;
            while source_size.div_ceil(block as u64) as usize > MAP_SIZE {
                block *= 2;
            }
            block
        }
        ChunkMode::Any => {
            let exact = source_size.div_ceil(MAP_SIZE as u64);
            (exact as u32).max(MIN_BLOCK_SIZE)
        }
    }
}

/// A CISO container opened over a seekable backing file. Present blocks are
/// stored densely in file order; the map translates a logical block index
/// to its position among the present blocks (spec.md 4.8, testable
/// property 7).
pub struct CisoFile<RS> {
    file: RS,
    pub block_size: u32,
    present: Vec<u8>,
    /// Dense physical index of each present logical block, `None` for holes.
    physical: Vec<Option<u32>>,
    next_physical: u32,
}

impl<RS: Read + Seek> CisoFile<RS> {
    pub fn open(mut file: RS) -> Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != CISO_MAGIC {
            return Err(CoreError::BadFormat);
        }
        let mut block_size_buf = [0u8; 4];
        file.read_exact(&mut block_size_buf)?;
        let block_size = u32::from_le_bytes(block_size_buf);
        if block_size == 0 || !block_size.is_power_of_two() || block_size < MIN_BLOCK_SIZE {
            return Err(CoreError::InvalidLayout { reason: "ciso block size below 32 KiB or not a power of two".into() });
        }
        let mut present = vec![0u8; MAP_SIZE];
        file.read_exact(&mut present)?;
        if present.iter().any(|&b| b > 1) {
            return Err(CoreError::InvalidLayout { reason: "ciso presence map contains a value other than 0/1".into() });
        }
        let mut physical = vec![None; present.len()];
        let mut next_physical = 0u32;
        for (logical, &flag) in present.iter().enumerate() {
            if flag == 1 {
                physical[logical] = Some(next_physical);
                next_physical += 1;
            }
        }
        Ok(CisoFile { file, block_size, present, physical, next_physical })
    }

    pub fn create(mut file: RS, block_size: u32) -> Result<Self>
    where
        RS: Write,
    {
        debug_assert!(block_size.is_power_of_two() && block_size >= MIN_BLOCK_SIZE);
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&CISO_MAGIC)?;
        file.write_all(&block_size.to_le_bytes())?;
        file.write_all(&vec![0u8; MAP_SIZE])?;
        Ok(CisoFile { file, block_size, present: vec![0u8; MAP_SIZE], physical: vec![None; MAP_SIZE], next_physical: 0 })
    }

    fn block_offset(&self, logical: usize) -> Option<u64> {
        self.physical.get(logical).copied().flatten().map(|p| HEADER_SIZE + p as u64 * self.block_size as u64)
    }

    /// Reads `buf.len()` bytes from virtual offset `offset`; never-written
    /// blocks read back as zeros (spec.md 4.8, testable property 7).
    pub fn read_at(&mut self, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let block = (offset / self.block_size as u64) as usize;
            let in_block = (offset % self.block_size as u64) as usize;
            let n = buf.len().min(self.block_size as usize - in_block);
            match self.block_offset(block) {
                Some(phys_off) => {
                    self.file.seek(SeekFrom::Start(phys_off + in_block as u64))?;
                    self.file.read_exact(&mut buf[..n])?;
                }
                None => buf[..n].fill(0),
            }
            offset += n as u64;
            buf = &mut buf[n..];
        }
        Ok(())
    }
}

impl<RS: Read + Write + Seek> CisoFile<RS> {
    /// Writes `buf` at virtual offset `offset`, appending a fresh physical
    /// block the first time a logical block is touched (spec.md 4.8 "writes
    /// append").
    pub fn write_at(&mut self, mut offset: u64, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let block = (offset / self.block_size as u64) as usize;
            let in_block = (offset % self.block_size as u64) as usize;
            let n = buf.len().min(self.block_size as usize - in_block);
            if block >= self.present.len() {
                return Err(CoreError::InvalidLayout { reason: "write past the CISO presence map's addressable range".into() });
            }
            let phys_off = match self.block_offset(block) {
                Some(off) => off,
                None => {
                    let phys = self.next_physical;
                    self.next_physical += 1;
                    self.physical[block] = Some(phys);
                    self.present[block] = 1;
                    self.file.seek(SeekFrom::Start(MAP_OFFSET + block as u64))?;
                    self.file.write_all(&[1u8])?;
                    let off = HEADER_SIZE + phys as u64 * self.block_size as u64;
                    if in_block != 0 {
                        self.file.seek(SeekFrom::Start(off))?;
                        self.file.write_all(&vec![0u8; self.block_size as usize])?;
                    }
                    off
                }
            };
            self.file.seek(SeekFrom::Start(phys_off + in_block as u64))?;
            self.file.write_all(&buf[..n])?;
            offset += n as u64;
            buf = &buf[n..];
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn choose_block_size_respects_floor() {
        assert_eq!(choose_block_size(ChunkMode::Size32Kib, 1 << 30), 0x8000);
    }

    #[test]
    fn choose_block_size_grows_for_large_sources() {
        let huge = MAP_SIZE as u64 * (MIN_BLOCK_SIZE as u64) * 3;
        let block = choose_block_size(ChunkMode::Pow2, huge);
        assert!(block > MIN_BLOCK_SIZE);
        assert!(block.is_power_of_two());
    }

    #[test]
    fn write_then_read_back_round_trips() {
        let mut ciso = CisoFile::create(Cursor::new(Vec::new()), 0x8000).unwrap();
        ciso.write_at(0x10000, b"hello").unwrap();
        let mut out = [0u8; 5];
        ciso.read_at(0x10000, &mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn unwritten_region_reads_zero() {
        let mut ciso = CisoFile::create(Cursor::new(Vec::new()), 0x8000).unwrap();
        ciso.write_at(0, b"x").unwrap();
        let mut out = [0xffu8; 16];
        ciso.read_at(0x20000, &mut out).unwrap();
        assert_eq!(out, [0u8; 16]);
    }

    #[test]
    fn reopen_recovers_presence_map() {
        let mut backing = Cursor::new(Vec::new());
        {
            let mut ciso = CisoFile::create(&mut backing, 0x8000).unwrap();
            ciso.write_at(0x8000, b"data").unwrap();
        }
        backing.set_position(0);
        let mut reopened = CisoFile::open(backing).unwrap();
        let mut out = [0u8; 4];
        reopened.read_at(0x8000, &mut out).unwrap();
        assert_eq!(&out, b"data");
    }
}
