//! C9: normalises every disc source this crate knows how to read into one
//! byte-range read interface (spec.md 4.8).

use std::io::{Read, Seek, SeekFrom, Write};

use crate::{
    ciso::CisoFile,
    error::{CoreError, Result},
    wbfs::{DiscInfo, WbfsFile},
};

/// Split-file layout: a sequence of numbered parts, each `split_size` bytes
/// except possibly the last (spec.md 4.8 "Split files").
pub struct SplitFile<RS> {
    parts: Vec<RS>,
    split_size: u64,
}

/// The teacher's extractors default new split dumps to 4 GiB minus one WBFS
/// block, matching common FAT32-hosted WBFS drives (spec.md 4.8).
pub const DEFAULT_SPLIT_SIZE: u64 = (4u64 << 30) - 0x8000;

impl<RS: Read + Seek> SplitFile<RS> {
    pub fn new(parts: Vec<RS>, split_size: u64) -> Result<Self> {
        if parts.is_empty() {
            return Err(CoreError::InvalidLayout { reason: "split file with no parts".into() });
        }
        Ok(SplitFile { parts, split_size })
    }

    fn locate(&self, offset: u64) -> (usize, u64) {
        ((offset / self.split_size) as usize, offset % self.split_size)
    }

    pub fn read_at(&mut self, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let (idx, in_file) = self.locate(offset);
            let part = self.parts.get_mut(idx).ok_or(CoreError::InvalidLayout { reason: "read past last split part".into() })?;
            let n = buf.len().min((self.split_size - in_file) as usize);
            part.seek(SeekFrom::Start(in_file))?;
            part.read_exact(&mut buf[..n])?;
            offset += n as u64;
            buf = &mut buf[n..];
        }
        Ok(())
    }
}

impl<RS: Write + Read + Seek> SplitFile<RS> {
    pub fn write_at(&mut self, mut offset: u64, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let (idx, in_file) = self.locate(offset);
            let part = self.parts.get_mut(idx).ok_or(CoreError::InvalidLayout { reason: "write past last split part".into() })?;
            let n = buf.len().min((self.split_size - in_file) as usize);
            part.seek(SeekFrom::Start(in_file))?;
            part.write_all(&buf[..n])?;
            offset += n as u64;
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// A single disc's byte-range view into a WBFS container, resolved once
/// against its WLBA table (spec.md 4.8 "WBFS-hosted disc").
pub struct WbfsDiscView<'a, RS> {
    wbfs: &'a mut WbfsFile<RS>,
    info: DiscInfo,
    wbfs_block_size: u64,
}

impl<'a, RS: Read + Seek> WbfsDiscView<'a, RS> {
    pub fn open(wbfs: &'a mut WbfsFile<RS>, slot: u32) -> Result<Self> {
        let wbfs_block_size = wbfs.geometry.wbfs_sec_sz as u64;
        let info = wbfs.read_disc_info(slot)?;
        Ok(WbfsDiscView { wbfs, info, wbfs_block_size })
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut offset = offset;
        let mut buf = buf;
        while !buf.is_empty() {
            let virt_block = (offset / self.wbfs_block_size) as usize;
            let in_block = offset % self.wbfs_block_size;
            let n = buf.len().min((self.wbfs_block_size - in_block) as usize);
            match self.info.wlba.get(virt_block).copied().filter(|&b| b != 0) {
                Some(phys) => self.wbfs.read_block(phys, in_block, &mut buf[..n])?,
                None => buf[..n].fill(0),
            }
            offset += n as u64;
            buf = &mut buf[n..];
        }
        Ok(())
    }
}

/// Normalises every source variant to one read (and, where it makes sense,
/// write) interface (spec.md 4.8).
pub enum Facade<'a, RS> {
    Plain(RS),
    Split(SplitFile<RS>),
    Wbfs(WbfsDiscView<'a, RS>),
    Ciso(CisoFile<RS>),
}

impl<'a, RS: Read + Seek> Facade<'a, RS> {
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Facade::Plain(rs) => {
                rs.seek(SeekFrom::Start(offset))?;
                rs.read_exact(buf)?;
                Ok(())
            }
            Facade::Split(split) => split.read_at(offset, buf),
            Facade::Wbfs(view) => view.read_at(offset, buf),
            Facade::Ciso(ciso) => ciso.read_at(offset, buf),
        }
    }
}

impl<'a, RS: Read + Write + Seek> Facade<'a, RS> {
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            Facade::Plain(rs) => {
                rs.seek(SeekFrom::Start(offset))?;
                rs.write_all(buf)?;
                Ok(())
            }
            Facade::Split(split) => split.write_at(offset, buf),
            Facade::Wbfs(_) => Err(CoreError::Unsupported { what: "direct writes through a WBFS-hosted disc view".into() }),
            Facade::Ciso(ciso) => ciso.write_at(offset, buf),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn split_file_dispatches_across_parts() {
        let parts = vec![Cursor::new(vec![0u8; 16]), Cursor::new(vec![0u8; 16])];
        let mut split = SplitFile::new(parts, 16).unwrap();
        split.write_at(10, b"0123456789").unwrap();
        let mut out = [0u8; 10];
        split.read_at(10, &mut out).unwrap();
        assert_eq!(&out, b"0123456789");
    }

    #[test]
    fn split_file_read_past_end_errors() {
        let parts = vec![Cursor::new(vec![0u8; 16])];
        let mut split = SplitFile::new(parts, 16).unwrap();
        let mut out = [0u8; 4];
        assert!(split.read_at(32, &mut out).is_err());
    }
}
