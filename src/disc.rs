//! C5: ties the partition parser together into a whole disc, covering both
//! the hashed/encrypted Wii layout and the flat GameCube layout (spec.md 3
//! "Disc", 4.4).

use std::io::{Read, Seek, SeekFrom};

use binrw::BinReaderExt;

use crate::{
    error::{CoreError, Result},
    fst::{Fst, FstNode},
    partition_rw::PartitionReader,
    reader::WiiIsoReader,
    structs::{DiscHeader, WiiPartTableEntry, WiiPartType},
};

/// Iterator callback moment, named after the source toolchain's `icm`
/// (iterate-callback-mode) values (spec.md 4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Icm {
    Directory,
    File,
    Copy,
    Data,
    OpenPart,
    ClosePart,
}

#[derive(Debug, Clone)]
pub struct FstEvent {
    pub kind: Icm,
    pub path: Vec<String>,
    pub offset: u64,
    pub size: u32,
}

/// The GameCube multiboot partition table lives at boot-region offset 0x40
/// rather than disc offset 0x40000 (spec.md 2 "supplemented features").
const GC_MULTIBOOT_PTAB_OFF: u64 = 0x40;

pub struct GcDisc<RS: Read + Seek> {
    pub file: RS,
    header: DiscHeader,
}

impl<RS: Read + Seek> GcDisc<RS> {
    pub fn create(mut rs: RS) -> Result<Self> {
        rs.seek(SeekFrom::Start(0))?;
        let header: DiscHeader = rs.read_be()?;
        Ok(GcDisc { file: rs, header })
    }

    pub fn get_header(&self) -> &DiscHeader {
        &self.header
    }

    /// The flat multiboot table at 0x40, when present; a plain GameCube
    /// disc has no table here and exposes a single implicit partition.
    pub fn multiboot_entries(&mut self) -> Result<Vec<WiiPartTableEntry>> {
        self.file.seek(SeekFrom::Start(GC_MULTIBOOT_PTAB_OFF))?;
        let n_part: u32 = self.file.read_be()?;
        let off4: u32 = self.file.read_be()?;
        if n_part == 0 || n_part > 124 {
            return Ok(Vec::new());
        }
        self.file.seek(SeekFrom::Start(off4 as u64 * 4))?;
        let mut entries = Vec::with_capacity(n_part as usize);
        for _ in 0..n_part {
            entries.push(self.file.read_be()?);
        }
        Ok(entries)
    }

    pub fn read_fst(&mut self) -> Result<Fst> {
        Ok(Fst::read(&mut self.file, *self.header.fst_off)?)
    }
}

pub enum Disc<RS: Read + Seek> {
    Wii(WiiIsoReader<RS>),
    GameCube(GcDisc<RS>),
}

impl<RS: Read + Seek> Disc<RS> {
    /// Sniffs the disc kind from the magics at 0x18/0x1C (spec.md 3
    /// "Disc" invariant) and opens the appropriate parser.
    pub fn open(mut rs: RS) -> Result<Self> {
        rs.seek(SeekFrom::Start(0))?;
        let header: DiscHeader = rs.read_be()?;
        if header.is_wii() {
            Ok(Disc::Wii(WiiIsoReader::create(rs)?))
        } else if header.is_gamecube() {
            rs.seek(SeekFrom::Start(0))?;
            Ok(Disc::GameCube(GcDisc::create(rs)?))
        } else {
            Err(CoreError::BadFormat)
        }
    }

    pub fn get_header(&self) -> &DiscHeader {
        match self {
            Disc::Wii(r) => r.get_header(),
            Disc::GameCube(r) => r.get_header(),
        }
    }

    pub fn partitions(&self) -> &[WiiPartTableEntry] {
        match self {
            Disc::Wii(r) => r.partitions(),
            Disc::GameCube(_) => &[],
        }
    }

    pub fn partition_by_type(&self, part_type: WiiPartType) -> Option<&WiiPartTableEntry> {
        self.partitions().iter().find(|p| p.part_type == part_type)
    }

    /// Preference order: data > channel > update > start (spec.md 4.4).
    /// GameCube discs have no partition table; `None` indicates "read the
    /// disc itself" to callers.
    pub fn main_partition(&self) -> Option<&WiiPartTableEntry> {
        for candidate in [WiiPartType::Data, WiiPartType::Channel, WiiPartType::Update] {
            if let Some(p) = self.partition_by_type(candidate) {
                return Some(p);
            }
        }
        self.partitions().first()
    }

    /// Depth-first traversal of a Wii partition's files, in the order
    /// `iter_fst` promises (spec.md 4.4): directory-enter, files, then
    /// directory-leave, with `OpenPart`/`ClosePart` bracketing the whole
    /// walk so callers can multiplex several partitions through one
    /// callback.
    pub fn iter_fst(&mut self, part_type: WiiPartType, callback: &mut dyn FnMut(FstEvent)) -> Result<()> {
        let Disc::Wii(reader) = self else {
            return Err(CoreError::Unsupported { what: "iter_fst on a non-Wii disc".into() });
        };
        let mut part_reader = PartitionReader::open_partition(
            reader,
            *reader
                .partitions()
                .iter()
                .find(|p| p.part_type == part_type)
                .ok_or(CoreError::BadFormat)?
                .part_data_off,
        )?;
        callback(FstEvent { kind: Icm::OpenPart, path: Vec::new(), offset: 0, size: 0 });
        let mut crypto_reader = part_reader.open_encryption_reader();
        let header: DiscHeader = crypto_reader.read_disc_header()?;
        let fst = Fst::read(&mut crypto_reader, *header.fst_off)?;
        let mut prefix = Vec::new();
        walk(&fst.root, &mut prefix, callback);
        callback(FstEvent { kind: Icm::ClosePart, path: Vec::new(), offset: 0, size: 0 });
        Ok(())
    }
}

/// Depth-first walk carrying the parent directory chain in `prefix`, so each
/// emitted `FstEvent.path` is the full path from the partition root rather
/// than just the node's own name.
fn walk(nodes: &[FstNode], prefix: &mut Vec<String>, callback: &mut dyn FnMut(FstEvent)) {
    for node in nodes {
        match node {
            FstNode::Directory { name, files } => {
                prefix.push(name.clone());
                callback(FstEvent { kind: Icm::Directory, path: prefix.clone(), offset: 0, size: 0 });
                walk(files, prefix, callback);
                prefix.pop();
            }
            FstNode::File { name, offset, length } => {
                prefix.push(name.clone());
                callback(FstEvent { kind: Icm::File, path: prefix.clone(), offset: *offset, size: *length });
                prefix.pop();
            }
        }
    }
}
