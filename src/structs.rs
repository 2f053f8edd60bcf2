//! C2 + C3: byte-order helpers and the on-disk partition/disc structures.
//! All multi-byte integers here are big-endian (spec.md 6), expressed through
//! `binrw`'s `#[brw(big)]` the way the teacher's `reader.rs`/`builder.rs` do.

use std::ops::Deref;

use binrw::{binrw, BinRead, BinWrite};

use crate::error::{CoreError, Result};

/// A big-endian `u32` on disk that stores `byte_offset / 4` (or a size
/// divided by 4 the same way); in memory it always holds the real byte
/// value so callers can `*field` to get a `u64` without remembering which
/// fields in the Wii formats happen to be shifted (spec.md 3 "Partition").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Div4(pub u64);

impl BinRead for Div4 {
    type Args<'a> = ();
    fn read_options<R: std::io::Read + std::io::Seek>(
        reader: &mut R,
        endian: binrw::Endian,
        _args: Self::Args<'_>,
    ) -> binrw::BinResult<Self> {
        let raw = u32::read_options(reader, endian, ())?;
        Ok(Div4(raw as u64 * 4))
    }
}

impl BinWrite for Div4 {
    type Args<'a> = ();
    fn write_options<W: std::io::Write + std::io::Seek>(
        &self,
        writer: &mut W,
        endian: binrw::Endian,
        _args: Self::Args<'_>,
    ) -> binrw::BinResult<()> {
        let raw = (self.0 / 4) as u32;
        raw.write_options(writer, endian, ())
    }
}

impl Deref for Div4 {
    type Target = u64;
    fn deref(&self) -> &u64 {
        &self.0
    }
}

impl From<u64> for Div4 {
    fn from(v: u64) -> Self {
        Div4(v)
    }
}

/// Checks that `off + size <= limit` with the alignment invariants of
/// spec.md 4.2 ("PartHeader::parse"), returning `InvalidLayout` otherwise.
pub fn check_layout(off: u64, size: u64, limit: u64, align: u64, what: &str) -> Result<()> {
    if off % align != 0 {
        return Err(CoreError::InvalidLayout { reason: format!("{what} offset not {align}-aligned") });
    }
    if off.checked_add(size).map_or(true, |end| end > limit) {
        return Err(CoreError::InvalidLayout { reason: format!("{what} extends past its limit") });
    }
    Ok(())
}

//------------------------------------------------------------------------------
// Disc header / boot.bin (0x440 bytes, spec.md 6)

pub const WII_MAGIC: u32 = 0x5D1C9EA3;
pub const GC_MAGIC: u32 = 0xC2339F3D;

#[binrw]
#[brw(big)]
#[derive(Debug, Clone)]
pub struct DiscHeader {
    pub id6: [u8; 6],
    pub disc_number: u8,
    pub disc_version: u8,
    pub audio_streaming: u8,
    pub streaming_buffer_size: u8,
    pub unknown1: [u8; 0x0e],
    pub wii_magic: u32,
    pub gc_magic: u32,
    pub disc_title: [u8; 0x40],
    pub disable_hash_verification: u8,
    pub disable_disc_enc: u8,
    pub padding: [u8; 0x1e],
    #[br(count = 0x420 - 0x80)]
    #[bw(pad_size_to = 0x420 - 0x80)]
    pub unknown2: Vec<u8>,
    pub dol_off: Div4,
    pub fst_off: Div4,
    pub fst_sz: Div4,
    pub fst_max_sz: Div4,
    #[br(count = 0x440 - 0x430)]
    #[bw(pad_size_to = 0x440 - 0x430)]
    pub unknown3: Vec<u8>,
}

impl DiscHeader {
    pub fn is_wii(&self) -> bool {
        self.wii_magic == WII_MAGIC
    }

    pub fn is_gamecube(&self) -> bool {
        self.gc_magic == GC_MAGIC
    }

    pub fn id6_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.id6)
    }
}

//------------------------------------------------------------------------------
// Partition table (disc byte 0x40000, spec.md 6)

#[binrw]
#[brw(big, repr = u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WiiPartType {
    Data = 0,
    Update = 1,
    Channel = 2,
    #[brw(magic = 0xFFFF_FFFFu32)]
    Unknown = 0xFFFF_FFFF,
}

#[binrw]
#[brw(big)]
#[derive(Debug, Clone)]
pub struct WiiPartTableEntry {
    pub part_data_off: Div4,
    pub part_type: WiiPartType,
}

#[binrw]
#[brw(big)]
struct PtabInfo {
    n_part: u32,
    off4: Div4,
}

/// Parses the up-to-4 partition tables at disc offset 0x40000 and returns the
/// flattened partition entries (spec.md 4.4). GameCube multiboot uses a
/// separate flat table at boot-region offset 0x40, handled in `disc.rs`.
pub fn read_parts<RS: std::io::Read + std::io::Seek>(
    rs: &mut RS,
) -> binrw::BinResult<Vec<WiiPartTableEntry>> {
    use binrw::BinReaderExt;
    rs.seek(std::io::SeekFrom::Start(0x40000))?;
    let mut ptabs = Vec::with_capacity(4);
    for _ in 0..4 {
        let info: PtabInfo = rs.read_be()?;
        ptabs.push(info);
    }
    let mut entries = Vec::new();
    for ptab in ptabs {
        if ptab.n_part == 0 {
            continue;
        }
        rs.seek(std::io::SeekFrom::Start(*ptab.off4))?;
        for _ in 0..ptab.n_part {
            entries.push(rs.read_be::<WiiPartTableEntry>()?);
        }
    }
    Ok(entries)
}

//------------------------------------------------------------------------------
// Ticket (0x2a4 bytes, spec.md 3 "Ticket")

pub const TICKET_SIZE: u64 = 0x2a4;
pub const TICKET_SIG_OFF: usize = 0x140;
pub const TICKET_BRUTE_FORCE_OFF: usize = 0x24c;

#[binrw]
#[brw(big)]
#[derive(Debug, Clone)]
pub struct Ticket {
    pub sig_type: u32,
    pub sig: [u8; 0x100],
    pub sig_padding: [u8; 0x3c],
    // signed region (TICKET_SIG_OFF) starts here
    pub issuer: [u8; 0x40],
    pub unknown1: [u8; 0x3f],
    pub title_key: [u8; 0x10],
    pub unknown2: u8,
    pub ticket_id: [u8; 8],
    pub console_id: [u8; 4],
    pub title_id: [u8; 8],
    pub unknown3: u16,
    pub n_dlc: u16,
    pub unknown4: u8,
    pub unknown5: [u8; 8],
    pub common_key_index: u8,
    pub unknown6: [u8; 0x30],
    pub unknown7: [u8; 0x20],
    pub padding2: [u8; 2],
    pub enable_time_limit: u32,
    pub time_limit: u32,
    // brute force word (TICKET_BRUTE_FORCE_OFF) starts here
    pub fake_sign: [u8; 0x58],
}

//------------------------------------------------------------------------------
// TMD (variable size, spec.md 3 "TMD")

pub const TMD_SIG_OFF: usize = 0x140;
pub const TMD_BRUTE_FORCE_OFF: usize = 0x19a;
pub const TMD_CONTENT_OFF: usize = 0x1e4;
pub const TMD_CONTENT_SIZE: usize = 0x24;

#[binrw]
#[brw(big)]
#[derive(Debug, Clone)]
pub struct TMDContent {
    pub content_id: u32,
    pub index: u16,
    pub content_type: u16,
    pub size: u64,
    pub hash: [u8; 20],
}

#[binrw]
#[brw(big)]
#[derive(Debug, Clone)]
pub struct TMD {
    pub sig_type: u32,
    pub sig: [u8; 0x100],
    pub sig_padding: [u8; 0x3c],
    // signed region (TMD_SIG_OFF) starts here
    pub issuer: [u8; 0x40],
    pub version: u8,
    pub ca_crl_version: u8,
    pub signer_crl_version: u8,
    pub padding2: u8,
    pub sys_version: u64,
    pub title_id: [u8; 8],
    pub title_type: u32,
    pub group_id: u16,
    // brute force word (TMD_BRUTE_FORCE_OFF) starts here
    pub fake_sign: [u8; 0x3e],
    pub access_rights: u32,
    pub title_version: u16,
    #[br(temp)]
    #[bw(calc = content.len() as u16)]
    n_content: u16,
    pub boot_index: u16,
    pub padding3: [u8; 2],
    #[br(count = n_content)]
    pub content: Vec<TMDContent>,
}

impl TMD {
    /// Whether the "not encrypted" marker (spec.md 4.2) has been written
    /// into the reserved block. We use the fake-sign padding region the same
    /// way the teacher zeroes it before brute forcing: a known ASCII marker
    /// is unambiguous and cheap to check.
    pub fn is_marked_not_encrypted(&self) -> bool {
        self.fake_sign.starts_with(NOT_ENCRYPTED_MARKER)
    }

    pub fn mark_not_encrypted(&mut self) {
        self.fake_sign[..NOT_ENCRYPTED_MARKER.len()].copy_from_slice(NOT_ENCRYPTED_MARKER);
    }
}

pub const NOT_ENCRYPTED_MARKER: &[u8] = b"not encrypted";

//------------------------------------------------------------------------------
// Certificates

#[binrw]
#[brw(big, repr = u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigType {
    Rsa4096Sha1 = 0x10000,
    Rsa2048Sha1 = 0x10001,
    EccSha1 = 0x10002,
}

#[binrw]
#[brw(big, repr = u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa4096 = 0,
    Rsa2048 = 1,
    Ecc = 2,
}

/// A certificate chain link: {signature-typed header, public-key-typed body}
/// per spec.md 3. Sizes vary with `sig_type`/`key_type`; we only model the
/// two RSA variants actually used by Wii certificate chains (CA is RSA-4096,
/// TMD/ticket-signing certs are RSA-2048).
#[derive(Debug, Clone)]
pub struct Certificate {
    pub sig_type: SigType,
    pub signature: Vec<u8>,
    pub issuer: [u8; 0x40],
    pub key_type: KeyType,
    pub subject: [u8; 0x40],
    pub key_id: u32,
    pub modulus: Vec<u8>,
    pub exponent: u32,
}

impl Certificate {
    fn sig_and_pad_len(t: SigType) -> (usize, usize) {
        match t {
            SigType::Rsa4096Sha1 => (0x200, 0x3c),
            SigType::Rsa2048Sha1 => (0x100, 0x3c),
            SigType::EccSha1 => (0x3c, 0x40),
        }
    }

    fn key_and_pad_len(t: KeyType) -> (usize, usize) {
        match t {
            KeyType::Rsa4096 => (0x200, 0x34),
            KeyType::Rsa2048 => (0x100, 0x34),
            KeyType::Ecc => (0x3c, 0x3c),
        }
    }
}

impl BinRead for Certificate {
    type Args<'a> = ();
    fn read_options<R: std::io::Read + std::io::Seek>(
        reader: &mut R,
        endian: binrw::Endian,
        _args: Self::Args<'_>,
    ) -> binrw::BinResult<Self> {
        let sig_type = SigType::read_options(reader, endian, ())?;
        let (sig_len, sig_pad) = Certificate::sig_and_pad_len(sig_type);
        let mut signature = vec![0u8; sig_len];
        reader.read_exact(&mut signature)?;
        let mut pad = vec![0u8; sig_pad];
        reader.read_exact(&mut pad)?;
        let issuer = <[u8; 0x40]>::read_options(reader, endian, ())?;
        let key_type = KeyType::read_options(reader, endian, ())?;
        let subject = <[u8; 0x40]>::read_options(reader, endian, ())?;
        let key_id = u32::read_options(reader, endian, ())?;
        let (key_len, key_pad) = Certificate::key_and_pad_len(key_type);
        let mut modulus = vec![0u8; key_len];
        reader.read_exact(&mut modulus)?;
        let exponent = u32::read_options(reader, endian, ())?;
        let mut pad = vec![0u8; key_pad];
        reader.read_exact(&mut pad)?;
        Ok(Certificate { sig_type, signature, issuer, key_type, subject, key_id, modulus, exponent })
    }
}

impl BinWrite for Certificate {
    type Args<'a> = ();
    fn write_options<W: std::io::Write + std::io::Seek>(
        &self,
        writer: &mut W,
        endian: binrw::Endian,
        _args: Self::Args<'_>,
    ) -> binrw::BinResult<()> {
        self.sig_type.write_options(writer, endian, ())?;
        let (sig_len, sig_pad) = Certificate::sig_and_pad_len(self.sig_type);
        let mut sig = self.signature.clone();
        sig.resize(sig_len, 0);
        writer.write_all(&sig)?;
        writer.write_all(&vec![0u8; sig_pad])?;
        self.issuer.write_options(writer, endian, ())?;
        self.key_type.write_options(writer, endian, ())?;
        self.subject.write_options(writer, endian, ())?;
        self.key_id.write_options(writer, endian, ())?;
        let (key_len, key_pad) = Certificate::key_and_pad_len(self.key_type);
        let mut modulus = self.modulus.clone();
        modulus.resize(key_len, 0);
        writer.write_all(&modulus)?;
        self.exponent.write_options(writer, endian, ())?;
        writer.write_all(&vec![0u8; key_pad])?;
        Ok(())
    }
}

//------------------------------------------------------------------------------
// Partition header: Ticket + sub-region offsets (0x2c0 bytes, spec.md 4.2)

#[binrw]
#[brw(big)]
#[derive(Debug, Clone)]
pub struct WiiPartitionHeader {
    pub ticket: Ticket,
    pub tmd_size: u32,
    pub tmd_off: Div4,
    pub cert_chain_size: u32,
    pub cert_chain_off: Div4,
    pub global_hash_table_off: Div4,
    pub data_off: Div4,
    pub data_size: Div4,
}

impl WiiPartitionHeader {
    /// Validates the offset/size invariants from spec.md 4.2.
    pub fn validate(&self, sector: u64) -> Result<()> {
        check_layout(*self.tmd_off, self.tmd_size as u64, *self.cert_chain_off, 4, "tmd")?;
        check_layout(
            *self.cert_chain_off,
            self.cert_chain_size as u64,
            *self.global_hash_table_off,
            4,
            "cert chain",
        )?;
        if *self.global_hash_table_off + 0x18000 > *self.data_off {
            return Err(CoreError::InvalidLayout { reason: "h3 table overlaps data".into() });
        }
        if *self.data_off % sector != 0 {
            return Err(CoreError::InvalidLayout { reason: "data offset not sector aligned".into() });
        }
        if *self.data_size % sector != 0 {
            return Err(CoreError::InvalidLayout { reason: "data size not a multiple of the sector size".into() });
        }
        Ok(())
    }
}

//------------------------------------------------------------------------------
// Apploader / DOL headers

#[binrw]
#[brw(big)]
#[derive(Debug, Clone)]
pub struct ApploaderHeader {
    pub date: [u8; 16],
    pub entry_point: u32,
    pub size1: u32,
    pub size2: u32,
}

#[binrw]
#[brw(big)]
#[derive(Debug, Clone)]
pub struct DOLHeader {
    pub text_off: [u32; 7],
    pub data_off: [u32; 11],
    pub text_addr: [u32; 7],
    pub data_addr: [u32; 11],
    pub text_sizes: [u32; 7],
    pub data_sizes: [u32; 11],
    pub bss_addr: u32,
    pub bss_size: u32,
    pub entry_point: u32,
    pub padding: [u8; 0x1c],
}

//------------------------------------------------------------------------------
// FST entries (spec.md 3 + 6)

#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy)]
pub struct FstEntryRaw {
    pub flags_and_name_off: u32,
    pub data_off_or_parent: u32,
    pub size_or_next: u32,
}

impl FstEntryRaw {
    pub fn is_dir(&self) -> bool {
        self.flags_and_name_off & 0xff00_0000 != 0
    }

    pub fn name_off(&self) -> u32 {
        self.flags_and_name_off & 0x00ff_ffff
    }

    pub fn pack(is_dir: bool, name_off: u32, second: u32, third: u32) -> Self {
        let flag = if is_dir { 0x0100_0000 } else { 0 };
        FstEntryRaw {
            flags_and_name_off: flag | (name_off & 0x00ff_ffff),
            data_off_or_parent: second,
            size_or_next: third,
        }
    }
}
