//! C6: builds a disc from an on-disk directory tree, so that readers see a
//! valid disc image while the source is `files/` plus extracted metadata
//! (spec.md 4.6).
//!
//! The heavy lifting — laying out system files, building `fst.bin`, framing
//! and hashing each group — lives in [`crate::builder`]; this module adds
//! the partition sign-policy normalisation the distillation calls out
//! separately, and generalises the single hardcoded `DATA` partition to
//! whatever partition directories are present.

use std::{
    io::{Read, Seek, Write},
    path::{Path, PathBuf},
};

use binrw::BinReaderExt;

use crate::{
    builder::{try_open_for_composer, DirPartitionBuilder, PartitionAddError, WiiDiscBuilder},
    context::Context,
    dir_reader::{self, BuildDirError},
    structs::{Certificate, DiscHeader, Ticket, WiiPartType, TMD},
};

bitflags::bitflags! {
    /// Partition `encoding` bitmask (spec.md 4.6 "Partition sign policy").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SignPolicy: u8 {
        const SIGN        = 0b0000_0001;
        const ENCRYPT      = 0b0000_0010;
        const HASH         = 0b0000_0100;
        const CLEAR_HASH   = 0b0000_1000;
        const DECRYPT      = 0b0001_0000;
        const NO_SIGN      = 0b0010_0000;
    }
}

impl SignPolicy {
    /// Resolves the bitmask's implications once, so later code can just
    /// check the flags it cares about (spec.md 4.6):
    /// `SIGN ⇒ ENCRYPT ⇒ HASH`, `CLEAR_HASH ⇒ DECRYPT ⇒ NO_SIGN`,
    /// `{SIGN,DECRYPT} ⇒ HASH`, `HASH ⇒ NO_SIGN ∨ SIGN`.
    pub fn normalize(mut self) -> Self {
        if self.contains(Self::SIGN) {
            self |= Self::ENCRYPT;
        }
        if self.contains(Self::ENCRYPT) {
            self |= Self::HASH;
        }
        if self.contains(Self::CLEAR_HASH) {
            self |= Self::DECRYPT;
        }
        if self.contains(Self::DECRYPT) {
            self |= Self::NO_SIGN | Self::HASH;
        }
        if self.contains(Self::HASH) && !self.contains(Self::SIGN) {
            self |= Self::NO_SIGN;
        }
        self
    }

    pub fn wants_encryption(self) -> bool {
        self.contains(Self::ENCRYPT) && !self.contains(Self::CLEAR_HASH)
    }

    pub fn wants_signature(self) -> bool {
        self.contains(Self::SIGN) && !self.contains(Self::NO_SIGN)
    }
}

impl Default for SignPolicy {
    /// The common case: a normally signed, encrypted, hashed retail
    /// partition.
    fn default() -> Self {
        (SignPolicy::SIGN | SignPolicy::ENCRYPT | SignPolicy::HASH).normalize()
    }
}

/// One partition source directory, named after the partition-table folder
/// convention the teacher's extractor writes (`DATA`, `UPDATE`, `CHANNEL`).
struct PartitionDirSource {
    part_type: WiiPartType,
    dir: PathBuf,
}

fn partition_dirs(root: &Path) -> Vec<PartitionDirSource> {
    [
        ("DATA", WiiPartType::Data),
        ("UPDATE", WiiPartType::Update),
        ("CHANNEL", WiiPartType::Channel),
    ]
    .into_iter()
    .filter_map(|(name, part_type)| {
        let dir = root.join(name);
        dir.is_dir().then_some(PartitionDirSource { part_type, dir })
    })
    .collect()
}

type ComposeError = PartitionAddError<BuildDirError>;

/// Composes every partition directory under `root` (spec.md 4.6 "layout
/// pass" 1-5), applying `policy` to decide whether the TMD is left
/// fake-signed/unencrypted (matching what `disable_disc_enc`/
/// `disable_hash_verification` already told the header) or a fully signed
/// retail-style partition.
pub fn compose_directory_tree<WS: Write + Seek + Read>(
    root: &Path,
    dest: &mut WS,
    policy: SignPolicy,
    ctx: &Context,
) -> Result<(), ComposeError> {
    let policy = policy.normalize();
    let sources = partition_dirs(root);
    if sources.is_empty() {
        return Err(PartitionAddError::Custom(BuildDirError::NotFound(root.to_path_buf())));
    }

    let mut disc_header = {
        let mut path = sources[0].dir.clone();
        path.push("sys");
        path.push("boot.bin");
        try_open_for_composer(path)?.read_be::<DiscHeader>()?
    };
    disc_header.disable_disc_enc = (!policy.wants_encryption()) as u8;
    disc_header.disable_hash_verification = (!policy.contains(SignPolicy::HASH)) as u8;

    let region = {
        let mut path = root.to_owned();
        path.push("disc");
        path.push("region.bin");
        let mut f = try_open_for_composer(path)?;
        let mut region = [0u8; 32];
        f.read_exact(&mut region)?;
        region
    };

    let mut builder = WiiDiscBuilder::create(dest, disc_header, region);
    for source in sources {
        let ticket = {
            let mut path = source.dir.clone();
            path.push("ticket.bin");
            try_open_for_composer(path)?.read_be::<Ticket>()?
        };
        let mut tmd = {
            let mut path = source.dir.clone();
            path.push("tmd.bin");
            try_open_for_composer(path)?.read_be::<TMD>()?
        };
        if !policy.wants_signature() {
            tmd.mark_not_encrypted();
        }
        let cert_chain = {
            let mut path = source.dir.clone();
            path.push("cert.bin");
            try_open_for_composer(path)?.read_be::<[Certificate; 3]>()?
        };
        let mut files_dir = source.dir.clone();
        files_dir.push("files");
        let fst = dir_reader::build_fst_from_directory_tree(&files_dir).map_err(PartitionAddError::Custom)?;
        let mut dir_builder = DirPartitionBuilder::new(source.dir.clone(), fst);
        builder.add_partition(
            source.part_type,
            ticket,
            tmd,
            cert_chain,
            &mut dir_builder,
            ctx.fake_sign_iteration_bound,
        )?;
    }
    builder.finish()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_implies_encrypt_and_hash() {
        let p = SignPolicy::SIGN.normalize();
        assert!(p.contains(SignPolicy::ENCRYPT));
        assert!(p.contains(SignPolicy::HASH));
        assert!(p.wants_signature());
    }

    #[test]
    fn clear_hash_implies_decrypt_and_no_sign() {
        let p = SignPolicy::CLEAR_HASH.normalize();
        assert!(p.contains(SignPolicy::DECRYPT));
        assert!(p.contains(SignPolicy::NO_SIGN));
        assert!(!p.wants_signature());
        assert!(!p.wants_encryption());
    }

    #[test]
    fn default_policy_signs_and_encrypts() {
        let p = SignPolicy::default();
        assert!(p.wants_signature());
        assert!(p.wants_encryption());
    }
}
