//! C11: cross-checks C3/C4/C7 by recomputing the hash tree that C5/C6
//! normally trust (spec.md 4.10).

use std::io::{Read, Seek, SeekFrom};

use sha1::{Digest, Sha1};

use crate::{
    disc::Disc,
    error::{CoreError, HashLevel, HashLocation, Result},
    partition_rw::PartitionReader,
    reader::WiiIsoReader,
    reader_writer::{decrypt_verify_group, VerificationError},
    structs::WiiPartTableEntry,
    wbfs::{CheckReport, RepairOptions, WbfsFile},
    GROUP_DATA_SIZE, GROUP_SIZE,
};

/// One hash-tree mismatch found while re-verifying a partition.
#[derive(Debug, Clone)]
pub struct VerifyMismatch {
    pub level: HashLevel,
    pub group: u64,
    pub detail: String,
}

/// Result of [`verify_partition`] for a single partition (spec.md 4.10).
#[derive(Debug, Clone, Default)]
pub struct PartitionVerifyReport {
    pub groups_checked: u64,
    pub mismatches: Vec<VerifyMismatch>,
    pub h4_ok: bool,
}

impl PartitionVerifyReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty() && self.h4_ok
    }
}

fn classify(err: VerificationError) -> (HashLevel, String) {
    match err {
        VerificationError::H3Invalid => (HashLevel::H3, err.to_string()),
        VerificationError::H2Invalid(i) => (HashLevel::H2, format!("{err} (sector group {i})")),
        VerificationError::H1Invalid(i) => (HashLevel::H1, format!("{err} (sector {i})")),
        VerificationError::H0Invalid(i) => (HashLevel::H0, format!("{err} (sector {i})")),
    }
}

/// Re-decrypts and re-hashes every used group of one partition, comparing
/// against the H0/H1/H2 rows carried inline, the H3 table, and the TMD's
/// content[0] hash (H4), stopping after `max_err` mismatches (spec.md 4.10).
pub fn verify_partition<RS: Read + Seek>(
    iso_reader: &mut WiiIsoReader<RS>,
    part: &WiiPartTableEntry,
    max_err: usize,
) -> Result<PartitionVerifyReport> {
    let mut part_reader = PartitionReader::open_partition(iso_reader, *part.part_data_off)?;
    let header = part_reader.get_partition_header().clone();
    let tmd = part_reader.read_tmd()?;
    let h3 = part_reader.read_h3()?;

    let expected_h4 = tmd.content.first().map(|c| c.hash).unwrap_or([0u8; 20]);
    let mut hasher = Sha1::new();
    hasher.update(&h3);
    let actual_h4: [u8; 20] = hasher.finalize().into();
    let h4_ok = actual_h4 == expected_h4;

    let max_group = (*header.data_size).div_ceil(GROUP_DATA_SIZE);
    let mut report = PartitionVerifyReport { groups_checked: 0, mismatches: Vec::new(), h4_ok };

    let file = part_reader.raw_file();
    let data_base = part_reader.data_base();
    let mut buffer = vec![0u8; GROUP_SIZE as usize].into_boxed_slice();
    let buffer: &mut [u8; GROUP_SIZE as usize] = (&mut *buffer).try_into().unwrap();

    for group in 0..max_group {
        if report.mismatches.len() >= max_err {
            break;
        }
        file.seek(SeekFrom::Start(data_base + group * GROUP_SIZE))?;
        file.read_exact(buffer)?;
        let h3_ref: &[u8; 20] = h3[group as usize * 20..][..20].try_into().unwrap();
        if let Err(e) = decrypt_verify_group(buffer, h3_ref, &header.ticket.title_key) {
            let (level, detail) = classify(e);
            report.mismatches.push(VerifyMismatch { level, group, detail });
        }
        report.groups_checked += 1;
    }
    Ok(report)
}

/// Turns a single partition mismatch into the closed [`CoreError`] taxonomy,
/// for callers that want fail-fast rather than a full report.
pub fn first_mismatch_as_error(partition: usize, report: &PartitionVerifyReport) -> Option<CoreError> {
    report.mismatches.first().map(|m| CoreError::IntegrityFailed {
        which: m.level,
        at: HashLocation { partition, group: m.group, sector: 0, index: 0 },
    })
}

/// Verifies every Wii partition of `disc`, stopping each partition's report
/// after `max_err` mismatches (spec.md 4.10 "VerifyDisc").
pub fn verify_disc<RS: Read + Seek>(disc: &mut Disc<RS>, max_err: usize) -> Result<Vec<PartitionVerifyReport>> {
    let Disc::Wii(reader) = disc else {
        return Err(CoreError::Unsupported { what: "VerifyDisc on a non-Wii disc".into() });
    };
    let parts = reader.partitions().to_vec();
    let mut reports = Vec::with_capacity(parts.len());
    for part in &parts {
        reports.push(verify_partition(reader, part, max_err)?);
    }
    Ok(reports)
}

/// `CheckWBFS`: delegates straight to the container's own check/repair
/// (spec.md 4.10 "For WBFS: as in 4.5").
pub fn check_wbfs<RS: Read + Seek>(wbfs: &mut WbfsFile<RS>) -> Result<CheckReport> {
    wbfs.check()
}

pub fn repair_wbfs<RS: Read + Seek + std::io::Write>(
    wbfs: &mut WbfsFile<RS>,
    report: &CheckReport,
    opts: &RepairOptions,
) -> Result<()> {
    wbfs.repair(report, opts)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clean_report_has_no_mismatches() {
        let report = PartitionVerifyReport { groups_checked: 4, mismatches: Vec::new(), h4_ok: true };
        assert!(report.is_clean());
    }

    #[test]
    fn h4_mismatch_alone_is_not_clean() {
        let report = PartitionVerifyReport { groups_checked: 1, mismatches: Vec::new(), h4_ok: false };
        assert!(!report.is_clean());
    }

    #[test]
    fn first_mismatch_maps_to_integrity_failed() {
        let report = PartitionVerifyReport {
            groups_checked: 1,
            mismatches: vec![VerifyMismatch { level: HashLevel::H0, group: 3, detail: "x".into() }],
            h4_ok: true,
        };
        match first_mismatch_as_error(0, &report) {
            Some(CoreError::IntegrityFailed { which: HashLevel::H0, at }) => assert_eq!(at.group, 3),
            other => panic!("unexpected {other:?}"),
        }
    }
}
