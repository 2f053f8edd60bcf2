//! Report and repair-options types for `WbfsFile::check`/`repair`
//! (spec.md 4.5).

#[derive(Debug, Clone, Default)]
pub struct SlotIssue {
    pub block: u32,
    pub slots: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub overlaps: Vec<SlotIssue>,
    pub orphan_blocks: Vec<u32>,
    pub lost_blocks: Vec<(u32, u32)>,
    pub invalid_slots: Vec<u32>,
    pub empty_slots: Vec<u32>,
    /// Set when the container uses the legacy v0 free-block rounding
    /// (spec.md 9 Open Questions); detection only, no automatic repair.
    pub legacy_v0: bool,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.overlaps.is_empty()
            && self.orphan_blocks.is_empty()
            && self.lost_blocks.is_empty()
            && self.invalid_slots.is_empty()
            && self.empty_slots.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RepairOptions {
    pub rm_invalid: bool,
    pub rm_overlap: bool,
    pub rm_free: bool,
    pub rm_empty: bool,
    pub rebuild_fbt: bool,
    pub refresh_inodes: bool,
    /// Remove slots that were written under the legacy v0 rounding; the
    /// default conservatively leaves them in place (spec.md 9).
    pub rm_legacy_v0: bool,
}

impl RepairOptions {
    pub fn all() -> Self {
        RepairOptions {
            rm_invalid: true,
            rm_overlap: true,
            rm_free: true,
            rm_empty: true,
            rebuild_fbt: true,
            refresh_inodes: true,
            rm_legacy_v0: false,
        }
    }
}
