//! Ambient configuration passed explicitly into entry points instead of
//! living in global mutable tables (spec.md 9 "Global mutable tables").

use std::{env, path::PathBuf};

/// WBFS free-block allocation policy (spec.md 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocPolicy {
    /// `AVOID_FRAG` on block devices, `FIRST` on regular files; resolved by
    /// the caller at open time since only it knows what kind of file this is.
    #[default]
    Auto,
    First,
    AvoidFrag,
}

impl AllocPolicy {
    /// Resolves `Auto` the way `wbfs-interface.c`'s `OpenParWBFS` does:
    /// regular files default to `First` (better for the sparse case),
    /// anything else (block devices) keeps `AvoidFrag`.
    pub fn resolve(self, is_regular_file: bool) -> AllocPolicy {
        match self {
            AllocPolicy::Auto if is_regular_file => AllocPolicy::First,
            AllocPolicy::Auto => AllocPolicy::AvoidFrag,
            other => other,
        }
    }
}

/// `CHUNK_MODE` for CISO block sizing (spec.md 4.8, 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkMode {
    Iso,
    #[default]
    Pow2,
    Size32Kib,
    Any,
}

#[derive(Debug, Clone)]
pub struct Context {
    pub alloc_policy: AllocPolicy,
    /// Perform full RSA verification on ticket/TMD signatures rather than
    /// only checking fake-sign markers (spec.md 4.1 "optional").
    pub strict_verify: bool,
    /// Upper bound on `fake_sign`'s brute-force loop (spec.md 4.2, 9).
    pub fake_sign_iteration_bound: u64,
    pub chunk_mode: ChunkMode,
    /// Candidate WBFS search paths, from `DISCIMG_WBFS_PATH` (spec.md 6).
    pub wbfs_search_path: Vec<PathBuf>,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            alloc_policy: AllocPolicy::default(),
            strict_verify: false,
            fake_sign_iteration_bound: 1 << 20,
            chunk_mode: ChunkMode::default(),
            wbfs_search_path: Vec::new(),
        }
    }
}

impl Context {
    pub const WBFS_PATH_ENV: &'static str = "DISCIMG_WBFS_PATH";

    /// Builds a [`Context`] with `wbfs_search_path` populated from
    /// [`Self::WBFS_PATH_ENV`] if it is set, otherwise defaults.
    pub fn from_env() -> Self {
        let mut ctx = Context::default();
        if let Ok(raw) = env::var(Self::WBFS_PATH_ENV) {
            ctx.wbfs_search_path = raw.split(';').filter(|s| !s.is_empty()).map(PathBuf::from).collect();
        }
        ctx
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn auto_resolves_by_file_kind() {
        assert_eq!(AllocPolicy::Auto.resolve(true), AllocPolicy::First);
        assert_eq!(AllocPolicy::Auto.resolve(false), AllocPolicy::AvoidFrag);
        assert_eq!(AllocPolicy::First.resolve(false), AllocPolicy::First);
    }

    #[test]
    fn wbfs_path_env_is_semicolon_split() {
        std::env::set_var(Context::WBFS_PATH_ENV, "/mnt/a;/mnt/b");
        let ctx = Context::from_env();
        assert_eq!(ctx.wbfs_search_path, vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/b")]);
        std::env::remove_var(Context::WBFS_PATH_ENV);
    }
}
