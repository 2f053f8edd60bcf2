use std::path::PathBuf;

/// The hash tree level a verification failure was found at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashLevel {
    H0,
    H1,
    H2,
    H3,
    H4,
    TicketSig,
    TmdSig,
    Cert,
}

impl std::fmt::Display for HashLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HashLevel::H0 => "H0",
            HashLevel::H1 => "H1",
            HashLevel::H2 => "H2",
            HashLevel::H3 => "H3",
            HashLevel::H4 => "H4",
            HashLevel::TicketSig => "ticket_sig",
            HashLevel::TmdSig => "tmd_sig",
            HashLevel::Cert => "cert",
        };
        f.write_str(s)
    }
}

/// Location of a hash-tree mismatch, for error reporting and for the `long`
/// verbose mode described in spec.md 7.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashLocation {
    pub partition: usize,
    pub group: u64,
    pub sector: u8,
    pub index: u8,
}

/// The closed set of error kinds from spec.md 7.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("not a recognized disc/container format")]
    BadFormat,

    #[error("source is truncated below the minimum size for its format")]
    TooSmall,

    #[error("integrity check failed ({which} at {at:?})")]
    IntegrityFailed { which: HashLevel, at: HashLocation },

    #[error("invalid layout: {reason}")]
    InvalidLayout { reason: String },

    #[error("WBFS is full, no free blocks available")]
    WbfsFull,

    #[error("no disc in WBFS slot {0}")]
    SlotNotFound(u32),

    #[error("WBFS slot {0} is already occupied")]
    SlotOccupied(u32),

    #[error("operation requires an encrypted partition")]
    NotEncrypted,

    #[error("operation requires a decrypted partition")]
    NotDecrypted,

    #[error("I/O error at {at}: {cause}")]
    IoError {
        at: String,
        #[source]
        cause: std::io::Error,
    },

    #[error("operation was interrupted")]
    Interrupted,

    #[error("unsupported: {what}")]
    Unsupported { what: String },

    #[error("fake-sign brute force exhausted its iteration bound")]
    SignFailed,

    #[error("path not found: {0}")]
    NotFound(PathBuf),

    #[error("binrw error: {0}")]
    BinRw(#[from] binrw::Error),
}

impl From<std::io::Error> for CoreError {
    fn from(cause: std::io::Error) -> Self {
        CoreError::IoError { at: String::new(), cause }
    }
}

/// Adds a location to an [`std::io::Error`] the way [`CoreError::IoError`]
/// expects it, mirroring the teacher's `MyError`/`PartitionAddError` style of
/// tagging errors at the point they are raised rather than where they
/// eventually get printed.
pub trait IoContext<T> {
    fn ctx(self, at: impl Into<String>) -> Result<T, CoreError>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn ctx(self, at: impl Into<String>) -> Result<T, CoreError> {
        self.map_err(|cause| CoreError::IoError { at: at.into(), cause })
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
