//! Read, verify, patch, and rebuild Wii/GameCube optical disc images and the
//! WBFS multi-disc container format.
//!
//! The crate is organized in layers: [`structs`] and [`crypto`] model the
//! on-disk bytes and the AES/SHA-1 primitives that protect them;
//! [`reader_writer`] and [`reader`]/[`partition_rw`] implement the
//! hashed-sector engine for a single partition; [`disc`] ties partitions
//! into a whole disc; [`wbfs`] implements the block container that stores
//! many discs in one file; [`facade`] and [`fuse_view`] expose both as
//! uniform byte- and tree-shaped views.

pub mod builder;
pub mod checker;
pub mod ciso;
pub mod composer;
pub mod context;
pub mod crypto;
pub mod dir_reader;
pub mod disc;
pub mod error;
pub mod facade;
pub mod fst;
#[cfg(feature = "fuse")]
pub mod fuse_fs;
pub mod fuse_view;
pub mod memmap;
pub mod partition_rw;
pub mod reader;
pub mod reader_writer;
pub mod structs;
pub mod wbfs;
pub mod window;

pub use error::{CoreError, Result};
pub use fst::{Fst, FstNode, FstToBytes};
pub use reader::WiiIsoReader;
pub use window::IOWindow;

/// Size of one hashed Wii sector on disc, including its hash area
/// (spec.md 3 "Partition").
pub const BLOCK_SIZE: u64 = 0x8000;
/// Offset of the payload bytes within a hashed sector, after the 0x400-byte
/// H0/H1/H2 hash area.
pub const BLOCK_DATA_OFFSET: u64 = 0x400;
/// Usable payload bytes per hashed sector.
pub const BLOCK_DATA_SIZE: u64 = BLOCK_SIZE - BLOCK_DATA_OFFSET;
/// Number of hashed sectors in one hash-tree group (spec.md 3 "HashTree").
pub const SECTORS_PER_GROUP: u64 = 64;
/// Size on disc of one hash-tree group, sectors included.
pub const GROUP_SIZE: u64 = BLOCK_SIZE * SECTORS_PER_GROUP;
/// Usable payload bytes per hash-tree group.
pub const GROUP_DATA_SIZE: u64 = BLOCK_DATA_SIZE * SECTORS_PER_GROUP;

/// Sector size used by the WBFS block container's own addressing, distinct
/// from the Wii hashed-sector size above (spec.md 3 "Block").
pub const WBFS_HD_SECTOR_SIZE: u64 = 0x200;
/// Size in bytes of a CISO/WBFS-style "good dump" Wii disc image.
pub const WII_DISC_SIZE: u64 = 0x118_240_000;
/// Size in bytes of a single-layer GameCube disc image.
pub const GC_DISC_SIZE: u64 = 0x57058000;
