//! On-disk storage engine of the chunk server.
//!
//! Models chunks and disks, enforces the per-chunk locking protocol across a
//! thread pool, implements the chunk I/O primitives, keeps CRC-per-block
//! integrity, runs the background scan and test loops, balances new-chunk
//! placement and caches chunk metadata for fast restarts.

pub mod chunk;
pub mod chunk_filename;
pub mod chunk_signature;
pub mod cmr_disk;
pub mod crc;
pub mod disk;
pub mod disk_chunks;
pub mod disk_manager;
pub mod engine;
pub mod error;
pub mod hdd_cfg;
pub mod metadata_cache;
pub mod open_chunk_pool;
pub mod ops;
pub mod registry;
pub mod reports;
pub mod scanner;
pub mod stats;
pub mod tester;
pub mod unique_queue;

pub use engine::{HddConfig, HddEngine};
pub use error::ChunkOpError;

pub use sfs_api_types::{ChunkPartType, SFSBLOCKSINCHUNK, SFSBLOCKSIZE, SFSCHUNKSIZE};

/// Size of one stored CRC32 value.
pub const CRC_SIZE: usize = 4;

/// One block of data prefixed by its CRC, as sent to clients.
pub const HDD_BLOCK_SIZE: usize = SFSBLOCKSIZE as usize + CRC_SIZE;

/// Fixed size of the signature block opening every metadata file.
pub const SIGNATURE_BLOCK_SIZE: usize = 1024;

/// Alignment of the data section inside metadata files.
pub const DISK_BLOCK_SIZE: usize = 4096;
