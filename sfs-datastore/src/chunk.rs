//! In-memory chunk descriptor.
//!
//! A chunk part is stored as two files (metadata + data). The descriptor
//! lives in the [`ChunkRegistry`](crate::registry::ChunkRegistry) and is
//! shared between the operation threads, the scanner, the tester and the
//! open-chunk pool, so its fields are split by locking domain:
//!
//! * `sync` — lifecycle state, reference count and the lazily assigned
//!   condition variable slot; the chunk locking protocol lives here.
//! * `io` — filenames, file descriptors and dirty flags; only touched while
//!   the chunk is logically locked (or by the pool sweeper after a
//!   successful try-lock).
//! * `version` / `blocks` / `index_in_disk` — plain atomics so the scanner,
//!   tester and cache writer can snapshot them without taking the I/O lock.

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use sfs_api_types::{ChunkPartType, SFSBLOCKSIZE};

use crate::chunk_filename;
use crate::disk::Disk;
use crate::{CRC_SIZE, DISK_BLOCK_SIZE, SIGNATURE_BLOCK_SIZE};

/// Sentinel for a chunk not (or no longer) present in its disk's collection.
pub const INVALID_INDEX_IN_DISK: usize = usize::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkState {
    /// Released, not used by any thread.
    Available,
    /// Acquired by exactly one thread.
    Locked,
    /// Locked and scheduled for removal; the last releaser performs it.
    ToBeDeleted,
    /// Removed from the registry while threads were still waiting on it.
    Deleted,
}

/// Condition variable with a count of threads waiting on it.
///
/// Slots are handed out from a free list on contention and returned when the
/// chunk is released with no waiters left. The waiter count is only mutated
/// under the owning chunk's `sync` mutex.
pub struct CondVarWithWaiters {
    pub cond: Condvar,
    pub waiters: AtomicU32,
}

impl CondVarWithWaiters {
    pub fn new() -> Self {
        Self {
            cond: Condvar::new(),
            waiters: AtomicU32::new(0),
        }
    }
}

impl Default for CondVarWithWaiters {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ChunkSync {
    pub state: ChunkState,
    pub ref_count: u16,
    pub cond_var: Option<Arc<CondVarWithWaiters>>,
}

/// File-level state, valid while the chunk is logically locked.
pub struct ChunkIo {
    pub meta_filename: PathBuf,
    pub data_filename: PathBuf,
    pub meta_fd: RawFd,
    pub data_fd: RawFd,
    /// CRC block modified in memory but not yet flushed to the metadata file.
    pub was_changed: bool,
    /// Attributes were refreshed from a stat of the files.
    pub valid_attr: bool,
    /// Read-ahead hint: the next block a sequential reader should ask for.
    pub block_expected_next: u16,
}

pub struct Chunk {
    pub id: u64,
    pub ctype: ChunkPartType,
    pub owner: Arc<Disk>,
    version: AtomicU32,
    blocks: AtomicU16,
    pub(crate) index_in_disk: AtomicUsize,
    pub(crate) sync: Mutex<ChunkSync>,
    pub io: Mutex<ChunkIo>,
}

impl Chunk {
    pub fn new(id: u64, ctype: ChunkPartType, owner: Arc<Disk>, state: ChunkState) -> Self {
        Self {
            id,
            ctype,
            owner,
            version: AtomicU32::new(0),
            blocks: AtomicU16::new(0),
            index_in_disk: AtomicUsize::new(INVALID_INDEX_IN_DISK),
            sync: Mutex::new(ChunkSync {
                state,
                ref_count: if state == ChunkState::Locked { 1 } else { 0 },
                cond_var: None,
            }),
            io: Mutex::new(ChunkIo {
                meta_filename: PathBuf::new(),
                data_filename: PathBuf::new(),
                meta_fd: -1,
                data_fd: -1,
                was_changed: false,
                valid_attr: false,
                block_expected_next: 0,
            }),
        }
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::Relaxed);
    }

    pub fn blocks(&self) -> u16 {
        self.blocks.load(Ordering::Relaxed)
    }

    pub fn set_blocks(&self, blocks: u16) {
        self.blocks.store(blocks, Ordering::Relaxed);
    }

    pub fn index_in_disk(&self) -> usize {
        self.index_in_disk.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ChunkState {
        self.sync.lock().state
    }

    pub fn max_blocks_in_file(&self) -> u32 {
        self.ctype.max_blocks_in_file()
    }

    pub fn crc_block_size(&self) -> usize {
        CRC_SIZE * self.max_blocks_in_file() as usize
    }

    /// Offset of the CRC block inside the metadata file.
    pub fn crc_offset(&self) -> i64 {
        SIGNATURE_BLOCK_SIZE as i64
    }

    /// Size of the metadata header: signature + CRC block, padded so the
    /// remainder of the file stays aligned to the disk block size.
    pub fn header_size(&self) -> usize {
        let raw = SIGNATURE_BLOCK_SIZE + self.crc_block_size();
        (raw + DISK_BLOCK_SIZE - 1) / DISK_BLOCK_SIZE * DISK_BLOCK_SIZE
    }

    pub fn block_offset(&self, block: u16) -> i64 {
        i64::from(block) * i64::from(SFSBLOCKSIZE)
    }

    pub fn file_size_from_block_count(&self, blocks: u32) -> u64 {
        u64::from(blocks) * u64::from(SFSBLOCKSIZE)
    }

    pub fn is_data_file_size_valid(&self, file_size: u64) -> bool {
        file_size % u64::from(SFSBLOCKSIZE) == 0
            && file_size / u64::from(SFSBLOCKSIZE) <= u64::from(self.max_blocks_in_file())
    }

    /// Sets the block count from the data file size; the size must have been
    /// validated with [`Self::is_data_file_size_valid`].
    pub fn set_block_count_from_data_file_size(&self, file_size: u64) {
        debug_assert!(self.is_data_file_size_valid(file_size));
        self.set_blocks((file_size / u64::from(SFSBLOCKSIZE)) as u16);
    }

    pub fn generate_filename_for_version(&self, version: u32, is_for_metadata: bool) -> PathBuf {
        let root = if is_for_metadata {
            self.owner.meta_path()
        } else {
            self.owner.data_path()
        };
        chunk_filename::generate(root, self.id, version, self.ctype, is_for_metadata)
    }

    /// The version is part of both filenames, so they must be regenerated
    /// whenever it changes (create, truncate, duplicate, update-version).
    pub fn update_filenames_from_version(&self, io: &mut ChunkIo, version: u32) {
        io.meta_filename = self.generate_filename_for_version(version, true);
        io.data_filename = self.generate_filename_for_version(version, false);
    }

    pub fn description(&self) -> String {
        format!("{:016X}_{:08X} ({})", self.id, self.version(), self.ctype)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disk::Disk;
    use crate::hdd_cfg::DiskCfgLine;

    fn test_disk() -> Arc<Disk> {
        Arc::new(
            Disk::new(
                &DiskCfgLine {
                    meta_path: PathBuf::from("/mnt/meta"),
                    data_path: PathBuf::from("/mnt/data"),
                    is_marked_for_removal: false,
                    is_zoned: false,
                },
                256 << 20,
            )
            .unwrap(),
        )
    }

    #[test]
    fn header_geometry_standard() {
        let chunk = Chunk::new(1, ChunkPartType::standard(), test_disk(), ChunkState::Locked);
        assert_eq!(chunk.crc_block_size(), 4096);
        assert_eq!(chunk.header_size(), 8192);
        assert_eq!(chunk.crc_offset(), 1024);
        assert_eq!(chunk.block_offset(3), 3 * 65536);
    }

    #[test]
    fn header_geometry_ec() {
        let ctype = ChunkPartType::ec(4, 2, 0).unwrap();
        let chunk = Chunk::new(1, ctype, test_disk(), ChunkState::Locked);
        assert_eq!(chunk.max_blocks_in_file(), 256);
        assert_eq!(chunk.crc_block_size(), 1024);
        assert_eq!(chunk.header_size(), 4096);
    }

    #[test]
    fn data_file_size_validation() {
        let chunk = Chunk::new(1, ChunkPartType::standard(), test_disk(), ChunkState::Locked);
        assert!(chunk.is_data_file_size_valid(0));
        assert!(chunk.is_data_file_size_valid(65536 * 10));
        assert!(chunk.is_data_file_size_valid(65536 * 1024));
        assert!(!chunk.is_data_file_size_valid(65536 * 1025));
        assert!(!chunk.is_data_file_size_valid(1234));

        chunk.set_block_count_from_data_file_size(65536 * 10);
        assert_eq!(chunk.blocks(), 10);
    }

    #[test]
    fn filenames_follow_version() {
        let chunk = Chunk::new(
            0x030201,
            ChunkPartType::standard(),
            test_disk(),
            ChunkState::Locked,
        );
        let mut io = chunk.io.lock();
        chunk.update_filenames_from_version(&mut io, 0x1b);
        assert_eq!(
            io.meta_filename,
            PathBuf::from("/mnt/meta/chunks03/chunk_0000000000030201_0000001B.met")
        );
        assert_eq!(
            io.data_filename,
            PathBuf::from("/mnt/data/chunks03/chunk_0000000000030201_0000001B.dat")
        );
    }
}
