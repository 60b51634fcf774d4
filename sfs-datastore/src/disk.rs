//! Disk model: one entry of the hdd configuration file.
//!
//! A `Disk` pairs a metadata directory with a data directory (possibly the
//! same), owns the chunks stored there and carries the runtime state the
//! supervisor, scanner, tester and placement logic operate on. The actual
//! file I/O goes through the [`DiskBackend`] capability trait so alternate
//! back-ends (e.g. zoned devices) can plug in; the conventional back-end
//! lives in [`crate::cmr_disk`].

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Error};
use nix::errno::Errno;
use parking_lot::Mutex;
use rand::Rng;

use crate::chunk::{Chunk, ChunkIo};
use crate::disk_chunks::DiskChunks;
use crate::error::ChunkOpError;
use crate::hdd_cfg::DiskCfgLine;
use crate::stats::DiskStats;

pub const LAST_ERROR_SIZE: usize = 100;

/// More than this many EIO/EROFS errors within [`LAST_ERROR_TIME_SECS`] marks
/// the disk damaged.
pub const ERROR_LIMIT: usize = 2;
pub const LAST_ERROR_TIME_SECS: i64 = 60;

pub const DEFAULT_OPEN_MODE: u32 = 0o666;

pub fn wall_clock_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanState {
    /// Scanning is scheduled, the thread is not running yet.
    Needed,
    /// Scan thread is running.
    InProgress,
    /// Scan thread should stop as soon as possible.
    Terminate,
    /// Scan thread finished and can be joined.
    ThreadFinished,
    /// The disk content must be resent to the master (after a reload).
    SendNeeded,
    /// Scan complete, the disk is usable.
    Working,
}

#[derive(Clone, Copy, Debug)]
pub struct DiskState {
    pub is_damaged: bool,
    pub is_read_only: bool,
    pub is_marked_for_removal: bool,
    pub was_removed_from_config: bool,
    pub scan_state: ScanState,
    pub scan_progress: u8,
    pub total_space: u64,
    pub available_space: u64,
    pub leave_free_space: u64,
    /// Placement weight, see `DiskManager::get_disk_for_new_chunk`.
    pub carry: f64,
    pub last_refresh: i64,
}

impl DiskState {
    /// Disks are presented to the master as marked for deletion when they are
    /// explicitly marked for removal or sit on a read-only file system.
    pub fn is_marked_for_deletion(&self) -> bool {
        self.is_marked_for_removal || self.is_read_only
    }

    pub fn is_selectable_for_new_chunk(&self) -> bool {
        !self.is_damaged
            && !self.is_marked_for_deletion()
            && self.total_space != 0
            && self.available_space != 0
            && self.scan_state == ScanState::Working
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IoError {
    pub chunk_id: u64,
    pub errno: i32,
    pub timestamp: i64,
}

pub struct IoErrorRing {
    entries: [IoError; LAST_ERROR_SIZE],
    next: usize,
}

impl Default for IoErrorRing {
    fn default() -> Self {
        Self {
            entries: [IoError::default(); LAST_ERROR_SIZE],
            next: 0,
        }
    }
}

impl IoErrorRing {
    pub fn push(&mut self, chunk_id: u64, errno: i32) {
        self.entries[self.next] = IoError {
            chunk_id,
            errno,
            timestamp: wall_clock_secs(),
        };
        self.next = (self.next + 1) % LAST_ERROR_SIZE;
    }

    pub fn last(&self) -> IoError {
        self.entries[(self.next + LAST_ERROR_SIZE - 1) % LAST_ERROR_SIZE]
    }

    /// Number of EIO/EROFS errors younger than [`LAST_ERROR_TIME_SECS`].
    pub fn recent_serious_errors(&self, now: i64) -> usize {
        self.entries
            .iter()
            .filter(|error| {
                error.timestamp + LAST_ERROR_TIME_SECS >= now
                    && (error.errno == libc::EIO || error.errno == libc::EROFS)
            })
            .count()
    }
}

/// Advisory lock file guarding a disk directory against concurrent processes.
/// The `(dev, ino)` pair detects two configuration lines pointing at the same
/// file system.
pub struct LockFile {
    _file: File,
    pub dev: u64,
    pub ino: u64,
}

#[derive(Default)]
pub struct LockFiles {
    pub meta: Option<LockFile>,
    pub data: Option<LockFile>,
}

/// Runtime knobs the write path needs from the engine configuration. The
/// supplied-CRC payload check happens in the operation layer; a `Crc` error
/// escaping a back-end therefore always means on-disk damage.
#[derive(Clone, Copy, Debug)]
pub struct WriteOptions {
    pub punch_holes: bool,
}

/// Capability set every disk back-end must provide, plus the block-level
/// write algorithm which a back-end may override (zoned devices cannot
/// overwrite in place and must replay whole blocks).
pub trait DiskBackend: Send + Sync {
    /// Creates both chunk files, truncating any previous content, and stores
    /// the descriptors in `io`.
    fn create_chunk_files(&self, chunk: &Chunk, io: &mut ChunkIo) -> Result<(), Errno>;

    /// Opens both existing chunk files and stores the descriptors in `io`.
    fn open_chunk_files(&self, chunk: &Chunk, io: &mut ChunkIo) -> Result<(), Errno>;

    /// Unlinks both chunk files.
    fn unlink_chunk(&self, io: &ChunkIo) -> Result<(), Errno>;

    fn fsync_chunk(&self, chunk: &Chunk, io: &ChunkIo) -> Result<(), ChunkOpError>;

    fn ftruncate_data(&self, io: &ChunkIo, size: u64) -> Result<(), Errno>;

    /// Reads exactly `buf.len()` bytes of chunk data at `offset`.
    fn pread_data(&self, chunk: &Chunk, io: &ChunkIo, buf: &mut [u8], offset: i64)
        -> Result<usize, Errno>;

    /// Writes raw chunk data; conventional disks honour `offset`, zoned
    /// back-ends append at their write head.
    fn write_chunk_data(
        &self,
        chunk: &Chunk,
        io: &ChunkIo,
        buf: &[u8],
        offset: i64,
    ) -> Result<usize, Errno>;

    /// Read-ahead hint covering `block_count` blocks from `first_block`.
    fn prefetch_chunk_blocks(&self, chunk: &Chunk, io: &ChunkIo, first_block: u16, block_count: u32);

    /// Copies the stored CRC of `block` into `out[..4]` and reads the block
    /// data into `out[4..]`. `out` must hold [`crate::HDD_BLOCK_SIZE`] bytes.
    fn read_block_and_crc(
        &self,
        chunk: &Chunk,
        io: &ChunkIo,
        crc_data: &[u8],
        block: u16,
        out: &mut [u8],
    ) -> Result<usize, ChunkOpError>;

    /// Rewrites the 4-byte version inside the signature, updates the chunk
    /// version and regenerates the filenames.
    fn overwrite_chunk_version(
        &self,
        chunk: &Chunk,
        io: &mut ChunkIo,
        new_version: u32,
    ) -> Result<(), ChunkOpError>;

    /// Validates the signature (magic, id, version, type) and reads the CRC
    /// block into `crc`.
    fn read_chunk_crc(
        &self,
        chunk: &Chunk,
        io: &ChunkIo,
        expected_version: u32,
        crc: &mut [u8],
    ) -> Result<(), ChunkOpError>;

    /// Writes the serialized header (signature + CRC + padding) at offset 0.
    fn write_chunk_header(&self, chunk: &Chunk, io: &ChunkIo, header: &[u8])
        -> Result<(), ChunkOpError>;

    /// Flushes the in-memory CRC block to the metadata file.
    fn write_crc(&self, chunk: &Chunk, io: &ChunkIo, crc: &[u8]) -> Result<(), Errno>;

    /// Writes `buf` at `block_offset + offset_in_block`, stores `crc_slot`
    /// into the in-memory CRC block, optionally punching holes over all-zero
    /// regions.
    #[allow(clippy::too_many_arguments)]
    fn write_partial_block_and_crc(
        &self,
        chunk: &Chunk,
        io: &ChunkIo,
        buf: &[u8],
        offset_in_block: u32,
        crc_slot: [u8; crate::CRC_SIZE],
        crc_data: &mut [u8],
        block: u16,
        is_new_block: bool,
        punch_holes: bool,
    ) -> Result<(), ChunkOpError>;

    /// Full write-block semantics: version check, bounds checks, CRC
    /// splicing for partial writes, block-count growth.
    #[allow(clippy::too_many_arguments)]
    fn write_chunk_block(
        &self,
        chunk: &Chunk,
        io: &mut ChunkIo,
        version: u32,
        block: u16,
        offset_in_block: u32,
        size: u32,
        crc: u32,
        crc_data: &mut [u8],
        buf: &[u8],
        opts: &WriteOptions,
    ) -> Result<(), ChunkOpError>;
}

pub struct Disk {
    meta_path: PathBuf,
    data_path: PathBuf,
    is_zoned: bool,
    backend: Box<dyn DiskBackend>,
    pub state: Mutex<DiskState>,
    pub chunks: Mutex<DiskChunks>,
    pub stats: DiskStats,
    pub last_errors: Mutex<IoErrorRing>,
    pub need_refresh: AtomicBool,
    pub lock_files: Mutex<LockFiles>,
    pub scan_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Disk {
    pub fn new(cfg: &DiskCfgLine, leave_free_space: u64) -> Result<Self, Error> {
        if cfg.is_zoned {
            bail!(
                "no zoned back-end available for disk {}",
                cfg.description()
            );
        }

        Ok(Self {
            meta_path: cfg.meta_path.clone(),
            data_path: cfg.data_path.clone(),
            is_zoned: false,
            backend: Box::new(crate::cmr_disk::CmrDisk),
            state: Mutex::new(DiskState {
                is_damaged: false,
                is_read_only: false,
                is_marked_for_removal: cfg.is_marked_for_removal,
                was_removed_from_config: false,
                scan_state: ScanState::Needed,
                scan_progress: 0,
                total_space: 0,
                available_space: 0,
                leave_free_space,
                carry: rand::thread_rng().gen::<f64>(),
                last_refresh: 0,
            }),
            chunks: Mutex::new(DiskChunks::new()),
            stats: DiskStats::default(),
            last_errors: Mutex::new(IoErrorRing::default()),
            need_refresh: AtomicBool::new(false),
            lock_files: Mutex::new(LockFiles::default()),
            scan_thread: Mutex::new(None),
        })
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn is_zoned_device(&self) -> bool {
        self.is_zoned
    }

    pub fn backend(&self) -> &dyn DiskBackend {
        self.backend.as_ref()
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.state.lock().is_marked_for_deletion()
    }

    /// `[*]metaPath[ | dataPath]` for logs and master reports.
    pub fn description(&self) -> String {
        let state = self.state.lock();
        let mut result = String::new();
        if state.is_marked_for_removal {
            result.push('*');
        }
        result.push_str(&self.meta_path.to_string_lossy());
        if self.data_path != self.meta_path {
            result.push_str(" | ");
            result.push_str(&self.data_path.to_string_lossy());
        }
        result
    }

    /// Creates the directory skeleton (`chunks00` .. `chunksFF`) under both
    /// roots. Existing directories are fine; anything else is reported by the
    /// lock file step that follows.
    pub fn create_paths_and_subfolders(&self) {
        if self.is_marked_for_deletion() {
            return;
        }

        let mut all_created = true;
        let mut roots = vec![self.meta_path.clone()];
        if self.data_path != self.meta_path {
            roots.push(self.data_path.clone());
        }

        for root in &roots {
            all_created &= std::fs::create_dir_all(root).is_ok();
            for subfolder in 0..crate::chunk_filename::NUMBER_OF_SUBFOLDERS {
                let path = root.join(crate::chunk_filename::subfolder_name(subfolder as u8));
                all_created &= match std::fs::create_dir(&path) {
                    Ok(()) => true,
                    Err(err) => err.kind() == std::io::ErrorKind::AlreadyExists,
                };
            }
        }

        if all_created {
            log::info!(
                "folder structure for disk {} is in place",
                self.description()
            );
        }
    }

    /// Creates the `.lock` files for the metadata and data roots and checks
    /// for lock collisions with the other configured disks.
    pub fn create_lock_files(&self, is_lock_needed: bool, all_disks: &[Arc<Disk>]) -> Result<(), Error> {
        self.create_lock_file(is_lock_needed, true, all_disks)?;
        if self.meta_path != self.data_path {
            self.create_lock_file(is_lock_needed, false, all_disks)?;
        }
        Ok(())
    }

    fn create_lock_file(
        &self,
        is_lock_needed: bool,
        is_for_metadata: bool,
        all_disks: &[Arc<Disk>],
    ) -> Result<(), Error> {
        let root = if is_for_metadata {
            &self.meta_path
        } else {
            &self.data_path
        };
        let lock_path = root.join(".lock");

        use std::os::unix::fs::OpenOptionsExt;
        let opened = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o640)
            .open(&lock_path);

        if let Err(err) = &opened {
            if err.raw_os_error() == Some(libc::EROFS) {
                self.state.lock().is_read_only = true;
            }
        }

        // The read-only flag persists across the meta and data roots: once
        // one of them sits on a read-only file system, the other root of a
        // disk being drained skips locking as well.
        {
            let state = self.state.lock();
            if state.is_read_only && state.is_marked_for_removal {
                // A read-only file system is acceptable while the disk is
                // being drained.
                return Ok(());
            }
        }

        let file = match opened {
            Ok(file) => file,
            Err(err) => {
                log::warn!(
                    "can't create lock file {}, marking disk as damaged: {err}",
                    lock_path.display()
                );
                self.state.lock().is_damaged = true;
                return Ok(());
            }
        };

        if is_lock_needed {
            if let Err(errno) = try_write_lock(file.as_raw_fd()) {
                if errno == Errno::EAGAIN || errno == Errno::EACCES {
                    bail!(
                        "disk {} already locked by another process",
                        self.meta_path.display()
                    );
                }
                log::warn!(
                    "locking {} failed, marking disk as damaged: {errno}",
                    lock_path.display()
                );
                self.state.lock().is_damaged = true;
                return Ok(());
            }
        }

        let stat = match nix::sys::stat::fstat(file.as_raw_fd()) {
            Ok(stat) => stat,
            Err(errno) => {
                log::warn!(
                    "fstat({}) failed, marking disk as damaged: {errno}",
                    lock_path.display()
                );
                self.state.lock().is_damaged = true;
                return Ok(());
            }
        };
        let dev = stat.st_dev as u64;
        let ino = stat.st_ino as u64;

        if is_lock_needed {
            for other in all_disks {
                if std::ptr::eq(other.as_ref(), self) {
                    continue;
                }
                let other_locks = other.lock_files.lock();
                let other_lock = if is_for_metadata {
                    other_locks.meta.as_ref()
                } else {
                    other_locks.data.as_ref()
                };
                let Some(other_lock) = other_lock else {
                    continue;
                };
                if other_lock.dev != dev {
                    continue;
                }
                if other_lock.ino == ino {
                    bail!(
                        "{} disks '{}' and '{}' have the same lockfile",
                        if is_for_metadata { "metadata" } else { "data" },
                        self.meta_path.display(),
                        other.meta_path.display()
                    );
                }
                if !is_for_metadata {
                    // Sharing a device between metadata directories is fine
                    // (typically one NVMe), for data directories it degrades
                    // everything placed there.
                    log::warn!(
                        "data disks '{}' and '{}' are on the same physical device",
                        self.data_path.display(),
                        other.data_path.display()
                    );
                }
            }
        }

        if !self.state.lock().is_damaged {
            let lock = LockFile {
                _file: file,
                dev,
                ino,
            };
            let mut locks = self.lock_files.lock();
            if is_for_metadata {
                locks.meta = Some(lock);
            } else {
                locks.data = Some(lock);
            }
        }

        Ok(())
    }

    /// Refreshes the free/total space from the data file system, reserving
    /// the configured leave-free amount.
    pub fn refresh_data_disk_usage(&self) {
        let stats = match nix::sys::statvfs::statvfs(&self.data_path) {
            Ok(stats) => stats,
            Err(_) => {
                let mut state = self.state.lock();
                state.available_space = 0;
                state.total_space = 0;
                return;
            }
        };

        let fragment = stats.fragment_size() as u64;
        let available = fragment * stats.blocks_available() as u64;
        let total = fragment
            * (stats.blocks() as u64 - (stats.blocks_free() as u64 - stats.blocks_available() as u64));

        let mut state = self.state.lock();
        state.total_space = total;
        state.available_space = available.saturating_sub(state.leave_free_space);
    }

    /// Records an I/O error against this disk's ring buffer.
    pub fn add_io_error(&self, chunk_id: u64, errno: i32) {
        self.last_errors.lock().push(chunk_id, errno);
    }

    /// Stats both chunk files and derives the block count from the data file
    /// size; fails when either file is missing, not regular, or the data
    /// size is not a whole number of blocks.
    pub fn update_chunk_attributes(&self, chunk: &Chunk, io: &ChunkIo) -> Result<(), ChunkOpError> {
        let meta = nix::sys::stat::stat(&io.meta_filename).map_err(|_| ChunkOpError::NoChunk)?;
        if (meta.st_mode & libc::S_IFMT) != libc::S_IFREG {
            return Err(ChunkOpError::NoChunk);
        }

        let data = nix::sys::stat::stat(&io.data_filename).map_err(|_| ChunkOpError::NoChunk)?;
        if (data.st_mode & libc::S_IFMT) != libc::S_IFREG {
            return Err(ChunkOpError::NoChunk);
        }
        let size = data.st_size as u64;
        if !chunk.is_data_file_size_valid(size) {
            return Err(ChunkOpError::NoChunk);
        }

        chunk.set_block_count_from_data_file_size(size);
        Ok(())
    }
}

fn try_write_lock(fd: RawFd) -> Result<(), Errno> {
    let op = libc::flock {
        l_type: libc::F_WRLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETLK(&op)).map(|_| ())
}

/// Reads the whole hdd configuration file into parsed lines.
pub fn read_hdd_cfg(path: &Path) -> Result<Vec<DiskCfgLine>, Error> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("can't open hdd config file {}", path.display()))?;

    let mut lines = Vec::new();
    for line in content.lines() {
        if let Some(parsed) = crate::hdd_cfg::parse_hdd_cfg_line(line)? {
            lines.push(parsed);
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_ring_counts_recent_serious_errors() {
        let mut ring = IoErrorRing::default();
        ring.push(1, libc::EIO);
        ring.push(2, libc::ENOENT);
        ring.push(3, libc::EROFS);
        let now = wall_clock_secs();
        assert_eq!(ring.recent_serious_errors(now), 2);
        assert_eq!(ring.last().chunk_id, 3);
    }

    #[test]
    fn selectability() {
        let state = DiskState {
            is_damaged: false,
            is_read_only: false,
            is_marked_for_removal: false,
            was_removed_from_config: false,
            scan_state: ScanState::Working,
            scan_progress: 100,
            total_space: 100,
            available_space: 10,
            leave_free_space: 0,
            carry: 0.0,
            last_refresh: 0,
        };
        assert!(state.is_selectable_for_new_chunk());

        let mut damaged = DiskState { is_damaged: true, ..state };
        assert!(!damaged.is_selectable_for_new_chunk());
        damaged.is_damaged = false;
        damaged.scan_state = ScanState::InProgress;
        assert!(!damaged.is_selectable_for_new_chunk());
        damaged.scan_state = ScanState::Working;
        damaged.is_read_only = true;
        assert!(damaged.is_marked_for_deletion());
        assert!(!damaged.is_selectable_for_new_chunk());
    }
}
