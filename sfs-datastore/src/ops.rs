//! Chunk operation layer.
//!
//! Every public operation acquires its chunk through the registry locking
//! protocol and releases it on every exit path (the guard takes care of
//! that). I/O scopes bracket descriptor usage: `io_begin` opens both files
//! (with a short retry ladder) and loads the CRC block into the open-chunk
//! pool; `io_end` flushes a dirty CRC block and optionally fsyncs.

use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;

use sfs_api_types::{
    combine_version_with_todel_flag, ChunkPartType, ChunkWithVersionAndType, SFSBLOCKSINCHUNK,
    SFSBLOCKSIZE, SFSCHUNKSIZE,
};

use crate::chunk::{Chunk, ChunkIo, ChunkState};
use crate::chunk_signature::ChunkSignature;
use crate::crc::{crc32, crc32_zero_expanded, EMPTY_BLOCK_CRC};
use crate::disk::{Disk, WriteOptions};
use crate::engine::HddEngine;
use crate::error::ChunkOpError;
use crate::registry::{ChunkGetMode, ChunkGuard};
use crate::{CRC_SIZE, HDD_BLOCK_SIZE};

const OPEN_RETRY_COUNT: u32 = 4;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(5);

const BLOCK_SIZE: usize = SFSBLOCKSIZE as usize;

thread_local! {
    /// Per-thread scratch for one CRC-prefixed block, so the hot read-modify
    /// and copy paths don't allocate.
    static BLOCK_BUFFER: RefCell<Vec<u8>> = RefCell::new(vec![0u8; HDD_BLOCK_SIZE]);
}

/// Ensures `io_end` runs on every exit path of a multi-step operation.
struct IoScope<'e> {
    engine: &'e HddEngine,
    chunk: Arc<Chunk>,
    armed: bool,
}

impl<'e> IoScope<'e> {
    fn begin(
        engine: &'e HddEngine,
        chunk: &Arc<Chunk>,
        create: bool,
        expected_version: Option<u32>,
    ) -> Result<Self, ChunkOpError> {
        engine.io_begin(chunk, create, expected_version)?;
        Ok(Self {
            engine,
            chunk: chunk.clone(),
            armed: true,
        })
    }

    fn end(mut self) -> Result<(), ChunkOpError> {
        self.armed = false;
        self.engine.io_end(&self.chunk)
    }
}

impl Drop for IoScope<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.engine.io_end(&self.chunk);
        }
    }
}

fn blocks_for_length(length: u32) -> u16 {
    ((length + SFSBLOCKSIZE - 1) / SFSBLOCKSIZE) as u16
}

impl HddEngine {
    fn write_options(&self) -> WriteOptions {
        WriteOptions {
            punch_holes: self.flags.punch_holes(),
        }
    }

    /// Opens both chunk files (retrying briefly) and loads or initializes the
    /// CRC block. Idempotent for already-open chunks; each call opens one
    /// I/O scope that a matching `io_end` closes.
    pub(crate) fn io_begin(
        &self,
        chunk: &Arc<Chunk>,
        create: bool,
        expected_version: Option<u32>,
    ) -> Result<(), ChunkOpError> {
        let mut io = chunk.io.lock();

        if io.meta_fd >= 0 {
            self.open_chunks.acquire(chunk, io.meta_fd, io.data_fd);
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            let opened = if create {
                chunk.owner.backend().create_chunk_files(chunk, &mut io)
            } else {
                chunk.owner.backend().open_chunk_files(chunk, &mut io)
            };
            match opened {
                Ok(()) => break,
                Err(errno) => {
                    attempt += 1;
                    if attempt >= OPEN_RETRY_COUNT {
                        return Err(ChunkOpError::Io(errno));
                    }
                    std::thread::sleep(OPEN_RETRY_DELAY);
                }
            }
        }

        let crc = self.open_chunks.acquire(chunk, io.meta_fd, io.data_fd);
        if create {
            crc.lock().fill(0);
        } else {
            let expected = expected_version.unwrap_or_else(|| chunk.version());
            let mut crc = crc.lock();
            if let Err(err) = chunk
                .owner
                .backend()
                .read_chunk_crc(chunk, &io, expected, &mut crc)
            {
                drop(crc);
                self.open_chunks.release(io.meta_fd);
                self.open_chunks.purge(io.meta_fd);
                io.meta_fd = -1;
                io.data_fd = -1;
                return Err(err);
            }
            // pull the header into cache for the CRC updates that follow
            let _ = nix::fcntl::posix_fadvise(
                io.meta_fd,
                0,
                chunk.header_size() as i64,
                nix::fcntl::PosixFadviseAdvice::POSIX_FADV_WILLNEED,
            );
        }
        Ok(())
    }

    /// Closes one I/O scope: flushes the CRC block when dirty and optionally
    /// fsyncs both files. Descriptors stay open until the pool evicts them.
    pub(crate) fn io_end(&self, chunk: &Arc<Chunk>) -> Result<(), ChunkOpError> {
        let mut io = chunk.io.lock();
        let mut result = Ok(());

        if io.was_changed {
            match self.open_chunks.crc_for(io.meta_fd) {
                Some(crc) => {
                    let crc = crc.lock();
                    result = chunk
                        .owner
                        .backend()
                        .write_crc(chunk, &io, &crc)
                        .map_err(ChunkOpError::Io);
                    if result.is_ok() {
                        io.was_changed = false;
                    }
                }
                None => result = Err(ChunkOpError::Io(Errno::EBADF)),
            }
        }

        if result.is_ok() && self.flags.perform_fsync() {
            result = chunk.owner.backend().fsync_chunk(chunk, &io);
        }

        self.open_chunks.release(io.meta_fd);
        result
    }

    /// Opens a chunk for a client session; the matching scope is closed by
    /// [`Self::hdd_close`].
    pub fn hdd_open(&self, chunk_id: u64, chunk_type: ChunkPartType) -> Result<(), ChunkOpError> {
        let guard = self.find_chunk_and_lock(chunk_id, chunk_type)?;
        self.open_locked(&guard)
    }

    pub(crate) fn open_locked(&self, guard: &ChunkGuard<'_>) -> Result<(), ChunkOpError> {
        if let Err(err) = self.io_begin(guard.chunk(), false, None) {
            self.add_disk_error(guard, err.errno());
            self.reports.report_damaged_chunk(guard.id, guard.ctype);
            return Err(err);
        }
        Ok(())
    }

    pub fn hdd_close(&self, chunk_id: u64, chunk_type: ChunkPartType) -> Result<(), ChunkOpError> {
        let guard = self.find_chunk_and_lock(chunk_id, chunk_type)?;
        self.close_locked(&guard)
    }

    pub(crate) fn close_locked(&self, guard: &ChunkGuard<'_>) -> Result<(), ChunkOpError> {
        if let Err(err) = self.io_end(guard.chunk()) {
            self.add_disk_error(guard, err.errno());
            self.reports.report_damaged_chunk(guard.id, guard.ctype);
            return Err(err);
        }
        Ok(())
    }

    /// Appends the stored CRC and the data of one block to `out`. Blocks past
    /// the current end are synthesised as zeros with the empty-block CRC.
    fn read_crc_and_block(
        &self,
        chunk: &Arc<Chunk>,
        block: u16,
        out: &mut Vec<u8>,
    ) -> Result<(), ChunkOpError> {
        if u32::from(block) >= SFSBLOCKSINCHUNK {
            return Err(ChunkOpError::BlockNumTooBig);
        }

        if block >= chunk.blocks() {
            out.extend_from_slice(&EMPTY_BLOCK_CRC.to_be_bytes());
            out.resize(out.len() + BLOCK_SIZE, 0);
            return Ok(());
        }

        let io = chunk.io.lock();
        let crc = self
            .open_chunks
            .crc_for(io.meta_fd)
            .ok_or(ChunkOpError::Io(Errno::EBADF))?;
        let crc = crc.lock();

        let start = out.len();
        out.resize(start + HDD_BLOCK_SIZE, 0);
        if let Err(err) =
            chunk
                .owner
                .backend()
                .read_block_and_crc(chunk, &io, &crc, block, &mut out[start..])
        {
            out.truncate(start);
            drop(crc);
            drop(io);
            self.add_disk_error(chunk, err.errno());
            log::warn!(
                "read_crc_and_block: chunk {} - read error on block {block}",
                chunk.description()
            );
            self.reports.report_damaged_chunk(chunk.id, chunk.ctype);
            return Err(ChunkOpError::Io(Errno::EIO));
        }
        Ok(())
    }

    /// Verifies a freshly read full block against its stored CRC. Skipped
    /// when `HDD_CHECK_CRC_WHEN_READING` is off, unless `force_check` asks
    /// for it (partial reads must slice from a verified block).
    fn check_crc_for_full_block(
        &self,
        chunk: &Arc<Chunk>,
        block: u16,
        crc_and_block: &[u8],
        force_check: bool,
    ) -> Result<(), ChunkOpError> {
        if !force_check && (!self.flags.check_crc_when_reading() || block >= chunk.blocks()) {
            return Ok(());
        }

        let stored = u32::from_be_bytes(crc_and_block[..CRC_SIZE].try_into().unwrap());
        if crc32(&crc_and_block[CRC_SIZE..CRC_SIZE + BLOCK_SIZE]) != stored {
            self.add_chunk_to_test_queue(ChunkWithVersionAndType {
                id: chunk.id,
                version: chunk.version(),
                chunk_type: chunk.ctype,
            });
            return Err(ChunkOpError::Crc);
        }
        Ok(())
    }

    /// Read-ahead for a sequential reader: hints the kernel about the blocks
    /// ahead, and when the reader skipped past the expected position, warms
    /// the cache with the skipped range too.
    fn read_ahead_and_behind(
        &self,
        chunk: &Arc<Chunk>,
        io: &mut ChunkIo,
        block: u16,
        max_blocks_behind: u32,
        blocks_ahead: u32,
    ) {
        if io.block_expected_next < block && max_blocks_behind > 0 {
            let mut first_block = io.block_expected_next;
            if u32::from(first_block) + max_blocks_behind < u32::from(block) {
                first_block = block - max_blocks_behind as u16;
            }

            chunk.owner.backend().prefetch_chunk_blocks(
                chunk,
                io,
                first_block,
                blocks_ahead + u32::from(block - first_block),
            );

            if let Some(crc) = self.open_chunks.crc_for(io.meta_fd) {
                let crc = crc.lock();
                BLOCK_BUFFER.with(|buffer| {
                    let mut buffer = buffer.borrow_mut();
                    for behind in first_block..block {
                        let _ = chunk
                            .owner
                            .backend()
                            .read_block_and_crc(chunk, io, &crc, behind, &mut buffer);
                    }
                });
            }
        } else {
            chunk
                .owner
                .backend()
                .prefetch_chunk_blocks(chunk, io, block, blocks_ahead);
        }

        io.block_expected_next = io.block_expected_next.max(block + 1);
    }

    /// Reads `size` bytes at `offset` and appends `crc || data` to `out`.
    #[allow(clippy::too_many_arguments)]
    pub fn hdd_read(
        &self,
        chunk_id: u64,
        version: u32,
        chunk_type: ChunkPartType,
        offset: u32,
        size: u32,
        max_blocks_behind: u32,
        blocks_ahead: u32,
        out: &mut Vec<u8>,
    ) -> Result<(), ChunkOpError> {
        let offset_in_block = offset % SFSBLOCKSIZE;
        if size == 0 || offset_in_block + size > SFSBLOCKSIZE {
            return Err(ChunkOpError::WrongSize);
        }

        let guard = self.find_chunk_and_lock(chunk_id, chunk_type)?;
        if guard.version() != version && version > 0 {
            return Err(ChunkOpError::WrongVersion);
        }

        let chunk = guard.chunk().clone();
        let block = (offset / SFSBLOCKSIZE) as u16;

        if !chunk.owner.is_zoned_device() {
            let mut io = chunk.io.lock();
            self.read_ahead_and_behind(&chunk, &mut io, block, max_blocks_behind, blocks_ahead);
        }

        if size == SFSBLOCKSIZE {
            let start = out.len();
            self.read_crc_and_block(&chunk, block, out)?;
            self.check_crc_for_full_block(&chunk, block, &out[start..], false)?;
        } else {
            let mut full_block = Vec::with_capacity(HDD_BLOCK_SIZE);
            self.read_crc_and_block(&chunk, block, &mut full_block)?;
            self.check_crc_for_full_block(&chunk, block, &full_block, true)?;

            let data_start = CRC_SIZE + offset_in_block as usize;
            let slice = &full_block[data_start..data_start + size as usize];
            out.extend_from_slice(&crc32(slice).to_be_bytes());
            out.extend_from_slice(slice);
        }
        Ok(())
    }

    /// Opens the chunk, hints the kernel about the given block range, closes
    /// it again.
    pub fn hdd_prefetch_blocks(
        &self,
        chunk_id: u64,
        chunk_type: ChunkPartType,
        first_block: u16,
        block_count: u32,
    ) -> Result<(), ChunkOpError> {
        let guard = self.find_chunk_and_lock(chunk_id, chunk_type).map_err(|err| {
            log::warn!("error finding chunk for prefetching: {chunk_id:016X}");
            err
        })?;

        self.open_locked(&guard).map_err(|err| {
            log::warn!("error opening chunk for prefetching: {chunk_id:016X} - {err}");
            err
        })?;

        {
            let chunk = guard.chunk();
            let io = chunk.io.lock();
            chunk
                .owner
                .backend()
                .prefetch_chunk_blocks(chunk, &io, first_block, block_count);
        }

        self.close_locked(&guard).map_err(|err| {
            log::warn!("error closing prefetched chunk: {chunk_id:016X} - {err}");
            err
        })
    }

    /// Writes a (possibly partial) block, keeping the per-block CRC exact.
    #[allow(clippy::too_many_arguments)]
    pub fn hdd_write_block(
        &self,
        chunk_id: u64,
        version: u32,
        chunk_type: ChunkPartType,
        block: u16,
        offset_in_block: u32,
        size: u32,
        crc: u32,
        buffer: &[u8],
    ) -> Result<(), ChunkOpError> {
        if size as usize > buffer.len() {
            return Err(ChunkOpError::WrongSize);
        }

        let guard = self.find_chunk_and_lock(chunk_id, chunk_type)?;
        let chunk = guard.chunk().clone();

        if self.flags.check_crc_when_writing() && crc != crc32(&buffer[..size as usize]) {
            return Err(ChunkOpError::Crc);
        }

        let result = {
            let mut io = chunk.io.lock();
            let crc_buffer = self
                .open_chunks
                .crc_for(io.meta_fd)
                .ok_or(ChunkOpError::Io(Errno::EBADF))?;
            let mut crc_data = crc_buffer.lock();
            chunk.owner.backend().write_chunk_block(
                &chunk,
                &mut io,
                version,
                block,
                offset_in_block,
                size,
                crc,
                &mut crc_data,
                buffer,
                &self.write_options(),
            )
        };

        match result {
            Err(ChunkOpError::Crc) => {
                // stored CRC no longer matches the on-disk block
                self.add_disk_error(&chunk, 0);
                log::warn!("write_block: chunk {} - crc error", chunk.description());
                self.reports.report_damaged_chunk(chunk.id, chunk.ctype);
                Err(ChunkOpError::Crc)
            }
            Err(err @ ChunkOpError::Io(_)) => {
                self.add_disk_error(&chunk, err.errno());
                log::warn!("write_block: chunk {} - write error", chunk.description());
                self.reports.report_damaged_chunk(chunk.id, chunk.ctype);
                Err(err)
            }
            other => other,
        }
    }

    /// Returns the chunk's block count after the usual version check.
    pub fn hdd_get_number_of_blocks(
        &self,
        chunk_id: u64,
        chunk_type: ChunkPartType,
        version: u32,
    ) -> Result<u16, ChunkOpError> {
        let guard = self.find_chunk_and_lock(chunk_id, chunk_type)?;
        if guard.version() != version && version > 0 {
            return Err(ChunkOpError::WrongVersion);
        }
        Ok(guard.blocks())
    }

    /// Registers a freshly created chunk on `disk`: version, filenames and
    /// membership in the disk's test collection.
    fn chunk_create(
        &self,
        disk: &Arc<Disk>,
        chunk_id: u64,
        chunk_type: ChunkPartType,
        version: u32,
    ) -> Result<ChunkGuard<'_>, ChunkOpError> {
        let guard =
            self.find_or_create_chunk_and_lock(disk, chunk_id, chunk_type, ChunkGetMode::CreateOnly)?;

        guard.set_version(version);
        disk.need_refresh.store(true, Ordering::Relaxed);
        {
            let chunk = guard.chunk();
            let mut io = chunk.io.lock();
            chunk.update_filenames_from_version(&mut io, version);
        }
        disk.chunks.lock().insert(guard.chunk().clone());
        Ok(guard)
    }

    /// Creates a new empty chunk and returns it locked.
    pub fn hdd_internal_create_chunk(
        &self,
        chunk_id: u64,
        version: u32,
        chunk_type: ChunkPartType,
    ) -> Result<ChunkGuard<'_>, ChunkOpError> {
        let disk = self
            .disk_manager
            .get_disk_for_new_chunk(chunk_type)
            .ok_or(ChunkOpError::NoSpace)?;

        let guard = self.chunk_create(&disk, chunk_id, chunk_type, version)?;
        let chunk = guard.chunk().clone();

        let scope = match IoScope::begin(self, &chunk, true, None) {
            Ok(scope) => scope,
            Err(err) => {
                self.add_disk_error(&chunk, err.errno());
                self.delete_chunk_from_registry(guard);
                return Err(ChunkOpError::Io(Errno::EIO));
            }
        };

        let mut header = vec![0u8; chunk.header_size()];
        let mut signature = Vec::new();
        ChunkSignature::new(chunk_id, version, chunk_type).serialize(&mut signature);
        header[..signature.len()].copy_from_slice(&signature);

        let written = {
            let io = chunk.io.lock();
            chunk.owner.backend().write_chunk_header(&chunk, &io, &header)
        };
        if let Err(err) = written {
            self.add_disk_error(&chunk, err.errno());
            log::warn!(
                "create chunk: file {} - write error",
                chunk.description()
            );
            let _ = scope.end();
            let io = chunk.io.lock();
            let _ = chunk.owner.backend().unlink_chunk(&io);
            drop(io);
            self.delete_chunk_from_registry(guard);
            return Err(ChunkOpError::Io(Errno::EIO));
        }

        if let Err(err) = scope.end() {
            self.add_disk_error(&chunk, err.errno());
            let io = chunk.io.lock();
            let _ = chunk.owner.backend().unlink_chunk(&io);
            drop(io);
            self.delete_chunk_from_registry(guard);
            return Err(err);
        }

        Ok(guard)
    }

    pub fn hdd_create_chunk(
        &self,
        chunk_id: u64,
        version: u32,
        chunk_type: ChunkPartType,
    ) -> Result<(), ChunkOpError> {
        self.hdd_internal_create_chunk(chunk_id, version, chunk_type)
            .map(drop)
    }

    /// Verifies every stored block of the chunk against its CRC.
    pub fn hdd_test_chunk(
        &self,
        chunk_id: u64,
        version: u32,
        chunk_type: ChunkPartType,
    ) -> Result<(), ChunkOpError> {
        let guard = self.find_chunk_and_lock(chunk_id, chunk_type)?;
        if guard.version() != version && version > 0 {
            return Err(ChunkOpError::WrongVersion);
        }
        let chunk = guard.chunk().clone();

        let scope = match IoScope::begin(self, &chunk, false, None) {
            Ok(scope) => scope,
            Err(err) => {
                self.add_disk_error(&chunk, err.errno());
                return Err(err);
            }
        };

        let mut status = Ok(());
        {
            let io = chunk.io.lock();
            let crc_buffer = self
                .open_chunks
                .crc_for(io.meta_fd)
                .ok_or(ChunkOpError::Io(Errno::EBADF))?;
            let crc_data = crc_buffer.lock();

            BLOCK_BUFFER.with(|buffer| {
                let mut buffer = buffer.borrow_mut();
                for block in 0..chunk.blocks() {
                    if let Err(err) = chunk
                        .owner
                        .backend()
                        .read_block_and_crc(&chunk, &io, &crc_data, block, &mut buffer)
                    {
                        self.add_disk_error(&chunk, err.errno());
                        status = Err(ChunkOpError::Io(Errno::EIO));
                        break;
                    }

                    let stored = u32::from_be_bytes(buffer[..CRC_SIZE].try_into().unwrap());
                    if stored != crc32(&buffer[CRC_SIZE..]) {
                        self.add_disk_error(&chunk, 0);
                        log::warn!(
                            "test_chunk: chunk {} - crc error on block {block}",
                            chunk.description()
                        );
                        status = Err(ChunkOpError::Crc);
                        break;
                    }
                }
            });

            // tested data should not crowd out the page cache
            let _ = nix::fcntl::posix_fadvise(
                io.meta_fd,
                0,
                0,
                nix::fcntl::PosixFadviseAdvice::POSIX_FADV_DONTNEED,
            );
            if self.flags.advise_no_cache() {
                let _ = nix::fcntl::posix_fadvise(
                    io.data_fd,
                    0,
                    0,
                    nix::fcntl::PosixFadviseAdvice::POSIX_FADV_DONTNEED,
                );
            }
        }

        if status.is_err() {
            let _ = scope.end();
            return status;
        }

        if let Err(err) = scope.end() {
            self.add_disk_error(&chunk, err.errno());
            return Err(err);
        }
        Ok(())
    }

    fn rename_chunk_files(
        &self,
        chunk: &Chunk,
        io: &mut ChunkIo,
        new_version: u32,
    ) -> Result<(), ChunkOpError> {
        let new_meta = chunk.generate_filename_for_version(new_version, true);
        let new_data = chunk.generate_filename_for_version(new_version, false);

        std::fs::rename(&io.meta_filename, &new_meta)?;
        if let Err(err) = std::fs::rename(&io.data_filename, &new_data) {
            let _ = std::fs::rename(&new_meta, &io.meta_filename);
            return Err(err.into());
        }

        io.meta_filename = new_meta;
        io.data_filename = new_data;
        Ok(())
    }

    fn update_version_locked(
        &self,
        guard: &ChunkGuard<'_>,
        version: u32,
        new_version: u32,
    ) -> Result<(), ChunkOpError> {
        let chunk = guard.chunk().clone();
        if chunk.version() != version && version > 0 {
            return Err(ChunkOpError::WrongVersion);
        }

        let old_version = chunk.version();
        {
            let mut io = chunk.io.lock();
            if let Err(err) = self.rename_chunk_files(&chunk, &mut io, new_version) {
                drop(io);
                self.add_disk_error(&chunk, err.errno());
                log::warn!(
                    "update_version: chunk {} - rename error",
                    chunk.description()
                );
                return Err(ChunkOpError::Io(Errno::EIO));
            }
        }

        let scope = match IoScope::begin(self, &chunk, false, Some(old_version)) {
            Ok(scope) => scope,
            Err(err) => {
                self.add_disk_error(&chunk, err.errno());
                log::warn!(
                    "update_version: chunk {} - open error",
                    chunk.description()
                );
                return Err(err);
            }
        };

        let overwritten = {
            let mut io = chunk.io.lock();
            chunk
                .owner
                .backend()
                .overwrite_chunk_version(&chunk, &mut io, new_version)
        };
        if let Err(err) = overwritten {
            self.add_disk_error(&chunk, err.errno());
            log::warn!(
                "update_version: chunk {} - write error",
                chunk.description()
            );
            let _ = scope.end();
            return Err(ChunkOpError::Io(Errno::EIO));
        }

        scope.end().map_err(|err| {
            self.add_disk_error(&chunk, err.errno());
            err
        })
    }

    pub fn hdd_update_version(
        &self,
        chunk_id: u64,
        version: u32,
        new_version: u32,
        chunk_type: ChunkPartType,
    ) -> Result<(), ChunkOpError> {
        let guard = self.find_chunk_and_lock(chunk_id, chunk_type)?;
        self.update_version_locked(&guard, version, new_version)
    }

    /// Truncates the chunk to `length` bytes, bumping its version. An I/O
    /// failure mid-truncate leaves no trustworthy state behind, so the chunk
    /// is unlinked and purged.
    pub fn hdd_truncate(
        &self,
        chunk_id: u64,
        chunk_type: ChunkPartType,
        old_version: u32,
        new_version: u32,
        length: u32,
    ) -> Result<(), ChunkOpError> {
        if length > SFSCHUNKSIZE {
            return Err(ChunkOpError::WrongSize);
        }

        let guard = self.find_chunk_and_lock(chunk_id, chunk_type)?;
        if guard.version() != old_version && old_version > 0 {
            return Err(ChunkOpError::WrongVersion);
        }
        let chunk = guard.chunk().clone();

        match self.truncate_locked(&chunk, new_version, length) {
            Ok(()) => Ok(()),
            Err(err) => {
                {
                    let io = chunk.io.lock();
                    let _ = chunk.owner.backend().unlink_chunk(&io);
                }
                self.reports.report_damaged_chunk(chunk.id, chunk.ctype);
                self.delete_chunk_from_registry(guard);
                Err(err)
            }
        }
    }

    fn truncate_locked(
        &self,
        chunk: &Arc<Chunk>,
        new_version: u32,
        length: u32,
    ) -> Result<(), ChunkOpError> {
        let old_version = chunk.version();
        let original_blocks = chunk.blocks();

        {
            let mut io = chunk.io.lock();
            if let Err(err) = self.rename_chunk_files(chunk, &mut io, new_version) {
                drop(io);
                self.add_disk_error(chunk, err.errno());
                log::warn!("truncate: chunk {} - rename error", chunk.description());
                return Err(ChunkOpError::Io(Errno::EIO));
            }
        }

        let scope = match IoScope::begin(self, chunk, false, Some(old_version)) {
            Ok(scope) => scope,
            Err(err) => {
                self.add_disk_error(chunk, err.errno());
                return Err(err);
            }
        };

        {
            let mut io = chunk.io.lock();
            if let Err(err) = chunk
                .owner
                .backend()
                .overwrite_chunk_version(chunk, &mut io, new_version)
            {
                drop(io);
                self.add_disk_error(chunk, err.errno());
                log::warn!("truncate: chunk {} - write error", chunk.description());
                let _ = scope.end();
                return Err(ChunkOpError::Io(Errno::EIO));
            }
            io.was_changed = true;
        }

        let target_blocks = blocks_for_length(length);
        let result = self.resize_chunk_data(chunk, original_blocks, target_blocks, length);
        if result.is_err() {
            let _ = scope.end();
            return result;
        }

        if chunk.blocks() != target_blocks {
            chunk.owner.need_refresh.store(true, Ordering::Relaxed);
        }
        chunk.set_blocks(target_blocks);

        scope.end().map_err(|err| {
            self.add_disk_error(chunk, err.errno());
            err
        })
    }

    fn resize_chunk_data(
        &self,
        chunk: &Arc<Chunk>,
        original_blocks: u16,
        target_blocks: u16,
        length: u32,
    ) -> Result<(), ChunkOpError> {
        let io = chunk.io.lock();
        let crc_buffer = self
            .open_chunks
            .crc_for(io.meta_fd)
            .ok_or(ChunkOpError::Io(Errno::EBADF))?;
        let mut crc_data = crc_buffer.lock();

        if target_blocks > original_blocks {
            // growing: fresh blocks read back as zeros
            for block in original_blocks..target_blocks {
                let slot = block as usize * CRC_SIZE;
                crc_data[slot..slot + CRC_SIZE].copy_from_slice(&EMPTY_BLOCK_CRC.to_be_bytes());
            }
            if let Err(errno) = chunk.owner.backend().ftruncate_data(
                &io,
                chunk.file_size_from_block_count(u32::from(target_blocks)),
            ) {
                drop(crc_data);
                drop(io);
                self.add_disk_error(chunk, errno as i32);
                log::warn!("truncate: chunk {} - ftruncate error", chunk.description());
                return Err(ChunkOpError::Io(errno));
            }
            return Ok(());
        }

        let full_blocks = (length / SFSBLOCKSIZE) as u16;
        let tail_size = length - u32::from(full_blocks) * SFSBLOCKSIZE;

        if tail_size > 0 {
            // double truncate zero-fills the partial block's tail
            let shrunk = chunk.file_size_from_block_count(u32::from(full_blocks)) + u64::from(tail_size);
            if let Err(errno) = chunk.owner.backend().ftruncate_data(&io, shrunk) {
                drop(crc_data);
                drop(io);
                self.add_disk_error(chunk, errno as i32);
                log::warn!("truncate: chunk {} - ftruncate error", chunk.description());
                return Err(ChunkOpError::Io(errno));
            }
        }

        if let Err(errno) = chunk
            .owner
            .backend()
            .ftruncate_data(&io, chunk.file_size_from_block_count(u32::from(target_blocks)))
        {
            drop(crc_data);
            drop(io);
            self.add_disk_error(chunk, errno as i32);
            log::warn!("truncate: chunk {} - ftruncate error", chunk.description());
            return Err(ChunkOpError::Io(errno));
        }

        if tail_size > 0 {
            let tail_crc = BLOCK_BUFFER.with(|buffer| {
                let mut buffer = buffer.borrow_mut();
                let data = &mut buffer[CRC_SIZE..CRC_SIZE + tail_size as usize];
                match chunk
                    .owner
                    .backend()
                    .pread_data(chunk, &io, data, chunk.block_offset(full_blocks))
                {
                    Ok(_) => Ok(crc32_zero_expanded(
                        crc32(data),
                        (SFSBLOCKSIZE - tail_size) as usize,
                    )),
                    Err(errno) => Err(errno),
                }
            });

            let tail_crc = match tail_crc {
                Ok(crc) => crc,
                Err(errno) => {
                    drop(crc_data);
                    drop(io);
                    self.add_disk_error(chunk, errno as i32);
                    log::warn!("truncate: chunk {} - read error", chunk.description());
                    return Err(ChunkOpError::Io(errno));
                }
            };

            let slot = full_blocks as usize * CRC_SIZE;
            crc_data[slot..slot + CRC_SIZE].copy_from_slice(&tail_crc.to_be_bytes());

            for block in full_blocks + 1..original_blocks {
                let slot = block as usize * CRC_SIZE;
                crc_data[slot..slot + CRC_SIZE].copy_from_slice(&EMPTY_BLOCK_CRC.to_be_bytes());
            }
        }

        Ok(())
    }

    /// Copies a chunk to a new one placed by the disk manager, optionally
    /// resized to `length` (the duplicate-truncate flavour).
    #[allow(clippy::too_many_arguments)]
    pub fn hdd_duplicate_chunk(
        &self,
        chunk_id: u64,
        version: u32,
        new_version: u32,
        chunk_type: ChunkPartType,
        copy_chunk_id: u64,
        copy_version: u32,
        length: Option<u32>,
    ) -> Result<(), ChunkOpError> {
        if let Some(length) = length {
            if length > SFSCHUNKSIZE {
                return Err(ChunkOpError::WrongSize);
            }
        }

        let original_guard = self.find_chunk_and_lock(chunk_id, chunk_type)?;
        if original_guard.version() != version && version > 0 {
            return Err(ChunkOpError::WrongVersion);
        }
        let copy_version = if copy_version == 0 {
            new_version
        } else {
            copy_version
        };

        let dup_disk = self
            .disk_manager
            .get_disk_for_new_chunk(chunk_type)
            .ok_or(ChunkOpError::NoSpace)?;
        let dup_guard = self.chunk_create(&dup_disk, copy_chunk_id, chunk_type, copy_version)?;

        let original = original_guard.chunk().clone();
        let duplicate = dup_guard.chunk().clone();

        match self.duplicate_impl(&original, &duplicate, version, new_version, copy_version, length)
        {
            Ok(target_blocks) => {
                duplicate.set_blocks(target_blocks);
                dup_disk.need_refresh.store(true, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                {
                    let io = duplicate.io.lock();
                    let _ = duplicate.owner.backend().unlink_chunk(&io);
                }
                self.delete_chunk_from_registry(dup_guard);
                Err(err)
            }
        }
    }

    /// The shared body of duplicate and duplicate-truncate. Returns the
    /// destination block count.
    fn duplicate_impl(
        &self,
        original: &Arc<Chunk>,
        duplicate: &Arc<Chunk>,
        version: u32,
        new_version: u32,
        copy_version: u32,
        length: Option<u32>,
    ) -> Result<u16, ChunkOpError> {
        let original_scope = if new_version != version {
            // bump the source version first
            let old_version = original.version();
            {
                let mut io = original.io.lock();
                if let Err(err) = self.rename_chunk_files(original, &mut io, new_version) {
                    drop(io);
                    self.add_disk_error(original, err.errno());
                    log::warn!("duplicate: chunk {} - rename error", original.description());
                    return Err(ChunkOpError::Io(Errno::EIO));
                }
            }
            let scope = IoScope::begin(self, original, false, Some(old_version)).map_err(|err| {
                self.add_disk_error(original, err.errno());
                err
            })?;
            let overwritten = {
                let mut io = original.io.lock();
                original
                    .owner
                    .backend()
                    .overwrite_chunk_version(original, &mut io, new_version)
            };
            if let Err(err) = overwritten {
                self.add_disk_error(original, err.errno());
                log::warn!(
                    "duplicate: chunk {} - version write error",
                    original.description()
                );
                let _ = scope.end();
                return Err(ChunkOpError::Io(Errno::EIO));
            }
            scope
        } else {
            IoScope::begin(self, original, false, None).map_err(|err| {
                self.add_disk_error(original, err.errno());
                self.reports.report_damaged_chunk(original.id, original.ctype);
                err
            })?
        };

        let dup_scope = IoScope::begin(self, duplicate, true, None).map_err(|err| {
            self.add_disk_error(duplicate, err.errno());
            err
        })?;

        let original_blocks = original.blocks();
        let target_blocks = match length {
            Some(length) => blocks_for_length(length),
            None => original_blocks,
        };
        let copy_blocks = original_blocks.min(target_blocks);
        let tail_size = match length {
            Some(length) if target_blocks <= original_blocks => {
                length - (length / SFSBLOCKSIZE) * SFSBLOCKSIZE
            }
            _ => 0,
        };
        let whole_copy_blocks = if tail_size > 0 {
            copy_blocks - 1
        } else {
            copy_blocks
        };

        // destination CRC block: the source CRCs, empty-block entries for
        // growth, and the zero-expanded tail entry for a misaligned shrink
        let crc_offset = duplicate.crc_offset() as usize;
        let crc_block_size = duplicate.crc_block_size();
        let mut crc_section = {
            let original_io = original.io.lock();
            let original_crc = self
                .open_chunks
                .crc_for(original_io.meta_fd)
                .ok_or(ChunkOpError::Io(Errno::EBADF))?;
            let original_crc = original_crc.lock();
            original_crc.to_vec()
        };

        for block in original_blocks..target_blocks {
            let slot = block as usize * CRC_SIZE;
            crc_section[slot..slot + CRC_SIZE].copy_from_slice(&EMPTY_BLOCK_CRC.to_be_bytes());
        }

        // block copy loop
        let copy_result: Result<(), ChunkOpError> = BLOCK_BUFFER.with(|buffer| {
            let mut buffer = buffer.borrow_mut();

            for block in 0..whole_copy_blocks {
                self.copy_one_block(
                    original,
                    duplicate,
                    &crc_section,
                    block,
                    &mut buffer[CRC_SIZE..],
                    BLOCK_SIZE,
                )?;
            }

            if tail_size > 0 {
                let block = copy_blocks - 1;
                {
                    let original_io = original.io.lock();
                    if let Err(errno) = original.owner.backend().pread_data(
                        original,
                        &original_io,
                        &mut buffer[CRC_SIZE..],
                        original.block_offset(block),
                    ) {
                        drop(original_io);
                        self.add_disk_error(original, errno as i32);
                        log::warn!(
                            "duptrunc: chunk {} - data read error",
                            original.description()
                        );
                        self.reports
                            .report_damaged_chunk(original.id, original.ctype);
                        return Err(ChunkOpError::Io(errno));
                    }
                }

                let data = &mut buffer[CRC_SIZE..];
                data[tail_size as usize..].fill(0);
                let tail_crc = crc32_zero_expanded(
                    crc32(&data[..tail_size as usize]),
                    (SFSBLOCKSIZE - tail_size) as usize,
                );
                let slot = block as usize * CRC_SIZE;
                crc_section[slot..slot + CRC_SIZE].copy_from_slice(&tail_crc.to_be_bytes());

                self.write_one_block(duplicate, block, &buffer[CRC_SIZE..], tail_crc)?;
            }
            Ok(())
        });
        copy_result?;

        let mut header = vec![0u8; duplicate.header_size()];
        let mut signature = Vec::new();
        ChunkSignature::new(duplicate.id, copy_version, duplicate.ctype).serialize(&mut signature);
        header[..signature.len()].copy_from_slice(&signature);
        header[crc_offset..crc_offset + crc_block_size].copy_from_slice(&crc_section);

        if target_blocks > original_blocks || tail_size == 0 {
            // size the data file (grow, or aligned shrink of the copy)
            let dup_io = duplicate.io.lock();
            if let Err(errno) = duplicate
                .owner
                .backend()
                .ftruncate_data(&dup_io, duplicate.file_size_from_block_count(u32::from(target_blocks)))
            {
                drop(dup_io);
                self.add_disk_error(duplicate, errno as i32);
                log::warn!(
                    "duplicate: chunk {} - ftruncate error",
                    duplicate.description()
                );
                return Err(ChunkOpError::Io(errno));
            }
        }

        // publish the destination CRC block and header
        {
            let dup_io = duplicate.io.lock();
            let dup_crc = self
                .open_chunks
                .crc_for(dup_io.meta_fd)
                .ok_or(ChunkOpError::Io(Errno::EBADF))?;
            dup_crc
                .lock()
                .copy_from_slice(&header[crc_offset..crc_offset + crc_block_size]);

            if let Err(err) = duplicate
                .owner
                .backend()
                .write_chunk_header(duplicate, &dup_io, &header)
            {
                drop(dup_io);
                self.add_disk_error(duplicate, err.errno());
                log::warn!(
                    "duplicate: chunk {} - hdr write error",
                    duplicate.description()
                );
                return Err(ChunkOpError::Io(Errno::EIO));
            }
        }

        if let Err(err) = original_scope.end() {
            self.add_disk_error(original, err.errno());
            self.reports
                .report_damaged_chunk(original.id, original.ctype);
            return Err(err);
        }
        if let Err(err) = dup_scope.end() {
            self.add_disk_error(duplicate, err.errno());
            return Err(err);
        }

        Ok(target_blocks)
    }

    fn copy_one_block(
        &self,
        original: &Arc<Chunk>,
        duplicate: &Arc<Chunk>,
        crc_section: &[u8],
        block: u16,
        data_buffer: &mut [u8],
        block_size: usize,
    ) -> Result<(), ChunkOpError> {
        {
            let original_io = original.io.lock();
            if let Err(errno) = original.owner.backend().pread_data(
                original,
                &original_io,
                &mut data_buffer[..block_size],
                original.block_offset(block),
            ) {
                drop(original_io);
                self.add_disk_error(original, errno as i32);
                log::warn!(
                    "duplicate: chunk {} - data read error",
                    original.description()
                );
                self.reports
                    .report_damaged_chunk(original.id, original.ctype);
                return Err(ChunkOpError::Io(errno));
            }
        }

        let slot = block as usize * CRC_SIZE;
        let block_crc = u32::from_be_bytes(crc_section[slot..slot + CRC_SIZE].try_into().unwrap());
        self.write_one_block(duplicate, block, &data_buffer[..block_size], block_crc)
    }

    /// Writes one full block into the destination of a duplicate. Zoned
    /// back-ends cannot overwrite in place and need the replaying
    /// `write_chunk_block`; conventional ones take the raw data path.
    fn write_one_block(
        &self,
        duplicate: &Arc<Chunk>,
        block: u16,
        data: &[u8],
        block_crc: u32,
    ) -> Result<(), ChunkOpError> {
        let result = if duplicate.owner.is_zoned_device() {
            let mut io = duplicate.io.lock();
            let dup_crc = self
                .open_chunks
                .crc_for(io.meta_fd)
                .ok_or(ChunkOpError::Io(Errno::EBADF))?;
            let mut dup_crc = dup_crc.lock();
            duplicate.owner.backend().write_chunk_block(
                duplicate,
                &mut io,
                duplicate.version(),
                block,
                0,
                SFSBLOCKSIZE,
                block_crc,
                &mut dup_crc,
                data,
                &self.write_options(),
            )
        } else {
            let io = duplicate.io.lock();
            duplicate
                .owner
                .backend()
                .write_chunk_data(duplicate, &io, data, duplicate.block_offset(block))
                .map(drop)
                .map_err(ChunkOpError::Io)
        };

        result.map_err(|err| {
            self.add_disk_error(duplicate, err.errno());
            log::warn!(
                "duplicate: chunk {} - data write error",
                duplicate.description()
            );
            err
        })
    }

    /// Unlinks both files and drops the chunk from the registry.
    pub fn hdd_delete_chunk(
        &self,
        chunk_id: u64,
        version: u32,
        chunk_type: ChunkPartType,
    ) -> Result<(), ChunkOpError> {
        let guard = self.find_chunk_and_lock(chunk_id, chunk_type)?;
        if guard.version() != version && version > 0 {
            return Err(ChunkOpError::WrongVersion);
        }
        let chunk = guard.chunk().clone();

        let unlinked = {
            let io = chunk.io.lock();
            chunk.owner.backend().unlink_chunk(&io)
        };

        match unlinked {
            Ok(()) => {
                self.delete_chunk_from_registry(guard);
                Ok(())
            }
            Err(errno) => {
                self.add_disk_error(&chunk, errno as i32);
                log::warn!("delete: chunk {} - unlink error", chunk.description());
                if errno == Errno::ENOENT {
                    self.delete_chunk_from_registry(guard);
                }
                Err(ChunkOpError::Io(errno))
            }
        }
    }

    /// Routes a combined `(new_version, length, copy_id)` tuple to the
    /// matching primitive:
    ///
    /// ```text
    /// new_version>0, length==0xFFFFFFFF, copy_id==0  -> update version
    /// new_version>0, length==0xFFFFFFFF, copy_id>0   -> duplicate
    /// new_version>0, length<=chunk size, copy_id==0  -> truncate
    /// new_version>0, length<=chunk size, copy_id>0   -> duplicate+truncate
    /// new_version==0, length==0                      -> delete
    /// new_version==0, length==1                      -> create
    /// new_version==0, length==2                      -> test
    /// ```
    #[allow(clippy::too_many_arguments)]
    pub fn hdd_chunk_operation(
        &self,
        chunk_id: u64,
        version: u32,
        chunk_type: ChunkPartType,
        new_version: u32,
        copy_chunk_id: u64,
        copy_version: u32,
        length: u32,
    ) -> Result<(), ChunkOpError> {
        if new_version > 0 {
            if length == 0xFFFF_FFFF {
                if copy_chunk_id == 0 {
                    self.hdd_update_version(chunk_id, version, new_version, chunk_type)
                } else {
                    self.hdd_duplicate_chunk(
                        chunk_id,
                        version,
                        new_version,
                        chunk_type,
                        copy_chunk_id,
                        copy_version,
                        None,
                    )
                }
            } else if length <= SFSCHUNKSIZE {
                if copy_chunk_id == 0 {
                    self.hdd_truncate(chunk_id, chunk_type, version, new_version, length)
                } else {
                    self.hdd_duplicate_chunk(
                        chunk_id,
                        version,
                        new_version,
                        chunk_type,
                        copy_chunk_id,
                        copy_version,
                        Some(length),
                    )
                }
            } else {
                Err(ChunkOpError::Invalid)
            }
        } else {
            match length {
                0 => self.hdd_delete_chunk(chunk_id, version, chunk_type),
                1 => self.hdd_create_chunk(chunk_id, version, chunk_type),
                2 => self.hdd_test_chunk(chunk_id, version, chunk_type),
                _ => Err(ChunkOpError::Invalid),
            }
        }
    }

    /// Queues a chunk for an asynchronous re-test after a failed client read.
    pub fn add_chunk_to_test_queue(&self, chunk: ChunkWithVersionAndType) {
        self.test_queue.put(chunk);
    }

    /// Feeds every registered chunk to `callback` in bulks. Chunks busy on
    /// the first pass are revisited with a blocking lock so registrations
    /// are complete.
    pub fn for_each_chunk_in_bulks(
        &self,
        bulk_size: usize,
        mut callback: impl FnMut(&[ChunkWithVersionAndType]),
    ) {
        let record = |chunk: &Chunk| ChunkWithVersionAndType {
            id: chunk.id,
            version: combine_version_with_todel_flag(
                chunk.version(),
                chunk.owner.is_marked_for_deletion(),
            ),
            chunk_type: chunk.ctype,
        };

        let mut bulk = Vec::with_capacity(bulk_size);
        let mut recheck_list = Vec::new();

        for chunk in self.registry.snapshot() {
            if chunk.state() != ChunkState::Available {
                recheck_list.push((chunk.id, chunk.ctype));
                continue;
            }
            if bulk.len() >= bulk_size {
                callback(&bulk);
                bulk.clear();
            }
            bulk.push(record(&chunk));
        }
        if !bulk.is_empty() {
            callback(&bulk);
            bulk.clear();
        }

        for (chunk_id, chunk_type) in recheck_list {
            if bulk.len() >= bulk_size {
                callback(&bulk);
                bulk.clear();
            }
            if let Ok(guard) = self.find_chunk_and_lock(chunk_id, chunk_type) {
                bulk.push(record(&guard));
            }
        }
        if !bulk.is_empty() {
            callback(&bulk);
        }
    }
}
