//! Conventional (CMR) disk back-end: two plain files per chunk, pread/pwrite
//! at block-aligned offsets, ftruncate for sizing, optional hole punching for
//! all-zero regions.

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::sys::uio::{pread, pwrite};

use sfs_api_types::SFSBLOCKSIZE;

use crate::chunk::{Chunk, ChunkIo};
use crate::chunk_signature::{ChunkSignature, VERSION_OFFSET};
use crate::crc::{crc32, crc32_combine, crc32_zeros, EMPTY_BLOCK_CRC};
use crate::disk::{DiskBackend, WriteOptions, DEFAULT_OPEN_MODE};
use crate::error::ChunkOpError;
use crate::stats::{DiskReadStatsUpdater, DiskWriteStatsUpdater};
use crate::CRC_SIZE;

pub struct CmrDisk;

const BLOCK_SIZE: usize = SFSBLOCKSIZE as usize;

impl CmrDisk {
    /// Punches holes over the 4 KiB-aligned all-zero regions of a write.
    fn punch_holes(&self, io: &ChunkIo, buf: &[u8], offset: u64) {
        const HOLE_BLOCK: usize = 4096;

        let mut step = match (offset as usize) % HOLE_BLOCK {
            0 => 0,
            misalignment => HOLE_BLOCK - misalignment,
        };
        let mut hole_start = 0u64;
        let mut hole_size = 0u64;

        while step + HOLE_BLOCK <= buf.len() {
            let is_zero = buf[step..step + HOLE_BLOCK].iter().all(|&byte| byte == 0);
            if is_zero {
                if hole_size == 0 {
                    hole_start = offset + step as u64;
                }
                hole_size += HOLE_BLOCK as u64;
            } else if hole_size > 0 {
                let _ = nix::fcntl::fallocate(
                    io.data_fd,
                    nix::fcntl::FallocateFlags::FALLOC_FL_PUNCH_HOLE
                        | nix::fcntl::FallocateFlags::FALLOC_FL_KEEP_SIZE,
                    hole_start as i64,
                    hole_size as i64,
                );
                hole_size = 0;
            }
            step += HOLE_BLOCK;
        }

        if hole_size > 0 {
            let _ = nix::fcntl::fallocate(
                io.data_fd,
                nix::fcntl::FallocateFlags::FALLOC_FL_PUNCH_HOLE
                    | nix::fcntl::FallocateFlags::FALLOC_FL_KEEP_SIZE,
                hole_start as i64,
                hole_size as i64,
            );
        }
    }
}

impl DiskBackend for CmrDisk {
    fn create_chunk_files(&self, _chunk: &Chunk, io: &mut ChunkIo) -> Result<(), Errno> {
        let mode = Mode::from_bits_truncate(DEFAULT_OPEN_MODE);
        io.meta_fd = open(
            &io.meta_filename,
            OFlag::O_RDWR | OFlag::O_TRUNC | OFlag::O_CREAT,
            mode,
        )?;
        match open(
            &io.data_filename,
            OFlag::O_RDWR | OFlag::O_TRUNC | OFlag::O_CREAT,
            mode,
        ) {
            Ok(fd) => {
                io.data_fd = fd;
                Ok(())
            }
            Err(errno) => {
                let _ = nix::unistd::close(io.meta_fd);
                io.meta_fd = -1;
                Err(errno)
            }
        }
    }

    fn open_chunk_files(&self, chunk: &Chunk, io: &mut ChunkIo) -> Result<(), Errno> {
        let flags = if chunk.owner.state.lock().is_read_only {
            OFlag::O_RDONLY
        } else {
            OFlag::O_RDWR
        };
        io.meta_fd = open(&io.meta_filename, flags, Mode::empty())?;
        match open(&io.data_filename, flags, Mode::empty()) {
            Ok(fd) => {
                io.data_fd = fd;
                Ok(())
            }
            Err(errno) => {
                let _ = nix::unistd::close(io.meta_fd);
                io.meta_fd = -1;
                Err(errno)
            }
        }
    }

    fn unlink_chunk(&self, io: &ChunkIo) -> Result<(), Errno> {
        let meta = nix::unistd::unlink(&io.meta_filename);
        let data = nix::unistd::unlink(&io.data_filename);
        meta.and(data)
    }

    fn fsync_chunk(&self, chunk: &Chunk, io: &ChunkIo) -> Result<(), ChunkOpError> {
        let start = std::time::Instant::now();
        for fd in [io.meta_fd, io.data_fd] {
            if fd >= 0 {
                nix::unistd::fsync(fd)?;
            }
        }
        chunk
            .owner
            .stats
            .current
            .data_fsync(start.elapsed().as_micros() as u64);
        Ok(())
    }

    fn ftruncate_data(&self, io: &ChunkIo, size: u64) -> Result<(), Errno> {
        nix::unistd::ftruncate(io.data_fd, size as i64)
    }

    fn pread_data(
        &self,
        chunk: &Chunk,
        io: &ChunkIo,
        buf: &mut [u8],
        offset: i64,
    ) -> Result<usize, Errno> {
        let mut updater = DiskReadStatsUpdater::new(&chunk.owner, buf.len() as u64);
        match pread(io.data_fd, buf, offset) {
            Ok(bytes) if bytes == buf.len() => Ok(bytes),
            Ok(_) => {
                updater.mark_read_as_failed();
                Err(Errno::EIO)
            }
            Err(errno) => {
                updater.mark_read_as_failed();
                Err(errno)
            }
        }
    }

    fn write_chunk_data(
        &self,
        chunk: &Chunk,
        io: &ChunkIo,
        buf: &[u8],
        offset: i64,
    ) -> Result<usize, Errno> {
        let mut updater = DiskWriteStatsUpdater::new(&chunk.owner, buf.len() as u64);
        match pwrite(io.data_fd, buf, offset) {
            Ok(bytes) if bytes == buf.len() => Ok(bytes),
            Ok(_) => {
                updater.mark_write_as_failed();
                Err(Errno::EIO)
            }
            Err(errno) => {
                updater.mark_write_as_failed();
                Err(errno)
            }
        }
    }

    fn prefetch_chunk_blocks(
        &self,
        chunk: &Chunk,
        io: &ChunkIo,
        first_block: u16,
        block_count: u32,
    ) {
        if block_count == 0 || io.data_fd < 0 {
            return;
        }
        let _ = nix::fcntl::posix_fadvise(
            io.data_fd,
            chunk.block_offset(first_block),
            i64::from(block_count) * i64::from(SFSBLOCKSIZE),
            nix::fcntl::PosixFadviseAdvice::POSIX_FADV_WILLNEED,
        );
    }

    fn read_block_and_crc(
        &self,
        chunk: &Chunk,
        io: &ChunkIo,
        crc_data: &[u8],
        block: u16,
        out: &mut [u8],
    ) -> Result<usize, ChunkOpError> {
        let slot = block as usize * CRC_SIZE;
        out[..CRC_SIZE].copy_from_slice(&crc_data[slot..slot + CRC_SIZE]);

        let mut updater = DiskReadStatsUpdater::new(&chunk.owner, SFSBLOCKSIZE as u64);
        let read = pread(
            io.data_fd,
            &mut out[CRC_SIZE..CRC_SIZE + BLOCK_SIZE],
            chunk.block_offset(block),
        );
        match read {
            Ok(bytes) if bytes == BLOCK_SIZE => Ok(BLOCK_SIZE),
            Ok(_) => {
                updater.mark_read_as_failed();
                Err(ChunkOpError::Io(Errno::EIO))
            }
            Err(errno) => {
                updater.mark_read_as_failed();
                Err(ChunkOpError::Io(errno))
            }
        }
    }

    fn overwrite_chunk_version(
        &self,
        chunk: &Chunk,
        io: &mut ChunkIo,
        new_version: u32,
    ) -> Result<(), ChunkOpError> {
        let buffer = new_version.to_be_bytes();
        let mut updater = DiskWriteStatsUpdater::new(&chunk.owner, buffer.len() as u64);
        match pwrite(io.meta_fd, &buffer, VERSION_OFFSET) {
            Ok(bytes) if bytes == buffer.len() => {}
            _ => {
                updater.mark_write_as_failed();
                return Err(ChunkOpError::Io(Errno::EIO));
            }
        }
        drop(updater);

        chunk.set_version(new_version);
        chunk.update_filenames_from_version(io, new_version);
        Ok(())
    }

    fn read_chunk_crc(
        &self,
        chunk: &Chunk,
        io: &ChunkIo,
        expected_version: u32,
        crc: &mut [u8],
    ) -> Result<(), ChunkOpError> {
        let signature = ChunkSignature::read_from_fd(io.meta_fd, 0)?;

        if !signature.has_valid_magic() {
            log::warn!(
                "read_chunk_crc: file {} has a wrong header",
                io.meta_filename.display()
            );
            return Err(ChunkOpError::Io(Errno::EIO));
        }

        if chunk.id != signature.chunk_id()
            || expected_version != signature.chunk_version()
            || chunk.ctype != signature.chunk_type()
        {
            log::warn!(
                "read_chunk_crc: file {} carries {:016X}_{:08X} ({}), expected {:016X}_{:08X} ({})",
                io.meta_filename.display(),
                signature.chunk_id(),
                signature.chunk_version(),
                signature.chunk_type(),
                chunk.id,
                expected_version,
                chunk.ctype
            );
            return Err(ChunkOpError::Io(Errno::EIO));
        }

        let crc_block_size = chunk.crc_block_size();
        let mut updater = DiskReadStatsUpdater::new(&chunk.owner, crc_block_size as u64);
        match pread(io.meta_fd, &mut crc[..crc_block_size], chunk.crc_offset()) {
            Ok(bytes) if bytes == crc_block_size => Ok(()),
            Ok(_) => {
                updater.mark_read_as_failed();
                Err(ChunkOpError::Io(Errno::EIO))
            }
            Err(errno) => {
                updater.mark_read_as_failed();
                Err(ChunkOpError::Io(errno))
            }
        }
    }

    fn write_chunk_header(
        &self,
        chunk: &Chunk,
        io: &ChunkIo,
        header: &[u8],
    ) -> Result<(), ChunkOpError> {
        let mut updater = DiskWriteStatsUpdater::new(&chunk.owner, header.len() as u64);
        match pwrite(io.meta_fd, header, 0) {
            Ok(bytes) if bytes == header.len() => Ok(()),
            _ => {
                updater.mark_write_as_failed();
                Err(ChunkOpError::Io(Errno::EIO))
            }
        }
    }

    fn write_crc(&self, chunk: &Chunk, io: &ChunkIo, crc: &[u8]) -> Result<(), Errno> {
        let crc_block_size = chunk.crc_block_size();
        match pwrite(io.meta_fd, &crc[..crc_block_size], chunk.crc_offset()) {
            Ok(bytes) if bytes == crc_block_size => Ok(()),
            Ok(_) => Err(Errno::EIO),
            Err(errno) => Err(errno),
        }
    }

    fn write_partial_block_and_crc(
        &self,
        chunk: &Chunk,
        io: &ChunkIo,
        buf: &[u8],
        offset_in_block: u32,
        crc_slot: [u8; CRC_SIZE],
        crc_data: &mut [u8],
        block: u16,
        _is_new_block: bool,
        punch_holes: bool,
    ) -> Result<(), ChunkOpError> {
        let offset = chunk.block_offset(block) + i64::from(offset_in_block);

        let mut updater = DiskWriteStatsUpdater::new(&chunk.owner, buf.len() as u64);
        match pwrite(io.data_fd, buf, offset) {
            Ok(bytes) if bytes == buf.len() => {}
            Ok(_) => {
                updater.mark_write_as_failed();
                return Err(ChunkOpError::Io(Errno::EIO));
            }
            Err(errno) => {
                updater.mark_write_as_failed();
                return Err(ChunkOpError::Io(errno));
            }
        }
        drop(updater);

        if punch_holes {
            self.punch_holes(io, buf, offset as u64);
        }

        let slot = block as usize * CRC_SIZE;
        crc_data[slot..slot + CRC_SIZE].copy_from_slice(&crc_slot);
        Ok(())
    }

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
    ) -> Result<(), ChunkOpError> {
        if chunk.version() != version && version > 0 {
            return Err(ChunkOpError::WrongVersion);
        }
        if u32::from(block) >= chunk.max_blocks_in_file() {
            return Err(ChunkOpError::BlockNumTooBig);
        }
        if size > SFSBLOCKSIZE {
            return Err(ChunkOpError::WrongSize);
        }
        if offset_in_block >= SFSBLOCKSIZE || offset_in_block + size > SFSBLOCKSIZE {
            return Err(ChunkOpError::WrongOffset);
        }

        io.was_changed = true;

        if offset_in_block == 0 && size == SFSBLOCKSIZE {
            // A complete block: no read-modify-write needed.
            let mut is_new_block = false;
            if block >= chunk.blocks() {
                let previous_blocks = chunk.blocks();
                chunk.set_blocks(block + 1);
                is_new_block = true;
                for slot in previous_blocks..block {
                    let at = slot as usize * CRC_SIZE;
                    crc_data[at..at + CRC_SIZE].copy_from_slice(&EMPTY_BLOCK_CRC.to_be_bytes());
                }
            }

            self.write_partial_block_and_crc(
                chunk,
                io,
                &buf[..BLOCK_SIZE],
                0,
                crc.to_be_bytes(),
                crc_data,
                block,
                is_new_block,
                opts.punch_holes,
            )
        } else {
            let tail = SFSBLOCKSIZE - (offset_in_block + size);
            let mut is_new_block = false;

            let (pre_crc, post_crc) = if block < chunk.blocks() {
                // The block exists: verify its stored CRC still matches its
                // content around the slice we are about to replace.
                let mut scratch = vec![0u8; CRC_SIZE + BLOCK_SIZE];
                self.read_block_and_crc(chunk, io, crc_data, block, &mut scratch)?;
                let data = &scratch[CRC_SIZE..];

                let pre_crc = crc32(&data[..offset_in_block as usize]);
                let slice_crc = crc32(
                    &data[offset_in_block as usize..(offset_in_block + size) as usize],
                );
                let post_crc = crc32(&data[(offset_in_block + size) as usize..]);

                let combined = splice_crc(pre_crc, slice_crc, post_crc, offset_in_block, size);
                let stored = u32::from_be_bytes(scratch[..CRC_SIZE].try_into().unwrap());
                if stored != combined {
                    return Err(ChunkOpError::Crc);
                }
                (pre_crc, post_crc)
            } else {
                // A new block past the end: grow the file, backfill CRCs and
                // combine against virtual zeros.
                self.ftruncate_data(io, chunk.file_size_from_block_count(u32::from(block) + 1))?;

                let previous_blocks = chunk.blocks();
                chunk.set_blocks(block + 1);
                is_new_block = true;
                for slot in previous_blocks..block {
                    let at = slot as usize * CRC_SIZE;
                    crc_data[at..at + CRC_SIZE].copy_from_slice(&EMPTY_BLOCK_CRC.to_be_bytes());
                }

                (
                    crc32_zeros(offset_in_block as usize),
                    crc32_zeros(tail as usize),
                )
            };

            let combined = splice_crc(pre_crc, crc, post_crc, offset_in_block, size);
            self.write_partial_block_and_crc(
                chunk,
                io,
                &buf[..size as usize],
                offset_in_block,
                combined.to_be_bytes(),
                crc_data,
                block,
                is_new_block,
                opts.punch_holes,
            )
        }
    }
}

/// CRC of `pre ++ slice ++ post` given the three section CRCs, where `pre` is
/// `offset_in_block` bytes and `post` fills the block after the slice.
fn splice_crc(pre_crc: u32, slice_crc: u32, post_crc: u32, offset_in_block: u32, size: u32) -> u32 {
    let tail = u64::from(SFSBLOCKSIZE - (offset_in_block + size));
    if offset_in_block == 0 {
        crc32_combine(slice_crc, post_crc, tail)
    } else {
        let mut combined = crc32_combine(pre_crc, slice_crc, u64::from(size));
        if tail > 0 {
            combined = crc32_combine(combined, post_crc, tail);
        }
        combined
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splice_crc_matches_direct_computation() {
        let mut block = vec![0u8; BLOCK_SIZE];
        for (index, byte) in block.iter_mut().enumerate() {
            *byte = (index % 251) as u8;
        }

        for (offset, size) in [(0u32, 65536u32), (0, 1000), (512, 4096), (65000, 536), (1, 1)] {
            let pre = &block[..offset as usize];
            let slice = &block[offset as usize..(offset + size) as usize];
            let post = &block[(offset + size) as usize..];
            assert_eq!(
                splice_crc(crc32(pre), crc32(slice), crc32(post), offset, size),
                crc32(&block),
                "offset {offset} size {size}"
            );
        }
    }
}
