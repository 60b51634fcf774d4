//! Cache of opened chunk resources keyed by the metadata file descriptor.
//!
//! Opening a chunk allocates an entry owning both descriptors and the
//! in-memory CRC block. Entries are reference counted by I/O scopes
//! (`io_begin`/`io_end`); a released entry stays cached so back-to-back
//! operations skip the open/CRC-load cost, and a sweeper evicts entries that
//! stay idle past [`OPEN_CHUNK_IDLE_WINDOW`], bounded per sweep so the
//! registry is never stalled for long.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::chunk::Chunk;

pub const OPEN_CHUNK_IDLE_WINDOW: Duration = Duration::from_secs(2);
pub const MAX_EVICTIONS_PER_SWEEP: usize = 1024;

pub type CrcBuffer = Arc<Mutex<Box<[u8]>>>;

pub struct OpenChunk {
    pub chunk: Arc<Chunk>,
    pub meta_fd: RawFd,
    pub data_fd: RawFd,
    pub crc: CrcBuffer,
    users: u32,
    released_at: Instant,
}

#[derive(Default)]
pub struct OpenChunkPool {
    entries: Mutex<HashMap<RawFd, OpenChunk>>,
}

impl OpenChunkPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an I/O scope for an opened chunk, creating the entry (with a
    /// zeroed CRC buffer) on first use.
    pub fn acquire(&self, chunk: &Arc<Chunk>, meta_fd: RawFd, data_fd: RawFd) -> CrcBuffer {
        let mut entries = self.entries.lock();
        let entry = entries.entry(meta_fd).or_insert_with(|| OpenChunk {
            chunk: chunk.clone(),
            meta_fd,
            data_fd,
            crc: Arc::new(Mutex::new(
                vec![0u8; chunk.crc_block_size()].into_boxed_slice(),
            )),
            users: 0,
            released_at: Instant::now(),
        });
        entry.users += 1;
        entry.crc.clone()
    }

    /// The CRC buffer of an already opened chunk.
    pub fn crc_for(&self, meta_fd: RawFd) -> Option<CrcBuffer> {
        if meta_fd < 0 {
            return None;
        }
        self.entries.lock().get(&meta_fd).map(|entry| entry.crc.clone())
    }

    /// Closes an I/O scope; the entry becomes eligible for eviction once its
    /// last scope is released.
    pub fn release(&self, meta_fd: RawFd) {
        if let Some(entry) = self.entries.lock().get_mut(&meta_fd) {
            entry.users = entry.users.saturating_sub(1);
            entry.released_at = Instant::now();
        }
    }

    /// Drops the entry and closes both descriptors. Used when the chunk is
    /// removed from the registry.
    pub fn purge(&self, meta_fd: RawFd) {
        if meta_fd < 0 {
            return;
        }
        if let Some(entry) = self.entries.lock().remove(&meta_fd) {
            close_fds(&entry);
        }
    }

    /// Chunks whose entries have been idle past `idle_window`, capped at
    /// `max` results. The caller must try-lock each chunk before calling
    /// [`Self::evict`].
    pub fn idle_candidates(&self, idle_window: Duration, max: usize) -> Vec<Arc<Chunk>> {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.users == 0 && now.duration_since(entry.released_at) > idle_window)
            .take(max)
            .map(|entry| entry.chunk.clone())
            .collect()
    }

    /// Removes an idle entry and closes its descriptors. The chunk must be
    /// held locked by the caller; returns false if the entry was re-acquired
    /// in the meantime.
    pub fn evict(&self, meta_fd: RawFd) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&meta_fd) {
            Some(entry) if entry.users == 0 => {
                let entry = entries.remove(&meta_fd).unwrap();
                close_fds(&entry);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn close_fds(entry: &OpenChunk) {
    if entry.meta_fd >= 0 {
        let _ = nix::unistd::close(entry.meta_fd);
    }
    if entry.data_fd >= 0 {
        let _ = nix::unistd::close(entry.data_fd);
    }
}
