//! Process-wide chunk registry and the chunk locking protocol.
//!
//! The registry maps `(id, type)` to shared chunk descriptors. Acquiring a
//! chunk means flipping its lifecycle state to `Locked`; contending threads
//! park on a condition-variable slot taken from a free list (most chunks
//! never see contention, so slots are pooled instead of being a permanent
//! per-chunk cost). Waiting is bounded: a locked chunk that stays busy for
//! more than [`CHUNK_LOCK_TIMEOUT`] surfaces backpressure as an error
//! instead of deadlocking the worker pool on a damaged chunk.
//!
//! Lock ordering: a chunk's `sync` mutex is never held while taking the pool,
//! registry or disk collection locks; releases drop it before container
//! removal.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use sfs_api_types::ChunkPartType;

use crate::chunk::{Chunk, ChunkState, CondVarWithWaiters};
use crate::engine::HddEngine;
use crate::error::ChunkOpError;

pub const CHUNK_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkGetMode {
    CreateOnly,
    FindOrCreate,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct ChunkKey {
    id: u64,
    ctype: ChunkPartType,
}

#[derive(Default)]
pub struct ChunkRegistry {
    chunks: Mutex<HashMap<ChunkKey, Arc<Chunk>>>,
    free_cond_vars: Mutex<Vec<Arc<CondVarWithWaiters>>>,
}

impl ChunkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u64, ctype: ChunkPartType) -> Option<Arc<Chunk>> {
        self.chunks.lock().get(&ChunkKey { id, ctype }).cloned()
    }

    /// Atomically returns the existing chunk or inserts a new one built by
    /// `make`. The boolean tells whether an insert happened.
    pub fn get_or_insert_with(
        &self,
        id: u64,
        ctype: ChunkPartType,
        make: impl FnOnce() -> Arc<Chunk>,
    ) -> (Arc<Chunk>, bool) {
        let mut chunks = self.chunks.lock();
        match chunks.entry(ChunkKey { id, ctype }) {
            std::collections::hash_map::Entry::Occupied(entry) => (entry.get().clone(), false),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let chunk = make();
                entry.insert(chunk.clone());
                (chunk, true)
            }
        }
    }

    pub fn remove(&self, id: u64, ctype: ChunkPartType) -> Option<Arc<Chunk>> {
        self.chunks.lock().remove(&ChunkKey { id, ctype })
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    /// A point-in-time copy of all registered chunks.
    pub fn snapshot(&self) -> Vec<Arc<Chunk>> {
        self.chunks.lock().values().cloned().collect()
    }

    pub fn clear(&self) {
        self.chunks.lock().clear();
    }

    fn acquire_cond_var(&self) -> Arc<CondVarWithWaiters> {
        self.free_cond_vars
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(CondVarWithWaiters::new()))
    }

    fn release_cond_var(&self, slot: Arc<CondVarWithWaiters>) {
        debug_assert_eq!(slot.waiters.load(Ordering::Relaxed), 0);
        self.free_cond_vars.lock().push(slot);
    }
}

/// Borrowed, logically locked chunk. Dropping the guard releases the chunk
/// on every exit path.
pub struct ChunkGuard<'e> {
    engine: &'e HddEngine,
    chunk: Option<Arc<Chunk>>,
}

impl<'e> ChunkGuard<'e> {
    fn new(engine: &'e HddEngine, chunk: Arc<Chunk>) -> Self {
        Self {
            engine,
            chunk: Some(chunk),
        }
    }

    pub fn chunk(&self) -> &Arc<Chunk> {
        self.chunk.as_ref().expect("guard already released")
    }

    /// Consumes the guard without releasing; the caller takes over the
    /// lifecycle transition (used when a scan rebuilds a registry entry).
    pub(crate) fn into_chunk(mut self) -> Arc<Chunk> {
        self.chunk.take().expect("guard already released")
    }
}

impl Deref for ChunkGuard<'_> {
    type Target = Chunk;

    fn deref(&self) -> &Chunk {
        self.chunk.as_deref().expect("guard already released")
    }
}

impl Drop for ChunkGuard<'_> {
    fn drop(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.engine.release_chunk(&chunk);
        }
    }
}

impl HddEngine {
    /// Looks the chunk up and acquires it, waiting out short contention.
    pub fn find_chunk_and_lock(
        &self,
        id: u64,
        ctype: ChunkPartType,
    ) -> Result<ChunkGuard<'_>, ChunkOpError> {
        match self.registry.get(id, ctype) {
            Some(chunk) => self.wait_and_lock(chunk),
            None => Err(ChunkOpError::NoChunk),
        }
    }

    /// Same locking contract as [`Self::find_chunk_and_lock`], but can create
    /// the chunk (in `Locked` state, with empty filenames) when absent.
    pub fn find_or_create_chunk_and_lock(
        &self,
        disk: &Arc<crate::disk::Disk>,
        id: u64,
        ctype: ChunkPartType,
        mode: ChunkGetMode,
    ) -> Result<ChunkGuard<'_>, ChunkOpError> {
        let (chunk, created) = self.registry.get_or_insert_with(id, ctype, || {
            Arc::new(Chunk::new(id, ctype, disk.clone(), ChunkState::Locked))
        });

        if created {
            Ok(ChunkGuard::new(self, chunk))
        } else if mode == ChunkGetMode::CreateOnly {
            Err(ChunkOpError::ChunkExists)
        } else {
            self.wait_and_lock(chunk)
        }
    }

    fn wait_and_lock(&self, chunk: Arc<Chunk>) -> Result<ChunkGuard<'_>, ChunkOpError> {
        let mut sync = chunk.sync.lock();
        loop {
            match sync.state {
                ChunkState::Available => {
                    sync.state = ChunkState::Locked;
                    sync.ref_count += 1;
                    drop(sync);
                    return Ok(ChunkGuard::new(self, chunk));
                }
                ChunkState::Deleted => {
                    return Err(ChunkOpError::NoChunk);
                }
                ChunkState::Locked | ChunkState::ToBeDeleted => {
                    let slot = match &sync.cond_var {
                        Some(slot) => slot.clone(),
                        None => {
                            let slot = self.registry.acquire_cond_var();
                            sync.cond_var = Some(slot.clone());
                            slot
                        }
                    };

                    slot.waiters.fetch_add(1, Ordering::Relaxed);
                    let timed_out = slot
                        .cond
                        .wait_for(&mut sync, CHUNK_LOCK_TIMEOUT)
                        .timed_out();
                    slot.waiters.fetch_sub(1, Ordering::Relaxed);

                    if sync.state == ChunkState::Deleted {
                        if slot.waiters.load(Ordering::Relaxed) == 0 {
                            sync.cond_var = None;
                            drop(sync);
                            self.registry.release_cond_var(slot);
                            self.remove_chunk_from_containers(&chunk);
                        } else {
                            drop(sync);
                            // pass the deletion wake-up on to the next waiter
                            slot.cond.notify_one();
                        }
                        return Err(ChunkOpError::NoChunk);
                    }

                    if timed_out && sync.state != ChunkState::Available {
                        return Err(ChunkOpError::Timeout);
                    }
                }
            }
        }
    }

    /// Locks the chunk only if it is immediately available.
    pub fn try_lock_chunk(&self, chunk: &Arc<Chunk>) -> bool {
        let mut sync = chunk.sync.lock();
        if sync.state == ChunkState::Available {
            sync.state = ChunkState::Locked;
            sync.ref_count += 1;
            true
        } else {
            false
        }
    }

    /// Releases a logically locked chunk; wakes one waiter, or performs the
    /// deferred removal when the chunk was scheduled for deletion and nobody
    /// is waiting anymore.
    pub(crate) fn release_chunk(&self, chunk: &Arc<Chunk>) {
        let mut sync = chunk.sync.lock();
        sync.ref_count = sync.ref_count.saturating_sub(1);

        match sync.state {
            ChunkState::Locked => {
                sync.state = ChunkState::Available;
                if let Some(slot) = sync.cond_var.clone() {
                    if slot.waiters.load(Ordering::Relaxed) > 0 {
                        drop(sync);
                        slot.cond.notify_one();
                    } else {
                        sync.cond_var = None;
                        drop(sync);
                        self.registry.release_cond_var(slot);
                    }
                }
            }
            ChunkState::ToBeDeleted => {
                sync.state = ChunkState::Deleted;
                match sync.cond_var.clone() {
                    Some(slot) if slot.waiters.load(Ordering::Relaxed) > 0 => {
                        drop(sync);
                        // the last waiter performs the removal
                        slot.cond.notify_one();
                    }
                    Some(slot) => {
                        sync.cond_var = None;
                        drop(sync);
                        self.registry.release_cond_var(slot);
                        self.remove_chunk_from_containers(chunk);
                    }
                    None => {
                        drop(sync);
                        self.remove_chunk_from_containers(chunk);
                    }
                }
            }
            state => {
                log::warn!(
                    "releasing chunk {} in unexpected state {state:?}",
                    chunk.description()
                );
            }
        }
    }

    /// Schedules the locked chunk for removal and releases it; the removal
    /// itself happens once the last holder lets go.
    pub fn delete_chunk_from_registry(&self, guard: ChunkGuard<'_>) {
        guard.chunk().sync.lock().state = ChunkState::ToBeDeleted;
        drop(guard);
    }

    /// Final removal: open descriptors, the owning disk's collection and the
    /// registry entry. Called with the chunk in `Deleted` state and no
    /// waiters left.
    pub(crate) fn remove_chunk_from_containers(&self, chunk: &Arc<Chunk>) {
        {
            let mut io = chunk.io.lock();
            self.open_chunks.purge(io.meta_fd);
            io.meta_fd = -1;
            io.data_fd = -1;
        }

        if self.registry.remove(chunk.id, chunk.ctype).is_none() {
            log::warn!(
                "chunk to be removed was not in the registry: {}",
                chunk.description()
            );
            return;
        }

        chunk.owner.chunks.lock().remove(chunk);
        chunk
            .owner
            .need_refresh
            .store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::test_support::test_engine;

    use std::sync::atomic::{AtomicU32, AtomicUsize};

    #[test]
    fn create_only_conflicts_on_existing_chunk() {
        let engine = test_engine();
        let disk = engine.disk_manager.disks.lock()[0].clone();

        let guard = engine
            .find_or_create_chunk_and_lock(
                &disk,
                1,
                ChunkPartType::standard(),
                ChunkGetMode::CreateOnly,
            )
            .unwrap();
        drop(guard);

        let err = engine
            .find_or_create_chunk_and_lock(
                &disk,
                1,
                ChunkPartType::standard(),
                ChunkGetMode::CreateOnly,
            )
            .unwrap_err();
        assert_eq!(err, ChunkOpError::ChunkExists);

        assert!(engine
            .find_or_create_chunk_and_lock(
                &disk,
                1,
                ChunkPartType::standard(),
                ChunkGetMode::FindOrCreate,
            )
            .is_ok());
    }

    #[test]
    fn missing_chunk_is_reported() {
        let engine = test_engine();
        assert_eq!(
            engine
                .find_chunk_and_lock(42, ChunkPartType::standard())
                .unwrap_err(),
            ChunkOpError::NoChunk
        );
    }

    #[test]
    fn at_most_one_thread_observes_locked() {
        let _ = env_logger::builder().is_test(true).try_init();
        let engine = test_engine();
        let disk = engine.disk_manager.disks.lock()[0].clone();
        drop(
            engine
                .find_or_create_chunk_and_lock(
                    &disk,
                    7,
                    ChunkPartType::standard(),
                    ChunkGetMode::CreateOnly,
                )
                .unwrap(),
        );

        let inside = std::sync::Arc::new(AtomicU32::new(0));
        let max_seen = std::sync::Arc::new(AtomicU32::new(0));
        let acquired = std::sync::Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            let acquired = acquired.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let guard = match engine.find_chunk_and_lock(7, ChunkPartType::standard()) {
                        Ok(guard) => guard,
                        Err(ChunkOpError::Timeout) => continue,
                        Err(err) => panic!("unexpected error: {err}"),
                    };
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    acquired.fetch_add(1, Ordering::SeqCst);
                    drop(guard);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(acquired.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn deletion_while_waiting_returns_no_chunk() {
        let engine = test_engine();
        let disk = engine.disk_manager.disks.lock()[0].clone();
        let guard = engine
            .find_or_create_chunk_and_lock(
                &disk,
                9,
                ChunkPartType::standard(),
                ChunkGetMode::CreateOnly,
            )
            .unwrap();

        let waiter = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.find_chunk_and_lock(9, ChunkPartType::standard()).err())
        };
        // let the waiter park on the condvar slot first
        std::thread::sleep(std::time::Duration::from_millis(100));

        engine.delete_chunk_from_registry(guard);
        assert_eq!(waiter.join().unwrap(), Some(ChunkOpError::NoChunk));
        assert!(engine.registry.get(9, ChunkPartType::standard()).is_none());
    }
}
