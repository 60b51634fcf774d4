//! Per-disk chunk collection with O(1) insert/remove and fair test scheduling.
//!
//! The vector is split into a "tested" prefix `[0, first_untested)` and an
//! "untested" suffix. Chunks are only ever moved by swapping, and every swap
//! updates the chunks' `index_in_disk`, so all operations stay constant time.
//! The tester takes the element at `first_untested`; once the boundary
//! reaches the end, the next request starts a new loop. A shuffle after each
//! disk scan keeps the testing order unrelated to the file system layout.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::Rng;

use crate::chunk::{Chunk, INVALID_INDEX_IN_DISK};

#[derive(Default)]
pub struct DiskChunks {
    chunks: Vec<Arc<Chunk>>,
    first_untested: usize,
}

impl DiskChunks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Inserts a new chunk. Freshly written chunks count as already tested so
    /// they don't dominate the current testing loop.
    pub fn insert(&mut self, chunk: Arc<Chunk>) {
        debug_assert_eq!(chunk.index_in_disk(), INVALID_INDEX_IN_DISK);
        chunk
            .index_in_disk
            .store(self.chunks.len(), Ordering::Relaxed);
        self.chunks.push(chunk.clone());
        self.mark_as_tested_internal(&chunk);
    }

    pub fn remove(&mut self, chunk: &Arc<Chunk>) {
        let index = chunk.index_in_disk();
        if index == INVALID_INDEX_IN_DISK {
            return;
        }

        // Move it into the untested section first, then swap with the back.
        if index < self.first_untested {
            self.swap(index, self.first_untested - 1);
            self.first_untested -= 1;
        }
        self.swap(chunk.index_in_disk(), self.chunks.len() - 1);
        self.chunks.pop();
        chunk
            .index_in_disk
            .store(INVALID_INDEX_IN_DISK, Ordering::Relaxed);
    }

    pub fn mark_as_tested(&mut self, chunk: &Arc<Chunk>) {
        self.mark_as_tested_internal(chunk);
    }

    /// The next chunk the tester should look at, or `None` if the disk holds
    /// no chunks. Reaching the end of the vector starts a new loop.
    pub fn chunk_to_test(&mut self) -> Option<Arc<Chunk>> {
        if self.chunks.is_empty() {
            return None;
        }
        if self.first_untested == self.chunks.len() {
            self.first_untested = 0;
        }
        Some(self.chunks[self.first_untested].clone())
    }

    /// A uniformly random chunk, unrelated to the testing order.
    pub fn random_chunk(&self) -> Option<Arc<Chunk>> {
        if self.chunks.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..self.chunks.len());
        Some(self.chunks[index].clone())
    }

    /// Fisher-Yates shuffle; afterwards every chunk counts as untested.
    pub fn shuffle(&mut self) {
        if self.chunks.len() > 1 {
            let mut rng = rand::thread_rng();
            for i in (1..self.chunks.len()).rev() {
                let j = rng.gen_range(0..=i);
                self.swap(i, j);
            }
        }
        self.first_untested = 0;
    }

    fn mark_as_tested_internal(&mut self, chunk: &Arc<Chunk>) {
        if chunk.index_in_disk() == INVALID_INDEX_IN_DISK {
            return;
        }
        if chunk.index_in_disk() >= self.first_untested {
            self.swap(chunk.index_in_disk(), self.first_untested);
            self.first_untested += 1;
        }
    }

    fn swap(&mut self, lhs: usize, rhs: usize) {
        let lhs_index = self.chunks[lhs].index_in_disk();
        self.chunks[lhs]
            .index_in_disk
            .store(self.chunks[rhs].index_in_disk(), Ordering::Relaxed);
        self.chunks[rhs].index_in_disk.store(lhs_index, Ordering::Relaxed);
        self.chunks.swap(lhs, rhs);
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::path::PathBuf;

    use super::*;
    use crate::chunk::ChunkState;
    use crate::disk::Disk;
    use crate::hdd_cfg::DiskCfgLine;
    use sfs_api_types::ChunkPartType;

    fn make_chunks(count: u64) -> Vec<Arc<Chunk>> {
        let disk = Arc::new(
            Disk::new(
                &DiskCfgLine {
                    meta_path: PathBuf::from("/mnt/meta"),
                    data_path: PathBuf::from("/mnt/meta"),
                    is_marked_for_removal: false,
                    is_zoned: false,
                },
                0,
            )
            .unwrap(),
        );
        (0..count)
            .map(|id| {
                Arc::new(Chunk::new(
                    id,
                    ChunkPartType::standard(),
                    disk.clone(),
                    ChunkState::Available,
                ))
            })
            .collect()
    }

    #[test]
    fn insert_remove_mark_as_tested() {
        let chunks = make_chunks(100);
        let mut collection = DiskChunks::new();

        for chunk in &chunks {
            assert_eq!(chunk.index_in_disk(), INVALID_INDEX_IN_DISK);
            collection.insert(chunk.clone());
            assert_ne!(chunk.index_in_disk(), INVALID_INDEX_IN_DISK);
        }

        collection.shuffle();

        for index in [0usize, 30, 60, 95, 15, 30, 95] {
            collection.mark_as_tested(&chunks[index]);
        }

        let to_remove = [0usize, 50, 3, 15, 11, 99, 4, 95];
        for &index in &to_remove {
            collection.remove(&chunks[index]);
            assert_eq!(chunks[index].index_in_disk(), INVALID_INDEX_IN_DISK);
        }

        for (index, chunk) in chunks.iter().enumerate() {
            if to_remove.contains(&index) {
                assert_eq!(chunk.index_in_disk(), INVALID_INDEX_IN_DISK);
            } else {
                assert!(chunk.index_in_disk() < 92);
            }
        }
        assert_eq!(collection.len(), 92);
    }

    #[test]
    fn tested_chunks_are_retested_last() {
        let chunks = make_chunks(100);
        let mut collection = DiskChunks::new();
        for chunk in &chunks {
            collection.insert(chunk.clone());
        }
        collection.shuffle();

        // Every third chunk tested: 34 tested, 66 untested.
        for index in (0..100).step_by(3) {
            collection.mark_as_tested(&chunks[index]);
        }

        let mut seen = HashSet::new();
        for count in 0..100 {
            let chunk = collection.chunk_to_test().unwrap();
            collection.mark_as_tested(&chunk);
            assert!(seen.insert(chunk.id), "{} tested twice", chunk.id);
            if count < 66 {
                assert_ne!(chunk.id % 3, 0);
            } else {
                assert_eq!(chunk.id % 3, 0);
            }
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn full_loops_visit_every_chunk_once() {
        let chunks = make_chunks(10);
        let mut collection = DiskChunks::new();
        for chunk in &chunks {
            collection.insert(chunk.clone());
        }
        collection.shuffle();

        let sequence = |collection: &mut DiskChunks| {
            (0..10)
                .map(|_| {
                    let chunk = collection.chunk_to_test().unwrap();
                    collection.mark_as_tested(&chunk);
                    chunk.id
                })
                .collect::<Vec<_>>()
        };

        let first = sequence(&mut collection);
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());

        // Without interleaved inserts/removes the order repeats.
        for _ in 0..10 {
            assert_eq!(sequence(&mut collection), first);
        }
    }

    #[test]
    fn corner_cases() {
        let chunks = make_chunks(2);
        let mut collection = DiskChunks::new();

        collection.insert(chunks[0].clone());
        collection.shuffle();
        assert!(collection.chunk_to_test().is_some());
        assert!(collection.random_chunk().is_some());
        collection.remove(&chunks[0]);
        assert!(collection.chunk_to_test().is_none());
        assert!(collection.random_chunk().is_none());

        collection.insert(chunks[0].clone());
        collection.insert(chunks[1].clone());
        collection.shuffle();
        collection.mark_as_tested(&chunks[0]);
        collection.remove(&chunks[1]);
        collection.remove(&chunks[0]);
        assert!(collection.chunk_to_test().is_none());
        assert_eq!(collection.len(), 0);
    }
}
