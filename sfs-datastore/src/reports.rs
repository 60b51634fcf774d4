//! Event queues drained by the master-connection layer.
//!
//! Enqueues are O(1) under a single mutex; drains are batched so one
//! registration round never walks an unbounded backlog.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use sfs_api_types::{
    combine_version_with_todel_flag, ChunkPartType, ChunkWithType, ChunkWithVersionAndType,
};

pub const REPORT_BATCH_LIMIT: usize = 1000;

#[derive(Default)]
struct ReportQueues {
    damaged: VecDeque<ChunkWithType>,
    lost: VecDeque<ChunkWithType>,
    new_chunks: VecDeque<ChunkWithVersionAndType>,
}

#[derive(Default)]
pub struct MasterReports {
    queues: Mutex<ReportQueues>,
    error_counter: AtomicU32,
    space_changed: AtomicBool,
}

impl MasterReports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_damaged_chunk(&self, id: u64, chunk_type: ChunkPartType) {
        self.queues
            .lock()
            .damaged
            .push_back(ChunkWithType { id, chunk_type });
    }

    pub fn report_lost_chunk(&self, id: u64, chunk_type: ChunkPartType) {
        self.queues
            .lock()
            .lost
            .push_back(ChunkWithType { id, chunk_type });
    }

    pub fn report_new_chunk(&self, id: u64, version: u32, todel: bool, chunk_type: ChunkPartType) {
        self.queues.lock().new_chunks.push_back(ChunkWithVersionAndType {
            id,
            version: combine_version_with_todel_flag(version, todel),
            chunk_type,
        });
    }

    pub fn get_damaged_chunks(&self, limit: usize) -> Vec<ChunkWithType> {
        let mut queues = self.queues.lock();
        let count = queues.damaged.len().min(limit);
        queues.damaged.drain(..count).collect()
    }

    pub fn get_lost_chunks(&self, limit: usize) -> Vec<ChunkWithType> {
        let mut queues = self.queues.lock();
        let count = queues.lost.len().min(limit);
        queues.lost.drain(..count).collect()
    }

    pub fn get_new_chunks(&self, limit: usize) -> Vec<ChunkWithVersionAndType> {
        let mut queues = self.queues.lock();
        let count = queues.new_chunks.len().min(limit);
        queues.new_chunks.drain(..count).collect()
    }

    pub fn count_error(&self) {
        self.error_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_and_reset_error_counter(&self) -> u32 {
        self.error_counter.swap(0, Ordering::Relaxed)
    }

    pub fn mark_space_changed(&self) {
        self.space_changed.store(true, Ordering::Relaxed);
    }

    pub fn get_and_reset_space_changed(&self) -> bool {
        self.space_changed.swap(false, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drains_are_batched_and_ordered() {
        let reports = MasterReports::new();
        for id in 0..5 {
            reports.report_damaged_chunk(id, ChunkPartType::standard());
        }
        let first = reports.get_damaged_chunks(3);
        assert_eq!(first.iter().map(|c| c.id).collect::<Vec<_>>(), [0, 1, 2]);
        let rest = reports.get_damaged_chunks(REPORT_BATCH_LIMIT);
        assert_eq!(rest.iter().map(|c| c.id).collect::<Vec<_>>(), [3, 4]);
        assert!(reports.get_damaged_chunks(1).is_empty());
    }

    #[test]
    fn new_chunks_carry_todel_flag() {
        let reports = MasterReports::new();
        reports.report_new_chunk(9, 4, true, ChunkPartType::standard());
        let drained = reports.get_new_chunks(10);
        assert_eq!(
            sfs_api_types::split_version_and_todel_flag(drained[0].version),
            (4, true)
        );
    }

    #[test]
    fn counters_reset_on_read() {
        let reports = MasterReports::new();
        reports.count_error();
        reports.count_error();
        assert_eq!(reports.get_and_reset_error_counter(), 2);
        assert_eq!(reports.get_and_reset_error_counter(), 0);

        reports.mark_space_changed();
        assert!(reports.get_and_reset_space_changed());
        assert!(!reports.get_and_reset_space_changed());
    }
}
