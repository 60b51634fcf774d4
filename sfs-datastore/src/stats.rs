//! Per-disk I/O statistics.
//!
//! Every disk keeps a current accumulator (plain atomics, updated by the RAII
//! updaters around each data-path syscall) and a rolling history of 1440
//! one-minute slots, rotated by the disks supervisor thread.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::disk::Disk;

pub const STATS_HISTORY_IN_24_HOURS: usize = 1440;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HddStatistics {
    pub rbytes: u64,
    pub wbytes: u64,
    pub usec_read_sum: u64,
    pub usec_write_sum: u64,
    pub usec_fsync_sum: u64,
    pub rops: u32,
    pub wops: u32,
    pub fsync_ops: u32,
    pub usec_read_max: u64,
    pub usec_write_max: u64,
    pub usec_fsync_max: u64,
}

impl HddStatistics {
    pub fn add(&mut self, other: &HddStatistics) {
        self.rbytes += other.rbytes;
        self.wbytes += other.wbytes;
        self.usec_read_sum += other.usec_read_sum;
        self.usec_write_sum += other.usec_write_sum;
        self.usec_fsync_sum += other.usec_fsync_sum;
        self.rops += other.rops;
        self.wops += other.wops;
        self.fsync_ops += other.fsync_ops;
        self.usec_read_max = self.usec_read_max.max(other.usec_read_max);
        self.usec_write_max = self.usec_write_max.max(other.usec_write_max);
        self.usec_fsync_max = self.usec_fsync_max.max(other.usec_fsync_max);
    }
}

#[derive(Default)]
pub struct HddAtomicStatistics {
    rbytes: AtomicU64,
    wbytes: AtomicU64,
    usec_read_sum: AtomicU64,
    usec_write_sum: AtomicU64,
    usec_fsync_sum: AtomicU64,
    rops: AtomicU32,
    wops: AtomicU32,
    fsync_ops: AtomicU32,
    usec_read_max: AtomicU64,
    usec_write_max: AtomicU64,
    usec_fsync_max: AtomicU64,
}

impl HddAtomicStatistics {
    pub fn data_read(&self, bytes: u64, usec: u64) {
        self.rops.fetch_add(1, Ordering::Relaxed);
        self.rbytes.fetch_add(bytes, Ordering::Relaxed);
        self.usec_read_sum.fetch_add(usec, Ordering::Relaxed);
        self.usec_read_max.fetch_max(usec, Ordering::Relaxed);
    }

    pub fn data_write(&self, bytes: u64, usec: u64) {
        self.wops.fetch_add(1, Ordering::Relaxed);
        self.wbytes.fetch_add(bytes, Ordering::Relaxed);
        self.usec_write_sum.fetch_add(usec, Ordering::Relaxed);
        self.usec_write_max.fetch_max(usec, Ordering::Relaxed);
    }

    pub fn data_fsync(&self, usec: u64) {
        self.fsync_ops.fetch_add(1, Ordering::Relaxed);
        self.usec_fsync_sum.fetch_add(usec, Ordering::Relaxed);
        self.usec_fsync_max.fetch_max(usec, Ordering::Relaxed);
    }

    /// Snapshots the accumulated minute and resets it.
    pub fn take(&self) -> HddStatistics {
        HddStatistics {
            rbytes: self.rbytes.swap(0, Ordering::Relaxed),
            wbytes: self.wbytes.swap(0, Ordering::Relaxed),
            usec_read_sum: self.usec_read_sum.swap(0, Ordering::Relaxed),
            usec_write_sum: self.usec_write_sum.swap(0, Ordering::Relaxed),
            usec_fsync_sum: self.usec_fsync_sum.swap(0, Ordering::Relaxed),
            rops: self.rops.swap(0, Ordering::Relaxed),
            wops: self.wops.swap(0, Ordering::Relaxed),
            fsync_ops: self.fsync_ops.swap(0, Ordering::Relaxed),
            usec_read_max: self.usec_read_max.swap(0, Ordering::Relaxed),
            usec_write_max: self.usec_write_max.swap(0, Ordering::Relaxed),
            usec_fsync_max: self.usec_fsync_max.swap(0, Ordering::Relaxed),
        }
    }
}

pub struct StatsHistory {
    pub slots: Box<[HddStatistics]>,
    pub pos: usize,
}

pub struct DiskStats {
    pub current: HddAtomicStatistics,
    pub history: Mutex<StatsHistory>,
}

impl Default for DiskStats {
    fn default() -> Self {
        Self {
            current: HddAtomicStatistics::default(),
            history: Mutex::new(StatsHistory {
                slots: vec![HddStatistics::default(); STATS_HISTORY_IN_24_HOURS].into_boxed_slice(),
                pos: 0,
            }),
        }
    }
}

impl DiskStats {
    /// Moves the current minute into the history ring.
    pub fn rotate(&self) {
        let minute = self.current.take();
        let mut history = self.history.lock();
        history.pos = if history.pos == 0 {
            STATS_HISTORY_IN_24_HOURS - 1
        } else {
            history.pos - 1
        };
        let pos = history.pos;
        history.slots[pos] = minute;
    }

    /// Drops all recorded statistics (used when a damaged disk re-enters
    /// service after a reload).
    pub fn reset(&self) {
        let _ = self.current.take();
        let mut history = self.history.lock();
        history.slots.fill(HddStatistics::default());
        history.pos = 0;
    }

    /// Aggregates the last `minutes` slots of history.
    pub fn rollup(&self, minutes: usize) -> HddStatistics {
        let history = self.history.lock();
        let mut total = HddStatistics::default();
        for offset in 0..minutes.min(STATS_HISTORY_IN_24_HOURS) {
            total.add(&history.slots[(history.pos + offset) % STATS_HISTORY_IN_24_HOURS]);
        }
        total
    }
}

/// Times one data read and records it on the disk when dropped.
pub struct DiskReadStatsUpdater<'a> {
    disk: &'a Disk,
    bytes: u64,
    start: Instant,
    failed: bool,
}

impl<'a> DiskReadStatsUpdater<'a> {
    pub fn new(disk: &'a Disk, bytes: u64) -> Self {
        Self {
            disk,
            bytes,
            start: Instant::now(),
            failed: false,
        }
    }

    pub fn mark_read_as_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for DiskReadStatsUpdater<'_> {
    fn drop(&mut self) {
        let usec = self.start.elapsed().as_micros() as u64;
        let bytes = if self.failed { 0 } else { self.bytes };
        self.disk.stats.current.data_read(bytes, usec);
    }
}

/// Times one data write and records it on the disk when dropped.
pub struct DiskWriteStatsUpdater<'a> {
    disk: &'a Disk,
    bytes: u64,
    start: Instant,
    failed: bool,
}

impl<'a> DiskWriteStatsUpdater<'a> {
    pub fn new(disk: &'a Disk, bytes: u64) -> Self {
        Self {
            disk,
            bytes,
            start: Instant::now(),
            failed: false,
        }
    }

    pub fn mark_write_as_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for DiskWriteStatsUpdater<'_> {
    fn drop(&mut self) {
        let usec = self.start.elapsed().as_micros() as u64;
        let bytes = if self.failed { 0 } else { self.bytes };
        self.disk.stats.current.data_write(bytes, usec);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rotate_and_rollup() {
        let stats = DiskStats::default();
        stats.current.data_read(100, 7);
        stats.current.data_write(50, 3);
        stats.rotate();
        stats.current.data_read(10, 20);
        stats.rotate();

        let last_minute = stats.rollup(1);
        assert_eq!(last_minute.rbytes, 10);
        assert_eq!(last_minute.usec_read_max, 20);

        let last_hour = stats.rollup(60);
        assert_eq!(last_hour.rbytes, 110);
        assert_eq!(last_hour.wbytes, 50);
        assert_eq!(last_hour.rops, 2);
        assert_eq!(last_hour.usec_read_max, 20);
    }
}
