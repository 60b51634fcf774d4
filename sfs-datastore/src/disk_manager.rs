//! Disk selection and configuration management.
//!
//! Placement uses a per-disk `carry` accumulator: each round distributes
//! weight proportional to how far a disk's free-space ratio sits above a
//! floor derived from the emptiest disk, and the disk with the highest carry
//! pays 1.0 to receive the chunk. Long-run selection frequency converges to
//! `max(0, percent_avail - s) / d`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Error};
use parking_lot::Mutex;

use sfs_api_types::ChunkPartType;

use crate::chunk::{Chunk, ChunkState};
use crate::disk::{read_hdd_cfg, Disk, IoErrorRing, ScanState};
use crate::hdd_cfg::DiskCfgLine;

/// Upper bound applied to the configured test interval when sleeping.
pub const MAX_TEST_FREQ_MS: u64 = 1_000_000;

#[derive(Default)]
pub struct DiskManager {
    pub disks: Mutex<Vec<Arc<Disk>>>,
    test_cursor: Mutex<usize>,
    pub reset_tester: AtomicBool,
}

impl DiskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the disk for a new chunk, or `None` when no disk is eligible.
    /// The chunk part type does not influence the default strategy.
    pub fn get_disk_for_new_chunk(&self, _chunk_type: ChunkPartType) -> Option<Arc<Disk>> {
        let disks = self.disks.lock();
        if disks.is_empty() {
            return None;
        }

        let mut best: Option<Arc<Disk>> = None;
        let mut max_carry = 1.0f64;
        let mut min_percent_avail = f64::MAX;
        let mut max_percent_avail = 0.0f64;

        for disk in disks.iter() {
            let state = disk.state.lock();
            if !state.is_selectable_for_new_chunk() {
                continue;
            }

            if state.carry >= max_carry {
                max_carry = state.carry;
                best = Some(disk.clone());
            }

            let percent_avail = state.available_space as f64 / state.total_space as f64;
            min_percent_avail = min_percent_avail.min(percent_avail);
            max_percent_avail = max_percent_avail.max(percent_avail);
        }

        if let Some(disk) = best {
            // lower the probability of being chosen again
            disk.state.lock().carry -= 1.0;
            return Some(disk);
        }

        if max_percent_avail == 0.0 {
            return None;
        }

        let threshold = if max_percent_avail < 0.01 {
            0.0
        } else {
            (min_percent_avail * 0.8).max(0.01)
        };
        let spread = max_percent_avail - threshold;

        let mut best: Option<Arc<Disk>> = None;
        let mut max_carry = 1.0f64;

        for disk in disks.iter() {
            let mut state = disk.state.lock();
            if !state.is_selectable_for_new_chunk() {
                continue;
            }

            let percent_avail = state.available_space as f64 / state.total_space as f64;
            if percent_avail > threshold {
                state.carry += (percent_avail - threshold) / spread;
            }
            if state.carry >= max_carry {
                max_carry = state.carry;
                best = Some(disk.clone());
            }
        }

        if let Some(disk) = &best {
            disk.state.lock().carry -= 1.0;
        }
        best
    }

    /// Advances the round-robin cursor and returns the next chunk due for a
    /// checksum test, rate limited to one pick per `test_freq_ms`.
    pub fn get_chunk_to_test(
        &self,
        elapsed_ms: &mut u64,
        test_freq_ms: u64,
        disk_actions_enabled: bool,
    ) -> Option<Arc<Chunk>> {
        *elapsed_ms += test_freq_ms.min(MAX_TEST_FREQ_MS);
        if *elapsed_ms < test_freq_ms || !disk_actions_enabled {
            return None;
        }
        *elapsed_ms = 0;

        let disks = self.disks.lock();
        if disks.is_empty() {
            return None;
        }

        let suitable = |disk: &Disk| {
            let state = disk.state.lock();
            !state.is_damaged
                && !state.is_marked_for_deletion()
                && !state.was_removed_from_config
                && state.scan_state == ScanState::Working
        };

        let mut cursor = self.test_cursor.lock();
        let start = *cursor % disks.len();
        let mut index = start;
        loop {
            index = (index + 1) % disks.len();
            if suitable(&disks[index]) || index == start {
                break;
            }
        }
        *cursor = index;

        if !suitable(&disks[index]) {
            return None;
        }

        let chunk = disks[index].chunks.lock().chunk_to_test()?;
        if chunk.state() == ChunkState::Available {
            Some(chunk)
        } else {
            None
        }
    }

    pub fn reset_test_cursor(&self) {
        *self.test_cursor.lock() = 0;
    }

    /// Re-reads the hdd configuration. Existing disks are updated in place,
    /// new ones appended; disks missing from the file keep
    /// `was_removed_from_config` set and are retired by the supervisor.
    pub fn reload_disks_from_cfg(&self, hdd_cfg_path: &Path, leave_free: u64) -> Result<(), Error> {
        let lines = read_hdd_cfg(hdd_cfg_path)?;
        log::info!("hdd configuration file {} opened", hdd_cfg_path.display());

        {
            let disks = self.disks.lock();
            for disk in disks.iter() {
                disk.state.lock().was_removed_from_config = true;
            }
        }

        for line in &lines {
            self.apply_cfg_line(line, leave_free)?;
        }

        let disks = self.disks.lock();
        let mut any_disk_available = false;
        for disk in disks.iter() {
            let (removed, scan_state) = {
                let state = disk.state.lock();
                (state.was_removed_from_config, state.scan_state)
            };
            if removed {
                log::info!("hdd space manager: disk {} will be removed", disk.description());
                continue;
            }
            any_disk_available = true;
            match scan_state {
                ScanState::Needed => {
                    log::info!("hdd space manager: disk {} will be scanned", disk.description());
                }
                ScanState::SendNeeded => {
                    log::info!("hdd space manager: disk {} will be resent", disk.description());
                }
                _ => {
                    log::info!("hdd space manager: disk {} didn't change", disk.description());
                }
            }
        }

        if !any_disk_available {
            bail!(
                "no data paths defined in the {} file",
                hdd_cfg_path.display()
            );
        }
        Ok(())
    }

    fn apply_cfg_line(&self, line: &DiskCfgLine, leave_free: u64) -> Result<(), Error> {
        let is_lock_needed = {
            let disks = self.disks.lock();
            for disk in disks.iter() {
                if disk.meta_path() == line.meta_path && disk.data_path() != line.data_path {
                    bail!(
                        "combination of metadata and data paths changed between reloads for: {}",
                        line.description()
                    );
                }
            }
            !disks.iter().any(|disk| disk.meta_path() == line.meta_path)
        };

        let new_disk = Arc::new(Disk::new(line, leave_free)?);
        new_disk.create_paths_and_subfolders();
        {
            let disks = self.disks.lock();
            new_disk.create_lock_files(is_lock_needed, &disks)?;
        }

        let disks = self.disks.lock();
        for disk in disks.iter() {
            if disk.meta_path() != line.meta_path {
                continue;
            }

            // Reload of a disk already in memory: refresh its configurable
            // attributes; the new instance (and its lock files) goes away.
            let new_state = *new_disk.state.lock();
            let mut state = disk.state.lock();

            if state.is_damaged {
                state.scan_state = ScanState::Needed;
                state.scan_progress = 0;
                state.is_damaged = new_state.is_damaged;
                state.available_space = 0;
                state.total_space = 0;
                state.leave_free_space = leave_free;
                state.last_refresh = 0;
                disk.stats.reset();
                *disk.last_errors.lock() = IoErrorRing::default();
                disk.need_refresh.store(true, Ordering::Relaxed);
            } else if state.is_marked_for_removal != line.is_marked_for_removal
                || state.is_read_only != new_state.is_read_only
            {
                // important change, chunks need to be sent to master again
                state.scan_state = ScanState::SendNeeded;
            }

            state.was_removed_from_config = false;
            state.is_read_only = new_state.is_read_only;
            state.is_marked_for_removal = line.is_marked_for_removal;
            return Ok(());
        }
        drop(disks);

        self.disks.lock().push(new_disk);
        self.reset_tester.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Sum of space and chunk counts over the usable disks, split between
    /// regular disks and those marked for deletion.
    pub fn total_space(&self) -> sfs_api_types::SpaceUsage {
        let mut usage = sfs_api_types::SpaceUsage::default();
        let disks = self.disks.lock();
        for disk in disks.iter() {
            let state = disk.state.lock();
            if state.is_damaged || state.was_removed_from_config {
                continue;
            }
            let chunk_count = disk.chunks.lock().len() as u32;
            if state.is_marked_for_deletion() {
                if state.scan_state == ScanState::Working {
                    usage.to_del_total_space += state.total_space;
                    usage.to_del_used_space += state.total_space - state.available_space;
                }
                usage.to_del_chunk_count += chunk_count;
            } else {
                if state.scan_state == ScanState::Working {
                    usage.total_space += state.total_space;
                    usage.used_space += state.total_space - state.available_space;
                }
                usage.chunk_count += chunk_count;
            }
        }
        usage
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn disk_with_space(meta: &str, total: u64, available: u64) -> Arc<Disk> {
        let disk = Disk::new(
            &DiskCfgLine {
                meta_path: PathBuf::from(meta),
                data_path: PathBuf::from(meta),
                is_marked_for_removal: false,
                is_zoned: false,
            },
            0,
        )
        .unwrap();
        {
            let mut state = disk.state.lock();
            state.scan_state = ScanState::Working;
            state.total_space = total;
            state.available_space = available;
            state.carry = 0.0;
        }
        Arc::new(disk)
    }

    #[test]
    fn placement_prefers_free_disks_proportionally() {
        let manager = DiskManager::new();
        let disk_a = disk_with_space("/mnt/a", 1000, 500);
        let disk_b = disk_with_space("/mnt/b", 1000, 900);
        manager.disks.lock().push(disk_a.clone());
        manager.disks.lock().push(disk_b.clone());

        let mut picks_a = 0u32;
        let mut picks_b = 0u32;
        for _ in 0..1000 {
            let chosen = manager
                .get_disk_for_new_chunk(ChunkPartType::standard())
                .unwrap();
            if Arc::ptr_eq(&chosen, &disk_a) {
                picks_a += 1;
            } else {
                picks_b += 1;
            }
        }

        // s = 0.4, weights: a = 0.1/d, b = 0.5/d, so b should win 5x as often
        assert_eq!(picks_a + picks_b, 1000);
        let ratio = picks_b as f64 / picks_a as f64;
        assert!(ratio > 4.0, "ratio {ratio}");
    }

    #[test]
    fn placement_skips_unusable_disks() {
        let manager = DiskManager::new();
        assert!(manager
            .get_disk_for_new_chunk(ChunkPartType::standard())
            .is_none());

        let full = disk_with_space("/mnt/full", 1000, 0);
        manager.disks.lock().push(full);
        assert!(manager
            .get_disk_for_new_chunk(ChunkPartType::standard())
            .is_none());

        let damaged = disk_with_space("/mnt/damaged", 1000, 500);
        damaged.state.lock().is_damaged = true;
        manager.disks.lock().push(damaged);
        assert!(manager
            .get_disk_for_new_chunk(ChunkPartType::standard())
            .is_none());

        let good = disk_with_space("/mnt/good", 1000, 500);
        manager.disks.lock().push(good.clone());
        let chosen = manager
            .get_disk_for_new_chunk(ChunkPartType::standard())
            .unwrap();
        assert!(Arc::ptr_eq(&chosen, &good));
    }

    #[test]
    fn carry_priority_wins_before_redistribution() {
        let manager = DiskManager::new();
        let disk_a = disk_with_space("/mnt/a", 1000, 100);
        let disk_b = disk_with_space("/mnt/b", 1000, 900);
        disk_a.state.lock().carry = 2.5;
        manager.disks.lock().push(disk_a.clone());
        manager.disks.lock().push(disk_b);

        let chosen = manager
            .get_disk_for_new_chunk(ChunkPartType::standard())
            .unwrap();
        assert!(Arc::ptr_eq(&chosen, &disk_a));
        let carry = disk_a.state.lock().carry;
        assert!((carry - 1.5).abs() < 1e-9);
    }
}
