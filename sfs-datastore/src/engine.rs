//! The storage engine value.
//!
//! `HddEngine` owns every piece of shared state (chunk registry, disks,
//! open-chunk pool, report queues, runtime configuration) and the background
//! worker threads. There are no process-wide singletons: handlers receive
//! the engine explicitly, and `shutdown` leaves the process clean.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Error};
use parking_lot::Mutex;
use std::thread::JoinHandle;

use sfs_api_types::{ChunkWithVersionAndType, SpaceUsage};

use crate::chunk::ChunkState;
use crate::disk::{wall_clock_secs, Disk, ScanState, ERROR_LIMIT};
use crate::disk_manager::DiskManager;
use crate::open_chunk_pool::{OpenChunkPool, MAX_EVICTIONS_PER_SWEEP, OPEN_CHUNK_IDLE_WINDOW};
use crate::registry::ChunkRegistry;
use crate::reports::MasterReports;
use crate::unique_queue::UniqueQueue;

/// Parsed runtime configuration, see the chunkserver configuration file.
#[derive(Clone, Debug)]
pub struct HddConfig {
    pub hdd_conf_filename: PathBuf,
    pub hdd_test_freq_ms: u64,
    pub check_crc_when_reading: bool,
    pub check_crc_when_writing: bool,
    pub advise_no_cache: bool,
    pub punch_holes: bool,
    pub leave_space_default: u64,
    pub perform_fsync: bool,
    pub metadata_cache_path: Option<PathBuf>,
}

impl Default for HddConfig {
    fn default() -> Self {
        Self {
            hdd_conf_filename: PathBuf::from("sfshdd.cfg"),
            hdd_test_freq_ms: 10_000,
            check_crc_when_reading: true,
            check_crc_when_writing: true,
            advise_no_cache: false,
            punch_holes: false,
            leave_space_default: 256 << 20,
            perform_fsync: true,
            metadata_cache_path: None,
        }
    }
}

/// Reload-safe runtime knobs.
#[derive(Default)]
pub struct RuntimeFlags {
    test_freq_ms: AtomicU64,
    check_crc_when_reading: AtomicBool,
    check_crc_when_writing: AtomicBool,
    advise_no_cache: AtomicBool,
    punch_holes: AtomicBool,
    perform_fsync: AtomicBool,
    leave_free: AtomicU64,
}

impl RuntimeFlags {
    pub fn test_freq_ms(&self) -> u64 {
        self.test_freq_ms.load(Ordering::Relaxed)
    }

    pub fn check_crc_when_reading(&self) -> bool {
        self.check_crc_when_reading.load(Ordering::Relaxed)
    }

    pub fn check_crc_when_writing(&self) -> bool {
        self.check_crc_when_writing.load(Ordering::Relaxed)
    }

    pub fn advise_no_cache(&self) -> bool {
        self.advise_no_cache.load(Ordering::Relaxed)
    }

    pub fn punch_holes(&self) -> bool {
        self.punch_holes.load(Ordering::Relaxed)
    }

    pub fn perform_fsync(&self) -> bool {
        self.perform_fsync.load(Ordering::Relaxed)
    }

    pub fn leave_free(&self) -> u64 {
        self.leave_free.load(Ordering::Relaxed)
    }
}

pub struct HddEngine {
    pub registry: ChunkRegistry,
    pub disk_manager: DiskManager,
    pub open_chunks: OpenChunkPool,
    pub reports: MasterReports,
    pub test_queue: UniqueQueue<ChunkWithVersionAndType>,
    pub flags: RuntimeFlags,
    pub terminate: AtomicBool,
    /// Gates the supervisor and tester while a configuration reload rewrites
    /// the disk list.
    pub disk_actions_enabled: AtomicBool,
    pub scans_in_progress: AtomicU32,
    hdd_conf_filename: Mutex<PathBuf>,
    metadata_cache_path: Mutex<Option<PathBuf>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    weak_self: Mutex<Weak<HddEngine>>,
}

impl HddEngine {
    pub(crate) fn build(cfg: &HddConfig) -> Self {
        let engine = Self {
            registry: ChunkRegistry::new(),
            disk_manager: DiskManager::new(),
            open_chunks: OpenChunkPool::new(),
            reports: MasterReports::new(),
            test_queue: UniqueQueue::new(),
            flags: RuntimeFlags::default(),
            terminate: AtomicBool::new(false),
            disk_actions_enabled: AtomicBool::new(true),
            scans_in_progress: AtomicU32::new(0),
            hdd_conf_filename: Mutex::new(cfg.hdd_conf_filename.clone()),
            metadata_cache_path: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            weak_self: Mutex::new(Weak::new()),
        };
        engine.apply_config(cfg);
        engine
    }

    pub(crate) fn into_shared(self) -> Arc<Self> {
        let engine = Arc::new(self);
        *engine.weak_self.lock() = Arc::downgrade(&engine);
        engine
    }

    fn arc_self(&self) -> Arc<HddEngine> {
        self.weak_self
            .lock()
            .upgrade()
            .expect("engine used before into_shared")
    }

    /// Initializes the engine from the configuration: ingests the hdd config
    /// file and prepares all disks for scanning. Fails when the disk list is
    /// unusable; that is the only fatal path of the engine.
    pub fn new(cfg: &HddConfig) -> Result<Arc<Self>, Error> {
        if cfg.leave_space_default < u64::from(sfs_api_types::SFSCHUNKSIZE) {
            log::warn!(
                "HDD_LEAVE_SPACE_DEFAULT < chunk size - leaving so small space on hdd is not recommended"
            );
        }

        let engine = Self::build(cfg).into_shared();
        engine
            .disk_manager
            .reload_disks_from_cfg(&cfg.hdd_conf_filename, cfg.leave_space_default)
            .context("hdd space manager: disk configuration failed")?;

        {
            let disks = engine.disk_manager.disks.lock();
            for disk in disks.iter() {
                log::info!("hdd space manager: disk to scan: {}", disk.description());
            }
        }
        log::info!("hdd space manager: start background hdd scanning (searching for available chunks)");

        Ok(engine)
    }

    fn apply_config(&self, cfg: &HddConfig) {
        self.flags
            .test_freq_ms
            .store(cfg.hdd_test_freq_ms, Ordering::Relaxed);
        self.flags
            .check_crc_when_reading
            .store(cfg.check_crc_when_reading, Ordering::Relaxed);
        self.flags
            .check_crc_when_writing
            .store(cfg.check_crc_when_writing, Ordering::Relaxed);
        self.flags
            .advise_no_cache
            .store(cfg.advise_no_cache, Ordering::Relaxed);
        self.flags.punch_holes.store(cfg.punch_holes, Ordering::Relaxed);
        self.flags
            .perform_fsync
            .store(cfg.perform_fsync, Ordering::Relaxed);
        self.flags
            .leave_free
            .store(cfg.leave_space_default, Ordering::Relaxed);
        *self.hdd_conf_filename.lock() = cfg.hdd_conf_filename.clone();

        let mut cache_path = self.metadata_cache_path.lock();
        *cache_path = None;
        if let Some(path) = &cfg.metadata_cache_path {
            if path.exists() {
                log::info!("metadata cache path set to {}", path.display());
                *cache_path = Some(path.clone());
            } else {
                log::error!("metadata cache path {} does not exist", path.display());
            }
        }
    }

    pub fn metadata_cache_path(&self) -> Option<PathBuf> {
        self.metadata_cache_path.lock().clone()
    }

    pub fn hdd_conf_filename(&self) -> PathBuf {
        self.hdd_conf_filename.lock().clone()
    }

    /// Configuration reload. Errors are logged, not fatal: the engine keeps
    /// running with the previous disk set.
    pub fn reload(&self, cfg: &HddConfig) {
        self.apply_config(cfg);
        log::info!("reloading hdd data ...");

        self.disk_actions_enabled.store(false, Ordering::Relaxed);
        let result = self
            .disk_manager
            .reload_disks_from_cfg(&cfg.hdd_conf_filename, cfg.leave_space_default);
        self.disk_actions_enabled.store(true, Ordering::Relaxed);

        if let Err(err) = result {
            log::error!("{err:#}");
        }
    }

    /// Spawns the background workers: the chunk tester, the disks
    /// supervisor, the open-chunk sweeper and the async re-test consumer.
    pub fn start(&self) -> Result<(), Error> {
        let mut workers = self.workers.lock();

        let engine = self.arc_self();
        workers.push(
            std::thread::Builder::new()
                .name("testerThread".into())
                .spawn(move || crate::tester::tester_thread(engine))?,
        );

        let engine = self.arc_self();
        workers.push(
            std::thread::Builder::new()
                .name("disksThread".into())
                .spawn(move || engine.disks_thread())?,
        );

        let engine = self.arc_self();
        workers.push(
            std::thread::Builder::new()
                .name("freeResThread".into())
                .spawn(move || engine.free_resources_thread())?,
        );

        let engine = self.arc_self();
        workers.push(
            std::thread::Builder::new()
                .name("testChunkThread".into())
                .spawn(move || crate::tester::test_chunk_thread(engine))?,
        );

        Ok(())
    }

    fn disks_thread(self: Arc<Self>) {
        let mut ticks = 0u32;
        while !self.terminate.load(Ordering::Relaxed) {
            self.check_disks();
            ticks += 1;
            if ticks % 60 == 0 {
                self.rotate_disk_stats();
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    fn free_resources_thread(self: Arc<Self>) {
        while !self.terminate.load(Ordering::Relaxed) {
            self.free_unused_open_chunks(MAX_EVICTIONS_PER_SWEEP);
            std::thread::sleep(OPEN_CHUNK_IDLE_WINDOW);
        }
    }

    fn rotate_disk_stats(&self) {
        let disks = self.disk_manager.disks.lock();
        for disk in disks.iter() {
            disk.stats.rotate();
        }
    }

    /// One supervisor tick: retire disks dropped from the configuration,
    /// drive the scan-state machine, detect damaged disks from the error
    /// ring and keep the space accounting fresh.
    pub fn check_disks(&self) {
        if !self.disk_actions_enabled.load(Ordering::Relaxed) {
            return;
        }

        let now = wall_clock_secs();
        let mut changed = false;
        let snapshot: Vec<Arc<Disk>> = self.disk_manager.disks.lock().clone();
        let mut disks_to_retire = Vec::new();

        for disk in &snapshot {
            let (removed, scan_state) = {
                let state = disk.state.lock();
                (state.was_removed_from_config, state.scan_state)
            };
            if !removed {
                continue;
            }

            match scan_state {
                ScanState::InProgress => {
                    disk.state.lock().scan_state = ScanState::Terminate;
                }
                ScanState::Terminate => {}
                ScanState::ThreadFinished
                | ScanState::SendNeeded
                | ScanState::Needed
                | ScanState::Working => {
                    if scan_state == ScanState::ThreadFinished {
                        self.join_scan_thread(disk);
                    }
                    disk.state.lock().scan_state = ScanState::Working;
                    self.send_data_to_master(disk, true);
                    changed = true;
                    disk.state.lock().was_removed_from_config = false;

                    log::info!("disk {} successfully removed", disk.description());
                    disks_to_retire.push(disk.clone());
                    self.disk_manager.reset_tester.store(true, Ordering::Relaxed);
                }
            }
        }

        if !disks_to_retire.is_empty() {
            let mut disks = self.disk_manager.disks.lock();
            disks.retain(|disk| {
                !disks_to_retire
                    .iter()
                    .any(|retired| Arc::ptr_eq(retired, disk))
            });
        }

        let snapshot: Vec<Arc<Disk>> = self.disk_manager.disks.lock().clone();
        for disk in &snapshot {
            let (skip, scan_state) = {
                let state = disk.state.lock();
                (
                    state.is_damaged || state.was_removed_from_config,
                    state.scan_state,
                )
            };
            if skip {
                continue;
            }

            match scan_state {
                ScanState::Needed => {
                    disk.state.lock().scan_state = ScanState::InProgress;
                    self.spawn_scan_thread(disk);
                }
                ScanState::ThreadFinished => {
                    self.join_scan_thread(disk);
                    disk.state.lock().scan_state = ScanState::Working;
                    disk.refresh_data_disk_usage();
                    disk.need_refresh.store(false, Ordering::Relaxed);
                    disk.state.lock().last_refresh = now;
                    changed = true;
                }
                ScanState::SendNeeded => {
                    self.send_data_to_master(disk, false);
                    disk.state.lock().scan_state = ScanState::Working;
                    disk.refresh_data_disk_usage();
                    disk.need_refresh.store(false, Ordering::Relaxed);
                    disk.state.lock().last_refresh = now;
                    changed = true;
                }
                ScanState::Working => {
                    let errors = disk.last_errors.lock().recent_serious_errors(now);
                    let tolerated = {
                        let state = disk.state.lock();
                        state.is_marked_for_removal && state.is_read_only
                    };
                    if errors >= ERROR_LIMIT && !tolerated {
                        log::warn!(
                            "{errors} errors occurred in {} seconds on disk {}",
                            crate::disk::LAST_ERROR_TIME_SECS,
                            disk.description()
                        );
                        self.send_data_to_master(disk, true);
                        disk.state.lock().is_damaged = true;
                        changed = true;
                    } else {
                        let refresh_due = disk.need_refresh.load(Ordering::Relaxed)
                            || disk.state.lock().last_refresh + 60 < now;
                        if refresh_due {
                            disk.refresh_data_disk_usage();
                            disk.need_refresh.store(false, Ordering::Relaxed);
                            disk.state.lock().last_refresh = now;
                            changed = true;
                        }
                    }
                }
                ScanState::InProgress | ScanState::Terminate => {}
            }
        }

        if changed {
            self.reports.mark_space_changed();
        }
    }

    fn spawn_scan_thread(&self, disk: &Arc<Disk>) {
        let engine = self.arc_self();
        let disk_for_thread = disk.clone();
        match std::thread::Builder::new()
            .name("diskScanThread".into())
            .spawn(move || crate::scanner::disk_scan_thread(engine, disk_for_thread))
        {
            Ok(handle) => {
                *disk.scan_thread.lock() = Some(handle);
            }
            Err(err) => {
                log::error!("failed to spawn scan thread for {}: {err}", disk.description());
                disk.state.lock().scan_state = ScanState::Needed;
            }
        }
    }

    fn join_scan_thread(&self, disk: &Arc<Disk>) {
        if let Some(handle) = disk.scan_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Announces every chunk owned by `disk` to the master: as lost (and
    /// removed from the registry) when the disk goes away, or re-registered
    /// as new otherwise.
    pub fn send_data_to_master(&self, disk: &Arc<Disk>, is_for_removal: bool) {
        let marked_for_deletion = disk.is_marked_for_deletion();

        for chunk in self.registry.snapshot() {
            if !Arc::ptr_eq(&chunk.owner, disk) {
                continue;
            }

            if !is_for_removal {
                self.reports.report_new_chunk(
                    chunk.id,
                    chunk.version(),
                    marked_for_deletion,
                    chunk.ctype,
                );
                continue;
            }

            self.reports.report_lost_chunk(chunk.id, chunk.ctype);
            let mut sync = chunk.sync.lock();
            match sync.state {
                ChunkState::Available => {
                    sync.state = ChunkState::Deleted;
                    drop(sync);
                    self.remove_chunk_from_containers(&chunk);
                }
                ChunkState::Locked => {
                    sync.state = ChunkState::ToBeDeleted;
                }
                _ => {}
            }
        }
    }

    /// Records an I/O failure against the chunk's disk and bumps the global
    /// error counter consumed by the master loop.
    pub fn add_disk_error(&self, chunk: &crate::chunk::Chunk, errno: i32) {
        chunk.owner.add_io_error(chunk.id, errno);
        self.reports.count_error();
    }

    /// Evicts open-chunk entries idle past the window. Each eviction
    /// try-locks its chunk, so in-flight operations are never disturbed.
    pub fn free_unused_open_chunks(&self, max_evictions: usize) {
        let candidates = self
            .open_chunks
            .idle_candidates(OPEN_CHUNK_IDLE_WINDOW, max_evictions);

        for chunk in candidates {
            if !self.try_lock_chunk(&chunk) {
                continue;
            }

            {
                let mut io = chunk.io.lock();
                if io.meta_fd >= 0 {
                    if io.was_changed {
                        if let Some(crc) = self.open_chunks.crc_for(io.meta_fd) {
                            let crc = crc.lock();
                            if let Err(err) = chunk.owner.backend().write_crc(&chunk, &io, &crc) {
                                log::warn!(
                                    "flushing crc of {} before eviction failed: {err}",
                                    chunk.description()
                                );
                            }
                        }
                        io.was_changed = false;
                    }
                    if self.open_chunks.evict(io.meta_fd) {
                        io.meta_fd = -1;
                        io.data_fd = -1;
                    }
                }
            }

            self.release_chunk(&chunk);
        }
    }

    pub fn get_total_space(&self) -> SpaceUsage {
        self.disk_manager.total_space()
    }

    /// Graceful shutdown: joins every worker, flushes dirty CRC blocks,
    /// writes the binary metadata cache and drops all state.
    pub fn shutdown(&self) {
        let was_terminating = self.terminate.swap(true, Ordering::SeqCst);
        if !was_terminating {
            let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
            for handle in workers {
                let _ = handle.join();
            }
        }

        let disks: Vec<Arc<Disk>> = self.disk_manager.disks.lock().clone();
        for disk in &disks {
            let mut state = disk.state.lock();
            if state.scan_state == ScanState::InProgress {
                state.scan_state = ScanState::Terminate;
            }
        }
        for disk in &disks {
            self.join_scan_thread(disk);
        }

        for chunk in self.registry.snapshot() {
            if chunk.state() != ChunkState::Available {
                log::warn!("shutdown: chunk still locked: {}", chunk.description());
                continue;
            }
            let mut io = chunk.io.lock();
            if io.was_changed {
                log::warn!("shutdown: CRC not flushed - writing now");
                if let Some(crc) = self.open_chunks.crc_for(io.meta_fd) {
                    let crc = crc.lock();
                    if let Err(err) = chunk.owner.backend().write_crc(&chunk, &io, &crc) {
                        log::warn!(
                            "shutdown: flushing crc of {} failed: {err}",
                            chunk.description()
                        );
                    }
                }
                io.was_changed = false;
            }
            self.open_chunks.purge(io.meta_fd);
            io.meta_fd = -1;
            io.data_fd = -1;
        }

        crate::metadata_cache::write_binary_metadata_cache(self);

        self.registry.clear();
        self.disk_manager.disks.lock().clear();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::hdd_cfg::DiskCfgLine;

    /// An engine with one in-memory disk and no background threads, for unit
    /// tests that don't touch the file system.
    pub(crate) fn test_engine() -> Arc<HddEngine> {
        let engine = HddEngine::build(&HddConfig::default()).into_shared();
        let disk = Disk::new(
            &DiskCfgLine {
                meta_path: PathBuf::from("/mnt/test-meta"),
                data_path: PathBuf::from("/mnt/test-data"),
                is_marked_for_removal: false,
                is_zoned: false,
            },
            0,
        )
        .unwrap();
        {
            let mut state = disk.state.lock();
            state.scan_state = ScanState::Working;
            state.total_space = 1 << 30;
            state.available_space = 1 << 29;
        }
        engine.disk_manager.disks.lock().push(Arc::new(disk));
        engine
    }
}
