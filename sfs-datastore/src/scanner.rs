//! Per-disk background scan: populate the registry from the binary metadata
//! cache when a consistent one exists, otherwise walk the `chunksNN`
//! subfolders. Progress is reported in whole percents; a cancellation flag
//! is observed every 1000 files.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use sfs_api_types::ChunkPartType;

use crate::chunk::ChunkState;
use crate::chunk_filename;
use crate::disk::{Disk, ScanState};
use crate::engine::HddEngine;
use crate::metadata_cache;
use crate::registry::{ChunkGetMode, ChunkGuard};

const TERMINATE_CHECK_INTERVAL: u32 = 1000;

pub fn disk_scan_thread(engine: Arc<HddEngine>, disk: Arc<Disk>) {
    let begin = Instant::now();
    engine.scans_in_progress.fetch_add(1, Ordering::Relaxed);

    disk.refresh_data_disk_usage();
    engine.reports.mark_space_changed();

    disk_scan(&engine, &disk, begin);

    log::info!("randomizing chunks for disk {}", disk.description());
    disk.chunks.lock().shuffle();

    engine.scans_in_progress.fetch_sub(1, Ordering::Relaxed);

    if disk.state.lock().scan_state == ScanState::Terminate {
        log::info!("scanning disk {}: interrupted", disk.description());
    } else {
        log::info!(
            "scanning disk {}: complete ({}s)",
            disk.description(),
            begin.elapsed().as_secs()
        );
    }

    let mut state = disk.state.lock();
    state.scan_state = ScanState::ThreadFinished;
    state.scan_progress = 100;
}

fn disk_scan(engine: &Arc<HddEngine>, disk: &Arc<Disk>, begin: Instant) {
    if disk.state.lock().scan_state == ScanState::Terminate {
        return;
    }

    if metadata_cache::disk_can_load_from_cache(engine, disk) {
        if scan_disk_from_binary_cache(engine, disk) {
            log::info!(
                "loaded disk metadata from cache: {}",
                disk.description()
            );
        } else {
            log::error!(
                "can't load disk metadata from cache: {}",
                disk.description()
            );
        }
    } else {
        scan_disk_from_subfolders(engine, disk, begin);
    }
}

fn scan_disk_from_subfolders(engine: &Arc<HddEngine>, disk: &Arc<Disk>, begin: Instant) {
    let mut files_since_check = 0u32;
    let mut last_percent = 0u8;

    for subfolder in 0..chunk_filename::NUMBER_OF_SUBFOLDERS {
        let subfolder_path = disk
            .meta_path()
            .join(chunk_filename::subfolder_name(subfolder as u8));
        let entries = match std::fs::read_dir(&subfolder_path) {
            Ok(entries) => entries,
            Err(_) => continue,
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };

            let Some(parsed) = chunk_filename::parse(name) else {
                if name != "." && name != ".." && !name.ends_with(".dat") {
                    log::warn!(
                        "invalid file {name} placed in chunks directory {}; skipping it",
                        subfolder_path.display()
                    );
                }
                continue;
            };
            if !parsed.is_for_metadata {
                continue;
            }

            if u32::from(chunk_filename::subfolder_number(parsed.chunk_id)) != subfolder {
                log::warn!(
                    "chunk {} placed in a wrong directory {}; skipping it",
                    name,
                    subfolder_path.display()
                );
                continue;
            }

            add_chunk_from_disk_scan(
                engine,
                disk,
                &subfolder_path.join(name),
                parsed.chunk_id,
                parsed.version,
                parsed.chunk_type,
            );

            files_since_check += 1;
            if files_since_check >= TERMINATE_CHECK_INTERVAL {
                if disk.state.lock().scan_state == ScanState::Terminate {
                    return;
                }
                files_since_check = 0;
            }
        }

        let percent = (subfolder * 100 / chunk_filename::NUMBER_OF_SUBFOLDERS) as u8;
        if percent > last_percent {
            last_percent = percent;
            disk.state.lock().scan_progress = percent;
            engine.reports.mark_space_changed();
            log::info!(
                "scanning disk {}: {percent}% ({}s)",
                disk.description(),
                begin.elapsed().as_secs()
            );
        }
    }
}

fn scan_disk_from_binary_cache(engine: &Arc<HddEngine>, disk: &Arc<Disk>) -> bool {
    let Some(cache_dir) = engine.metadata_cache_path() else {
        return false;
    };
    let cache_path = metadata_cache::cache_filename(&cache_dir, disk.meta_path());

    let content = match std::fs::read(&cache_path) {
        Ok(content) => content,
        Err(err) => {
            log::error!("failed to open cache file {}: {err}", cache_path.display());
            return false;
        }
    };

    let record_count = content.len() / metadata_cache::CHUNK_RECORD_SIZE;
    log::info!(
        "cache file {}: {} bytes, {record_count} chunks",
        cache_path.display(),
        content.len()
    );

    let mut files_since_check = 0u32;
    for record in content.chunks_exact(metadata_cache::CHUNK_RECORD_SIZE) {
        let Some(record) = metadata_cache::parse_chunk_record(record) else {
            log::warn!(
                "cache file {} contains an invalid record; skipping it",
                cache_path.display()
            );
            continue;
        };

        let meta_filename = chunk_filename::generate(
            disk.meta_path(),
            record.id,
            record.version,
            record.chunk_type,
            true,
        );
        add_chunk_from_disk_scan(
            engine,
            disk,
            &meta_filename,
            record.id,
            record.version,
            record.chunk_type,
        );

        files_since_check += 1;
        if files_since_check >= TERMINATE_CHECK_INTERVAL {
            if disk.state.lock().scan_state == ScanState::Terminate {
                break;
            }
            files_since_check = 0;
        }
    }

    disk.state.lock().scan_progress = 100;
    engine.reports.mark_space_changed();

    // drop the control file so a crash can't replay a stale cache; it is
    // rewritten on the next graceful shutdown
    let control_path = metadata_cache::control_filename(&cache_path);
    if control_path.exists() {
        let _ = std::fs::remove_file(control_path);
    }

    true
}

/// Feeds one discovered chunk file into the registry.
///
/// A version older than the registered chunk loses its files; a newer one
/// replaces the registry entry. Fresh chunks are announced to the master.
pub(crate) fn add_chunk_from_disk_scan(
    engine: &HddEngine,
    disk: &Arc<Disk>,
    fullname: &Path,
    chunk_id: u64,
    version: u32,
    chunk_type: ChunkPartType,
) {
    let mut guard = match engine.find_or_create_chunk_and_lock(
        disk,
        chunk_id,
        chunk_type,
        ChunkGetMode::FindOrCreate,
    ) {
        Ok(guard) => guard,
        Err(err) => {
            log::error!("can't use file {} as chunk: {err}", fullname.display());
            return;
        }
    };

    let is_new_chunk = guard.io.lock().meta_filename.as_os_str().is_empty();

    if !is_new_chunk {
        if version <= guard.version() {
            // the file we just found is stale
            if !disk.state.lock().is_read_only {
                let _ = std::fs::remove_file(fullname);
            }
            return;
        }

        // a newer copy wins: drop the old files and rebuild the entry on
        // the disk that holds the newer one
        if !disk.state.lock().is_read_only {
            let io = guard.io.lock();
            let _ = guard.owner.backend().unlink_chunk(&io);
        }
        guard = match engine.recreate_chunk(guard, disk, chunk_id, chunk_type) {
            Ok(guard) => guard,
            Err(err) => {
                log::error!("can't use file {} as chunk: {err}", fullname.display());
                return;
            }
        };
    }

    guard.set_version(version);
    {
        let chunk = guard.chunk();
        let mut io = chunk.io.lock();
        chunk.update_filenames_from_version(&mut io, version);
        if let Err(err) = disk.update_chunk_attributes(chunk, &io) {
            log::debug!(
                "attributes of chunk file {} not usable yet: {err}",
                fullname.display()
            );
        }
        io.valid_attr = false;
    }

    disk.chunks.lock().insert(guard.chunk().clone());

    if is_new_chunk {
        engine.reports.report_new_chunk(
            chunk_id,
            version,
            disk.is_marked_for_deletion(),
            chunk_type,
        );
    }
}

impl HddEngine {
    /// Replaces a registry entry with a fresh chunk owned by `disk`; used
    /// when a scan discovers a newer version of an already registered chunk.
    pub(crate) fn recreate_chunk(
        &self,
        guard: ChunkGuard<'_>,
        disk: &Arc<Disk>,
        chunk_id: u64,
        chunk_type: ChunkPartType,
    ) -> Result<ChunkGuard<'_>, crate::error::ChunkOpError> {
        let old = guard.into_chunk();

        {
            let mut io = old.io.lock();
            self.open_chunks.purge(io.meta_fd);
            io.meta_fd = -1;
            io.data_fd = -1;
        }
        old.owner.chunks.lock().remove(&old);
        self.registry.remove(chunk_id, chunk_type);

        {
            let mut sync = old.sync.lock();
            sync.state = ChunkState::Deleted;
            sync.ref_count = sync.ref_count.saturating_sub(1);
            if let Some(slot) = sync.cond_var.clone() {
                if slot.waiters.load(Ordering::Relaxed) > 0 {
                    drop(sync);
                    slot.cond.notify_one();
                }
            }
        }

        self.find_or_create_chunk_and_lock(disk, chunk_id, chunk_type, ChunkGetMode::CreateOnly)
    }
}
