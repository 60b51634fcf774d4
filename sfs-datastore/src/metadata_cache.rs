//! Binary metadata cache: a per-disk dump of the registry written at
//! shutdown so a restart can skip the full directory scan.
//!
//! Each cache file is a packed sequence of 16-byte records
//! (`id u64 | version u32 | type u16 | blocks u16`, all big-endian) next to a
//! plain-text `.control` manifest. The manifest guards consistency: it names
//! the disk, the record count and the format version, and is deleted after a
//! successful load so a crash never replays stale metadata.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use sfs_api_types::ChunkPartType;

use crate::disk::{wall_clock_secs, Disk};
use crate::engine::HddEngine;

pub const CHUNK_RECORD_SIZE: usize = 8 + 4 + 2 + 2;
pub const METADATA_CACHE_VERSION: u32 = 1;
pub const CACHE_FILE_EXTENSION: &str = ".cache";
pub const CONTROL_FILE_EXTENSION: &str = ".control";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedChunkRecord {
    pub id: u64,
    pub version: u32,
    pub chunk_type: ChunkPartType,
    pub blocks: u16,
}

pub fn serialize_chunk_record(record: &CachedChunkRecord, out: &mut Vec<u8>) {
    out.extend_from_slice(&record.id.to_be_bytes());
    out.extend_from_slice(&record.version.to_be_bytes());
    out.extend_from_slice(&record.chunk_type.to_u16().to_be_bytes());
    out.extend_from_slice(&record.blocks.to_be_bytes());
}

pub fn parse_chunk_record(buffer: &[u8]) -> Option<CachedChunkRecord> {
    if buffer.len() != CHUNK_RECORD_SIZE {
        return None;
    }
    Some(CachedChunkRecord {
        id: u64::from_be_bytes(buffer[0..8].try_into().unwrap()),
        version: u32::from_be_bytes(buffer[8..12].try_into().unwrap()),
        chunk_type: ChunkPartType::from_u16(u16::from_be_bytes(buffer[12..14].try_into().unwrap()))
            .ok()?,
        blocks: u16::from_be_bytes(buffer[14..16].try_into().unwrap()),
    })
}

/// `<cache dir>/<meta path with slashes turned into dots>.cache`
pub fn cache_filename(cache_dir: &Path, disk_meta_path: &Path) -> PathBuf {
    let flattened = disk_meta_path
        .to_string_lossy()
        .trim_matches('/')
        .replace('/', ".");
    cache_dir.join(format!("{flattened}{CACHE_FILE_EXTENSION}"))
}

pub fn control_filename(cache_path: &Path) -> PathBuf {
    let mut name = cache_path.as_os_str().to_owned();
    name.push(CONTROL_FILE_EXTENSION);
    PathBuf::from(name)
}

struct ControlFile {
    version: u32,
    disk: String,
    chunks: u64,
}

fn parse_control_file(content: &str) -> Option<ControlFile> {
    let mut version = None;
    let mut disk = None;
    let mut chunks = None;
    for line in content.lines() {
        let (key, value) = line.split_once(':')?;
        match key.trim() {
            "version" => version = value.trim().parse().ok(),
            "disk" => disk = Some(value.trim().to_owned()),
            "chunks" => chunks = value.trim().parse().ok(),
            "timestamp" => {}
            _ => return None,
        }
    }
    Some(ControlFile {
        version: version?,
        disk: disk?,
        chunks: chunks?,
    })
}

/// A disk may fast-path its scan when both cache and control files exist and
/// the manifest matches the cache content.
pub fn disk_can_load_from_cache(engine: &HddEngine, disk: &Disk) -> bool {
    let Some(cache_dir) = engine.metadata_cache_path() else {
        return false;
    };
    if disk.is_zoned_device() {
        log::warn!(
            "metadata cache for zoned devices is not supported, scanning {}",
            disk.description()
        );
        return false;
    }

    let cache_path = cache_filename(&cache_dir, disk.meta_path());
    let Ok(cache_meta) = std::fs::metadata(&cache_path) else {
        return false;
    };
    let Ok(control_content) = std::fs::read_to_string(control_filename(&cache_path)) else {
        return false;
    };
    let Some(control) = parse_control_file(&control_content) else {
        log::warn!(
            "unreadable control file for cache {}, falling back to a full scan",
            cache_path.display()
        );
        return false;
    };

    if control.version != METADATA_CACHE_VERSION {
        log::warn!(
            "cache {} has version {}, expected {METADATA_CACHE_VERSION}",
            cache_path.display(),
            control.version
        );
        return false;
    }
    if control.disk != disk.meta_path().to_string_lossy() {
        log::warn!(
            "cache {} belongs to disk {}, not {}",
            cache_path.display(),
            control.disk,
            disk.meta_path().display()
        );
        return false;
    }
    if control.chunks * CHUNK_RECORD_SIZE as u64 != cache_meta.len() {
        log::warn!(
            "cache {} size does not match its control file",
            cache_path.display()
        );
        return false;
    }
    true
}

fn write_cache_file(cache_path: &Path, records: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(cache_path)?;
    file.write_all(records)?;
    nix::unistd::fsync(file.as_raw_fd()).map_err(std::io::Error::from)?;
    Ok(())
}

fn write_control_file(disk_path: &str, cache_path: &Path, records: &[u8]) -> std::io::Result<()> {
    let mut content = String::new();
    content.push_str(&format!("version: {METADATA_CACHE_VERSION}\n"));
    content.push_str(&format!("timestamp: {}\n", wall_clock_secs() as i128 * 1_000_000_000));
    content.push_str(&format!("disk: {disk_path}\n"));
    content.push_str(&format!(
        "chunks: {}\n",
        records.len() / CHUNK_RECORD_SIZE
    ));
    std::fs::write(control_filename(cache_path), content)
}

/// Dumps every registered chunk into its disk's cache file. Called at
/// shutdown, after the workers are joined.
pub fn write_binary_metadata_cache(engine: &HddEngine) {
    let Some(cache_dir) = engine.metadata_cache_path() else {
        return;
    };

    if !cache_dir.exists() {
        if let Err(err) = std::fs::create_dir_all(&cache_dir) {
            log::error!(
                "failed to create cache directory {}: {err}",
                cache_dir.display()
            );
            return;
        }
    }

    let mut per_disk: HashMap<PathBuf, Vec<u8>> = HashMap::new();
    {
        let disks = engine.disk_manager.disks.lock();
        for disk in disks.iter() {
            per_disk.entry(disk.meta_path().to_owned()).or_default();
        }
    }

    for chunk in engine.registry.snapshot() {
        let record = CachedChunkRecord {
            id: chunk.id,
            version: chunk.version(),
            chunk_type: chunk.ctype,
            blocks: chunk.blocks(),
        };
        let records = per_disk
            .entry(chunk.owner.meta_path().to_owned())
            .or_default();
        serialize_chunk_record(&record, records);
    }

    for (disk_path, records) in per_disk {
        let cache_path = cache_filename(&cache_dir, &disk_path);

        let cache_written = write_cache_file(&cache_path, &records)
            .map_err(|err| log::error!("failed to write cache file {}: {err}", cache_path.display()))
            .is_ok();
        let control_written = cache_written
            && write_control_file(&disk_path.to_string_lossy(), &cache_path, &records)
                .map_err(|err| {
                    log::error!(
                        "failed to write control file for {}: {err}",
                        cache_path.display()
                    )
                })
                .is_ok();

        if cache_written && control_written {
            log::info!(
                "chunk metadata cache file written: {} ({} chunks)",
                cache_path.display(),
                records.len() / CHUNK_RECORD_SIZE
            );
        } else {
            let _ = std::fs::remove_file(control_filename(&cache_path));
            let _ = std::fs::remove_file(&cache_path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_round_trip() {
        let record = CachedChunkRecord {
            id: 0x0102_0304_0506_0708,
            version: 9,
            chunk_type: ChunkPartType::ec(8, 2, 3).unwrap(),
            blocks: 77,
        };
        let mut buffer = Vec::new();
        serialize_chunk_record(&record, &mut buffer);
        assert_eq!(buffer.len(), CHUNK_RECORD_SIZE);
        assert_eq!(parse_chunk_record(&buffer), Some(record));

        assert_eq!(parse_chunk_record(&buffer[1..]), None);
    }

    #[test]
    fn cache_filename_flattens_path() {
        assert_eq!(
            cache_filename(Path::new("/var/cache"), Path::new("/mnt/hdd_02/")),
            PathBuf::from("/var/cache/mnt.hdd_02.cache")
        );
        assert_eq!(
            control_filename(Path::new("/var/cache/mnt.hdd_02.cache")),
            PathBuf::from("/var/cache/mnt.hdd_02.cache.control")
        );
    }

    #[test]
    fn control_file_round_trip() {
        let content = "version: 1\ntimestamp: 123456789\ndisk: /mnt/hdd_02\nchunks: 42\n";
        let control = parse_control_file(content).unwrap();
        assert_eq!(control.version, 1);
        assert_eq!(control.disk, "/mnt/hdd_02");
        assert_eq!(control.chunks, 42);

        assert!(parse_control_file("nonsense").is_none());
    }
}
