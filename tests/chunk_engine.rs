//! End-to-end scenarios driving the storage engine against real directories.

use std::path::PathBuf;
use std::sync::Arc;

use saunafs_chunkserver::{ChunkOpError, ChunkPartType, HddConfig, HddEngine, SFSBLOCKSIZE};
use sfs_datastore::chunk_filename;
use sfs_datastore::crc::crc32;
use sfs_datastore::disk::ScanState;

const BLOCK: usize = SFSBLOCKSIZE as usize;

struct TestEnv {
    base: PathBuf,
    engine: Option<Arc<HddEngine>>,
}

impl TestEnv {
    fn new(name: &str, disk_count: usize) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut base = std::fs::canonicalize(".").unwrap();
        base.push(format!(".testdir-{name}"));
        let _ = std::fs::remove_dir_all(&base);
        std::fs::create_dir_all(&base).unwrap();

        let mut hdd_cfg = String::new();
        for disk in 0..disk_count {
            let disk_path = base.join(format!("disk{disk}"));
            std::fs::create_dir_all(&disk_path).unwrap();
            hdd_cfg.push_str(disk_path.to_str().unwrap());
            hdd_cfg.push('\n');
        }
        std::fs::write(base.join("sfshdd.cfg"), hdd_cfg).unwrap();

        let mut env = Self { base, engine: None };
        env.start_engine();
        env
    }

    fn config(&self) -> HddConfig {
        HddConfig {
            hdd_conf_filename: self.base.join("sfshdd.cfg"),
            leave_space_default: 0,
            metadata_cache_path: Some(self.base.clone()),
            ..HddConfig::default()
        }
    }

    fn start_engine(&mut self) {
        let engine = HddEngine::new(&self.config()).unwrap();
        wait_until_working(&engine);
        self.engine = Some(engine);
    }

    fn engine(&self) -> &Arc<HddEngine> {
        self.engine.as_ref().unwrap()
    }

    fn restart_engine(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.shutdown();
        }
        self.start_engine();
    }

    fn data_file(&self, disk: usize, id: u64, version: u32, ctype: ChunkPartType) -> PathBuf {
        chunk_filename::generate(
            &self.base.join(format!("disk{disk}")),
            id,
            version,
            ctype,
            false,
        )
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.shutdown();
        }
        let _ = std::fs::remove_dir_all(&self.base);
    }
}

fn wait_until_working(engine: &Arc<HddEngine>) {
    for _ in 0..1000 {
        engine.check_disks();
        let all_working = {
            let disks = engine.disk_manager.disks.lock();
            !disks.is_empty()
                && disks
                    .iter()
                    .all(|disk| disk.state.lock().scan_state == ScanState::Working)
        };
        if all_working {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    panic!("disks never finished scanning");
}

fn registry_snapshot(engine: &Arc<HddEngine>) -> Vec<(u64, u32, ChunkPartType, u16)> {
    let mut snapshot: Vec<_> = engine
        .registry
        .snapshot()
        .iter()
        .map(|chunk| (chunk.id, chunk.version(), chunk.ctype, chunk.blocks()))
        .collect();
    snapshot.sort();
    snapshot
}

#[test]
fn create_write_close_read() {
    let env = TestEnv::new("create-write-read", 1);
    let engine = env.engine();
    let standard = ChunkPartType::standard();

    engine.hdd_create_chunk(0x100, 1, standard).unwrap();

    let payload = vec![0u8; 1000];
    engine
        .hdd_write_block(0x100, 1, standard, 0, 0, 1000, crc32(&payload), &payload)
        .unwrap();

    engine.hdd_close(0x100, standard).unwrap();

    let mut out = Vec::new();
    engine
        .hdd_read(0x100, 1, standard, 0, 1000, 0, 0, &mut out)
        .unwrap();
    assert_eq!(&out[..4], &crc32(&payload).to_be_bytes());
    assert_eq!(&out[4..], &payload[..]);
}

#[test]
fn partial_write_keeps_surrounding_bytes() {
    let env = TestEnv::new("partial-write", 1);
    let engine = env.engine();
    let standard = ChunkPartType::standard();

    engine.hdd_create_chunk(0x200, 1, standard).unwrap();

    let base: Vec<u8> = (0..BLOCK).map(|i| (i % 251) as u8).collect();
    engine
        .hdd_write_block(0x200, 1, standard, 0, 0, SFSBLOCKSIZE, crc32(&base), &base)
        .unwrap();

    let patch = vec![0xEEu8; 512];
    engine
        .hdd_write_block(0x200, 1, standard, 0, 1000, 512, crc32(&patch), &patch)
        .unwrap();
    engine.hdd_close(0x200, standard).unwrap();

    let mut expected = base.clone();
    expected[1000..1512].copy_from_slice(&patch);

    let mut out = Vec::new();
    engine
        .hdd_read(0x200, 1, standard, 0, SFSBLOCKSIZE, 0, 0, &mut out)
        .unwrap();
    assert_eq!(&out[..4], &crc32(&expected).to_be_bytes());
    assert_eq!(&out[4..], &expected[..]);
}

#[test]
fn version_mismatch_is_rejected() {
    let env = TestEnv::new("version-mismatch", 1);
    let engine = env.engine();
    let standard = ChunkPartType::standard();

    engine.hdd_create_chunk(0x100, 1, standard).unwrap();
    engine.hdd_close(0x100, standard).unwrap();
    engine.hdd_update_version(0x100, 1, 2, standard).unwrap();

    let payload = vec![7u8; 10];
    let err = engine
        .hdd_write_block(0x100, 1, standard, 0, 0, 10, crc32(&payload), &payload)
        .unwrap_err();
    assert_eq!(err, ChunkOpError::WrongVersion);

    // and the new version is accepted
    engine
        .hdd_write_block(0x100, 2, standard, 0, 0, 10, crc32(&payload), &payload)
        .unwrap();
    engine.hdd_close(0x100, standard).unwrap();
}

#[test]
fn corrupted_block_is_detected_and_queued() {
    let env = TestEnv::new("damaged-crc", 1);
    let engine = env.engine();
    let standard = ChunkPartType::standard();

    engine.hdd_create_chunk(0x300, 1, standard).unwrap();
    let block = vec![0x5Au8; BLOCK];
    engine
        .hdd_write_block(0x300, 1, standard, 0, 0, SFSBLOCKSIZE, crc32(&block), &block)
        .unwrap();
    engine.hdd_close(0x300, standard).unwrap();

    // flip one byte behind the engine's back
    let data_path = env.data_file(0, 0x300, 1, standard);
    let mut content = std::fs::read(&data_path).unwrap();
    content[0] ^= 0xFF;
    std::fs::write(&data_path, &content).unwrap();

    assert_eq!(
        engine.hdd_test_chunk(0x300, 1, standard).unwrap_err(),
        ChunkOpError::Crc
    );

    let mut out = Vec::new();
    let err = engine
        .hdd_read(0x300, 1, standard, 0, SFSBLOCKSIZE, 0, 0, &mut out)
        .unwrap_err();
    assert_eq!(err, ChunkOpError::Crc);

    // the failed read queued an asynchronous re-test; running it reports
    // the chunk as damaged
    let queued = engine.test_queue.get().expect("chunk queued for re-test");
    assert_eq!(queued.id, 0x300);
    assert!(engine
        .hdd_test_chunk(queued.id, queued.version, queued.chunk_type)
        .is_err());
    engine
        .reports
        .report_damaged_chunk(queued.id, queued.chunk_type);
    let damaged = engine.reports.get_damaged_chunks(10);
    assert!(damaged.iter().any(|chunk| chunk.id == 0x300));
}

#[test]
fn truncate_to_partial_block() {
    let env = TestEnv::new("truncate-partial", 1);
    let engine = env.engine();
    let standard = ChunkPartType::standard();

    engine.hdd_create_chunk(0x400, 1, standard).unwrap();
    let block = vec![0xAAu8; BLOCK];
    for block_index in 0..2u16 {
        engine
            .hdd_write_block(
                0x400,
                1,
                standard,
                block_index,
                0,
                SFSBLOCKSIZE,
                crc32(&block),
                &block,
            )
            .unwrap();
    }
    engine.hdd_close(0x400, standard).unwrap();

    engine
        .hdd_truncate(0x400, standard, 1, 2, SFSBLOCKSIZE + 5)
        .unwrap();

    let mut out = Vec::new();
    engine
        .hdd_read(0x400, 2, standard, SFSBLOCKSIZE, 5, 0, 0, &mut out)
        .unwrap();
    let tail = vec![0xAAu8; 5];
    assert_eq!(&out[..4], &crc32(&tail).to_be_bytes());
    assert_eq!(&out[4..], &tail[..]);

    // whole second block: 5 bytes of data, zeros onward
    let mut expected = vec![0u8; BLOCK];
    expected[..5].copy_from_slice(&tail);
    let mut out = Vec::new();
    engine
        .hdd_read(0x400, 2, standard, SFSBLOCKSIZE, SFSBLOCKSIZE, 0, 0, &mut out)
        .unwrap();
    assert_eq!(&out[4..], &expected[..]);

    let data_path = env.data_file(0, 0x400, 2, standard);
    assert_eq!(std::fs::metadata(&data_path).unwrap().len(), 2 * BLOCK as u64);
    assert_eq!(
        engine.hdd_get_number_of_blocks(0x400, standard, 2).unwrap(),
        2
    );
}

#[test]
fn duplicate_copies_all_blocks() {
    let env = TestEnv::new("duplicate", 1);
    let engine = env.engine();
    let standard = ChunkPartType::standard();

    engine.hdd_create_chunk(0x500, 1, standard).unwrap();
    let mut blocks = Vec::new();
    for index in 0..3u16 {
        let mut block = vec![0u8; BLOCK];
        block.fill((index as u8) + 1);
        engine
            .hdd_write_block(0x500, 1, standard, index, 0, SFSBLOCKSIZE, crc32(&block), &block)
            .unwrap();
        blocks.push(block);
    }
    engine.hdd_close(0x500, standard).unwrap();

    // duplicate via the combined entry point
    engine
        .hdd_chunk_operation(0x500, 1, standard, 1, 0x501, 0, 0xFFFF_FFFF)
        .unwrap();

    for (index, block) in blocks.iter().enumerate() {
        let mut out = Vec::new();
        engine
            .hdd_read(
                0x501,
                1,
                standard,
                index as u32 * SFSBLOCKSIZE,
                SFSBLOCKSIZE,
                0,
                0,
                &mut out,
            )
            .unwrap();
        assert_eq!(&out[..4], &crc32(block).to_be_bytes());
        assert_eq!(&out[4..], &block[..]);
    }
    assert_eq!(
        engine.hdd_get_number_of_blocks(0x501, standard, 1).unwrap(),
        3
    );
}

#[test]
fn duplicate_truncate_shrinks_with_partial_tail() {
    let env = TestEnv::new("duptrunc", 1);
    let engine = env.engine();
    let standard = ChunkPartType::standard();

    engine.hdd_create_chunk(0x600, 1, standard).unwrap();
    let mut blocks = Vec::new();
    for index in 0..3u16 {
        let mut block = vec![0u8; BLOCK];
        block.fill(0x10 + index as u8);
        engine
            .hdd_write_block(0x600, 1, standard, index, 0, SFSBLOCKSIZE, crc32(&block), &block)
            .unwrap();
        blocks.push(block);
    }
    engine.hdd_close(0x600, standard).unwrap();

    // keep one full block plus 100 bytes
    let length = SFSBLOCKSIZE + 100;
    engine
        .hdd_chunk_operation(0x600, 1, standard, 2, 0x601, 0, length)
        .unwrap();

    assert_eq!(
        engine.hdd_get_number_of_blocks(0x601, standard, 2).unwrap(),
        2
    );

    let mut out = Vec::new();
    engine
        .hdd_read(0x601, 2, standard, 0, SFSBLOCKSIZE, 0, 0, &mut out)
        .unwrap();
    assert_eq!(&out[4..], &blocks[0][..]);

    let mut expected_tail = vec![0u8; BLOCK];
    expected_tail[..100].copy_from_slice(&blocks[1][..100]);
    let mut out = Vec::new();
    engine
        .hdd_read(0x601, 2, standard, SFSBLOCKSIZE, SFSBLOCKSIZE, 0, 0, &mut out)
        .unwrap();
    assert_eq!(&out[..4], &crc32(&expected_tail).to_be_bytes());
    assert_eq!(&out[4..], &expected_tail[..]);

    // source got the new version
    assert_eq!(
        engine
            .hdd_get_number_of_blocks(0x600, standard, 2)
            .unwrap(),
        3
    );
}

#[test]
fn delete_removes_files_and_registry_entry() {
    let env = TestEnv::new("delete", 1);
    let engine = env.engine();
    let standard = ChunkPartType::standard();

    engine.hdd_create_chunk(0x700, 1, standard).unwrap();
    engine.hdd_close(0x700, standard).unwrap();
    let data_path = env.data_file(0, 0x700, 1, standard);
    assert!(data_path.exists());

    assert_eq!(
        engine.hdd_delete_chunk(0x700, 9, standard).unwrap_err(),
        ChunkOpError::WrongVersion
    );

    engine.hdd_delete_chunk(0x700, 1, standard).unwrap();
    assert!(!data_path.exists());
    assert_eq!(
        engine.hdd_read(0x700, 1, standard, 0, 16, 0, 0, &mut Vec::new()),
        Err(ChunkOpError::NoChunk)
    );
}

#[test]
fn scan_and_cache_rebuild_the_same_registry() {
    let mut env = TestEnv::new("scan-cache", 1);
    let standard = ChunkPartType::standard();
    let xor_part = ChunkPartType::xor(3, 1).unwrap();
    let ec_part = ChunkPartType::ec(4, 2, 5).unwrap();

    {
        let engine = env.engine();
        for (id, version, ctype, blocks) in [
            (0x10000u64, 1u32, standard, 2u16),
            (0x10001, 3, standard, 1),
            (0x20000, 7, xor_part, 4),
            (0x30000, 2, ec_part, 1),
        ] {
            engine.hdd_create_chunk(id, version, ctype).unwrap();
            let block = vec![0xCDu8; BLOCK];
            for index in 0..blocks {
                engine
                    .hdd_write_block(
                        id,
                        version,
                        ctype,
                        index,
                        0,
                        SFSBLOCKSIZE,
                        crc32(&block),
                        &block,
                    )
                    .unwrap();
            }
            engine.hdd_close(id, ctype).unwrap();
        }
    }
    let expected = registry_snapshot(env.engine());
    assert_eq!(expected.len(), 4);

    // restart #1: the shutdown wrote a cache, the scanner uses the fast path
    env.restart_engine();
    assert_eq!(registry_snapshot(env.engine()), expected);
    // the control file is consumed by a successful cache load
    let cache_path =
        sfs_datastore::metadata_cache::cache_filename(&env.base, &env.base.join("disk0"));
    assert!(cache_path.exists());
    assert!(!sfs_datastore::metadata_cache::control_filename(&cache_path).exists());

    // restart #2: drop the cache entirely and compare against a full
    // directory walk
    if let Some(engine) = env.engine.take() {
        engine.shutdown();
    }
    std::fs::remove_file(&cache_path).unwrap();
    let control = sfs_datastore::metadata_cache::control_filename(&cache_path);
    if control.exists() {
        std::fs::remove_file(&control).unwrap();
    }
    env.start_engine();
    assert_eq!(registry_snapshot(env.engine()), expected);
}

#[test]
fn new_chunks_are_reported_once_scanned() {
    let mut env = TestEnv::new("scan-reports", 1);
    let standard = ChunkPartType::standard();

    {
        let engine = env.engine();
        engine.hdd_create_chunk(0x900, 5, standard).unwrap();
        engine.hdd_close(0x900, standard).unwrap();
        // creation was commanded by the master, so nothing is queued yet;
        // drain whatever is there before the restart
        engine.reports.get_new_chunks(1000);
    }
    env.restart_engine();

    let new_chunks = env.engine().reports.get_new_chunks(1000);
    assert!(new_chunks.iter().any(|chunk| chunk.id == 0x900));
}

#[test]
fn chunk_operation_rejects_unroutable_tuples() {
    let env = TestEnv::new("router", 1);
    let engine = env.engine();
    let standard = ChunkPartType::standard();

    assert_eq!(
        engine.hdd_chunk_operation(0xA00, 0, standard, 0, 0, 0, 3),
        Err(ChunkOpError::Invalid)
    );
    assert_eq!(
        engine.hdd_chunk_operation(0xA00, 0, standard, 1, 0, 0, 0xFFFF_0000),
        Err(ChunkOpError::Invalid)
    );

    // create via router
    engine
        .hdd_chunk_operation(0xA00, 1, standard, 0, 0, 0, 1)
        .unwrap();
    // test via router
    engine
        .hdd_chunk_operation(0xA00, 1, standard, 0, 0, 0, 2)
        .unwrap();
    // delete via router
    engine
        .hdd_chunk_operation(0xA00, 1, standard, 0, 0, 0, 0)
        .unwrap();
    assert_eq!(
        engine.hdd_chunk_operation(0xA00, 1, standard, 0, 0, 0, 2),
        Err(ChunkOpError::NoChunk)
    );
}
