//! Background checksum verification.
//!
//! The tester walks the disks round-robin, asking each disk's collection for
//! its next untested chunk at most once per `HDD_TEST_FREQ`. A separate
//! thread consumes the asynchronous re-test queue fed by failed client
//! reads, rate limited to one test per second.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::disk_manager::MAX_TEST_FREQ_MS;
use crate::engine::HddEngine;

pub fn tester_thread(engine: Arc<HddEngine>) {
    let mut elapsed_ms = 0u64;

    while !engine.terminate.load(Ordering::Relaxed) {
        let started = Instant::now();

        if engine
            .disk_manager
            .reset_tester
            .swap(false, Ordering::Relaxed)
        {
            engine.disk_manager.reset_test_cursor();
            elapsed_ms = 0;
        }

        let picked = engine.disk_manager.get_chunk_to_test(
            &mut elapsed_ms,
            engine.flags.test_freq_ms(),
            engine.disk_actions_enabled.load(Ordering::Relaxed),
        );

        if let Some(chunk) = picked {
            let (chunk_id, version, chunk_type) = (chunk.id, chunk.version(), chunk.ctype);

            match engine.hdd_test_chunk(chunk_id, version, chunk_type) {
                Ok(()) => {
                    log::debug!(
                        "tester: chunk {chunk_id:016X} v{version} ({chunk_type}): tested (OK)"
                    );
                }
                Err(err) => {
                    log::warn!(
                        "tester: chunk {chunk_id:016X} v{version} ({chunk_type}): {err}"
                    );
                    engine.reports.report_damaged_chunk(chunk_id, chunk_type);
                }
            }

            chunk.owner.chunks.lock().mark_as_tested(&chunk);
        }

        let tick = Duration::from_millis(engine.flags.test_freq_ms().min(MAX_TEST_FREQ_MS));
        let spent = started.elapsed();
        if spent < tick {
            sleep_while_running(&engine, tick - spent);
        }
    }
}

/// Sleeps in short slices so a long test interval doesn't delay shutdown.
fn sleep_while_running(engine: &HddEngine, mut remaining: Duration) {
    const SLICE: Duration = Duration::from_millis(100);
    while !remaining.is_zero() && !engine.terminate.load(Ordering::Relaxed) {
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
}

/// Consumes the asynchronous re-test queue: chunks whose CRC failed during a
/// client read get one full verification, and only then are reported
/// damaged.
pub fn test_chunk_thread(engine: Arc<HddEngine>) {
    const RATE_LIMIT: Duration = Duration::from_secs(1);

    while !engine.terminate.load(Ordering::Relaxed) {
        let started = Instant::now();

        if let Some(record) = engine.test_queue.get() {
            let name = format!(
                "{:016X}_{:08X} ({})",
                record.id, record.version, record.chunk_type
            );
            match engine.hdd_test_chunk(record.id, record.version, record.chunk_type) {
                Ok(()) => {
                    log::info!("chunk {name} spuriously reported as corrupted");
                }
                Err(_) => {
                    log::info!("chunk {name} corrupted (detected by a client)");
                    engine
                        .reports
                        .report_damaged_chunk(record.id, record.chunk_type);
                }
            }
        }

        let spent = started.elapsed();
        if spent < RATE_LIMIT {
            sleep_while_running(&engine, RATE_LIMIT - spent);
        }
    }
}
