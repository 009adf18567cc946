use std::sync::Arc;

use diskio::common::config::IoMgrConfig;
use diskio::common::mem_limit::MemLimit;
use diskio::concurrency::thread_resource_mgr::ThreadResourceMgr;
use diskio::storage::disk::{DiskIoMgr, ScanRange};
use tempfile::TempDir;

use crate::assert_ok;
use crate::common::logger::init_test_logger;
use crate::common::tempfiles::{drain_reader, write_random_file};

const READ_SIZE: usize = 4096;

struct TestContext {
    io_mgr: DiskIoMgr,
    dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        init_test_logger();
        let config = IoMgrConfig::default()
            .with_num_disks(2)
            .with_threads_per_disk(2)
            .with_read_size(READ_SIZE);
        let thread_mgr = Arc::new(ThreadResourceMgr::new(32));
        Self {
            io_mgr: DiskIoMgr::new(config, thread_mgr).expect("failed to start io mgr"),
            dir: TempDir::new().expect("failed to create temp dir"),
        }
    }
}

#[test]
fn buffers_balance_after_drain() {
    let ctx = TestContext::new();
    let (path, data) = write_random_file(&ctx.dir, "balance.dat", 40 * READ_SIZE);
    let pool = ctx.io_mgr.thread_mgr().register_pool();
    let handle = ctx.io_mgr.register_reader(None, Arc::clone(&pool), None, 0);

    let ranges = (0..4)
        .map(|i| ScanRange::new(&path, i * 10 * READ_SIZE as u64, 10 * READ_SIZE as u64, i as usize % 2))
        .collect();
    assert_ok!(ctx.io_mgr.add_scan_ranges(handle, ranges));
    let delivered = assert_ok!(drain_reader(&ctx.io_mgr, handle));
    assert_eq!(delivered.values().map(Vec::len).sum::<usize>(), data.len());

    assert!(ctx.io_mgr.num_allocated_buffers() > 0);
    assert_eq!(ctx.io_mgr.num_buffers_in_readers(), 0);
    assert_eq!(ctx.io_mgr.num_free_buffers(), ctx.io_mgr.num_allocated_buffers());
    assert_eq!(ctx.io_mgr.total_bytes_read(), data.len() as u64);
    assert!(ctx.io_mgr.validate());

    assert_ok!(ctx.io_mgr.unregister_reader(handle));
    ctx.io_mgr.thread_mgr().unregister_pool(&pool);
}

#[test]
fn held_buffers_are_counted_in_readers() {
    let ctx = TestContext::new();
    let (path, _) = write_random_file(&ctx.dir, "held.dat", 3 * READ_SIZE);
    let pool = ctx.io_mgr.thread_mgr().register_pool();
    let handle = ctx.io_mgr.register_reader(None, Arc::clone(&pool), None, 0);
    assert_ok!(ctx.io_mgr.add_scan_ranges(handle, vec![ScanRange::new(&path, 0, 3 * READ_SIZE as u64, 0)]));

    let mut held = Vec::new();
    loop {
        let (buffer, eos) = assert_ok!(ctx.io_mgr.get_next(handle));
        held.extend(buffer);
        if eos {
            break;
        }
    }
    assert_eq!(held.len(), 3);
    assert_eq!(ctx.io_mgr.num_buffers_in_readers(), 3);
    assert!(ctx.io_mgr.validate());

    if let Some(buffer) = held.pop() {
        buffer.return_buffer();
    }
    assert_eq!(ctx.io_mgr.num_buffers_in_readers(), 2);
    held.clear();
    assert_eq!(ctx.io_mgr.num_buffers_in_readers(), 0);
    assert!(ctx.io_mgr.validate());

    assert_ok!(ctx.io_mgr.unregister_reader(handle));
    ctx.io_mgr.thread_mgr().unregister_pool(&pool);
}

#[test]
fn gc_frees_idle_buffers_and_process_memory() {
    let ctx = TestContext::new();
    let process_limit = Arc::new(MemLimit::unlimited());
    ctx.io_mgr.set_process_mem_limit(Some(Arc::clone(&process_limit)));
    let (path, _) = write_random_file(&ctx.dir, "gc.dat", 16 * READ_SIZE);

    let pool = ctx.io_mgr.thread_mgr().register_pool();
    let reader_limit = Arc::new(MemLimit::unlimited());
    let handle = ctx
        .io_mgr
        .register_reader(None, Arc::clone(&pool), Some(Arc::clone(&reader_limit)), 0);
    assert_ok!(ctx.io_mgr.add_scan_ranges(handle, vec![ScanRange::new(&path, 0, 16 * READ_SIZE as u64, 1)]));
    assert_ok!(drain_reader(&ctx.io_mgr, handle));
    assert_ok!(ctx.io_mgr.unregister_reader(handle));
    ctx.io_mgr.thread_mgr().unregister_pool(&pool);

    let allocated = ctx.io_mgr.num_allocated_buffers();
    assert!(allocated > 0);
    assert_eq!(process_limit.consumption(), (allocated * READ_SIZE) as i64);
    assert_eq!(reader_limit.consumption(), 0);

    assert_eq!(ctx.io_mgr.gc_io_buffers(), allocated);
    assert_eq!(ctx.io_mgr.num_allocated_buffers(), 0);
    assert_eq!(ctx.io_mgr.num_free_buffers(), 0);
    assert_eq!(process_limit.consumption(), 0);
    assert_eq!(ctx.io_mgr.gc_io_buffers(), 0);
}

#[test]
fn buffers_are_recycled_across_readers() {
    let ctx = TestContext::new();
    let (path, _) = write_random_file(&ctx.dir, "recycle.dat", 8 * READ_SIZE);

    let mut allocated_after_first = 0;
    for round in 0..3 {
        let pool = ctx.io_mgr.thread_mgr().register_pool();
        let handle = ctx.io_mgr.register_reader(None, Arc::clone(&pool), None, 1);
        assert_ok!(ctx.io_mgr.add_scan_ranges(handle, vec![ScanRange::new(&path, 0, 8 * READ_SIZE as u64, 0)]));
        assert_ok!(drain_reader(&ctx.io_mgr, handle));
        assert_ok!(ctx.io_mgr.unregister_reader(handle));
        ctx.io_mgr.thread_mgr().unregister_pool(&pool);

        if round == 0 {
            allocated_after_first = ctx.io_mgr.num_allocated_buffers();
        }
    }
    // Later rounds may read further ahead, but never past the max quota.
    assert!(allocated_after_first > 0);
    assert!(ctx.io_mgr.num_allocated_buffers() <= IoMgrConfig::default().max_queue_capacity);
    assert_eq!(ctx.io_mgr.num_registered_readers(), 0);
    assert!(ctx.io_mgr.debug_string().contains("Disk I/O manager"));
}
