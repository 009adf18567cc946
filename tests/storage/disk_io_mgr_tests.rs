use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use diskio::common::config::IoMgrConfig;
use diskio::common::exception::IoMgrError;
use diskio::concurrency::thread_resource_mgr::{ResourcePool, ThreadAvailableCb, ThreadResourceMgr};
use diskio::storage::disk::{DiskIoMgr, ReaderHandle, ScanRange};
use tempfile::TempDir;

use crate::common::logger::init_test_logger;
use crate::common::tempfiles::{drain_reader, expected_bytes, key, write_random_file};
use crate::{assert_err, assert_err_matches, assert_ok};

const MIB: usize = 1024 * 1024;

struct TestContext {
    io_mgr: DiskIoMgr,
    thread_mgr: Arc<ThreadResourceMgr>,
    pools: Vec<Arc<ResourcePool>>,
    dir: TempDir,
}

impl TestContext {
    fn new(config: IoMgrConfig) -> Self {
        init_test_logger();
        let thread_mgr = Arc::new(ThreadResourceMgr::new(256));
        let io_mgr = DiskIoMgr::new(config, Arc::clone(&thread_mgr)).expect("failed to start io mgr");
        Self {
            io_mgr,
            thread_mgr,
            pools: Vec::new(),
            dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    fn with_disks(num_disks: usize, threads_per_disk: usize, read_size: usize) -> Self {
        Self::new(
            IoMgrConfig::default()
                .with_num_disks(num_disks)
                .with_threads_per_disk(threads_per_disk)
                .with_read_size(read_size),
        )
    }

    fn register(&mut self, max_io_buffers: usize) -> ReaderHandle {
        let pool = self.thread_mgr.register_pool();
        self.pools.push(Arc::clone(&pool));
        self.io_mgr.register_reader(None, pool, None, max_io_buffers)
    }

    fn write_file(&self, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        write_random_file(&self.dir, name, len)
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        for pool in self.pools.drain(..) {
            self.thread_mgr.unregister_pool(&pool);
        }
    }
}

#[test]
fn single_buffer_range_ends_stream() {
    let mut ctx = TestContext::with_disks(1, 1, 8 * MIB);
    let (path, data) = ctx.write_file("one.dat", MIB);
    let handle = ctx.register(0);

    assert_ok!(ctx.io_mgr.add_scan_ranges(handle, vec![ScanRange::new(&path, 0, MIB as u64, 0)]));

    let (buffer, eos) = assert_ok!(ctx.io_mgr.get_next(handle));
    let buffer = buffer.expect("expected a buffer");
    assert!(eos);
    assert!(buffer.eosr());
    assert_eq!(buffer.len(), MIB);
    assert_eq!(buffer.scan_range_offset(), 0);
    assert_eq!(buffer.buffer(), &data[..]);
    buffer.return_buffer();

    let (buffer, eos) = assert_ok!(ctx.io_mgr.get_next(handle));
    assert!(buffer.is_none());
    assert!(eos);
    assert_eq!(assert_ok!(ctx.io_mgr.reader_bytes_read(handle)), MIB as u64);

    assert_ok!(ctx.io_mgr.unregister_reader(handle));
    assert_eq!(ctx.io_mgr.num_free_buffers(), ctx.io_mgr.num_allocated_buffers());
}

#[test]
fn range_spanning_many_buffers_arrives_in_order() {
    let mut ctx = TestContext::with_disks(1, 1, 4096);
    let (path, data) = ctx.write_file("multi.dat", 50_000);
    let handle = ctx.register(0);

    assert_ok!(ctx.io_mgr.add_scan_ranges(handle, vec![ScanRange::new(&path, 1000, 40_000, 0)]));

    let delivered = assert_ok!(drain_reader(&ctx.io_mgr, handle));
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[&key(&path, 1000)], expected_bytes(&data, 1000, 40_000));

    assert_ok!(ctx.io_mgr.unregister_reader(handle));
}

#[test]
fn ranges_across_disks_and_threads() {
    let mut ctx = TestContext::with_disks(3, 2, 8192);
    let mut files = Vec::new();
    for i in 0..6 {
        files.push(ctx.write_file(&format!("file_{}.dat", i), 30_000 + i * 1000));
    }
    let handle = ctx.register(0);

    let mut ranges = Vec::new();
    for (i, (path, data)) in files.iter().enumerate() {
        let half = data.len() as u64 / 2;
        ranges.push(ScanRange::new(path, 0, half, i % 3));
        ranges.push(ScanRange::new(path, half, data.len() as u64 - half, (i + 1) % 3));
    }
    assert_ok!(ctx.io_mgr.add_scan_ranges(handle, ranges));

    let delivered = assert_ok!(drain_reader(&ctx.io_mgr, handle));
    assert_eq!(delivered.len(), 12);
    for (path, data) in &files {
        let half = data.len() as u64 / 2;
        assert_eq!(delivered[&key(path, 0)], expected_bytes(data, 0, half));
        assert_eq!(
            delivered[&key(path, half)],
            expected_bytes(data, half, data.len() as u64 - half)
        );
    }

    let total: usize = files.iter().map(|(_, data)| data.len()).sum();
    assert_eq!(assert_ok!(ctx.io_mgr.reader_bytes_read(handle)), total as u64);
    assert_ok!(ctx.io_mgr.unregister_reader(handle));
    assert!(ctx.io_mgr.validate());
}

#[test]
fn ranges_added_in_batches() {
    let mut ctx = TestContext::with_disks(2, 1, 4096);
    let (path, data) = ctx.write_file("batches.dat", 20_000);
    let handle = ctx.register(0);

    assert_ok!(ctx.io_mgr.add_scan_ranges(handle, vec![ScanRange::new(&path, 0, 10_000, 0)]));
    let first = assert_ok!(drain_reader(&ctx.io_mgr, handle));
    assert_eq!(first[&key(&path, 0)], expected_bytes(&data, 0, 10_000));

    assert_ok!(ctx.io_mgr.add_scan_ranges(handle, vec![ScanRange::new(&path, 10_000, 10_000, 1)]));
    let second = assert_ok!(drain_reader(&ctx.io_mgr, handle));
    assert_eq!(second[&key(&path, 10_000)], expected_bytes(&data, 10_000, 10_000));

    assert_ok!(ctx.io_mgr.unregister_reader(handle));
}

#[test]
fn range_past_end_of_file_stops_at_eof() {
    let mut ctx = TestContext::with_disks(1, 1, 4096);
    let (path, data) = ctx.write_file("short.dat", 5000);
    let handle = ctx.register(0);

    assert_ok!(ctx.io_mgr.add_scan_ranges(handle, vec![ScanRange::new(&path, 3000, 10_000, 0)]));

    let mut collected = Vec::new();
    loop {
        let (buffer, eos) = assert_ok!(ctx.io_mgr.get_next(handle));
        if let Some(buffer) = buffer {
            collected.extend_from_slice(buffer.buffer());
        }
        if eos {
            break;
        }
    }
    assert_eq!(collected, &data[3000..]);
    assert_ok!(ctx.io_mgr.unregister_reader(handle));
}

#[test]
fn sync_read_returns_whole_range() {
    let ctx = TestContext::with_disks(2, 1, 4096);
    let (path, data) = ctx.write_file("sync.dat", 10_000);

    let buffer = assert_ok!(ctx.io_mgr.read(None, ScanRange::new(&path, 100, 4000, 1)));
    assert!(buffer.eosr());
    assert_eq!(buffer.buffer(), expected_bytes(&data, 100, 4000));
    assert_eq!(ctx.io_mgr.num_registered_readers(), 0);
    assert_eq!(ctx.thread_mgr.num_pools(), 0);

    drop(buffer);
    assert_eq!(ctx.io_mgr.num_buffers_in_readers(), 0);
    assert_eq!(ctx.io_mgr.num_free_buffers(), ctx.io_mgr.num_allocated_buffers());
}

#[test]
fn sync_read_larger_than_read_size_is_rejected() {
    let ctx = TestContext::with_disks(1, 1, 4096);
    let (path, _) = ctx.write_file("big.dat", 10_000);

    let result = ctx.io_mgr.read(None, ScanRange::new(&path, 0, 4097, 0));
    assert_err_matches!(result, IoMgrError::InvalidScanRange(_));
}

#[test]
fn invalid_ranges_are_rejected_without_side_effects() {
    let mut ctx = TestContext::with_disks(2, 1, 4096);
    let (path, _) = ctx.write_file("bad.dat", 1000);
    let handle = ctx.register(0);

    let result = ctx.io_mgr.add_scan_ranges(
        handle,
        vec![ScanRange::new(&path, 0, 500, 0), ScanRange::new(&path, 0, 500, 7)],
    );
    assert_err_matches!(
        result,
        IoMgrError::InvalidDiskId {
            disk_id: 7,
            num_disks: 2
        }
    );

    let result = ctx.io_mgr.add_scan_ranges(handle, vec![ScanRange::new(&path, 0, 0, 0)]);
    assert_err_matches!(result, IoMgrError::InvalidScanRange(_));

    // Nothing was queued, so the reader is already at end of stream.
    let (buffer, eos) = assert_ok!(ctx.io_mgr.get_next(handle));
    assert!(buffer.is_none());
    assert!(eos);
    assert_ok!(ctx.io_mgr.unregister_reader(handle));
}

#[test]
fn stale_handle_is_rejected() {
    let mut ctx = TestContext::with_disks(1, 1, 4096);
    let (path, _) = ctx.write_file("stale.dat", 1000);
    let handle = ctx.register(0);
    assert_ok!(ctx.io_mgr.unregister_reader(handle));

    assert_err_matches!(ctx.io_mgr.get_next(handle), IoMgrError::InvalidReader);
    assert_err_matches!(
        ctx.io_mgr.add_scan_ranges(handle, vec![ScanRange::new(&path, 0, 1000, 0)]),
        IoMgrError::InvalidReader
    );
    let err = assert_err!(ctx.io_mgr.unregister_reader(handle));
    assert!(!err.is_io() && !err.is_cancelled());

    // The slot is reused with a new generation; the old handle stays dead.
    let fresh = ctx.register(0);
    assert_ne!(fresh, handle);
    assert_err_matches!(ctx.io_mgr.cancel_reader(handle), IoMgrError::InvalidReader);
    assert_ok!(ctx.io_mgr.unregister_reader(fresh));
}

#[test]
fn try_get_next_never_blocks() {
    let mut ctx = TestContext::with_disks(1, 1, 4096);
    let (path, data) = ctx.write_file("poll.dat", 12_000);
    let handle = ctx.register(0);

    let (buffer, eos) = assert_ok!(ctx.io_mgr.try_get_next(handle));
    assert!(buffer.is_none());
    assert!(eos);

    assert_ok!(ctx.io_mgr.add_scan_ranges(handle, vec![ScanRange::new(&path, 0, 12_000, 0)]));
    let mut collected = Vec::new();
    loop {
        let (buffer, eos) = assert_ok!(ctx.io_mgr.try_get_next(handle));
        match buffer {
            Some(buffer) => collected.extend_from_slice(buffer.buffer()),
            None if !eos => thread::sleep(Duration::from_millis(1)),
            None => {}
        }
        if eos {
            break;
        }
    }
    assert_eq!(collected, data);
    assert_ok!(ctx.io_mgr.unregister_reader(handle));
}

#[test]
fn meta_data_travels_with_buffers() {
    let mut ctx = TestContext::with_disks(1, 1, 4096);
    let (path, _) = ctx.write_file("meta.dat", 8192);
    let handle = ctx.register(0);

    let ranges = vec![
        ScanRange::new(&path, 0, 4096, 0).with_meta_data(Arc::new(String::from("first"))),
        ScanRange::new(&path, 4096, 4096, 0).with_meta_data(Arc::new(String::from("second"))),
    ];
    assert_ok!(ctx.io_mgr.add_scan_ranges(handle, ranges));

    let mut seen = Vec::new();
    loop {
        let (buffer, eos) = assert_ok!(ctx.io_mgr.get_next(handle));
        if let Some(buffer) = buffer {
            let tag = buffer
                .scan_range()
                .meta_data_as::<String>()
                .expect("missing meta data");
            let expected_offset = if tag == "first" { 0 } else { 4096 };
            assert_eq!(buffer.scan_range().offset(), expected_offset);
            seen.push(tag.clone());
        }
        if eos {
            break;
        }
    }
    seen.sort();
    assert_eq!(seen, vec!["first".to_string(), "second".to_string()]);
    assert_ok!(ctx.io_mgr.unregister_reader(handle));
}

#[test]
fn queue_capacity_is_clamped_to_config() {
    let mut ctx = TestContext::new(
        IoMgrConfig {
            min_queue_capacity: 2,
            max_queue_capacity: 8,
            ..IoMgrConfig::default()
        }
        .with_num_disks(1)
        .with_read_size(4096),
    );
    let handle = ctx.register(0);
    assert_eq!(assert_ok!(ctx.io_mgr.queue_capacity(handle)), 2);

    assert_ok!(ctx.io_mgr.set_max_io_buffers(handle, 100));
    assert_eq!(assert_ok!(ctx.io_mgr.queue_capacity(handle)), 8);

    assert_ok!(ctx.io_mgr.set_max_io_buffers(handle, 1));
    assert_eq!(assert_ok!(ctx.io_mgr.queue_capacity(handle)), 2);

    assert_eq!(assert_ok!(ctx.io_mgr.queue_size(handle)), 0);
    assert_ok!(ctx.io_mgr.unregister_reader(handle));
}

#[test]
fn buffer_held_past_unregister_is_returned_safely() {
    let mut ctx = TestContext::with_disks(1, 1, 4096);
    let (path, data) = ctx.write_file("held.dat", 4096);
    let handle = ctx.register(0);
    assert_ok!(ctx.io_mgr.add_scan_ranges(handle, vec![ScanRange::new(&path, 0, 4096, 0)]));

    let (buffer, eos) = assert_ok!(ctx.io_mgr.get_next(handle));
    let buffer = buffer.expect("expected a buffer");
    assert!(eos);
    assert_ok!(ctx.io_mgr.unregister_reader(handle));

    // A new reader takes the same slot before the old buffer comes back.
    let next = ctx.register(0);
    assert_eq!(buffer.buffer(), &data[..]);
    assert_eq!(ctx.io_mgr.num_buffers_in_readers(), 1);
    drop(buffer);
    assert_eq!(ctx.io_mgr.num_buffers_in_readers(), 0);
    assert!(ctx.io_mgr.validate());
    assert_ok!(ctx.io_mgr.unregister_reader(next));
}

#[test]
fn released_thread_token_starts_next_range() {
    init_test_logger();
    let thread_mgr = Arc::new(ThreadResourceMgr::new(1));
    let io_mgr = assert_ok!(DiskIoMgr::new(
        IoMgrConfig::default().with_num_disks(1).with_read_size(4096),
        Arc::clone(&thread_mgr),
    ));
    let dir = assert_ok!(TempDir::new());
    let (path, data) = write_random_file(&dir, "tokens.dat", 4 * 4096);

    let pool = thread_mgr.register_pool();
    assert_eq!(pool.quota(), 1);
    let handle = io_mgr.register_reader(None, Arc::clone(&pool), None, 0);
    let ranges = (0..4)
        .map(|i| ScanRange::new(&path, i * 4096, 4096, 0))
        .collect();
    assert_ok!(io_mgr.add_scan_ranges(handle, ranges));

    // One token means one range at a time; each finished range hands its
    // token back so the next can start.
    let mut delivered = 0;
    loop {
        let (buffer, eos) = assert_ok!(io_mgr.get_next(handle));
        if let Some(buffer) = buffer {
            assert!(buffer.eosr());
            assert!(pool.num_threads() <= 1);
            let offset = buffer.scan_range().offset();
            assert_eq!(buffer.buffer(), expected_bytes(&data, offset, 4096));
            delivered += 1;
            pool.release_thread_token();
        }
        if eos {
            break;
        }
    }
    assert_eq!(delivered, 4);
    assert_eq!(pool.num_threads(), 0);

    assert_ok!(io_mgr.unregister_reader(handle));
    thread_mgr.unregister_pool(&pool);
}

#[test]
fn thread_available_callback_fires_on_release() {
    let thread_mgr = ThreadResourceMgr::new(2);
    let pool = thread_mgr.register_pool();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let cb: ThreadAvailableCb = Arc::new(move |_: &ResourcePool| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    pool.set_thread_available_cb(Some(cb));

    assert!(pool.try_acquire_thread_token());
    assert!(pool.try_acquire_thread_token());
    assert!(!pool.try_acquire_thread_token());
    pool.release_thread_token();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    pool.set_thread_available_cb(None);
    pool.release_thread_token();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    thread_mgr.unregister_pool(&pool);
}
