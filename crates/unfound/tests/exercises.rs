#![forbid(unsafe_code)]

//! End-to-end runs of the two user-space exercises against a started
//! system: a 1 MiB file read sequentially then at scattered offsets, and a
//! directory watch observing a file being created and written.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use unfound::{DrainMode, EventKind, EventMask, OwnerId, UfError, Unfound, UnfoundConfig};

const FILE_SIZE: usize = 1024 * 1024;
const CHUNK: usize = 4096;

fn file_byte(offset: usize) -> u8 {
    (offset.wrapping_mul(31) ^ (offset >> 12)) as u8
}

fn test_file() -> Vec<u8> {
    (0..FILE_SIZE).map(file_byte).collect()
}

fn system(capacity_blocks: usize, prefetch_workers: usize) -> Unfound {
    let mut config = UnfoundConfig::default();
    config.cache.capacity_blocks = capacity_blocks;
    config.cache.prefetch_workers = prefetch_workers;
    Unfound::start(config).expect("start")
}

fn sequential_pass(system: &Unfound, path: &Path) -> usize {
    let ns = system.namespace();
    let handle = ns.open(path).expect("open");
    let mut buf = vec![0_u8; CHUNK];
    let mut offset = 0;
    loop {
        let n = ns.read(handle, &mut buf).expect("read");
        if n == 0 {
            break;
        }
        for (i, byte) in buf[..n].iter().enumerate() {
            assert_eq!(*byte, file_byte(offset + i), "byte at {}", offset + i);
        }
        offset += n;
    }
    ns.close(handle).expect("close");
    offset
}

fn scattered_pass(system: &Unfound, path: &Path) {
    let ns = system.namespace();
    let handle = ns.open(path).expect("open");
    let mut buf = vec![0_u8; CHUNK];
    for i in 0..100 {
        let offset = (i * 7919) % FILE_SIZE;
        ns.seek(handle, std::io::SeekFrom::Start(offset as u64))
            .expect("seek");
        let n = ns.read(handle, &mut buf).expect("read");
        assert_eq!(n, CHUNK.min(FILE_SIZE - offset));
        for (j, byte) in buf[..n].iter().enumerate() {
            assert_eq!(*byte, file_byte(offset + j));
        }
    }
    ns.close(handle).expect("close");
}

#[test]
fn cache_exercise_with_resident_file() {
    let system = system(512, 2);
    let path = Path::new("/testfile");
    system.namespace().write_file(path, &test_file()).expect("write");

    let before = system.stats();
    assert_eq!(sequential_pass(&system, path), FILE_SIZE);
    scattered_pass(&system, path);
    let reads = system.stats().since(&before);

    assert_eq!(reads.misses, 0, "written blocks stay resident");
    assert!(reads.hits >= (FILE_SIZE / CHUNK) as u64);
    assert!((reads.hit_rate() - 1.0).abs() < f64::EPSILON);
    system.shutdown().expect("shutdown");
}

#[test]
fn cache_exercise_under_eviction_pressure() {
    let system = system(32, 0);
    let path = Path::new("/testfile");
    system.namespace().write_file(path, &test_file()).expect("write");
    let after_write = system.stats();
    assert!(after_write.evictions > 0);
    assert!(after_write.write_backs > 0, "dirty victims were written back");

    assert_eq!(sequential_pass(&system, path), FILE_SIZE);
    scattered_pass(&system, path);
    let reads = system.stats().since(&after_write);
    assert!(reads.misses > 0);
    assert!(system.cache().resident_count() <= 32);

    system.namespace().sync().expect("sync");
    assert_eq!(system.cache().dirty_count(), 0);
    system.shutdown().expect("shutdown");
}

#[test]
fn notify_exercise_reports_create_then_modify() {
    let system = system(64, 0);
    let ns = system.namespace();
    ns.mkdir(Path::new("/tmp")).expect("mkdir");
    let wd = system
        .add_watch(
            Path::new("/tmp"),
            EventMask::CREATE | EventMask::MODIFY | EventMask::DELETE,
            OwnerId(1),
        )
        .expect("watch");

    let handle = ns.create(Path::new("/tmp/test.txt")).expect("create");
    ns.write(handle, b"Hello, UNotify!").expect("write");
    ns.close(handle).expect("close");
    assert_eq!(
        ns.read_file(Path::new("/tmp/test.txt")).expect("read"),
        b"Hello, UNotify!"
    );

    let events = system
        .notify()
        .drain_events(wd, 10, DrainMode::Timeout(Duration::from_secs(1)))
        .expect("drain");
    let seen: Vec<(EventKind, &str)> = events.iter().map(|e| (e.kind, e.name.as_str())).collect();
    assert_eq!(
        seen,
        vec![
            (EventKind::Create, "test.txt"),
            (EventKind::Modify, "test.txt"),
        ],
        "reads are not in the mask"
    );

    ns.remove(Path::new("/tmp/test.txt")).expect("remove");
    let events = system
        .notify()
        .drain_events(wd, 10, DrainMode::NonBlocking)
        .expect("drain");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Delete);

    system.notify().remove_watch(wd).expect("remove watch");
    system.shutdown().expect("shutdown");
}

#[test]
fn namespace_rename_produces_cookie_pair() {
    let system = system(64, 0);
    let ns = system.namespace();
    ns.mkdir(Path::new("/d")).expect("mkdir");
    ns.write_file(Path::new("/d/a"), b"x").expect("write");
    let wd = system
        .add_watch(Path::new("/d"), EventMask::RENAME, OwnerId(1))
        .expect("watch");

    ns.rename(Path::new("/d/a"), Path::new("/d/b")).expect("rename");
    let events = system
        .notify()
        .drain_events(wd, 8, DrainMode::NonBlocking)
        .expect("drain");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].name, "a");
    assert_eq!(events[1].name, "b");
    assert_eq!(events[0].cookie, events[1].cookie);
    assert_ne!(events[0].cookie, 0);
    system.shutdown().expect("shutdown");
}

#[test]
fn watching_a_missing_namespace_path_fails() {
    let system = system(64, 0);
    let err = system
        .add_watch(Path::new("/absent"), EventMask::all(), OwnerId(1))
        .expect_err("missing");
    assert!(matches!(err, UfError::InvalidPath(_)));
    assert_eq!(system.notify().watch_count(), 0);
    system.shutdown().expect("shutdown");
}

#[test]
fn shutdown_wakes_blocked_drainer() {
    let system = Arc::new(system(64, 0));
    let wd = system
        .add_watch(Path::new("/"), EventMask::all(), OwnerId(1))
        .expect("watch");
    let waiter = {
        let system = Arc::clone(&system);
        thread::spawn(move || system.notify().drain_events(wd, 4, DrainMode::Blocking))
    };
    thread::sleep(Duration::from_millis(20));
    system.shutdown().expect("shutdown");
    let events = waiter.join().expect("join").expect("terminal drain");
    assert!(events.is_empty());
}
