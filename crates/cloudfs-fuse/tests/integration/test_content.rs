//! File content: reads, writes, truncation, flushing and open/release.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use cloudfs_core::{
    config::{ConfigBuilder, StorageKind},
    ports::{memory_backend::BackendOp, BackendError, IRemoteBackend, InMemoryBackend, PutMode},
};
use cloudfs_fuse::{FsError, Lifecycle};

use crate::common::{ino_of, mount, mount_with, ROOT};

#[tokio::test]
async fn test_hello_then_append() {
    let m = mount().await;
    let a = m.fs.mkdir(ROOT, "a").await.unwrap().ino;
    let (fh, _) = m.fs.create(a, "b.txt").await.unwrap();
    assert_eq!(m.fs.write(fh, 0, b"hello").unwrap(), 5);
    m.fs.fsync(fh, false).await.unwrap();
    m.fs.release(fh).await.unwrap();

    let remote_a = m.backend.find_child(&m.backend.root_id(), "a").unwrap();
    let id = m.backend.find_child(&remote_a, "b.txt").unwrap();
    assert_eq!(m.backend.contents(&id).unwrap(), b"hello");

    let ino = ino_of(&m.fs, "/a/b.txt").await;
    let fh = m.fs.open(ino).await.unwrap();
    m.fs.write(fh, 5, b"!!!").unwrap();
    assert_eq!(m.fs.getattr(ino).await.unwrap().size, 8);
    assert_eq!(m.fs.read(fh, 0, 64).await.unwrap(), b"hello!!!");
    m.fs.flush(fh).await.unwrap();
    m.fs.release(fh).await.unwrap();

    assert_eq!(m.backend.contents(&id).unwrap(), b"hello!!!");
    assert_eq!(m.fs.resolve("/a/b.txt").await.unwrap().size, 8);
}

#[tokio::test]
async fn test_read_remote_file_on_demand() {
    let m = mount().await;
    m.backend
        .insert_file(&m.backend.root_id(), "remote.txt", b"0123456789");
    let ino = ino_of(&m.fs, "/remote.txt").await;

    let fh = m.fs.open(ino).await.unwrap();
    assert_eq!(m.backend.calls(BackendOp::Get), 0);
    assert_eq!(m.fs.read(fh, 2, 4).await.unwrap(), b"2345");
    assert_eq!(m.fs.read(fh, 8, 10).await.unwrap(), b"89");
    assert!(m.fs.read(fh, 10, 10).await.unwrap().is_empty());
    assert!(m.fs.read(fh, 500, 1).await.unwrap().is_empty());
    assert_eq!(m.backend.calls(BackendOp::Get), 1);
    m.fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_open_failure_leaves_count_unchanged() {
    let m = mount().await;
    m.backend.insert_file(&m.backend.root_id(), "gone", b"x");
    let ino = ino_of(&m.fs, "/gone").await;
    m.backend
        .fail_next(BackendOp::Stat, 1, BackendError::PermissionDenied("no".into()));

    let err = m.fs.open(ino).await.unwrap_err();
    assert!(matches!(err, FsError::PermissionDenied(_)));
    let entry = m.fs.tree().get(ino).unwrap();
    assert_eq!(entry.open_count(), 0);
    assert_eq!(m.fs.open_handles(), 0);
}

#[tokio::test]
async fn test_reopen_sees_remote_change() {
    let m = mount().await;
    let id = m.backend.insert_file(&m.backend.root_id(), "shared", b"old");
    let ino = ino_of(&m.fs, "/shared").await;

    let fh = m.fs.open(ino).await.unwrap();
    assert_eq!(m.fs.read(fh, 0, 16).await.unwrap(), b"old");
    m.fs.release(fh).await.unwrap();

    m.backend.put(&id, b"newer!", PutMode::Whole).await.unwrap();
    let fh = m.fs.open(ino).await.unwrap();
    assert_eq!(m.fs.fgetattr(fh).await.unwrap().size, 6);
    assert_eq!(m.fs.read(fh, 0, 16).await.unwrap(), b"newer!");

    // A second handle joins the running session without another check.
    let stats = m.backend.calls(BackendOp::Stat);
    let joined = m.fs.open(ino).await.unwrap();
    assert_eq!(m.backend.calls(BackendOp::Stat), stats);
    m.fs.release(joined).await.unwrap();
    m.fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_reopen_keeps_unchanged_cache() {
    let m = mount().await;
    m.backend.insert_file(&m.backend.root_id(), "stable", b"same bytes");
    let ino = ino_of(&m.fs, "/stable").await;

    for _ in 0..3 {
        let fh = m.fs.open(ino).await.unwrap();
        assert_eq!(m.fs.read(fh, 0, 64).await.unwrap(), b"same bytes");
        m.fs.release(fh).await.unwrap();
    }
    assert_eq!(m.backend.calls(BackendOp::Get), 1);
    assert_eq!(m.backend.calls(BackendOp::Stat), 3);
}

#[tokio::test]
async fn test_write_is_visible_before_flush() {
    let m = mount().await;
    let (fh, attr) = m.fs.create(ROOT, "scratch").await.unwrap();
    m.fs.write(fh, 4, b"tail").unwrap();

    assert_eq!(m.fs.read(fh, 0, 8).await.unwrap(), b"\0\0\0\0tail");
    assert_eq!(m.fs.getattr(attr.ino).await.unwrap().size, 8);
    assert_eq!(m.backend.calls(BackendOp::Put), 0);
    m.fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_truncate_is_immediate() {
    let m = mount().await;
    m.backend
        .insert_file(&m.backend.root_id(), "big", &[7u8; 100]);
    let ino = ino_of(&m.fs, "/big").await;

    assert_eq!(m.fs.truncate(ino, 10).await.unwrap().size, 10);
    assert_eq!(m.fs.getattr(ino).await.unwrap().size, 10);

    let fh = m.fs.open(ino).await.unwrap();
    assert_eq!(m.fs.ftruncate(fh, 20).await.unwrap().size, 20);
    let data = m.fs.read(fh, 0, 64).await.unwrap();
    assert_eq!(&data[..10], &[7u8; 10]);
    assert_eq!(&data[10..], &[0u8; 10]);

    m.fs.flush(fh).await.unwrap();
    let id = m.backend.find_child(&m.backend.root_id(), "big").unwrap();
    assert_eq!(m.backend.contents(&id).unwrap(), data);
    m.fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_flush_round_trip_clears_dirty_state() {
    let m = mount().await;
    let (fh, attr) = m.fs.create(ROOT, "data.bin").await.unwrap();
    let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
    m.fs.write(fh, 0, &payload).unwrap();

    let entry = m.fs.tree().get(attr.ino).unwrap();
    let cache = entry.content().unwrap();
    assert!(cache.is_dirty());

    m.fs.flush(fh).await.unwrap();
    assert!(!cache.is_dirty());
    assert!(cache.dirty_ranges().is_empty());
    let id = m.backend.find_child(&m.backend.root_id(), "data.bin").unwrap();
    assert_eq!(m.backend.contents(&id).unwrap(), payload);
    m.fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_second_flush_uploads_nothing() {
    let m = mount().await;
    let (fh, _) = m.fs.create(ROOT, "once").await.unwrap();
    m.fs.write(fh, 0, b"abc").unwrap();

    m.fs.flush(fh).await.unwrap();
    m.fs.flush(fh).await.unwrap();
    m.fs.fsync(fh, true).await.unwrap();
    assert_eq!(m.backend.calls(BackendOp::Put), 1);
    m.fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_failed_flush_keeps_dirty_data() {
    let m = mount().await;
    let (fh, attr) = m.fs.create(ROOT, "precious").await.unwrap();
    m.fs.write(fh, 0, b"do not lose").unwrap();

    m.backend
        .fail_next(BackendOp::Put, 3, BackendError::Unavailable("503".into()));
    let err = m.fs.flush(fh).await.unwrap_err();
    assert!(matches!(err, FsError::TransientIo(_)));
    assert_eq!(m.backend.calls(BackendOp::Put), 3);

    let entry = m.fs.tree().get(attr.ino).unwrap();
    assert!(entry.content().unwrap().is_dirty());
    assert_eq!(m.fs.read(fh, 0, 32).await.unwrap(), b"do not lose");

    m.fs.flush(fh).await.unwrap();
    let id = m.backend.find_child(&m.backend.root_id(), "precious").unwrap();
    assert_eq!(m.backend.contents(&id).unwrap(), b"do not lose");
    m.fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_delete_while_open() {
    let m = mount().await;
    let id = m
        .backend
        .insert_file(&m.backend.root_id(), "tmp", b"scratch data");
    let ino = ino_of(&m.fs, "/tmp").await;
    let fh = m.fs.open(ino).await.unwrap();

    m.fs.unlink(ROOT, "tmp").await.unwrap();
    assert!(matches!(m.fs.resolve("/tmp").await, Err(FsError::NotFound(_))));
    assert!(m.backend.exists(&id));

    assert_eq!(m.fs.read(fh, 0, 7).await.unwrap(), b"scratch");
    m.fs.write(fh, 0, b"S").unwrap();
    assert_eq!(m.fs.read(fh, 0, 3).await.unwrap(), b"Scr");
    assert_eq!(m.fs.fgetattr(fh).await.unwrap().size, 12);

    // orphans are never uploaded
    m.fs.flush(fh).await.unwrap();
    assert_eq!(m.backend.calls(BackendOp::Put), 0);

    let entry = m.fs.tree().get(ino).unwrap();
    assert_eq!(
        entry.lifecycle().await,
        Lifecycle::Orphaned {
            remote_deleted: false
        }
    );
    m.fs.release(fh).await.unwrap();
    assert!(!m.backend.exists(&id));
    assert!(entry.content().is_none());
    assert!(m.fs.getattr(ino).await.is_err());
}

#[tokio::test]
async fn test_release_flushes_in_background() {
    let m = mount().await;
    let (fh, _) = m.fs.create(ROOT, "later").await.unwrap();
    m.fs.write(fh, 0, b"eventually").unwrap();
    m.fs.release(fh).await.unwrap();

    m.fs.destroy().await.unwrap();
    let id = m.backend.find_child(&m.backend.root_id(), "later").unwrap();
    assert_eq!(m.backend.contents(&id).unwrap(), b"eventually");
    assert_eq!(m.backend.calls(BackendOp::Put), 1);
}

#[tokio::test]
async fn test_destroy_flushes_open_files_and_pending_orphans() {
    let m = mount().await;
    let doomed = m
        .backend
        .insert_file(&m.backend.root_id(), "doomed", b"x");
    let (open, _) = m.fs.create(ROOT, "open").await.unwrap();
    m.fs.write(open, 0, b"unsaved").unwrap();
    let ino = ino_of(&m.fs, "/doomed").await;
    m.fs.open(ino).await.unwrap();
    m.fs.unlink(ROOT, "doomed").await.unwrap();

    m.fs.destroy().await.unwrap();
    let id = m.backend.find_child(&m.backend.root_id(), "open").unwrap();
    assert_eq!(m.backend.contents(&id).unwrap(), b"unsaved");
    assert!(!m.backend.exists(&doomed));
    assert_eq!(m.fs.open_handles(), 0);
}

#[tokio::test]
async fn test_destroy_reports_flush_failure() {
    let m = mount().await;
    let (fh, _) = m.fs.create(ROOT, "stuck").await.unwrap();
    m.fs.write(fh, 0, b"data").unwrap();
    m.backend
        .fail_next(BackendOp::Put, 1, BackendError::QuotaExceeded("full".into()));

    let err = m.fs.destroy().await.unwrap_err();
    assert!(matches!(err, FsError::QuotaExceeded(_)));
    assert_eq!(libc::c_int::from(err), libc::ENOSPC);
}

#[tokio::test]
async fn test_utime_is_pushed_by_full_sync_only() {
    let m = mount().await;
    let (fh, attr) = m.fs.create(ROOT, "stamped").await.unwrap();
    let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);

    let updated = m.fs.utimens(attr.ino, None, Some(when)).await.unwrap();
    assert_eq!(updated.mtime, when);

    m.fs.fsync(fh, true).await.unwrap();
    assert_eq!(m.backend.calls(BackendOp::SetMtime), 0);

    m.fs.fsync(fh, false).await.unwrap();
    assert_eq!(m.backend.calls(BackendOp::SetMtime), 1);
    let id = m.backend.find_child(&m.backend.root_id(), "stamped").unwrap();
    assert_eq!(m.backend.stat(&id).await.unwrap().modified, when);

    m.fs.fsync(fh, false).await.unwrap();
    assert_eq!(m.backend.calls(BackendOp::SetMtime), 1);
    m.fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_large_file_is_uploaded_in_chunks() {
    let backend = Arc::new(InMemoryBackend::new());
    let config = ConfigBuilder::new()
        .cache_storage(StorageKind::Memory)
        .mount_max_write(4096)
        .retry_base_delay_ms(1)
        .retry_max_delay_ms(2)
        .build();
    let m = mount_with(backend, &config).await;
    assert_eq!(m.fs.capabilities().max_write, 4096);

    let (fh, _) = m.fs.create(ROOT, "large").await.unwrap();
    let payload = vec![9u8; 10_000];
    m.fs.write(fh, 0, &payload).unwrap();
    m.fs.flush(fh).await.unwrap();

    assert_eq!(m.backend.calls(BackendOp::Put), 3);
    let id = m.backend.find_child(&m.backend.root_id(), "large").unwrap();
    assert_eq!(m.backend.contents(&id).unwrap(), payload);
    m.fs.release(fh).await.unwrap();
}
