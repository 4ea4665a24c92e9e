//! Namespace operations: lookup, listing, create, remove and rename.

use std::time::Duration;

use cloudfs_core::{
    domain::NAME_MAX,
    ports::{memory_backend::BackendOp, BackendError},
};
use cloudfs_fuse::FsError;

use crate::common::{ino_of, mount, names, ROOT};

#[tokio::test]
async fn test_remote_tree_is_listed_lazily() {
    let m = mount().await;
    let photos = m.backend.insert_dir(&m.backend.root_id(), "photos");
    m.backend.insert_file(&photos, "b.jpg", b"bb");
    m.backend.insert_file(&photos, "a.jpg", b"a");
    assert_eq!(m.backend.calls(BackendOp::List), 0);

    let photos_ino = ino_of(&m.fs, "/photos").await;
    assert_eq!(m.backend.calls(BackendOp::List), 1);

    let listing = m.fs.readdir(photos_ino).await.unwrap();
    let entries: Vec<(String, u64)> = listing
        .iter()
        .map(|(name, attr)| (name.clone(), attr.size))
        .collect();
    assert_eq!(entries, vec![("a.jpg".to_string(), 1), ("b.jpg".to_string(), 2)]);
    assert_eq!(m.backend.calls(BackendOp::List), 2);

    m.fs.readdir(photos_ino).await.unwrap();
    assert_eq!(m.backend.calls(BackendOp::List), 2);
}

#[tokio::test]
async fn test_readdir_matches_getattr() {
    let m = mount().await;
    m.fs.mkdir(ROOT, "dir").await.unwrap();
    let (fh, _) = m.fs.create(ROOT, "file").await.unwrap();
    m.fs.write(fh, 0, b"12345").unwrap();

    for (name, attr) in m.fs.readdir(ROOT).await.unwrap() {
        let direct = m.fs.getattr(attr.ino).await.unwrap();
        assert_eq!(attr.size, direct.size, "{name}");
        assert_eq!(attr.kind, direct.kind, "{name}");
        assert_eq!(attr.perm, direct.perm, "{name}");
    }
    let dir = m.fs.resolve("/dir").await.unwrap();
    assert_eq!(dir.size, 4096);
    assert_eq!(dir.perm, 0o755);
    assert_eq!(m.fs.resolve("/file").await.unwrap().size, 5);
}

#[tokio::test]
async fn test_disjoint_operations_commute() {
    let m = mount().await;
    let left = m.fs.mkdir(ROOT, "left").await.unwrap().ino;
    let right = m.fs.mkdir(ROOT, "right").await.unwrap().ino;

    let fs = &m.fs;
    let (l, r) = tokio::join!(
        async move {
            fs.mkdir(left, "l1").await?;
            fs.create(left, "l2").await?;
            fs.rename(left, "l2", left, "l3").await
        },
        async move {
            fs.create(right, "r1").await?;
            fs.mkdir(right, "r2").await?;
            fs.rmdir(right, "r2").await
        }
    );
    l.unwrap();
    r.unwrap();

    assert_eq!(names(&m.fs, left).await, vec!["l1", "l3"]);
    assert_eq!(names(&m.fs, right).await, vec!["r1"]);
    let remote_left = m.backend.find_child(&m.backend.root_id(), "left").unwrap();
    assert!(m.backend.find_child(&remote_left, "l3").is_some());
    assert!(m.backend.find_child(&remote_left, "l2").is_none());
}

#[tokio::test]
async fn test_rmdir_not_empty_then_empty() {
    let m = mount().await;
    let dir = m.fs.mkdir(ROOT, "d").await.unwrap().ino;
    let (fh, _) = m.fs.create(dir, "x").await.unwrap();
    m.fs.release(fh).await.unwrap();

    let err = m.fs.rmdir(ROOT, "d").await.unwrap_err();
    assert!(matches!(err, FsError::NotEmpty(_)));
    assert_eq!(libc::c_int::from(err), libc::ENOTEMPTY);

    m.fs.unlink(dir, "x").await.unwrap();
    m.fs.rmdir(ROOT, "d").await.unwrap();
    assert!(names(&m.fs, ROOT).await.is_empty());
    assert!(m.backend.find_child(&m.backend.root_id(), "d").is_none());
}

#[tokio::test]
async fn test_remote_only_children_block_rmdir() {
    let m = mount().await;
    let remote_dir = m.backend.insert_dir(&m.backend.root_id(), "old");
    m.backend.insert_file(&remote_dir, "kept", b"k");

    assert!(matches!(m.fs.rmdir(ROOT, "old").await, Err(FsError::NotEmpty(_))));
    assert!(m.backend.exists(&remote_dir));
}

#[tokio::test]
async fn test_unlink_and_rmdir_check_kind() {
    let m = mount().await;
    m.fs.mkdir(ROOT, "d").await.unwrap();
    let (fh, _) = m.fs.create(ROOT, "f").await.unwrap();
    m.fs.release(fh).await.unwrap();

    assert!(matches!(m.fs.unlink(ROOT, "d").await, Err(FsError::IsADirectory(_))));
    assert!(matches!(m.fs.rmdir(ROOT, "f").await, Err(FsError::NotADirectory(_))));
    assert!(matches!(m.fs.unlink(ROOT, "missing").await, Err(FsError::NotFound(_))));
}

#[tokio::test]
async fn test_create_existing_name_fails() {
    let m = mount().await;
    m.fs.mkdir(ROOT, "taken").await.unwrap();
    let err = m.fs.create(ROOT, "taken").await.unwrap_err();
    assert_eq!(libc::c_int::from(err), libc::EEXIST);
}

#[tokio::test]
async fn test_invalid_names() {
    let m = mount().await;
    let long = "n".repeat(NAME_MAX + 1);
    let err = m.fs.mkdir(ROOT, &long).await.unwrap_err();
    assert_eq!(libc::c_int::from(err), libc::ENAMETOOLONG);
    assert!(matches!(m.fs.mkdir(ROOT, "..").await, Err(FsError::InvalidArgument(_))));
    assert!(matches!(m.fs.lookup(ROOT, "a/b").await, Err(FsError::InvalidArgument(_))));
    assert_eq!(m.backend.calls(BackendOp::Create), 0);
}

#[tokio::test]
async fn test_rename_across_directories() {
    let m = mount().await;
    let src = m.fs.mkdir(ROOT, "src").await.unwrap().ino;
    let dst = m.fs.mkdir(ROOT, "dst").await.unwrap().ino;
    let (fh, attr) = m.fs.create(src, "doc").await.unwrap();
    m.fs.write(fh, 0, b"content").unwrap();

    m.fs.rename(src, "doc", dst, "renamed").await.unwrap();
    assert!(names(&m.fs, src).await.is_empty());
    assert_eq!(names(&m.fs, dst).await, vec!["renamed"]);
    assert_eq!(ino_of(&m.fs, "/dst/renamed").await, attr.ino);

    // the handle follows the entry
    m.fs.flush(fh).await.unwrap();
    m.fs.release(fh).await.unwrap();
    let remote_dst = m.backend.find_child(&m.backend.root_id(), "dst").unwrap();
    let id = m.backend.find_child(&remote_dst, "renamed").unwrap();
    assert_eq!(m.backend.contents(&id).unwrap(), b"content");
}

#[tokio::test]
async fn test_rename_replaces_existing_file() {
    let m = mount().await;
    let (a, _) = m.fs.create(ROOT, "a").await.unwrap();
    m.fs.write(a, 0, b"new").unwrap();
    m.fs.flush(a).await.unwrap();
    let (b, _) = m.fs.create(ROOT, "b").await.unwrap();
    m.fs.write(b, 0, b"old").unwrap();
    m.fs.flush(b).await.unwrap();
    m.fs.release(b).await.unwrap();

    m.fs.rename(ROOT, "a", ROOT, "b").await.unwrap();
    assert_eq!(names(&m.fs, ROOT).await, vec!["b"]);
    assert_eq!(m.fs.read(a, 0, 16).await.unwrap(), b"new");
    let id = m.backend.find_child(&m.backend.root_id(), "b").unwrap();
    assert_eq!(m.backend.contents(&id).unwrap(), b"new");
    m.fs.release(a).await.unwrap();
}

#[tokio::test]
async fn test_rename_over_open_file_keeps_its_handle_usable() {
    let m = mount().await;
    let (src, _) = m.fs.create(ROOT, "src").await.unwrap();
    m.fs.release(src).await.unwrap();
    let (target, _) = m.fs.create(ROOT, "target").await.unwrap();
    m.fs.write(target, 0, b"still here").unwrap();

    m.fs.rename(ROOT, "src", ROOT, "target").await.unwrap();
    assert_eq!(m.fs.read(target, 0, 32).await.unwrap(), b"still here");
    assert_eq!(m.fs.fgetattr(target).await.unwrap().size, 10);
    m.fs.release(target).await.unwrap();
    assert_eq!(names(&m.fs, ROOT).await, vec!["target"]);
}

#[tokio::test]
async fn test_failed_replacing_rename_keeps_target() {
    let m = mount().await;
    for (name, data) in [("a", b"new".as_slice()), ("b", b"precious".as_slice())] {
        let (fh, _) = m.fs.create(ROOT, name).await.unwrap();
        m.fs.write(fh, 0, data).unwrap();
        m.fs.flush(fh).await.unwrap();
        m.fs.release(fh).await.unwrap();
    }
    let root = m.backend.root_id();
    let precious = || {
        let id = m.backend.find_child(&root, "b").unwrap();
        m.backend.contents(&id).unwrap()
    };

    // Refused before the target moves aside.
    m.backend
        .fail_next(BackendOp::Rename, 1, BackendError::Other("rejected".into()));
    let err = m.fs.rename(ROOT, "a", ROOT, "b").await.unwrap_err();
    assert!(matches!(err, FsError::PermanentIo(_)));
    assert_eq!(names(&m.fs, ROOT).await, vec!["a", "b"]);
    assert_eq!(precious(), b"precious");

    // Refused after the target moved aside: it is put back.
    m.backend.remove(&m.backend.find_child(&root, "a").unwrap());
    let err = m.fs.rename(ROOT, "a", ROOT, "b").await.unwrap_err();
    assert!(matches!(err, FsError::NotFound(_)));
    assert!(names(&m.fs, ROOT).await.contains(&"b".to_string()));
    assert_eq!(precious(), b"precious");

    let fh = m.fs.open(ino_of(&m.fs, "/b").await).await.unwrap();
    assert_eq!(m.fs.read(fh, 0, 16).await.unwrap(), b"precious");
    m.fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_name_is_reusable_after_unlinking_open_file() {
    let m = mount().await;
    let dir = m.fs.mkdir(ROOT, "dir").await.unwrap().ino;
    let (old, _) = m.fs.create(dir, "doc").await.unwrap();
    m.fs.write(old, 0, b"first").unwrap();

    m.fs.unlink(dir, "doc").await.unwrap();
    let (new, _) = m.fs.create(dir, "doc").await.unwrap();
    m.fs.write(new, 0, b"second").unwrap();
    m.fs.flush(new).await.unwrap();
    assert_eq!(names(&m.fs, dir).await, vec!["doc"]);
    assert_eq!(m.fs.read(old, 0, 16).await.unwrap(), b"first");

    m.fs.release(old).await.unwrap();
    m.fs.release(new).await.unwrap();
    let remote_dir = m.backend.find_child(&m.backend.root_id(), "dir").unwrap();
    let id = m.backend.find_child(&remote_dir, "doc").unwrap();
    assert_eq!(m.backend.contents(&id).unwrap(), b"second");
}

#[tokio::test]
async fn test_rmdir_after_unlinking_open_file() {
    let m = mount().await;
    let dir = m.fs.mkdir(ROOT, "dir").await.unwrap().ino;
    let (fh, _) = m.fs.create(dir, "doc").await.unwrap();

    m.fs.unlink(dir, "doc").await.unwrap();
    assert!(names(&m.fs, dir).await.is_empty());
    m.fs.rmdir(ROOT, "dir").await.unwrap();
    assert!(m.backend.find_child(&m.backend.root_id(), "dir").is_none());

    m.fs.write(fh, 0, b"still writable").unwrap();
    assert_eq!(m.fs.read(fh, 0, 5).await.unwrap(), b"still");
    m.fs.release(fh).await.unwrap();
    assert!(names(&m.fs, ROOT).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_remote_changes_appear_after_listing_ttl() {
    let m = mount().await;
    let gone = m.backend.insert_file(&m.backend.root_id(), "gone", b"1");
    assert_eq!(names(&m.fs, ROOT).await, vec!["gone"]);

    m.backend.insert_file(&m.backend.root_id(), "arrived", b"22");
    m.backend.remove(&gone);
    assert_eq!(names(&m.fs, ROOT).await, vec!["gone"]);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(names(&m.fs, ROOT).await, vec!["arrived"]);
    assert_eq!(m.fs.resolve("/arrived").await.unwrap().size, 2);
    assert_eq!(m.backend.calls(BackendOp::List), 2);
}

#[tokio::test]
async fn test_rename_into_own_subtree_fails() {
    let m = mount().await;
    let outer = m.fs.mkdir(ROOT, "outer").await.unwrap().ino;
    let inner = m.fs.mkdir(outer, "inner").await.unwrap().ino;

    let err = m.fs.rename(ROOT, "outer", inner, "loop").await.unwrap_err();
    assert!(matches!(err, FsError::InvalidArgument(_)));
    assert_eq!(ino_of(&m.fs, "/outer/inner").await, inner);
}

#[tokio::test]
async fn test_rename_to_same_name_is_noop() {
    let m = mount().await;
    m.fs.mkdir(ROOT, "same").await.unwrap();
    m.fs.rename(ROOT, "same", ROOT, "same").await.unwrap();
    assert_eq!(m.backend.calls(BackendOp::Rename), 0);
}

#[tokio::test(start_paused = true)]
async fn test_statfs_is_cached_for_ttl() {
    let m = mount().await;
    m.backend.set_total_quota(40960);

    let stats = m.fs.statfs().await.unwrap();
    assert_eq!(stats.total_bytes, 40960);
    assert_eq!(stats.total_blocks(), 10);
    m.fs.statfs().await.unwrap();
    assert_eq!(m.backend.calls(BackendOp::Quota), 1);

    m.backend.set_total_quota(81920);
    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(m.fs.statfs().await.unwrap().total_bytes, 81920);
    assert_eq!(m.backend.calls(BackendOp::Quota), 2);
}

#[tokio::test]
async fn test_xattrs_are_unsupported() {
    let m = mount().await;
    assert!(matches!(m.fs.getxattr(ROOT, "user.tag"), Err(FsError::Unsupported(_))));
    assert!(matches!(m.fs.setxattr(ROOT, "user.tag", b"v"), Err(FsError::Unsupported(_))));
    assert!(matches!(m.fs.listxattr(ROOT), Err(FsError::Unsupported(_))));
    assert!(matches!(m.fs.removexattr(ROOT, "user.tag"), Err(FsError::Unsupported(_))));
    assert!(matches!(m.fs.getxattr(999, "user.tag"), Err(FsError::NotFound(_))));
}
