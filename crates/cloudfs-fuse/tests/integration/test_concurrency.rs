//! Concurrent namespace and content operations.

use std::{sync::Arc, time::Duration};

use cloudfs_core::ports::memory_backend::BackendOp;
use cloudfs_fuse::FsError;
use tokio::time::timeout;

use crate::common::{ino_of, mount, names, ROOT};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crossing_moves_complete() {
    let m = mount().await;
    m.backend.set_latency(Some(Duration::from_millis(1)));
    let x = m.fs.mkdir(ROOT, "x").await.unwrap().ino;
    let y = m.fs.mkdir(ROOT, "y").await.unwrap().ino;
    for (dir, name) in [(x, "from_x"), (y, "from_y")] {
        let (fh, _) = m.fs.create(dir, name).await.unwrap();
        m.fs.release(fh).await.unwrap();
    }
    let fs = Arc::new(m.fs);

    let shuttle = |name: &'static str, home: u64, away: u64| {
        let fs = Arc::clone(&fs);
        tokio::spawn(async move {
            for _ in 0..25 {
                fs.rename(home, name, away, name).await?;
                fs.rename(away, name, home, name).await?;
            }
            Ok::<_, FsError>(())
        })
    };
    let a = shuttle("from_x", x, y);
    let b = shuttle("from_y", y, x);

    let joined = timeout(Duration::from_secs(30), async { (a.await, b.await) })
        .await
        .expect("moves deadlocked");
    joined.0.unwrap().unwrap();
    joined.1.unwrap().unwrap();

    assert_eq!(names(&fs, x).await, vec!["from_x"]);
    assert_eq!(names(&fs, y).await, vec!["from_y"]);
    assert_eq!(m.backend.calls(BackendOp::Rename), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_creates_in_one_directory() {
    let m = mount().await;
    let fs = Arc::new(m.fs);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let fs = Arc::clone(&fs);
        tasks.push(tokio::spawn(async move {
            let (fh, _) = fs.create(ROOT, &format!("file{i:02}")).await?;
            fs.write(fh, 0, format!("payload {i}").as_bytes())?;
            fs.flush(fh).await?;
            fs.release(fh).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let listed = names(&fs, ROOT).await;
    assert_eq!(listed.len(), 16);
    assert_eq!(listed[0], "file00");
    assert_eq!(listed[15], "file15");
    assert_eq!(m.backend.calls(BackendOp::Create), 16);
    for i in 0..16 {
        let id = m
            .backend
            .find_child(&m.backend.root_id(), &format!("file{i:02}"))
            .unwrap();
        assert_eq!(m.backend.contents(&id).unwrap(), format!("payload {i}").into_bytes());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_name_create_race_has_one_winner() {
    let m = mount().await;
    let fs = Arc::new(m.fs);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let fs = Arc::clone(&fs);
        tasks.push(tokio::spawn(async move { fs.mkdir(ROOT, "contested").await }));
    }
    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert!(matches!(e, FsError::AlreadyExists(_))),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(m.backend.calls(BackendOp::Create), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_share_one_fetch() {
    let m = mount().await;
    m.backend
        .insert_file(&m.backend.root_id(), "shared", &[3u8; 4096]);
    m.backend.set_latency(Some(Duration::from_millis(50)));
    let ino = ino_of(&m.fs, "/shared").await;
    let fs = Arc::new(m.fs);
    let fh = fs.open(ino).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let fs = Arc::clone(&fs);
        tasks.push(tokio::spawn(async move { fs.read(fh, 0, 4096).await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), vec![3u8; 4096]);
    }
    assert_eq!(m.backend.calls(BackendOp::Get), 1);
    fs.release(fh).await.unwrap();
}
