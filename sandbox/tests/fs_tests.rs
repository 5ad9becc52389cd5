use std::sync::Arc;
use std::time::Duration;

use sandbox::{RetryPolicy, SandboxConfig, SandboxError, SandboxFs, StateStore};
use tempfile::TempDir;

async fn build_sandbox(temp: &TempDir, max_file_size: u64) -> SandboxFs {
    let config = SandboxConfig::new(temp.path().join("projects"), max_file_size)
        .unwrap()
        .with_retry(RetryPolicy::new(3, Duration::from_millis(5)).unwrap());
    let state = StateStore::open(
        config.base_dir.clone(),
        temp.path().join("project_state.json"),
    )
    .await;
    SandboxFs::new(config, Arc::new(state))
}

#[tokio::test]
async fn create_then_read_roundtrip() {
    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 512 * 1024).await;

    let message = fs.create_file("a/b.txt", "hi").await.unwrap();
    assert!(message.contains("a/b.txt"));
    assert_eq!(fs.read_file("a/b.txt").await.unwrap(), "hi");

    let state = fs.state().current().await;
    assert!(state.contains_file("a/b.txt"));
    assert!(state.contains_folder("a"));
}

#[tokio::test]
async fn write_overwrites_existing_content() {
    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 512 * 1024).await;

    fs.create_file("notes.md", "first draft").await.unwrap();
    fs.write_file("notes.md", "final").await.unwrap();
    assert_eq!(fs.read_file("notes.md").await.unwrap(), "final");
}

#[tokio::test]
async fn delete_removes_file_and_state_entry() {
    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 512 * 1024).await;

    fs.create_file("a/b.txt", "hi").await.unwrap();
    fs.delete_file("a/b.txt").await.unwrap();

    assert!(!fs.state().current().await.contains_file("a/b.txt"));
    let err = fs.read_file("a/b.txt").await.unwrap_err();
    assert!(matches!(err, SandboxError::NotFound { .. }));
}

#[tokio::test]
async fn delete_refuses_non_empty_directory() {
    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 512 * 1024).await;

    fs.create_file("full/keep.txt", "x").await.unwrap();
    let err = fs.delete_file("full").await.unwrap_err();
    assert!(matches!(err, SandboxError::InvalidOperation(_)));
    assert_eq!(fs.read_file("full/keep.txt").await.unwrap(), "x");

    fs.delete_file("full/keep.txt").await.unwrap();
    fs.delete_file("full").await.unwrap();
    assert!(!fs.state().current().await.contains_folder("full"));
}

#[tokio::test]
async fn delete_missing_is_not_found() {
    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 512 * 1024).await;

    let err = fs.delete_file("ghost.txt").await.unwrap_err();
    assert!(matches!(err, SandboxError::NotFound { .. }));
    assert!(err.to_string().contains("ghost.txt"));
}

#[tokio::test]
async fn create_folder_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 512 * 1024).await;

    fs.create_folder("x/y").await.unwrap();
    fs.create_folder("x/y").await.unwrap();
    let state = fs.state().current().await;
    assert!(state.contains_folder("x"));
    assert!(state.contains_folder("x/y"));
}

#[tokio::test]
async fn prevent_path_traversal() {
    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 512 * 1024).await;

    let err = fs.create_file("../evil.txt", "bad").await.unwrap_err();
    assert!(matches!(err, SandboxError::OutsideRoot { .. }));
    assert!(!temp.path().join("evil.txt").exists());

    let err = fs.list_entries("..\\..").await.unwrap_err();
    assert!(matches!(err, SandboxError::OutsideRoot { .. }));
}

#[tokio::test]
async fn enforce_file_size_limit() {
    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 4).await;

    let err = fs.write_file("large.txt", b"12345").await.unwrap_err();
    assert!(format!("{}", err).contains("file too large"));
}

#[tokio::test]
async fn listing_reports_metadata_and_learns_entries() {
    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 512 * 1024).await;

    std::fs::create_dir_all(fs.base_dir().join("outside_process/inner")).unwrap();
    std::fs::write(fs.base_dir().join("outside_process/data.bin"), b"1234").unwrap();
    assert!(!fs.state().current().await.contains_folder("outside_process"));

    let entries = fs.list_entries("outside_process").await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "data.bin");
    assert!(!entries[0].is_directory);
    assert_eq!(entries[0].size, Some(4));
    assert!(entries[0].modified.is_some());
    assert_eq!(entries[1].name, "inner");
    assert!(entries[1].is_directory);
    assert_eq!(entries[1].size, None);

    let state = fs.state().current().await;
    assert!(state.contains_file("outside_process/data.bin"));
    assert!(state.contains_folder("outside_process/inner"));
}

#[tokio::test]
async fn listing_never_forgets_stale_entries() {
    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 512 * 1024).await;

    fs.create_file("stale.txt", "x").await.unwrap();
    std::fs::remove_file(fs.base_dir().join("stale.txt")).unwrap();
    fs.list_entries("").await.unwrap();
    assert!(fs.state().current().await.contains_file("stale.txt"));

    let rescanned = fs.state().full_rescan().await.unwrap();
    assert!(!rescanned.contains_file("stale.txt"));
}

#[tokio::test]
async fn listing_a_file_is_rejected() {
    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 512 * 1024).await;

    fs.create_file("plain.txt", "x").await.unwrap();
    let err = fs.list_entries("plain.txt").await.unwrap_err();
    assert!(matches!(err, SandboxError::InvalidOperation(_)));
    let err = fs.list_entries("missing").await.unwrap_err();
    assert!(matches!(err, SandboxError::NotFound { .. }));
}

#[tokio::test]
async fn write_into_directory_path_fails_fast() {
    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 512 * 1024).await;

    fs.create_folder("dir").await.unwrap();
    let err = fs.write_file("dir", "x").await.unwrap_err();
    assert!(matches!(err, SandboxError::InvalidOperation(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn io_failures_are_retried_until_the_ceiling() {
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 512 * 1024).await;
    fs.create_folder("locked").await.unwrap();
    let locked = fs.base_dir().join("locked");
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o500)).unwrap();

    // Root ignores permission bits; nothing to observe there.
    if std::fs::write(locked.join("canary"), b"").is_ok() {
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o700)).unwrap();
        return;
    }

    let start = Instant::now();
    let err = fs.write_file("locked/file.txt", "x").await.unwrap_err();
    assert!(matches!(err, SandboxError::Io { .. }));
    // Three attempts means two waits of the configured delay.
    assert!(start.elapsed() >= Duration::from_millis(10));

    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o700)).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mutations_all_reach_the_snapshot() {
    let temp = TempDir::new().unwrap();
    let fs = build_sandbox(&temp, 512 * 1024).await;

    let mut handles = Vec::new();
    for idx in 0..16 {
        let fs = fs.clone();
        handles.push(tokio::spawn(async move {
            fs.create_file(&format!("batch/file-{idx}.txt"), format!("{idx}"))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let persisted = fs.state().load().await;
    for idx in 0..16 {
        assert!(persisted.contains_file(&format!("batch/file-{idx}.txt")));
    }
    assert_eq!(persisted, fs.state().current().await);
}

#[tokio::test]
async fn mutations_succeed_when_the_snapshot_cannot_be_written() {
    let temp = TempDir::new().unwrap();
    let config = SandboxConfig::new(temp.path().join("projects"), 1024).unwrap();
    let snapshot = temp.path().join("snap");
    std::fs::create_dir_all(&snapshot).unwrap();
    let state = StateStore::open(config.base_dir.clone(), snapshot).await;
    let fs = SandboxFs::new(config, Arc::new(state));

    fs.create_file("a.txt", "hi").await.unwrap();
    assert!(fs.base_dir().join("a.txt").is_file());
    assert!(fs.state().current().await.contains_file("a.txt"));

    fs.delete_file("a.txt").await.unwrap();
    assert!(!fs.base_dir().join("a.txt").exists());
    assert!(!fs.state().current().await.contains_file("a.txt"));
}
