use std::collections::BTreeSet;

use sandbox::path::{ensure_absolute_base, RelativePath};
use sandbox::{ProjectState, StateStore};
use tempfile::TempDir;

async fn open_store(temp: &TempDir) -> StateStore {
    let root = ensure_absolute_base(&temp.path().join("projects")).unwrap();
    StateStore::open(root, temp.path().join("state").join("project_state.json")).await
}

fn set(items: &[&str]) -> BTreeSet<RelativePath> {
    items.iter().map(|item| RelativePath::new(item)).collect()
}

#[tokio::test]
async fn load_without_snapshot_is_empty() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;
    assert!(store.load().await.is_empty());
    assert!(store.current().await.is_empty());
}

#[tokio::test]
async fn malformed_snapshot_loads_as_empty() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;
    std::fs::create_dir_all(store.snapshot_path().parent().unwrap()).unwrap();
    std::fs::write(store.snapshot_path(), b"{not json").unwrap();
    assert!(store.load().await.is_empty());
}

#[tokio::test]
async fn save_then_load_preserves_sets() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;
    let state = ProjectState {
        folders: set(&["src", "src/bin"]),
        files: set(&["src/main.rs", "README.md"]),
    };
    store.save(&state).await.unwrap();
    assert_eq!(store.load().await, state);

    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(store.snapshot_path()).unwrap()).unwrap();
    assert!(raw["folders"].is_array());
    assert!(raw["files"].is_array());
}

#[tokio::test]
async fn open_seeds_cache_from_snapshot() {
    let temp = TempDir::new().unwrap();
    {
        let store = open_store(&temp).await;
        store
            .incremental_update(&RelativePath::new("kept.txt"), false, false)
            .await
            .unwrap();
    }
    let reopened = open_store(&temp).await;
    assert!(reopened.current().await.contains_file("kept.txt"));
}

#[tokio::test]
async fn full_rescan_replaces_cache_and_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;
    store
        .incremental_update(&RelativePath::new("phantom"), true, false)
        .await
        .unwrap();

    std::fs::create_dir_all(store.root().join("x/y")).unwrap();
    std::fs::write(store.root().join("x/f.txt"), b"data").unwrap();

    let first = store.full_rescan().await.unwrap();
    assert_eq!(first.folders, set(&["x", "x/y"]));
    assert_eq!(first.files, set(&["x/f.txt"]));

    let second = store.full_rescan().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(store.load().await, second);
}

#[tokio::test]
async fn incremental_update_trusts_the_caller() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;
    let path = RelativePath::new("never/created.txt");

    store.incremental_update(&path, false, false).await.unwrap();
    assert!(store.current().await.contains_file("never/created.txt"));
    assert!(store.load().await.contains_file("never/created.txt"));

    store.incremental_update(&path, false, true).await.unwrap();
    assert!(!store.current().await.contains_file("never/created.txt"));
}

#[tokio::test]
async fn reset_clears_memory_and_snapshot() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;
    store
        .incremental_update(&RelativePath::new("a"), true, false)
        .await
        .unwrap();
    assert!(store.snapshot_path().exists());

    let cleared = store.reset().await.unwrap();
    assert!(cleared.is_empty());
    assert!(store.current().await.is_empty());
    assert!(!store.snapshot_path().exists());

    // A second reset with nothing on disk still succeeds.
    store.reset().await.unwrap();
}

#[tokio::test]
async fn rescan_skips_snapshot_inside_root() {
    let temp = TempDir::new().unwrap();
    let root = ensure_absolute_base(&temp.path().join("projects")).unwrap();
    let store = StateStore::open(root.clone(), root.join("project_state.json")).await;
    std::fs::write(root.join("real.txt"), b"x").unwrap();

    let state = store.full_rescan().await.unwrap();
    assert_eq!(state.files, set(&["real.txt"]));
    assert!(root.join("project_state.json").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn rescan_files_directory_links_as_folders() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp).await;
    let root = store.root().to_path_buf();
    std::fs::create_dir_all(root.join("real/inner")).unwrap();
    std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();
    std::fs::write(root.join("note.txt"), b"n").unwrap();
    std::os::unix::fs::symlink(root.join("note.txt"), root.join("note-link")).unwrap();

    let state = store.full_rescan().await.unwrap();
    assert_eq!(state.folders, set(&["alias", "real", "real/inner"]));
    assert_eq!(state.files, set(&["note-link", "note.txt"]));
}

#[tokio::test]
async fn unwritable_snapshot_keeps_the_cache_update() {
    let temp = TempDir::new().unwrap();
    let root = ensure_absolute_base(&temp.path().join("projects")).unwrap();
    let snapshot = temp.path().join("snap");
    std::fs::create_dir_all(&snapshot).unwrap();
    let store = StateStore::open(root, snapshot).await;

    store
        .incremental_update(&RelativePath::new("kept"), true, false)
        .await
        .unwrap();
    assert!(store.current().await.contains_folder("kept"));
    assert!(store.save(&store.current().await).await.is_err());
}
