use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use local_wikidata::checkpoint::{CheckpointStore, ImportCheckpoint};
use local_wikidata::error::MirrorError;
use local_wikidata::reader::FrameMark;

fn scratch() -> (TempDir, Utf8PathBuf) {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, root)
}

fn checkpoint(offset: u64, committed: u64) -> ImportCheckpoint {
    ImportCheckpoint {
        byte_offset: offset,
        entities_committed: committed,
        frame: FrameMark {
            compressed_offset: offset / 4,
            decompressed_offset: offset / 2,
        },
        last_id: Some(format!("Q{committed}").parse().unwrap()),
        dump_len: Some(4096),
        completed: false,
        updated_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
    }
}

#[test]
fn missing_checkpoint_loads_as_none() {
    let (_dir, root) = scratch();
    let mut store = CheckpointStore::for_database(&root.join("wikidata.db"));
    assert_eq!(store.load().unwrap(), None);
}

#[test]
fn save_then_load_leaves_no_temp_files() {
    let (_dir, root) = scratch();
    let mut store = CheckpointStore::for_database(&root.join("wikidata.db"));
    store.save(&checkpoint(100, 10)).unwrap();
    store.save(&checkpoint(250, 20)).unwrap();

    let mut reopened = CheckpointStore::for_database(&root.join("wikidata.db"));
    assert_eq!(reopened.load().unwrap(), Some(checkpoint(250, 20)));

    let names = fs::read_dir(&root)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(names, ["wikidata.progress.json"]);
}

#[test]
fn refuses_to_move_backwards() {
    let (_dir, root) = scratch();
    let mut store = CheckpointStore::new(root.join("progress.json"));
    store.save(&checkpoint(500, 50)).unwrap();

    assert_matches!(store.save(&checkpoint(400, 60)), Err(MirrorError::Checkpoint(_)));
    assert_matches!(store.save(&checkpoint(600, 40)), Err(MirrorError::Checkpoint(_)));

    // A fresh handle learns the last position on load.
    let mut reopened = CheckpointStore::new(root.join("progress.json"));
    reopened.load().unwrap();
    assert_matches!(reopened.save(&checkpoint(400, 40)), Err(MirrorError::Checkpoint(_)));
    assert_eq!(reopened.load().unwrap(), Some(checkpoint(500, 50)));
}

#[test]
fn clear_allows_restart() {
    let (_dir, root) = scratch();
    let mut store = CheckpointStore::new(root.join("progress.json"));
    store.save(&checkpoint(500, 50)).unwrap();
    store.clear().unwrap();
    assert_eq!(store.load().unwrap(), None);
    store.save(&checkpoint(100, 10)).unwrap();
    store.clear().unwrap();
    store.clear().unwrap();
}

#[test]
fn unreadable_checkpoint_is_an_error() {
    let (_dir, root) = scratch();
    let path = root.join("progress.json");
    fs::write(&path, b"{\"byte_offset\": ").unwrap();
    let mut store = CheckpointStore::new(path);
    assert_matches!(store.load(), Err(MirrorError::Checkpoint(_)));
}

#[test]
fn inconsistent_checkpoint_is_rejected() {
    let (_dir, root) = scratch();
    let mut store = CheckpointStore::new(root.join("progress.json"));
    let mut bad = checkpoint(100, 10);
    bad.frame.decompressed_offset = 200;
    assert_matches!(store.save(&bad), Err(MirrorError::Checkpoint(_)));
    assert_eq!(store.load().unwrap(), None);
}
