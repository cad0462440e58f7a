//! Tests for the JSON state file.

use rstest::{fixture, rstest};
use tempfile::TempDir;
use url::Url;

use super::*;
use crate::infra::InfraKind;

struct Scratch {
    _dir: TempDir,
    root: Utf8PathBuf,
}

#[fixture]
fn scratch() -> Scratch {
    let dir = TempDir::new().expect("create temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp path");
    Scratch { _dir: dir, root }
}

fn remote_snapshot(name: &str) -> InfraSnapshot {
    InfraSnapshot {
        infra: InfraKind::Remote,
        name: name.to_owned(),
        ops_center_url: Some(Url::parse("https://ops.example.com:32009/web/portal").expect("url")),
        wizard_url: None,
        application: None,
        backend: None,
        provisioner_state: None,
    }
}

#[rstest]
fn load_returns_none_without_a_file(scratch: Scratch) {
    let store = SnapshotStore::new(scratch.root.join("rigger.state.json"));
    assert!(store.load().expect("load").is_none());
}

#[rstest]
fn load_returns_none_when_the_directory_is_missing(scratch: Scratch) {
    let store = SnapshotStore::new(scratch.root.join("absent/rigger.state.json"));
    assert!(store.load().expect("load").is_none());
}

#[rstest]
fn save_then_load_returns_the_snapshot(scratch: Scratch) {
    let store = SnapshotStore::new(scratch.root.join("nested/state.json"));
    let snapshot = remote_snapshot("staging");

    store.save(&snapshot).expect("save");

    assert_eq!(store.load().expect("load"), Some(snapshot));
    assert!(!scratch.root.join("nested/state.json.tmp").exists());
}

#[rstest]
fn save_replaces_the_previous_snapshot(scratch: Scratch) {
    let store = SnapshotStore::new(scratch.root.join("state.json"));
    store.save(&remote_snapshot("first")).expect("save first");
    store.save(&remote_snapshot("second")).expect("save second");

    let loaded = store.load().expect("load").expect("snapshot present");
    assert_eq!(loaded.name, "second");
}

#[rstest]
fn load_reports_corrupt_files(scratch: Scratch) {
    let path = scratch.root.join("state.json");
    std::fs::write(&path, "{ not json").expect("write corrupt file");
    let store = SnapshotStore::new(path.clone());

    let err = store.load().expect_err("corrupt file");
    assert!(matches!(err, SnapshotError::Parse { path: reported, .. } if reported == path));
}

#[rstest]
fn remove_reports_whether_a_file_existed(scratch: Scratch) {
    let store = SnapshotStore::new(scratch.root.join("state.json"));
    assert!(!store.remove().expect("nothing to remove"));

    store.save(&remote_snapshot("staging")).expect("save");
    assert!(store.remove().expect("remove"));
    assert!(store.load().expect("load").is_none());
}

#[rstest]
fn bare_file_names_resolve_against_the_working_directory() {
    let store = SnapshotStore::default();
    assert_eq!(store.path(), Utf8Path::new(DEFAULT_STATE_FILE));
    let (parent, file_name) = store.split().expect("split");
    assert_eq!(parent, Utf8Path::new("."));
    assert_eq!(file_name, DEFAULT_STATE_FILE);
}
