mod common;

use datmo::project::ProjectRoot;
use datmo::snapshot::SnapshotCreate;

use common::{init_project, offline_config, scratch_dir};

#[test]
fn init_then_status_without_container_runtime() {
    let td = scratch_dir();
    let root = init_project(td.path(), offline_config());

    assert!(td.path().join(".datmo").is_dir());
    let status = root.status().expect("status");
    assert_eq!(status.project.name, "test-project");
    assert!(status.current_snapshot.is_none());
    assert!(status.latest_snapshot_user_generated.is_none());
    assert!(!status.unstaged_code);
}

#[test]
fn commands_outside_a_project_report_not_initialized() {
    let td = scratch_dir();
    let root = ProjectRoot::new(td.path(), offline_config()).expect("root");
    let err = root.open().err().expect("open must fail");
    assert_eq!(err.key(), "project-not-initialized");
}

#[test]
fn identical_content_yields_the_same_snapshot() {
    let td = scratch_dir();
    let root = init_project(td.path(), offline_config());
    std::fs::write(td.path().join("train.py"), "print('hi')\n").unwrap();
    let stores = root.open().unwrap();

    let opts = SnapshotCreate {
        config: Some([("lr".to_owned(), serde_json::json!(0.1))].into()),
        ..SnapshotCreate::with_message("first")
    };
    let s1 = stores.snapshots.create(&opts).unwrap();
    let s2 = stores
        .snapshots
        .create(&SnapshotCreate {
            message: Some("second".to_owned()),
            ..opts.clone()
        })
        .unwrap();
    assert_eq!(s1.id, s2.id);
    assert_eq!(s2.message, "first");

    let changed = stores
        .snapshots
        .create(&SnapshotCreate {
            config: Some([("lr".to_owned(), serde_json::json!(0.2))].into()),
            ..SnapshotCreate::with_message("third")
        })
        .unwrap();
    assert_ne!(changed.id, s1.id);
    assert_eq!(changed.code_id, s1.code_id);
    assert_eq!(stores.snapshots.list(Some(true)).unwrap().len(), 2);
}

#[test]
fn snapshot_checkout_restores_code() {
    let td = scratch_dir();
    let root = init_project(td.path(), offline_config());
    let script = td.path().join("train.py");
    std::fs::write(&script, "version = 1\n").unwrap();
    let stores = root.open().unwrap();

    let s1 = stores
        .snapshots
        .create(&SnapshotCreate::with_message("v1"))
        .unwrap();
    std::fs::write(&script, "version = 2\n").unwrap();
    assert!(stores.code().has_unstaged_changes().unwrap());
    let s2 = stores
        .snapshots
        .create(&SnapshotCreate::with_message("v2"))
        .unwrap();
    assert_ne!(s1.code_id, s2.code_id);

    stores.snapshots.checkout(&s1.id).unwrap();
    assert_eq!(std::fs::read_to_string(&script).unwrap(), "version = 1\n");
    assert!(!stores.code().has_unstaged_changes().unwrap());
}

#[test]
fn checkout_refuses_unstaged_code() {
    let td = scratch_dir();
    let root = init_project(td.path(), offline_config());
    let script = td.path().join("train.py");
    std::fs::write(&script, "a\n").unwrap();
    let stores = root.open().unwrap();
    let s1 = stores
        .snapshots
        .create(&SnapshotCreate::with_message("a"))
        .unwrap();

    std::fs::write(&script, "b\n").unwrap();
    let err = stores.snapshots.checkout(&s1.id).unwrap_err();
    assert_eq!(err.key(), "unstaged-changes");
    assert_eq!(std::fs::read_to_string(&script).unwrap(), "b\n");
}

#[test]
fn file_collection_recreated_after_delete_gets_new_id() {
    let td = scratch_dir();
    let root = init_project(td.path(), offline_config());
    std::fs::write(td.path().join("data.csv"), "a,b\n1,2\n").unwrap();
    let stores = root.open().unwrap();
    let paths = vec!["data.csv".to_owned()];

    let first = stores.files().create(&paths).unwrap();
    assert_eq!(stores.files().create(&paths).unwrap().id, first.id);
    let stored = stores.files().path_of(&first.id).unwrap();
    assert!(stored.join("data.csv").is_file());

    stores.files().delete(&first.id).unwrap();
    assert_eq!(stores.files().get(&first.id).unwrap_err().key(), "entity-not-found");

    let again = stores.files().create(&paths).unwrap();
    assert_eq!(again.filehash, first.filehash);
    assert_ne!(again.id, first.id);
}

#[test]
fn cleanup_then_reinit_starts_fresh() {
    let td = scratch_dir();
    let root = init_project(td.path(), offline_config());
    let first = root.open().unwrap().project.id;
    root.cleanup().unwrap();
    assert!(!root.is_initialized());

    let root = ProjectRoot::new(td.path(), offline_config()).unwrap();
    let second = root.init("again", None).unwrap();
    assert_ne!(first, second.id);
}

#[test]
fn snapshots_are_grouped_by_current_session() {
    let td = scratch_dir();
    let root = init_project(td.path(), offline_config());
    let stores = root.open().unwrap();
    std::fs::write(td.path().join("a.py"), "1\n").unwrap();
    let in_default = stores
        .snapshots
        .create(&SnapshotCreate::with_message("d"))
        .unwrap();

    stores.sessions().create("exp").unwrap();
    stores.sessions().select("exp").unwrap();
    std::fs::write(td.path().join("a.py"), "2\n").unwrap();
    let in_exp = stores
        .snapshots
        .create(&SnapshotCreate::with_message("e"))
        .unwrap();

    let listed = stores.snapshots.list_in_session("exp", Some(true)).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, in_exp.id);
    assert_eq!(
        stores.snapshots.list_in_session("default", None).unwrap()[0].id,
        in_default.id
    );

    stores.sessions().delete("exp").unwrap();
    assert_eq!(stores.sessions().current().unwrap().unwrap().name, "default");
    assert_eq!(stores.snapshots.get(&in_exp.id).unwrap_err().key(), "entity-not-found");
}
