mod common;

use datmo::config::Config;
use datmo::entity::TaskStatus;
use datmo::snapshot::SnapshotCreate;
use datmo::task::TaskRunOptions;

use common::{docker_available, init_project, scratch_dir};

fn small_image_project(dir: &std::path::Path) -> datmo::project::ProjectRoot {
    let cfg = Config::default();
    let env_dir = dir.join(&cfg.project.environment_dir);
    std::fs::create_dir_all(&env_dir).unwrap();
    std::fs::write(env_dir.join("Dockerfile"), "FROM alpine:3.19\n").unwrap();
    init_project(dir, cfg)
}

#[tokio::test]
async fn task_run_records_results_and_snapshots() {
    if !docker_available() {
        eprintln!("skipping: container runtime not reachable");
        return;
    }
    let td = scratch_dir();
    let root = small_image_project(td.path());
    std::fs::write(td.path().join("script.sh"), "echo accuracy:0.45\n").unwrap();
    let stores = root.open().unwrap();

    let task = stores.tasks.create().unwrap();
    let opts = TaskRunOptions {
        command_list: Some(vec![
            "sh".to_owned(),
            "-c".to_owned(),
            "echo accuracy:0.45; echo loss: 0.1; echo done".to_owned(),
        ]),
        ..TaskRunOptions::default()
    };
    let done = stores
        .tasks
        .run(&task.id, SnapshotCreate::default(), opts)
        .await
        .expect("task run");

    assert_eq!(done.status, TaskStatus::Success);
    let results = done.results.clone().unwrap_or_default();
    assert_eq!(results.get("accuracy").map(String::as_str), Some("0.45"));
    assert_eq!(results.get("loss").map(String::as_str), Some("0.1"));
    assert!(done.logs.as_deref().unwrap_or_default().contains("done"));

    let before = stores.snapshots.get(done.before_snapshot_id.as_deref().unwrap()).unwrap();
    let after = stores.snapshots.get(done.after_snapshot_id.as_deref().unwrap()).unwrap();
    assert!(!before.visible && !after.visible);
    assert_eq!(after.stats["accuracy"], serde_json::json!("0.45"));

    let promoted = stores
        .snapshots
        .create_from_task(&done.id, &SnapshotCreate::with_message("good run"))
        .unwrap();
    assert_eq!(promoted.id, after.id);
    assert!(promoted.visible);

    stores.tasks.delete(&done.id).await.unwrap();
    root.cleanup().unwrap();
}

#[tokio::test]
async fn detached_task_stops_with_stop_all() {
    if !docker_available() {
        eprintln!("skipping: container runtime not reachable");
        return;
    }
    let td = scratch_dir();
    let root = small_image_project(td.path());
    let stores = root.open().unwrap();

    let task = stores.tasks.create().unwrap();
    let opts = TaskRunOptions {
        command: Some("sleep 300".to_owned()),
        detach: true,
        ..TaskRunOptions::default()
    };
    let running = stores
        .tasks
        .run(&task.id, SnapshotCreate::default(), opts)
        .await
        .unwrap();
    assert_eq!(running.status, TaskStatus::Running);
    assert!(running.run_id.is_some());

    stores.tasks.stop(None, true).await.unwrap();
    let stopped = stores.tasks.get(&task.id).unwrap();
    assert_eq!(stopped.status, TaskStatus::Stopped);
    assert!(stopped.after_snapshot_id.is_some());

    root.cleanup().unwrap();
}
