// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use concord_cli::commands::{demo, inspect};
use tempfile::tempdir;

#[tokio::test]
async fn test_demo_then_inspect() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("replica-1.snap");
    let opts = demo::DemoOptions {
        replicas: 3,
        events: 4,
        snapshot: Some(path.clone()),
    };

    let report = demo::run(&opts).await.unwrap();

    // One event before the start command, the start itself, then four posts.
    assert_eq!(report.start_index, 2);
    assert_eq!(report.history.iter().map(|e| e.event_id).collect::<Vec<_>>(), vec![1]);
    assert_eq!(
        report.delivered.iter().map(|e| e.event_id).collect::<Vec<_>>(),
        vec![3, 4, 5, 6]
    );
    assert_eq!(report.applied, vec![(1, 6), (2, 6), (3, 6)]);

    let summary = inspect::load(&path).unwrap();
    assert_eq!(summary.meta.applied_index, 6);
    assert_eq!(summary.meta.replica_id, 1);
    assert!(summary.tables.contains(&("events".to_string(), 5)));
    assert!(inspect::run(&path).is_ok());
}

#[tokio::test]
async fn test_demo_requires_a_replica() {
    let opts = demo::DemoOptions {
        replicas: 0,
        events: 1,
        snapshot: None,
    };
    assert!(demo::run(&opts).await.is_err());
}

#[test]
fn test_inspect_missing_file() {
    let dir = tempdir().unwrap();
    assert!(inspect::run(&dir.path().join("nope.snap")).is_err());
}
