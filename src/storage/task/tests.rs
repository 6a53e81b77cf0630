use super::*;
use crate::error::QueueError;
use crate::schedule::types::{LogLevel, LogQuery, NewTask, TaskStatus, TaskType};
use crate::storage::log::LogStorage;
use crate::storage::task::sqlite::SqliteTaskStorage;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

async fn setup_storage() -> (SqliteTaskStorage, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let storage = SqliteTaskStorage::new(temp_dir.path().join("tasks.db"), 4)
        .await
        .unwrap();
    (storage, temp_dir)
}

fn create_test_task(task_type: &str) -> NewTask {
    NewTask::new(
        Uuid::new_v4().to_string(),
        TaskType::from(task_type),
        json!({ "source": "https://example.com/audio.mp3" }),
    )
}

#[tokio::test]
async fn test_save_and_get_task() {
    let (storage, _temp_dir) = setup_storage().await;
    let task = create_test_task("download");

    assert_eq!(storage.create(&task).await.unwrap(), InsertOutcome::Inserted);
    let stored = storage.get(&task.task_id).await.unwrap().unwrap();

    assert_eq!(stored.task_id, task.task_id);
    assert_eq!(stored.task_type, TaskType::Download);
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.progress, 0);
    assert_eq!(stored.payload, task.payload);
    assert!(stored.result.is_none());
    assert!(storage.get("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_insert_keeps_original_row() {
    let (storage, _temp_dir) = setup_storage().await;
    let task = create_test_task("download");
    storage.create(&task).await.unwrap();

    let mut second = task.clone();
    second.payload = json!({ "source": "something else" });
    assert_eq!(storage.create(&second).await.unwrap(), InsertOutcome::Duplicate);

    let stored = storage.get(&task.task_id).await.unwrap().unwrap();
    assert_eq!(stored.payload, task.payload);
    assert_eq!(storage.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_claim_returns_oldest_and_marks_processing() {
    let (storage, _temp_dir) = setup_storage().await;
    let first = create_test_task("download");
    let second = create_test_task("transcribe");
    storage.create(&first).await.unwrap();
    storage.create(&second).await.unwrap();

    let claimed = storage.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.task_id, first.task_id);
    assert_eq!(claimed.task_type, TaskType::Download);
    assert_eq!(claimed.payload, first.payload);

    let stored = storage.get(&first.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Processing);

    let claimed = storage.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.task_id, second.task_id);
    assert!(storage.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_dependency_gating() {
    let (storage, _temp_dir) = setup_storage().await;
    let parent = create_test_task("download");
    let child = create_test_task("transcribe").depends_on(parent.task_id.clone());
    storage.create(&parent).await.unwrap();
    storage.create(&child).await.unwrap();

    assert_eq!(storage.claim_next().await.unwrap().unwrap().task_id, parent.task_id);
    // parent is processing, child must stay put
    assert!(storage.claim_next().await.unwrap().is_none());

    storage
        .update_status(&parent.task_id, TaskStatus::Completed, Some(&json!({"file": "a.wav"})))
        .await
        .unwrap();
    assert_eq!(storage.claim_next().await.unwrap().unwrap().task_id, child.task_id);
}

#[tokio::test]
async fn test_failed_parent_never_releases_dependent() {
    let (storage, _temp_dir) = setup_storage().await;
    let parent = create_test_task("download");
    let child = create_test_task("transcribe").depends_on(parent.task_id.clone());
    storage.create(&parent).await.unwrap();
    storage.create(&child).await.unwrap();

    storage.claim_next().await.unwrap();
    storage.update_status(&parent.task_id, TaskStatus::Failed, None).await.unwrap();

    assert!(storage.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_prefers_tasks_without_dependency() {
    let (storage, _temp_dir) = setup_storage().await;
    let parent = create_test_task("download");
    storage.create(&parent).await.unwrap();
    storage.claim_next().await.unwrap();
    storage.update_status(&parent.task_id, TaskStatus::Completed, None).await.unwrap();

    // the dependent is older than the free task but both are eligible
    let dependent = create_test_task("transcribe").depends_on(parent.task_id.clone());
    let free = create_test_task("media_fetch");
    storage.create(&dependent).await.unwrap();
    storage.create(&free).await.unwrap();

    assert_eq!(storage.claim_next().await.unwrap().unwrap().task_id, free.task_id);
    assert_eq!(storage.claim_next().await.unwrap().unwrap().task_id, dependent.task_id);
}

#[tokio::test]
async fn test_status_never_regresses() {
    let (storage, _temp_dir) = setup_storage().await;
    let task = create_test_task("download");
    storage.create(&task).await.unwrap();

    // processing is only reachable through a claim
    assert_eq!(
        storage.update_status(&task.task_id, TaskStatus::Processing, None).await.unwrap(),
        UpdateOutcome::Rejected { current: TaskStatus::Pending }
    );
    assert_eq!(
        storage.update_status(&task.task_id, TaskStatus::Completed, None).await.unwrap(),
        UpdateOutcome::Rejected { current: TaskStatus::Pending }
    );

    storage.claim_next().await.unwrap();
    assert_eq!(
        storage.update_status(&task.task_id, TaskStatus::Completed, Some(&json!("done"))).await.unwrap(),
        UpdateOutcome::Applied
    );

    for status in [TaskStatus::Pending, TaskStatus::Processing, TaskStatus::Failed, TaskStatus::Completed] {
        assert_eq!(
            storage.update_status(&task.task_id, status, None).await.unwrap(),
            UpdateOutcome::Rejected { current: TaskStatus::Completed }
        );
    }

    let stored = storage.get(&task.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.progress, 100);
    assert_eq!(stored.result, Some(json!("done")));
}

#[tokio::test]
async fn test_update_missing_task_is_noop() {
    let (storage, _temp_dir) = setup_storage().await;

    assert_eq!(
        storage.update_status("nope", TaskStatus::Failed, None).await.unwrap(),
        UpdateOutcome::Missing
    );
    assert_eq!(
        storage.update_progress("nope", 10, None).await.unwrap(),
        UpdateOutcome::Missing
    );
    assert!(storage.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_progress_updates_keep_interim_result() {
    let (storage, _temp_dir) = setup_storage().await;
    let task = create_test_task("transcribe");
    storage.create(&task).await.unwrap();

    assert_eq!(
        storage.update_progress(&task.task_id, 10, None).await.unwrap(),
        UpdateOutcome::Rejected { current: TaskStatus::Pending }
    );

    storage.claim_next().await.unwrap();
    storage
        .update_progress(&task.task_id, 40, Some(&json!({"segments": 3})))
        .await
        .unwrap();
    storage.update_progress(&task.task_id, 250, None).await.unwrap();

    let stored = storage.get(&task.task_id).await.unwrap().unwrap();
    assert_eq!(stored.progress, 100);
    assert_eq!(stored.result, Some(json!({"segments": 3})));

    // failing without a result keeps the last snapshot
    storage.update_status(&task.task_id, TaskStatus::Failed, None).await.unwrap();
    let stored = storage.get(&task.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.result, Some(json!({"segments": 3})));
}

#[tokio::test]
async fn test_find_dependent_and_list_order() {
    let (storage, _temp_dir) = setup_storage().await;
    let a = create_test_task("download");
    let b = create_test_task("process").depends_on(a.task_id.clone());
    storage.create(&a).await.unwrap();
    storage.create(&b).await.unwrap();

    assert_eq!(storage.find_dependent(&a.task_id).await.unwrap(), Some(b.task_id.clone()));
    assert_eq!(storage.find_dependent(&b.task_id).await.unwrap(), None);

    let listed: Vec<String> = storage.list().await.unwrap().into_iter().map(|t| t.task_id).collect();
    assert_eq!(listed, vec![b.task_id, a.task_id]);
}

#[tokio::test]
async fn test_any_active_tracks_pending_and_processing() {
    let (storage, _temp_dir) = setup_storage().await;
    assert!(!storage.any_active().await.unwrap());

    let task = create_test_task("download");
    storage.create(&task).await.unwrap();
    assert!(storage.any_active().await.unwrap());

    storage.claim_next().await.unwrap();
    assert!(storage.any_active().await.unwrap());
    assert_eq!(storage.count_by_status(&[TaskStatus::Processing]).await.unwrap(), 1);

    storage.update_status(&task.task_id, TaskStatus::Failed, None).await.unwrap();
    assert!(!storage.any_active().await.unwrap());
}

#[tokio::test]
async fn test_sibling_dependents_wait_for_shared_parent() {
    let (storage, _temp_dir) = setup_storage().await;
    let parent = NewTask::new("a", TaskType::Download, json!({}));
    let first = NewTask::new("b", TaskType::Transcribe, json!({})).depends_on("a");
    let second = NewTask::new("c", TaskType::AiProcess, json!({})).depends_on("a");
    for task in [&parent, &first, &second] {
        storage.create(task).await.unwrap();
    }

    let dependents: Vec<String> = storage
        .list_dependents("a")
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.task_id)
        .collect();
    assert_eq!(dependents, vec!["b", "c"]);
    assert!(storage.list_dependents("b").await.unwrap().is_empty());

    assert_eq!(storage.claim_next().await.unwrap().unwrap().task_id, "a");
    assert!(storage.claim_next().await.unwrap().is_none());

    storage.update_status("a", TaskStatus::Completed, None).await.unwrap();
    assert_eq!(storage.claim_next().await.unwrap().unwrap().task_id, "b");
    assert_eq!(storage.claim_next().await.unwrap().unwrap().task_id, "c");
    assert!(storage.claim_next().await.unwrap().is_none());

    let statuses: Vec<TaskStatus> = storage
        .list_dependents("a")
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.status)
        .collect();
    assert_eq!(statuses, vec![TaskStatus::Processing, TaskStatus::Processing]);
}

#[tokio::test]
async fn test_cycles_are_rejected() {
    let (storage, _temp_dir) = setup_storage().await;

    let selfish = create_test_task("download");
    let selfish = selfish.clone().depends_on(selfish.task_id.clone());
    assert!(matches!(
        storage.create(&selfish).await,
        Err(QueueError::CyclicDependency(_))
    ));

    // b waits on a not-yet-created a, then a tries to wait on b
    let b = NewTask::new("b", TaskType::from("process"), json!({})).depends_on("a");
    storage.create(&b).await.unwrap();
    let a = NewTask::new("a", TaskType::Download, json!({})).depends_on("b");
    assert!(matches!(storage.create(&a).await, Err(QueueError::CyclicDependency(_))));
    assert!(storage.get("a").await.unwrap().is_none());

    // an existing id stays a duplicate whatever it claims to depend on
    let again = NewTask::new("b", TaskType::from("process"), json!({})).depends_on("b");
    assert_eq!(storage.create(&again).await.unwrap(), InsertOutcome::Duplicate);
}

#[tokio::test]
async fn test_concurrent_claims_hand_out_each_task_once() {
    let (storage, _temp_dir) = setup_storage().await;
    let storage = Arc::new(storage);
    for _ in 0..5 {
        storage.create(&create_test_task("download")).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..10 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move { storage.claim_next().await.unwrap() }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(task) = handle.await.unwrap() {
            claimed.push(task.task_id);
        }
    }
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), 5);
}

#[tokio::test]
async fn test_system_logs_filtering() {
    let (storage, _temp_dir) = setup_storage().await;
    storage.append("worker", LogLevel::Info, "claimed t1").await.unwrap();
    storage.append("worker", LogLevel::Error, "tool crashed").await.unwrap();
    storage.append("api", LogLevel::Warning, "slow request").await.unwrap();

    let all = storage.query(&LogQuery::default()).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].message, "slow request");

    let errors = storage
        .query(&LogQuery {
            levels: Some(vec![LogLevel::Error, LogLevel::Warning]),
            sources: Some(vec!["worker".to_string()]),
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "tool crashed");

    let none = storage
        .query(&LogQuery { levels: Some(vec![]), ..LogQuery::default() })
        .await
        .unwrap();
    assert!(none.is_empty());

    let limited = storage
        .query(&LogQuery { limit: Some(2), ..LogQuery::default() })
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);
}

#[tokio::test]
async fn test_reopen_keeps_rows() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("db").join("tasks.db");
    let task = create_test_task("download");
    {
        let storage = SqliteTaskStorage::new(&path, 2).await.unwrap();
        storage.create(&task).await.unwrap();
        storage.close().await;
    }

    let storage = SqliteTaskStorage::new(&path, 2).await.unwrap();
    assert!(storage.get(&task.task_id).await.unwrap().is_some());
}
