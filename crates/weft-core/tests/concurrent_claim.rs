use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde_json::json;

use weft_core::domain::{NewTask, TaskId, TaskType, WorkerId};
use weft_core::ports::TaskStore;
use weft_core::store::InMemoryTaskStore;

const TASKS: usize = 300;
const CLAIMERS: usize = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_claimers_never_share_a_task() {
    let store = Arc::new(InMemoryTaskStore::new());
    for i in 0..TASKS {
        store
            .submit(NewTask::new("t", json!({ "i": i })), 3)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for c in 0..CLAIMERS {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let worker = WorkerId::new(format!("w{c}"));
            let mut mine: Vec<TaskId> = Vec::new();
            loop {
                let batch = store.claim(&worker, &BTreeSet::new(), 3).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                for record in batch {
                    assert_eq!(record.claimed_by.as_ref(), Some(&worker));
                    mine.push(record.id);
                }
                tokio::task::yield_now().await;
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<TaskId> = all.iter().copied().collect();
    assert_eq!(all.len(), TASKS);
    assert_eq!(unique.len(), TASKS);

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.processing, TASKS);
    assert_eq!(counts.pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capability_filtered_claimers_split_the_queue() {
    let store = Arc::new(InMemoryTaskStore::new());
    for i in 0..100 {
        let task_type = if i % 2 == 0 { "even" } else { "odd" };
        store
            .submit(NewTask::new(task_type, json!({ "i": i })), 3)
            .await
            .unwrap();
    }

    let spawn = |name: &'static str| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let worker = WorkerId::new(name);
            let caps: BTreeSet<TaskType> = [TaskType::new(name)].into_iter().collect();
            let mut types = Vec::new();
            loop {
                let batch = store.claim(&worker, &caps, 4).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                types.extend(batch.into_iter().map(|r| r.task_type));
            }
            types
        })
    };
    let even = spawn("even");
    let odd = spawn("odd");

    let even = even.await.unwrap();
    let odd = odd.await.unwrap();
    assert_eq!(even.len(), 50);
    assert_eq!(odd.len(), 50);
    assert!(even.iter().all(|t| t.as_str() == "even"));
    assert!(odd.iter().all(|t| t.as_str() == "odd"));
}
