use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snsb_harness::store::{
    resume_batch, BatchProducer, BatchStatus, JsonlStore, Keyed, Slot, StoreError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Row {
    subject_id: String,
    value: usize,
}

impl Keyed for Row {
    fn subject_id(&self) -> &str {
        &self.subject_id
    }
}

/// Doubles the position; fails on ids listed in `fail`.
struct Doubler {
    calls: Vec<usize>,
    fail: Vec<&'static str>,
}

impl Doubler {
    fn new() -> Self {
        Self {
            calls: Vec::new(),
            fail: Vec::new(),
        }
    }
}

#[async_trait]
impl BatchProducer<String, Row> for Doubler {
    type Error = String;

    fn stage(&self) -> &'static str {
        "test"
    }

    fn describe(&self, item: &String) -> String {
        item.clone()
    }

    async fn produce(&mut self, position: usize, item: &String) -> Result<Row, String> {
        self.calls.push(position);
        if self.fail.contains(&item.as_str()) {
            return Err(format!("refused {item}"));
        }
        Ok(Row {
            subject_id: item.clone(),
            value: position * 2,
        })
    }
}

fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("S{i:03}")).collect()
}

#[tokio::test]
async fn fresh_run_then_idempotent_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let store: JsonlStore<Row> = JsonlStore::new(dir.path().join("rows.jsonl"));
    let items = ids(4);

    let mut producer = Doubler::new();
    let first = resume_batch(&store, &items, &mut producer).await.unwrap();
    assert_eq!(first.status, BatchStatus::Fresh);
    assert_eq!(first.produced, 4);
    assert_eq!(producer.calls, vec![0, 1, 2, 3]);

    let bytes_before = std::fs::read(store.path()).unwrap();

    let mut again = Doubler::new();
    let second = resume_batch(&store, &items, &mut again).await.unwrap();
    assert_eq!(second.status, BatchStatus::AlreadyComplete);
    assert!(again.calls.is_empty());
    assert_eq!(second.records, first.records);
    assert_eq!(std::fs::read(store.path()).unwrap(), bytes_before);
}

#[tokio::test]
async fn resumes_from_cached_count() {
    let dir = tempfile::tempdir().unwrap();
    let store: JsonlStore<Row> = JsonlStore::new(dir.path().join("rows.jsonl"));
    let items = ids(5);

    // Simulate an interrupted run that wrote two records.
    let mut partial = Doubler::new();
    resume_batch(&store, &items[..2], &mut partial).await.unwrap();

    let mut producer = Doubler::new();
    let outcome = resume_batch(&store, &items, &mut producer).await.unwrap();
    assert_eq!(outcome.status, BatchStatus::Resumed { from: 2 });
    assert_eq!(outcome.cached, 2);
    assert_eq!(outcome.produced, 3);
    assert_eq!(producer.calls, vec![2, 3, 4]);

    let ids_on_disk: Vec<String> = store
        .load()
        .unwrap()
        .iter()
        .filter_map(Slot::as_filled)
        .map(|r| r.subject_id.clone())
        .collect();
    assert_eq!(ids_on_disk, items);
}

#[tokio::test]
async fn failures_become_sentinels_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let store: JsonlStore<Row> = JsonlStore::new(dir.path().join("rows.jsonl"));
    let items = ids(3);

    let mut producer = Doubler::new();
    producer.fail.push("S001");
    let outcome = resume_batch(&store, &items, &mut producer).await.unwrap();
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.produced, 2);
    assert!(outcome.records[1].is_sentinel());

    let text = std::fs::read_to_string(store.path()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1], "{}");

    // A sentinel counts as done: the rerun does not retry it.
    let mut again = Doubler::new();
    let rerun = resume_batch(&store, &items, &mut again).await.unwrap();
    assert_eq!(rerun.status, BatchStatus::AlreadyComplete);
    assert!(again.calls.is_empty());
}

#[tokio::test]
async fn more_cached_records_than_items_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store: JsonlStore<Row> = JsonlStore::new(dir.path().join("rows.jsonl"));

    let mut producer = Doubler::new();
    resume_batch(&store, &ids(4), &mut producer).await.unwrap();

    let mut producer = Doubler::new();
    let err = resume_batch(&store, &ids(3), &mut producer).await.unwrap_err();
    match err {
        StoreError::Overflow {
            cached, expected, ..
        } => {
            assert_eq!(cached, 4);
            assert_eq!(expected, 3);
        }
        other => panic!("expected Overflow, got {other:?}"),
    }
    assert!(producer.calls.is_empty());
}

#[tokio::test]
async fn corrupt_line_reports_its_position() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rows.jsonl");
    std::fs::write(&path, "{\"subject_id\":\"a\",\"value\":0}\nnot json\n").unwrap();
    let store: JsonlStore<Row> = JsonlStore::new(&path);

    match store.load().unwrap_err() {
        StoreError::Parse { line, .. } => assert_eq!(line, 2),
        other => panic!("expected Parse, got {other:?}"),
    }
}
