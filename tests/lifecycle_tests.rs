use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::time::{Duration, Instant};

use reel_forge::config::ConfigBuilder;
use reel_forge::{
    Config, GatewayError, JobGateway, JobKind, Ledger, PollResult, RetryPolicy, RetryingGateway, TaskManager,
    WorkItem, WorkState,
};

/// Scripted gateway that counts every call
struct MockGateway {
    submits: AtomicU32,
    polls: AtomicU32,
    fetches: AtomicU32,
    submit_error: Option<GatewayError>,
    poll_script: Mutex<VecDeque<Result<PollResult, GatewayError>>>,
    default_poll: Result<PollResult, GatewayError>,
    fetch_script: Mutex<VecDeque<Result<Bytes, GatewayError>>>,
    submitted_specs: Mutex<Vec<serde_json::Value>>,
    poll_times: Mutex<Vec<Instant>>,
    released: Mutex<Vec<String>>,
}

impl MockGateway {
    fn new() -> Self {
        Self {
            submits: AtomicU32::new(0),
            polls: AtomicU32::new(0),
            fetches: AtomicU32::new(0),
            submit_error: None,
            poll_script: Mutex::new(VecDeque::new()),
            default_poll: Ok(PollResult::done("https://cdn.example/out.bin")),
            fetch_script: Mutex::new(VecDeque::new()),
            submitted_specs: Mutex::new(Vec::new()),
            poll_times: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    fn with_submit_error(mut self, err: GatewayError) -> Self {
        self.submit_error = Some(err);
        self
    }

    fn with_polls(self, polls: Vec<Result<PollResult, GatewayError>>) -> Self {
        *self.poll_script.lock().unwrap() = polls.into();
        self
    }

    fn with_default_poll(mut self, poll: Result<PollResult, GatewayError>) -> Self {
        self.default_poll = poll;
        self
    }

    fn with_fetches(self, fetches: Vec<Result<Bytes, GatewayError>>) -> Self {
        *self.fetch_script.lock().unwrap() = fetches.into();
        self
    }

    fn submits(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }

    fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn submitted_specs(&self) -> Vec<serde_json::Value> {
        self.submitted_specs.lock().unwrap().clone()
    }

    /// Gaps between consecutive polls
    fn poll_gaps(&self) -> Vec<Duration> {
        let times = self.poll_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobGateway for MockGateway {
    async fn submit(&self, _kind: JobKind, spec: &serde_json::Value) -> Result<String, GatewayError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        self.submitted_specs.lock().unwrap().push(spec.clone());
        match &self.submit_error {
            Some(err) => Err(err.clone()),
            None => Ok(format!("job-{}", n + 1)),
        }
    }

    async fn poll(&self, _job_id: &str) -> Result<PollResult, GatewayError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.poll_times.lock().unwrap().push(Instant::now());
        let scripted = self.poll_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.default_poll.clone())
    }

    async fn fetch(&self, _output_ref: &str) -> Result<Bytes, GatewayError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let scripted = self.fetch_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(Bytes::from_static(b"artifact-bytes")))
    }

    async fn release(&self, output_ref: &str) -> Result<(), GatewayError> {
        self.released.lock().unwrap().push(output_ref.to_string());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

fn unavailable() -> GatewayError {
    GatewayError::Transport {
        status: Some(503),
        message: "unavailable".into(),
        retry_after: None,
    }
}

fn test_config(temp_dir: &TempDir) -> Config {
    ConfigBuilder::new()
        .with_output_dir(temp_dir.path().to_path_buf())
        .with_polling(10, 60)
        .with_pacing_ms(500)
        .build()
}

fn image_item(key: &str) -> WorkItem {
    WorkItem::new(
        WorkItem::derive_id(JobKind::Image, &[key]),
        JobKind::Image,
        json!({"model": "test", "input": {"prompt": key}}),
    )
}

async fn manager_with(config: &Config, gateway: Arc<MockGateway>) -> TaskManager {
    let ledger = Ledger::open(&config.output.ledger_file).await.unwrap();
    TaskManager::new(ledger, config)
        .with_gateway(JobKind::Image, gateway.clone())
        .with_gateway(JobKind::Video, gateway)
}

async fn run_one(manager: &TaskManager, item: WorkItem) -> WorkItem {
    let id = item.id.clone();
    manager.enqueue(vec![item]).await.unwrap();
    manager.run_batch(&[id.clone()]).await.unwrap();
    manager.ledger().get(&id).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_item_completes_and_artifact_exists() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let gateway = Arc::new(MockGateway::new().with_polls(vec![Ok(PollResult::pending()), Ok(PollResult::pending())]));
    let manager = manager_with(&config, gateway.clone()).await;

    let item = run_one(&manager, image_item("hero")).await;

    assert_eq!(item.state, WorkState::Completed);
    let path = item.local_path.unwrap();
    assert_eq!(path, temp_dir.path().join("image").join("image_hero.png"));
    assert_eq!(std::fs::read(&path).unwrap(), b"artifact-bytes");
    assert_eq!(gateway.submits(), 1);
    assert_eq!(gateway.polls(), 3);
    assert_eq!(gateway.fetches(), 1);
    assert_eq!(gateway.released(), vec!["https://cdn.example/out.bin"]);
}

#[tokio::test(start_paused = true)]
async fn test_resume_never_submits_twice() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let gateway = Arc::new(MockGateway::new().with_polls(vec![Err(unavailable())]));

    // first invocation: submit succeeds, polling gives up for this run
    let first = manager_with(&config, gateway.clone()).await;
    let item = run_one(&first, image_item("hero")).await;
    assert_eq!(item.state, WorkState::Polling);
    assert_eq!(item.remote_job_id.as_deref(), Some("job-1"));
    drop(first);

    // second invocation against the same ledger file
    let second = manager_with(&config, gateway.clone()).await;
    let item = run_one(&second, image_item("hero")).await;

    assert_eq!(item.state, WorkState::Completed);
    assert_eq!(item.remote_job_id.as_deref(), Some("job-1"));
    assert_eq!(gateway.submits(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_validation_failure_is_terminal_until_reset() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let gateway = Arc::new(MockGateway::new().with_submit_error(GatewayError::Validation("too many shots".into())));
    let manager = manager_with(&config, gateway.clone()).await;

    let item = run_one(&manager, image_item("scene")).await;
    assert_eq!(item.state, WorkState::Failed);
    assert!(item.error.unwrap().contains("too many shots"));
    assert_eq!(gateway.polls(), 0);

    // a failed item is skipped by later runs
    let summary = manager.run_batch(&[item.id.clone()]).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].1, "validation error: too many shots");
    assert_eq!(gateway.submits(), 1);

    // an explicit reset makes it eligible again
    manager.ledger().reset(&item.id).await.unwrap();
    manager.run_batch(&[item.id.clone()]).await.unwrap();
    assert_eq!(gateway.submits(), 2);
    let stored = manager.ledger().get(&item.id).await.unwrap();
    assert_eq!(stored.attempt_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_remote_failure_records_error_text() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let gateway = Arc::new(MockGateway::new().with_default_poll(Ok(PollResult::failed("content policy violation"))));
    let manager = manager_with(&config, gateway.clone()).await;

    let item = run_one(&manager, image_item("hero")).await;

    assert_eq!(item.state, WorkState::Failed);
    assert_eq!(item.error.as_deref(), Some("content policy violation"));
    assert_eq!(gateway.fetches(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_download_failure_resumes_without_resubmit() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let gateway = Arc::new(MockGateway::new().with_fetches(vec![Err(unavailable())]));
    let manager = manager_with(&config, gateway.clone()).await;

    let item = run_one(&manager, image_item("hero")).await;
    assert_eq!(item.state, WorkState::Polling);
    assert_eq!(item.output_ref.as_deref(), Some("https://cdn.example/out.bin"));
    assert!(item.local_path.is_none());

    let resumed = manager_with(&config, gateway.clone()).await;
    let item = run_one(&resumed, image_item("hero")).await;

    assert_eq!(item.state, WorkState::Completed);
    assert!(item.local_path.unwrap().exists());
    assert_eq!(gateway.submits(), 1);
    assert_eq!(gateway.polls(), 1);
    assert_eq!(gateway.fetches(), 2);
    assert_eq!(gateway.released().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_download_stays_resumable() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let gateway = Arc::new(MockGateway::new().with_fetches(vec![Err(GatewayError::Validation("HTTP 403: expired".into()))]));
    let manager = manager_with(&config, gateway.clone()).await;

    let item = run_one(&manager, image_item("hero")).await;
    assert_eq!(item.state, WorkState::Polling);
    assert_eq!(item.output_ref.as_deref(), Some("https://cdn.example/out.bin"));
    assert!(item.error.unwrap().contains("HTTP 403: expired"));
    assert!(gateway.released().is_empty());

    let item = run_one(&manager, image_item("hero")).await;
    assert_eq!(item.state, WorkState::Completed);
    assert_eq!(gateway.submits(), 1);
    assert_eq!(gateway.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_poll_budget_exceeded_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new()
        .with_output_dir(temp_dir.path().to_path_buf())
        .with_polling(10, 30)
        .build();
    let gateway = Arc::new(MockGateway::new().with_default_poll(Ok(PollResult::pending())));
    let manager = manager_with(&config, gateway.clone()).await;

    let item = run_one(&manager, image_item("slow")).await;

    assert_eq!(item.state, WorkState::Failed);
    assert!(item.error.unwrap().contains("timed out"));
    assert_eq!(gateway.polls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_poll_transport_exhaustion_stays_resumable() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let mock = Arc::new(MockGateway::new().with_default_poll(Err(unavailable())));
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(5),
        jitter: 0.0,
    };
    let ledger = Ledger::open(&config.output.ledger_file).await.unwrap();
    let manager = TaskManager::new(ledger, &config)
        .with_gateway(JobKind::Image, Arc::new(RetryingGateway::new(mock.clone(), policy)));

    let id = image_item("hero").id;
    manager.enqueue(vec![image_item("hero")]).await.unwrap();
    let summary = manager.run_batch(&[id.clone()]).await.unwrap();

    assert_eq!(summary.pending, 1);
    assert_eq!(mock.polls(), 3);
    let item = manager.ledger().get(&id).await.unwrap();
    assert_eq!(item.state, WorkState::Polling);
    assert!(item.error.unwrap().contains("retry next resume"));

    // exponential backoff between attempts: 100ms then 200ms
    let gaps = mock.poll_gaps();
    assert_eq!(gaps.len(), 2);
    assert!(gaps[0] >= Duration::from_millis(100) && gaps[0] < Duration::from_millis(150));
    assert!(gaps[1] >= Duration::from_millis(200) && gaps[1] < Duration::from_millis(250));
}

#[tokio::test(start_paused = true)]
async fn test_submissions_are_paced() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let gateway = Arc::new(MockGateway::new());
    let manager = manager_with(&config, gateway.clone()).await;

    let items: Vec<WorkItem> = ["a", "b", "c"].iter().map(|k| image_item(k)).collect();
    let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
    manager.enqueue(items).await.unwrap();

    let started = tokio::time::Instant::now();
    let summary = manager.run_batch(&ids).await.unwrap();

    assert_eq!(summary.completed, 3);
    assert_eq!(gateway.submits(), 3);
    assert!(started.elapsed() >= Duration::from_millis(1000));
}

#[tokio::test]
async fn test_missing_gateway_is_a_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let ledger = Ledger::open(&config.output.ledger_file).await.unwrap();
    let manager = TaskManager::new(ledger, &config);

    let item = WorkItem::new("speech:q01/en", JobKind::Speech, json!({"lines": ["hi"]}));
    manager.enqueue(vec![item]).await.unwrap();
    assert!(manager.drive("speech:q01/en").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_dependent_item_waits_for_its_reference() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let gateway = Arc::new(MockGateway::new());
    let manager = manager_with(&config, gateway.clone()).await;

    let element = image_item("hero");
    let shot = WorkItem::new(
        WorkItem::derive_id(JobKind::Video, &["scene_1"]),
        JobKind::Video,
        json!({"input": {"prompt": "@hero runs", "image_urls": ["{{ref:image:hero}}"]}}),
    )
    .with_dependencies(vec![element.id.clone()]);

    // the shot comes first in the batch but cannot be submitted before the element
    let ids = vec![shot.id.clone(), element.id.clone()];
    manager.enqueue(vec![shot.clone(), element]).await.unwrap();
    let summary = manager.run_batch(&ids).await.unwrap();

    assert_eq!(summary.completed, 2);
    let specs = gateway.submitted_specs();
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0]["input"]["prompt"], "hero");
    assert_eq!(specs[1]["input"]["image_urls"][0], "https://cdn.example/out.bin");

    // the stored spec keeps its placeholder
    let stored = manager.ledger().get(&shot.id).await.unwrap();
    assert_eq!(stored.spec["input"]["image_urls"][0], "{{ref:image:hero}}");
}

#[tokio::test(start_paused = true)]
async fn test_unmet_dependency_stays_queued() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let gateway = Arc::new(MockGateway::new());
    let manager = manager_with(&config, gateway.clone()).await;

    let shot = WorkItem::new(
        "video:scene_2",
        JobKind::Video,
        json!({"input": {"image_urls": ["{{ref:image:missing}}"]}}),
    );
    let id = shot.id.clone();
    manager.enqueue(vec![shot]).await.unwrap();

    let summary = manager.run_batch(&[id.clone()]).await.unwrap();
    assert_eq!(summary.pending, 1);
    assert_eq!(gateway.submits(), 0);
    assert_eq!(manager.drive(&id).await.unwrap().state, WorkState::Queued);
    assert_eq!(manager.ledger().get(&id).await.unwrap().state, WorkState::Queued);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_ids_are_counted_once() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let gateway = Arc::new(MockGateway::new());
    let manager = manager_with(&config, gateway.clone()).await;

    let item = image_item("hero");
    let id = item.id.clone();
    manager.enqueue(vec![item]).await.unwrap();

    let summary = manager.run_batch(&[id.clone(), id.clone()]).await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.total(), 1);
    assert_eq!(gateway.submits(), 1);
}
