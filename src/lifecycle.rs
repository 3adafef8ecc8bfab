use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{Config, PollingConfig};
use crate::error::{LedgerError, PipelineError, Result};
use crate::gateway::{JobGateway, PollStatus};
use crate::state::{JobKind, Ledger, WorkItem, WorkState};

/// Outcome counts for one batch run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchSummary {
    pub completed: usize,
    pub failed: usize,

    /// Items still non-terminal; picked up by the next run
    pub pending: usize,

    /// `(id, stored error)` for every failed item
    pub failures: Vec<(String, String)>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.pending
    }

    pub fn log(&self) {
        info!(
            "📊 Batch finished: {} completed, {} failed, {} pending",
            self.completed, self.failed, self.pending
        );
        for (id, error) in &self.failures {
            warn!("❌ {}: {}", id, error);
        }
    }
}

/// Drives work items through submit, poll and download against their gateways.
///
/// Every state change is written to the ledger before the next remote call,
/// so a run can be interrupted at any point and resumed from the ledger.
pub struct TaskManager {
    ledger: Ledger,
    gateways: HashMap<JobKind, Arc<dyn JobGateway>>,
    polling: PollingConfig,
    pacing: Duration,
    artifacts_dir: PathBuf,
}

impl TaskManager {
    pub fn new(ledger: Ledger, config: &Config) -> Self {
        Self {
            ledger,
            gateways: HashMap::new(),
            polling: config.polling.clone(),
            pacing: Duration::from_millis(config.submission.pacing_ms),
            artifacts_dir: config.output.base_dir.clone(),
        }
    }

    pub fn with_gateway(mut self, kind: JobKind, gateway: Arc<dyn JobGateway>) -> Self {
        self.gateways.insert(kind, gateway);
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn gateway_for(&self, kind: JobKind) -> Result<&Arc<dyn JobGateway>> {
        self.gateways
            .get(&kind)
            .ok_or_else(|| PipelineError::Config(format!("no gateway registered for {} jobs", kind)))
    }

    /// Where the artifact of `item` lands
    pub fn artifact_path(&self, item: &WorkItem) -> PathBuf {
        self.artifacts_dir
            .join(item.kind.as_str())
            .join(format!("{}.{}", item.file_stem(), item.kind.artifact_extension()))
    }

    /// Record new items; existing ids keep their stored state
    pub async fn enqueue(&self, items: Vec<WorkItem>) -> Result<Vec<WorkItem>> {
        let mut stored = Vec::with_capacity(items.len());
        for item in items {
            stored.push(self.ledger.enqueue(item).await?);
        }
        Ok(stored)
    }

    /// Submit every ready queued item, then drive every non-terminal one to a terminal state.
    ///
    /// Items waiting on dependencies stay queued. When a wave completes the
    /// dependencies of such items, another wave submits and drives them.
    pub async fn run_batch(&self, ids: &[String]) -> Result<BatchSummary> {
        let ids = unique_ids(ids);
        info!("🚀 Starting batch of {} work items", ids.len());

        let mut submitted_any = false;
        let mut wave = 0;
        loop {
            let mut submitted = Vec::new();
            for id in &ids {
                let item = self.load(id).await?;
                if item.state != WorkState::Queued {
                    continue;
                }
                let Some(spec) = self.resolve_spec(&item).await? else {
                    continue;
                };
                if submitted_any {
                    tokio::time::sleep(self.pacing).await;
                }
                self.submit(item, &spec).await?;
                submitted_any = true;
                submitted.push(id.clone());
            }

            // later waves only drive what they just submitted
            let to_drive = match wave {
                0 => &ids,
                _ if submitted.is_empty() => break,
                _ => &submitted,
            };
            for (index, id) in to_drive.iter().enumerate() {
                let item = self.load(id).await?;
                if item.state.is_terminal() || item.state == WorkState::Queued {
                    debug!("Skipping item {} ({})", id, item.state.status_string());
                    continue;
                }
                info!("📦 Driving item {}/{}: {}", index + 1, to_drive.len(), id);
                self.advance(item).await?;
            }

            if submitted.is_empty() {
                break;
            }
            wave += 1;
        }

        self.summarize(&ids).await
    }

    /// Drive a single item to a terminal state, resuming from its ledger record
    pub async fn drive(&self, id: &str) -> Result<WorkItem> {
        let item = self.load(id).await?;
        let item = if item.state == WorkState::Queued {
            match self.resolve_spec(&item).await? {
                Some(spec) => self.submit(item, &spec).await?,
                None => return Ok(item),
            }
        } else {
            item
        };
        self.advance(item).await?;
        self.load(id).await
    }

    pub async fn summarize(&self, ids: &[String]) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        for id in unique_ids(ids) {
            let id = id.as_str();
            let item = self.load(id).await?;
            match item.state {
                WorkState::Completed => summary.completed += 1,
                WorkState::Failed => {
                    summary.failed += 1;
                    summary
                        .failures
                        .push((item.id.clone(), item.error.clone().unwrap_or_default()));
                }
                _ => summary.pending += 1,
            }
        }
        Ok(summary)
    }

    async fn load(&self, id: &str) -> Result<WorkItem> {
        self.ledger
            .get(id)
            .await
            .ok_or_else(|| LedgerError::NotFound(id.to_string()).into())
    }

    /// The spec to submit with every `{{ref:<id>}}` replaced, or `None` while a
    /// dependency has not completed
    async fn resolve_spec(&self, item: &WorkItem) -> Result<Option<Value>> {
        let mut outputs = HashMap::new();
        for dep in dependencies(item) {
            let stored = self.ledger.get(&dep).await;
            let output = stored
                .as_ref()
                .filter(|d| d.state == WorkState::Completed)
                .and_then(|d| d.output_ref.clone());
            match (output, stored) {
                (Some(output), _) => {
                    outputs.insert(dep, output);
                }
                (None, Some(d)) if d.state == WorkState::Failed => {
                    warn!("⛔ {} blocked by failed dependency {}", item.id, dep);
                    return Ok(None);
                }
                (None, stored) => {
                    let state = stored.map_or("Unknown", |d| d.state.status_string());
                    debug!("⏸️ {} waiting on {} ({})", item.id, dep, state);
                    return Ok(None);
                }
            }
        }
        Ok(Some(substitute_refs(&item.spec, &outputs)))
    }

    async fn submit(&self, mut item: WorkItem, spec: &Value) -> Result<WorkItem> {
        let gateway = self.gateway_for(item.kind)?;
        item.attempt_count += 1;

        match gateway.submit(item.kind, spec).await {
            Ok(job_id) => {
                info!("📤 Submitted {} as {}", item.id, job_id);
                item.state = WorkState::Submitted;
                item.remote_job_id = Some(job_id);
                item.error = None;
            }
            Err(e) => {
                warn!("❌ Submit failed for {}: {}", item.id, e);
                item.state = WorkState::Failed;
                item.error = Some(e.to_string());
            }
        }

        self.ledger.put(item.clone()).await?;
        Ok(item)
    }

    async fn advance(&self, item: WorkItem) -> Result<()> {
        match item.state {
            WorkState::Downloading => self.download(item).await,
            WorkState::Polling if item.output_ref.is_some() => self.download(item).await,
            WorkState::Submitted | WorkState::Polling => self.poll_until_settled(item).await,
            WorkState::Queued | WorkState::Completed | WorkState::Failed => Ok(()),
        }
    }

    async fn fail(&self, mut item: WorkItem, reason: String) -> Result<()> {
        warn!("❌ {} failed: {}", item.id, reason);
        item.state = WorkState::Failed;
        item.error = Some(reason);
        self.ledger.put(item).await?;
        Ok(())
    }

    async fn poll_until_settled(&self, mut item: WorkItem) -> Result<()> {
        let gateway = self.gateway_for(item.kind)?;
        let Some(job_id) = item.remote_job_id.clone() else {
            return self.fail(item, "no remote job id to poll".to_string()).await;
        };
        let budget = self.polling.max_wait_seconds as f64;

        loop {
            if item.poll_elapsed_secs >= budget {
                let reason = format!("timed out after {:.0}s waiting for remote job {}", item.poll_elapsed_secs, job_id);
                return self.fail(item, reason).await;
            }

            let started = Instant::now();
            let result = gateway.poll(&job_id).await;

            match result {
                Ok(poll) => match poll.status {
                    PollStatus::Pending => {
                        debug!("⏳ {} still pending ({:.0}s elapsed)", item.id, item.poll_elapsed_secs);
                        tokio::time::sleep(self.polling.interval()).await;
                        item.state = WorkState::Polling;
                        item.poll_elapsed_secs += started.elapsed().as_secs_f64();
                        self.ledger.put(item.clone()).await?;
                    }
                    PollStatus::Done => {
                        item.poll_elapsed_secs += started.elapsed().as_secs_f64();
                        let Some(output_ref) = poll.output_ref else {
                            return self.fail(item, "remote job finished without output".to_string()).await;
                        };
                        item.state = WorkState::Downloading;
                        item.output_ref = Some(output_ref);
                        item.error = None;
                        self.ledger.put(item.clone()).await?;
                        return self.download(item).await;
                    }
                    PollStatus::Failed => {
                        let reason = poll.error.unwrap_or_else(|| "remote job failed".to_string());
                        return self.fail(item, reason).await;
                    }
                },
                Err(e) if e.is_retryable() => {
                    warn!("⚠️ Polling {} gave up for this run: {}", item.id, e);
                    item.state = WorkState::Polling;
                    item.poll_elapsed_secs += started.elapsed().as_secs_f64();
                    item.error = Some(format!("{}; retry next resume", e));
                    self.ledger.put(item).await?;
                    return Ok(());
                }
                Err(e) => return self.fail(item, e.to_string()).await,
            }
        }
    }

    async fn download(&self, mut item: WorkItem) -> Result<()> {
        let gateway = self.gateway_for(item.kind)?;
        let Some(output_ref) = item.output_ref.clone() else {
            return self.fail(item, "no output reference to download".to_string()).await;
        };
        let path = self.artifact_path(&item);

        // every failure keeps output_ref so the next resume downloads again
        let written = match gateway.fetch(&output_ref).await {
            Ok(bytes) => write_atomic(&path, &bytes).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match written {
            Ok(()) => {
                info!("✅ Completed {}: {}", item.id, path.display());
                item.state = WorkState::Completed;
                item.local_path = Some(path);
                item.error = None;
            }
            Err(reason) => {
                warn!("⚠️ Download failed for {}, will retry on resume: {}", item.id, reason);
                item.state = WorkState::Polling;
                item.error = Some(format!("download failed: {}", reason));
            }
        }

        let completed = item.state == WorkState::Completed;
        self.ledger.put(item).await?;
        if completed {
            if let Err(e) = gateway.release(&output_ref).await {
                warn!("⚠️ Could not release {}: {}", output_ref, e);
            }
        }
        Ok(())
    }
}

/// First occurrence of every id, in order
fn unique_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
}

const REF_OPEN: &str = "{{ref:";
const REF_CLOSE: &str = "}}";

/// `(start, end, id)` of every `{{ref:<id>}}` in `text`
fn ref_spans(text: &str) -> Vec<(usize, usize, &str)> {
    let mut spans = Vec::new();
    let mut from = 0;
    while let Some(open) = text[from..].find(REF_OPEN).map(|i| from + i) {
        let id_start = open + REF_OPEN.len();
        let Some(close) = text[id_start..].find(REF_CLOSE).map(|i| id_start + i) else {
            break;
        };
        spans.push((open, close + REF_CLOSE.len(), text[id_start..close].trim()));
        from = close + REF_CLOSE.len();
    }
    spans
}

fn collect_refs(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(text) => out.extend(ref_spans(text).into_iter().map(|(_, _, id)| id.to_string())),
        Value::Array(values) => values.iter().for_each(|v| collect_refs(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

/// Declared dependencies plus every id referenced from the spec
fn dependencies(item: &WorkItem) -> Vec<String> {
    let mut ids = item.depends_on.clone();
    collect_refs(&item.spec, &mut ids);
    unique_ids(&ids)
}

/// Replace `{{ref:<id>}}` placeholders with the output of `<id>`
fn substitute_refs(value: &Value, outputs: &HashMap<String, String>) -> Value {
    match value {
        Value::String(text) => {
            let spans = ref_spans(text);
            if spans.is_empty() {
                return value.clone();
            }
            let mut resolved = String::with_capacity(text.len());
            let mut last = 0;
            for (start, end, id) in spans {
                resolved.push_str(&text[last..start]);
                match outputs.get(id) {
                    Some(output) => resolved.push_str(output),
                    None => resolved.push_str(&text[start..end]),
                }
                last = end;
            }
            resolved.push_str(&text[last..]);
            Value::String(resolved)
        }
        Value::Array(values) => Value::Array(values.iter().map(|v| substitute_refs(v, outputs)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_refs(v, outputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Write to a sibling temp file, then rename into place
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut partial = path.as_os_str().to_os_string();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_summary_total() {
        let summary = BatchSummary {
            completed: 2,
            failed: 1,
            pending: 3,
            failures: vec![("image:a".into(), "nsfw".into())],
        };
        assert_eq!(summary.total(), 6);
    }

    #[test]
    fn test_unique_ids_keep_first_occurrence() {
        let ids: Vec<String> = ["b", "a", "b", "c", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(unique_ids(&ids), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_dependencies_include_spec_refs() {
        let item = WorkItem::new(
            "video:scene_1",
            JobKind::Video,
            serde_json::json!({"input": {"image_urls": ["{{ref:image:hero/view_0}}", "{{ref: image:hero/view_1 }}"]}}),
        )
        .with_dependencies(vec!["image:hero/view_0".into(), "speech:q01/en".into()]);

        assert_eq!(
            dependencies(&item),
            vec!["image:hero/view_0", "speech:q01/en", "image:hero/view_1"]
        );
    }

    #[test]
    fn test_substitute_refs_inside_strings() {
        let spec = serde_json::json!({
            "input": {
                "prompt": "@hero {{ref:image:hero}} and {{ref:image:villain}}",
                "image_urls": ["{{ref:image:hero}}"],
                "duration": 5,
                "broken": "{{ref:image:hero"
            }
        });
        let outputs = HashMap::from([("image:hero".to_string(), "https://cdn.example/hero.png".to_string())]);

        let resolved = substitute_refs(&spec, &outputs);

        assert_eq!(
            resolved["input"]["prompt"],
            "@hero https://cdn.example/hero.png and {{ref:image:villain}}"
        );
        assert_eq!(resolved["input"]["image_urls"][0], "https://cdn.example/hero.png");
        assert_eq!(resolved["input"]["duration"], 5);
        assert_eq!(resolved["input"]["broken"], "{{ref:image:hero");
    }

    #[tokio::test]
    async fn test_write_atomic_leaves_no_partial() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("image").join("a.png");

        write_atomic(&path, b"png-bytes").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"png-bytes");
        assert!(!temp_dir.path().join("image").join("a.png.part").exists());
    }

    #[tokio::test]
    async fn test_artifact_path_layout() {
        let temp_dir = TempDir::new().unwrap();
        let config = crate::config::ConfigBuilder::new()
            .with_output_dir(temp_dir.path().to_path_buf())
            .build();
        let ledger = Ledger::open(temp_dir.path().join("ledger.json")).await.unwrap();
        let manager = TaskManager::new(ledger, &config);

        let item = WorkItem::new("speech:q01/en", JobKind::Speech, serde_json::json!({}));
        assert_eq!(
            manager.artifact_path(&item),
            temp_dir.path().join("speech").join("speech_q01_en.json")
        );
    }
}
