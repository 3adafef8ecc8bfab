use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::LedgerError;

/// Kind of remote generation work
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Image,
    Video,
    Speech,
}

impl JobKind {
    /// File extension used for the downloaded artifact
    pub fn artifact_extension(&self) -> &'static str {
        match self {
            JobKind::Image => "png",
            JobKind::Video => "mp4",
            JobKind::Speech => "json",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Image => "image",
            JobKind::Video => "video",
            JobKind::Speech => "speech",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a work item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkState {
    /// Known locally, never submitted
    Queued,

    /// Accepted by the remote service
    Submitted,

    /// Being polled for completion
    Polling,

    /// Remote output known, local copy not yet written
    Downloading,

    /// Artifact present on disk
    Completed,

    /// Terminal failure; needs an explicit reset
    Failed,
}

impl WorkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkState::Completed | WorkState::Failed)
    }

    pub fn status_string(&self) -> &'static str {
        match self {
            WorkState::Queued => "Queued",
            WorkState::Submitted => "Submitted",
            WorkState::Polling => "Polling",
            WorkState::Downloading => "Downloading",
            WorkState::Completed => "Completed",
            WorkState::Failed => "Failed",
        }
    }
}

/// One trackable unit of remote generation work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    /// Stable identifier derived from the logical key
    pub id: String,

    pub kind: JobKind,

    /// Opaque request payload handed to the gateway
    pub spec: serde_json::Value,

    pub state: WorkState,

    pub remote_job_id: Option<String>,

    /// Remote locator of the finished output
    pub output_ref: Option<String>,

    pub local_path: Option<PathBuf>,

    /// Last error text, kept for inspection
    pub error: Option<String>,

    /// Number of submit attempts made for this item
    pub attempt_count: u32,

    /// Poll wall-clock spent so far, across resumes
    #[serde(default)]
    pub poll_elapsed_secs: f64,

    /// Items whose outputs this one consumes; submitted only once they complete
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, kind: JobKind, spec: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            spec,
            state: WorkState::Queued,
            remote_job_id: None,
            output_ref: None,
            local_path: None,
            error: None,
            attempt_count: 0,
            poll_elapsed_secs: 0.0,
            depends_on: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_dependencies(mut self, ids: Vec<String>) -> Self {
        self.depends_on = ids;
        self
    }

    /// Build a stable id from a logical key, e.g. `image:hero/view_0`
    pub fn derive_id<S: AsRef<str>>(kind: JobKind, parts: &[S]) -> String {
        let key = parts
            .iter()
            .map(|p| p.as_ref().trim())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}:{}", kind, key)
    }

    /// Filesystem-safe stem for artifacts of this item
    pub fn file_stem(&self) -> String {
        self.id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    /// Reject records whose fields contradict their state
    pub fn check_consistency(&self) -> Result<(), LedgerError> {
        let reason = match self.state {
            WorkState::Completed if self.local_path.is_none() => Some("completed without local_path"),
            WorkState::Submitted | WorkState::Polling if self.remote_job_id.is_none() => {
                Some("in flight without remote_job_id")
            }
            WorkState::Downloading if self.output_ref.is_none() => Some("downloading without output_ref"),
            _ => None,
        };

        match reason {
            Some(reason) => Err(LedgerError::Inconsistent {
                id: self.id.clone(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct LedgerFile {
    version: u32,
    items: BTreeMap<String, WorkItem>,
}

/// Persistent id -> work item store; the single source of truth for resume
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,

    /// In-memory snapshot; mirrors the file after every successful put
    items: Arc<RwLock<BTreeMap<String, WorkItem>>>,
}

impl Ledger {
    /// Open the ledger at `path`, creating an empty one if absent
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let stale_tmp = Self::tmp_path(&path);
        if fs::try_exists(&stale_tmp).await.unwrap_or(false) {
            warn!("Removing interrupted ledger write: {}", stale_tmp.display());
            fs::remove_file(&stale_tmp).await?;
        }

        let items = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            let file: LedgerFile = serde_json::from_str(&content)?;
            file.items
        } else {
            BTreeMap::new()
        };

        info!("📊 Ledger opened with {} work items: {}", items.len(), path.display());

        Ok(Self {
            path,
            items: Arc::new(RwLock::new(items)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        path.with_file_name(name)
    }

    pub async fn get(&self, id: &str) -> Option<WorkItem> {
        self.items.read().await.get(id).cloned()
    }

    pub async fn all(&self) -> BTreeMap<String, WorkItem> {
        self.items.read().await.clone()
    }

    /// Atomically overwrite one record and persist the whole snapshot
    pub async fn put(&self, mut item: WorkItem) -> Result<(), LedgerError> {
        item.check_consistency()?;
        item.updated_at = Utc::now();

        let id = item.id.clone();
        let mut items = self.items.write().await;
        let previous = items.insert(id.clone(), item);

        if let Err(e) = self.persist(&items).await {
            match previous {
                Some(prev) => items.insert(id, prev),
                None => items.remove(&id),
            };
            return Err(e);
        }

        debug!("💾 Ledger updated: {}", id);
        Ok(())
    }

    /// Insert a new item unless the id already exists; returns the stored record
    pub async fn enqueue(&self, item: WorkItem) -> Result<WorkItem, LedgerError> {
        if let Some(existing) = self.get(&item.id).await {
            if existing.kind != item.kind {
                warn!(
                    "Work item {} already recorded as {}, ignoring {} request",
                    existing.id, existing.kind, item.kind
                );
            }
            return Ok(existing);
        }

        self.put(item.clone()).await?;
        Ok(item)
    }

    /// Explicit `failed -> queued` transition
    pub async fn reset(&self, id: &str) -> Result<WorkItem, LedgerError> {
        let mut item = self
            .get(id)
            .await
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;

        if item.state != WorkState::Failed {
            return Err(LedgerError::InvalidTransition {
                id: id.to_string(),
                reason: format!("only failed items can be reset, state is {}", item.state.status_string()),
            });
        }

        item.state = WorkState::Queued;
        item.remote_job_id = None;
        item.output_ref = None;
        item.local_path = None;
        item.error = None;
        item.poll_elapsed_secs = 0.0;

        self.put(item.clone()).await?;
        info!("🔄 Reset work item to queued: {}", id);
        Ok(item)
    }

    /// Write-temp-then-rename so the ledger file is always a complete snapshot
    async fn persist(&self, items: &BTreeMap<String, WorkItem>) -> Result<(), LedgerError> {
        let snapshot = LedgerFile {
            version: 1,
            items: items.clone(),
        };
        let json_content = serde_json::to_string_pretty(&snapshot)?;

        let tmp = Self::tmp_path(&self.path);
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(json_content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Counts per lifecycle state
    pub async fn statistics(&self) -> LedgerStats {
        let items = self.items.read().await;
        let mut stats = LedgerStats {
            total: items.len(),
            ..LedgerStats::default()
        };

        for item in items.values() {
            match item.state {
                WorkState::Queued => stats.queued += 1,
                WorkState::Submitted | WorkState::Polling | WorkState::Downloading => stats.in_flight += 1,
                WorkState::Completed => stats.completed += 1,
                WorkState::Failed => stats.failed += 1,
            }
        }

        stats
    }
}

/// Ledger statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerStats {
    pub total: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn image_item(id: &str) -> WorkItem {
        WorkItem::new(id, JobKind::Image, json!({"prompt": "a red fox"}))
    }

    #[test]
    fn test_derive_id_is_stable() {
        let a = WorkItem::derive_id(JobKind::Image, &["hero", "view_0"]);
        let b = WorkItem::derive_id(JobKind::Image, &[" hero ", "view_0"]);
        assert_eq!(a, "image:hero/view_0");
        assert_eq!(a, b);
        assert_eq!(WorkItem::derive_id(JobKind::Speech, &["q01", "en"]), "speech:q01/en");
    }

    #[test]
    fn test_file_stem_is_filesystem_safe() {
        let item = image_item("image:hero/view 0");
        assert_eq!(item.file_stem(), "image_hero_view_0");
    }

    #[tokio::test]
    async fn test_put_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.json");

        let ledger = Ledger::open(&path).await.unwrap();
        let mut item = image_item("image:hero/view_0");
        item.state = WorkState::Submitted;
        item.remote_job_id = Some("task-1".to_string());
        ledger.put(item).await.unwrap();

        let reopened = Ledger::open(&path).await.unwrap();
        let stored = reopened.get("image:hero/view_0").await.unwrap();
        assert_eq!(stored.state, WorkState::Submitted);
        assert_eq!(stored.remote_job_id.as_deref(), Some("task-1"));
        assert!(!Ledger::tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_put_rejects_completed_without_local_path() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::open(temp_dir.path().join("ledger.json")).await.unwrap();

        let mut item = image_item("image:hero/view_0");
        item.state = WorkState::Completed;
        let err = ledger.put(item).await.unwrap_err();

        assert!(matches!(err, LedgerError::Inconsistent { .. }));
        assert!(ledger.get("image:hero/view_0").await.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_does_not_regress_existing_state() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::open(temp_dir.path().join("ledger.json")).await.unwrap();

        let mut item = image_item("image:hero/view_0");
        item.state = WorkState::Polling;
        item.remote_job_id = Some("task-1".to_string());
        ledger.put(item).await.unwrap();

        let stored = ledger.enqueue(image_item("image:hero/view_0")).await.unwrap();
        assert_eq!(stored.state, WorkState::Polling);
    }

    #[tokio::test]
    async fn test_reset_only_from_failed() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::open(temp_dir.path().join("ledger.json")).await.unwrap();

        ledger.put(image_item("image:a")).await.unwrap();
        assert!(matches!(
            ledger.reset("image:a").await,
            Err(LedgerError::InvalidTransition { .. })
        ));
        assert!(matches!(ledger.reset("image:missing").await, Err(LedgerError::NotFound(_))));

        let mut failed = image_item("image:b");
        failed.state = WorkState::Failed;
        failed.remote_job_id = Some("task-9".to_string());
        failed.error = Some("remote job failed: nsfw".to_string());
        ledger.put(failed).await.unwrap();

        let reset = ledger.reset("image:b").await.unwrap();
        assert_eq!(reset.state, WorkState::Queued);
        assert!(reset.remote_job_id.is_none());
        assert!(reset.error.is_none());
    }

    #[tokio::test]
    async fn test_statistics() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::open(temp_dir.path().join("ledger.json")).await.unwrap();

        ledger.put(image_item("image:a")).await.unwrap();
        let mut done = image_item("image:b");
        done.state = WorkState::Completed;
        done.local_path = Some(PathBuf::from("b.png"));
        ledger.put(done).await.unwrap();

        let stats = ledger.statistics().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
    }
}
