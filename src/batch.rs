use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::gateway::kie::{chunk_multi_shot, multi_shot_prompts, Shot, MAX_SHOTS, MAX_TOTAL_SECONDS};
use crate::state::{JobKind, WorkItem};

/// One requested generation in a batch file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub kind: JobKind,

    /// Logical key the stable id is derived from
    pub key: Vec<String>,

    /// Request payload; `{{ref:<id>}}` strings are replaced by that item's output
    pub spec: Value,

    /// Work item ids that must complete before this entry is submitted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// JSON batch input: `{"items": [{"kind", "key", "spec", "depends_on"?}]}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchFile {
    pub items: Vec<BatchEntry>,
}

impl BatchFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("invalid batch file {}: {}", path.display(), e)))
    }

    /// Expand entries into work items, splitting oversize multi-shot videos into parts
    pub fn into_work_items(self) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();

        for entry in self.items {
            if entry.key.is_empty() {
                return Err(PipelineError::Config("batch entry without key".into()));
            }

            let oversize = match entry.kind {
                JobKind::Video => multi_shot_prompts(&entry.spec)?.filter(|shots| exceeds_limits(shots)),
                _ => None,
            };

            match oversize {
                Some(shots) => {
                    let groups = chunk_multi_shot(&shots);
                    info!(
                        "✂️ Splitting {} shots of {} into {} parts",
                        shots.len(),
                        entry.key.join("/"),
                        groups.len()
                    );
                    for (n, group) in groups.iter().enumerate() {
                        let mut key = entry.key.clone();
                        if let Some(last) = key.last_mut() {
                            last.push_str(&format!("_part{}", n + 1));
                        }
                        let spec = with_shots(&entry.spec, group)?;
                        items.push(
                            WorkItem::new(WorkItem::derive_id(entry.kind, &key), entry.kind, spec)
                                .with_dependencies(entry.depends_on.clone()),
                        );
                    }
                }
                None => items.push(
                    WorkItem::new(WorkItem::derive_id(entry.kind, &entry.key), entry.kind, entry.spec)
                        .with_dependencies(entry.depends_on),
                ),
            }
        }

        Ok(items)
    }
}

fn exceeds_limits(shots: &[Shot]) -> bool {
    shots.len() > MAX_SHOTS || shots.iter().map(|s| s.duration).sum::<u32>() > MAX_TOTAL_SECONDS
}

fn with_shots(spec: &Value, shots: &[Shot]) -> Result<Value> {
    let mut spec = spec.clone();
    let total: u32 = shots.iter().map(|s| s.duration).sum();
    let input = spec
        .get_mut("input")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| PipelineError::Config("multi-shot spec without input object".into()))?;

    input.insert(
        "multi_prompt".to_string(),
        serde_json::to_value(shots).map_err(|e| PipelineError::Config(e.to_string()))?,
    );
    input.insert("duration".to_string(), Value::String(total.to_string()));
    Ok(spec)
}
