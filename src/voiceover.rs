use base64::Engine;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::alignment::{CharacterAlignment, Transcript};
use crate::error::{PipelineError, Result};
use crate::gateway::speech::SpeechSpec;
use crate::state::{JobKind, WorkItem, WorkState};

/// Synthesis response with audio and character timing
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechArtifact {
    pub audio_base64: String,

    #[serde(default)]
    pub alignment: Option<CharacterAlignment>,

    #[serde(default)]
    pub normalized_alignment: Option<CharacterAlignment>,
}

impl SpeechArtifact {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| PipelineError::Planning(format!("invalid speech artifact: {}", e)))
    }

    /// Normalized alignment when present, else the raw one
    pub fn alignment(&self) -> CharacterAlignment {
        self.normalized_alignment
            .clone()
            .filter(|a| !a.is_empty())
            .or_else(|| self.alignment.clone())
            .unwrap_or_default()
    }

    pub fn audio(&self) -> Result<Vec<u8>> {
        if self.audio_base64.is_empty() {
            return Err(PipelineError::Planning("speech artifact has no audio".into()));
        }
        base64::engine::general_purpose::STANDARD
            .decode(self.audio_base64.as_bytes())
            .map_err(|e| PipelineError::Planning(format!("invalid audio encoding: {}", e)))
    }
}

/// Files produced from a completed speech item
#[derive(Debug, Clone)]
pub struct Voiceover {
    pub audio_path: PathBuf,
    pub transcript_path: PathBuf,
    pub transcript: Transcript,
}

pub fn voice_audio_path(out_dir: &Path, item: &WorkItem) -> PathBuf {
    out_dir.join(format!("{}_voice.mp3", item.file_stem()))
}

pub fn transcript_path(out_dir: &Path, item: &WorkItem) -> PathBuf {
    out_dir.join(format!("{}_transcript.json", item.file_stem()))
}

/// Decode the audio of a completed speech item and reconstruct its line timing
pub async fn build_voiceover(item: &WorkItem, out_dir: &Path, pause_markers: &[String]) -> Result<Voiceover> {
    if item.kind != JobKind::Speech {
        return Err(PipelineError::Planning(format!("{} is not a speech item", item.id)));
    }
    let artifact_path = match (&item.state, &item.local_path) {
        (WorkState::Completed, Some(path)) => path,
        _ => {
            return Err(PipelineError::Planning(format!(
                "{} is not completed ({})",
                item.id,
                item.state.status_string()
            )))
        }
    };

    let spec = SpeechSpec::from_value(&item.spec)?;
    let artifact = SpeechArtifact::parse(&tokio::fs::read(artifact_path).await?)?;

    tokio::fs::create_dir_all(out_dir).await?;
    let audio_path = voice_audio_path(out_dir, item);
    tokio::fs::write(&audio_path, artifact.audio()?).await?;

    let transcript = Transcript::from_alignment(&item.id, &artifact.alignment(), &spec.lines, pause_markers);
    let transcript_path = transcript_path(out_dir, item);
    transcript.save(&transcript_path).await?;

    info!(
        "🎙️ Voiceover saved: {} ({:.1}s, {} lines)",
        audio_path.display(),
        transcript.duration,
        transcript.lines.len()
    );

    Ok(Voiceover {
        audio_path,
        transcript_path,
        transcript,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn artifact_json() -> serde_json::Value {
        json!({
            "audio_base64": base64::engine::general_purpose::STANDARD.encode(b"ID3-fake-mp3"),
            "alignment": {
                "characters": ["x"],
                "character_start_times_seconds": [0.0],
                "character_end_times_seconds": [9.0]
            },
            "normalized_alignment": {
                "characters": ["h", "i", " ", "y", "o"],
                "character_start_times_seconds": [0.0, 0.1, 0.2, 0.3, 0.4],
                "character_end_times_seconds": [0.1, 0.2, 0.3, 0.4, 0.5]
            }
        })
    }

    #[test]
    fn test_normalized_alignment_preferred() {
        let artifact = SpeechArtifact::parse(artifact_json().to_string().as_bytes()).unwrap();
        assert_eq!(artifact.alignment().characters.len(), 5);
        assert_eq!(artifact.audio().unwrap(), b"ID3-fake-mp3");
    }

    #[tokio::test]
    async fn test_build_voiceover_writes_audio_and_transcript() {
        let temp_dir = TempDir::new().unwrap();
        let artifact_path = temp_dir.path().join("speech.json");
        tokio::fs::write(&artifact_path, artifact_json().to_string()).await.unwrap();

        let mut item = WorkItem::new("speech:q01/en", JobKind::Speech, json!({"lines": ["hi", "yo"]}));
        item.state = WorkState::Completed;
        item.local_path = Some(artifact_path);

        let out_dir = temp_dir.path().join("voice");
        let voiceover = build_voiceover(&item, &out_dir, &[]).await.unwrap();

        assert!(voiceover.audio_path.exists());
        assert!(voiceover.transcript_path.exists());
        assert_eq!(voiceover.transcript.lines.len(), 2);
        assert!((voiceover.transcript.duration - 0.5).abs() < 1e-9);
        assert!((voiceover.transcript.lines[1].start - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejects_incomplete_item() {
        let temp_dir = TempDir::new().unwrap();
        let item = WorkItem::new("speech:q02/en", JobKind::Speech, json!({"lines": ["hi"]}));
        assert!(build_voiceover(&item, temp_dir.path(), &[]).await.is_err());
    }
}
