use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::alignment::Transcript;
use crate::clips::ClipSource;
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::planner::Planner;
use crate::render::{Renderer, SegmentJob};

/// Builds the final short video from a transcript, its voice audio and a clip pool
pub struct Assembler {
    renderer: Arc<dyn Renderer>,
    planner: Planner,
    line_pause: f64,
}

impl Assembler {
    pub fn new(renderer: Arc<dyn Renderer>, config: &Config) -> Result<Self> {
        Ok(Self {
            renderer,
            planner: Planner::from_config(config)?,
            line_pause: config.timing.line_pause,
        })
    }

    /// Plan, render each segment, concatenate, pad the voice and mux.
    ///
    /// Returns the output path; an existing output is kept unless `force` is set.
    pub async fn assemble(
        &self,
        transcript: &Transcript,
        audio: &Path,
        clips: &[ClipSource],
        music: Option<&Path>,
        output: &Path,
        force: bool,
    ) -> Result<PathBuf> {
        if output.exists() && !force {
            info!("⏭️ Output already exists, skipping: {}", output.display());
            return Ok(output.to_path_buf());
        }
        if transcript.lines.is_empty() {
            return Err(PipelineError::Planning(format!("no lines in transcript for {}", transcript.item_id)));
        }

        let plans = self
            .planner
            .plan(&transcript.item_id, &transcript.lines, transcript.duration, clips)?;

        let workdir = tempfile::Builder::new().prefix("reel_forge_").tempdir()?;
        let mut segments = Vec::with_capacity(plans.len());

        for (plan, line) in plans.iter().zip(&transcript.lines) {
            let job = SegmentJob {
                clip: plan.clip_ref.clone(),
                duration: plan.duration,
                loop_count: plan.loop_count,
                text: line.text.clone(),
                anchor_x: plan.anchor_x,
                anchor_y: plan.anchor_y,
            };
            let out = workdir.path().join(format!("seg_{:03}.mp4", plan.line_index));

            info!(
                "🎬 Segment {}/{}: {:.1}s from {} (x{})",
                plan.line_index + 1,
                plans.len(),
                plan.duration,
                plan.clip_ref.display(),
                plan.loop_count
            );
            segments.push(self.renderer.render_segment(&job, &out).await?);
        }

        let video = self
            .renderer
            .concat(&segments, &workdir.path().join("concat.mp4"))
            .await?;
        let voice = self
            .renderer
            .pad_voice(audio, &transcript.lines, self.line_pause, &workdir.path().join("voice_paused.mp3"))
            .await?;

        let music = match music {
            Some(path) if !path.exists() => {
                warn!("Music file not found, continuing without: {}", path.display());
                None
            }
            other => other,
        };

        let result = self.renderer.mux(&video, &voice, music, output).await?;
        info!("✅ Built video: {}", result.display());
        Ok(result)
    }
}
