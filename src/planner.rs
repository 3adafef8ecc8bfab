use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::alignment::LineTimestamp;
use crate::clips::{ClipSource, SafeZone};
use crate::config::{Config, PlacementConfig, TimingConfig};
use crate::error::{PipelineError, Result};

/// Render instructions for one line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentPlan {
    pub line_index: usize,
    pub clip_ref: PathBuf,

    /// Seconds of output for this line
    pub duration: f64,

    /// How many times the clip must play back to back to cover `duration`
    pub loop_count: u32,

    /// Horizontal offset of the text centre from the frame centre
    pub anchor_x: i32,

    /// Absolute top of the text block
    pub anchor_y: i32,
}

/// Stable 64-bit seed from a work item id
pub fn seed_for(item_id: &str) -> u64 {
    let digest = md5::compute(item_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.0[..8]);
    u64::from_le_bytes(bytes)
}

/// Per-line durations: gap to the next line plus the pause, last line runs to the end
pub fn segment_durations(lines: &[LineTimestamp], total_duration: f64, timing: &TimingConfig) -> Vec<f64> {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let raw = match lines.get(i + 1) {
                Some(next) => next.start - line.start + timing.line_pause,
                None => total_duration - line.start,
            };
            raw.max(timing.min_segment_seconds)
        })
        .collect()
}

pub fn loop_count(native_secs: f64, needed_secs: f64) -> u32 {
    if native_secs > 0.0 && native_secs < needed_secs {
        (needed_secs / native_secs).ceil() as u32
    } else {
        1
    }
}

/// Shuffle the pool with the item seed and cycle through it
pub fn select_clips<'a>(pool: &'a [ClipSource], count: usize, seed: u64) -> Result<Vec<&'a ClipSource>> {
    if pool.is_empty() {
        return Err(PipelineError::Planning("no clips available".into()));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut shuffled: Vec<&ClipSource> = pool.iter().collect();
    shuffled.shuffle(&mut rng);

    Ok((0..count).map(|i| shuffled[i % shuffled.len()]).collect())
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    lo: i32,
    hi: i32,
}

impl Bounds {
    fn new(a: i32, b: i32) -> Self {
        Self { lo: a.min(b), hi: a.max(b) }
    }

    fn clamp(&self, v: i32) -> i32 {
        v.clamp(self.lo, self.hi)
    }

    fn shifted(&self, by: i32) -> Self {
        Self {
            lo: self.lo + by,
            hi: self.hi + by,
        }
    }
}

/// Bounded random walk for text anchors, clamped after each step
struct PlacementWalk<'a> {
    rng: StdRng,
    placement: &'a PlacementConfig,
    frame_width: i32,
    x: Option<i32>,
    y: Option<i32>,
}

impl<'a> PlacementWalk<'a> {
    fn new(seed: u64, placement: &'a PlacementConfig, frame_width: i32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            placement,
            frame_width,
            x: None,
            y: None,
        }
    }

    fn bounds(&self, zone: Option<&SafeZone>) -> (Bounds, Bounds) {
        match zone {
            Some(zone) => {
                let w = zone.w.max(0);
                let h = zone.h.max(0);
                let base = zone.x + w / 2 - self.frame_width / 2;
                (Bounds::new(-(w / 2), w / 2).shifted(base), Bounds::new(zone.y, zone.y + h))
            }
            None => {
                let x_max = self.placement.x_offset_max.max(0);
                (
                    Bounds::new(-x_max, x_max),
                    Bounds::new(self.placement.y_min, self.placement.y_max),
                )
            }
        }
    }

    fn step(rng: &mut StdRng, current: Option<i32>, bounds: Bounds, max_step: i32) -> i32 {
        match current {
            None => rng.gen_range(bounds.lo..=bounds.hi),
            Some(v) => {
                let max_step = max_step.max(0);
                let delta = rng.gen_range(-max_step..=max_step);
                bounds.clamp(v.saturating_add(delta))
            }
        }
    }

    fn next(&mut self, zone: Option<&SafeZone>) -> (i32, i32) {
        let (x_bounds, y_bounds) = self.bounds(zone);
        let y = Self::step(&mut self.rng, self.y, y_bounds, self.placement.y_step);
        let x = Self::step(&mut self.rng, self.x, x_bounds, self.placement.x_step);
        self.y = Some(y);
        self.x = Some(x);
        (x, y)
    }
}

/// Turns line timing and a clip pool into per-line segment plans
#[derive(Debug, Clone)]
pub struct Planner {
    timing: TimingConfig,
    placement: PlacementConfig,

    /// Width of the rendered frame; zone offsets are relative to its centre
    frame_width: i32,
}

impl Planner {
    pub fn new(timing: TimingConfig, placement: PlacementConfig, frame_width: u32) -> Self {
        Self {
            timing,
            placement,
            frame_width: i32::try_from(frame_width).unwrap_or(i32::MAX),
        }
    }

    /// Frame width comes from `render.resolution`
    pub fn from_config(config: &Config) -> Result<Self> {
        let (width, _) = config
            .render
            .dimensions()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(Self::new(config.timing.clone(), config.placement.clone(), width))
    }

    /// Pure function of its inputs; the same id always yields the same plan
    pub fn plan(
        &self,
        item_id: &str,
        lines: &[LineTimestamp],
        total_duration: f64,
        pool: &[ClipSource],
    ) -> Result<Vec<SegmentPlan>> {
        let seed = seed_for(item_id);
        let clips = select_clips(pool, lines.len(), seed)?;
        let durations = segment_durations(lines, total_duration, &self.timing);
        let mut walk = PlacementWalk::new(seed, &self.placement, self.frame_width);

        let plans: Vec<SegmentPlan> = lines
            .iter()
            .zip(clips)
            .zip(durations)
            .map(|((line, clip), duration)| {
                let (anchor_x, anchor_y) = walk.next(clip.zone.as_ref());
                SegmentPlan {
                    line_index: line.index,
                    clip_ref: clip.path.clone(),
                    duration,
                    loop_count: loop_count(clip.duration_secs, duration),
                    anchor_x,
                    anchor_y,
                }
            })
            .collect();

        debug!("Planned {} segments for {}", plans.len(), item_id);
        Ok(plans)
    }
}
