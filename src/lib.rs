//! reel-forge
//!
//! Resumable orchestration of slow remote media-generation jobs, plus the
//! timing and placement logic that turns a voiceover into a short video.

pub mod alignment;
pub mod assembly;
pub mod batch;
pub mod clips;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod planner;
pub mod render;
pub mod state;
pub mod voiceover;

// Re-export main types for easy access
pub use crate::alignment::{CharacterAlignment, LineTimestamp, Transcript, WordTimestamp};
pub use crate::assembly::Assembler;
pub use crate::batch::BatchFile;
pub use crate::clips::{ClipSource, SafeZone};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{GatewayError, LedgerError, PipelineError, RenderError};
pub use crate::gateway::{JobGateway, PollResult, PollStatus, RetryPolicy, RetryingGateway};
pub use crate::lifecycle::{BatchSummary, TaskManager};
pub use crate::planner::{Planner, SegmentPlan};
pub use crate::render::{FfmpegRenderer, Renderer, SegmentJob};
pub use crate::state::{JobKind, Ledger, LedgerStats, WorkItem, WorkState};
