use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the reel-forge pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote generation service endpoints
    pub gateway: GatewayConfig,

    /// Backoff policy for transient transport errors
    pub retry: RetryConfig,

    /// Poll cadence and budget
    pub polling: PollingConfig,

    /// Pacing between back-to-back submissions
    pub submission: SubmissionConfig,

    /// Speech synthesis settings
    pub speech: SpeechConfig,

    /// Per-line segment timing
    pub timing: TimingConfig,

    /// Text placement random walk bounds
    pub placement: PlacementConfig,

    /// Final video rendering
    pub render: RenderConfig,

    /// Output and ledger locations
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the image/video generation API
    pub media_base_url: String,

    /// API key for the image/video generation API
    pub media_api_key: Option<String>,

    /// Base URL of the speech synthesis API
    pub speech_base_url: String,

    /// API key for the speech synthesis API
    pub speech_api_key: Option<String>,

    /// Timeout for API requests (seconds)
    pub request_timeout_seconds: u64,

    /// Connection timeout (seconds)
    pub connect_timeout_seconds: u64,

    /// Timeout for artifact downloads (seconds)
    pub download_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    pub max_attempts: u32,

    /// Delay before the second attempt (milliseconds)
    pub base_delay_ms: u64,

    /// Upper bound for any single delay (milliseconds)
    pub max_delay_ms: u64,

    /// Relative jitter applied to each delay, 0.0..=1.0
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Seconds between polls of one job
    pub interval_seconds: u64,

    /// Cumulative poll budget per work item (seconds)
    pub max_wait_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Delay between consecutive submissions (milliseconds)
    pub pacing_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Voice used when a speech item does not name one
    pub default_voice_id: Option<String>,

    /// Synthesis model
    pub model_id: String,

    /// Tokens dropped from both the aligned words and the line word counts
    pub pause_markers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Silence inserted between lines (seconds)
    pub line_pause: f64,

    /// Shortest segment ever rendered (seconds)
    pub min_segment_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Global y bounds when a clip has no safe zone
    pub y_min: i32,
    pub y_max: i32,

    /// Largest y change between consecutive lines
    pub y_step: i32,

    /// Global symmetric x offset bound when a clip has no safe zone
    pub x_offset_max: i32,

    /// Largest x change between consecutive lines
    pub x_step: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Output resolution, e.g. "1080x1920"
    pub resolution: String,
    pub fps: u32,
    pub font: PathBuf,
    pub font_size: u32,
    pub font_color: String,
    pub border_width: u32,
    pub border_color: String,
    pub max_chars_per_line: usize,

    /// Background music volume relative to the voice
    pub music_volume: f64,

    /// Fade-out at the end of the final video (seconds, 0 disables)
    pub outro_fade: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Base output directory for downloaded artifacts
    pub base_dir: PathBuf,

    /// Ledger file path
    pub ledger_file: PathBuf,

    /// Log level
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            media_base_url: "https://api.kie.ai".to_string(),
            media_api_key: None,
            speech_base_url: "https://api.elevenlabs.io".to_string(),
            speech_api_key: None,
            request_timeout_seconds: 60,
            connect_timeout_seconds: 10,
            download_timeout_seconds: 300,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: 0.1,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 10,
            max_wait_seconds: 600,
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self { pacing_ms: 500 }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            default_voice_id: None,
            model_id: "eleven_multilingual_v2".to_string(),
            pause_markers: vec!["...".to_string()],
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            line_pause: 1.5,
            min_segment_seconds: 1.0,
        }
    }
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            y_min: 400,
            y_max: 1500,
            y_step: 150,
            x_offset_max: 100,
            x_step: 80,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            resolution: "1080x1920".to_string(),
            fps: 30,
            font: PathBuf::from("fonts/SpecialElite-Regular.ttf"),
            font_size: 48,
            font_color: "white".to_string(),
            border_width: 2,
            border_color: "black".to_string(),
            max_chars_per_line: 30,
            music_volume: 0.3,
            outro_fade: 0.5,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./output"),
            ledger_file: PathBuf::from("./output/ledger.json"),
            log_level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            retry: RetryConfig::default(),
            polling: PollingConfig::default(),
            submission: SubmissionConfig::default(),
            speech: SpeechConfig::default(),
            timing: TimingConfig::default(),
            placement: PlacementConfig::default(),
            render: RenderConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl RenderConfig {
    /// Parse `resolution` into (width, height)
    pub fn dimensions(&self) -> Result<(u32, u32)> {
        let (w, h) = self
            .resolution
            .split_once('x')
            .ok_or_else(|| anyhow!("resolution must look like WIDTHxHEIGHT, got {}", self.resolution))?;
        Ok((w.trim().parse()?, h.trim().parse()?))
    }
}

impl Config {
    /// Load configuration from an explicit path or the default locations
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let config_str = std::fs::read_to_string(path)
                .map_err(|e| anyhow!("Cannot read config {}: {}", path.display(), e))?;
            let config: Config = toml::from_str(&config_str)?;
            tracing::info!("📄 Loaded configuration from: {}", path.display());
            return Ok(config.with_env_overrides());
        }

        let config_paths = ["reel-forge.toml", "config/reel-forge.toml"];

        for path in &config_paths {
            if let Ok(config_str) = std::fs::read_to_string(path) {
                match toml::from_str::<Config>(&config_str) {
                    Ok(config) => {
                        tracing::info!("📄 Loaded configuration from: {}", path);
                        return Ok(config.with_env_overrides());
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse config file {}: {}", path, e);
                    }
                }
            }
        }

        Self::from_env()
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::default().with_env_overrides())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("REEL_FORGE_KIE_API_KEY") {
            self.gateway.media_api_key = Some(key);
        }

        if let Ok(key) = std::env::var("REEL_FORGE_ELEVENLABS_API_KEY") {
            self.gateway.speech_api_key = Some(key);
        }

        if let Ok(output_dir) = std::env::var("REEL_FORGE_OUTPUT_DIR") {
            let dir = PathBuf::from(output_dir);
            self.output.ledger_file = dir.join("ledger.json");
            self.output.base_dir = dir;
        }

        if let Ok(log_level) = std::env::var("REEL_FORGE_LOG_LEVEL") {
            self.output.log_level = log_level;
        }

        self
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        tracing::info!("💾 Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(anyhow!("retry.jitter must be within 0.0..=1.0"));
        }

        if self.polling.interval_seconds == 0 {
            return Err(anyhow!("polling.interval_seconds must be greater than 0"));
        }

        if self.placement.y_min > self.placement.y_max {
            return Err(anyhow!("placement.y_min must not exceed placement.y_max"));
        }

        if self.placement.x_offset_max < 0 || self.placement.y_step < 0 || self.placement.x_step < 0 {
            return Err(anyhow!("placement offsets and steps must be non-negative"));
        }

        if self.timing.min_segment_seconds <= 0.0 {
            return Err(anyhow!("timing.min_segment_seconds must be positive"));
        }

        self.render.dimensions()?;

        tracing::debug!("✅ Configuration validation passed");
        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "reel-forge configuration:\n\
            - Media API: {}\n\
            - Speech API: {}\n\
            - Retry: {} attempts, base {}ms\n\
            - Polling: every {}s, budget {}s\n\
            - Ledger: {}\n\
            - Output Directory: {}",
            self.gateway.media_base_url,
            self.gateway.speech_base_url,
            self.retry.max_attempts,
            self.retry.base_delay_ms,
            self.polling.interval_seconds,
            self.polling.max_wait_seconds,
            self.output.ledger_file.display(),
            self.output.base_dir.display(),
        )
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.config.output.ledger_file = dir.join("ledger.json");
        self.config.output.base_dir = dir;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay_ms: u64, jitter: f64) -> Self {
        self.config.retry.max_attempts = max_attempts;
        self.config.retry.base_delay_ms = base_delay_ms;
        self.config.retry.jitter = jitter;
        self
    }

    pub fn with_polling(mut self, interval_seconds: u64, max_wait_seconds: u64) -> Self {
        self.config.polling.interval_seconds = interval_seconds;
        self.config.polling.max_wait_seconds = max_wait_seconds;
        self
    }

    pub fn with_pacing_ms(mut self, pacing_ms: u64) -> Self {
        self.config.submission.pacing_ms = pacing_ms;
        self
    }

    pub fn with_line_pause(mut self, seconds: f64) -> Self {
        self.config.timing.line_pause = seconds;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
