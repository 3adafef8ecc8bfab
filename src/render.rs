use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::alignment::LineTimestamp;
use crate::config::RenderConfig;
use crate::error::RenderError;

/// Everything needed to render one text-overlaid segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentJob {
    pub clip: PathBuf,
    pub duration: f64,
    pub loop_count: u32,
    pub text: String,
    pub anchor_x: i32,
    pub anchor_y: i32,
}

/// Media operations delegated to an external tool
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Container duration in seconds
    async fn probe_duration(&self, path: &Path) -> Result<f64, RenderError>;

    async fn render_segment(&self, job: &SegmentJob, out: &Path) -> Result<PathBuf, RenderError>;

    async fn concat(&self, segments: &[PathBuf], out: &Path) -> Result<PathBuf, RenderError>;

    /// Insert `pause` seconds of silence after every line but the last
    async fn pad_voice(
        &self,
        audio: &Path,
        lines: &[LineTimestamp],
        pause: f64,
        out: &Path,
    ) -> Result<PathBuf, RenderError>;

    async fn mux(&self, video: &Path, audio: &Path, music: Option<&Path>, out: &Path) -> Result<PathBuf, RenderError>;
}

/// Escape text for the drawtext filter
pub fn escape_drawtext(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('\'', "\u{2019}")
        .replace(':', "\\:")
        .replace('%', "%%")
}

/// Greedy word wrap; a single long word stays on its own line
pub fn wrap_text(text: &str, max_chars: usize) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let candidate_len = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };

        if candidate_len > max_chars && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }

    if !current.is_empty() {
        lines.push(current);
    }
    lines.join("\n")
}

fn ensure_exists(path: &Path) -> Result<(), RenderError> {
    if path.exists() {
        Ok(())
    } else {
        Err(RenderError::MissingInput(path.to_path_buf()))
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let chars: Vec<char> = text.trim_end().chars().collect();
    let start = chars.len().saturating_sub(500);
    chars[start..].iter().collect()
}

/// Renderer backed by the `ffmpeg` and `ffprobe` binaries
#[derive(Debug, Clone)]
pub struct FfmpegRenderer {
    config: RenderConfig,
    width: u32,
    height: u32,
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegRenderer {
    pub fn new(config: &RenderConfig) -> anyhow::Result<Self> {
        let (width, height) = config.dimensions()?;
        Ok(Self {
            config: config.clone(),
            width,
            height,
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        })
    }

    /// Use specific ffmpeg and ffprobe executables instead of the ones on PATH
    pub fn with_tools(mut self, ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self.ffprobe = ffprobe.into();
        self
    }

    async fn run(&self, step: &str, program: &Path, args: Vec<OsString>) -> Result<(), RenderError> {
        debug!("{}: {} {:?}", step, program.display(), args);
        let output = Command::new(program).args(&args).output().await?;

        if !output.status.success() {
            return Err(RenderError::Tool {
                step: step.to_string(),
                code: output.status.code(),
                stderr_tail: stderr_tail(&output.stderr),
            });
        }
        Ok(())
    }

    fn segment_filter(&self, job: &SegmentJob) -> String {
        let text = escape_drawtext(&wrap_text(&job.text, self.config.max_chars_per_line));
        let (w, h) = (self.width, self.height);
        [
            format!("scale={}:{}:force_original_aspect_ratio=increase", w, h),
            format!("crop={}:{}", w, h),
            format!("fps={}", self.config.fps),
            format!(
                "drawtext=text='{}':fontfile='{}':fontsize={}:fontcolor={}:borderw={}:bordercolor={}\
                 :x=max(20\\, min(w-tw-20\\, (w-tw)/2+{})):y={}",
                text,
                self.config.font.display(),
                self.config.font_size,
                self.config.font_color,
                self.config.border_width,
                self.config.border_color,
                job.anchor_x,
                job.anchor_y,
            ),
        ]
        .join(",")
    }

    pub fn segment_args(&self, job: &SegmentJob, out: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into()];
        if job.loop_count > 1 {
            args.push("-stream_loop".into());
            args.push((job.loop_count - 1).to_string().into());
        }
        let rest: Vec<OsString> = vec![
            "-i".into(),
            job.clip.as_os_str().to_owned(),
            "-t".into(),
            format!("{:.3}", job.duration).into(),
            "-vf".into(),
            self.segment_filter(job).into(),
            "-an".into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "fast".into(),
            "-crf".into(),
            "23".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            out.as_os_str().to_owned(),
        ];
        args.extend(rest);
        args
    }

    /// Filter graph that cuts the voice at line starts and joins the parts with silence
    pub fn pause_filter(lines: &[LineTimestamp], pause: f64) -> String {
        let mut parts = Vec::new();
        let mut inputs = String::new();

        for (i, line) in lines.iter().enumerate() {
            let start = if i == 0 { 0.0 } else { line.start };
            let trim = match lines.get(i + 1) {
                Some(next) => format!("atrim={}:{}", start, next.start),
                None => format!("atrim=start={}", start),
            };
            parts.push(format!("[0:a]{},asetpts=PTS-STARTPTS[s{}]", trim, i));
            inputs.push_str(&format!("[s{}]", i));

            if i + 1 < lines.len() {
                parts.push(format!(
                    "anullsrc=r=44100:cl=stereo,atrim=0:{},asetpts=PTS-STARTPTS[p{}]",
                    pause, i
                ));
                inputs.push_str(&format!("[p{}]", i));
            }
        }

        let n = (lines.len() * 2).saturating_sub(1);
        parts.push(format!("{}concat=n={}:v=0:a=1[out]", inputs, n));
        parts.join(";")
    }
}

#[async_trait]
impl Renderer for FfmpegRenderer {
    async fn probe_duration(&self, path: &Path) -> Result<f64, RenderError> {
        ensure_exists(path)?;
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path)
            .output()
            .await?;

        if !output.status.success() {
            return Err(RenderError::Tool {
                step: "probe".to_string(),
                code: output.status.code(),
                stderr_tail: stderr_tail(&output.stderr),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.trim().parse::<f64>().map_err(|_| RenderError::Tool {
            step: "probe".to_string(),
            code: output.status.code(),
            stderr_tail: format!("unparsable duration '{}'", stdout.trim()),
        })
    }

    async fn render_segment(&self, job: &SegmentJob, out: &Path) -> Result<PathBuf, RenderError> {
        ensure_exists(&job.clip)?;
        ensure_exists(&self.config.font)?;
        self.run("segment", &self.ffmpeg, self.segment_args(job, out)).await?;
        Ok(out.to_path_buf())
    }

    async fn concat(&self, segments: &[PathBuf], out: &Path) -> Result<PathBuf, RenderError> {
        for segment in segments {
            ensure_exists(segment)?;
        }

        let list_path = out.with_extension("txt");
        let list: String = segments
            .iter()
            .map(|s| format!("file '{}'\n", s.display().to_string().replace('\'', "'\\''")))
            .collect();
        tokio::fs::write(&list_path, list).await?;

        let args: Vec<OsString> = vec![
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.as_os_str().to_owned(),
            "-c".into(),
            "copy".into(),
            out.as_os_str().to_owned(),
        ];
        self.run("concat", &self.ffmpeg, args).await?;
        Ok(out.to_path_buf())
    }

    async fn pad_voice(
        &self,
        audio: &Path,
        lines: &[LineTimestamp],
        pause: f64,
        out: &Path,
    ) -> Result<PathBuf, RenderError> {
        ensure_exists(audio)?;
        if pause <= 0.0 || lines.len() < 2 {
            return Ok(audio.to_path_buf());
        }

        info!("🔇 Inserting {:.1}s pauses between {} lines", pause, lines.len());
        let args: Vec<OsString> = vec![
            "-y".into(),
            "-i".into(),
            audio.as_os_str().to_owned(),
            "-filter_complex".into(),
            Self::pause_filter(lines, pause).into(),
            "-map".into(),
            "[out]".into(),
            "-c:a".into(),
            "libmp3lame".into(),
            "-b:a".into(),
            "192k".into(),
            out.as_os_str().to_owned(),
        ];
        self.run("pad_voice", &self.ffmpeg, args).await?;
        Ok(out.to_path_buf())
    }

    async fn mux(&self, video: &Path, audio: &Path, music: Option<&Path>, out: &Path) -> Result<PathBuf, RenderError> {
        ensure_exists(video)?;
        ensure_exists(audio)?;
        if let Some(music) = music {
            ensure_exists(music)?;
        }
        if let Some(parent) = out.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let fade = self.config.outro_fade;
        let muxed = if fade > 0.0 {
            out.with_extension("prefade.mp4")
        } else {
            out.to_path_buf()
        };

        let mut args: Vec<OsString> = vec![
            "-y".into(),
            "-i".into(),
            video.as_os_str().to_owned(),
            "-i".into(),
            audio.as_os_str().to_owned(),
        ];
        let mapping: Vec<OsString> = match music {
            Some(music) => vec![
                "-i".into(),
                music.as_os_str().to_owned(),
                "-filter_complex".into(),
                format!(
                    "[1:a]volume=1.0[voice];[2:a]volume={}[music];[voice][music]amix=inputs=2:duration=first[aout]",
                    self.config.music_volume
                )
                .into(),
                "-map".into(),
                "0:v:0".into(),
                "-map".into(),
                "[aout]".into(),
            ],
            None => vec!["-map".into(), "0:v:0".into(), "-map".into(), "1:a:0".into()],
        };
        args.extend(mapping);
        let encode: Vec<OsString> = vec![
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "192k".into(),
            "-shortest".into(),
            muxed.as_os_str().to_owned(),
        ];
        args.extend(encode);
        self.run("mux", &self.ffmpeg, args).await?;

        if fade > 0.0 {
            match self.probe_duration(&muxed).await {
                Ok(duration) => {
                    let fade_start = (duration - fade).max(0.0);
                    info!("🌒 Applying {:.1}s fade-out at {:.1}s", fade, fade_start);
                    self.run("fade", &self.ffmpeg, fade_args(&muxed, out, fade_start, fade)).await?;
                    tokio::fs::remove_file(&muxed).await?;
                }
                Err(e) => {
                    warn!("⚠️ Could not probe {}, skipping the outro fade: {}", muxed.display(), e);
                    tokio::fs::rename(&muxed, out).await?;
                }
            }
        }

        Ok(out.to_path_buf())
    }
}

fn fade_args(muxed: &Path, out: &Path, fade_start: f64, fade: f64) -> Vec<OsString> {
    vec![
        "-y".into(),
        "-i".into(),
        muxed.as_os_str().to_owned(),
        "-vf".into(),
        format!("fade=t=out:st={:.3}:d={:.3}", fade_start, fade).into(),
        "-af".into(),
        format!("afade=t=out:st={:.3}:d={:.3}", fade_start, fade).into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "fast".into(),
        "-crf".into(),
        "23".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "192k".into(),
        out.as_os_str().to_owned(),
    ]
}
