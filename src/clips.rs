//! Clip pool discovery and safe text-zone markup

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{PipelineError, Result};
use crate::render::Renderer;

/// Name of the zone markup file inside a clip directory
pub const ZONE_FILE: &str = "clips.toml";

/// Native duration assumed when a clip cannot be probed
pub const FALLBACK_CLIP_SECONDS: f64 = 6.0;

/// Rectangle, in output-frame pixels, where text may be placed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafeZone {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Default for SafeZone {
    fn default() -> Self {
        Self {
            x: 40,
            y: 400,
            w: 1000,
            h: 1100,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PartialZone {
    x: Option<i32>,
    y: Option<i32>,
    w: Option<i32>,
    h: Option<i32>,
}

impl PartialZone {
    fn over(&self, base: SafeZone) -> SafeZone {
        SafeZone {
            x: self.x.unwrap_or(base.x),
            y: self.y.unwrap_or(base.y),
            w: self.w.unwrap_or(base.w),
            h: self.h.unwrap_or(base.h),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ZoneMarkup {
    #[serde(default)]
    defaults: PartialZone,

    #[serde(default)]
    clips: BTreeMap<String, PartialZone>,
}

/// Parse zone markup; clips listed without values get the markup defaults
pub fn parse_zones(markup: &str) -> Result<BTreeMap<String, SafeZone>> {
    let markup: ZoneMarkup =
        toml::from_str(markup).map_err(|e| PipelineError::Config(format!("invalid {}: {}", ZONE_FILE, e)))?;
    let defaults = markup.defaults.over(SafeZone::default());

    Ok(markup
        .clips
        .iter()
        .map(|(stem, zone)| (stem.clone(), zone.over(defaults)))
        .collect())
}

/// Zones for a clip directory; empty when there is no markup file
pub async fn load_zones(clips_dir: &Path) -> Result<BTreeMap<String, SafeZone>> {
    let path = clips_dir.join(ZONE_FILE);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(BTreeMap::new());
    }
    parse_zones(&tokio::fs::read_to_string(&path).await?)
}

/// A source clip available for segments
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClipSource {
    pub path: PathBuf,
    pub duration_secs: f64,
    pub zone: Option<SafeZone>,
}

impl ClipSource {
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn is_clip_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("mp4"))
        .unwrap_or(false)
}

/// `*.mp4` files directly inside `clips_dir`, sorted by name
pub fn discover_clips(clips_dir: &Path) -> Result<Vec<PathBuf>> {
    if !clips_dir.is_dir() {
        return Err(PipelineError::Config(format!(
            "clip directory does not exist: {}",
            clips_dir.display()
        )));
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(clips_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| PipelineError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        if entry.file_type().is_file() && is_clip_file(entry.path()) {
            paths.push(entry.into_path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// Build the clip pool: discovered files, their zones, and probed durations
pub async fn load_clip_pool(clips_dir: &Path, renderer: &dyn Renderer) -> Result<Vec<ClipSource>> {
    let zones = load_zones(clips_dir).await?;
    let mut pool = Vec::new();

    for path in discover_clips(clips_dir)? {
        let duration_secs = match renderer.probe_duration(&path).await {
            Ok(d) if d.is_finite() && d > 0.0 => d,
            Ok(d) => {
                warn!("Unusable duration {} for {}, assuming {}s", d, path.display(), FALLBACK_CLIP_SECONDS);
                FALLBACK_CLIP_SECONDS
            }
            Err(e) => {
                warn!("Could not probe {}: {}; assuming {}s", path.display(), e, FALLBACK_CLIP_SECONDS);
                FALLBACK_CLIP_SECONDS
            }
        };

        let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        pool.push(ClipSource {
            zone: zones.get(&stem).copied(),
            path,
            duration_secs,
        });
    }

    info!(
        "🎞️ Clip pool: {} clips ({} with text zones) from {}",
        pool.len(),
        pool.iter().filter(|c| c.zone.is_some()).count(),
        clips_dir.display()
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_zone_defaults_and_overrides() {
        let zones = parse_zones(
            r#"
            [defaults]
            y = 300

            [clips.beach]
            x = 100
            w = 400

            [clips.city]
            "#,
        )
        .unwrap();

        assert_eq!(
            zones["beach"],
            SafeZone {
                x: 100,
                y: 300,
                w: 400,
                h: 1100
            }
        );
        assert_eq!(
            zones["city"],
            SafeZone {
                x: 40,
                y: 300,
                w: 1000,
                h: 1100
            }
        );
        assert!(!zones.contains_key("forest"));
    }

    #[test]
    fn test_empty_markup() {
        assert!(parse_zones("").unwrap().is_empty());
    }

    #[test]
    fn test_discover_only_mp4_sorted() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["b.mp4", "a.MP4", "notes.txt", "clips.toml"] {
            std::fs::write(temp_dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(temp_dir.path().join("nested")).unwrap();
        std::fs::write(temp_dir.path().join("nested").join("c.mp4"), b"").unwrap();

        let clips = discover_clips(temp_dir.path()).unwrap();
        let names: Vec<_> = clips
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.MP4", "b.mp4"]);
    }

    #[test]
    fn test_missing_directory_is_error() {
        assert!(discover_clips(Path::new("/definitely/not/here")).is_err());
    }
}
