use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Character-level alignment as returned by the speech service: three parallel arrays
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CharacterAlignment {
    pub characters: Vec<String>,
    pub character_start_times_seconds: Vec<f64>,
    pub character_end_times_seconds: Vec<f64>,
}

/// One aligned character
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentPoint<'a> {
    pub character: &'a str,
    pub start: f64,
    pub end: f64,
}

impl CharacterAlignment {
    pub fn len(&self) -> usize {
        self.characters
            .len()
            .min(self.character_start_times_seconds.len())
            .min(self.character_end_times_seconds.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aligned characters, truncated to the shortest of the three arrays
    pub fn points(&self) -> impl Iterator<Item = AlignmentPoint<'_>> {
        self.characters
            .iter()
            .zip(&self.character_start_times_seconds)
            .zip(&self.character_end_times_seconds)
            .map(|((character, start), end)| AlignmentPoint {
                character: character.as_str(),
                start: *start,
                end: *end,
            })
    }

    /// Latest character end time, if any characters are aligned
    pub fn max_end(&self) -> Option<f64> {
        self.character_end_times_seconds[..self.len()]
            .iter()
            .copied()
            .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WordTimestamp {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineTimestamp {
    pub text: String,
    pub index: usize,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub words: Vec<WordTimestamp>,
}

/// Group aligned characters into words; whitespace separates words
pub fn words_from_alignment(alignment: &CharacterAlignment) -> Vec<WordTimestamp> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut word_start = 0.0;
    let mut word_end = 0.0;

    for point in alignment.points() {
        if point.character.trim().is_empty() {
            if !current.is_empty() {
                words.push(WordTimestamp {
                    word: std::mem::take(&mut current),
                    start: word_start,
                    end: word_end,
                });
            }
            continue;
        }

        if current.is_empty() {
            word_start = point.start;
        }
        current.push_str(point.character);
        word_end = point.end;
    }

    // a final word is not followed by a space
    if !current.is_empty() {
        words.push(WordTimestamp {
            word: current,
            start: word_start,
            end: word_end,
        });
    }

    words
}

/// Map character alignment back onto the source lines.
///
/// Words are consumed in order, `line.split_whitespace().count()` per line
/// after removing `pause_markers` from both sides. Lines left without words
/// collapse onto the previous line's end. Never fails.
pub fn reconstruct_lines(
    alignment: &CharacterAlignment,
    lines: &[String],
    pause_markers: &[String],
) -> Vec<LineTimestamp> {
    let is_marker = |w: &str| pause_markers.iter().any(|m| m == w);

    let words: Vec<WordTimestamp> = words_from_alignment(alignment)
        .into_iter()
        .filter(|w| !is_marker(&w.word))
        .collect();

    let expected: usize = lines
        .iter()
        .map(|l| l.split_whitespace().filter(|w| !is_marker(w)).count())
        .sum();
    if expected != words.len() {
        warn!(
            "Aligned word count {} differs from source word count {}; line boundaries may be shifted",
            words.len(),
            expected
        );
    }

    let mut remaining = words.into_iter();
    let mut previous_end = 0.0_f64;
    let mut result = Vec::with_capacity(lines.len());

    for (index, text) in lines.iter().enumerate() {
        let count = text.split_whitespace().filter(|w| !is_marker(w)).count();
        let line_words: Vec<WordTimestamp> = remaining.by_ref().take(count).collect();

        let (start, end) = match (line_words.first(), line_words.last()) {
            (Some(first), Some(last)) => (first.start, last.end.max(first.start)),
            _ => (previous_end, previous_end),
        };
        previous_end = end;

        result.push(LineTimestamp {
            text: text.clone(),
            index,
            start,
            end,
            words: line_words,
        });
    }

    debug!("Reconstructed {} line timestamps", result.len());
    result
}

/// Voice duration: latest character end, else last line end, else 0
pub fn total_duration(alignment: &CharacterAlignment, lines: &[LineTimestamp]) -> f64 {
    alignment
        .max_end()
        .or_else(|| lines.last().map(|l| l.end))
        .unwrap_or(0.0)
}

/// Reconstructed timing saved next to the voice audio
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transcript {
    pub item_id: String,
    pub duration: f64,
    pub lines: Vec<LineTimestamp>,
}

impl Transcript {
    pub fn from_alignment(
        item_id: impl Into<String>,
        alignment: &CharacterAlignment,
        lines: &[String],
        pause_markers: &[String],
    ) -> Self {
        let lines = reconstruct_lines(alignment, lines, pause_markers);
        let duration = total_duration(alignment, &lines);
        Self {
            item_id: item_id.into(),
            duration,
            lines,
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Planning(format!("cannot encode transcript: {}", e)))?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content)
            .map_err(|e| PipelineError::Planning(format!("invalid transcript {}: {}", path.display(), e)))
    }
}
