/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! ffmpeg-backed chunker.
//!
//! Planning is a pure function over (duration, silence midpoints, max chunk
//! length); transcoding shells out to ffmpeg/ffprobe. Small inputs skip
//! planning entirely: anything whose normalized form (16 kHz mono s16le PCM)
//! projects under 1 MiB is transcoded whole as a single chunk.

use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ChunkError;

use super::{AudioChunker, Chunk, ChunkSet};

/// Hard-cut overlap so the next chunk does not begin mid-word.
const OVERLAP_SECS: f64 = 1.5;
/// A silence point only counts as a clean cut when it lies within this many
/// seconds before the tentative end.
const SILENCE_SEARCH_WINDOW_SECS: f64 = 10.0;
/// Remainders shorter than this are absorbed into the current chunk.
const MIN_TAIL_SECS: f64 = 5.0;
/// silencedetect threshold and minimum silence length.
const SILENCE_FILTER: &str = "silencedetect=noise=-30dB:d=0.5";
/// 16 kHz mono 16-bit PCM.
const NORMALIZED_BYTES_PER_SEC: f64 = 32_000.0;
/// Inputs whose projected normalized size is under this go out as one chunk.
const SINGLE_CHUNK_MAX_BYTES: f64 = 1024.0 * 1024.0;

/// One planned cut: `[start, end)` seconds. `clean_cut` means the boundary
/// landed on silence (or the end of the file) and the next chunk needs no
/// overlap.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    pub index: usize,
    pub start: f64,
    pub end: f64,
    pub clean_cut: bool,
}

/// Plans chunk boundaries over the full duration.
///
/// The spans cover `[0, duration)`; overlaps occur only after hard cuts, and
/// no chunk exceeds `max_chunk` plus the absorbed-tail leniency.
pub fn plan_chunks(duration: f64, silences: &[f64], max_chunk: f64) -> Vec<ChunkSpan> {
    let mut spans = Vec::new();
    if duration <= 0.0 || max_chunk <= 0.0 {
        return spans;
    }

    let mut start = 0.0_f64;
    let mut index = 0usize;

    while start < duration {
        let tentative_end = (start + max_chunk).min(duration);

        let mut end = tentative_end;
        let mut clean_cut = tentative_end >= duration;

        if tentative_end < duration {
            // Latest silence midpoint in (start, tentative_end], close enough
            // to the tentative end to keep chunks near their target length.
            let best = silences
                .iter()
                .copied()
                .filter(|&s| s > start && s <= tentative_end)
                .filter(|&s| tentative_end - s <= SILENCE_SEARCH_WINDOW_SECS)
                .fold(None::<f64>, |acc, s| match acc {
                    Some(prev) if prev >= s => Some(prev),
                    _ => Some(s),
                });
            if let Some(silence) = best {
                end = silence;
                clean_cut = true;
            }
        }

        // Absorb a short remainder instead of emitting a stub chunk.
        if end < duration && duration - end < MIN_TAIL_SECS {
            end = duration;
            clean_cut = true;
        }

        spans.push(ChunkSpan {
            index,
            start,
            end,
            clean_cut,
        });
        index += 1;

        let next = if clean_cut { end } else { end - OVERLAP_SECS };
        // The overlap must never move the cursor backwards past the chunk we
        // just emitted.
        start = if next > start { next } else { end };
    }

    spans
}

/// Chunker shelling out to ffmpeg and ffprobe.
#[derive(Debug, Clone, Default)]
pub struct FfmpegChunker;

impl FfmpegChunker {
    pub fn new() -> Self {
        Self
    }

    async fn probe_duration(&self, input: &Path) -> Result<f64, ChunkError> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input)
            .output()
            .await
            .map_err(|e| ChunkError::Probe(e.to_string()))?;

        if !output.status.success() {
            return Err(ChunkError::Probe(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .map_err(|e| ChunkError::Probe(format!("unparseable duration: {}", e)))
    }

    /// Runs silencedetect and returns the midpoint of each silence interval.
    async fn silence_midpoints(&self, input: &Path) -> Result<Vec<f64>, ChunkError> {
        let output = Command::new("ffmpeg")
            .arg("-i")
            .arg(input)
            .args(["-af", SILENCE_FILTER, "-f", "null", "-"])
            .output()
            .await
            .map_err(|e| ChunkError::Transcode(e.to_string()))?;

        // silencedetect reports on stderr even on success.
        let stderr = String::from_utf8_lossy(&output.stderr);
        let re_start = Regex::new(r"silence_start: ([\d.]+)")
            .map_err(|e| ChunkError::Transcode(e.to_string()))?;
        let re_end = Regex::new(r"silence_end: ([\d.]+)")
            .map_err(|e| ChunkError::Transcode(e.to_string()))?;

        let mut midpoints = Vec::new();
        let mut last_start: Option<f64> = None;
        for line in stderr.lines() {
            if let Some(caps) = re_start.captures(line) {
                last_start = caps[1].parse::<f64>().ok();
            } else if let Some(caps) = re_end.captures(line) {
                if let (Some(start), Ok(end)) = (last_start, caps[1].parse::<f64>()) {
                    midpoints.push((start + end) / 2.0);
                }
            }
        }
        Ok(midpoints)
    }

    /// Transcodes `[start, start+len)` (or the whole file when `span` is
    /// `None`) to 16 kHz mono 16-bit WAV.
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        span: Option<(f64, f64)>,
    ) -> Result<(), ChunkError> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y");
        if let Some((start, len)) = span {
            cmd.args(["-ss", &format!("{:.3}", start), "-t", &format!("{:.3}", len)]);
        }
        cmd.arg("-i")
            .arg(input)
            .args(["-ar", "16000", "-ac", "1"])
            .arg(output);

        let result = cmd
            .output()
            .await
            .map_err(|e| ChunkError::Transcode(e.to_string()))?;
        if !result.status.success() {
            return Err(ChunkError::Transcode(
                String::from_utf8_lossy(&result.stderr).into_owned(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AudioChunker for FfmpegChunker {
    async fn split(&self, input: &Path, max_chunk_secs: f64) -> Result<ChunkSet, ChunkError> {
        let parent = input.parent().unwrap_or_else(|| Path::new("."));
        let workdir = tempfile::Builder::new()
            .prefix("chunks-")
            .tempdir_in(parent)
            .map_err(|e| ChunkError::Io(e.to_string()))?;

        let duration = self.probe_duration(input).await?;

        // Small inputs: normalize whole, no planning.
        if duration * NORMALIZED_BYTES_PER_SEC < SINGLE_CHUNK_MAX_BYTES {
            let path = workdir.path().join("chunk_0.wav");
            self.transcode(input, &path, None).await?;
            debug!(duration, "Input below single-chunk threshold");
            return Ok(ChunkSet::new(vec![Chunk { index: 0, path }], workdir));
        }

        let silences = match self.silence_midpoints(input).await {
            Ok(points) => points,
            Err(e) => {
                // Degrade to pure hard cutting with overlap.
                warn!("Silence detection failed, using hard cuts: {}", e);
                Vec::new()
            }
        };

        let spans = plan_chunks(duration, &silences, max_chunk_secs);
        debug!(
            duration,
            chunks = spans.len(),
            silences = silences.len(),
            "Planned audio chunks"
        );

        let mut chunks = Vec::with_capacity(spans.len());
        for span in &spans {
            let path = workdir.path().join(format!("chunk_{}.wav", span.index));
            self.transcode(input, &path, Some((span.start, span.end - span.start)))
                .await?;
            chunks.push(Chunk {
                index: span.index,
                path,
            });
        }

        Ok(ChunkSet::new(chunks, workdir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covers(spans: &[ChunkSpan], duration: f64) {
        assert!((spans.first().unwrap().start - 0.0).abs() < f64::EPSILON);
        assert!((spans.last().unwrap().end - duration).abs() < 1e-9);
        for pair in spans.windows(2) {
            // No gaps: each chunk starts at or before the previous end.
            assert!(pair[1].start <= pair[0].end);
        }
    }

    #[test]
    fn single_span_when_duration_fits() {
        let spans = plan_chunks(20.0, &[], 30.0);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 0.0);
        assert_eq!(spans[0].end, 20.0);
        assert!(spans[0].clean_cut);
    }

    #[test]
    fn hard_cuts_overlap_by_1500ms() {
        let spans = plan_chunks(90.0, &[], 30.0);
        covers(&spans, 90.0);
        assert!(!spans[0].clean_cut);
        assert_eq!(spans[0].end, 30.0);
        // Overlap after a hard cut.
        assert!((spans[1].start - 28.5).abs() < 1e-9);
    }

    #[test]
    fn clean_cut_prefers_latest_silence_in_window() {
        // Two candidates inside (0, 30]; the later one wins.
        let spans = plan_chunks(90.0, &[22.0, 27.0], 30.0);
        assert_eq!(spans[0].end, 27.0);
        assert!(spans[0].clean_cut);
        // Clean cut: no overlap.
        assert!((spans[1].start - 27.0).abs() < 1e-9);
    }

    #[test]
    fn silence_outside_window_is_ignored() {
        // 15.0 is 15s before the tentative end of 30.0, beyond the 10s window.
        let spans = plan_chunks(90.0, &[15.0], 30.0);
        assert_eq!(spans[0].end, 30.0);
        assert!(!spans[0].clean_cut);
    }

    #[test]
    fn short_tail_is_absorbed() {
        // 62s with 30s chunks: the 2s remainder after the second cut folds in.
        let spans = plan_chunks(62.0, &[30.0, 60.0], 30.0);
        covers(&spans, 62.0);
        let last = spans.last().unwrap();
        assert!((last.end - 62.0).abs() < 1e-9);
        assert!(spans.iter().all(|s| s.end - s.start >= MIN_TAIL_SECS || spans.len() == 1));
    }

    #[test]
    fn no_chunk_exceeds_max_plus_leniency() {
        let spans = plan_chunks(305.0, &[31.0, 95.0, 150.0], 30.0);
        covers(&spans, 305.0);
        for span in &spans {
            assert!(span.end - span.start <= 30.0 + MIN_TAIL_SECS + 1e-9);
        }
    }

    #[test]
    fn empty_input_plans_nothing() {
        assert!(plan_chunks(0.0, &[], 30.0).is_empty());
    }
}
