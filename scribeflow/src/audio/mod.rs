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

//! Audio chunking for STT.
//!
//! Splits an uploaded file into STT-sized pieces, preferring cuts at detected
//! silence and falling back to hard cuts with a short overlap so the next
//! chunk does not begin mid-word. Every chunk is normalized to 16 kHz mono
//! 16-bit WAV.

pub mod chunker;

pub use chunker::{plan_chunks, ChunkSpan, FfmpegChunker};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::error::ChunkError;

/// One transcodable piece of the input, ordered by `index`.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    pub path: PathBuf,
}

/// The chunks plus their workspace directory; dropping the set deletes the
/// directory and every chunk in it, regardless of how processing ended.
pub struct ChunkSet {
    pub chunks: Vec<Chunk>,
    _workdir: Option<TempDir>,
}

impl ChunkSet {
    pub fn new(chunks: Vec<Chunk>, workdir: TempDir) -> Self {
        Self {
            chunks,
            _workdir: Some(workdir),
        }
    }

    /// A set over caller-managed paths (tests).
    pub fn unmanaged(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks,
            _workdir: None,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Splits audio files into ordered, STT-ready chunks.
#[async_trait]
pub trait AudioChunker: Send + Sync {
    async fn split(&self, input: &Path, max_chunk_secs: f64) -> Result<ChunkSet, ChunkError>;
}
