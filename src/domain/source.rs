//! The validated media input a run analyzes.
//!
//! Media preparation (transcoding, audio extraction, transcription) happens
//! outside this crate. A `SourceArtifact` is what that collaborator hands
//! over: raw facet bytes plus the metadata the run needs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Frame size of the video track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Immutable source material shared by every task of a run.
///
/// Facet bytes live behind `Arc`s so cloning an artifact into concurrent
/// tasks never copies media.
#[derive(Debug, Clone)]
pub struct SourceArtifact {
    label: String,
    duration_seconds: f64,
    resolution: Resolution,
    video: Arc<[u8]>,
    audio: Option<Arc<[u8]>>,
    transcript: Option<Arc<str>>,
    content_hash: String,
}

impl SourceArtifact {
    /// Create an artifact from its video track
    pub fn new(
        label: impl Into<String>,
        video: Vec<u8>,
        duration_seconds: f64,
        resolution: Resolution,
    ) -> Self {
        let mut artifact = Self {
            label: label.into(),
            duration_seconds,
            resolution,
            video: Arc::from(video),
            audio: None,
            transcript: None,
            content_hash: String::new(),
        };
        artifact.content_hash = artifact.compute_hash();
        artifact
    }

    /// Attach the extracted audio track
    pub fn with_audio(mut self, audio: Vec<u8>) -> Self {
        self.audio = Some(Arc::from(audio));
        self.content_hash = self.compute_hash();
        self
    }

    /// Attach the transcript
    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        self.transcript = Some(Arc::from(transcript.into()));
        self.content_hash = self.compute_hash();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration_seconds
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Size of the uploaded media in bytes
    pub fn size_bytes(&self) -> u64 {
        self.video.len() as u64
    }

    pub fn video(&self) -> &Arc<[u8]> {
        &self.video
    }

    pub fn audio(&self) -> Option<&Arc<[u8]>> {
        self.audio.as_ref()
    }

    pub fn transcript(&self) -> Option<&str> {
        self.transcript.as_deref()
    }

    /// SHA-256 over every facet, hex encoded
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Serializable description of the artifact (no media bytes)
    pub fn summary(&self) -> SourceSummary {
        SourceSummary {
            label: self.label.clone(),
            content_hash: self.content_hash.clone(),
            duration_seconds: self.duration_seconds,
            resolution: self.resolution,
            size_bytes: self.size_bytes(),
            has_audio: self.audio.is_some(),
            transcript_chars: self.transcript.as_ref().map(|t| t.chars().count()),
        }
    }

    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        // Length prefixes keep facet boundaries unambiguous
        hasher.update((self.video.len() as u64).to_le_bytes());
        hasher.update(&self.video);
        match &self.audio {
            Some(audio) => {
                hasher.update([1u8]);
                hasher.update((audio.len() as u64).to_le_bytes());
                hasher.update(audio);
            }
            None => hasher.update([0u8]),
        }
        match &self.transcript {
            Some(text) => {
                hasher.update([1u8]);
                hasher.update((text.len() as u64).to_le_bytes());
                hasher.update(text.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hex::encode(hasher.finalize())
    }
}

/// What a pipeline run records about its source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub label: String,
    pub content_hash: String,
    pub duration_seconds: f64,
    pub resolution: Resolution,
    pub size_bytes: u64,
    pub has_audio: bool,
    pub transcript_chars: Option<usize>,
}
