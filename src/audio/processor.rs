//! # Audio Payload Processing
//!
//! Decodes the base64 audio payloads carried in WebSocket messages and applies the
//! minimum-size policy to completed recordings. Speech recognition itself happens in the
//! browser; by the time a blob reaches this module the only question is whether it holds
//! enough bytes to count as a recording at all.

use crate::error::AppResult;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Container format assumed when a message does not name one.
pub const DEFAULT_AUDIO_FORMAT: &str = "webm";

/// Container formats the browser client is known to produce.
pub const SUPPORTED_FORMATS: [&str; 5] = ["webm", "wav", "mp3", "ogg", "flac"];

/// What happened to a completed recording.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioOutcome {
    /// Blob was big enough and is handed to the external transcriber.
    Accepted { audio: Vec<u8>, format: String },
    /// Blob was below the minimum size and has been dropped.
    Discarded { bytes: usize },
}

impl AudioOutcome {
    pub fn byte_len(&self) -> usize {
        match self {
            AudioOutcome::Accepted { audio, .. } => audio.len(),
            AudioOutcome::Discarded { bytes } => *bytes,
        }
    }
}

/// Decoding and validation for inbound audio.
#[derive(Debug, Clone)]
pub struct AudioProcessor {
    min_audio_bytes: usize,
}

impl AudioProcessor {
    pub fn new(min_audio_bytes: usize) -> Self {
        Self { min_audio_bytes }
    }

    pub fn min_audio_bytes(&self) -> usize {
        self.min_audio_bytes
    }

    /// Decode a transport payload. Empty or missing payloads decode to `None`.
    pub fn decode_payload(&self, payload: Option<&str>) -> AppResult<Option<Vec<u8>>> {
        match payload.map(str::trim) {
            None | Some("") => Ok(None),
            Some(encoded) => Ok(Some(STANDARD.decode(encoded)?)),
        }
    }

    /// Decide whether a combined recording is usable.
    pub fn classify(&self, blob: Vec<u8>, format: Option<&str>) -> AudioOutcome {
        if blob.len() < self.min_audio_bytes {
            return AudioOutcome::Discarded { bytes: blob.len() };
        }

        AudioOutcome::Accepted {
            audio: blob,
            format: normalize_format(format),
        }
    }
}

/// Lower-cased format name, falling back to webm when absent or blank.
pub fn normalize_format(format: Option<&str>) -> String {
    match format.map(str::trim) {
        Some(f) if !f.is_empty() => f.to_ascii_lowercase(),
        _ => DEFAULT_AUDIO_FORMAT.to_string(),
    }
}

pub fn is_supported_format(format: &str) -> bool {
    SUPPORTED_FORMATS.contains(&format)
}
