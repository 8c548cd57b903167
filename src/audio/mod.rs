//! # Audio Module
//!
//! Buffering and payload handling for audio streamed over the voice WebSocket.
//!
//! ## Key Components:
//! - **Audio Buffer**: Ordered per-client fragment accumulator with atomic flush
//! - **Audio Processor**: Base64 decoding and the minimum-size policy
//!
//! Transcription is not done here. The browser runs speech recognition and sends the
//! resulting text as an ordinary `text` message.

pub mod buffer;       // Per-client fragment accumulator
pub mod processor;    // Payload decoding and size policy

pub use buffer::AudioBuffer;
pub use processor::{AudioOutcome, AudioProcessor};
