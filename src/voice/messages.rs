//! Wire format of the voice WebSocket.
//!
//! Every frame is a JSON object with a `type` discriminator. `timestamp` is an opaque
//! client token: it is echoed back untouched, whatever JSON type it has.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent by the browser.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One streamed fragment of the current recording
    AudioChunk {
        #[serde(default)]
        audio: Option<String>,
    },

    /// End of the current recording, optionally carrying the last fragment
    AudioComplete {
        #[serde(default)]
        audio: Option<String>,
        #[serde(default)]
        format: Option<String>,
    },

    /// Whole recording in one message (older clients)
    Audio {
        #[serde(default)]
        audio: Option<String>,
        #[serde(default)]
        format: Option<String>,
    },

    /// A typed message or a browser-side transcription
    Text {
        #[serde(default)]
        text: String,
        #[serde(default)]
        timestamp: Option<Value>,
    },

    Ping {
        #[serde(default)]
        timestamp: Option<Value>,
    },

    EndCall,

    /// Any `type` this server does not know about
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::AudioChunk { .. } => "audio_chunk",
            ClientMessage::AudioComplete { .. } => "audio_complete",
            ClientMessage::Audio { .. } => "audio",
            ClientMessage::Text { .. } => "text",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::EndCall => "end_call",
            ClientMessage::Unknown => "unknown",
        }
    }
}

/// Messages sent to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connection { status: String, message: String },
    Processing { message: String },
    Response { text: String, timestamp: Option<Value> },
    Pong { timestamp: Option<Value> },
    Error { message: String },
}

impl ServerMessage {
    pub fn connected() -> Self {
        ServerMessage::Connection {
            status: "connected".to_string(),
            message: "Voice assistant ready".to_string(),
        }
    }

    pub fn processing() -> Self {
        ServerMessage::Processing { message: "Thinking...".to_string() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
