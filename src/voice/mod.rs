//! # Voice Module
//!
//! Everything behind the voice WebSocket that is independent of actix.
//!
//! ## Key Components:
//! - **Messages**: JSON wire format in both directions
//! - **Persona**: Fixed prompts and the persona-to-directive template
//! - **Session**: Per-client persona bootstrap and conversation history
//! - **Registry**: Live connections with their session and audio buffer
//! - **Router**: Per-connection message loop and dispatch

pub mod messages;
pub mod persona;
pub mod registry;
pub mod router;
pub mod session;

pub use messages::{ClientMessage, ServerMessage};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use router::{ConnectionState, Flow, MessageRouter};
pub use session::{ConversationSession, TurnOutcome};
