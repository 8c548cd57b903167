//! # Voice WebSocket
//!
//! The actix actor that owns one browser socket at `/ws/voice/{client_id}`.
//!
//! ## Data flow:
//! ```text
//! browser ──text frame──▶ VoiceWebSocket ──inbound channel──▶ MessageRouter::run (tokio task)
//! browser ◀──JSON text── VoiceWebSocket ◀──outbound channel── ConnectionRegistry::send
//! ```
//!
//! The actor does no message handling of its own. It forwards raw text frames to the
//! connection's router task, which processes them one at a time, and writes whatever the
//! router sends back. Keeping the model call off the actor means the heartbeat keeps
//! running while a reply is being generated.
//!
//! ## Teardown:
//! - Socket closes or the heartbeat times out: the actor stops, releases the registry
//!   entry and drops the inbound sender, which ends the router task.
//! - Client sends `end_call`: the router task releases the entry, which drops the last
//!   outbound sender, which finishes the outbound stream and stops the actor.

use crate::error::AppError;
use crate::state::AppState;
use crate::voice::{ConnectionHandle, ConnectionRegistry, MessageRouter, ServerMessage};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct VoiceWebSocket {
    client_id: String,

    /// Identifies this socket's registry entry among reconnects with the same client id
    connection_id: Uuid,

    registry: Arc<ConnectionRegistry>,

    router: Arc<MessageRouter>,

    /// Raw frames to the router task. `None` once the actor has stopped.
    inbound_tx: Option<mpsc::UnboundedSender<String>>,

    /// Handed to the router task in `started`
    inbound_rx: Option<mpsc::UnboundedReceiver<String>>,

    /// Added as an actor stream in `started`
    outbound_rx: Option<mpsc::UnboundedReceiver<ServerMessage>>,

    heartbeat_interval: Duration,

    client_timeout: Duration,

    last_heartbeat: Instant,
}

impl VoiceWebSocket {
    pub fn new(
        client_id: String,
        connection_id: Uuid,
        state: &AppState,
        outbound_rx: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Self {
            client_id,
            connection_id,
            registry: state.registry.clone(),
            router: state.router.clone(),
            inbound_tx: Some(inbound_tx),
            inbound_rx: Some(inbound_rx),
            outbound_rx: Some(outbound_rx),
            heartbeat_interval: Duration::from_secs(state.config.websocket.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(state.config.websocket.client_timeout_secs),
            last_heartbeat: Instant::now(),
        }
    }

    /// Ping the client every interval and stop if nothing was heard within the timeout.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(client_id = %act.client_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn forward(&mut self, frame: String, ctx: &mut ws::WebsocketContext<Self>) {
        let delivered = match &self.inbound_tx {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        };

        if !delivered {
            // Router task already finished (end_call); nothing will read further frames
            debug!(client_id = %self.client_id, "Dropping frame after call ended");
            ctx.stop();
        }
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, connection_id = %self.connection_id, "WebSocket connection started");

        self.start_heartbeat(ctx);

        if let Some(outbound_rx) = self.outbound_rx.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound_rx));
        }

        if let Some(inbound_rx) = self.inbound_rx.take() {
            let router = self.router.clone();
            let client_id = self.client_id.clone();
            let connection_id = self.connection_id;
            tokio::spawn(async move {
                let state = router.run(client_id.clone(), connection_id, inbound_rx).await;
                debug!(client_id = %client_id, state = ?state, "Message loop finished");
            });
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Closing the inbound channel ends the router task
        self.inbound_tx = None;
        self.registry.release(&self.client_id, self.connection_id);
        info!(client_id = %self.client_id, "WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.forward(text.to_string(), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                warn!(client_id = %self.client_id, bytes = data.len(), "Ignoring binary frame, audio must be base64 JSON");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(client_id = %self.client_id, "WebSocket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(client_id = %self.client_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(client_id = %self.client_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Outbound messages queued through the registry.
impl StreamHandler<ServerMessage> for VoiceWebSocket {
    fn handle(&mut self, msg: ServerMessage, ctx: &mut Self::Context) {
        match msg.to_json() {
            Ok(json) => ctx.text(json),
            Err(err) => error!(client_id = %self.client_id, error = %err, "Failed to serialize outbound message"),
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(client_id = %self.client_id, "Outbound channel closed");
        ctx.stop();
    }
}

/// `GET /ws/voice/{client_id}`
///
/// Registers the client before the handshake completes so that a duplicate id or a full
/// server is refused with a plain HTTP error. The `connection` greeting is queued first,
/// so it is always the first frame the client receives.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let client_id = path.into_inner();
    info!(
        client_id = %client_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );

    if client_id.trim().is_empty() {
        return Err(AppError::BadRequest("client id must not be empty".to_string()).into());
    }

    let (handle, outbound_rx) = ConnectionHandle::channel();
    let connection_id = handle.id();

    if let Err(err) = state.registry.connect(&client_id, handle) {
        warn!(client_id = %client_id, error = %err, "Refusing WebSocket connection");
        state.record_connection(false);
        return Err(err.into());
    }

    state.registry.send(&client_id, ServerMessage::connected());

    let actor = VoiceWebSocket::new(client_id.clone(), connection_id, &state, outbound_rx);
    match ws::start(actor, &req, stream) {
        Ok(response) => {
            state.record_connection(true);
            Ok(response)
        }
        Err(err) => {
            warn!(client_id = %client_id, error = %err, "WebSocket handshake failed");
            state.registry.release(&client_id, connection_id);
            state.record_connection(false);
            Err(err)
        }
    }
}
