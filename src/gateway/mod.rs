//! # Realtime Gateway
//!
//! WebSocket endpoint that multiplexes the HTTP API over one persistent connection.
//!
//! ## Connection lifecycle:
//! `Open → Authenticating → Dispatching → Closed`
//!
//! - The first text frame is the credential handshake (`{UserId, Password}`)
//! - Every later text frame is an `{Action, Data}` envelope dispatched to `/api/<Action>`
//! - Replies are text frames: a bare token, `Result: <payload>` or `Error: <message>`
//! - A failed frame never closes the connection; only the client or the transport does
//!
//! ## Key Rust Concepts:
//!
//! ### Actor Model
//! - **Actor**: each connection is an independent actor with its own state
//! - **StreamHandler**: receives the frames of the WebSocket stream one at a time
//! - **`ctx.wait`**: runs the async handling of a frame inside the actor and holds back the
//!   next frame until it is done, so replies come back in request order

pub mod auth;
pub mod dispatch;
pub mod session;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::state::AppState;
use session::{GatewayReply, GatewaySession, INVALID_FORMAT};

/// Protocol-level ping cadence. There is no idle timeout.
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct RealtimeGateway {
    connection_id: Uuid,
    session: Arc<Mutex<GatewaySession>>,
}

impl RealtimeGateway {
    pub fn new(session: GatewaySession) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            session: Arc::new(Mutex::new(session)),
        }
    }

    fn handle_text(&mut self, text: String, ctx: &mut ws::WebsocketContext<Self>) {
        let session = Arc::clone(&self.session);
        let connection_id = self.connection_id;

        let reply = async move {
            let mut session = session.lock().await;
            session.handle_frame(&text).await
        };

        ctx.wait(reply.into_actor(self).map(move |reply, _act, ctx| {
            if let GatewayReply::Error(message) = &reply {
                debug!(connection = %connection_id, "replying with error: {}", message);
            }
            ctx.text(reply.to_frame());
        }));
    }
}

impl Actor for RealtimeGateway {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection = %self.connection_id, "gateway connection opened");

        ctx.run_interval(PING_INTERVAL, |_act, ctx| {
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection = %self.connection_id, "gateway connection closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RealtimeGateway {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(text.to_string(), ctx),
            Ok(ws::Message::Binary(_)) => {
                warn!(connection = %self.connection_id, "binary frame rejected");
                ctx.text(GatewayReply::Error(INVALID_FORMAT.to_string()).to_frame());
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(connection = %self.connection_id, "close frame: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection = %self.connection_id, "unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection = %self.connection_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// `GET /ws`
pub async fn realtime_gateway(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("gateway connection request from {:?}", req.connection_info().peer_addr());

    let session = GatewaySession::new(
        Arc::clone(&state.authenticator),
        Arc::clone(&state.dispatcher),
        state.config.gateway.reject_unauthenticated,
    );
    ws::start(RealtimeGateway::new(session), &req, stream)
}
