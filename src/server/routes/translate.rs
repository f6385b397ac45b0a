//! Translation endpoints: the streaming WebSocket and the one-shot REST path

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use tracing::{debug, error, info, warn};

use super::ApiError;
use crate::api::{ServerMessage, TranslateResponse, TranslationRequest};
use crate::error::Error;
use crate::server::orchestrator::TranslationOrchestrator;
use crate::server::state::ServerState;

pub fn create_router() -> Router<ServerState> {
    Router::new()
        .route("/ws/translate", get(ws_translate))
        .route("/api/translate", post(translate))
}

/// Upgrade to the streaming translation socket
pub async fn ws_translate(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(message: ServerMessage) -> Result<Message, Error> {
    Ok(Message::Text(serde_json::to_string(&message)?))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (sender, receiver) = socket.split();
    serve_socket(TranslationOrchestrator::from_state(&state), receiver, sender).await;
}

/// Serve requests on one socket until the client closes it or the
/// transport fails. One translation is in flight at a time; the next frame
/// is read only after the previous request's terminal frame. A transport
/// fault closes the socket with code 1011.
pub async fn serve_socket<St, Si, E>(orchestrator: TranslationOrchestrator, mut receiver: St, sender: Si)
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut sink = sender
        .sink_map_err(|e| Error::Transport(e.to_string()))
        .with(|message: ServerMessage| future::ready(encode(message)));
    info!("WebSocket connection opened");

    while let Some(frame) = receiver.next().await {
        let outcome = match frame {
            Ok(Message::Text(text)) => orchestrator.handle_frame(&text, &mut sink).await,
            Ok(Message::Binary(_)) => {
                let err = Error::Validation("Binary frames are not supported".to_string());
                sink.send(ServerMessage::error(&err)).await
            }
            Ok(Message::Close(_)) => break,
            // Pings are answered by axum
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Ok(()),
            Err(e) => {
                debug!("WebSocket receive failed: {}", e);
                break;
            }
        };

        if let Err(e) = outcome {
            error!("Closing WebSocket after transport fault: {}", e);
            let close = Message::Close(Some(CloseFrame {
                code: close_code::ERROR,
                reason: "internal error".into(),
            }));
            if let Err(e) = sink.get_mut().send(close).await {
                debug!("Could not send close frame: {}", e);
            }
            return;
        }
    }

    info!("WebSocket connection closed");
}

/// Non-streaming translation
pub async fn translate(
    State(state): State<ServerState>,
    Json(request): Json<TranslationRequest>,
) -> Result<Json<TranslateResponse>, ApiError> {
    let orchestrator = TranslationOrchestrator::from_state(&state);
    match orchestrator.translate(&request).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            warn!("Translation failed: {}", e);
            Err(e.into())
        }
    }
}
