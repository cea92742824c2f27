//! Websocket transport for preview sessions.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::models::{is_valid_tree_name, PreviewMessage};
use crate::preview::{PreviewSession, SessionError};

pub async fn preview_socket(
    State(state): State<AppState>,
    Path(tree): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if !is_valid_tree_name(&tree) {
        return (StatusCode::BAD_REQUEST, format!("Invalid tree name: {tree:?}")).into_response();
    }

    let session = PreviewSession::open(tree, &state.built_root, state.db.clone(), &state.bus);
    ws.on_upgrade(move |socket| stream_preview(socket, session))
}

async fn stream_preview(socket: WebSocket, mut session: PreviewSession) {
    let (mut sender, mut receiver) = socket.split();

    // Clients never send anything meaningful; watch the read half only to
    // notice the connection going away.
    let disconnected = CancellationToken::new();
    let reader = {
        let disconnected = disconnected.clone();
        tokio::spawn(async move {
            while let Some(Ok(message)) = receiver.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
            disconnected.cancel();
        })
    };

    match session.initial().await {
        Ok(message) => {
            if send(&mut sender, &message).await.is_ok() {
                loop {
                    tokio::select! {
                        _ = disconnected.cancelled() => break,
                        update = session.next() => {
                            match update {
                                Ok(message) => {
                                    if send(&mut sender, &message).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    close_with_error(&mut sender, &e).await;
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
        Err(e) => close_with_error(&mut sender, &e).await,
    }

    reader.abort();
    session.close();
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &PreviewMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).map_err(axum::Error::new)?;
    sender.send(Message::Text(text.into())).await
}

/// Tell the client why updates stopped instead of going silent.
async fn close_with_error(sender: &mut SplitSink<WebSocket, Message>, error: &SessionError) {
    tracing::warn!("Closing preview connection: {}", error);
    let frame = CloseFrame {
        code: close_code::ERROR,
        reason: error.to_string().into(),
    };
    if let Err(e) = sender.send(Message::Close(Some(frame))).await {
        tracing::debug!("Failed to send close frame: {}", e);
    }
}
