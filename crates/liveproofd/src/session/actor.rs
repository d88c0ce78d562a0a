use axum::extract::ws::{Message, WebSocket};
use tokio::time::Instant;

use super::{SessionDeps, SessionMachine};

/// Drive one WebSocket connection until either side closes it.
///
/// Inbound messages, the current challenge deadline and the session expiry
/// are the only inputs. All of them are handled in this single loop, so the
/// machine never sees two inputs at once.
pub async fn run(mut socket: WebSocket, deps: SessionDeps) {
    let mut machine = SessionMachine::new(deps);

    loop {
        let deadline = machine.deadline();
        let expiry = machine.expiry();
        let step = tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => machine.handle_text(&text).await,
                Some(Ok(Message::Binary(data))) => machine.handle_binary(&data).await,
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                    continue;
                }
                Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "websocket receive failed");
                    break;
                }
            },
            _ = wait_until(deadline.as_ref().map(|(_, at)| *at)) => {
                match deadline {
                    Some((id, _)) => machine.on_deadline(&id).await,
                    None => continue,
                }
            }
            _ = wait_until(expiry) => machine.on_expired().await,
        };

        let mut delivered = true;
        for msg in step.outbound {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode server message");
                    continue;
                }
            };
            if socket.send(Message::Text(json)).await.is_err() {
                delivered = false;
                break;
            }
        }
        if !delivered {
            break;
        }
        if step.close {
            let _ = socket.send(Message::Close(None)).await;
            break;
        }
    }

    machine.on_disconnect().await;
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
