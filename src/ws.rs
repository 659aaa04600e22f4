//! WebSocket lifecycle (spec.md §4.9) — subscriber accept/close, built on
//! axum's own tungstenite-backed `WebSocketUpgrade` rather than driving
//! `tokio-tungstenite` directly, since axum is already the HTTP framework
//! in play (per SPEC_FULL.md §4.9 expansions).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::SessionAuth;
use crate::idl::{CommitResult, Row};
use crate::routes::AppState;
use crate::value::Value;

pub const SUBSCRIBER_TABLE: &str = "Subscriber";
pub const SUBSCRIPTION_TABLE: &str = "Subscription";

pub async fn notifications_ws(
    _auth: SessionAuth,
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let subscriber_id = match open_subscriber(&state).await {
        Ok(id) => id,
        Err(message) => {
            let _ = socket
                .send(Message::Text(
                    serde_json::json!({"notification_subscriber": {"error": message}}).to_string(),
                ))
                .await;
            let _ = socket.close().await;
            return;
        }
    };

    let _ = socket
        .send(Message::Text(
            serde_json::json!({
                "notification_subscriber": {
                    "resource": format!("/rest/v1/system/notification_subscribers/{subscriber_id}")
                }
            })
            .to_string(),
        ))
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    state.notify.register_sender(subscriber_id, tx);
    info!(%subscriber_id, "notification subscriber connected");

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(message) => {
                        if socket.send(Message::Text(message.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // push-only channel: inbound frames are ignored, per spec.md §4.9
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.notify.unregister_sender(subscriber_id);
    close_subscriber(&state, subscriber_id).await;
    info!(%subscriber_id, "notification subscriber disconnected");
}

/// Generate a collision-checked id, insert a `Subscriber` row, and commit —
/// waiting through `INCOMPLETE` retries via the Connection Manager's tick.
async fn open_subscriber(state: &AppState) -> Result<Uuid, String> {
    let idl = state.cm.idl();
    let mut id = Uuid::new_v4();
    while idl.row(SUBSCRIBER_TABLE, id).is_some() {
        id = Uuid::new_v4();
    }

    let txn = idl.open_transaction();
    let mut values = IndexMap::new();
    values.insert("name".to_owned(), Value::String(id.to_string()));
    values.insert("type".to_owned(), Value::String("ws".to_owned()));
    txn.insert(
        SUBSCRIBER_TABLE,
        Row {
            uuid: id,
            values,
        },
    );
    state.cm.track(txn.clone());

    match txn.wait().await {
        CommitResult::Success => Ok(id),
        _ => Err("failed to register notification subscriber".to_owned()),
    }
}

/// Delete the subscriber row; this cascades to its `Subscription` children
/// via the Write Engine's back-reference delete recursion when routed
/// through a normal DELETE, but the WebSocket lifecycle owns this row
/// directly (spec.md §4.6: "subscribers may only be deleted by the
/// WebSocket lifecycle"), so it deletes both tables itself here.
async fn close_subscriber(state: &AppState, subscriber_id: Uuid) {
    let idl = state.cm.idl();
    let txn = idl.open_transaction();

    for row in idl.rows(SUBSCRIPTION_TABLE) {
        if row.get("subscriber").and_then(|v| v.as_uuid()) == Some(subscriber_id) {
            txn.delete(SUBSCRIPTION_TABLE, row.uuid);
        }
    }
    txn.delete(SUBSCRIBER_TABLE, subscriber_id);

    state.cm.track(txn.clone());
    if !matches!(txn.wait().await, CommitResult::Success) {
        warn!(%subscriber_id, "failed to clean up notification subscriber on close");
    }
}
