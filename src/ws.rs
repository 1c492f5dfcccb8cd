// src/ws.rs
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::RpcError;
use crate::rpc::PendingTable;
use crate::types::RpcResponse;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens the socket and spawns its reader and writer tasks.
///
/// Frames queued on the returned sender are written in order. Responses are
/// routed through `pending`; when the socket goes away the table is closed
/// so every waiter wakes up.
pub async fn open(
    uri: &str,
    pending: Arc<Mutex<PendingTable>>,
) -> Result<mpsc::UnboundedSender<String>, RpcError> {
    let (stream, _) = connect_async(uri)
        .await
        .map_err(|source| RpcError::Connection {
            uri: uri.to_string(),
            source,
        })?;

    let (ws_tx, ws_rx) = stream.split();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(write_frames(ws_tx, frame_rx));
    tokio::spawn(read_frames(ws_rx, pending));

    Ok(frame_tx)
}

async fn write_frames(
    mut ws_tx: SplitSink<WsStream, Message>,
    mut frame_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(frame) = frame_rx.recv().await {
        debug!("-> {}", frame);
        if let Err(err) = ws_tx.send(Message::Text(frame)).await {
            warn!("Failed to send RPC frame: {}", err);
            break;
        }
    }
    // Client dropped or socket broken
    let _ = ws_tx.close().await;
}

async fn read_frames(mut ws_rx: SplitStream<WsStream>, pending: Arc<Mutex<PendingTable>>) {
    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(err) => {
                    warn!("Discarding non UTF-8 frame: {}", err);
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                debug!("Server closed the connection: {:?}", frame);
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!("RPC connection error: {}", err);
                break;
            }
        };

        debug!("<- {}", text);
        // Some servers terminate frames with NUL like their raw TCP API
        match serde_json::from_str::<RpcResponse>(text.trim_end_matches('\0')) {
            Ok(response) => pending.lock().await.resolve(response),
            Err(err) => warn!("Discarding malformed RPC frame: {}", err),
        }
    }

    pending.lock().await.close();
}
