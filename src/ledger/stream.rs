//! Ledger Streaming Driver
//!
//! WebSocket transport for the two streaming reads of the port: the finite
//! bootstrap stream of active contracts at a snapshot offset, and the
//! infinite live-update subscription. Both exist to bypass the 200-element
//! REST page cap.
//!
//! Wire protocol: the client sends one JSON subscribe frame, then the server
//! pushes frames of the form `{"events": [...], "offset": "..."}`. A frame
//! carrying only an `offset` marks the end of a snapshot. Heartbeat frames
//! are ignored.

use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::codec;
use super::{ActiveContract, LedgerError, LedgerUpdate, Offset, TemplateId};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const STREAM_BUFFER: usize = 256;

async fn connect(url: &str, token: &str) -> Result<WsStream, LedgerError> {
    let mut request = url
        .into_client_request()
        .map_err(LedgerError::transport)?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| LedgerError::Configuration("Token is not a valid header value".into()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (ws, _) = connect_async(request).await.map_err(LedgerError::transport)?;
    Ok(ws)
}

fn template_names(templates: &[TemplateId]) -> Vec<&'static str> {
    templates.iter().map(|t| t.qualified_name()).collect()
}

/// Open the finite bootstrap stream of contracts active at `offset`.
/// The stream completes when the server sends the snapshot boundary frame
/// or closes the socket.
pub(crate) async fn open_snapshot_stream(
    ws_url: &str,
    token: &str,
    offset: &Offset,
    templates: &[TemplateId],
) -> Result<BoxStream<'static, Result<ActiveContract, LedgerError>>, LedgerError> {
    let url = format!("{}/v1/stream/active-contracts", ws_url);
    let ws = connect(&url, token).await?;
    let (mut write, mut read) = ws.split();

    let subscribe = json!({
        "activeAtOffset": offset.as_str(),
        "templateIds": template_names(templates),
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .map_err(LedgerError::transport)?;

    let (mut tx, rx) = mpsc::channel::<Result<ActiveContract, LedgerError>>(STREAM_BUFFER);
    tokio::spawn(async move {
        // Hold the write half so the socket stays open while draining
        let _write = write;
        while let Some(frame) = read.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    let _ = tx.send(Err(LedgerError::transport(e))).await;
                    break;
                }
            };

            let value: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    let _ = tx.send(Err(LedgerError::from(e))).await;
                    break;
                }
            };

            // A bare offset frame is the snapshot boundary
            if value.get("events").is_none() {
                if value.get("offset").is_some() {
                    debug!("Snapshot stream complete");
                    break;
                }
                continue;
            }

            if let Some(events) = value.get("events").and_then(Value::as_array) {
                for entry in events {
                    match codec::normalize_contract(entry) {
                        Ok(Some(contract)) => {
                            if tx.send(Ok(contract)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Skipping unparseable snapshot entry: {}", e),
                    }
                }
            }
        }
    });

    Ok(rx.boxed())
}

/// Open the infinite live-update subscription from `from_offset` (exclusive).
/// The stream ends only when the server closes the socket or on a transport
/// error; the consumer re-subscribes with a fresh token.
pub(crate) async fn open_update_stream(
    ws_url: &str,
    token: &str,
    from_offset: &Offset,
    templates: &[TemplateId],
) -> Result<BoxStream<'static, Result<LedgerUpdate, LedgerError>>, LedgerError> {
    let url = format!("{}/v1/stream/updates", ws_url);
    let ws = connect(&url, token).await?;
    let (mut write, mut read) = ws.split();

    let subscribe = json!({
        "fromOffset": from_offset.as_str(),
        "templateIds": template_names(templates),
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .map_err(LedgerError::transport)?;

    let (mut tx, rx) = mpsc::channel::<Result<LedgerUpdate, LedgerError>>(STREAM_BUFFER);
    tokio::spawn(async move {
        let _write = write;
        while let Some(frame) = read.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    let _ = tx.send(Err(LedgerError::transport(e))).await;
                    break;
                }
            };

            let value: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    let _ = tx.send(Err(LedgerError::from(e))).await;
                    break;
                }
            };

            for update in parse_update_frame(&value) {
                if tx.send(Ok(update)).await.is_err() {
                    return;
                }
            }
        }
    });

    Ok(rx.boxed())
}

/// Flatten one live frame into updates, attaching the frame offset to each
fn parse_update_frame(frame: &Value) -> Vec<LedgerUpdate> {
    let offset = match frame.get("offset").and_then(Value::as_str) {
        Some(o) => Offset(o.to_string()),
        // Heartbeats and malformed frames carry no offset; nothing to apply
        None => return Vec::new(),
    };

    let events = match frame.get("events").and_then(Value::as_array) {
        Some(events) => events,
        None => return Vec::new(),
    };

    let mut updates = Vec::with_capacity(events.len());
    for event in events {
        if let Some(raw) = event.get("created") {
            match codec::normalize_contract(raw) {
                Ok(Some(contract)) => updates.push(LedgerUpdate::Created {
                    contract,
                    offset: offset.clone(),
                }),
                Ok(None) => {}
                Err(e) => warn!("Skipping unparseable created event: {}", e),
            }
        } else if let Some(raw) = event.get("archived") {
            let contract_id = raw.get("contractId").and_then(Value::as_str);
            let template_id = raw
                .get("templateId")
                .and_then(Value::as_str)
                .and_then(codec::parse_template_id);
            if let (Some(contract_id), Some(template_id)) = (contract_id, template_id) {
                updates.push(LedgerUpdate::Archived {
                    contract_id: contract_id.to_string(),
                    template_id,
                    offset: offset.clone(),
                });
            }
        }
    }
    updates
}
