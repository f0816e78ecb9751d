//! WebSocket connector.

use std::borrow::Cow;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};

use crate::{
    TransportError,
    connection::{Connection, Connector, Frame},
};

/// Connector opening `ws://` and `wss://` connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(format!("{url}: {e}")))?;

        let (mut sender, mut receiver) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Frame>();

        // Forward outbound frames to the socket
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    Frame::Text(text) => {
                        if let Err(e) = sender.send(Message::Text(text)).await {
                            tracing::debug!("WebSocket send failed: {e}");
                            break;
                        }
                    }
                    Frame::Close { code, reason } => {
                        let close = CloseFrame {
                            code: CloseCode::from(code),
                            reason: Cow::Owned(reason),
                        };
                        let _ = sender.send(Message::Close(Some(close))).await;
                        break;
                    }
                }
            }
            let _ = sender.close().await;
        });

        // Forward socket messages inbound; dropping the sender signals closure
        tokio::spawn(async move {
            while let Some(msg) = receiver.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => Frame::Text(text),
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(s) => Frame::Text(s),
                        Err(_) => continue,
                    },
                    Ok(Message::Close(close)) => {
                        let (code, reason) = close.map_or((1005, String::new()), |c| {
                            (u16::from(c.code), c.reason.into_owned())
                        });
                        let _ = inbound_tx.send(Frame::Close { code, reason });
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!("WebSocket error: {e}");
                        break;
                    }
                };
                if inbound_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        Ok(Connection { outbound, inbound })
    }
}
