//! Transport sessions
//!
//! The connection manager talks to the server through a pair of text-frame
//! channels. [`TungsteniteConnector`] backs them with a real websocket; tests
//! plug in their own [`Connector`].

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ClientError;

/// One open connection, as seen by the manager.
///
/// Dropping `outbound` closes the connection; `inbound` yields `None` once
/// the server side is gone.
pub struct TransportSession {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Opens transport sessions
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<TransportSession, ClientError>>;
}

/// Websocket connector over tokio-tungstenite
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    buffer: usize,
}

impl TungsteniteConnector {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Connector for TungsteniteConnector {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<TransportSession, ClientError>> {
        let buffer = self.buffer;
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            let (mut write, mut read) = ws_stream.split();

            let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(buffer);
            let (inbound_tx, inbound_rx) = mpsc::channel::<String>(buffer);

            tokio::spawn(async move {
                while let Some(text) = outbound_rx.recv().await {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        tracing::debug!(err = %e, "websocket write failed");
                        return;
                    }
                }
                let _ = write.send(Message::Close(None)).await;
            });

            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            if inbound_tx.send(text.to_string()).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => {
                            tracing::debug!("websocket closed by server");
                            break;
                        }
                        Err(e) => {
                            tracing::debug!(err = %e, "websocket read failed");
                            break;
                        }
                        _ => {} // ping/pong/binary ignored
                    }
                }
            });

            Ok(TransportSession {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}
