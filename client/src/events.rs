use crate::{Error, Result};
use futures_util::{Stream as FutStream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Stream of JSON messages from the WebSocket connection
pub struct Stream<T: DeserializeOwned + Send + 'static> {
    receiver: mpsc::Receiver<Result<T>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl<T: DeserializeOwned + Send + 'static> Drop for Stream<T> {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

impl<T: DeserializeOwned + Send + 'static> Stream<T> {
    pub(crate) fn new_with_capacity<S>(mut ws: WebSocketStream<S>, capacity: usize) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = if capacity == 0 {
            DEFAULT_CHANNEL_CAPACITY
        } else {
            capacity
        };
        let (tx, rx) = mpsc::channel(capacity);

        let handle = tokio::spawn(async move {
            while let Some(msg) = ws.next().await {
                let decoded = match msg {
                    Ok(Message::Text(text)) => {
                        debug!("Received text message: {} bytes", text.len());
                        serde_json::from_str::<T>(&text)
                    }
                    Ok(Message::Binary(data)) => {
                        debug!("Received binary message: {} bytes", data.len());
                        serde_json::from_slice::<T>(&data)
                    }
                    Ok(Message::Close(_)) => {
                        debug!("WebSocket closed");
                        let _ = tx.send(Err(Error::ConnectionClosed)).await;
                        break;
                    }
                    Ok(_) => continue, // Ignore other message types
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                };
                let item = decoded.map_err(|e| {
                    error!("Failed to decode update: {}", e);
                    Error::InvalidData(e)
                });
                if tx.send(item).await.is_err() {
                    break; // Receiver dropped
                }
            }
        });

        Self {
            receiver: rx,
            _handle: handle,
        }
    }

    /// Receive the next message from the stream
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.receiver.recv().await
    }
}

impl<T: DeserializeOwned + Send + 'static> FutStream for Stream<T> {
    type Item = Result<T>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
