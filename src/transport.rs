//! Transport Channel
//!
//! One duplex connection to the backend live stream per session. The reader
//! task decodes inbound text frames and forwards them to the owner in
//! emission order; the writer task drains an outbound queue into the sink.
//! Close is deterministic and idempotent, and `Closed` is emitted exactly
//! once, after which no further messages follow.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("not connected")]
    NotConnected,
    #[error("send queue closed")]
    ChannelClosed,
}

/// Connection lifecycle as observed by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Events emitted to the owner of the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One decoded inbound frame, in backend emission order.
    Message(Value),
    /// The connection is no longer usable; any in-flight turn is over.
    Closed(String),
}

/// Handle to a live connection. Dropping the handle closes the connection.
pub struct Transport {
    outbound: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
}

impl Transport {
    /// Establish the connection and hand back the inbound event stream.
    /// The caller must tear down any previous connection first; a session
    /// owns at most one live channel at a time.
    pub async fn connect(
        url: &str,
    ) -> Result<(Transport, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(url = %url, "Connected to live stream");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let connected = Arc::new(AtomicBool::new(true));

        let writer_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "Send failed, connection gone");
                    break;
                }
                if is_close {
                    let _ = sink.flush().await;
                    break;
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
        });

        let reader_connected = connected.clone();
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            if event_tx.send(TransportEvent::Message(value)).is_err() {
                                break "receiver dropped".to_string();
                            }
                        }
                        Err(e) => warn!(error = %e, "Malformed inbound frame dropped"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    // pings are answered by the protocol layer, binary is
                    // not part of the wire format
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break e.to_string(),
                    None => break "connection closed".to_string(),
                }
            };
            reader_connected.store(false, Ordering::SeqCst);
            debug!(reason = %reason, "Live stream ended");
            let _ = event_tx.send(TransportEvent::Closed(reason));
        });

        Ok((
            Transport {
                outbound: out_tx,
                connected,
            },
            event_rx,
        ))
    }

    /// Enqueue one outbound frame on the open connection.
    pub fn send(&self, value: &Value) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(Message::Text(value.to_string()))
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Release the connection. Safe to call multiple times; only the first
    /// call has any effect.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("Closing live connection");
            let _ = self.outbound.send(Message::Close(None));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Minimal live-stream stand-in: accepts one connection, sends the given
    /// frames, then waits for the peer to close.
    async fn spawn_server(frames: Vec<String>) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for frame in frames {
                ws.send(Message::Text(frame)).await.unwrap();
            }
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        });
        (format!("ws://{addr}"), handle)
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (url, server) = spawn_server(vec![
            json!({"type": "model", "message": "a"}).to_string(),
            json!({"type": "model", "message": "b"}).to_string(),
        ])
        .await;

        let (transport, mut events) = Transport::connect(&url).await.unwrap();
        assert!(transport.is_connected());

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(
            first,
            TransportEvent::Message(json!({"type": "model", "message": "a"}))
        );
        assert_eq!(
            second,
            TransportEvent::Message(json!({"type": "model", "message": "b"}))
        );

        transport.close();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_json_is_dropped() {
        let (url, server) = spawn_server(vec![
            "{not json".to_string(),
            json!({"type": "model", "message": "ok"}).to_string(),
        ])
        .await;

        let (transport, mut events) = Transport::connect(&url).await.unwrap();
        let first = events.recv().await.unwrap();
        assert_eq!(
            first,
            TransportEvent::Message(json!({"type": "model", "message": "ok"}))
        );

        transport.close();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (url, server) = spawn_server(vec![]).await;
        let (transport, mut events) = Transport::connect(&url).await.unwrap();

        transport.close();
        transport.close();
        assert!(!transport.is_connected());
        assert!(matches!(transport.send(&json!({})), Err(TransportError::NotConnected)));

        // exactly one Closed event, then the stream ends
        let closed = events.recv().await.unwrap();
        assert!(matches!(closed, TransportEvent::Closed(_)));
        assert_eq!(events.recv().await, None);

        server.await.unwrap();
    }
}
