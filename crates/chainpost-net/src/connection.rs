//! One persistent WebSocket connection to a node.
//!
//! `open_connection` performs the handshake and hands the socket to a
//! background task. Callers drive it through a cloneable
//! [`ConnectionHandle`] and observe it through a notification receiver,
//! mirroring the command/notification split of a swarm event loop.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use chainpost_shared::Frame;

use crate::error::NetError;

const CHANNEL_CAPACITY: usize = 256;

/// Commands sent to the connection task.
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Transmit a text frame.
    Send(String),
    /// Send a close frame and stop the task.
    Close { code: u16, reason: String },
}

/// Events emitted by the connection task. `Closed` and `Failed` are always
/// the last notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotification {
    /// An inbound text frame, unparsed.
    Frame(String),
    Closed {
        code: Option<u16>,
        reason: String,
        /// `true` when the close was requested through the handle
        locally_initiated: bool,
    },
    /// Socket error while reading or writing.
    Failed(String),
}

impl ConnectionNotification {
    /// Whether this notification ends the connection without the caller
    /// having asked for it.
    pub fn is_unexpected_end(&self) -> bool {
        match self {
            Self::Frame(_) => false,
            Self::Closed {
                locally_initiated, ..
            } => !locally_initiated,
            Self::Failed(_) => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<ConnectionCommand>,
}

impl ConnectionHandle {
    /// Queue a frame without waiting for channel capacity.
    pub fn try_send_frame(&self, frame: &Frame) -> Result<(), NetError> {
        let text = frame.to_text()?;
        self.cmd_tx
            .try_send(ConnectionCommand::Send(text))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => NetError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => NetError::Closed,
            })
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<(), NetError> {
        let text = frame.to_text()?;
        self.cmd_tx
            .send(ConnectionCommand::Send(text))
            .await
            .map_err(|_| NetError::Closed)
    }

    /// Ask the task to close the socket. Closing an already closed
    /// connection is not an error.
    pub async fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(ConnectionCommand::Close {
                code,
                reason: reason.into(),
            })
            .await;
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct NodeConnection {
    pub handle: ConnectionHandle,
    pub notifications: mpsc::Receiver<ConnectionNotification>,
    pub task: JoinHandle<()>,
}

impl NodeConnection {
    pub fn into_parts(
        self,
    ) -> (
        ConnectionHandle,
        mpsc::Receiver<ConnectionNotification>,
        JoinHandle<()>,
    ) {
        (self.handle, self.notifications, self.task)
    }
}

/// Connect to `address` (a `ws://` or `wss://` URL), waiting at most
/// `handshake_timeout` for the upgrade to complete.
pub async fn open_connection(
    address: &str,
    handshake_timeout: Duration,
) -> Result<NodeConnection, NetError> {
    let (stream, _response) =
        tokio::time::timeout(handshake_timeout, tokio_tungstenite::connect_async(address))
            .await
            .map_err(|_| NetError::Timeout(handshake_timeout))?
            .map_err(|e| NetError::Handshake(e.to_string()))?;

    info!(address = %address, "Connected to node");

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ConnectionCommand>(CHANNEL_CAPACITY);
    let (notif_tx, notif_rx) = mpsc::channel::<ConnectionNotification>(CHANNEL_CAPACITY);
    let address = address.to_string();

    let task = tokio::spawn(async move {
        let (mut write, mut read) = stream.split();

        let last = loop {
            tokio::select! {
                // --- Outbound commands ---
                cmd = cmd_rx.recv() => match cmd {
                    Some(ConnectionCommand::Send(text)) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            error!(address = %address, error = %e, "Send failed");
                            break ConnectionNotification::Failed(e.to_string());
                        }
                    }
                    Some(ConnectionCommand::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            debug!(error = %e, "Close frame not delivered");
                        }
                        break ConnectionNotification::Closed {
                            code: Some(code),
                            reason,
                            locally_initiated: true,
                        };
                    }
                    None => {
                        // Every handle dropped
                        let _ = write.send(Message::Close(None)).await;
                        break ConnectionNotification::Closed {
                            code: None,
                            reason: "handle dropped".to_string(),
                            locally_initiated: true,
                        };
                    }
                },

                // --- Inbound frames ---
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = ConnectionNotification::Frame(text.as_str().to_owned());
                        if notif_tx.send(frame).await.is_err() {
                            debug!("Notification receiver dropped, stopping connection task");
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_owned()),
                            None => (None, String::new()),
                        };
                        info!(address = %address, code = ?code, reason = %reason, "Node closed the connection");
                        break ConnectionNotification::Closed {
                            code,
                            reason,
                            locally_initiated: false,
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(address = %address, error = %e, "Connection error");
                        break ConnectionNotification::Failed(e.to_string());
                    }
                    None => {
                        break ConnectionNotification::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                            locally_initiated: false,
                        };
                    }
                },
            }
        };

        let _ = notif_tx.send(last).await;
        debug!(address = %address, "Connection task stopped");
    });

    Ok(NodeConnection {
        handle: ConnectionHandle { cmd_tx },
        notifications: notif_rx,
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainpost_shared::FrameType;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// A node stub that echoes every text frame back, then closes with 1001
    /// when it receives "bye".
    async fn echo_node() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) if text.as_str() == "bye" => {
                        let frame = CloseFrame {
                            code: CloseCode::from(1001),
                            reason: "going away".into(),
                        };
                        let _ = ws.close(Some(frame)).await;
                        break;
                    }
                    Message::Text(text) => {
                        ws.send(Message::Text(text)).await.unwrap();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_frame_roundtrip_through_node() {
        let address = echo_node().await;
        let conn = open_connection(&address, Duration::from_secs(5))
            .await
            .unwrap();
        let (handle, mut notifications, _task) = conn.into_parts();

        handle.send_frame(&Frame::sync_request()).await.unwrap();
        match notifications.recv().await.unwrap() {
            ConnectionNotification::Frame(text) => {
                let frame = Frame::parse(&text).unwrap();
                assert_eq!(frame.frame_type, FrameType::SyncRequest);
                assert!(frame.data.is_empty());
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remote_close_is_unexpected() {
        let address = echo_node().await;
        let (handle, mut notifications, task) = open_connection(&address, Duration::from_secs(5))
            .await
            .unwrap()
            .into_parts();

        handle.cmd_tx.send(ConnectionCommand::Send("bye".into())).await.unwrap();
        let last = notifications.recv().await.unwrap();
        assert!(last.is_unexpected_end());
        assert!(matches!(
            last,
            ConnectionNotification::Closed { code: Some(1001), .. }
        ));
        task.await.unwrap();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_local_close_is_expected() {
        let address = echo_node().await;
        let (handle, mut notifications, task) = open_connection(&address, Duration::from_secs(5))
            .await
            .unwrap()
            .into_parts();

        handle.close(1000, "bye for now").await;
        let last = notifications.recv().await.unwrap();
        assert!(!last.is_unexpected_end());
        task.await.unwrap();
        assert!(matches!(
            handle.try_send_frame(&Frame::sync_request()),
            Err(NetError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = open_connection(&format!("ws://{addr}"), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(NetError::Handshake(_))));
    }
}
