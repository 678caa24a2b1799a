use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::{CmdletError, Result};
use crate::session::{Pty, Session, SessionContext, SessionStreams, WindowSize};

/// Control frames carried as text messages alongside the binary byte stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlFrame {
    Resize { cols: u16, rows: u16 },
}

/// Session over an HTTP/WebSocket connection.
///
/// Binary messages carry the byte stream in both directions; text messages
/// carry JSON control frames (resize inbound, exit outbound). The protocol
/// has no separate error stream, so stderr merges into the same outbound
/// binary channel. Agent forwarding is not supported on this transport.
pub struct WsSession {
    context: SessionContext,
    remote_addr: String,
    environ: Vec<(String, String)>,
    pty: Option<Pty>,
    streams: Option<SessionStreams>,
    resize_rx: Option<mpsc::UnboundedReceiver<WindowSize>>,
    outbound_tx: mpsc::UnboundedSender<Message>,
}

impl WsSession {
    pub fn new<S>(
        ws: WebSocketStream<S>,
        context: SessionContext,
        remote_addr: impl Into<String>,
        environ: Vec<(String, String)>,
        pty: Option<Pty>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (mut stdin_wr, stdin_rd) = tokio::io::duplex(8 * 1024);
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();

        // Outbound pump: engine output and control frames onto the socket.
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Inbound pump: binary messages become session stdin; text messages
        // are control frames. Dropping the write half signals stdin EOF.
        tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                match msg {
                    Message::Binary(data) => {
                        if stdin_wr.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Message::Text(text) => match serde_json::from_str::<ControlFrame>(&text) {
                        Ok(ControlFrame::Resize { cols, rows }) => {
                            let _ = resize_tx.send(WindowSize { cols, rows });
                        }
                        Err(err) => {
                            debug!(error = %err, "Ignoring malformed control frame");
                        }
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        let has_pty = pty.is_some();
        Self {
            context,
            remote_addr: remote_addr.into(),
            environ,
            pty,
            streams: Some(SessionStreams {
                stdin: Box::new(stdin_rd),
                stdout: Box::new(MessageWriter::new(outbound_tx.clone())),
                stderr: Box::new(MessageWriter::new(outbound_tx.clone())),
            }),
            resize_rx: has_pty.then_some(resize_rx),
            outbound_tx,
        }
    }
}

#[async_trait]
impl Session for WsSession {
    fn context(&self) -> &SessionContext {
        &self.context
    }

    fn environ(&self) -> Vec<(String, String)> {
        self.environ.clone()
    }

    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    fn pty(&self) -> Option<&Pty> {
        self.pty.as_ref()
    }

    fn take_streams(&mut self) -> Result<SessionStreams> {
        self.streams
            .take()
            .ok_or_else(|| CmdletError::Session("session streams already taken".to_string()))
    }

    fn take_resize_events(&mut self) -> Option<mpsc::UnboundedReceiver<WindowSize>> {
        self.resize_rx.take()
    }

    async fn exit(&mut self, code: i64) -> Result<()> {
        let frame = serde_json::json!({ "type": "exit", "code": code }).to_string();
        let _ = self.outbound_tx.send(Message::Text(frame));
        let _ = self.outbound_tx.send(Message::Close(None));
        Ok(())
    }
}

/// AsyncWrite half that wraps each chunk into a binary WebSocket message.
struct MessageWriter {
    tx: mpsc::UnboundedSender<Message>,
}

impl MessageWriter {
    fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }
}

impl AsyncWrite for MessageWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.tx.send(Message::Binary(buf.to_vec())).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "websocket closed",
            )));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::protocol::Role;

    use crate::plan::ResourcePlan;

    fn context() -> SessionContext {
        SessionContext {
            subject: "alice".to_string(),
            plan: ResourcePlan::default(),
        }
    }

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    #[tokio::test]
    async fn binary_messages_become_stdin() {
        let (server, mut client) = ws_pair().await;
        let mut session = WsSession::new(server, context(), "ws-test", Vec::new(), None);
        let mut streams = session.take_streams().unwrap();

        client
            .send(Message::Binary(b"hello".to_vec()))
            .await
            .unwrap();
        drop(client);

        let mut received = Vec::new();
        streams.stdin.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn stdout_writes_become_binary_messages() {
        let (server, mut client) = ws_pair().await;
        let mut session = WsSession::new(server, context(), "ws-test", Vec::new(), None);
        let mut streams = session.take_streams().unwrap();

        streams.stdout.write_all(b"output").await.unwrap();

        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(data, b"output"),
            other => panic!("expected binary message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resize_control_frames_are_forwarded() {
        let (server, mut client) = ws_pair().await;
        let pty = Pty {
            term: "xterm".to_string(),
            window: WindowSize { cols: 80, rows: 24 },
        };
        let mut session = WsSession::new(server, context(), "ws-test", Vec::new(), Some(pty));
        let mut resize_rx = session.take_resize_events().unwrap();

        client
            .send(Message::Text(
                r#"{"type":"resize","cols":132,"rows":50}"#.to_string(),
            ))
            .await
            .unwrap();

        let event = resize_rx.recv().await.unwrap();
        assert_eq!(event, WindowSize { cols: 132, rows: 50 });
    }

    #[tokio::test]
    async fn exit_sends_control_frame_and_close() {
        let (server, mut client) = ws_pair().await;
        let mut session = WsSession::new(server, context(), "ws-test", Vec::new(), None);

        session.exit(3).await.unwrap();

        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "exit");
                assert_eq!(value["code"], 3);
            }
            other => panic!("expected text frame, got {other:?}"),
        }
        match client.next().await.unwrap().unwrap() {
            Message::Close(_) => {}
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ws_session_has_no_agent_forwarding() {
        let (server, _client) = ws_pair().await;
        let mut session = WsSession::new(server, context(), "ws-test", Vec::new(), None);
        assert!(!session.agent_forwarding());
        assert!(session.agent_channel_opener().is_none());
    }
}
