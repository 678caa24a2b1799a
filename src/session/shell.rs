use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::error::{CmdletError, Result};
use crate::session::{
    AgentChannelOpener, Pty, Session, SessionContext, SessionStreams, WindowSize,
};

/// Session over the shell protocol: a plain byte-stream pair plus an error
/// stream, as produced by an SSH channel or a local terminal.
///
/// The transport constructs it, feeds resize events through the sender
/// returned by [`ShellSession::set_pty`], and receives the exit code on the
/// receiver returned by [`ShellSession::new`].
pub struct ShellSession {
    context: SessionContext,
    remote_addr: String,
    environ: Vec<(String, String)>,
    pty: Option<Pty>,
    streams: Option<SessionStreams>,
    resize_rx: Option<mpsc::UnboundedReceiver<WindowSize>>,
    agent_opener: Option<Arc<dyn AgentChannelOpener>>,
    exit_tx: Option<oneshot::Sender<i64>>,
}

impl ShellSession {
    pub fn new(
        context: SessionContext,
        remote_addr: impl Into<String>,
        stdin: Box<dyn AsyncRead + Send + Unpin>,
        stdout: Box<dyn AsyncWrite + Send + Unpin>,
        stderr: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> (Self, oneshot::Receiver<i64>) {
        let (exit_tx, exit_rx) = oneshot::channel();
        let session = Self {
            context,
            remote_addr: remote_addr.into(),
            environ: Vec::new(),
            pty: None,
            streams: Some(SessionStreams {
                stdin,
                stdout,
                stderr,
            }),
            resize_rx: None,
            agent_opener: None,
            exit_tx: Some(exit_tx),
        };
        (session, exit_rx)
    }

    /// Session bound to the local terminal. Used by the CLI front end.
    pub fn from_stdio(context: SessionContext) -> (Self, oneshot::Receiver<i64>) {
        Self::new(
            context,
            "local",
            Box::new(tokio::io::stdin()),
            Box::new(tokio::io::stdout()),
            Box::new(tokio::io::stderr()),
        )
    }

    pub fn set_environ(&mut self, environ: Vec<(String, String)>) {
        self.environ = environ;
    }

    /// Declare a pseudo-terminal. Returns the sender the transport uses to
    /// feed live resize events.
    pub fn set_pty(&mut self, pty: Pty) -> mpsc::UnboundedSender<WindowSize> {
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        self.pty = Some(pty);
        self.resize_rx = Some(resize_rx);
        resize_tx
    }

    /// Enable agent forwarding by supplying a channel opener.
    pub fn set_agent_opener(&mut self, opener: Arc<dyn AgentChannelOpener>) {
        self.agent_opener = Some(opener);
    }
}

#[async_trait]
impl Session for ShellSession {
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

    fn agent_forwarding(&self) -> bool {
        self.agent_opener.is_some()
    }

    fn agent_channel_opener(&mut self) -> Option<Arc<dyn AgentChannelOpener>> {
        self.agent_opener.take()
    }

    async fn exit(&mut self, code: i64) -> Result<()> {
        if let Some(exit_tx) = self.exit_tx.take() {
            let _ = exit_tx.send(code);
        }
        Ok(())
    }
}
