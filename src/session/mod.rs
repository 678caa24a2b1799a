//! Transport-neutral session handles.
//!
//! A [`Session`] is the engine's only view of the caller: byte streams, an
//! optional pseudo-terminal with live resize events, environment, and an exit
//! operation. The engine never branches on transport type; the shell protocol
//! and HTTP/WebSocket front ends each provide one implementation.

mod shell;
mod ws;

pub use shell::ShellSession;
pub use ws::WsSession;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::plan::ResourcePlan;

/// Pseudo-terminal dimensions, in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

/// Pseudo-terminal request carried by a session.
#[derive(Debug, Clone)]
pub struct Pty {
    /// TERM value requested by the caller.
    pub term: String,
    /// Initial window size; later changes arrive as resize events.
    pub window: WindowSize,
}

/// Per-invocation identity and limits, resolved by the transport before the
/// engine is called.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Authenticated caller identity.
    pub subject: String,
    /// Resource plan of the command's owner.
    pub plan: ResourcePlan,
}

/// The session's byte streams, taken exactly once per invocation.
pub struct SessionStreams {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

/// A bidirectional byte channel spliced to one agent request.
pub trait AgentChannel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AgentChannel for T {}

/// Opens forwarding channels back to the caller's agent. Taken once by the
/// agent tunnel and then called concurrently, once per proxied stream.
#[async_trait]
pub trait AgentChannelOpener: Send + Sync {
    async fn open(&self) -> Result<Box<dyn AgentChannel>>;
}

/// One interactive invocation, borrowed by the engine for its duration.
#[async_trait]
pub trait Session: Send {
    fn context(&self) -> &SessionContext;

    /// Caller-supplied environment, forwarded last so it overrides
    /// command-level variables.
    fn environ(&self) -> Vec<(String, String)>;

    /// Opaque remote-address token, for logging only.
    fn remote_addr(&self) -> &str;

    fn pty(&self) -> Option<&Pty>;

    /// Take the stdin/stdout/stderr streams. Fails on the second call.
    fn take_streams(&mut self) -> Result<SessionStreams>;

    /// Take the live resize-event sequence. `None` when no PTY was requested
    /// or the events were already taken.
    fn take_resize_events(&mut self) -> Option<mpsc::UnboundedReceiver<WindowSize>>;

    /// Whether the invoking protocol requested agent forwarding.
    fn agent_forwarding(&self) -> bool {
        false
    }

    /// Take the agent-channel opener, if the transport supports forwarding.
    fn agent_channel_opener(&mut self) -> Option<Arc<dyn AgentChannelOpener>> {
        None
    }

    /// Report the invocation's exit code to the caller.
    async fn exit(&mut self, code: i64) -> Result<()>;
}
