//! SSH-agent forwarding tunnel.
//!
//! A process inside the command container must reach the caller's forwarding
//! agent without the caller's transport connection ever being exposed to the
//! container. A minimal helper container serves a unix socket and relays each
//! agent request as one multiplexed stream over its attached connection; the
//! engine splices every such stream onto a fresh channel opened on the
//! caller's session. The command container sees only the helper's socket,
//! shared via `volumes_from`.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, StartContainerOptions,
};
use bollard::Docker;
use bytes::{Buf, Bytes};
use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::mux::{MuxServer, MuxStream};
use crate::engine::remove_container;
use crate::error::Result;
use crate::session::AgentChannelOpener;

/// Environment variable pointing processes at the forwarded agent socket.
pub const AGENT_SOCK_ENV: &str = "SSH_AUTH_SOCK";

/// One invocation's agent-forwarding side channel. Created at most once per
/// invocation; torn down unconditionally when the invocation ends.
pub struct AgentTunnel {
    docker: Docker,
    container_name: String,
    socket_path: String,
    forward_task: JoinHandle<()>,
    torn_down: AtomicBool,
}

impl AgentTunnel {
    /// Start the helper container, attach to it before starting it, and run
    /// the forwarding loop over a multiplexed session on the attached
    /// connection (engine as server, helper as client).
    pub async fn open(
        docker: &Docker,
        helper_image: &str,
        invocation: &str,
        opener: Arc<dyn AgentChannelOpener>,
    ) -> Result<Self> {
        let socket_path = format!("/tmp/agent-{invocation}.sock");
        let container_name = format!("cmdlet-agent-{invocation}");

        // The helper image declares its socket directory as a volume, which
        // is what `volumes_from` later shares with the command container.
        let config = ContainerCreateBody {
            image: Some(helper_image.to_string()),
            cmd: Some(vec![socket_path.clone()]),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            host_config: Some(HostConfig {
                auto_remove: Some(true),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        docker
            .create_container(
                Some(
                    CreateContainerOptionsBuilder::new()
                        .name(&container_name)
                        .build(),
                ),
                config,
            )
            .await?;

        let attached = match docker
            .attach_container(
                &container_name,
                Some(
                    AttachContainerOptionsBuilder::new()
                        .stream(true)
                        .stdin(true)
                        .stdout(true)
                        .stderr(true)
                        .build(),
                ),
            )
            .await
        {
            Ok(attached) => attached,
            Err(err) => {
                let _ = remove_container(docker, &container_name).await;
                return Err(err.into());
            }
        };

        if let Err(err) = docker
            .start_container(&container_name, None::<StartContainerOptions>)
            .await
        {
            let _ = remove_container(docker, &container_name).await;
            return Err(err.into());
        }

        info!(
            helper = %container_name,
            socket = %socket_path,
            "Agent tunnel established"
        );

        let transport = AttachTransport::new(attached.output, attached.input);
        let accepted = MuxServer::serve(transport);
        let forward_task = tokio::spawn(forward_loop(accepted, opener));

        Ok(Self {
            docker: docker.clone(),
            container_name,
            socket_path,
            forward_task,
            torn_down: AtomicBool::new(false),
        })
    }

    /// Socket path the command container should point `SSH_AUTH_SOCK` at.
    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Helper container whose volumes carry the socket.
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Stop forwarding and force-remove the helper. Removing the helper ends
    /// its attached connection, which closes the multiplexed session. Safe to
    /// call more than once; failures are logged, never escalated.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.forward_task.abort();
        if let Err(err) = remove_container(&self.docker, &self.container_name).await {
            warn!(
                helper = %self.container_name,
                error = %err,
                "Failed to remove agent tunnel helper"
            );
        }
    }

    #[cfg(test)]
    fn stub(docker: Docker) -> Self {
        Self {
            docker,
            container_name: "cmdlet-agent-test".to_string(),
            socket_path: "/tmp/agent-test.sock".to_string(),
            forward_task: tokio::spawn(async {}),
            torn_down: AtomicBool::new(false),
        }
    }
}

/// Accept multiplexed streams for as long as the session lives, splicing
/// each onto its own freshly opened agent channel.
async fn forward_loop(mut accepted: mpsc::Receiver<MuxStream>, opener: Arc<dyn AgentChannelOpener>) {
    while let Some(stream) = accepted.recv().await {
        let opener = opener.clone();
        tokio::spawn(forward_stream(stream, opener));
    }
}

/// Splice one multiplexed stream with one agent channel until either side
/// closes. A failed channel open aborts only this stream, never the tunnel.
async fn forward_stream(mut stream: MuxStream, opener: Arc<dyn AgentChannelOpener>) {
    let mut channel = match opener.open().await {
        Ok(channel) => channel,
        Err(err) => {
            warn!(stream = stream.id(), error = %err, "Failed to open agent channel");
            let _ = stream.close().await;
            return;
        }
    };

    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            inbound = stream.recv() => match inbound {
                Some(data) => {
                    if channel.write_all(&data).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            outbound = channel.read(&mut buf) => match outbound {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.send(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
        }
    }

    debug!(stream = stream.id(), "Agent stream finished");
    let _ = stream.close().await;
    let _ = channel.shutdown().await;
}

/// Byte-stream view of an attached container connection: reads flatten the
/// demultiplexed log records, writes go to the container's stdin half.
struct AttachTransport {
    output: Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>>,
    input: Pin<Box<dyn AsyncWrite + Send>>,
    leftover: Bytes,
}

impl AttachTransport {
    fn new(
        output: Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>>,
        input: Pin<Box<dyn AsyncWrite + Send>>,
    ) -> Self {
        Self {
            output,
            input,
            leftover: Bytes::new(),
        }
    }
}

impl AsyncRead for AttachTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.leftover.is_empty() {
                let n = self.leftover.len().min(buf.remaining());
                buf.put_slice(&self.leftover[..n]);
                self.leftover.advance(n);
                return Poll::Ready(Ok(()));
            }
            match self.output.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(log))) => {
                    self.leftover = log.into_bytes();
                }
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, err)));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for AttachTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.input.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.input.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.input.as_mut().poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    use crate::error::CmdletError;
    use crate::session::AgentChannel;

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let docker = Docker::connect_with_local_defaults().unwrap();
        let tunnel = AgentTunnel::stub(docker);
        tunnel.teardown().await;
        tunnel.teardown().await;
    }

    struct DuplexOpener {
        side: tokio::sync::Mutex<Option<DuplexStream>>,
    }

    #[async_trait]
    impl AgentChannelOpener for DuplexOpener {
        async fn open(&self) -> Result<Box<dyn AgentChannel>> {
            let side = self.side.lock().await.take();
            match side {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(CmdletError::AgentUnsupported),
            }
        }
    }

    #[tokio::test]
    async fn forward_stream_splices_both_directions() {
        let (engine_side, mut agent_side) = tokio::io::duplex(4096);
        let opener = Arc::new(DuplexOpener {
            side: tokio::sync::Mutex::new(Some(engine_side)),
        });

        let (server_io, client_io) = tokio::io::duplex(4096);
        let mut accepted = MuxServer::serve(server_io);
        let (mut client_rd, mut client_wr) = tokio::io::split(client_io);

        // Helper opens stream 5 and sends an agent request.
        crate::engine::mux::test_support::write_open(&mut client_wr, 5).await;
        crate::engine::mux::test_support::write_data(&mut client_wr, 5, b"sign me").await;

        let stream = accepted.recv().await.unwrap();
        let task = tokio::spawn(forward_stream(stream, opener));

        let mut request = [0u8; 7];
        agent_side.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"sign me");

        agent_side.write_all(b"signature").await.unwrap();
        let (id, payload) = crate::engine::mux::test_support::read_data(&mut client_rd).await;
        assert_eq!(id, 5);
        assert_eq!(payload, b"signature");

        drop(agent_side);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failed_channel_open_aborts_only_that_stream() {
        let opener = Arc::new(DuplexOpener {
            side: tokio::sync::Mutex::new(None),
        });

        let (server_io, client_io) = tokio::io::duplex(4096);
        let mut accepted = MuxServer::serve(server_io);
        let (mut client_rd, mut client_wr) = tokio::io::split(client_io);

        crate::engine::mux::test_support::write_open(&mut client_wr, 1).await;
        let stream = accepted.recv().await.unwrap();
        forward_stream(stream, opener).await;

        // The stream is closed, but the session stays usable.
        let (id, kind) = crate::engine::mux::test_support::read_control(&mut client_rd).await;
        assert_eq!((id, kind), (1, crate::engine::mux::test_support::KIND_CLOSE));

        crate::engine::mux::test_support::write_open(&mut client_wr, 2).await;
        assert!(accepted.recv().await.is_some());
    }
}
