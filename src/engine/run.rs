use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder,
    ResizeContainerTTYOptionsBuilder, StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::remove_container;
use crate::error::{CmdletError, Result};
use crate::plan::ResourcePlan;
use crate::session::{Pty, SessionStreams, WindowSize};

/// Everything the runner needs for one container run, resolved upstream:
/// image tag from the image provider, merged environment from the engine,
/// plan limits from the session context.
pub struct RunSpec {
    pub image_tag: String,
    pub args: Vec<String>,
    /// Fully merged `KEY=VALUE` environment.
    pub env: Vec<String>,
    pub pty: Option<Pty>,
    pub plan: ResourcePlan,
    /// Agent-tunnel helper whose volumes carry the forwarded socket.
    pub helper_container: Option<String>,
}

/// Drives one invocation through the container lifecycle:
/// create, attach, start, pump, wait or time out, force-remove.
pub struct ContainerRunner {
    docker: Docker,
}

impl ContainerRunner {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Run the container to completion and return its exit status. The
    /// container is force-removed on every exit path, exactly once.
    pub async fn run(
        &self,
        spec: RunSpec,
        streams: &mut SessionStreams,
        resize_rx: Option<mpsc::UnboundedReceiver<WindowSize>>,
    ) -> Result<i64> {
        let name = format!("cmdlet-run-{}", Uuid::new_v4().simple());
        self.create(&name, &spec).await?;

        let result = self.drive(&name, &spec, streams, resize_rx).await;

        if let Err(err) = remove_container(&self.docker, &name).await {
            warn!(container = %name, error = %err, "Failed to remove container");
        }
        result
    }

    async fn create(&self, name: &str, spec: &RunSpec) -> Result<()> {
        let tty = spec.pty.is_some();
        let mut env = spec.env.clone();
        if let Some(pty) = &spec.pty {
            env.push(format!("TERM={}", pty.term));
        }

        let host_config = HostConfig {
            cpu_period: Some(spec.plan.cpu_period),
            cpu_quota: Some(spec.plan.cpu_quota),
            memory: Some(spec.plan.max_memory),
            auto_remove: Some(true),
            volumes_from: spec
                .helper_container
                .as_ref()
                .map(|helper| vec![helper.clone()]),
            ..HostConfig::default()
        };

        let config = ContainerCreateBody {
            image: Some(spec.image_tag.clone()),
            cmd: (!spec.args.is_empty()).then(|| spec.args.clone()),
            env: Some(env),
            tty: Some(tty),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            host_config: Some(host_config),
            ..ContainerCreateBody::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(name).build()),
                config,
            )
            .await?;
        debug!(container = %name, image = %spec.image_tag, tty, "Container created");
        Ok(())
    }

    async fn drive(
        &self,
        name: &str,
        spec: &RunSpec,
        streams: &mut SessionStreams,
        resize_rx: Option<mpsc::UnboundedReceiver<WindowSize>>,
    ) -> Result<i64> {
        // Attach before start so output produced immediately at startup is
        // never lost.
        let attached = self
            .docker
            .attach_container(
                name,
                Some(
                    AttachContainerOptionsBuilder::new()
                        .stream(true)
                        .stdin(true)
                        .stdout(true)
                        .stderr(true)
                        .build(),
                ),
            )
            .await?;
        let mut output = attached.output;
        let input = attached.input;

        // Subscribe to the exit status before the container can exit; the
        // spawned task puts the wait request in flight immediately, so a
        // fast-exiting auto-removed container cannot race it.
        let mut wait = self.docker.wait_container(name, None::<WaitContainerOptions>);
        let wait_task = tokio::spawn(async move { wait.next().await });

        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await?;
        info!(container = %name, "Container started");

        let resize_task = resize_rx.map(|rx| {
            let docker = self.docker.clone();
            let name = name.to_string();
            let initial = spec.pty.as_ref().map(|pty| pty.window);
            tokio::spawn(forward_resizes(docker, name, initial, rx))
        });

        let tty = spec.pty.is_some();
        let output_pump = pump_output(
            &mut output,
            streams.stdout.as_mut(),
            streams.stderr.as_mut(),
            tty,
        );
        tokio::pin!(output_pump);
        let input_pump = pump_input(streams.stdin.as_mut(), input);
        tokio::pin!(input_pump);
        let deadline = tokio::time::sleep(spec.plan.max_runtime());
        tokio::pin!(deadline);

        let mut input_done = false;
        let pumped: Result<()> = loop {
            tokio::select! {
                res = &mut output_pump => break res,
                res = &mut input_pump, if !input_done => {
                    input_done = true;
                    if let Err(err) = res {
                        debug!(container = %name, error = %err, "Input copy ended early");
                    }
                }
                _ = &mut deadline => break Err(CmdletError::RuntimeExceeded),
            }
        };

        if let Some(task) = resize_task {
            task.abort();
        }
        pumped?;

        match wait_task.await {
            Ok(Some(Ok(response))) => Ok(response.status_code),
            // bollard reports a non-zero exit status as this error variant.
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                Ok(code)
            }
            Ok(Some(Err(err))) => Err(err.into()),
            Ok(None) => Ok(0),
            Err(err) => Err(CmdletError::Other(anyhow::anyhow!(
                "container wait task failed: {err}"
            ))),
        }
    }
}

/// Forward the initial window size and then every live resize event, for as
/// long as the container runs.
async fn forward_resizes(
    docker: Docker,
    name: String,
    initial: Option<WindowSize>,
    mut resize_rx: mpsc::UnboundedReceiver<WindowSize>,
) {
    let mut next = initial;
    loop {
        let size = match next.take() {
            Some(size) => size,
            None => match resize_rx.recv().await {
                Some(size) => size,
                None => break,
            },
        };
        let options = ResizeContainerTTYOptionsBuilder::new()
            .h(i32::from(size.rows))
            .w(i32::from(size.cols))
            .build();
        if let Err(err) = docker.resize_container_tty(&name, options).await {
            debug!(container = %name, error = %err, "Resize failed");
        }
    }
}

/// Copy container output to the session. A TTY container produces a single
/// stream; only the non-TTY case demultiplexes stderr.
async fn pump_output<S>(
    output: &mut S,
    stdout: &mut (dyn AsyncWrite + Send + Unpin),
    stderr: &mut (dyn AsyncWrite + Send + Unpin),
    tty: bool,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Unpin,
{
    while let Some(chunk) = output.next().await {
        match chunk? {
            LogOutput::StdErr { message } if !tty => {
                stderr.write_all(&message).await?;
                stderr.flush().await?;
            }
            log => {
                stdout.write_all(&log.into_bytes()).await?;
                stdout.flush().await?;
            }
        }
    }
    Ok(())
}

/// Copy session stdin into the container and always signal end-of-input to
/// the container afterwards, even when the caller disconnected uncleanly.
async fn pump_input<W>(
    stdin: &mut (dyn AsyncRead + Send + Unpin),
    mut input: W,
) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let copied = tokio::io::copy(stdin, &mut input).await;
    let _ = input.shutdown().await;
    copied?;
    Ok(())
}
