//! The command execution engine.
//!
//! One entry point, [`Engine::run`], takes a [`Command`] and a [`Session`]
//! and produces an exit code: the source is resolved into an image (built
//! from a `#!cmd` script or pulled), an agent tunnel is opened when the
//! session asks for forwarding, and the container runs with its I/O bridged
//! to the session under the owner's resource plan. Invocations are fully
//! independent; the only shared object is the engine's Docker handle, which
//! is safe for concurrent use.

mod build;
mod image;
mod mux;
mod proxy;
mod run;

pub use build::{resolve, BuildContext, ResolvedSource, ENTRYPOINT_PATH, SCRIPT_MARKER};
pub use image::ImageProvider;
pub use proxy::{AgentTunnel, AGENT_SOCK_ENV};
pub use run::{ContainerRunner, RunSpec};

use std::sync::Arc;

use bollard::query_parameters::RemoveContainerOptionsBuilder;
use bollard::{Docker, API_DEFAULT_VERSION};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::command::{Command, PlainCipher, SecretCipher};
use crate::error::Result;
use crate::session::Session;

const DEFAULT_DOCKER_TIMEOUT_SECS: u64 = 120;

/// Engine settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Server identity injected as `CMDLET_SERVER`.
    pub server_name: String,
    /// Release channel/version injected as `CMDLET_RELEASE`.
    pub release: String,
    /// Image of the agent-forwarding helper container.
    pub agent_image: String,
    /// Docker endpoint override (`unix:///...` path); local defaults if unset.
    pub docker_host: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_name: "cmdlet".to_string(),
            release: env!("CARGO_PKG_VERSION").to_string(),
            agent_image: "cmdlet/agent-proxy:latest".to_string(),
            docker_host: None,
        }
    }
}

pub struct Engine {
    docker: Docker,
    config: EngineConfig,
    cipher: Arc<dyn SecretCipher>,
}

impl Engine {
    /// Engine over an already-connected Docker handle, with cleartext
    /// environment values.
    pub fn new(docker: Docker, config: EngineConfig) -> Self {
        Self::with_cipher(docker, config, Arc::new(PlainCipher))
    }

    pub fn with_cipher(docker: Docker, config: EngineConfig, cipher: Arc<dyn SecretCipher>) -> Self {
        Self {
            docker,
            config,
            cipher,
        }
    }

    /// Connect to the container engine described by `config`.
    pub fn connect(config: EngineConfig) -> Result<Self> {
        let docker = match &config.docker_host {
            Some(path) => {
                Docker::connect_with_socket(path, DEFAULT_DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self::new(docker, config))
    }

    /// Run `cmd` for the session and return the container's exit status.
    ///
    /// Every error is terminal for the invocation; cleanup (container
    /// removal, tunnel teardown) happens on every exit path.
    pub async fn run(
        &self,
        cmd: &Command,
        session: &mut dyn Session,
        args: &[String],
    ) -> Result<i64> {
        let mut streams = session.take_streams()?;
        self.run_with_streams(cmd, session, &mut streams, args).await
    }

    /// Like [`Engine::run`], but translates an error into a caller-visible
    /// message on the session's error stream plus a non-zero exit code, and
    /// always reports the exit code to the session.
    pub async fn serve(&self, cmd: &Command, session: &mut dyn Session, args: &[String]) -> i64 {
        let mut streams = match session.take_streams() {
            Ok(streams) => streams,
            Err(err) => {
                warn!(error = %err, "Session unusable");
                return 1;
            }
        };
        let code = match self
            .run_with_streams(cmd, session, &mut streams, args)
            .await
        {
            Ok(code) => code,
            Err(err) => {
                warn!(
                    owner = %cmd.owner,
                    name = %cmd.name,
                    error = %err,
                    "Invocation failed"
                );
                let message = format!("cmdlet: {err}\n");
                let _ = streams.stderr.write_all(message.as_bytes()).await;
                let _ = streams.stderr.flush().await;
                1
            }
        };
        let _ = session.exit(code).await;
        code
    }

    async fn run_with_streams(
        &self,
        cmd: &Command,
        session: &mut dyn Session,
        streams: &mut crate::session::SessionStreams,
        args: &[String],
    ) -> Result<i64> {
        let plan = session.context().plan.clone();

        info!(
            owner = %cmd.owner,
            name = %cmd.name,
            subject = %session.context().subject,
            remote = %session.remote_addr(),
            "Invocation started"
        );

        let images = ImageProvider::new(self.docker.clone());
        let image_tag = match resolve(&cmd.source)? {
            ResolvedSource::Script(ctx) => images.build(cmd, &ctx).await?,
            ResolvedSource::Image(_) => images.pull(cmd, &plan).await?,
        };

        // Fixed system variables first, command environment second, session
        // environment last so the caller can override.
        let mut system_env = vec![
            ("CMDLET_SERVER".to_string(), self.config.server_name.clone()),
            ("CMDLET_RELEASE".to_string(), self.config.release.clone()),
        ];
        let command_env = cmd.run_environ(self.cipher.as_ref()).await?;
        let session_env = session.environ();

        let tunnel = if session.agent_forwarding() {
            match session.agent_channel_opener() {
                Some(opener) => {
                    let invocation = Uuid::new_v4().simple().to_string();
                    Some(
                        AgentTunnel::open(
                            &self.docker,
                            &self.config.agent_image,
                            &invocation,
                            opener,
                        )
                        .await?,
                    )
                }
                None => None,
            }
        } else {
            None
        };
        if let Some(tunnel) = &tunnel {
            system_env.push((AGENT_SOCK_ENV.to_string(), tunnel.socket_path().to_string()));
        }

        let spec = RunSpec {
            image_tag,
            args: args.to_vec(),
            env: merge_environ(&system_env, &command_env, &session_env),
            pty: session.pty().cloned(),
            plan,
            helper_container: tunnel.as_ref().map(|t| t.container_name().to_string()),
        };
        let resize_rx = session.take_resize_events();

        let runner = ContainerRunner::new(self.docker.clone());
        let result = runner.run(spec, streams, resize_rx).await;

        if let Some(tunnel) = &tunnel {
            tunnel.teardown().await;
        }

        match &result {
            Ok(code) => info!(owner = %cmd.owner, name = %cmd.name, code, "Invocation finished"),
            Err(err) => info!(owner = %cmd.owner, name = %cmd.name, error = %err, "Invocation ended"),
        }
        result
    }
}

/// Merge environment layers into `KEY=VALUE` pairs; later layers override
/// earlier ones key by key.
pub(crate) fn merge_environ(
    system: &[(String, String)],
    command: &[(String, String)],
    session: &[(String, String)],
) -> Vec<String> {
    let mut merged: Vec<(String, String)> = Vec::new();
    for (key, value) in system.iter().chain(command).chain(session) {
        match merged.iter_mut().find(|(existing, _)| existing == key) {
            Some(slot) => slot.1 = value.clone(),
            None => merged.push((key.clone(), value.clone())),
        }
    }
    merged
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

/// Force-remove a container, treating "already gone" as success.
pub(crate) async fn remove_container(docker: &Docker, name: &str) -> Result<()> {
    match docker
        .remove_container(
            name,
            Some(
                RemoveContainerOptionsBuilder::new()
                    .force(true)
                    .v(true)
                    .build(),
            ),
        )
        .await
    {
        Ok(()) => Ok(()),
        Err(err) if is_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn session_env_overrides_command_and_system() {
        let env = merge_environ(
            &pairs(&[("CMDLET_SERVER", "cmd.example"), ("PATH", "/system")]),
            &pairs(&[("PATH", "/command"), ("GREETING", "hi")]),
            &pairs(&[("GREETING", "hello"), ("EXTRA", "1")]),
        );
        assert_eq!(
            env,
            vec![
                "CMDLET_SERVER=cmd.example",
                "PATH=/command",
                "GREETING=hello",
                "EXTRA=1",
            ]
        );
    }

    #[test]
    fn merge_keeps_first_seen_ordering() {
        let env = merge_environ(
            &pairs(&[("A", "1")]),
            &pairs(&[("B", "2")]),
            &pairs(&[("A", "3")]),
        );
        assert_eq!(env, vec!["A=3", "B=2"]);
    }

    mod integration {
        //! End-to-end runs against a local Docker daemon. Ignored by default;
        //! run with `cargo test -- --ignored` on a host with Docker.

        use super::super::*;
        use crate::command::Command;
        use crate::error::CmdletError;
        use crate::plan::ResourcePlan;
        use crate::session::{SessionContext, ShellSession};

        fn engine() -> Engine {
            Engine::connect(EngineConfig::default()).expect("docker handle")
        }

        fn session(plan: ResourcePlan) -> (ShellSession, tokio::sync::oneshot::Receiver<i64>) {
            ShellSession::new(
                SessionContext {
                    subject: "tester".to_string(),
                    plan,
                },
                "test",
                Box::new(tokio::io::empty()),
                Box::new(tokio::io::sink()),
                Box::new(tokio::io::sink()),
            )
        }

        #[tokio::test]
        #[ignore = "requires a local Docker daemon"]
        async fn script_command_runs_to_completion() {
            let engine = engine();
            let cmd = Command::new("tester", "true", "#!cmd alpine\n#!/bin/true\n");
            let (mut session, _exit) = session(ResourcePlan::default());
            let code = engine.run(&cmd, &mut session, &[]).await.unwrap();
            assert_eq!(code, 0);
        }

        #[tokio::test]
        #[ignore = "requires a local Docker daemon"]
        async fn never_exiting_container_times_out() {
            let engine = engine();
            let cmd = Command::new("tester", "sleeper", "#!cmd alpine\n#!/bin/sleep 600\n");
            let mut plan = ResourcePlan::default();
            plan.max_runtime_secs = 2;
            let (mut session, _exit) = session(plan);
            let err = engine.run(&cmd, &mut session, &[]).await.unwrap_err();
            assert!(matches!(err, CmdletError::RuntimeExceeded));
        }

        #[tokio::test]
        #[ignore = "requires a local Docker daemon"]
        async fn concurrent_invocations_do_not_block_each_other() {
            let engine = std::sync::Arc::new(engine());
            let mut handles = Vec::new();
            for (name, body) in [("one", "#!/bin/echo one\n"), ("two", "#!/bin/echo two\n")] {
                let engine = engine.clone();
                let cmd = Command::new("tester", name, format!("#!cmd alpine\n{body}"));
                handles.push(tokio::spawn(async move {
                    let (mut session, _exit) = session(ResourcePlan::default());
                    engine.run(&cmd, &mut session, &[]).await
                }));
            }
            for handle in handles {
                assert_eq!(handle.await.unwrap().unwrap(), 0);
            }
        }
    }
}
