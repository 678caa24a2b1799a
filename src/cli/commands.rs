use tracing::info;

use crate::cli::args::{CheckArgs, RunArgs};
use crate::command::Command;
use crate::config::types::CmdletConfig;
use crate::engine::{resolve, Engine, ResolvedSource};
use crate::error::Result;
use crate::plan::PlanSource;
use crate::session::{SessionContext, ShellSession};

/// Run a command source with the local terminal as the session.
pub async fn run(args: RunArgs, config: CmdletConfig) -> Result<i32> {
    let source = tokio::fs::read_to_string(&args.file).await?;
    let name = args.name.unwrap_or_else(|| {
        args.file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "command".to_string())
    });
    let owner = args
        .owner
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "local".to_string());

    let command = Command::new(owner.clone(), name, source);
    let plan = config.plan_source().plan_for(&command.owner);

    let (mut session, exit_rx) = ShellSession::from_stdio(SessionContext {
        subject: owner,
        plan,
    });
    session.set_environ(args.env_vars);

    let engine = Engine::connect(config.engine_config())?;
    let code = engine.serve(&command, &mut session, &args.args).await;
    info!(code, "Command finished");

    // The session reports through its exit operation; fall back to the
    // engine's return value if the transport never saw it.
    Ok(exit_rx.await.unwrap_or(code) as i32)
}

/// Compile a source file and print what would be built.
pub async fn check(args: CheckArgs) -> Result<()> {
    let source = tokio::fs::read_to_string(&args.file).await?;
    match resolve(&source)? {
        ResolvedSource::Image(image) => {
            println!("pull: {image}");
        }
        ResolvedSource::Script(ctx) => {
            for (file, content) in &ctx.files {
                println!("--- {file}");
                print!("{}", String::from_utf8_lossy(content));
            }
        }
    }
    Ok(())
}
