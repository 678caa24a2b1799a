use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "cmdlet")]
#[clap(version, about = "Run user-owned commands as resource-bounded containers")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "CMDLET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command source against the local terminal
    Run(RunArgs),

    /// Compile a script source and print the synthesized build manifest
    Check(CheckArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Command source file: an image reference or a `#!cmd` script
    pub file: PathBuf,

    /// Command name (defaults to the file stem)
    #[clap(long, short = 'n')]
    pub name: Option<String>,

    /// Owner identity (defaults to $USER)
    #[clap(long, env = "CMDLET_OWNER")]
    pub owner: Option<String>,

    /// Environment variables to pass to the command (KEY=VALUE)
    #[clap(long = "env", short = 'e', value_parser = parse_env_var)]
    pub env_vars: Vec<(String, String)>,

    /// Arguments passed through to the command
    #[clap(trailing_var_arg = true)]
    pub args: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Command source file to compile
    pub file: PathBuf,
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| "Environment variable format: KEY=VALUE".to_string())
}
