//! with CLI - run declarative pipelines and namespaced commands

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use with_core::namespace::exec_with_namespace;
use with_core::protocol::{error_write_request, run_request, PipelineRequest};

#[derive(Parser)]
#[command(name = "with")]
#[command(author, version, about = "Process pipelines and per-process filesystem views")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline described by a JSON request
    Run {
        /// Request file (or - for stdin)
        file: PathBuf,
    },

    /// Write text to a command's stdin, falling back to stderr on failure
    ErrorWrite {
        /// Text to deliver
        #[arg(short, long)]
        input: String,

        /// Command and arguments, after --
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },

    /// Exec a command inside a fresh namespace view (via the setuid helper)
    Namespace {
        /// Mount label shown in /proc/self/mounts
        label: String,

        /// target=source binding; repeatable
        #[arg(short, long = "bind")]
        bind: Vec<String>,

        /// Command and arguments, after --
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("with=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file } => {
            let text = if file == Path::new("-") {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("reading request from stdin")?;
                buf
            } else {
                std::fs::read_to_string(&file)
                    .with_context(|| format!("reading {}", file.display()))?
            };

            let request: PipelineRequest =
                serde_json::from_str(&text).context("invalid pipeline request")?;
            let report = run_request(&request)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::ErrorWrite { input, cmd } => {
            error_write_request(&cmd, input.as_bytes())?;
        }

        Commands::Namespace { label, bind, cmd } => {
            // only returns on failure
            exec_with_namespace(&label, &bind, &cmd)?;
        }
    }

    Ok(())
}
