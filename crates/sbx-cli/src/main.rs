#![warn(missing_docs)]

//! sbx: run a JavaScript file in a disposable sandbox and print the reply.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sbx::{Sandbox, SandboxError, VmOptions};
use sbx_config::SbxConfig;
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sbx")]
#[command(version, about = "Run untrusted JavaScript in a single-use V8 sandbox")]
struct Cli {
    /// Script to run (or - for stdin)
    file: String,

    /// Config file (defaults to $SBX_CONFIG, then ./sbx.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Timeout in milliseconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Caller variables as a JSON object
    #[arg(long, conflicts_with = "context_file")]
    context: Option<String>,

    /// Read caller variables from a JSON file
    #[arg(long)]
    context_file: Option<PathBuf>,

    /// Enable the `require` escape hatch
    #[arg(long)]
    unlocked: bool,

    /// Rewrite top-level `import` declarations into `require` calls
    #[arg(long)]
    parse_imports: bool,

    /// Pretty-print the reply
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = SbxConfig::discover(cli.config.as_deref()).context("failed to load config")?;
    let sandbox = Sandbox::new(config.to_sandbox_config());

    let source = read_source(&cli.file)?;
    let options = VmOptions {
        context: load_context(cli.context.as_deref(), cli.context_file.as_deref())?,
        timeout: cli.timeout.map(Duration::from_millis),
        lockdown: !cli.unlocked,
        parse_imports: cli.parse_imports,
        transform: None,
    };

    let (output, code) = match sandbox.vm(&source, options).await {
        Ok(reply) => (reply.to_value(), ExitCode::SUCCESS),
        Err(err) => {
            tracing::debug!(kind = err.kind().code(), "execution rejected");
            (error_value(&err), ExitCode::FAILURE)
        }
    };

    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{rendered}");
    Ok(code)
}

fn read_source(file: &str) -> Result<String> {
    if file == "-" {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("failed to read script from stdin")?;
        return Ok(source);
    }
    std::fs::read_to_string(file).with_context(|| format!("failed to read script {file}"))
}

fn load_context(inline: Option<&str>, file: Option<&Path>) -> Result<Map<String, Value>> {
    let text = match (inline, file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read context file {}", path.display()))?,
        (None, None) => return Ok(Map::new()),
    };
    match serde_json::from_str::<Value>(&text).context("context is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("context must be a JSON object, got: {other}"),
    }
}

/// The rejection as JSON: kind, message and, when present, the reply.
fn error_value(err: &SandboxError) -> Value {
    json!({
        "error": {
            "kind": err.kind().code(),
            "message": err.to_string(),
        },
        "context": err.context().map(|reply| reply.to_value()),
    })
}
